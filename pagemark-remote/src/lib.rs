use std::io::{self, Read};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use pagemark_core::{AnnotationRecord, DocumentFetcher, RemoteSync, SyncConfig};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use ureq::{Agent, AgentBuilder, Error as UreqError};
use url::Url;

const MAX_DOCUMENT_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("invalid endpoint {endpoint:?}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
    #[error("{method} {url} failed with HTTP status {status}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
    },
    #[error("{method} {url} failed: {message}")]
    Transport {
        method: &'static str,
        url: String,
        message: String,
    },
    #[error("failed to read response body from {url}")]
    Body {
        url: String,
        #[source]
        source: io::Error,
    },
    #[error("document at {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: u64 },
    #[error("invalid annotation payload from {url}")]
    Payload {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

fn build_agent(timeout: Duration) -> Agent {
    AgentBuilder::new()
        .timeout(timeout)
        .user_agent(concat!("pagemark/", env!("CARGO_PKG_VERSION")))
        .build()
}

fn request_error(method: &'static str, url: &str, err: UreqError) -> RemoteError {
    match err {
        UreqError::Status(status, _) => RemoteError::Status {
            method,
            url: url.to_string(),
            status,
        },
        other => RemoteError::Transport {
            method,
            url: url.to_string(),
            message: other.to_string(),
        },
    }
}

/// Annotation sync over `GET`/`POST <endpoint>?docId=..&username=..`.
#[derive(Clone)]
pub struct HttpRemote {
    agent: Agent,
    endpoint: Url,
}

impl HttpRemote {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let endpoint = Url::parse(endpoint).map_err(|source| RemoteError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            source,
        })?;
        Ok(Self {
            agent: build_agent(timeout),
            endpoint,
        })
    }

    /// `None` when no endpoint is configured.
    pub fn from_config(config: &SyncConfig) -> Result<Option<Self>, RemoteError> {
        config
            .endpoint
            .as_deref()
            .map(|endpoint| Self::new(endpoint, config.http_timeout()))
            .transpose()
    }

    fn request_url(&self, fingerprint: &str, username: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("docId", fingerprint)
            .append_pair("username", username);
        url
    }
}

fn parse_payload(url: &str, body: &str) -> Result<Vec<AnnotationRecord>, RemoteError> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let records: Option<Vec<AnnotationRecord>> =
        serde_json::from_str(body).map_err(|source| RemoteError::Payload {
            url: url.to_string(),
            source,
        })?;
    Ok(records.unwrap_or_default())
}

fn fetch_blocking(agent: &Agent, url: &Url) -> Result<Vec<AnnotationRecord>, RemoteError> {
    let response = match agent
        .get(url.as_str())
        .set("Accept", "application/json")
        .call()
    {
        Ok(response) => response,
        Err(UreqError::Status(404, _)) => {
            debug!(%url, "no annotations stored for document");
            return Ok(Vec::new());
        }
        Err(err) => return Err(request_error("GET", url.as_str(), err)),
    };
    let body = response.into_string().map_err(|source| RemoteError::Body {
        url: url.to_string(),
        source,
    })?;
    parse_payload(url.as_str(), &body)
}

fn push_blocking(
    agent: &Agent,
    url: &Url,
    records: &[AnnotationRecord],
) -> Result<(), RemoteError> {
    let response = agent
        .post(url.as_str())
        .set("Accept", "application/json")
        .send_json(records)
        .map_err(|err| request_error("POST", url.as_str(), err))?;
    let body = response.into_string().map_err(|source| RemoteError::Body {
        url: url.to_string(),
        source,
    })?;
    if !body.trim().is_empty() && serde_json::from_str::<serde_json::Value>(&body).is_err() {
        warn!(%url, "save acknowledged with a non-JSON body");
    }
    Ok(())
}

#[async_trait]
impl RemoteSync for HttpRemote {
    #[instrument(skip(self))]
    async fn fetch(&self, fingerprint: &str, username: &str) -> Result<Vec<AnnotationRecord>> {
        let agent = self.agent.clone();
        let url = self.request_url(fingerprint, username);
        let records = tokio::task::spawn_blocking(move || fetch_blocking(&agent, &url))
            .await
            .context("annotation fetch task failed")??;
        Ok(records)
    }

    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn push(
        &self,
        fingerprint: &str,
        username: &str,
        records: &[AnnotationRecord],
    ) -> Result<()> {
        let agent = self.agent.clone();
        let url = self.request_url(fingerprint, username);
        let records = records.to_vec();
        tokio::task::spawn_blocking(move || push_blocking(&agent, &url, &records))
            .await
            .context("annotation push task failed")??;
        Ok(())
    }
}

/// Downloads document bytes for the local cache.
#[derive(Clone)]
pub struct HttpDocumentFetcher {
    agent: Agent,
}

impl HttpDocumentFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            agent: build_agent(timeout),
        }
    }
}

fn read_limited(url: &str, reader: impl Read, limit: u64) -> Result<Vec<u8>, RemoteError> {
    let mut bytes = Vec::new();
    reader
        .take(limit + 1)
        .read_to_end(&mut bytes)
        .map_err(|source| RemoteError::Body {
            url: url.to_string(),
            source,
        })?;
    if bytes.len() as u64 > limit {
        return Err(RemoteError::TooLarge {
            url: url.to_string(),
            limit,
        });
    }
    Ok(bytes)
}

fn download_blocking(agent: &Agent, url: &str) -> Result<Vec<u8>, RemoteError> {
    let response = agent
        .get(url)
        .call()
        .map_err(|err| request_error("GET", url, err))?;
    read_limited(url, response.into_reader(), MAX_DOCUMENT_BYTES)
}

#[async_trait]
impl DocumentFetcher for HttpDocumentFetcher {
    async fn fetch_document(&self, url: &str) -> Result<Vec<u8>> {
        let agent = self.agent.clone();
        let target = url.to_string();
        let bytes = tokio::task::spawn_blocking(move || download_blocking(&agent, &target))
            .await
            .context("document download task failed")??;
        debug!(url, size = bytes.len(), "document downloaded");
        Ok(bytes)
    }
}
