use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use pagemark_core::persistence::is_remote_url;
use pagemark_core::{
    fingerprint_for_bytes, DocumentFetcher, DocumentInfo, DocumentLoaded, Fingerprint,
    OverlaySurface, RenderedShape, Viewer,
};
use pagemark_remote::HttpDocumentFetcher;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

struct OpenDocument {
    url: String,
    bytes: Vec<u8>,
}

/// A viewer without a display: it loads document bytes and reports load events.
pub struct HeadlessViewer {
    fetcher: HttpDocumentFetcher,
    events: mpsc::UnboundedSender<DocumentLoaded>,
    current: Mutex<Option<OpenDocument>>,
    origins: Mutex<HashMap<Fingerprint, String>>,
}

impl HeadlessViewer {
    pub fn new(
        fetcher: HttpDocumentFetcher,
        events: mpsc::UnboundedSender<DocumentLoaded>,
    ) -> Self {
        Self {
            fetcher,
            events,
            current: Mutex::new(None),
            origins: Mutex::new(HashMap::new()),
        }
    }

    /// Reports documents reopened from cached bytes under their original URL.
    pub fn remember_origin(&self, info: &DocumentInfo) {
        self.origins
            .lock()
            .insert(info.fingerprint.clone(), info.url.clone());
    }

    /// Opens a filesystem path or a URL.
    pub async fn open_source(&self, source: &str) -> Result<()> {
        let url = resolve_source(source)?;
        self.open_url(&url).await
    }

    fn finish_open(&self, url: String, bytes: Vec<u8>, title: Option<String>) -> Result<()> {
        let fingerprint = fingerprint_for_bytes(&bytes);
        debug!(%url, %fingerprint, size = bytes.len(), "document opened");
        *self.current.lock() = Some(OpenDocument {
            url: url.clone(),
            bytes,
        });
        self.events
            .send(DocumentLoaded {
                url,
                fingerprint,
                title,
            })
            .map_err(|_| anyhow!("document event receiver dropped"))
    }
}

pub fn resolve_source(source: &str) -> Result<String> {
    if let Ok(url) = Url::parse(source) {
        if matches!(url.scheme(), "http" | "https" | "file") {
            return Ok(url.to_string());
        }
    }
    let path = Path::new(source)
        .canonicalize()
        .with_context(|| format!("failed to resolve path for {:?}", source))?;
    Url::from_file_path(&path)
        .map(|url| url.to_string())
        .map_err(|_| anyhow!("cannot express {:?} as a file URL", path))
}

fn title_of(url: &Url) -> Option<String> {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
}

#[async_trait]
impl Viewer for HeadlessViewer {
    async fn open_url(&self, url: &str) -> Result<()> {
        let parsed = Url::parse(url).with_context(|| format!("invalid document url {url}"))?;
        let bytes = if is_remote_url(url) {
            self.fetcher.fetch_document(url).await?
        } else if parsed.scheme() == "file" {
            let path = parsed
                .to_file_path()
                .map_err(|_| anyhow!("invalid file url {url}"))?;
            fs::read(&path).with_context(|| format!("failed to read {:?}", path))?
        } else {
            bail!("unsupported document url {url}");
        };
        self.finish_open(url.to_string(), bytes, title_of(&parsed))
    }

    async fn open_bytes(&self, bytes: Vec<u8>, title: Option<String>) -> Result<()> {
        let fingerprint = fingerprint_for_bytes(&bytes);
        let url = self
            .origins
            .lock()
            .get(&fingerprint)
            .cloned()
            .unwrap_or_else(|| format!("blob:pagemark/{fingerprint}"));
        self.finish_open(url, bytes, title)
    }

    async fn close(&self) -> Result<()> {
        if let Some(doc) = self.current.lock().take() {
            debug!(url = %doc.url, "document closed");
        }
        Ok(())
    }

    async fn document_bytes(&self) -> Option<Vec<u8>> {
        self.current.lock().as_ref().map(|doc| doc.bytes.clone())
    }
}

/// Overlay that reports paint calls to the log.
pub struct TextSurface {
    page: u32,
    drawn: usize,
}

impl TextSurface {
    pub fn new(page: u32) -> Self {
        Self { page, drawn: 0 }
    }
}

impl OverlaySurface for TextSurface {
    fn clear(&mut self) {
        self.drawn = 0;
    }

    fn draw(&mut self, shape: &RenderedShape) -> Result<()> {
        self.drawn += 1;
        debug!(
            page = self.page,
            id = ?shape.id,
            subtype = ?shape.subtype,
            geometry = ?shape.geometry,
            total = self.drawn,
            "annotation painted"
        );
        Ok(())
    }

    fn draw_preview(&mut self, shape: Option<&RenderedShape>) {
        if let Some(shape) = shape {
            debug!(page = self.page, geometry = ?shape.geometry, "preview");
        }
    }
}
