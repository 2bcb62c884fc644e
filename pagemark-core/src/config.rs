use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use thiserror::Error;
use url::Url;

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid sync endpoint {endpoint:?}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
    #[error("sync endpoint {0:?} must use http or https")]
    UnsupportedScheme(String),
    #[error("autosave delay must be positive")]
    ZeroAutosaveDelay,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Remote annotation endpoint; sync is disabled when unset.
    pub endpoint: Option<String>,
    pub username: String,
    pub autosave_delay_ms: u64,
    pub http_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            username: "anonymous".to_string(),
            autosave_delay_ms: 2000,
            http_timeout_secs: 30,
        }
    }
}

impl SyncConfig {
    pub fn project_dirs() -> Option<ProjectDirs> {
        ProjectDirs::from("net", "pagemark", "pagemark")
    }

    pub fn default_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Reads `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let config: SyncConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(endpoint) = &self.endpoint {
            let parsed = Url::parse(endpoint).map_err(|source| ConfigError::InvalidEndpoint {
                endpoint: endpoint.clone(),
                source,
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::UnsupportedScheme(endpoint.clone()));
            }
        }
        if self.autosave_delay_ms == 0 {
            return Err(ConfigError::ZeroAutosaveDelay);
        }
        Ok(())
    }

    pub fn autosave_delay(&self) -> Duration {
        Duration::from_millis(self.autosave_delay_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}
