//! Ports the sync engine talks through, plus file and in-memory stores.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use tracing::{error, warn};
use url::Url;
use uuid::Uuid;

use crate::model::AnnotationRecord;

pub type Fingerprint = String;

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("7b2c58f1-99c6-5a5c-a6ea-50f9e7f1cc20").expect("valid namespace UUID")
});

/// Content-derived document identity, stable across reopens of the same bytes.
pub fn fingerprint_for_bytes(bytes: &[u8]) -> Fingerprint {
    Uuid::new_v5(&DOCUMENT_NAMESPACE, bytes).simple().to_string()
}

/// Session-local URLs that cannot be reopened after a restart.
pub fn is_ephemeral_url(url: &str) -> bool {
    Url::parse(url)
        .map(|u| matches!(u.scheme(), "blob" | "data"))
        .unwrap_or(false)
}

pub fn is_remote_url(url: &str) -> bool {
    Url::parse(url)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentInfo {
    pub url: String,
    pub fingerprint: Fingerprint,
    pub title: Option<String>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedDocumentBlob {
    pub fingerprint: Fingerprint,
    pub data: Vec<u8>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// A user-facing message; `blocking` notices need an explicit acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub blocking: bool,
}

impl Notice {
    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            title: title.into(),
            message: message.into(),
            blocking: true,
        }
    }

    pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            title: title.into(),
            message: message.into(),
            blocking: false,
        }
    }
}

#[async_trait]
pub trait RemoteSync: Send + Sync {
    async fn fetch(&self, fingerprint: &str, username: &str) -> Result<Vec<AnnotationRecord>>;
    async fn push(
        &self,
        fingerprint: &str,
        username: &str,
        records: &[AnnotationRecord],
    ) -> Result<()>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get_blob(&self, fingerprint: &str) -> Result<Option<CachedDocumentBlob>>;
    async fn put_blob(&self, blob: CachedDocumentBlob) -> Result<()>;
}

#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn get_meta(&self) -> Result<Option<DocumentInfo>>;
    async fn put_meta(&self, info: &DocumentInfo) -> Result<()>;
}

/// Open/close primitives of the host viewer.
#[async_trait]
pub trait Viewer: Send + Sync {
    async fn open_url(&self, url: &str) -> Result<()>;
    async fn open_bytes(&self, bytes: Vec<u8>, title: Option<String>) -> Result<()>;
    /// Tears down the current document and any load still in flight.
    async fn close(&self) -> Result<()>;
    /// Bytes of the currently open document, when the viewer keeps them in memory.
    async fn document_bytes(&self) -> Option<Vec<u8>>;
}

#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch_document(&self, url: &str) -> Result<Vec<u8>>;
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Routes notices to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        match notice.severity {
            Severity::Warning => warn!(title = %notice.title, "{}", notice.message),
            Severity::Error => error!(title = %notice.title, "{}", notice.message),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    entries: Mutex<HashMap<Fingerprint, CachedDocumentBlob>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        let mut keys: Vec<_> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get_blob(&self, fingerprint: &str) -> Result<Option<CachedDocumentBlob>> {
        Ok(self.entries.lock().get(fingerprint).cloned())
    }

    async fn put_blob(&self, blob: CachedDocumentBlob) -> Result<()> {
        self.entries.lock().insert(blob.fingerprint.clone(), blob);
        Ok(())
    }
}

/// Keeps every write so callers can inspect what was ever persisted.
#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    history: Mutex<Vec<DocumentInfo>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(info: DocumentInfo) -> Self {
        Self {
            history: Mutex::new(vec![info]),
        }
    }

    pub fn history(&self) -> Vec<DocumentInfo> {
        self.history.lock().clone()
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn get_meta(&self) -> Result<Option<DocumentInfo>> {
        Ok(self.history.lock().last().cloned())
    }

    async fn put_meta(&self, info: &DocumentInfo) -> Result<()> {
        self.history.lock().push(info.clone());
        Ok(())
    }
}

const META_FILE: &str = "last-document.json";
const META_KEY: &str = "lastDocument";

/// Single-entry metadata file holding the last opened document.
pub struct FileMetaStore {
    root: PathBuf,
}

impl FileMetaStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create metadata directory at {:?}", root))?;
        Ok(Self { root })
    }

    fn path(&self) -> PathBuf {
        self.root.join(META_FILE)
    }
}

fn read_meta(path: &Path) -> Result<Option<DocumentInfo>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut file =
        File::open(path).with_context(|| format!("failed to open metadata file {:?}", path))?;
    let mut buf = String::new();
    file.read_to_string(&mut buf)?;
    let mut entries: HashMap<String, DocumentInfo> = serde_json::from_str(&buf)
        .with_context(|| format!("failed to decode metadata file {:?}", path))?;
    Ok(entries.remove(META_KEY))
}

#[async_trait]
impl MetaStore for FileMetaStore {
    async fn get_meta(&self) -> Result<Option<DocumentInfo>> {
        let path = self.path();
        tokio::task::spawn_blocking(move || read_meta(&path))
            .await
            .context("metadata reader task failed")?
    }

    async fn put_meta(&self, info: &DocumentInfo) -> Result<()> {
        let mut entries = HashMap::new();
        entries.insert(META_KEY, info);
        let payload = serde_json::to_string_pretty(&entries)?;
        let path = self.path();
        tokio::task::spawn_blocking(move || write_atomic(&path, payload.as_bytes()))
            .await
            .context("metadata writer task failed")?
    }
}

const BLOB_SCHEMA_VERSION: u32 = 2;
const BLOB_STORE_NAME: &str = "documents";
const BLOB_KEY_PATH: &str = "fingerprint";
const SCHEMA_FILE: &str = "schema.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SchemaHeader {
    version: u32,
    store: String,
    key_path: String,
}

impl SchemaHeader {
    fn current() -> Self {
        Self {
            version: BLOB_SCHEMA_VERSION,
            store: BLOB_STORE_NAME.to_string(),
            key_path: BLOB_KEY_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlobEntry {
    fingerprint: Fingerprint,
    timestamp: u64,
    size: u64,
}

/// Durable document cache: one `<key>.json` + `<key>.bin` pair per fingerprint.
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    /// Opens the cache, recreating it when its schema header does not match.
    pub fn open(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create blob directory at {:?}", root))?;
        if let Some(reason) = schema_problem(&root)? {
            warn!(?root, reason, "recreating document cache");
            fs::remove_dir_all(&root)
                .with_context(|| format!("failed to drop blob directory {:?}", root))?;
            fs::create_dir_all(&root)?;
        }
        let header = serde_json::to_string_pretty(&SchemaHeader::current())?;
        write_atomic(&root.join(SCHEMA_FILE), header.as_bytes())?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn schema_problem(root: &Path) -> Result<Option<&'static str>> {
    let header_path = root.join(SCHEMA_FILE);
    if !header_path.exists() {
        let populated = fs::read_dir(root)?.next().is_some();
        return Ok(populated.then_some("populated store without schema header"));
    }
    let raw = fs::read_to_string(&header_path)?;
    match serde_json::from_str::<SchemaHeader>(&raw) {
        Ok(header) if header == SchemaHeader::current() => Ok(None),
        Ok(_) => Ok(Some("schema header mismatch")),
        Err(_) => Ok(Some("unreadable schema header")),
    }
}

fn entry_key(fingerprint: &str) -> String {
    fingerprint
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn read_entry(root: &Path, fingerprint: &str) -> Result<Option<CachedDocumentBlob>> {
    let key = entry_key(fingerprint);
    let meta_path = root.join(format!("{key}.json"));
    let data_path = root.join(format!("{key}.bin"));
    if !meta_path.exists() || !data_path.exists() {
        return Ok(None);
    }
    let entry: BlobEntry = serde_json::from_str(&fs::read_to_string(&meta_path)?)
        .with_context(|| format!("failed to decode blob entry {:?}", meta_path))?;
    if entry.fingerprint != fingerprint {
        return Ok(None);
    }
    let data = fs::read(&data_path).with_context(|| format!("failed to read {:?}", data_path))?;
    if data.len() as u64 != entry.size {
        warn!(
            fingerprint,
            expected = entry.size,
            actual = data.len(),
            "truncated cached document"
        );
        return Ok(None);
    }
    Ok(Some(CachedDocumentBlob {
        fingerprint: entry.fingerprint,
        data,
        timestamp: entry.timestamp,
    }))
}

fn write_entry(root: &Path, blob: &CachedDocumentBlob) -> Result<()> {
    let key = entry_key(&blob.fingerprint);
    write_atomic(&root.join(format!("{key}.bin")), &blob.data)?;
    let entry = BlobEntry {
        fingerprint: blob.fingerprint.clone(),
        timestamp: blob.timestamp,
        size: blob.data.len() as u64,
    };
    write_atomic(
        &root.join(format!("{key}.json")),
        serde_json::to_string_pretty(&entry)?.as_bytes(),
    )
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn get_blob(&self, fingerprint: &str) -> Result<Option<CachedDocumentBlob>> {
        let root = self.root.clone();
        let fingerprint = fingerprint.to_string();
        tokio::task::spawn_blocking(move || read_entry(&root, &fingerprint))
            .await
            .context("blob reader task failed")?
    }

    async fn put_blob(&self, blob: CachedDocumentBlob) -> Result<()> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || write_entry(&root, &blob))
            .await
            .context("blob writer task failed")?
    }
}

fn write_atomic(path: &Path, payload: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let mut file =
        File::create(&tmp).with_context(|| format!("failed to open temp file {:?}", tmp))?;
    file.write_all(payload)?;
    file.flush()?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {:?}", path))?;
    Ok(())
}
