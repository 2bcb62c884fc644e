//! Document load, autosave, dirty tracking and startup restore.

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::SyncConfig;
use crate::model::{now_millis, AnnotationRecord, ContentHash};
use crate::persistence::{
    is_ephemeral_url, is_remote_url, BlobStore, CachedDocumentBlob, DocumentFetcher,
    DocumentInfo, Fingerprint, LogNotifier, MemoryBlobStore, MemoryMetaStore, MetaStore,
    Notice, Notifier, RemoteSync, Viewer,
};
use crate::store::{AnnotationStore, ListenerId, SharedStore, StoreEvent, StoreListener};

/// Reported by the viewer once a document is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentLoaded {
    pub url: String,
    pub fingerprint: Fingerprint,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { records: usize },
    /// Another document is being restored; this load was ignored.
    Suppressed,
    /// A newer load started while this one was fetching.
    Superseded,
    FetchFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    NothingToRestore,
    FromCache(Fingerprint),
    FromUrl(Fingerprint),
    Abandoned,
}

pub struct SyncPorts {
    pub remote: Option<Arc<dyn RemoteSync>>,
    pub blobs: Arc<dyn BlobStore>,
    pub meta: Arc<dyn MetaStore>,
    pub viewer: Arc<dyn Viewer>,
    pub fetcher: Option<Arc<dyn DocumentFetcher>>,
    pub notifier: Arc<dyn Notifier>,
}

impl SyncPorts {
    /// In-memory stores, no remote, notices go to the log.
    pub fn local(viewer: Arc<dyn Viewer>) -> Self {
        Self {
            remote: None,
            blobs: Arc::new(MemoryBlobStore::new()),
            meta: Arc::new(MemoryMetaStore::new()),
            viewer,
            fetcher: None,
            notifier: Arc::new(LogNotifier),
        }
    }
}

struct PendingSave {
    ticket: u64,
    handle: JoinHandle<()>,
}

struct EngineState {
    current: Option<DocumentInfo>,
    baseline: ContentHash,
    generation: u64,
    /// Generation whose annotation fetch has not completed yet.
    loading: Option<u64>,
    autosave: Option<PendingSave>,
    next_ticket: u64,
    restoring: Option<Fingerprint>,
}

impl EngineState {
    fn new() -> Self {
        Self {
            current: None,
            baseline: ContentHash::of(&[]),
            generation: 0,
            loading: None,
            autosave: None,
            next_ticket: 0,
            restoring: None,
        }
    }

    fn current_fingerprint(&self) -> Option<Fingerprint> {
        self.current.as_ref().map(|doc| doc.fingerprint.clone())
    }
}

struct Inner {
    store: SharedStore,
    ports: SyncPorts,
    username: String,
    autosave_delay: Duration,
    runtime: Handle,
    state: Mutex<EngineState>,
    listener: Mutex<Option<ListenerId>>,
}

struct AutosaveListener(Weak<Inner>);

impl StoreListener for AutosaveListener {
    fn on_store_event(&self, event: &StoreEvent, _store: &AnnotationStore) {
        if !event.is_edit() {
            return;
        }
        if let Some(inner) = self.0.upgrade() {
            inner.schedule_autosave();
        }
    }
}

impl Inner {
    fn schedule_autosave(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.current.is_none() {
            return;
        }
        if state.loading.is_some() {
            debug!("annotations still loading, autosave deferred");
            return;
        }
        state.next_ticket += 1;
        let ticket = state.next_ticket;
        let weak = Arc::downgrade(self);
        let delay = self.autosave_delay;
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire_autosave(ticket).await;
            }
        });
        if let Some(previous) = state.autosave.replace(PendingSave { ticket, handle }) {
            previous.handle.abort();
        }
        debug!(ticket, "autosave scheduled");
    }

    async fn fire_autosave(&self, ticket: u64) {
        let fingerprint = {
            let mut state = self.state.lock();
            if state.autosave.as_ref().map(|p| p.ticket) != Some(ticket) {
                return;
            }
            // Detach so a later edit cannot abort a push already on the wire.
            state.autosave = None;
            if state.loading.is_some() {
                return;
            }
            state.current_fingerprint()
        };
        let Some(fingerprint) = fingerprint else {
            return;
        };
        if let Err(err) = self.push(&fingerprint).await {
            warn!(%fingerprint, ?err, "autosave failed");
        }
    }

    fn cancel_autosave(&self) {
        if let Some(pending) = self.state.lock().autosave.take() {
            pending.handle.abort();
        }
    }

    fn has_unsaved_changes(&self) -> bool {
        let current = ContentHash::of(self.store.lock().all());
        current != self.state.lock().baseline
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }

    /// Ends the loading window of `generation` and saves edits made during it.
    fn finish_load(self: &Arc<Self>, generation: u64) {
        {
            let mut state = self.state.lock();
            if state.loading != Some(generation) {
                return;
            }
            state.loading = None;
        }
        if self.has_unsaved_changes() {
            self.schedule_autosave();
        }
    }

    async fn push(&self, fingerprint: &str) -> Result<()> {
        let Some(remote) = self.ports.remote.clone() else {
            debug!("no sync endpoint configured, skipping push");
            return Ok(());
        };
        {
            let state = self.state.lock();
            let current = state.current.as_ref().map(|doc| doc.fingerprint.as_str());
            if state.loading.is_some() && current == Some(fingerprint) {
                bail!("annotations for {fingerprint} are still loading");
            }
        }
        let records = self.store.lock().snapshot();
        remote
            .push(fingerprint, &self.username, &records)
            .await
            .with_context(|| format!("failed to save annotations for {fingerprint}"))?;
        let sent = ContentHash::of(&records);
        let mut state = self.state.lock();
        if state.current.as_ref().is_some_and(|doc| doc.fingerprint == fingerprint) {
            state.baseline = sent;
        }
        debug!(fingerprint, count = records.len(), "annotations pushed");
        Ok(())
    }

    /// Pushes unsaved edits of the current document before it is replaced.
    async fn flush_pending(&self) {
        self.cancel_autosave();
        let Some(fingerprint) = self.state.lock().current_fingerprint() else {
            return;
        };
        if !self.has_unsaved_changes() {
            return;
        }
        if let Err(err) = self.push(&fingerprint).await {
            warn!(%fingerprint, ?err, "failed to flush unsaved annotations");
            self.ports.notifier.notify(Notice::warning(
                "Unsaved annotations were not saved",
                format!("{err:#}"),
            ));
        }
    }

    async fn cache_document(&self, info: &DocumentInfo) {
        if let Err(err) = self.ports.meta.put_meta(info).await {
            warn!(?err, "failed to persist document info");
        }

        let bytes = match self.ports.viewer.document_bytes().await {
            Some(bytes) => Some(bytes),
            None if is_remote_url(&info.url) => match &self.ports.fetcher {
                Some(fetcher) => match fetcher.fetch_document(&info.url).await {
                    Ok(bytes) => Some(bytes),
                    Err(err) => {
                        warn!(url = %info.url, ?err, "failed to re-fetch document for cache");
                        None
                    }
                },
                None => None,
            },
            None => None,
        };
        let Some(data) = bytes else {
            debug!("document bytes unavailable, not cached");
            return;
        };
        let blob = CachedDocumentBlob {
            fingerprint: info.fingerprint.clone(),
            data,
            timestamp: info.timestamp,
        };
        if let Err(err) = self.ports.blobs.put_blob(blob).await {
            warn!(?err, "failed to cache document bytes");
        }
    }
}

/// Fetched records followed by records created while the fetch was pending.
/// A local record replaces a fetched one with the same id.
fn merge_local_edits(
    fetched: Vec<AnnotationRecord>,
    local: Vec<AnnotationRecord>,
) -> Vec<AnnotationRecord> {
    let mut merged = fetched;
    for record in local {
        match merged.iter_mut().find(|existing| existing.id == record.id) {
            Some(existing) => *existing = record,
            None => merged.push(record),
        }
    }
    merged
}

/// Keeps the annotation store in sync with the local cache and the remote backend.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    /// Creates the engine and subscribes it to `store`. Must run inside a tokio runtime.
    pub fn new(store: SharedStore, ports: SyncPorts, config: &SyncConfig) -> Result<Self> {
        let runtime =
            Handle::try_current().context("sync engine must be created inside a tokio runtime")?;
        let inner = Arc::new(Inner {
            store: Arc::clone(&store),
            ports,
            username: config.username.clone(),
            autosave_delay: config.autosave_delay(),
            runtime,
            state: Mutex::new(EngineState::new()),
            listener: Mutex::new(None),
        });
        let id = store
            .lock()
            .subscribe(Arc::new(AutosaveListener(Arc::downgrade(&inner))));
        *inner.listener.lock() = Some(id);
        Ok(Self { inner })
    }

    pub fn store(&self) -> SharedStore {
        Arc::clone(&self.inner.store)
    }

    pub fn current_document(&self) -> Option<DocumentInfo> {
        self.inner.state.lock().current.clone()
    }

    pub fn is_restoring(&self) -> bool {
        self.inner.state.lock().restoring.is_some()
    }

    pub fn restoring_fingerprint(&self) -> Option<Fingerprint> {
        self.inner.state.lock().restoring.clone()
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.inner.has_unsaved_changes()
    }

    #[instrument(skip(self, event), fields(fingerprint = %event.fingerprint))]
    pub async fn on_document_loaded(&self, event: DocumentLoaded) -> Result<LoadOutcome> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if let Some(target) = state.restoring.as_deref() {
                if target != event.fingerprint {
                    info!(target, "restore in progress, ignoring load");
                    return Ok(LoadOutcome::Suppressed);
                }
                info!("restored document loaded");
                state.restoring = None;
            }
        }

        inner.flush_pending().await;

        inner.store.lock().clear();
        let info = DocumentInfo {
            url: event.url,
            fingerprint: event.fingerprint,
            title: event.title,
            timestamp: now_millis(),
        };
        let generation = {
            let mut state = inner.state.lock();
            state.generation += 1;
            state.loading = Some(state.generation);
            state.current = Some(info.clone());
            state.baseline = ContentHash::of(&[]);
            state.generation
        };

        inner.cache_document(&info).await;

        let Some(remote) = inner.ports.remote.clone() else {
            let count = inner.store.lock().len();
            inner.finish_load(generation);
            return Ok(LoadOutcome::Loaded { records: count });
        };
        match remote.fetch(&info.fingerprint, &inner.username).await {
            Ok(records) => {
                let mut store = inner.store.lock();
                if !inner.is_current(generation) {
                    debug!("discarding annotations of a superseded load");
                    return Ok(LoadOutcome::Superseded);
                }
                let baseline = ContentHash::of(&records);
                let local = store.snapshot();
                if !local.is_empty() {
                    info!(count = local.len(), "keeping annotations made while loading");
                }
                store.replace_all(merge_local_edits(records, local));
                let count = store.len();
                inner.state.lock().baseline = baseline;
                drop(store);
                inner.finish_load(generation);
                info!(count, "annotations loaded");
                Ok(LoadOutcome::Loaded { records: count })
            }
            Err(err) => {
                warn!(?err, "failed to fetch annotations");
                if !inner.is_current(generation) {
                    return Ok(LoadOutcome::Superseded);
                }
                inner.finish_load(generation);
                inner.ports.notifier.notify(Notice::error(
                    "Could not load annotations",
                    format!("{err:#}"),
                ));
                Ok(LoadOutcome::FetchFailed)
            }
        }
    }

    /// Reopens the last document. Call before the host opens any default document.
    #[instrument(skip(self))]
    pub async fn restore_on_startup(&self) -> RestoreOutcome {
        let inner = &self.inner;
        let info = match inner.ports.meta.get_meta().await {
            Ok(Some(info)) => info,
            Ok(None) => return RestoreOutcome::NothingToRestore,
            Err(err) => {
                warn!(?err, "failed to read last document info");
                return RestoreOutcome::NothingToRestore;
            }
        };
        let fingerprint = info.fingerprint.clone();
        inner.state.lock().restoring = Some(fingerprint.clone());
        info!(%fingerprint, url = %info.url, "restoring last document");

        if let Err(err) = inner.ports.viewer.close().await {
            warn!(?err, "failed to close in-flight document");
        }

        match inner.ports.blobs.get_blob(&fingerprint).await {
            Ok(Some(blob)) => {
                let title = info.title.clone();
                match inner.ports.viewer.open_bytes(blob.data, title).await {
                    Ok(()) => return RestoreOutcome::FromCache(fingerprint),
                    Err(err) => warn!(?err, "failed to open cached document"),
                }
            }
            Ok(None) => debug!("no cached bytes for last document"),
            Err(err) => warn!(?err, "failed to read cached document"),
        }

        if !is_ephemeral_url(&info.url) {
            match inner.ports.viewer.open_url(&info.url).await {
                Ok(()) => return RestoreOutcome::FromUrl(fingerprint),
                Err(err) => warn!(?err, "failed to reopen last document url"),
            }
        }

        inner.state.lock().restoring = None;
        info!("restore abandoned");
        RestoreOutcome::Abandoned
    }

    /// Pushes immediately; failures are shown to the user and returned.
    pub async fn save_now(&self) -> Result<()> {
        let inner = &self.inner;
        inner.cancel_autosave();
        let fingerprint = inner
            .state
            .lock()
            .current_fingerprint()
            .ok_or_else(|| anyhow!("no document loaded"))?;
        if inner.ports.remote.is_none() {
            bail!("no sync endpoint configured");
        }
        if let Err(err) = inner.push(&fingerprint).await {
            inner
                .ports
                .notifier
                .notify(Notice::error("Could not save annotations", format!("{err:#}")));
            return Err(err);
        }
        Ok(())
    }

    /// Flushes unsaved edits and detaches from the store.
    pub async fn shutdown(&self) {
        self.inner.flush_pending().await;
        if let Some(id) = self.inner.listener.lock().take() {
            self.inner.store.lock().unsubscribe(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;
    use tokio::time::sleep;

    use crate::geometry::{Geometry, NormalizedGeometry, Point, Rect};
    use crate::model::{RecordPatch, Style, Subtype};
    use crate::persistence::Severity;

    #[derive(Default)]
    struct FakeRemote {
        payloads: Mutex<HashMap<String, Vec<AnnotationRecord>>>,
        fetches: Mutex<Vec<String>>,
        pushes: Mutex<Vec<(String, Vec<AnnotationRecord>)>>,
        fail_fetch: AtomicBool,
        fail_push: AtomicBool,
        gate: Option<(String, Arc<Notify>)>,
    }

    #[async_trait]
    impl RemoteSync for FakeRemote {
        async fn fetch(&self, fingerprint: &str, _username: &str) -> Result<Vec<AnnotationRecord>> {
            self.fetches.lock().push(fingerprint.to_string());
            if let Some((gated, notify)) = &self.gate {
                if gated == fingerprint {
                    notify.notified().await;
                }
            }
            if self.fail_fetch.load(Ordering::SeqCst) {
                bail!("connection refused");
            }
            Ok(self
                .payloads
                .lock()
                .get(fingerprint)
                .cloned()
                .unwrap_or_default())
        }

        async fn push(
            &self,
            fingerprint: &str,
            _username: &str,
            records: &[AnnotationRecord],
        ) -> Result<()> {
            if self.fail_push.load(Ordering::SeqCst) {
                bail!("503 service unavailable");
            }
            self.pushes
                .lock()
                .push((fingerprint.to_string(), records.to_vec()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeViewer {
        bytes: Mutex<Option<Vec<u8>>>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Viewer for FakeViewer {
        async fn open_url(&self, url: &str) -> Result<()> {
            self.calls.lock().push(format!("open_url {url}"));
            Ok(())
        }

        async fn open_bytes(&self, bytes: Vec<u8>, _title: Option<String>) -> Result<()> {
            self.calls.lock().push(format!("open_bytes {}", bytes.len()));
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.calls.lock().push("close".to_string());
            Ok(())
        }

        async fn document_bytes(&self) -> Option<Vec<u8>> {
            self.bytes.lock().clone()
        }
    }

    struct FakeFetcher;

    #[async_trait]
    impl DocumentFetcher for FakeFetcher {
        async fn fetch_document(&self, _url: &str) -> Result<Vec<u8>> {
            Ok(b"fetched".to_vec())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        notices: Mutex<Vec<Notice>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, notice: Notice) {
            self.notices.lock().push(notice);
        }
    }

    struct Harness {
        engine: SyncEngine,
        store: SharedStore,
        remote: Arc<FakeRemote>,
        blobs: Arc<MemoryBlobStore>,
        meta: Arc<MemoryMetaStore>,
        viewer: Arc<FakeViewer>,
        notices: Arc<RecordingNotifier>,
    }

    fn harness_with(remote: FakeRemote, meta: MemoryMetaStore, blobs: MemoryBlobStore) -> Harness {
        let store = AnnotationStore::shared();
        let remote = Arc::new(remote);
        let blobs = Arc::new(blobs);
        let meta = Arc::new(meta);
        let viewer = Arc::new(FakeViewer::default());
        let notices = Arc::new(RecordingNotifier::default());
        let ports = SyncPorts {
            remote: Some(remote.clone()),
            blobs: blobs.clone(),
            meta: meta.clone(),
            viewer: viewer.clone(),
            fetcher: Some(Arc::new(FakeFetcher)),
            notifier: notices.clone(),
        };
        let engine = SyncEngine::new(Arc::clone(&store), ports, &SyncConfig::default()).unwrap();
        Harness {
            engine,
            store,
            remote,
            blobs,
            meta,
            viewer,
            notices,
        }
    }

    fn harness(remote: FakeRemote) -> Harness {
        harness_with(remote, MemoryMetaStore::new(), MemoryBlobStore::new())
    }

    fn loaded(fingerprint: &str) -> DocumentLoaded {
        DocumentLoaded {
            url: format!("file:///docs/{fingerprint}.pdf"),
            fingerprint: fingerprint.to_string(),
            title: None,
        }
    }

    fn record(id: &str) -> AnnotationRecord {
        let mut record = AnnotationRecord::new(
            Subtype::Square,
            1,
            NormalizedGeometry(Geometry::Rect(Rect::from_corners(
                Point::new(0.0, 0.0),
                Point::new(10.0, 10.0),
            ))),
            Style::default(),
            "alice",
        );
        record.id = id.to_string();
        record
    }

    #[tokio::test(start_paused = true)]
    async fn loading_abc_populates_store_and_is_clean() {
        let remote = FakeRemote::default();
        let wire = serde_json::json!([{
            "id": "1",
            "subtype": "Highlight",
            "pageNumber": 2,
            "geometry": {"type": "rect", "x0": 10.0, "y0": 10.0, "x1": 90.0, "y1": 20.0}
        }]);
        remote
            .payloads
            .lock()
            .insert("abc".into(), serde_json::from_value(wire).unwrap());
        let h = harness(remote);

        let outcome = h.engine.on_document_loaded(loaded("abc")).await.unwrap();
        assert_eq!(outcome, LoadOutcome::Loaded { records: 1 });
        {
            let store = h.store.lock();
            assert_eq!(store.len(), 1);
            assert_eq!(store.get("1").unwrap().page_number, 2);
        }
        assert!(!h.engine.has_unsaved_changes());
        assert_eq!(*h.remote.fetches.lock(), vec!["abc".to_string()]);

        sleep(Duration::from_secs(5)).await;
        assert!(h.remote.pushes.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_edits_produces_one_push() {
        let h = harness(FakeRemote::default());
        h.engine.on_document_loaded(loaded("abc")).await.unwrap();

        for i in 0..5 {
            h.store.lock().add(record(&format!("r{i}"))).unwrap();
            sleep(Duration::from_millis(100)).await;
        }
        assert!(h.remote.pushes.lock().is_empty());

        sleep(Duration::from_millis(2500)).await;
        let pushes = h.remote.pushes.lock();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0, "abc");
        assert_eq!(pushes[0].1.len(), 5);
        drop(pushes);
        assert!(!h.engine.has_unsaved_changes());
    }

    #[tokio::test(start_paused = true)]
    async fn spaced_edits_push_each_time() {
        let h = harness(FakeRemote::default());
        h.engine.on_document_loaded(loaded("abc")).await.unwrap();

        for i in 0..3 {
            h.store.lock().add(record(&format!("r{i}"))).unwrap();
            sleep(Duration::from_millis(2500)).await;
        }
        let sizes: Vec<usize> = h.remote.pushes.lock().iter().map(|(_, r)| r.len()).collect();
        assert_eq!(sizes, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn dirty_state_follows_edits_and_saves() {
        let h = harness(FakeRemote::default());
        h.engine.on_document_loaded(loaded("abc")).await.unwrap();
        assert!(!h.engine.has_unsaved_changes());

        h.store.lock().add(record("a")).unwrap();
        assert!(h.engine.has_unsaved_changes());

        h.engine.save_now().await.unwrap();
        assert!(!h.engine.has_unsaved_changes());
        assert_eq!(h.remote.pushes.lock().len(), 1);

        h.store
            .lock()
            .update("a", RecordPatch::text("note"))
            .unwrap();
        assert!(h.engine.has_unsaved_changes());

        sleep(Duration::from_secs(3)).await;
        assert!(!h.engine.has_unsaved_changes());
        assert_eq!(h.remote.pushes.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_notifies_and_leaves_store_empty() {
        let remote = FakeRemote::default();
        remote.fail_fetch.store(true, Ordering::SeqCst);
        let h = harness(remote);

        let outcome = h.engine.on_document_loaded(loaded("abc")).await.unwrap();
        assert_eq!(outcome, LoadOutcome::FetchFailed);
        assert!(h.store.lock().is_empty());
        assert!(!h.engine.has_unsaved_changes());
        let notices = h.notices.notices.lock();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].blocking);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_save_failure_is_surfaced_but_autosave_is_silent() {
        let remote = FakeRemote::default();
        remote.fail_push.store(true, Ordering::SeqCst);
        let h = harness(remote);
        h.engine.on_document_loaded(loaded("abc")).await.unwrap();

        h.store.lock().add(record("a")).unwrap();
        sleep(Duration::from_secs(3)).await;
        assert!(h.notices.notices.lock().is_empty());
        assert!(h.engine.has_unsaved_changes());

        assert!(h.engine.save_now().await.is_err());
        assert_eq!(h.notices.notices.lock().len(), 1);
        assert!(h.engine.has_unsaved_changes());
    }

    #[tokio::test(start_paused = true)]
    async fn switching_documents_flushes_the_previous_one() {
        let h = harness(FakeRemote::default());
        h.engine.on_document_loaded(loaded("a")).await.unwrap();
        h.store.lock().add(record("x")).unwrap();

        h.engine.on_document_loaded(loaded("b")).await.unwrap();
        {
            let pushes = h.remote.pushes.lock();
            assert_eq!(pushes.len(), 1);
            assert_eq!(pushes[0].0, "a");
            assert_eq!(pushes[0].1[0].id, "x");
        }
        assert!(h.store.lock().is_empty());

        sleep(Duration::from_secs(5)).await;
        assert_eq!(h.remote.pushes.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_on_switch_warns_without_blocking() {
        let remote = FakeRemote::default();
        remote.fail_push.store(true, Ordering::SeqCst);
        let h = harness(remote);
        h.engine.on_document_loaded(loaded("a")).await.unwrap();
        h.store.lock().add(record("x")).unwrap();

        h.engine.on_document_loaded(loaded("b")).await.unwrap();
        let notices = h.notices.notices.lock();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].severity, Severity::Warning);
        assert!(!notices[0].blocking);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_load_discards_its_payload() {
        let gate = Arc::new(Notify::new());
        let remote = FakeRemote {
            gate: Some(("slow".into(), gate.clone())),
            ..FakeRemote::default()
        };
        remote.payloads.lock().insert("slow".into(), vec![record("old")]);
        remote.payloads.lock().insert("fast".into(), vec![record("new")]);
        let h = harness(remote);

        let slow = tokio::spawn({
            let engine = h.engine.clone();
            async move { engine.on_document_loaded(loaded("slow")).await }
        });
        sleep(Duration::from_millis(10)).await;

        let fast = h.engine.on_document_loaded(loaded("fast")).await.unwrap();
        assert_eq!(fast, LoadOutcome::Loaded { records: 1 });

        gate.notify_one();
        assert_eq!(slow.await.unwrap().unwrap(), LoadOutcome::Superseded);
        let store = h.store.lock();
        assert!(store.get("new").is_some());
        assert!(store.get("old").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn edits_made_while_loading_survive_the_fetch() {
        let gate = Arc::new(Notify::new());
        let remote = FakeRemote {
            gate: Some(("abc".into(), gate.clone())),
            ..FakeRemote::default()
        };
        remote
            .payloads
            .lock()
            .insert("abc".into(), vec![record("server1"), record("server2")]);
        let h = harness(remote);

        let load = tokio::spawn({
            let engine = h.engine.clone();
            async move { engine.on_document_loaded(loaded("abc")).await }
        });
        sleep(Duration::from_millis(10)).await;
        h.store.lock().add(record("user-edit")).unwrap();

        sleep(Duration::from_secs(3)).await;
        assert!(h.remote.pushes.lock().is_empty());
        assert!(h.engine.save_now().await.is_err());
        assert!(h.remote.pushes.lock().is_empty());

        gate.notify_one();
        let outcome = load.await.unwrap().unwrap();
        assert_eq!(outcome, LoadOutcome::Loaded { records: 3 });
        let ids: Vec<String> = h.store.lock().all().iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec!["server1", "server2", "user-edit"]);
        assert!(h.engine.has_unsaved_changes());

        sleep(Duration::from_secs(3)).await;
        {
            let pushes = h.remote.pushes.lock();
            assert_eq!(pushes.len(), 1);
            assert_eq!(pushes[0].1.len(), 3);
        }
        assert!(!h.engine.has_unsaved_changes());
    }

    #[test]
    fn local_records_override_fetched_ones_with_the_same_id() {
        let mut edited = record("b");
        edited.page_number = 4;
        let merged = merge_local_edits(vec![record("a"), record("b")], vec![edited, record("c")]);
        let ids: Vec<&str> = merged.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(merged[1].page_number, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_documents_are_cached_via_fetcher() {
        let h = harness(FakeRemote::default());
        h.engine
            .on_document_loaded(DocumentLoaded {
                url: "https://example.org/paper.pdf".into(),
                fingerprint: "paper".into(),
                title: Some("Paper".into()),
            })
            .await
            .unwrap();
        let blob = h.blobs.get_blob("paper").await.unwrap().unwrap();
        assert_eq!(blob.data, b"fetched".to_vec());

        h.engine.on_document_loaded(loaded("local")).await.unwrap();
        assert_eq!(h.blobs.fingerprints(), vec!["paper".to_string()]);
        assert_eq!(h.meta.get_meta().await.unwrap().unwrap().fingerprint, "local");
    }

    fn last_document(fingerprint: &str, url: &str) -> DocumentInfo {
        DocumentInfo {
            url: url.to_string(),
            fingerprint: fingerprint.to_string(),
            title: Some("Target".into()),
            timestamp: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn restore_from_cache_ignores_the_default_document() {
        let blobs = MemoryBlobStore::new();
        blobs
            .put_blob(CachedDocumentBlob {
                fingerprint: "target".into(),
                data: b"%PDF target".to_vec(),
                timestamp: 1,
            })
            .await
            .unwrap();
        let meta =
            MemoryMetaStore::with_entry(last_document("target", "https://example.org/t.pdf"));
        let h = harness_with(FakeRemote::default(), meta, blobs);
        *h.viewer.bytes.lock() = Some(b"%PDF target".to_vec());

        let outcome = h.engine.restore_on_startup().await;
        assert_eq!(outcome, RestoreOutcome::FromCache("target".into()));
        assert_eq!(h.engine.restoring_fingerprint().as_deref(), Some("target"));
        assert_eq!(
            *h.viewer.calls.lock(),
            vec!["close".to_string(), "open_bytes 11".to_string()]
        );

        let default = h.engine.on_document_loaded(loaded("sample")).await.unwrap();
        assert_eq!(default, LoadOutcome::Suppressed);
        assert!(h.remote.fetches.lock().is_empty());

        let target = h.engine.on_document_loaded(loaded("target")).await.unwrap();
        assert_eq!(target, LoadOutcome::Loaded { records: 0 });
        assert!(!h.engine.is_restoring());

        assert!(h.meta.history().iter().all(|doc| doc.fingerprint != "sample"));
        assert_eq!(h.blobs.fingerprints(), vec!["target".to_string()]);
        assert_eq!(*h.remote.fetches.lock(), vec!["target".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn restore_falls_back_to_url_then_gives_up() {
        let meta = MemoryMetaStore::with_entry(last_document("t", "https://example.org/t.pdf"));
        let h = harness_with(FakeRemote::default(), meta, MemoryBlobStore::new());
        assert_eq!(
            h.engine.restore_on_startup().await,
            RestoreOutcome::FromUrl("t".into())
        );
        assert_eq!(
            h.viewer.calls.lock().last().map(String::as_str),
            Some("open_url https://example.org/t.pdf")
        );

        let meta = MemoryMetaStore::with_entry(last_document("t", "blob:https://app/1b4e28ba"));
        let h = harness_with(FakeRemote::default(), meta, MemoryBlobStore::new());
        assert_eq!(h.engine.restore_on_startup().await, RestoreOutcome::Abandoned);
        assert!(!h.engine.is_restoring());
        assert_eq!(*h.viewer.calls.lock(), vec!["close".to_string()]);

        let h = harness(FakeRemote::default());
        assert_eq!(
            h.engine.restore_on_startup().await,
            RestoreOutcome::NothingToRestore
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_and_detaches() {
        let h = harness(FakeRemote::default());
        h.engine.on_document_loaded(loaded("abc")).await.unwrap();
        h.store.lock().add(record("a")).unwrap();

        h.engine.shutdown().await;
        assert_eq!(h.remote.pushes.lock().len(), 1);

        h.store.lock().add(record("b")).unwrap();
        sleep(Duration::from_secs(5)).await;
        assert_eq!(h.remote.pushes.lock().len(), 1);
    }
}
