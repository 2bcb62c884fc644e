//! Annotation model, editing and synchronization for document viewers.

pub mod config;
pub mod editor;
pub mod geometry;
pub mod layers;
pub mod model;
pub mod persistence;
pub mod store;
pub mod sync;

pub use config::{ConfigError, SyncConfig};
pub use editor::{Editor, EditorEffect, EditorError, EditorState, PointerEvent};
pub use geometry::{
    to_normalized, to_screen, Geometry, GeometryError, NormalizedGeometry, Point, Rect,
    Rotation, ScreenGeometry, Viewport,
};
pub use layers::{CanvasLayerManager, HydrationReport, LayerError, OverlaySurface, RenderedShape};
pub use model::{
    AnnotationId, AnnotationRecord, Comment, CommentStatus, ContentHash, Contents, RecordPatch,
    Style, StylePatch, Subtype,
};
pub use persistence::{
    fingerprint_for_bytes, BlobStore, CachedDocumentBlob, DocumentFetcher, DocumentInfo,
    FileBlobStore, FileMetaStore, Fingerprint, MetaStore, Notice, Notifier, RemoteSync,
    Severity, Viewer,
};
pub use store::{
    AnnotationPanel, AnnotationStore, PanelListener, RecordCommand, SharedStore, StoreError,
    StoreEvent, StoreListener,
};
pub use sync::{DocumentLoaded, LoadOutcome, RestoreOutcome, SyncEngine, SyncPorts};
