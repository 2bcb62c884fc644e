use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::model::{
    AnnotationId, AnnotationRecord, Comment, CommentStatus, RecordPatch, StylePatch,
};

#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("annotation {0} already exists")]
    DuplicateId(AnnotationId),
    #[error("annotation {0} not found")]
    NotFound(AnnotationId),
    #[error("comment {comment} not found on annotation {annotation}")]
    CommentNotFound {
        annotation: AnnotationId,
        comment: String,
    },
}

#[derive(Debug, Clone)]
pub enum StoreEvent {
    Added(AnnotationRecord),
    Updated {
        record: AnnotationRecord,
        previous_page: u32,
    },
    Deleted(AnnotationRecord),
    /// Whole collection swapped in by a document load or restore. Carries the
    /// records it displaced.
    Replaced { removed: Vec<AnnotationRecord> },
    Cleared { removed: Vec<AnnotationRecord> },
}

impl StoreEvent {
    /// Events caused by editing, as opposed to loading a document.
    pub fn is_edit(&self) -> bool {
        matches!(
            self,
            StoreEvent::Added(_) | StoreEvent::Updated { .. } | StoreEvent::Deleted(_)
        )
    }

    /// Pages whose overlay must be repainted, or `None` when every page is affected.
    pub fn affected_pages(&self) -> Option<Vec<u32>> {
        match self {
            StoreEvent::Added(record) | StoreEvent::Deleted(record) => {
                Some(vec![record.page_number])
            }
            StoreEvent::Updated {
                record,
                previous_page,
            } => {
                if record.page_number == *previous_page {
                    Some(vec![record.page_number])
                } else {
                    Some(vec![*previous_page, record.page_number])
                }
            }
            StoreEvent::Replaced { .. } | StoreEvent::Cleared { .. } => None,
        }
    }
}

/// Receives every store mutation synchronously, while the store is still borrowed.
///
/// Listeners must not try to lock the shared store again; the store is handed in for
/// read-only queries instead.
pub trait StoreListener: Send + Sync {
    fn on_store_event(&self, event: &StoreEvent, store: &AnnotationStore);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// UI panel callbacks (comment list, properties panel).
pub trait AnnotationPanel: Send + Sync {
    fn on_add(&self, _record: &AnnotationRecord) {}
    fn on_delete(&self, _id: &str) {}
    fn on_update(&self, _record: &AnnotationRecord) {}
    fn on_select(&self, _record: &AnnotationRecord, _explicit_click: bool) {}
}

/// Forwards store events to an [`AnnotationPanel`].
pub struct PanelListener(pub Arc<dyn AnnotationPanel>);

impl StoreListener for PanelListener {
    fn on_store_event(&self, event: &StoreEvent, store: &AnnotationStore) {
        match event {
            StoreEvent::Added(record) => self.0.on_add(record),
            StoreEvent::Updated { record, .. } => self.0.on_update(record),
            StoreEvent::Deleted(record) => self.0.on_delete(&record.id),
            StoreEvent::Replaced { removed } => {
                for record in removed {
                    self.0.on_delete(&record.id);
                }
                for record in store.all() {
                    self.0.on_add(record);
                }
            }
            StoreEvent::Cleared { removed } => {
                for record in removed {
                    self.0.on_delete(&record.id);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum RecordCommand {
    SetText {
        id: AnnotationId,
        text: String,
    },
    Restyle {
        id: AnnotationId,
        style: StylePatch,
    },
    AddComment {
        id: AnnotationId,
        comment: Comment,
    },
    EditComment {
        id: AnnotationId,
        comment_id: String,
        content: String,
    },
    RemoveComment {
        id: AnnotationId,
        comment_id: String,
    },
    SetCommentStatus {
        id: AnnotationId,
        comment_id: String,
        status: CommentStatus,
    },
    Delete {
        id: AnnotationId,
    },
}

pub type SharedStore = Arc<Mutex<AnnotationStore>>;

#[derive(Default)]
pub struct AnnotationStore {
    records: Vec<AnnotationRecord>,
    listeners: Vec<(ListenerId, Arc<dyn StoreListener>)>,
    next_listener: u64,
}

impl AnnotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStore {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn subscribe(&mut self, listener: Arc<dyn StoreListener>) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        before != self.listeners.len()
    }

    pub fn get(&self, id: &str) -> Option<&AnnotationRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn all(&self) -> &[AnnotationRecord] {
        &self.records
    }

    pub fn snapshot(&self) -> Vec<AnnotationRecord> {
        self.records.clone()
    }

    pub fn records_on_page(&self, page: u32) -> impl Iterator<Item = &AnnotationRecord> {
        self.records.iter().filter(move |r| r.page_number == page)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn add(&mut self, record: AnnotationRecord) -> Result<(), StoreError> {
        if self.get(&record.id).is_some() {
            return Err(StoreError::DuplicateId(record.id));
        }
        debug!(id = %record.id, page = record.page_number, "annotation added");
        self.records.push(record.clone());
        self.emit(StoreEvent::Added(record));
        Ok(())
    }

    pub fn update(&mut self, id: &str, patch: RecordPatch) -> Result<AnnotationRecord, StoreError> {
        let record = self
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let previous_page = record.page_number;
        patch.apply(record);
        let updated = record.clone();
        self.emit(StoreEvent::Updated {
            record: updated.clone(),
            previous_page,
        });
        Ok(updated)
    }

    pub fn delete(&mut self, id: &str) -> Result<AnnotationRecord, StoreError> {
        let index = self
            .records
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let removed = self.records.remove(index);
        debug!(id = %removed.id, "annotation deleted");
        self.emit(StoreEvent::Deleted(removed.clone()));
        Ok(removed)
    }

    /// Swaps in a loaded collection. Later duplicates of an id are dropped.
    pub fn replace_all(&mut self, records: Vec<AnnotationRecord>) {
        let mut deduped: Vec<AnnotationRecord> = Vec::with_capacity(records.len());
        for record in records {
            if deduped.iter().any(|r| r.id == record.id) {
                debug!(id = %record.id, "dropping duplicate annotation id from payload");
                continue;
            }
            deduped.push(record);
        }
        let removed = std::mem::replace(&mut self.records, deduped);
        self.emit(StoreEvent::Replaced { removed });
    }

    pub fn clear(&mut self) {
        let removed = std::mem::take(&mut self.records);
        self.emit(StoreEvent::Cleared { removed });
    }

    pub fn apply(&mut self, command: RecordCommand) -> Result<(), StoreError> {
        match command {
            RecordCommand::SetText { id, text } => {
                self.update(&id, RecordPatch::text(text))?;
            }
            RecordCommand::Restyle { id, style } => {
                self.update(&id, RecordPatch::style(style))?;
            }
            RecordCommand::AddComment { id, comment } => {
                let mut comments = self.comments_of(&id)?;
                comments.push(comment);
                self.set_comments(&id, comments)?;
            }
            RecordCommand::EditComment {
                id,
                comment_id,
                content,
            } => {
                let mut comments = self.comments_of(&id)?;
                let comment = find_comment(&mut comments, &id, &comment_id)?;
                comment.content = content;
                comment.date = crate::model::now_millis();
                self.set_comments(&id, comments)?;
            }
            RecordCommand::RemoveComment { id, comment_id } => {
                let mut comments = self.comments_of(&id)?;
                let before = comments.len();
                comments.retain(|c| c.id != comment_id);
                if comments.len() == before {
                    return Err(StoreError::CommentNotFound {
                        annotation: id,
                        comment: comment_id,
                    });
                }
                self.set_comments(&id, comments)?;
            }
            RecordCommand::SetCommentStatus {
                id,
                comment_id,
                status,
            } => {
                let mut comments = self.comments_of(&id)?;
                find_comment(&mut comments, &id, &comment_id)?.status = Some(status);
                self.set_comments(&id, comments)?;
            }
            RecordCommand::Delete { id } => {
                self.delete(&id)?;
            }
        }
        Ok(())
    }

    fn comments_of(&self, id: &str) -> Result<Vec<Comment>, StoreError> {
        self.get(id)
            .map(|r| r.comments.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn set_comments(&mut self, id: &str, comments: Vec<Comment>) -> Result<(), StoreError> {
        let patch = RecordPatch {
            comments: Some(comments),
            ..RecordPatch::default()
        };
        self.update(id, patch).map(|_| ())
    }

    fn emit(&self, event: StoreEvent) {
        for (_, listener) in &self.listeners {
            listener.on_store_event(&event, self);
        }
    }
}

fn find_comment<'a>(
    comments: &'a mut [Comment],
    annotation: &str,
    comment_id: &str,
) -> Result<&'a mut Comment, StoreError> {
    comments
        .iter_mut()
        .find(|c| c.id == comment_id)
        .ok_or_else(|| StoreError::CommentNotFound {
            annotation: annotation.to_string(),
            comment: comment_id.to_string(),
        })
}
