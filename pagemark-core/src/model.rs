use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::skip_serializing_none;
use uuid::Uuid;

use crate::geometry::NormalizedGeometry;

pub type AnnotationId = String;

static CONTENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("0d3f6a52-3c1e-5b8e-9f4d-2a7e61c0b9f4").expect("valid namespace UUID")
});

pub fn new_annotation_id() -> AnnotationId {
    Uuid::new_v4().to_string()
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Subtype {
    Note,
    FreeText,
    Highlight,
    Underline,
    StrikeOut,
    Ink,
    Square,
    Circle,
    Line,
    Arrow,
    Polygon,
    Stamp,
    Signature,
    #[serde(other)]
    Other,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Style {
    pub color: String,
    pub stroke_width: f64,
    pub opacity: Option<f64>,
    pub font_size: Option<f64>,
}

impl Default for Style {
    fn default() -> Self {
        Self {
            color: "#ffd400".to_string(),
            stroke_width: 2.0,
            opacity: None,
            font_size: None,
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contents {
    #[serde(default)]
    pub text: String,
    pub display_text: Option<String>,
    pub selected_text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentStatus {
    Accepted,
    Rejected,
    Cancelled,
    Completed,
    Closed,
    #[default]
    None,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub title: String,
    pub date: u64,
    pub content: String,
    pub status: Option<CommentStatus>,
}

impl Comment {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            date: now_millis(),
            content: content.into(),
            status: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationRecord {
    pub id: AnnotationId,
    pub subtype: Subtype,
    pub page_number: u32,
    pub geometry: NormalizedGeometry,
    #[serde(default)]
    pub style: Style,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub contents_obj: Contents,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub date: u64,
    /// Wire fields this engine does not interpret, kept so a sync round-trip is lossless.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AnnotationRecord {
    pub fn new(
        subtype: Subtype,
        page_number: u32,
        geometry: NormalizedGeometry,
        style: Style,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: new_annotation_id(),
            subtype,
            page_number,
            geometry,
            style,
            title: title.into(),
            contents_obj: Contents::default(),
            comments: Vec::new(),
            date: now_millis(),
            extra: Map::new(),
        }
    }

    pub(crate) fn touch(&mut self) {
        self.date = now_millis().max(self.date.saturating_add(1));
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StylePatch {
    pub color: Option<String>,
    pub stroke_width: Option<f64>,
    pub opacity: Option<f64>,
    pub font_size: Option<f64>,
}

impl StylePatch {
    pub fn apply(&self, style: &mut Style) {
        if let Some(color) = &self.color {
            style.color = color.clone();
        }
        if let Some(width) = self.stroke_width {
            style.stroke_width = width;
        }
        if self.opacity.is_some() {
            style.opacity = self.opacity;
        }
        if self.font_size.is_some() {
            style.font_size = self.font_size;
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentsPatch {
    pub text: Option<String>,
    pub display_text: Option<String>,
    pub selected_text: Option<String>,
}

impl ContentsPatch {
    pub fn apply(&self, contents: &mut Contents) {
        if let Some(text) = &self.text {
            contents.text = text.clone();
        }
        if self.display_text.is_some() {
            contents.display_text = self.display_text.clone();
        }
        if self.selected_text.is_some() {
            contents.selected_text = self.selected_text.clone();
        }
    }
}

/// Partial update of an [`AnnotationRecord`]; `None` fields are left untouched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordPatch {
    pub subtype: Option<Subtype>,
    pub page_number: Option<u32>,
    pub geometry: Option<NormalizedGeometry>,
    pub style: Option<StylePatch>,
    pub title: Option<String>,
    pub contents_obj: Option<ContentsPatch>,
    pub comments: Option<Vec<Comment>>,
}

impl RecordPatch {
    pub fn geometry(geometry: NormalizedGeometry) -> Self {
        Self {
            geometry: Some(geometry),
            ..Self::default()
        }
    }

    pub fn style(style: StylePatch) -> Self {
        Self {
            style: Some(style),
            ..Self::default()
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            contents_obj: Some(ContentsPatch {
                text: Some(text.into()),
                ..ContentsPatch::default()
            }),
            ..Self::default()
        }
    }

    pub(crate) fn apply(&self, record: &mut AnnotationRecord) {
        if let Some(subtype) = self.subtype {
            record.subtype = subtype;
        }
        if let Some(page) = self.page_number {
            record.page_number = page;
        }
        if let Some(geometry) = &self.geometry {
            record.geometry = geometry.clone();
        }
        if let Some(style) = &self.style {
            style.apply(&mut record.style);
        }
        if let Some(title) = &self.title {
            record.title = title.clone();
        }
        if let Some(contents) = &self.contents_obj {
            contents.apply(&mut record.contents_obj);
        }
        if let Some(comments) = &self.comments {
            record.comments = comments.clone();
        }
        record.touch();
    }
}

/// Deterministic digest of a record collection, used as the dirty-state baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(Uuid);

impl ContentHash {
    pub fn of(records: &[AnnotationRecord]) -> Self {
        let canonical = serde_json::to_vec(records).unwrap_or_default();
        ContentHash(Uuid::new_v5(&CONTENT_NAMESPACE, &canonical))
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}
