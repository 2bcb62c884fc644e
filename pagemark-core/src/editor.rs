//! Per-annotation drawing and editing state machine.
//!
//! `Idle -> Active -> Committed -> Selected -> Editing -> Committed`, `Committed -> Idle`
//! on deselect, anything `-> Destroyed`. Editors never touch the store themselves; they
//! hand back an [`EditorEffect`] for the caller to apply.

use thiserror::Error;
use tracing::debug;

use crate::geometry::{
    to_normalized, to_screen, Geometry, NormalizedGeometry, Point, Rect, ScreenGeometry, Viewport,
};
use crate::model::{AnnotationId, AnnotationRecord, RecordPatch, Style, StylePatch, Subtype};

/// Smallest extent, in screen pixels, a dragged shape needs to be committed.
pub const MIN_EXTENT: f64 = 1.0;
/// Radius, in screen pixels, within which a drag handle is grabbed.
pub const HANDLE_RADIUS: f64 = 6.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditorState {
    Idle,
    Active,
    Committed,
    Selected,
    Editing,
    Destroyed,
}

#[derive(Debug, Error, PartialEq)]
pub enum EditorError {
    #[error("cannot {action} while the editor is {state:?}")]
    InvalidState {
        action: &'static str,
        state: EditorState,
    },
    #[error("{0:?} annotations have no drawing tool")]
    NoTool(Subtype),
}

/// Pointer input from the overlay surface. Synthetic events may lack a position.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PointerEvent {
    pub position: Option<Point>,
}

impl PointerEvent {
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            position: Some(Point::new(x, y)),
        }
    }

    pub fn without_position() -> Self {
        Self { position: None }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EditorEffect {
    Create(AnnotationRecord),
    Update { id: AnnotationId, patch: RecordPatch },
    Delete(AnnotationId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DragHandle {
    Body,
    Corner(usize),
    Vertex(usize),
}

#[derive(Debug, Clone, Default)]
pub struct PointTool {
    anchor: Option<Point>,
}

#[derive(Debug, Clone, Default)]
pub struct ExtentTool {
    start: Option<Point>,
    current: Option<Point>,
}

#[derive(Debug, Clone, Default)]
pub struct SegmentTool {
    start: Option<Point>,
    current: Option<Point>,
}

#[derive(Debug, Clone)]
pub struct StrokeTool {
    points: Vec<Point>,
    min_spacing: f64,
    as_path: bool,
}

impl StrokeTool {
    fn new(as_path: bool, style: &Style) -> Self {
        Self {
            points: Vec::new(),
            min_spacing: spacing_for(style),
            as_path,
        }
    }
}

fn spacing_for(style: &Style) -> f64 {
    (style.stroke_width * 0.5).max(0.5)
}

/// Shared gesture capabilities of every tool variant.
trait Gesture {
    fn on_pointer_down(&mut self, at: Point);
    fn on_pointer_move(&mut self, at: Point);
    /// Finishes the gesture; `None` when it is degenerate.
    fn on_pointer_up(&mut self, at: Point) -> Option<Geometry>;
    fn on_style_change(&mut self, _style: &Style) {}
    fn preview(&self) -> Option<Geometry>;
    fn reset(&mut self);
}

impl Gesture for PointTool {
    fn on_pointer_down(&mut self, at: Point) {
        self.anchor = Some(at);
    }

    fn on_pointer_move(&mut self, _at: Point) {}

    fn on_pointer_up(&mut self, at: Point) -> Option<Geometry> {
        self.anchor = None;
        Some(Geometry::Point(at))
    }

    fn preview(&self) -> Option<Geometry> {
        self.anchor.map(Geometry::Point)
    }

    fn reset(&mut self) {
        self.anchor = None;
    }
}

impl Gesture for ExtentTool {
    fn on_pointer_down(&mut self, at: Point) {
        self.start = Some(at);
        self.current = Some(at);
    }

    fn on_pointer_move(&mut self, at: Point) {
        if self.start.is_some() {
            self.current = Some(at);
        }
    }

    fn on_pointer_up(&mut self, at: Point) -> Option<Geometry> {
        self.on_pointer_move(at);
        let rect = self.preview_rect();
        self.reset();
        let rect = rect?;
        if rect.width() < MIN_EXTENT || rect.height() < MIN_EXTENT {
            return None;
        }
        Some(Geometry::Rect(rect))
    }

    fn preview(&self) -> Option<Geometry> {
        self.preview_rect().map(Geometry::Rect)
    }

    fn reset(&mut self) {
        self.start = None;
        self.current = None;
    }
}

impl ExtentTool {
    fn preview_rect(&self) -> Option<Rect> {
        Some(Rect::from_corners(self.start?, self.current?))
    }
}

impl Gesture for SegmentTool {
    fn on_pointer_down(&mut self, at: Point) {
        self.start = Some(at);
        self.current = Some(at);
    }

    fn on_pointer_move(&mut self, at: Point) {
        if self.start.is_some() {
            self.current = Some(at);
        }
    }

    fn on_pointer_up(&mut self, at: Point) -> Option<Geometry> {
        self.on_pointer_move(at);
        let ends = self.start.zip(self.current);
        self.reset();
        let (start, end) = ends?;
        if start.distance_to(&end) < MIN_EXTENT {
            return None;
        }
        Some(Geometry::Polyline {
            points: vec![start, end],
        })
    }

    fn preview(&self) -> Option<Geometry> {
        let (start, end) = self.start.zip(self.current)?;
        Some(Geometry::Polyline {
            points: vec![start, end],
        })
    }

    fn reset(&mut self) {
        self.start = None;
        self.current = None;
    }
}

impl Gesture for StrokeTool {
    fn on_pointer_down(&mut self, at: Point) {
        self.points.clear();
        self.points.push(at);
    }

    fn on_pointer_move(&mut self, at: Point) {
        match self.points.last() {
            None => {}
            Some(last) if last.distance_to(&at) < self.min_spacing => {}
            Some(_) => self.points.push(at),
        }
    }

    fn on_pointer_up(&mut self, at: Point) -> Option<Geometry> {
        if !self.points.is_empty() && self.points.last() != Some(&at) {
            self.points.push(at);
        }
        let points = std::mem::take(&mut self.points);
        if points.len() < 2 {
            return None;
        }
        Some(self.shape(points))
    }

    fn on_style_change(&mut self, style: &Style) {
        self.min_spacing = spacing_for(style);
    }

    fn preview(&self) -> Option<Geometry> {
        if self.points.is_empty() {
            None
        } else {
            Some(self.shape(self.points.clone()))
        }
    }

    fn reset(&mut self) {
        self.points.clear();
    }
}

impl StrokeTool {
    fn shape(&self, points: Vec<Point>) -> Geometry {
        if self.as_path {
            Geometry::Path {
                strokes: vec![points],
            }
        } else {
            Geometry::Polyline { points }
        }
    }
}

/// Drawing tool, tagged by the family of gesture it accepts.
#[derive(Debug, Clone)]
pub enum ToolEditor {
    Point(PointTool),
    Extent(ExtentTool),
    Segment(SegmentTool),
    Stroke(StrokeTool),
}

impl ToolEditor {
    pub fn for_subtype(subtype: Subtype, style: &Style) -> Option<Self> {
        match subtype {
            Subtype::Note | Subtype::FreeText | Subtype::Stamp => {
                Some(ToolEditor::Point(PointTool::default()))
            }
            Subtype::Highlight
            | Subtype::Underline
            | Subtype::StrikeOut
            | Subtype::Square
            | Subtype::Circle
            | Subtype::Signature => Some(ToolEditor::Extent(ExtentTool::default())),
            Subtype::Line | Subtype::Arrow => Some(ToolEditor::Segment(SegmentTool::default())),
            Subtype::Ink => Some(ToolEditor::Stroke(StrokeTool::new(true, style))),
            Subtype::Polygon => Some(ToolEditor::Stroke(StrokeTool::new(false, style))),
            Subtype::Other => None,
        }
    }

    fn gesture(&mut self) -> &mut dyn Gesture {
        match self {
            ToolEditor::Point(tool) => tool,
            ToolEditor::Extent(tool) => tool,
            ToolEditor::Segment(tool) => tool,
            ToolEditor::Stroke(tool) => tool,
        }
    }

    fn preview(&self) -> Option<Geometry> {
        match self {
            ToolEditor::Point(tool) => tool.preview(),
            ToolEditor::Extent(tool) => tool.preview(),
            ToolEditor::Segment(tool) => tool.preview(),
            ToolEditor::Stroke(tool) => tool.preview(),
        }
    }
}

#[derive(Debug, Clone)]
struct DragSession {
    handle: DragHandle,
    origin: Point,
    original: Geometry,
    preview: Geometry,
}

#[derive(Debug, Clone)]
pub struct Editor {
    subtype: Subtype,
    page: u32,
    state: EditorState,
    tool: Option<ToolEditor>,
    style: Style,
    author: String,
    record: Option<AnnotationRecord>,
    drag: Option<DragSession>,
    last_position: Option<Point>,
}

impl Editor {
    /// A drawing editor for a new annotation, waiting in `Idle` for a pointer-down.
    pub fn new(
        subtype: Subtype,
        page: u32,
        style: Style,
        author: impl Into<String>,
    ) -> Result<Self, EditorError> {
        let tool = ToolEditor::for_subtype(subtype, &style).ok_or(EditorError::NoTool(subtype))?;
        Ok(Self {
            subtype,
            page,
            state: EditorState::Idle,
            tool: Some(tool),
            style,
            author: author.into(),
            record: None,
            drag: None,
            last_position: None,
        })
    }

    /// An editor bound to an already committed record.
    pub fn for_record(record: &AnnotationRecord) -> Self {
        Self {
            subtype: record.subtype,
            page: record.page_number,
            state: EditorState::Committed,
            tool: None,
            style: record.style.clone(),
            author: record.title.clone(),
            record: Some(record.clone()),
            drag: None,
            last_position: None,
        }
    }

    pub fn state(&self) -> EditorState {
        self.state
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn subtype(&self) -> Subtype {
        self.subtype
    }

    pub fn style(&self) -> &Style {
        &self.style
    }

    pub fn record_id(&self) -> Option<&str> {
        self.record.as_ref().map(|r| r.id.as_str())
    }

    /// Keeps the bound record in sync with the store without changing state.
    pub fn rebind(&mut self, record: &AnnotationRecord) {
        if self.record_id() == Some(record.id.as_str()) {
            self.page = record.page_number;
            self.style = record.style.clone();
            self.record = Some(record.clone());
        }
    }

    fn resolve(&mut self, event: &PointerEvent, viewport: &Viewport) -> Point {
        match event.position.filter(Point::is_finite) {
            Some(position) => {
                self.last_position = Some(position);
                position
            }
            None => {
                let fallback = self
                    .last_position
                    .unwrap_or_else(|| viewport.screen_center());
                debug!(?fallback, "pointer event without position");
                fallback
            }
        }
    }

    /// Returns true when the editor took ownership of the gesture.
    pub fn pointer_down(&mut self, event: &PointerEvent, viewport: &Viewport) -> bool {
        let at = self.resolve(event, viewport);
        match self.state {
            EditorState::Idle => match self.tool.as_mut() {
                Some(tool) => {
                    tool.gesture().on_pointer_down(at);
                    self.state = EditorState::Active;
                    true
                }
                None => false,
            },
            EditorState::Selected => {
                let Some(record) = &self.record else {
                    return false;
                };
                let screen = to_screen(&record.geometry, viewport).0;
                match hit_handle(&screen, &at, HANDLE_RADIUS) {
                    Some(handle) => {
                        self.drag = Some(DragSession {
                            handle,
                            origin: at,
                            preview: screen.clone(),
                            original: screen,
                        });
                        self.state = EditorState::Editing;
                        true
                    }
                    None => false,
                }
            }
            _ => false,
        }
    }

    /// Advances the gesture and returns the on-screen preview to paint, if any.
    pub fn pointer_move(
        &mut self,
        event: &PointerEvent,
        viewport: &Viewport,
    ) -> Option<ScreenGeometry> {
        let at = self.resolve(event, viewport);
        match self.state {
            EditorState::Active => {
                let tool = self.tool.as_mut()?;
                tool.gesture().on_pointer_move(at);
                tool.preview().map(ScreenGeometry)
            }
            EditorState::Editing => {
                let drag = self.drag.as_mut()?;
                let (dx, dy) = (at.x - drag.origin.x, at.y - drag.origin.y);
                drag.preview = apply_drag(&drag.original, drag.handle, dx, dy);
                Some(ScreenGeometry(drag.preview.clone()))
            }
            _ => None,
        }
    }

    pub fn pointer_up(
        &mut self,
        event: &PointerEvent,
        viewport: &Viewport,
    ) -> Option<EditorEffect> {
        let at = self.resolve(event, viewport);
        match self.state {
            EditorState::Active => self.finish_drawing(at, viewport),
            EditorState::Editing => self.finish_drag(at, viewport),
            _ => None,
        }
    }

    fn finish_drawing(&mut self, at: Point, viewport: &Viewport) -> Option<EditorEffect> {
        let geometry = self.tool.as_mut()?.gesture().on_pointer_up(at);
        let Some(geometry) = geometry else {
            debug!(subtype = ?self.subtype, "degenerate gesture, nothing committed");
            self.state = EditorState::Idle;
            return None;
        };
        let normalized = to_normalized(&ScreenGeometry(geometry), viewport);
        let record = AnnotationRecord::new(
            self.subtype,
            self.page,
            normalized,
            self.style.clone(),
            self.author.clone(),
        );
        self.record = Some(record.clone());
        self.state = EditorState::Committed;
        Some(EditorEffect::Create(record))
    }

    fn finish_drag(&mut self, at: Point, viewport: &Viewport) -> Option<EditorEffect> {
        self.state = EditorState::Committed;
        let drag = self.drag.take()?;
        let (dx, dy) = (at.x - drag.origin.x, at.y - drag.origin.y);
        if dx == 0.0 && dy == 0.0 {
            return None;
        }
        let moved = apply_drag(&drag.original, drag.handle, dx, dy);
        let normalized = to_normalized(&ScreenGeometry(moved), viewport);
        let record = self.record.as_mut()?;
        record.geometry = normalized.clone();
        Some(EditorEffect::Update {
            id: record.id.clone(),
            patch: RecordPatch::geometry(normalized),
        })
    }

    pub fn select(&mut self) -> Result<(), EditorError> {
        match self.state {
            EditorState::Committed | EditorState::Selected => {
                self.state = EditorState::Selected;
                Ok(())
            }
            state => Err(EditorError::InvalidState {
                action: "select",
                state,
            }),
        }
    }

    pub fn deselect(&mut self) -> Result<(), EditorError> {
        match self.state {
            EditorState::Committed | EditorState::Selected => {
                self.state = EditorState::Idle;
                self.record = None;
                self.drag = None;
                Ok(())
            }
            state => Err(EditorError::InvalidState {
                action: "deselect",
                state,
            }),
        }
    }

    pub fn change_style(
        &mut self,
        patch: &StylePatch,
    ) -> Result<Option<EditorEffect>, EditorError> {
        match self.state {
            EditorState::Active => {
                patch.apply(&mut self.style);
                if let Some(tool) = self.tool.as_mut() {
                    tool.gesture().on_style_change(&self.style);
                }
                Ok(None)
            }
            EditorState::Committed | EditorState::Selected | EditorState::Editing => {
                patch.apply(&mut self.style);
                let Some(record) = self.record.as_mut() else {
                    return Ok(None);
                };
                patch.apply(&mut record.style);
                Ok(Some(EditorEffect::Update {
                    id: record.id.clone(),
                    patch: RecordPatch::style(patch.clone()),
                }))
            }
            state => Err(EditorError::InvalidState {
                action: "change style",
                state,
            }),
        }
    }

    /// Moves the selected record by a screen-space delta (arrow keys).
    pub fn nudge(
        &mut self,
        dx: f64,
        dy: f64,
        viewport: &Viewport,
    ) -> Result<Option<EditorEffect>, EditorError> {
        if self.state != EditorState::Selected {
            return Err(EditorError::InvalidState {
                action: "nudge",
                state: self.state,
            });
        }
        let Some(record) = self.record.as_mut() else {
            return Ok(None);
        };
        if dx == 0.0 && dy == 0.0 {
            return Ok(None);
        }
        record.geometry = nudged(&record.geometry, viewport, dx, dy);
        Ok(Some(EditorEffect::Update {
            id: record.id.clone(),
            patch: RecordPatch::geometry(record.geometry.clone()),
        }))
    }

    /// Deletes the bound record, if any, and ends the editor.
    pub fn delete(&mut self) -> Option<EditorEffect> {
        if self.state == EditorState::Destroyed {
            return None;
        }
        let effect = self
            .record
            .take()
            .map(|record| EditorEffect::Delete(record.id));
        self.destroy();
        effect
    }

    /// Ends the editor without producing any store effect.
    pub fn destroy(&mut self) {
        self.state = EditorState::Destroyed;
        self.drag = None;
        if let Some(tool) = self.tool.as_mut() {
            tool.gesture().reset();
        }
    }

    pub fn preview(&self) -> Option<ScreenGeometry> {
        match self.state {
            EditorState::Active => self.tool.as_ref()?.preview().map(ScreenGeometry),
            EditorState::Editing => self.drag.as_ref().map(|d| ScreenGeometry(d.preview.clone())),
            _ => None,
        }
    }
}

pub fn hit_handle(geometry: &Geometry, at: &Point, radius: f64) -> Option<DragHandle> {
    match geometry {
        Geometry::Rect(rect) => {
            if let Some(index) = rect.corners().iter().position(|c| c.distance_to(at) <= radius) {
                return Some(DragHandle::Corner(index));
            }
        }
        Geometry::Polyline { points } => {
            if let Some(index) = points.iter().position(|p| p.distance_to(at) <= radius) {
                return Some(DragHandle::Vertex(index));
            }
        }
        Geometry::Point(_) | Geometry::Path { .. } => {}
    }
    geometry.hit_test(at, radius).then_some(DragHandle::Body)
}

pub fn apply_drag(geometry: &Geometry, handle: DragHandle, dx: f64, dy: f64) -> Geometry {
    match (geometry, handle) {
        (_, DragHandle::Body) => geometry.translate(dx, dy),
        (Geometry::Rect(rect), DragHandle::Corner(index)) if index < 4 => {
            let corners = rect.corners();
            let moved = corners[index].offset(dx, dy);
            Geometry::Rect(Rect::from_corners(moved, corners[(index + 2) % 4]))
        }
        (Geometry::Polyline { points }, DragHandle::Vertex(index)) if index < points.len() => {
            let mut points = points.clone();
            points[index] = points[index].offset(dx, dy);
            Geometry::Polyline { points }
        }
        _ => geometry.clone(),
    }
}

/// Normalized geometry for a record moved wholesale by a screen-space delta.
fn nudged(
    geometry: &NormalizedGeometry,
    viewport: &Viewport,
    dx: f64,
    dy: f64,
) -> NormalizedGeometry {
    let screen = to_screen(geometry, viewport);
    to_normalized(&ScreenGeometry(screen.0.translate(dx, dy)), viewport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rotation;

    fn viewport(scale: f64) -> Viewport {
        Viewport::new(scale, Rotation::R0, 600.0, 800.0).unwrap()
    }

    fn drawer(subtype: Subtype) -> Editor {
        Editor::new(subtype, 3, Style::default(), "alice").unwrap()
    }

    fn created(effect: Option<EditorEffect>) -> AnnotationRecord {
        match effect {
            Some(EditorEffect::Create(record)) => record,
            other => panic!("expected create, got {:?}", other),
        }
    }

    #[test]
    fn note_commits_on_pointer_up_without_moves() {
        let vp = viewport(2.0);
        let mut editor = drawer(Subtype::Note);
        assert!(editor.pointer_down(&PointerEvent::at(40.0, 60.0), &vp));
        assert_eq!(editor.state(), EditorState::Active);

        let record = created(editor.pointer_up(&PointerEvent::at(40.0, 60.0), &vp));
        assert_eq!(record.page_number, 3);
        assert_eq!(record.title, "alice");
        assert_eq!(
            record.geometry,
            NormalizedGeometry(Geometry::Point(Point::new(20.0, 30.0)))
        );
        assert_eq!(editor.state(), EditorState::Committed);
        assert_eq!(editor.record_id(), Some(record.id.as_str()));
    }

    #[test]
    fn zero_size_highlight_is_suppressed() {
        let vp = viewport(1.0);
        let mut editor = drawer(Subtype::Highlight);
        editor.pointer_down(&PointerEvent::at(10.0, 10.0), &vp);
        editor.pointer_move(&PointerEvent::at(10.0, 10.0), &vp);
        assert_eq!(editor.pointer_up(&PointerEvent::at(10.0, 10.0), &vp), None);
        assert_eq!(editor.state(), EditorState::Idle);
        assert_eq!(editor.record_id(), None);
    }

    #[test]
    fn square_drag_is_normalized_by_zoom() {
        let vp = viewport(2.0);
        let mut editor = drawer(Subtype::Square);
        editor.pointer_down(&PointerEvent::at(60.0, 20.0), &vp);
        let preview = editor.pointer_move(&PointerEvent::at(30.0, 50.0), &vp).unwrap();
        assert_eq!(
            preview.0,
            Geometry::Rect(Rect::from_corners(Point::new(30.0, 20.0), Point::new(60.0, 50.0)))
        );

        let record = created(editor.pointer_up(&PointerEvent::at(20.0, 60.0), &vp));
        assert_eq!(
            record.geometry.0,
            Geometry::Rect(Rect::from_corners(Point::new(10.0, 10.0), Point::new(30.0, 30.0)))
        );
    }

    #[test]
    fn freehand_accumulates_points_and_skips_jitter() {
        let vp = viewport(1.0);
        let mut editor = drawer(Subtype::Ink);
        editor.pointer_down(&PointerEvent::at(0.0, 0.0), &vp);
        editor.pointer_move(&PointerEvent::at(0.2, 0.0), &vp);
        editor.pointer_move(&PointerEvent::at(5.0, 0.0), &vp);
        editor.pointer_move(&PointerEvent::at(10.0, 5.0), &vp);
        let record = created(editor.pointer_up(&PointerEvent::at(12.0, 8.0), &vp));
        match record.geometry.0 {
            Geometry::Path { strokes } => {
                assert_eq!(strokes.len(), 1);
                assert_eq!(
                    strokes[0],
                    vec![
                        Point::new(0.0, 0.0),
                        Point::new(5.0, 0.0),
                        Point::new(10.0, 5.0),
                        Point::new(12.0, 8.0)
                    ]
                );
            }
            other => panic!("unexpected geometry {:?}", other),
        }
    }

    #[test]
    fn single_point_stroke_is_degenerate() {
        let vp = viewport(1.0);
        let mut editor = drawer(Subtype::Ink);
        editor.pointer_down(&PointerEvent::at(4.0, 4.0), &vp);
        assert_eq!(editor.pointer_up(&PointerEvent::at(4.0, 4.0), &vp), None);
        assert_eq!(editor.state(), EditorState::Idle);
    }

    #[test]
    fn missing_positions_fall_back_to_last_then_center() {
        let vp = viewport(1.0);
        let mut note = drawer(Subtype::Note);
        note.pointer_down(&PointerEvent::without_position(), &vp);
        let record = created(note.pointer_up(&PointerEvent::without_position(), &vp));
        assert_eq!(record.geometry.0, Geometry::Point(Point::new(300.0, 400.0)));

        let mut line = drawer(Subtype::Line);
        line.pointer_down(&PointerEvent::at(10.0, 10.0), &vp);
        line.pointer_move(&PointerEvent::at(50.0, 10.0), &vp);
        let record = created(line.pointer_up(&PointerEvent::without_position(), &vp));
        assert_eq!(
            record.geometry.0,
            Geometry::Polyline {
                points: vec![Point::new(10.0, 10.0), Point::new(50.0, 10.0)]
            }
        );
    }

    #[test]
    fn selected_shape_updates_store_only_on_release() {
        let vp = viewport(2.0);
        let mut record = AnnotationRecord::new(
            Subtype::Square,
            1,
            NormalizedGeometry(Geometry::Rect(Rect::from_corners(
                Point::new(10.0, 10.0),
                Point::new(30.0, 30.0),
            ))),
            Style::default(),
            "bob",
        );
        record.id = "sq".into();
        let mut editor = Editor::for_record(&record);
        editor.select().unwrap();

        // bottom-right corner sits at (60, 60) on screen
        assert!(editor.pointer_down(&PointerEvent::at(61.0, 59.0), &vp));
        assert_eq!(editor.state(), EditorState::Editing);
        let preview = editor.pointer_move(&PointerEvent::at(81.0, 79.0), &vp).unwrap();
        assert_eq!(
            preview.0,
            Geometry::Rect(Rect::from_corners(Point::new(20.0, 20.0), Point::new(80.0, 80.0)))
        );

        let effect = editor.pointer_up(&PointerEvent::at(81.0, 79.0), &vp);
        assert_eq!(
            effect,
            Some(EditorEffect::Update {
                id: "sq".into(),
                patch: RecordPatch::geometry(NormalizedGeometry(Geometry::Rect(
                    Rect::from_corners(Point::new(10.0, 10.0), Point::new(40.0, 40.0))
                ))),
            })
        );
        assert_eq!(editor.state(), EditorState::Committed);
    }

    #[test]
    fn click_without_drag_produces_no_update() {
        let vp = viewport(1.0);
        let mut record = AnnotationRecord::new(
            Subtype::Note,
            1,
            NormalizedGeometry(Geometry::Point(Point::new(5.0, 5.0))),
            Style::default(),
            "bob",
        );
        record.id = "n".into();
        let mut editor = Editor::for_record(&record);
        editor.select().unwrap();
        assert!(editor.pointer_down(&PointerEvent::at(5.0, 5.0), &vp));
        assert_eq!(editor.pointer_up(&PointerEvent::at(5.0, 5.0), &vp), None);
        assert_eq!(editor.state(), EditorState::Committed);
    }

    #[test]
    fn style_change_is_rejected_when_idle() {
        let mut editor = drawer(Subtype::Square);
        let patch = StylePatch {
            color: Some("#000000".into()),
            ..StylePatch::default()
        };
        assert_eq!(
            editor.change_style(&patch),
            Err(EditorError::InvalidState {
                action: "change style",
                state: EditorState::Idle
            })
        );
    }

    #[test]
    fn style_change_on_committed_record_emits_update() {
        let vp = viewport(1.0);
        let mut editor = drawer(Subtype::Circle);
        editor.pointer_down(&PointerEvent::at(0.0, 0.0), &vp);
        let record = created(editor.pointer_up(&PointerEvent::at(20.0, 20.0), &vp));
        let patch = StylePatch {
            stroke_width: Some(4.0),
            ..StylePatch::default()
        };
        assert_eq!(
            editor.change_style(&patch).unwrap(),
            Some(EditorEffect::Update {
                id: record.id,
                patch: RecordPatch::style(patch.clone()),
            })
        );
    }

    #[test]
    fn delete_emits_effect_and_is_terminal() {
        let vp = viewport(1.0);
        let mut editor = drawer(Subtype::Stamp);
        editor.pointer_down(&PointerEvent::at(1.0, 1.0), &vp);
        let record = created(editor.pointer_up(&PointerEvent::at(1.0, 1.0), &vp));
        assert_eq!(editor.delete(), Some(EditorEffect::Delete(record.id)));
        assert_eq!(editor.state(), EditorState::Destroyed);
        assert_eq!(editor.delete(), None);
        assert!(!editor.pointer_down(&PointerEvent::at(1.0, 1.0), &vp));
        assert!(editor.select().is_err());
    }

    #[test]
    fn other_subtype_has_no_tool() {
        assert!(matches!(
            Editor::new(Subtype::Other, 1, Style::default(), "x"),
            Err(EditorError::NoTool(Subtype::Other))
        ));
    }

    #[test]
    fn nudge_moves_in_screen_space() {
        let vp = Viewport::new(2.0, Rotation::R180, 600.0, 800.0).unwrap();
        let original = NormalizedGeometry(Geometry::Point(Point::new(100.0, 100.0)));
        let moved = nudged(&original, &vp, 20.0, 0.0);
        assert_eq!(moved.0, Geometry::Point(Point::new(90.0, 100.0)));
    }

    #[test]
    fn nudge_requires_a_selection() {
        let vp = viewport(1.0);
        let record = AnnotationRecord::new(
            Subtype::Note,
            3,
            NormalizedGeometry(Geometry::Point(Point::new(10.0, 10.0))),
            Style::default(),
            "alice",
        );
        let mut editor = Editor::for_record(&record);
        assert!(matches!(
            editor.nudge(1.0, 0.0, &vp),
            Err(EditorError::InvalidState { action: "nudge", .. })
        ));

        editor.select().unwrap();
        assert_eq!(editor.nudge(0.0, 0.0, &vp), Ok(None));
        match editor.nudge(5.0, -2.0, &vp).unwrap() {
            Some(EditorEffect::Update { id, patch }) => {
                assert_eq!(id, record.id);
                assert_eq!(
                    patch.geometry.map(|g| g.0),
                    Some(Geometry::Point(Point::new(15.0, 8.0)))
                );
            }
            other => panic!("unexpected effect {other:?}"),
        }
        assert_eq!(editor.state(), EditorState::Selected);
    }
}
