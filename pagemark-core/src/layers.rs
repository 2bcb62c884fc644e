//! Per-page overlay surfaces and gesture routing.
//!
//! The host viewer virtualizes pages: it creates and tears down page surfaces as the
//! user scrolls. Every (re)created surface is hydrated from the store.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::editor::{Editor, EditorEffect, EditorError, EditorState, PointerEvent, HANDLE_RADIUS};
use crate::geometry::{to_screen, Point, ScreenGeometry, Viewport};
use crate::model::{AnnotationId, AnnotationRecord, Style, StylePatch, Subtype};
use crate::store::{
    AnnotationPanel, AnnotationStore, ListenerId, PanelListener, SharedStore, StoreError,
    StoreEvent, StoreListener,
};

#[derive(Debug, Error)]
pub enum LayerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Editor(#[from] EditorError),
    #[error("annotation {0} not found")]
    UnknownAnnotation(AnnotationId),
}

/// A shape ready to paint; `id` is `None` for an in-progress gesture.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedShape {
    pub id: Option<AnnotationId>,
    pub subtype: Subtype,
    pub geometry: ScreenGeometry,
    pub style: Style,
    pub selected: bool,
}

/// The viewer's overlay canvas for one page.
pub trait OverlaySurface: Send {
    fn clear(&mut self);
    fn draw(&mut self, shape: &RenderedShape) -> anyhow::Result<()>;
    fn draw_preview(&mut self, shape: Option<&RenderedShape>);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HydrationReport {
    pub drawn: usize,
    pub skipped: usize,
}

struct PageLayer {
    surface: Box<dyn OverlaySurface>,
    viewport: Viewport,
}

#[derive(Debug, Clone)]
struct ArmedTool {
    subtype: Subtype,
    style: Style,
}

#[derive(Default)]
struct LayerState {
    pages: HashMap<u32, PageLayer>,
    armed: Option<ArmedTool>,
    editor: Option<Editor>,
}

impl LayerState {
    fn selected_id(&self) -> Option<&str> {
        self.editor
            .as_ref()
            .filter(|e| matches!(e.state(), EditorState::Selected | EditorState::Editing))
            .and_then(Editor::record_id)
    }

    fn paint(&mut self, page: u32, store: &AnnotationStore) -> HydrationReport {
        let selected = self.selected_id().map(str::to_owned);
        match self.pages.get_mut(&page) {
            Some(layer) => paint_layer(layer, page, store, selected.as_deref()),
            None => HydrationReport::default(),
        }
    }

    fn paint_all(&mut self, store: &AnnotationStore) {
        let mut pages: Vec<u32> = self.pages.keys().copied().collect();
        pages.sort_unstable();
        for page in pages {
            self.paint(page, store);
        }
    }
}

fn paint_layer(
    layer: &mut PageLayer,
    page: u32,
    store: &AnnotationStore,
    selected: Option<&str>,
) -> HydrationReport {
    let mut report = HydrationReport::default();
    layer.surface.clear();
    for record in store.records_on_page(page) {
        if let Err(err) = record.geometry.0.validate() {
            warn!(id = %record.id, page, %err, "skipping annotation with corrupt geometry");
            report.skipped += 1;
            continue;
        }
        let shape = RenderedShape {
            id: Some(record.id.clone()),
            subtype: record.subtype,
            geometry: to_screen(&record.geometry, &layer.viewport),
            style: record.style.clone(),
            selected: selected == Some(record.id.as_str()),
        };
        match layer.surface.draw(&shape) {
            Ok(()) => report.drawn += 1,
            Err(err) => {
                warn!(id = %record.id, page, ?err, "failed to draw annotation");
                report.skipped += 1;
            }
        }
    }
    report
}

pub struct CanvasLayerManager {
    store: SharedStore,
    author: String,
    state: Mutex<LayerState>,
    panels: Mutex<Vec<Arc<dyn AnnotationPanel>>>,
    listener: Mutex<Option<ListenerId>>,
}

struct LayerListener(Weak<CanvasLayerManager>);

impl StoreListener for LayerListener {
    fn on_store_event(&self, event: &StoreEvent, store: &AnnotationStore) {
        if let Some(manager) = self.0.upgrade() {
            manager.handle_store_event(event, store);
        }
    }
}

impl CanvasLayerManager {
    /// Creates a manager and subscribes it to `store`.
    pub fn attach(store: SharedStore, author: impl Into<String>) -> Arc<Self> {
        let manager = Arc::new(Self {
            store: Arc::clone(&store),
            author: author.into(),
            state: Mutex::new(LayerState::default()),
            panels: Mutex::new(Vec::new()),
            listener: Mutex::new(None),
        });
        let id = store
            .lock()
            .subscribe(Arc::new(LayerListener(Arc::downgrade(&manager))));
        *manager.listener.lock() = Some(id);
        manager
    }

    pub fn detach(&self) {
        if let Some(id) = self.listener.lock().take() {
            self.store.lock().unsubscribe(id);
        }
    }

    /// Registers a UI panel for store callbacks and selection notifications.
    pub fn register_panel(&self, panel: Arc<dyn AnnotationPanel>) -> ListenerId {
        self.panels.lock().push(Arc::clone(&panel));
        self.store.lock().subscribe(Arc::new(PanelListener(panel)))
    }

    pub fn mounted_pages(&self) -> Vec<u32> {
        let mut pages: Vec<u32> = self.state.lock().pages.keys().copied().collect();
        pages.sort_unstable();
        pages
    }

    pub fn editor_state(&self) -> Option<EditorState> {
        self.state.lock().editor.as_ref().map(Editor::state)
    }

    pub fn on_page_rendered(
        &self,
        page: u32,
        surface: Box<dyn OverlaySurface>,
        viewport: Viewport,
        css_transform: bool,
    ) -> HydrationReport {
        let store = self.store.lock();
        let mut state = self.state.lock();

        if css_transform {
            if let Some(layer) = state.pages.get_mut(&page) {
                debug!(page, "css-transformed render, keeping overlay");
                layer.viewport = viewport;
                return HydrationReport::default();
            }
        }

        let stale_gesture = state.editor.as_ref().is_some_and(|e| {
            e.page() == page && matches!(e.state(), EditorState::Active | EditorState::Editing)
        });
        if stale_gesture {
            debug!(page, "page re-rendered mid-gesture, dropping gesture");
            if let Some(mut editor) = state.editor.take() {
                editor.destroy();
            }
        }

        state.pages.insert(page, PageLayer { surface, viewport });
        let report = state.paint(page, &store);
        debug!(page, drawn = report.drawn, skipped = report.skipped, "page hydrated");
        report
    }

    pub fn on_page_destroyed(&self, page: u32) {
        let mut state = self.state.lock();
        state.pages.remove(&page);
        if state.editor.as_ref().is_some_and(|e| e.page() == page) {
            if let Some(mut editor) = state.editor.take() {
                editor.destroy();
            }
        }
    }

    fn handle_store_event(&self, event: &StoreEvent, store: &AnnotationStore) {
        let mut state = self.state.lock();
        match event {
            StoreEvent::Updated { record, .. } => {
                if let Some(editor) = state.editor.as_mut() {
                    editor.rebind(record);
                }
            }
            StoreEvent::Deleted(record) => {
                if state.editor.as_ref().and_then(Editor::record_id) == Some(record.id.as_str()) {
                    if let Some(mut editor) = state.editor.take() {
                        editor.destroy();
                    }
                }
            }
            StoreEvent::Replaced { .. } | StoreEvent::Cleared { .. } => {
                if let Some(mut editor) = state.editor.take() {
                    editor.destroy();
                }
            }
            StoreEvent::Added(_) => {}
        }

        match event.affected_pages() {
            Some(pages) => {
                for page in pages {
                    state.paint(page, store);
                }
            }
            None => state.paint_all(store),
        }
    }

    pub fn arm_tool(&self, subtype: Subtype, style: Style) -> Result<(), LayerError> {
        Editor::new(subtype, 1, style.clone(), self.author.clone())?;
        let mut state = self.state.lock();
        state.armed = Some(ArmedTool { subtype, style });
        Ok(())
    }

    pub fn disarm_tool(&self) {
        self.state.lock().armed = None;
    }

    /// Returns true when the pointer-down started a gesture.
    pub fn pointer_down(&self, page: u32, event: &PointerEvent) -> bool {
        let mut state = self.state.lock();
        let Some(viewport) = state.pages.get(&page).map(|l| l.viewport) else {
            return false;
        };

        if let Some(editor) = state.editor.as_mut().filter(|e| e.page() == page) {
            if editor.pointer_down(event, &viewport) {
                return true;
            }
        }

        let Some(armed) = state.armed.clone() else {
            return false;
        };
        let Ok(mut editor) = Editor::new(armed.subtype, page, armed.style, self.author.clone())
        else {
            return false;
        };
        let started = editor.pointer_down(event, &viewport);
        if started {
            state.editor = Some(editor);
        }
        started
    }

    pub fn pointer_move(&self, page: u32, event: &PointerEvent) {
        let mut state = self.state.lock();
        let Some(viewport) = state.pages.get(&page).map(|l| l.viewport) else {
            return;
        };
        let Some(editor) = state.editor.as_mut().filter(|e| e.page() == page) else {
            return;
        };
        let Some(geometry) = editor.pointer_move(event, &viewport) else {
            return;
        };
        let preview = RenderedShape {
            id: editor.record_id().map(str::to_owned),
            subtype: editor.subtype(),
            geometry,
            style: editor.style().clone(),
            selected: true,
        };
        if let Some(layer) = state.pages.get_mut(&page) {
            layer.surface.draw_preview(Some(&preview));
        }
    }

    /// Finishes the gesture on `page` and applies its effect to the store.
    pub fn pointer_up(
        &self,
        page: u32,
        event: &PointerEvent,
    ) -> Result<Option<EditorEffect>, LayerError> {
        let effect = {
            let mut state = self.state.lock();
            let Some(viewport) = state.pages.get(&page).map(|l| l.viewport) else {
                return Ok(None);
            };
            let effect = match state.editor.as_mut().filter(|e| e.page() == page) {
                Some(editor) => editor.pointer_up(event, &viewport),
                None => None,
            };
            if let Some(layer) = state.pages.get_mut(&page) {
                layer.surface.draw_preview(None);
            }
            effect
        };

        if let Some(effect) = &effect {
            self.apply_effect(effect.clone())?;
        }
        Ok(effect)
    }

    pub fn select(&self, id: &str, explicit_click: bool) -> Result<(), LayerError> {
        let record = {
            let store = self.store.lock();
            let record = store
                .get(id)
                .cloned()
                .ok_or_else(|| LayerError::UnknownAnnotation(id.to_string()))?;
            let mut state = self.state.lock();
            let previous_page = state.editor.as_ref().map(Editor::page);
            let mut editor = Editor::for_record(&record);
            editor.select()?;
            state.editor = Some(editor);
            if let Some(page) = previous_page.filter(|p| *p != record.page_number) {
                state.paint(page, &store);
            }
            state.paint(record.page_number, &store);
            record
        };
        self.notify_select(&record, explicit_click);
        Ok(())
    }

    /// Selects the topmost record under a screen point of `page`.
    pub fn select_at(&self, page: u32, point: Point) -> Result<Option<AnnotationId>, LayerError> {
        let hit = {
            let store = self.store.lock();
            let state = self.state.lock();
            let Some(viewport) = state.pages.get(&page).map(|l| l.viewport) else {
                return Ok(None);
            };
            let target = viewport.point_to_normalized(point);
            let tolerance = viewport.length_to_normalized(HANDLE_RADIUS);
            store
                .records_on_page(page)
                .filter(|r| r.geometry.0.validate().is_ok())
                .filter(|r| r.geometry.0.hit_test(&target, tolerance))
                .last()
                .map(|r| r.id.clone())
        };
        match hit {
            Some(id) => {
                self.select(&id, true)?;
                Ok(Some(id))
            }
            None => {
                self.deselect();
                Ok(None)
            }
        }
    }

    pub fn deselect(&self) {
        let store = self.store.lock();
        let mut state = self.state.lock();
        if let Some(mut editor) = state.editor.take() {
            let page = editor.page();
            if editor.deselect().is_err() {
                editor.destroy();
            }
            state.paint(page, &store);
        }
    }

    pub fn change_style(&self, patch: &StylePatch) -> Result<(), LayerError> {
        let effect = {
            let mut state = self.state.lock();
            match state.editor.as_mut() {
                Some(editor) if editor.state() != EditorState::Idle => editor.change_style(patch)?,
                _ => {
                    if let Some(armed) = state.armed.as_mut() {
                        patch.apply(&mut armed.style);
                    }
                    None
                }
            }
        };
        if let Some(effect) = effect {
            self.apply_effect(effect)?;
        }
        Ok(())
    }

    /// Moves the selected annotation by a screen-space delta on its page.
    pub fn nudge_selected(&self, dx: f64, dy: f64) -> Result<bool, LayerError> {
        let effect = {
            let mut state = self.state.lock();
            let Some(page) = state.editor.as_ref().map(Editor::page) else {
                return Ok(false);
            };
            let Some(viewport) = state.pages.get(&page).map(|l| l.viewport) else {
                return Ok(false);
            };
            match state.editor.as_mut() {
                Some(editor) => editor.nudge(dx, dy, &viewport)?,
                None => None,
            }
        };
        match effect {
            Some(effect) => {
                self.apply_effect(effect)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn delete_selected(&self) -> Result<Option<AnnotationId>, LayerError> {
        let effect = {
            let mut state = self.state.lock();
            state.editor.take().and_then(|mut editor| editor.delete())
        };
        match effect {
            Some(EditorEffect::Delete(id)) => {
                self.store.lock().delete(&id)?;
                Ok(Some(id))
            }
            _ => Ok(None),
        }
    }

    fn apply_effect(&self, effect: EditorEffect) -> Result<(), StoreError> {
        let mut store = self.store.lock();
        match effect {
            EditorEffect::Create(record) => store.add(record),
            EditorEffect::Update { id, patch } => store.update(&id, patch).map(|_| ()),
            EditorEffect::Delete(id) => store.delete(&id).map(|_| ()),
        }
    }

    fn notify_select(&self, record: &AnnotationRecord, explicit_click: bool) {
        let panels: Vec<_> = self.panels.lock().iter().cloned().collect();
        for panel in panels {
            panel.on_select(record, explicit_click);
        }
    }
}
