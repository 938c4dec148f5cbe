//! The seam between the object graph and the platform toolkit.
//!
//! [`NativeBackend`] is only ever called from the UI thread, by the manager,
//! while the critical section is held. [`HeadlessBackend`] implements it in
//! memory and keeps the last few frames it presented; a [`HeadlessProbe`] cloned off
//! it lets other threads observe that state and script failures.

use crate::model::{Bitmap, Caret, ControlKind, Point, Rect, ScrollState, Size, WindowKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Opaque id of a native object (window, control, menu, bar).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NativeId(pub u64);

impl fmt::Display for NativeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "native:{}", self.0)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{call} failed: {message}")]
pub struct NativeError {
    pub call: &'static str,
    pub message: String,
}

impl NativeError {
    pub fn new(call: &'static str, message: impl Into<String>) -> Self {
        Self {
            call,
            message: message.into(),
        }
    }
}

/// What the backend needs to build one control peer.
#[derive(Debug, Clone, Copy)]
pub struct ControlSpec<'a> {
    pub id: u16,
    pub kind: ControlKind,
    pub text: &'a str,
    /// Window client coordinates.
    pub rect: Rect,
    pub items: &'a [String],
}

pub trait NativeBackend {
    fn create_window(
        &mut self,
        kind: WindowKind,
        title: &str,
        position: Point,
        size: Size,
    ) -> Result<NativeId, NativeError>;

    /// Destroy a native object together with everything parented to it.
    fn destroy(&mut self, id: NativeId) -> Result<(), NativeError>;

    fn set_text(&mut self, id: NativeId, text: &str) -> Result<(), NativeError>;

    fn text(&self, id: NativeId) -> Result<String, NativeError>;

    /// Bring a window to the front and give it the keyboard.
    fn activate(&mut self, window: NativeId) -> Result<(), NativeError>;

    fn set_caret(&mut self, window: NativeId, caret: &Caret) -> Result<(), NativeError>;

    fn create_control(
        &mut self,
        parent: NativeId,
        spec: &ControlSpec<'_>,
    ) -> Result<NativeId, NativeError>;

    fn set_focus(&mut self, id: NativeId) -> Result<(), NativeError>;

    fn focused(&self) -> Option<NativeId>;

    fn selected_item_text(&self, id: NativeId) -> Result<Option<String>, NativeError>;

    fn clear_items(&mut self, id: NativeId) -> Result<(), NativeError>;

    fn item_count(&self, id: NativeId) -> Result<usize, NativeError>;

    fn create_menu(
        &mut self,
        window: NativeId,
        items: &[ControlSpec<'_>],
    ) -> Result<NativeId, NativeError>;

    fn insert_menu_item(
        &mut self,
        menu: NativeId,
        position: usize,
        item: &ControlSpec<'_>,
    ) -> Result<(), NativeError>;

    fn remove_menu_item(&mut self, menu: NativeId, position: usize) -> Result<(), NativeError>;

    /// Show a context menu at a point of a window. Returns once the menu is
    /// up; the choice arrives later as input.
    fn popup_menu(
        &mut self,
        window: NativeId,
        at: Point,
        items: &[ControlSpec<'_>],
    ) -> Result<(), NativeError>;

    fn create_toolbar(&mut self, window: NativeId) -> Result<NativeId, NativeError>;

    fn create_statusbar(&mut self, window: NativeId, text: &str) -> Result<NativeId, NativeError>;

    fn set_scroll(&mut self, window: NativeId, scroll: &ScrollState) -> Result<(), NativeError>;

    /// Blit a bitmap into a window's client area.
    fn present(&mut self, window: NativeId, at: Point, bitmap: &Bitmap) -> Result<(), NativeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeClass {
    Window(WindowKind),
    Control(ControlKind),
    Menu,
    Toolbar,
    StatusBar,
}

#[derive(Debug, Clone)]
struct NativeObject {
    class: NativeClass,
    parent: Option<NativeId>,
    text: String,
    items: Vec<String>,
    selected: Option<usize>,
}

/// One bitmap presented to a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub window: NativeId,
    pub at: Point,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u32>,
}

impl Frame {
    /// Every pixel has the same value.
    pub fn is_uniform(&self) -> bool {
        self.pixels.windows(2).all(|w| w[0] == w[1])
    }
}

/// The last context menu a headless backend showed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Popup {
    pub window: NativeId,
    pub at: Point,
    pub items: Vec<String>,
}

/// Frames a headless backend keeps unless told otherwise.
pub const DEFAULT_FRAME_HISTORY: usize = 8;

struct HeadlessState {
    next_id: u64,
    objects: HashMap<NativeId, NativeObject>,
    focus: Option<NativeId>,
    active: Option<NativeId>,
    carets: HashMap<NativeId, Caret>,
    popup: Option<Popup>,
    scroll: HashMap<NativeId, ScrollState>,
    frames: VecDeque<Frame>,
    frame_history: usize,
    presented: usize,
    failures: HashMap<&'static str, u32>,
    calls: u64,
}

impl Default for HeadlessState {
    fn default() -> Self {
        Self {
            next_id: 0,
            objects: HashMap::new(),
            focus: None,
            active: None,
            carets: HashMap::new(),
            popup: None,
            scroll: HashMap::new(),
            frames: VecDeque::new(),
            frame_history: DEFAULT_FRAME_HISTORY,
            presented: 0,
            failures: HashMap::new(),
            calls: 0,
        }
    }
}

impl HeadlessState {
    fn enter(&mut self, call: &'static str) -> Result<(), NativeError> {
        self.calls += 1;
        if let Some(remaining) = self.failures.get_mut(call) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(());
            }
            self.failures.remove(call);
            tracing::debug!("headless: injected failure in {}", call);
            return Err(NativeError::new(call, "injected failure"));
        }
        Ok(())
    }

    fn insert(&mut self, class: NativeClass, parent: Option<NativeId>, text: &str) -> NativeId {
        self.next_id += 1;
        let id = NativeId(self.next_id);
        self.objects.insert(
            id,
            NativeObject {
                class,
                parent,
                text: text.to_string(),
                items: Vec::new(),
                selected: None,
            },
        );
        id
    }

    fn object(&self, call: &'static str, id: NativeId) -> Result<&NativeObject, NativeError> {
        self.objects
            .get(&id)
            .ok_or_else(|| NativeError::new(call, format!("no such object {}", id)))
    }

    fn object_mut(
        &mut self,
        call: &'static str,
        id: NativeId,
    ) -> Result<&mut NativeObject, NativeError> {
        self.objects
            .get_mut(&id)
            .ok_or_else(|| NativeError::new(call, format!("no such object {}", id)))
    }

    fn children(&self, id: NativeId) -> Vec<NativeId> {
        let mut children: Vec<_> = self
            .objects
            .iter()
            .filter(|(_, o)| o.parent == Some(id))
            .map(|(child, _)| *child)
            .collect();
        children.sort();
        children
    }

    fn remove_tree(&mut self, id: NativeId) {
        for child in self.children(id) {
            self.remove_tree(child);
        }
        self.objects.remove(&id);
        self.scroll.remove(&id);
        self.carets.remove(&id);
        if self.focus == Some(id) {
            self.focus = None;
        }
        if self.active == Some(id) {
            self.active = None;
        }
    }
}

/// In-memory backend. Cheap to clone into a [`HeadlessProbe`].
#[derive(Default)]
pub struct HeadlessBackend {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `frames` presented frames (at least one); older ones
    /// are dropped as new ones arrive.
    pub fn with_frame_history(self, frames: usize) -> Self {
        self.state.lock().frame_history = frames.max(1);
        self
    }

    pub fn probe(&self) -> HeadlessProbe {
        HeadlessProbe {
            state: self.state.clone(),
        }
    }
}

impl NativeBackend for HeadlessBackend {
    fn create_window(
        &mut self,
        kind: WindowKind,
        title: &str,
        _position: Point,
        _size: Size,
    ) -> Result<NativeId, NativeError> {
        let mut state = self.state.lock();
        state.enter("create_window")?;
        Ok(state.insert(NativeClass::Window(kind), None, title))
    }

    fn destroy(&mut self, id: NativeId) -> Result<(), NativeError> {
        let mut state = self.state.lock();
        state.enter("destroy")?;
        state.object("destroy", id)?;
        state.remove_tree(id);
        Ok(())
    }

    fn set_text(&mut self, id: NativeId, text: &str) -> Result<(), NativeError> {
        let mut state = self.state.lock();
        state.enter("set_text")?;
        state.object_mut("set_text", id)?.text = text.to_string();
        Ok(())
    }

    fn activate(&mut self, window: NativeId) -> Result<(), NativeError> {
        let mut state = self.state.lock();
        state.enter("activate")?;
        state.object("activate", window)?;
        state.active = Some(window);
        Ok(())
    }

    fn set_caret(&mut self, window: NativeId, caret: &Caret) -> Result<(), NativeError> {
        let mut state = self.state.lock();
        state.enter("set_caret")?;
        state.object("set_caret", window)?;
        state.carets.insert(window, *caret);
        Ok(())
    }

    fn text(&self, id: NativeId) -> Result<String, NativeError> {
        let mut state = self.state.lock();
        state.enter("text")?;
        Ok(state.object("text", id)?.text.clone())
    }

    fn create_control(
        &mut self,
        parent: NativeId,
        spec: &ControlSpec<'_>,
    ) -> Result<NativeId, NativeError> {
        let mut state = self.state.lock();
        state.enter("create_control")?;
        state.object("create_control", parent)?;
        let id = state.insert(NativeClass::Control(spec.kind), Some(parent), spec.text);
        if let Some(object) = state.objects.get_mut(&id) {
            object.items = spec.items.to_vec();
        }
        Ok(id)
    }

    fn set_focus(&mut self, id: NativeId) -> Result<(), NativeError> {
        let mut state = self.state.lock();
        state.enter("set_focus")?;
        state.object("set_focus", id)?;
        state.focus = Some(id);
        Ok(())
    }

    fn focused(&self) -> Option<NativeId> {
        self.state.lock().focus
    }

    fn selected_item_text(&self, id: NativeId) -> Result<Option<String>, NativeError> {
        let mut state = self.state.lock();
        state.enter("selected_item_text")?;
        let object = state.object("selected_item_text", id)?;
        Ok(object
            .selected
            .and_then(|i| object.items.get(i))
            .cloned())
    }

    fn clear_items(&mut self, id: NativeId) -> Result<(), NativeError> {
        let mut state = self.state.lock();
        state.enter("clear_items")?;
        let object = state.object_mut("clear_items", id)?;
        object.items.clear();
        object.selected = None;
        Ok(())
    }

    fn item_count(&self, id: NativeId) -> Result<usize, NativeError> {
        let mut state = self.state.lock();
        state.enter("item_count")?;
        Ok(state.object("item_count", id)?.items.len())
    }

    fn create_menu(
        &mut self,
        window: NativeId,
        items: &[ControlSpec<'_>],
    ) -> Result<NativeId, NativeError> {
        let mut state = self.state.lock();
        state.enter("create_menu")?;
        state.object("create_menu", window)?;
        let menu = state.insert(NativeClass::Menu, Some(window), "");
        if let Some(object) = state.objects.get_mut(&menu) {
            object.items = items.iter().map(|i| i.text.to_string()).collect();
        }
        Ok(menu)
    }

    fn insert_menu_item(
        &mut self,
        menu: NativeId,
        position: usize,
        item: &ControlSpec<'_>,
    ) -> Result<(), NativeError> {
        let mut state = self.state.lock();
        state.enter("insert_menu_item")?;
        let object = state.object_mut("insert_menu_item", menu)?;
        if position > object.items.len() {
            return Err(NativeError::new(
                "insert_menu_item",
                format!("position {} past {} items", position, object.items.len()),
            ));
        }
        object.items.insert(position, item.text.to_string());
        Ok(())
    }

    fn remove_menu_item(&mut self, menu: NativeId, position: usize) -> Result<(), NativeError> {
        let mut state = self.state.lock();
        state.enter("remove_menu_item")?;
        let object = state.object_mut("remove_menu_item", menu)?;
        if position >= object.items.len() {
            return Err(NativeError::new(
                "remove_menu_item",
                format!("no item at position {}", position),
            ));
        }
        object.items.remove(position);
        Ok(())
    }

    fn popup_menu(
        &mut self,
        window: NativeId,
        at: Point,
        items: &[ControlSpec<'_>],
    ) -> Result<(), NativeError> {
        let mut state = self.state.lock();
        state.enter("popup_menu")?;
        state.object("popup_menu", window)?;
        state.popup = Some(Popup {
            window,
            at,
            items: items.iter().map(|i| i.text.to_string()).collect(),
        });
        Ok(())
    }

    fn create_toolbar(&mut self, window: NativeId) -> Result<NativeId, NativeError> {
        let mut state = self.state.lock();
        state.enter("create_toolbar")?;
        state.object("create_toolbar", window)?;
        Ok(state.insert(NativeClass::Toolbar, Some(window), ""))
    }

    fn create_statusbar(&mut self, window: NativeId, text: &str) -> Result<NativeId, NativeError> {
        let mut state = self.state.lock();
        state.enter("create_statusbar")?;
        state.object("create_statusbar", window)?;
        Ok(state.insert(NativeClass::StatusBar, Some(window), text))
    }

    fn set_scroll(&mut self, window: NativeId, scroll: &ScrollState) -> Result<(), NativeError> {
        let mut state = self.state.lock();
        state.enter("set_scroll")?;
        state.object("set_scroll", window)?;
        state.scroll.insert(window, *scroll);
        Ok(())
    }

    fn present(&mut self, window: NativeId, at: Point, bitmap: &Bitmap) -> Result<(), NativeError> {
        let mut state = self.state.lock();
        state.enter("present")?;
        state.object("present", window)?;
        while state.frames.len() >= state.frame_history {
            state.frames.pop_front();
        }
        state.frames.push_back(Frame {
            window,
            at,
            width: bitmap.width(),
            height: bitmap.height(),
            pixels: bitmap.pixels().to_vec(),
        });
        state.presented += 1;
        Ok(())
    }
}

/// Observer and fault injector for a [`HeadlessBackend`], usable from any
/// thread.
#[derive(Clone)]
pub struct HeadlessProbe {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessProbe {
    /// Make the next call to the named backend method fail.
    pub fn fail_next(&self, call: &'static str) {
        self.fail_after(call, 0);
    }

    /// Let `successes` calls to the named method through, then fail one.
    pub fn fail_after(&self, call: &'static str, successes: u32) {
        self.state.lock().failures.insert(call, successes);
    }

    pub fn exists(&self, id: NativeId) -> bool {
        self.state.lock().objects.contains_key(&id)
    }

    pub fn live_objects(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn class(&self, id: NativeId) -> Option<NativeClass> {
        self.state.lock().objects.get(&id).map(|o| o.class)
    }

    pub fn children(&self, id: NativeId) -> Vec<NativeId> {
        self.state.lock().children(id)
    }

    pub fn text(&self, id: NativeId) -> Option<String> {
        self.state.lock().objects.get(&id).map(|o| o.text.clone())
    }

    pub fn items(&self, id: NativeId) -> Option<Vec<String>> {
        self.state.lock().objects.get(&id).map(|o| o.items.clone())
    }

    pub fn focused(&self) -> Option<NativeId> {
        self.state.lock().focus
    }

    pub fn scroll(&self, window: NativeId) -> Option<ScrollState> {
        self.state.lock().scroll.get(&window).copied()
    }

    /// The window most recently activated, while it exists.
    pub fn active(&self) -> Option<NativeId> {
        self.state.lock().active
    }

    pub fn caret(&self, window: NativeId) -> Option<Caret> {
        self.state.lock().carets.get(&window).copied()
    }

    pub fn last_popup(&self) -> Option<Popup> {
        self.state.lock().popup.clone()
    }

    /// Simulate the user typing into a control.
    pub fn type_text(&self, id: NativeId, text: &str) {
        if let Some(object) = self.state.lock().objects.get_mut(&id) {
            object.text = text.to_string();
        }
    }

    /// Simulate the user selecting an item of a list or tree.
    pub fn select_item(&self, id: NativeId, index: usize) {
        if let Some(object) = self.state.lock().objects.get_mut(&id) {
            if index < object.items.len() {
                object.selected = Some(index);
            }
        }
    }

    /// The retained frames, oldest first.
    pub fn frames(&self) -> Vec<Frame> {
        self.state.lock().frames.iter().cloned().collect()
    }

    /// Frames presented since the backend was created, retained or not.
    pub fn frame_count(&self) -> usize {
        self.state.lock().presented
    }

    pub fn calls(&self) -> u64 {
        self.state.lock().calls
    }
}
