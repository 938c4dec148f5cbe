//! GUI adapter core: the object graph shared by the interpreter thread and
//! the UI thread, and the command protocol between them.
//!
//! The interpreter thread owns a [`GuiClient`]. Anything that touches a
//! native object is sent as a [`GuiCmd`] to the [`MessagePump`] running on
//! the UI thread, either as a round trip (reply awaited) or posted (no reply).
//! The pump executes commands one at a time in arrival order, each under the
//! global critical section of the [`GuiContext`].

use dxgui_sync::{LockError, PaintMutex, SignalOnDrop};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

pub mod client;
pub mod context;
pub mod graph;
pub mod handles;
pub mod manager;
pub mod model;
pub mod native;
pub mod pump;

pub use client::{DrawSession, GuiClient};
pub use context::{GuiConfig, GuiContext, GuiStats, TeardownReport};
pub use graph::GuiGraph;
pub use handles::{Handle, HandleKind, HandleTable};
pub use manager::GuiManager;
pub use model::{
    Bitmap, Caret, Control, ControlKind, ControlRef, Lifecycle, Pixmap, Placement, Point, Rect,
    Resource, ResourceKind, ScrollState, Size, Window, WindowKind,
};
pub use native::{HeadlessBackend, HeadlessProbe, NativeBackend, NativeError, NativeId, Popup};
pub use pump::{connect, launch, MessagePump, PumpEnds, UiThread};

// ============================================================================
// Error Types (6000+ range)
// ============================================================================

/// Error codes for GUI operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GuiErrorCode {
    /// Generic GUI error
    Generic = 6000,
    /// A table, array or native allocation could not grow
    OutOfMemory = 6001,
    /// Handle does not name a live object
    InvalidHandle = 6002,
    /// Object is in the wrong lifecycle state for the command
    WrongLifecycle = 6003,
    /// A native toolkit call failed
    NativeFailure = 6004,
    /// Command could not be queued to the UI thread
    ChannelSend = 6005,
    /// Reply never arrived from the UI thread
    ChannelRecv = 6006,
    /// Pixel map is held by a draw session
    PaintBusy = 6007,
    /// Invalid options
    InvalidOptions = 6008,
    /// No control with that id in the resource
    ControlNotFound = 6009,
    /// Resource kind does not support the command
    WrongResourceKind = 6010,
}

/// Custom error type for GUI operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum GuiError {
    #[error("[{code}] {message}")]
    Generic { code: u32, message: String },

    #[error("[{code}] Out of memory: {message}")]
    OutOfMemory { code: u32, message: String },

    #[error("[{code}] Invalid {kind} handle: {handle:#x}")]
    InvalidHandle {
        code: u32,
        kind: HandleKind,
        handle: u64,
    },

    #[error("[{code}] Wrong lifecycle state: {message}")]
    WrongLifecycle { code: u32, message: String },

    #[error("[{code}] Native call failed: {message}")]
    NativeFailure { code: u32, message: String },

    #[error("[{code}] Channel send error: {message}")]
    ChannelSend { code: u32, message: String },

    #[error("[{code}] Channel receive error: {message}")]
    ChannelRecv { code: u32, message: String },

    #[error("[{code}] Pixel map busy: {message}")]
    PaintBusy { code: u32, message: String },

    #[error("[{code}] Invalid options: {message}")]
    InvalidOptions { code: u32, message: String },

    #[error("[{code}] Control {control_id} not found in resource {resource:#x}")]
    ControlNotFound {
        code: u32,
        resource: u64,
        control_id: u16,
    },

    #[error("[{code}] Wrong resource kind: expected {expected}, found {found}")]
    WrongResourceKind {
        code: u32,
        expected: String,
        found: ResourceKind,
    },
}

impl GuiError {
    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic {
            code: GuiErrorCode::Generic as u32,
            message: message.into(),
        }
    }

    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Self::OutOfMemory {
            code: GuiErrorCode::OutOfMemory as u32,
            message: message.into(),
        }
    }

    pub fn invalid_handle(kind: HandleKind, handle: u64) -> Self {
        Self::InvalidHandle {
            code: GuiErrorCode::InvalidHandle as u32,
            kind,
            handle,
        }
    }

    pub fn wrong_lifecycle(message: impl Into<String>) -> Self {
        Self::WrongLifecycle {
            code: GuiErrorCode::WrongLifecycle as u32,
            message: message.into(),
        }
    }

    pub fn native_failure(message: impl Into<String>) -> Self {
        Self::NativeFailure {
            code: GuiErrorCode::NativeFailure as u32,
            message: message.into(),
        }
    }

    pub fn channel_send(message: impl Into<String>) -> Self {
        Self::ChannelSend {
            code: GuiErrorCode::ChannelSend as u32,
            message: message.into(),
        }
    }

    pub fn channel_recv(message: impl Into<String>) -> Self {
        Self::ChannelRecv {
            code: GuiErrorCode::ChannelRecv as u32,
            message: message.into(),
        }
    }

    pub fn paint_busy(message: impl Into<String>) -> Self {
        Self::PaintBusy {
            code: GuiErrorCode::PaintBusy as u32,
            message: message.into(),
        }
    }

    pub fn invalid_options(message: impl Into<String>) -> Self {
        Self::InvalidOptions {
            code: GuiErrorCode::InvalidOptions as u32,
            message: message.into(),
        }
    }

    pub fn control_not_found(resource: Handle<Resource>, control_id: u16) -> Self {
        Self::ControlNotFound {
            code: GuiErrorCode::ControlNotFound as u32,
            resource: resource.raw(),
            control_id,
        }
    }

    pub fn wrong_resource_kind(expected: impl Into<String>, found: ResourceKind) -> Self {
        Self::WrongResourceKind {
            code: GuiErrorCode::WrongResourceKind as u32,
            expected: expected.into(),
            found,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::Generic { code, .. }
            | Self::OutOfMemory { code, .. }
            | Self::InvalidHandle { code, .. }
            | Self::WrongLifecycle { code, .. }
            | Self::NativeFailure { code, .. }
            | Self::ChannelSend { code, .. }
            | Self::ChannelRecv { code, .. }
            | Self::PaintBusy { code, .. }
            | Self::InvalidOptions { code, .. }
            | Self::ControlNotFound { code, .. }
            | Self::WrongResourceKind { code, .. } => *code,
        }
    }
}

impl From<NativeError> for GuiError {
    fn from(err: NativeError) -> Self {
        GuiError::native_failure(err.to_string())
    }
}

impl From<LockError> for GuiError {
    fn from(err: LockError) -> Self {
        GuiError::paint_busy(err.to_string())
    }
}

pub type GuiResult<T> = Result<T, GuiError>;

// ============================================================================
// Data Types
// ============================================================================

/// Options for creating a window
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WindowOpts {
    pub title: Option<String>,
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Tool window floating above its owner
    pub floating: Option<bool>,
}

/// One control of a resource definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlDef {
    pub id: u16,
    pub kind: ControlKind,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub items: Vec<String>,
}

impl ControlDef {
    pub fn new(id: u16, kind: ControlKind, rect: Rect) -> Self {
        Self {
            id,
            kind,
            text: String::new(),
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
            items: Vec::new(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_items(mut self, items: Vec<String>) -> Self {
        self.items = items;
        self
    }

    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }
}

/// A resource (panel, dialog, menu, toolbar, icon) to define
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourceDef {
    pub name: String,
    pub kind: ResourceKind,
    pub title: Option<String>,
    #[serde(default)]
    pub controls: Vec<ControlDef>,
}

/// A pixel map to define
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PixmapOpts {
    pub name: Option<String>,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_bits_per_pixel")]
    pub bits_per_pixel: u8,
    /// Initial fill, `0x00RRGGBB`
    #[serde(default)]
    pub fill: u32,
}

fn default_bits_per_pixel() -> u8 {
    24
}

/// Decoded pixels ready to be copied into a pixel map. Ownership moves to
/// the UI thread with the command that carries it.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    /// Row-major `0x00RRGGBB`
    pub pixels: Vec<u32>,
}

impl std::fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

/// The control holding the keyboard focus of a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FocusInfo {
    pub resource: Handle<Resource>,
    pub control_id: u16,
}

/// Snapshot of a window's state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowInfo {
    pub kind: WindowKind,
    pub lifecycle: Lifecycle,
    pub title: String,
    pub position: Point,
    pub client: Size,
    pub extent: Size,
    pub scroll: ScrollState,
    pub shown_resources: Vec<Handle<Resource>>,
    pub shown_pixmaps: Vec<Handle<Pixmap>>,
    pub focus: Option<FocusInfo>,
    pub menu: Option<Handle<Resource>>,
    pub toolbar: Option<Handle<Resource>>,
    pub status_text: Option<String>,
    pub caret: Caret,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuiEventKind {
    WindowCreated,
    WindowDestroyed,
    WindowActivated,
    ResourceShown,
    ResourceHidden,
    FocusChanged,
    /// A posted command failed; there was no caller to return the error to.
    CommandFailed,
}

/// Notification from the UI thread to the interpreter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuiEvent {
    pub kind: GuiEventKind,
    pub window: Option<Handle<Window>>,
    pub resource: Option<Handle<Resource>>,
    pub control: Option<u16>,
    pub payload: serde_json::Value,
}

impl GuiEvent {
    pub fn new(kind: GuiEventKind) -> Self {
        Self {
            kind,
            window: None,
            resource: None,
            control: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn window(mut self, window: Handle<Window>) -> Self {
        self.window = Some(window);
        self
    }

    pub fn resource(mut self, resource: Handle<Resource>) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn control(mut self, control: u16) -> Self {
        self.control = Some(control);
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// ============================================================================
// Command Enum (interpreter -> UI thread communication)
// ============================================================================

pub type Reply<T> = oneshot::Sender<GuiResult<T>>;

/// Commands sent from the interpreter thread to the UI thread
#[derive(Debug)]
pub enum GuiCmd {
    // === Management (never held back by suspend) ===
    Sync {
        respond: oneshot::Sender<()>,
    },
    Resume,
    Shutdown {
        respond: oneshot::Sender<TeardownReport>,
    },

    // === Windows ===
    CreateWindow {
        opts: WindowOpts,
        respond: Reply<Handle<Window>>,
    },
    DestroyWindow {
        window: Handle<Window>,
        respond: Reply<()>,
    },
    SetWindowTitle {
        window: Handle<Window>,
        title: String,
    },
    GetWindowText {
        window: Handle<Window>,
        respond: Reply<String>,
    },
    GetWindowInfo {
        window: Handle<Window>,
        respond: Reply<WindowInfo>,
    },
    ActivateWindow {
        window: Handle<Window>,
        respond: Reply<()>,
    },
    ShowCaret {
        window: Handle<Window>,
    },
    HideCaret {
        window: Handle<Window>,
    },
    MoveCaret {
        window: Handle<Window>,
        at: Point,
    },

    // === Dialogs ===
    CreateDialog {
        resource: Handle<Resource>,
        opts: WindowOpts,
        respond: Reply<Handle<Window>>,
    },
    DestroyDialog {
        resource: Handle<Resource>,
        respond: Reply<()>,
    },

    // === Controls ===
    ShowControls {
        resource: Handle<Resource>,
        window: Handle<Window>,
        at: Point,
        activate: bool,
        respond: Reply<()>,
    },
    HideControls {
        resource: Handle<Resource>,
        respond: Reply<()>,
    },
    DestroyResource {
        resource: Handle<Resource>,
        respond: Reply<()>,
    },
    SetFocus {
        resource: Handle<Resource>,
        control_id: u16,
        respond: Reply<()>,
    },
    GetFocus {
        window: Handle<Window>,
        respond: Reply<Option<FocusInfo>>,
    },
    GetControlText {
        resource: Handle<Resource>,
        control_id: u16,
        respond: Reply<String>,
    },
    GetSelectedTreeItemText {
        resource: Handle<Resource>,
        control_id: u16,
        respond: Reply<Option<String>>,
    },
    EraseDropList {
        resource: Handle<Resource>,
        control_id: u16,
        done: SignalOnDrop<Option<GuiError>>,
    },

    // === Menus, toolbars, status bars ===
    CreateMenu {
        resource: Handle<Resource>,
        window: Handle<Window>,
        respond: Reply<()>,
    },
    DestroyMenu {
        resource: Handle<Resource>,
        respond: Reply<()>,
    },
    AddMenuItem {
        resource: Handle<Resource>,
        item: ControlDef,
        respond: Reply<()>,
    },
    DeleteMenuItem {
        resource: Handle<Resource>,
        item_id: u16,
        respond: Reply<()>,
    },
    ShowPopupMenu {
        resource: Handle<Resource>,
        window: Handle<Window>,
        at: Point,
        respond: Reply<()>,
    },
    CreateToolbar {
        resource: Handle<Resource>,
        window: Handle<Window>,
        respond: Reply<()>,
    },
    DestroyToolbar {
        resource: Handle<Resource>,
        respond: Reply<()>,
    },
    SetToolbarText {
        resource: Handle<Resource>,
        control_id: u16,
        text: String,
    },
    CreateStatusBar {
        window: Handle<Window>,
        text: String,
        respond: Reply<()>,
    },
    DestroyStatusBar {
        window: Handle<Window>,
        respond: Reply<()>,
    },
    SetStatusBarText {
        window: Handle<Window>,
        text: String,
    },

    // === Pixel maps ===
    StartDraw {
        pixmap: Handle<Pixmap>,
        respond: Reply<PaintMutex<Bitmap>>,
    },
    EndDraw {
        pixmap: Handle<Pixmap>,
    },
    ShowPixmap {
        pixmap: Handle<Pixmap>,
        window: Handle<Window>,
        at: Point,
        respond: Reply<()>,
    },
    HidePixmap {
        pixmap: Handle<Pixmap>,
        respond: Reply<()>,
    },
    CopyPixels {
        pixmap: Handle<Pixmap>,
        image: DecodedImage,
        respond: Reply<()>,
    },
    DestroyPixmap {
        pixmap: Handle<Pixmap>,
        respond: Reply<()>,
    },
    Repaint {
        window: Handle<Window>,
    },
}

impl GuiCmd {
    pub fn name(&self) -> &'static str {
        match self {
            GuiCmd::Sync { .. } => "Sync",
            GuiCmd::Resume => "Resume",
            GuiCmd::Shutdown { .. } => "Shutdown",
            GuiCmd::CreateWindow { .. } => "CreateWindow",
            GuiCmd::DestroyWindow { .. } => "DestroyWindow",
            GuiCmd::SetWindowTitle { .. } => "SetWindowTitle",
            GuiCmd::GetWindowText { .. } => "GetWindowText",
            GuiCmd::GetWindowInfo { .. } => "GetWindowInfo",
            GuiCmd::ActivateWindow { .. } => "ActivateWindow",
            GuiCmd::ShowCaret { .. } => "ShowCaret",
            GuiCmd::HideCaret { .. } => "HideCaret",
            GuiCmd::MoveCaret { .. } => "MoveCaret",
            GuiCmd::CreateDialog { .. } => "CreateDialog",
            GuiCmd::DestroyDialog { .. } => "DestroyDialog",
            GuiCmd::ShowControls { .. } => "ShowControls",
            GuiCmd::HideControls { .. } => "HideControls",
            GuiCmd::DestroyResource { .. } => "DestroyResource",
            GuiCmd::SetFocus { .. } => "SetFocus",
            GuiCmd::GetFocus { .. } => "GetFocus",
            GuiCmd::GetControlText { .. } => "GetControlText",
            GuiCmd::GetSelectedTreeItemText { .. } => "GetSelectedTreeItemText",
            GuiCmd::EraseDropList { .. } => "EraseDropList",
            GuiCmd::CreateMenu { .. } => "CreateMenu",
            GuiCmd::DestroyMenu { .. } => "DestroyMenu",
            GuiCmd::AddMenuItem { .. } => "AddMenuItem",
            GuiCmd::DeleteMenuItem { .. } => "DeleteMenuItem",
            GuiCmd::ShowPopupMenu { .. } => "ShowPopupMenu",
            GuiCmd::CreateToolbar { .. } => "CreateToolbar",
            GuiCmd::DestroyToolbar { .. } => "DestroyToolbar",
            GuiCmd::SetToolbarText { .. } => "SetToolbarText",
            GuiCmd::CreateStatusBar { .. } => "CreateStatusBar",
            GuiCmd::DestroyStatusBar { .. } => "DestroyStatusBar",
            GuiCmd::SetStatusBarText { .. } => "SetStatusBarText",
            GuiCmd::StartDraw { .. } => "StartDraw",
            GuiCmd::EndDraw { .. } => "EndDraw",
            GuiCmd::ShowPixmap { .. } => "ShowPixmap",
            GuiCmd::HidePixmap { .. } => "HidePixmap",
            GuiCmd::CopyPixels { .. } => "CopyPixels",
            GuiCmd::DestroyPixmap { .. } => "DestroyPixmap",
            GuiCmd::Repaint { .. } => "Repaint",
        }
    }

    /// Management commands pass the suspend filter.
    pub fn is_management(&self) -> bool {
        matches!(
            self,
            GuiCmd::Sync { .. } | GuiCmd::Resume | GuiCmd::Shutdown { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(GuiErrorCode::Generic as u32, 6000);
        assert_eq!(GuiErrorCode::OutOfMemory as u32, 6001);
        assert_eq!(GuiErrorCode::InvalidHandle as u32, 6002);
        assert_eq!(GuiErrorCode::PaintBusy as u32, 6007);
        assert_eq!(GuiErrorCode::WrongResourceKind as u32, 6010);
    }

    #[test]
    fn test_error_display() {
        let err = GuiError::generic("test error");
        assert!(err.to_string().contains("6000"));
        assert!(err.to_string().contains("test error"));

        let err = GuiError::invalid_handle(HandleKind::Window, 0x1_0000_0002);
        assert_eq!(err.code(), 6002);
        assert!(err.to_string().contains("window"));
        assert!(err.to_string().contains("0x100000002"));

        let err = GuiError::wrong_resource_kind("dialog", ResourceKind::Panel);
        assert!(err.to_string().contains("expected dialog, found panel"));
    }

    #[test]
    fn test_conversions() {
        let err: GuiError = NativeError::new("create_window", "no display").into();
        assert_eq!(err.code(), GuiErrorCode::NativeFailure as u32);
        assert!(err.to_string().contains("create_window"));

        let err: GuiError =
            LockError::timeout("pixmap:a", std::time::Duration::from_millis(50)).into();
        assert_eq!(err.code(), GuiErrorCode::PaintBusy as u32);
    }

    #[test]
    fn test_management_filter() {
        let (tx, _rx) = oneshot::channel();
        assert!(GuiCmd::Sync { respond: tx }.is_management());
        assert!(GuiCmd::Resume.is_management());
        let title = GuiCmd::SetWindowTitle {
            window: Handle::from_raw(1),
            title: "x".into(),
        };
        assert!(!title.is_management());
        assert_eq!(title.name(), "SetWindowTitle");
    }

    #[test]
    fn test_resource_def_deserialization() {
        let def: ResourceDef = serde_json::from_str(
            r#"{
                "name": "login",
                "kind": "panel",
                "title": null,
                "controls": [
                    {"id": 1, "kind": "text", "text": "User",
                     "x": 4, "y": 4, "width": 60, "height": 12},
                    {"id": 2, "kind": "edit", "x": 70, "y": 4, "width": 120, "height": 12},
                    {"id": 3, "kind": "drop_box", "items": ["a", "b"]}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(def.kind, ResourceKind::Panel);
        assert_eq!(def.controls.len(), 3);
        assert_eq!(def.controls[1].kind, ControlKind::Edit);
        assert_eq!(def.controls[2].items, vec!["a", "b"]);
        assert_eq!(def.controls[2].rect(), Rect::default());
    }

    #[test]
    fn test_pixmap_opts_defaults() {
        let opts: PixmapOpts = serde_json::from_str(r#"{"width": 8, "height": 4}"#).unwrap();
        assert_eq!(opts.bits_per_pixel, 24);
        assert_eq!(opts.fill, 0);
        assert!(opts.name.is_none());
    }

    #[test]
    fn test_event_serialization() {
        let event = GuiEvent::new(GuiEventKind::ResourceShown)
            .window(Handle::from_raw(5))
            .control(3);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("resource_shown"));
        assert!(json.contains("\"window\":5"));
    }
}
