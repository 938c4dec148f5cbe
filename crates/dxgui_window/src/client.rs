//! The interpreter thread's side of the command protocol.
//!
//! Every method either performs a round trip (send, then block until the UI
//! thread replies) or posts a command and returns at once. Round trips must
//! never be made while holding the critical section: the UI thread needs it
//! to execute the command being waited for.

use crate::context::{GuiContext, TeardownReport};
use crate::handles::Handle;
use crate::model::{Bitmap, Pixmap, Point, Resource, Window};
use crate::{
    ControlDef, DecodedImage, FocusInfo, GuiCmd, GuiError, GuiEvent, GuiResult, PixmapOpts,
    Reply, ResourceDef, WindowInfo, WindowOpts,
};
use dxgui_sync::{order, LazyEvent, OwnedPaintGuard, SignalOnDrop};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

pub struct GuiClient {
    ctx: Arc<GuiContext>,
    cmd_tx: mpsc::UnboundedSender<GuiCmd>,
    events: mpsc::Receiver<GuiEvent>,
    erase_done: LazyEvent<Option<GuiError>>,
}

impl GuiClient {
    pub(crate) fn new(
        ctx: Arc<GuiContext>,
        cmd_tx: mpsc::UnboundedSender<GuiCmd>,
        events: mpsc::Receiver<GuiEvent>,
    ) -> Self {
        Self {
            ctx,
            cmd_tx,
            events,
            erase_done: LazyEvent::new("erase-drop-list"),
        }
    }

    pub fn context(&self) -> &Arc<GuiContext> {
        &self.ctx
    }

    fn post(&self, cmd: GuiCmd) -> GuiResult<()> {
        let name = cmd.name();
        self.cmd_tx
            .send(cmd)
            .map_err(|_| GuiError::channel_send(format!("{}: UI thread is gone", name)))
    }

    fn ensure_runnable(&self, name: &str) -> GuiResult<()> {
        debug_assert!(
            !order::critical_held(),
            "{} awaited while holding the critical section",
            name
        );
        if self.ctx.is_suspended() {
            return Err(GuiError::wrong_lifecycle(format!(
                "{} would wait forever: the GUI is suspended",
                name
            )));
        }
        Ok(())
    }

    fn call<T>(&self, make: impl FnOnce(Reply<T>) -> GuiCmd) -> GuiResult<T> {
        let (tx, rx) = oneshot::channel();
        let cmd = make(tx);
        let name = cmd.name();
        self.ensure_runnable(name)?;
        self.post(cmd)?;
        rx.blocking_recv()
            .map_err(|e| GuiError::channel_recv(format!("{}: {}", name, e)))?
    }

    // === Management ===

    /// Round trip with no work attached. Returns once every command sent
    /// before it has been executed. Passes the suspend filter.
    pub fn sync(&self) -> GuiResult<()> {
        debug_assert!(!order::critical_held(), "Sync awaited inside the critical section");
        let (tx, rx) = oneshot::channel();
        self.post(GuiCmd::Sync { respond: tx })?;
        rx.blocking_recv()
            .map_err(|e| GuiError::channel_recv(format!("Sync: {}", e)))
    }

    /// Hold back every non-management command until [`resume`](Self::resume).
    pub fn suspend(&self) {
        tracing::debug!("GUI suspended");
        self.ctx.set_suspended(true);
    }

    pub fn resume(&self) -> GuiResult<()> {
        tracing::debug!("GUI resumed");
        self.ctx.set_suspended(false);
        self.post(GuiCmd::Resume)
    }

    pub fn is_suspended(&self) -> bool {
        self.ctx.is_suspended()
    }

    /// Destroy every window and release every object, then stop the UI
    /// thread. Consumes the client, so no draw session can still be open.
    pub fn shutdown(self) -> GuiResult<TeardownReport> {
        debug_assert!(!order::critical_held(), "Shutdown awaited inside the critical section");
        let (tx, rx) = oneshot::channel();
        self.post(GuiCmd::Shutdown { respond: tx })?;
        rx.blocking_recv()
            .map_err(|e| GuiError::channel_recv(format!("Shutdown: {}", e)))
    }

    // === Definitions (no UI-thread work) ===

    pub fn define_resource(&self, def: ResourceDef) -> GuiResult<Handle<Resource>> {
        self.ctx.define_resource(def)
    }

    pub fn append_control(&self, resource: Handle<Resource>, def: ControlDef) -> GuiResult<()> {
        self.ctx.append_control(resource, def)
    }

    pub fn define_pixmap(&self, opts: PixmapOpts) -> GuiResult<Handle<Pixmap>> {
        self.ctx.define_pixmap(opts)
    }

    // === Windows ===

    pub fn create_window(&self, opts: WindowOpts) -> GuiResult<Handle<Window>> {
        self.call(|respond| GuiCmd::CreateWindow { opts, respond })
    }

    pub fn destroy_window(&self, window: Handle<Window>) -> GuiResult<()> {
        self.call(|respond| GuiCmd::DestroyWindow { window, respond })
    }

    pub fn set_window_title(
        &self,
        window: Handle<Window>,
        title: impl Into<String>,
    ) -> GuiResult<()> {
        self.post(GuiCmd::SetWindowTitle {
            window,
            title: title.into(),
        })
    }

    pub fn window_text(&self, window: Handle<Window>) -> GuiResult<String> {
        self.call(|respond| GuiCmd::GetWindowText { window, respond })
    }

    pub fn window_info(&self, window: Handle<Window>) -> GuiResult<WindowInfo> {
        self.call(|respond| GuiCmd::GetWindowInfo { window, respond })
    }

    /// Bring the window to the front and give it the keyboard.
    pub fn activate_window(&self, window: Handle<Window>) -> GuiResult<()> {
        self.call(|respond| GuiCmd::ActivateWindow { window, respond })
    }

    pub fn show_caret(&self, window: Handle<Window>) -> GuiResult<()> {
        self.post(GuiCmd::ShowCaret { window })
    }

    pub fn hide_caret(&self, window: Handle<Window>) -> GuiResult<()> {
        self.post(GuiCmd::HideCaret { window })
    }

    /// Move the caret to a client position; negative coordinates are
    /// refused before anything is sent.
    pub fn move_caret(&self, window: Handle<Window>, at: Point) -> GuiResult<()> {
        if at.x < 0 || at.y < 0 {
            return Err(GuiError::invalid_options(format!(
                "caret position ({}, {}) is negative",
                at.x, at.y
            )));
        }
        self.post(GuiCmd::MoveCaret { window, at })
    }

    /// Ask for the window's pixel maps to be presented again.
    pub fn invalidate(&self, window: Handle<Window>) -> GuiResult<()> {
        self.post(GuiCmd::Repaint { window })
    }

    // === Dialogs ===

    /// Open a dialog resource in a host window of its own.
    pub fn create_dialog(
        &self,
        resource: Handle<Resource>,
        opts: WindowOpts,
    ) -> GuiResult<Handle<Window>> {
        self.call(|respond| GuiCmd::CreateDialog {
            resource,
            opts,
            respond,
        })
    }

    pub fn destroy_dialog(&self, resource: Handle<Resource>) -> GuiResult<()> {
        self.call(|respond| GuiCmd::DestroyDialog { resource, respond })
    }

    // === Controls ===

    /// Create native peers for every control of the resource inside the
    /// window and give the window's focus to a valid control.
    pub fn show_controls(
        &self,
        resource: Handle<Resource>,
        window: Handle<Window>,
        at: Point,
    ) -> GuiResult<()> {
        self.call(|respond| GuiCmd::ShowControls {
            resource,
            window,
            at,
            activate: true,
            respond,
        })
    }

    /// Like [`show_controls`](Self::show_controls) but leaves the focus
    /// alone.
    pub fn show_controls_inactive(
        &self,
        resource: Handle<Resource>,
        window: Handle<Window>,
        at: Point,
    ) -> GuiResult<()> {
        self.call(|respond| GuiCmd::ShowControls {
            resource,
            window,
            at,
            activate: false,
            respond,
        })
    }

    pub fn hide_controls(&self, resource: Handle<Resource>) -> GuiResult<()> {
        self.call(|respond| GuiCmd::HideControls { resource, respond })
    }

    pub fn destroy_resource(&self, resource: Handle<Resource>) -> GuiResult<()> {
        self.call(|respond| GuiCmd::DestroyResource { resource, respond })
    }

    pub fn set_focus(&self, resource: Handle<Resource>, control_id: u16) -> GuiResult<()> {
        self.call(|respond| GuiCmd::SetFocus {
            resource,
            control_id,
            respond,
        })
    }

    pub fn focus(&self, window: Handle<Window>) -> GuiResult<Option<FocusInfo>> {
        self.call(|respond| GuiCmd::GetFocus { window, respond })
    }

    pub fn control_text(&self, resource: Handle<Resource>, control_id: u16) -> GuiResult<String> {
        self.call(|respond| GuiCmd::GetControlText {
            resource,
            control_id,
            respond,
        })
    }

    pub fn selected_tree_item_text(
        &self,
        resource: Handle<Resource>,
        control_id: u16,
    ) -> GuiResult<Option<String>> {
        self.call(|respond| GuiCmd::GetSelectedTreeItemText {
            resource,
            control_id,
            respond,
        })
    }

    /// Empty a drop-down or list box. Posted, then awaited through the
    /// client's completion event, which is created on first use.
    pub fn erase_drop_list(
        &mut self,
        resource: Handle<Resource>,
        control_id: u16,
    ) -> GuiResult<()> {
        self.ensure_runnable("EraseDropList")?;
        let event = self.erase_done.get();
        event.reset();
        let done = SignalOnDrop::new(
            event.clone(),
            Some(GuiError::channel_recv("EraseDropList abandoned before it ran")),
        );
        self.post(GuiCmd::EraseDropList {
            resource,
            control_id,
            done,
        })?;
        match event.wait() {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    // === Menus, toolbars, status bars ===

    pub fn create_menu(&self, resource: Handle<Resource>, window: Handle<Window>) -> GuiResult<()> {
        self.call(|respond| GuiCmd::CreateMenu {
            resource,
            window,
            respond,
        })
    }

    pub fn destroy_menu(&self, resource: Handle<Resource>) -> GuiResult<()> {
        self.call(|respond| GuiCmd::DestroyMenu { resource, respond })
    }

    /// Add an item to a menu resource, attached or not.
    pub fn add_menu_item(&self, resource: Handle<Resource>, item: ControlDef) -> GuiResult<()> {
        self.call(|respond| GuiCmd::AddMenuItem {
            resource,
            item,
            respond,
        })
    }

    pub fn delete_menu_item(&self, resource: Handle<Resource>, item_id: u16) -> GuiResult<()> {
        self.call(|respond| GuiCmd::DeleteMenuItem {
            resource,
            item_id,
            respond,
        })
    }

    /// Show a menu resource that is not a menu bar as a context menu.
    pub fn show_popup_menu(
        &self,
        resource: Handle<Resource>,
        window: Handle<Window>,
        at: Point,
    ) -> GuiResult<()> {
        self.call(|respond| GuiCmd::ShowPopupMenu {
            resource,
            window,
            at,
            respond,
        })
    }

    pub fn create_toolbar(
        &self,
        resource: Handle<Resource>,
        window: Handle<Window>,
    ) -> GuiResult<()> {
        self.call(|respond| GuiCmd::CreateToolbar {
            resource,
            window,
            respond,
        })
    }

    pub fn destroy_toolbar(&self, resource: Handle<Resource>) -> GuiResult<()> {
        self.call(|respond| GuiCmd::DestroyToolbar { resource, respond })
    }

    pub fn set_toolbar_text(
        &self,
        resource: Handle<Resource>,
        control_id: u16,
        text: impl Into<String>,
    ) -> GuiResult<()> {
        self.post(GuiCmd::SetToolbarText {
            resource,
            control_id,
            text: text.into(),
        })
    }

    pub fn create_status_bar(
        &self,
        window: Handle<Window>,
        text: impl Into<String>,
    ) -> GuiResult<()> {
        let text = text.into();
        self.call(|respond| GuiCmd::CreateStatusBar {
            window,
            text,
            respond,
        })
    }

    pub fn destroy_status_bar(&self, window: Handle<Window>) -> GuiResult<()> {
        self.call(|respond| GuiCmd::DestroyStatusBar { window, respond })
    }

    pub fn set_status_text(
        &self,
        window: Handle<Window>,
        text: impl Into<String>,
    ) -> GuiResult<()> {
        self.post(GuiCmd::SetStatusBarText {
            window,
            text: text.into(),
        })
    }

    // === Pixel maps ===

    /// Open a draw session: the pixel map's paint lock is held until the
    /// session is dropped or finished, so repaints never present a
    /// half-drawn bitmap.
    ///
    /// Only one session may be open per thread; while it is, definitions
    /// and a second `start_draw` fail with `WrongLifecycle`.
    pub fn start_draw(&self, pixmap: Handle<Pixmap>) -> GuiResult<DrawSession<'_>> {
        if order::paint_depth() > 0 {
            return Err(GuiError::wrong_lifecycle(format!(
                "StartDraw on {}: a draw session is already open on this thread",
                pixmap
            )));
        }
        let paint = self.call(|respond| GuiCmd::StartDraw { pixmap, respond })?;
        let guard = paint.lock_owned();
        tracing::trace!("draw session on {} opened", pixmap);
        Ok(DrawSession {
            client: self,
            pixmap,
            guard: Some(guard),
        })
    }

    pub fn show_pixmap(
        &self,
        pixmap: Handle<Pixmap>,
        window: Handle<Window>,
        at: Point,
    ) -> GuiResult<()> {
        self.call(|respond| GuiCmd::ShowPixmap {
            pixmap,
            window,
            at,
            respond,
        })
    }

    pub fn hide_pixmap(&self, pixmap: Handle<Pixmap>) -> GuiResult<()> {
        self.call(|respond| GuiCmd::HidePixmap { pixmap, respond })
    }

    /// Hand decoded pixels to the UI thread, which copies them into the map.
    pub fn copy_pixels(&self, pixmap: Handle<Pixmap>, image: DecodedImage) -> GuiResult<()> {
        self.call(|respond| GuiCmd::CopyPixels {
            pixmap,
            image,
            respond,
        })
    }

    pub fn destroy_pixmap(&self, pixmap: Handle<Pixmap>) -> GuiResult<()> {
        self.call(|respond| GuiCmd::DestroyPixmap { pixmap, respond })
    }

    // === Events ===

    pub fn poll_event(&mut self) -> Option<GuiEvent> {
        self.events.try_recv().ok()
    }

    /// Block until the UI thread reports something. `None` once it is gone.
    pub fn next_event(&mut self) -> Option<GuiEvent> {
        self.events.blocking_recv()
    }
}

/// Exclusive access to a pixel map's bitmap. Dropping it marks the bitmap
/// dirty, releases the paint lock and asks for a repaint.
pub struct DrawSession<'a> {
    client: &'a GuiClient,
    pixmap: Handle<Pixmap>,
    guard: Option<OwnedPaintGuard<Bitmap>>,
}

impl std::fmt::Debug for DrawSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrawSession").finish_non_exhaustive()
    }
}

impl DrawSession<'_> {
    pub fn pixmap(&self) -> Handle<Pixmap> {
        self.pixmap
    }

    /// End the session now and report whether the repaint request was
    /// queued.
    pub fn finish(mut self) -> GuiResult<()> {
        self.end()
    }

    fn end(&mut self) -> GuiResult<()> {
        let Some(mut guard) = self.guard.take() else {
            return Ok(());
        };
        guard.mark_dirty();
        drop(guard);
        tracing::trace!("draw session on {} closed", self.pixmap);
        self.client.post(GuiCmd::EndDraw {
            pixmap: self.pixmap,
        })
    }
}

impl Deref for DrawSession<'_> {
    type Target = Bitmap;

    fn deref(&self) -> &Bitmap {
        match &self.guard {
            Some(guard) => guard,
            None => unreachable!("draw session used after it ended"),
        }
    }
}

impl DerefMut for DrawSession<'_> {
    fn deref_mut(&mut self) -> &mut Bitmap {
        match &mut self.guard {
            Some(guard) => guard,
            None => unreachable!("draw session used after it ended"),
        }
    }
}

impl Drop for DrawSession<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.end() {
            tracing::debug!("end of draw session on {}: {}", self.pixmap, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::GuiConfig;
    use crate::model::{ControlKind, Rect, ResourceKind};
    use crate::native::{HeadlessBackend, HeadlessProbe};
    use crate::pump::{launch, UiThread};
    use crate::{GuiErrorCode, GuiEventKind};

    fn start() -> (GuiClient, UiThread, HeadlessProbe) {
        let backend = HeadlessBackend::new();
        let probe = backend.probe();
        let (client, ui) = launch(GuiConfig::default(), move || backend).unwrap();
        (client, ui, probe)
    }

    fn drop_list_panel(client: &GuiClient) -> Handle<Resource> {
        client
            .define_resource(ResourceDef {
                name: "choices".into(),
                kind: ResourceKind::Panel,
                title: None,
                controls: vec![ControlDef::new(7, ControlKind::DropBox, Rect::new(0, 0, 80, 20))
                    .with_items(vec!["red".into(), "green".into()])],
            })
            .unwrap()
    }

    #[test]
    fn test_posted_title_is_seen_by_next_round_trip() {
        let (client, ui, _probe) = start();
        let window = client.create_window(WindowOpts::default()).unwrap();
        client.set_window_title(window, "first").unwrap();
        client.set_window_title(window, "second").unwrap();
        assert_eq!(client.window_text(window).unwrap(), "second");
        client.shutdown().unwrap();
        ui.join().unwrap();
    }

    #[test]
    fn test_suspend_defers_until_resume() {
        let (client, ui, _probe) = start();
        let window = client.create_window(WindowOpts::default()).unwrap();
        client.suspend();
        client.set_window_title(window, "later").unwrap();
        client.sync().unwrap();
        assert_eq!(client.context().stats().deferred(), 1);

        let err = client.window_text(window).unwrap_err();
        assert_eq!(err.code(), GuiErrorCode::WrongLifecycle as u32);

        client.resume().unwrap();
        assert_eq!(client.window_text(window).unwrap(), "later");
        client.shutdown().unwrap();
        ui.join().unwrap();
    }

    #[test]
    fn test_erase_drop_list_waits_for_completion() {
        let (mut client, ui, probe) = start();
        let window = client.create_window(WindowOpts::default()).unwrap();
        let panel = drop_list_panel(&client);
        client.show_controls(panel, window, Point::ORIGIN).unwrap();

        let peer = {
            let graph = client.context().enter();
            graph.control(panel, 7).unwrap().peer().unwrap()
        };
        assert_eq!(probe.items(peer).unwrap().len(), 2);

        client.erase_drop_list(panel, 7).unwrap();
        assert_eq!(probe.items(peer).unwrap(), Vec::<String>::new());
        // The event is reused for the next call.
        client.erase_drop_list(panel, 7).unwrap();

        client.hide_controls(panel).unwrap();
        let err = client.erase_drop_list(panel, 7).unwrap_err();
        assert_eq!(err.code(), GuiErrorCode::WrongLifecycle as u32);
        client.shutdown().unwrap();
        ui.join().unwrap();
    }

    #[test]
    fn test_draw_session_ends_with_repaint() {
        let (client, ui, probe) = start();
        let window = client.create_window(WindowOpts::default()).unwrap();
        let pixmap = client
            .define_pixmap(PixmapOpts {
                name: None,
                width: 8,
                height: 8,
                bits_per_pixel: 24,
                fill: 0,
            })
            .unwrap();
        client.show_pixmap(pixmap, window, Point::new(4, 4)).unwrap();
        client.sync().unwrap();
        let before = probe.frame_count();

        {
            let mut session = client.start_draw(pixmap).unwrap();
            session.clear(0x00ff00);
            assert_eq!(session.pixmap(), pixmap);
        }
        client.sync().unwrap();
        client.sync().unwrap();

        let frames = probe.frames();
        assert!(probe.frame_count() > before);
        let last = frames.last().unwrap();
        assert!(last.is_uniform());
        assert_eq!(last.pixels[0], 0x00ff00);
        client.shutdown().unwrap();
        ui.join().unwrap();
    }

    #[test]
    fn test_open_draw_session_refuses_graph_entry() {
        let (client, ui, _probe) = start();
        let opts = || PixmapOpts {
            name: None,
            width: 4,
            height: 4,
            bits_per_pixel: 24,
            fill: 0,
        };
        let pixmap = client.define_pixmap(opts()).unwrap();
        let other = client.define_pixmap(opts()).unwrap();
        let panel = drop_list_panel(&client);

        let session = client.start_draw(pixmap).unwrap();
        let err = client.define_pixmap(opts()).unwrap_err();
        assert_eq!(err.code(), GuiErrorCode::WrongLifecycle as u32);
        let edit = ControlDef::new(1, ControlKind::Edit, Rect::default());
        let err = client.append_control(panel, edit).unwrap_err();
        assert_eq!(err.code(), GuiErrorCode::WrongLifecycle as u32);
        let err = client.start_draw(other).unwrap_err();
        assert_eq!(err.code(), GuiErrorCode::WrongLifecycle as u32);
        assert!(client.context().checked_enter("lookup").is_err());
        session.finish().unwrap();

        assert!(client.define_pixmap(opts()).is_ok());
        drop(client.start_draw(other).unwrap());
        client.shutdown().unwrap();
        ui.join().unwrap();
    }

    #[test]
    fn test_caret_follows_posted_moves() {
        let (client, ui, probe) = start();
        let window = client.create_window(WindowOpts::default()).unwrap();
        let err = client.move_caret(window, Point::new(-1, 4)).unwrap_err();
        assert_eq!(err.code(), GuiErrorCode::InvalidOptions as u32);

        client.move_caret(window, Point::new(12, 4)).unwrap();
        client.show_caret(window).unwrap();
        let info = client.window_info(window).unwrap();
        assert_eq!(info.caret.at, Point::new(12, 4));
        assert!(info.caret.visible);

        client.hide_caret(window).unwrap();
        client.sync().unwrap();
        let native = client.context().enter().window(window).unwrap().native().unwrap();
        assert!(!probe.caret(native).unwrap().visible);
        client.shutdown().unwrap();
        ui.join().unwrap();
    }

    #[test]
    fn test_failed_posted_command_raises_event() {
        let (mut client, ui, _probe) = start();
        let window = client.create_window(WindowOpts::default()).unwrap();
        assert_eq!(client.next_event().unwrap().kind, GuiEventKind::WindowCreated);

        client.destroy_window(window).unwrap();
        client.set_status_text(window, "gone").unwrap();
        client.sync().unwrap();

        let kinds: Vec<_> = std::iter::from_fn(|| client.poll_event())
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![GuiEventKind::WindowDestroyed, GuiEventKind::CommandFailed]
        );
        client.shutdown().unwrap();
        ui.join().unwrap();
    }
}
