//! Command execution on the UI thread.
//!
//! [`GuiManager::handle`] runs exactly one command: it enters the critical
//! section, performs the graph and native work, replies if the command has a
//! reply slot, and leaves. Nothing here ever waits on the interpreter thread.

use crate::context::{GuiContext, TeardownReport};
use crate::graph::GuiGraph;
use crate::handles::Handle;
use crate::model::{
    Caret, Control, ControlRef, Lifecycle, Pixmap, Placement, Point, Rect, Resource,
    ResourceKind, StatusBar, Window, WindowKind,
};
use crate::native::{ControlSpec, NativeBackend, NativeId};
use crate::{
    ControlDef, DecodedImage, GuiCmd, GuiError, GuiEvent, GuiEventKind, GuiResult, Reply,
    WindowInfo, WindowOpts,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DIALOG_MARGIN: u32 = 8;

pub struct GuiManager<B: NativeBackend> {
    ctx: Arc<GuiContext>,
    backend: B,
    /// Weak, so that the queue closes once every client is gone.
    self_tx: mpsc::WeakUnboundedSender<GuiCmd>,
    events: mpsc::Sender<GuiEvent>,
    paint_timeout: Duration,
}

impl<B: NativeBackend> GuiManager<B> {
    pub fn new(
        ctx: Arc<GuiContext>,
        backend: B,
        self_tx: mpsc::WeakUnboundedSender<GuiCmd>,
        events: mpsc::Sender<GuiEvent>,
    ) -> Self {
        let paint_timeout = ctx.config().paint_timeout();
        Self {
            ctx,
            backend,
            self_tx,
            events,
            paint_timeout,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Execute one command. Returns `false` once a shutdown has run.
    pub fn handle(&mut self, cmd: GuiCmd) -> bool {
        let name = cmd.name();
        tracing::trace!("executing {}", name);
        self.ctx.stats().record_command();

        let ctx = self.ctx.clone();
        let mut guard = ctx.enter();
        let graph: &mut GuiGraph = &mut guard;

        match cmd {
            GuiCmd::Sync { respond } => {
                let _ = respond.send(());
            }
            GuiCmd::Resume => {}
            GuiCmd::Shutdown { respond } => {
                let report = self.shutdown(graph);
                let _ = respond.send(report);
                return false;
            }

            GuiCmd::CreateWindow { opts, respond } => {
                let result = self.create_window(graph, opts, WindowKind::TopLevel);
                reply(name, respond, result);
            }
            GuiCmd::DestroyWindow { window, respond } => {
                let result = self.destroy_window(graph, window);
                reply(name, respond, result);
            }
            GuiCmd::SetWindowTitle { window, title } => {
                let result = self.set_window_title(graph, window, title);
                self.posted(name, result);
            }
            GuiCmd::GetWindowText { window, respond } => {
                let result = self.window_text(graph, window);
                reply(name, respond, result);
            }
            GuiCmd::GetWindowInfo { window, respond } => {
                let result = self.window_info(graph, window);
                reply(name, respond, result);
            }
            GuiCmd::ActivateWindow { window, respond } => {
                let result = self.activate_window(graph, window);
                reply(name, respond, result);
            }
            GuiCmd::ShowCaret { window } => {
                let result = self.update_caret(graph, window, |caret| caret.visible = true);
                self.posted(name, result);
            }
            GuiCmd::HideCaret { window } => {
                let result = self.update_caret(graph, window, |caret| caret.visible = false);
                self.posted(name, result);
            }
            GuiCmd::MoveCaret { window, at } => {
                let result = self.update_caret(graph, window, |caret| caret.at = at);
                self.posted(name, result);
            }

            GuiCmd::CreateDialog {
                resource,
                opts,
                respond,
            } => {
                let result = self.create_dialog(graph, resource, opts);
                reply(name, respond, result);
            }
            GuiCmd::DestroyDialog { resource, respond } => {
                let result = self.destroy_dialog(graph, resource);
                reply(name, respond, result);
            }

            GuiCmd::ShowControls {
                resource,
                window,
                at,
                activate,
                respond,
            } => {
                let result = self.show_controls(graph, resource, window, at, activate);
                reply(name, respond, result);
            }
            GuiCmd::HideControls { resource, respond } => {
                let result = self.hide_resource(graph, resource).map(|_| ());
                reply(name, respond, result);
            }
            GuiCmd::DestroyResource { resource, respond } => {
                let result = self.destroy_resource(graph, resource);
                reply(name, respond, result);
            }
            GuiCmd::SetFocus {
                resource,
                control_id,
                respond,
            } => {
                let result = self.set_focus(graph, resource, control_id);
                reply(name, respond, result);
            }
            GuiCmd::GetFocus { window, respond } => {
                let result = graph.live_window(window).and_then(|_| graph.focus(window));
                reply(name, respond, result);
            }
            GuiCmd::GetControlText {
                resource,
                control_id,
                respond,
            } => {
                let result = self.control_text(graph, resource, control_id);
                reply(name, respond, result);
            }
            GuiCmd::GetSelectedTreeItemText {
                resource,
                control_id,
                respond,
            } => {
                let result = self.selected_tree_item_text(graph, resource, control_id);
                reply(name, respond, result);
            }
            GuiCmd::EraseDropList {
                resource,
                control_id,
                done,
            } => {
                let result = self.erase_drop_list(graph, resource, control_id);
                if let Err(err) = &result {
                    tracing::warn!("{} failed: {}", name, err);
                }
                done.complete(result.err());
            }

            GuiCmd::CreateMenu {
                resource,
                window,
                respond,
            } => {
                let result = self.create_menu(graph, resource, window);
                reply(name, respond, result);
            }
            GuiCmd::DestroyMenu { resource, respond } => {
                let result = self
                    .expect_kind(graph, resource, ResourceKind::Menu)
                    .and_then(|_| self.detach_menu(graph, resource));
                reply(name, respond, result);
            }
            GuiCmd::AddMenuItem {
                resource,
                item,
                respond,
            } => {
                let result = self.add_menu_item(graph, resource, item);
                reply(name, respond, result);
            }
            GuiCmd::DeleteMenuItem {
                resource,
                item_id,
                respond,
            } => {
                let result = self.delete_menu_item(graph, resource, item_id);
                reply(name, respond, result);
            }
            GuiCmd::ShowPopupMenu {
                resource,
                window,
                at,
                respond,
            } => {
                let result = self.show_popup_menu(graph, resource, window, at);
                reply(name, respond, result);
            }
            GuiCmd::CreateToolbar {
                resource,
                window,
                respond,
            } => {
                let result = self.create_toolbar(graph, resource, window);
                reply(name, respond, result);
            }
            GuiCmd::DestroyToolbar { resource, respond } => {
                let result = self
                    .expect_kind(graph, resource, ResourceKind::Toolbar)
                    .and_then(|_| self.detach_toolbar(graph, resource));
                reply(name, respond, result);
            }
            GuiCmd::SetToolbarText {
                resource,
                control_id,
                text,
            } => {
                let result = self.set_toolbar_text(graph, resource, control_id, text);
                self.posted(name, result);
            }
            GuiCmd::CreateStatusBar {
                window,
                text,
                respond,
            } => {
                let result = self.create_statusbar(graph, window, text);
                reply(name, respond, result);
            }
            GuiCmd::DestroyStatusBar { window, respond } => {
                let result = self.destroy_statusbar(graph, window);
                reply(name, respond, result);
            }
            GuiCmd::SetStatusBarText { window, text } => {
                let result = self.set_statusbar_text(graph, window, text);
                self.posted(name, result);
            }

            GuiCmd::StartDraw { pixmap, respond } => {
                let result = graph.pixmap(pixmap).map(|p| p.paint.clone());
                reply(name, respond, result);
            }
            GuiCmd::EndDraw { pixmap } => {
                let result = graph.pixmap(pixmap).map(|p| p.window);
                match result {
                    Ok(Some(window)) => self.post_repaint(window),
                    Ok(None) => {}
                    Err(err) => self.posted(name, Err(err)),
                }
            }
            GuiCmd::ShowPixmap {
                pixmap,
                window,
                at,
                respond,
            } => {
                let result = self.show_pixmap(graph, pixmap, window, at);
                reply(name, respond, result);
            }
            GuiCmd::HidePixmap { pixmap, respond } => {
                let result = self.hide_pixmap(graph, pixmap);
                reply(name, respond, result);
            }
            GuiCmd::CopyPixels {
                pixmap,
                image,
                respond,
            } => {
                let result = self.copy_pixels(graph, pixmap, image);
                reply(name, respond, result);
            }
            GuiCmd::DestroyPixmap { pixmap, respond } => {
                let result = self.destroy_pixmap(graph, pixmap);
                reply(name, respond, result);
            }
            GuiCmd::Repaint { window } => {
                let result = self.repaint(graph, window);
                self.posted(name, result);
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn emit(&self, event: GuiEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!("event queue full, dropping {:?}", event.kind);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!("event receiver gone");
            }
        }
    }

    /// Report the outcome of a command that had no reply slot.
    fn posted(&self, name: &'static str, result: GuiResult<()>) {
        if let Err(err) = result {
            tracing::warn!("{} failed: {}", name, err);
            self.emit(
                GuiEvent::new(GuiEventKind::CommandFailed).payload(serde_json::json!({
                    "command": name,
                    "code": err.code(),
                    "message": err.to_string(),
                })),
            );
        }
    }

    fn post_repaint(&self, window: Handle<Window>) {
        let queued = self
            .self_tx
            .upgrade()
            .map(|tx| tx.send(GuiCmd::Repaint { window }).is_ok())
            .unwrap_or(false);
        if !queued {
            tracing::debug!("message queue closed; repaint of {} dropped", window);
        }
    }

    fn destroy_native(&mut self, what: &str, id: NativeId) {
        if let Err(err) = self.backend.destroy(id) {
            tracing::warn!("failed to destroy {} {}: {}", what, id, err);
        }
    }

    fn native_of(&self, graph: &GuiGraph, window: Handle<Window>) -> GuiResult<NativeId> {
        graph
            .live_window(window)?
            .native
            .ok_or_else(|| {
                GuiError::wrong_lifecycle(format!("window {} has no native peer", window))
            })
    }

    fn expect_kind(
        &self,
        graph: &GuiGraph,
        resource: Handle<Resource>,
        kind: ResourceKind,
    ) -> GuiResult<()> {
        let found = graph.resource(resource)?.kind;
        if found != kind {
            return Err(GuiError::wrong_resource_kind(kind.to_string(), found));
        }
        Ok(())
    }

    fn sync_scroll(&mut self, graph: &GuiGraph, window: Handle<Window>) {
        let Ok(win) = graph.window(window) else {
            return;
        };
        if let Some(native) = win.native {
            if let Err(err) = self.backend.set_scroll(native, &win.scroll) {
                tracing::warn!("failed to update scroll bars of {}: {}", window, err);
            }
        }
    }

    /// Create one peer per control, all or nothing.
    fn create_peers(
        &mut self,
        graph: &GuiGraph,
        resource: Handle<Resource>,
        parent: NativeId,
        origin: Point,
    ) -> GuiResult<Vec<NativeId>> {
        let controls = graph.controls(resource)?;
        let mut peers = Vec::with_capacity(controls.len());
        for control in controls {
            match self.backend.create_control(parent, &spec_of(control, origin)) {
                Ok(peer) => peers.push(peer),
                Err(err) => {
                    tracing::warn!(
                        "creating control {} of {} failed, rolling back {} peers",
                        control.id,
                        resource,
                        peers.len()
                    );
                    for peer in peers {
                        self.destroy_native("control", peer);
                    }
                    return Err(err.into());
                }
            }
        }
        Ok(peers)
    }

    fn attach_peers(
        graph: &mut GuiGraph,
        resource: Handle<Resource>,
        peers: Vec<NativeId>,
    ) -> GuiResult<()> {
        for (control, peer) in graph.controls_mut(resource)?.iter_mut().zip(peers) {
            control.peer = Some(peer);
        }
        Ok(())
    }

    fn release_peers(&mut self, graph: &mut GuiGraph, resource: Handle<Resource>) {
        let Ok(controls) = graph.controls_mut(resource) else {
            return;
        };
        let peers: Vec<NativeId> = controls.iter_mut().filter_map(|c| c.peer.take()).collect();
        for peer in peers {
            self.destroy_native("control", peer);
        }
    }

    // ------------------------------------------------------------------
    // Windows
    // ------------------------------------------------------------------

    fn create_window(
        &mut self,
        graph: &mut GuiGraph,
        opts: WindowOpts,
        kind: WindowKind,
    ) -> GuiResult<Handle<Window>> {
        let width = opts.width.unwrap_or(DEFAULT_WIDTH);
        let height = opts.height.unwrap_or(DEFAULT_HEIGHT);
        if width == 0 || height == 0 {
            return Err(GuiError::invalid_options(format!(
                "window size {}x{}",
                width, height
            )));
        }
        let kind = match (kind, opts.floating) {
            (WindowKind::TopLevel, Some(true)) => WindowKind::Floating,
            (kind, _) => kind,
        };
        let title = opts.title.unwrap_or_default();
        let position = Point::new(opts.x.unwrap_or(0), opts.y.unwrap_or(0));
        let size = crate::Size::new(width, height);

        let handle = graph.insert_window(Window::new(kind, title.clone(), position, size))?;
        match self.backend.create_window(kind, &title, position, size) {
            Ok(native) => {
                let win = graph.window_mut(handle)?;
                win.native = Some(native);
                win.lifecycle = Lifecycle::Created;
                tracing::debug!("Created window {} ({:?}) as {}", handle, kind, native);
                self.emit(GuiEvent::new(GuiEventKind::WindowCreated).window(handle));
                Ok(handle)
            }
            Err(err) => {
                graph.free_window(handle);
                tracing::warn!("Failed to create window: {}", err);
                Err(err.into())
            }
        }
    }

    /// Tear down a window and everything attached to it. Shown resources go
    /// back to detached, their peers destroyed; pixel maps are unlinked but
    /// survive.
    fn destroy_window(&mut self, graph: &mut GuiGraph, handle: Handle<Window>) -> GuiResult<()> {
        let win = graph.window_mut(handle)?;
        if win.lifecycle != Lifecycle::Created {
            return Err(GuiError::wrong_lifecycle(format!(
                "window {} is {}",
                handle, win.lifecycle
            )));
        }
        win.lifecycle = Lifecycle::Destroying;
        win.focus = None;
        let native = win.native.take();
        let menu = win.menu;
        let toolbar = win.toolbar;
        let status = win.status.take();

        for resource in graph.shown_resources(handle) {
            self.hide_resource(graph, resource)?;
        }
        if let Some(menu) = menu {
            self.detach_menu(graph, menu)?;
        }
        if let Some(toolbar) = toolbar {
            self.detach_toolbar(graph, toolbar)?;
        }
        for pixmap in graph.shown_pixmaps(handle) {
            graph.unlink_pixmap(handle, pixmap);
        }
        if let Some(status) = status {
            self.destroy_native("status bar", status.native);
        }
        if let Some(native) = native {
            self.destroy_native("window", native);
        }

        graph.free_window(handle);
        tracing::debug!("Window {} destroyed", handle);
        self.emit(GuiEvent::new(GuiEventKind::WindowDestroyed).window(handle));
        Ok(())
    }

    fn set_window_title(
        &mut self,
        graph: &mut GuiGraph,
        window: Handle<Window>,
        title: String,
    ) -> GuiResult<()> {
        let native = self.native_of(graph, window)?;
        self.backend.set_text(native, &title)?;
        graph.window_mut(window)?.title = title;
        Ok(())
    }

    fn window_text(&self, graph: &GuiGraph, window: Handle<Window>) -> GuiResult<String> {
        let native = self.native_of(graph, window)?;
        Ok(self.backend.text(native)?)
    }

    fn window_info(&self, graph: &GuiGraph, window: Handle<Window>) -> GuiResult<WindowInfo> {
        graph.window_info(window)
    }

    fn activate_window(&mut self, graph: &GuiGraph, window: Handle<Window>) -> GuiResult<()> {
        let native = self.native_of(graph, window)?;
        self.backend.activate(native)?;
        self.emit(GuiEvent::new(GuiEventKind::WindowActivated).window(window));
        Ok(())
    }

    /// Apply an edit to the window's caret; the native caret is only
    /// touched when the state actually changes.
    fn update_caret(
        &mut self,
        graph: &mut GuiGraph,
        window: Handle<Window>,
        edit: impl FnOnce(&mut Caret),
    ) -> GuiResult<()> {
        let native = self.native_of(graph, window)?;
        let win = graph.window_mut(window)?;
        let mut caret = win.caret;
        edit(&mut caret);
        if caret == win.caret {
            return Ok(());
        }
        self.backend.set_caret(native, &caret)?;
        win.caret = caret;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dialogs
    // ------------------------------------------------------------------

    fn create_dialog(
        &mut self,
        graph: &mut GuiGraph,
        resource: Handle<Resource>,
        mut opts: WindowOpts,
    ) -> GuiResult<Handle<Window>> {
        self.expect_kind(graph, resource, ResourceKind::Dialog)?;
        let res = graph.resource(resource)?;
        if res.placement != Placement::Detached {
            return Err(GuiError::wrong_lifecycle(format!(
                "dialog {} is already open",
                resource
            )));
        }
        if opts.title.is_none() {
            opts.title = Some(res.title.clone().unwrap_or_else(|| res.name.clone()));
        }
        let fit = fitted_extent(graph.controls(resource)?);
        opts.width = opts.width.or(Some(fit.0));
        opts.height = opts.height.or(Some(fit.1));

        let window = self.create_window(graph, opts, WindowKind::Dialog)?;
        graph.window_mut(window)?.dialog = Some(resource);
        if let Err(err) = self.show_controls(graph, resource, window, Point::ORIGIN, true) {
            if let Err(cleanup) = self.destroy_window(graph, window) {
                tracing::warn!("dialog host {} cleanup failed: {}", window, cleanup);
            }
            return Err(err);
        }
        Ok(window)
    }

    fn destroy_dialog(
        &mut self,
        graph: &mut GuiGraph,
        resource: Handle<Resource>,
    ) -> GuiResult<()> {
        self.expect_kind(graph, resource, ResourceKind::Dialog)?;
        let Placement::Shown { window, .. } = graph.resource(resource)?.placement else {
            return Err(GuiError::wrong_lifecycle(format!(
                "dialog {} is not open",
                resource
            )));
        };
        if graph.window(window)?.dialog != Some(resource) {
            return Err(GuiError::wrong_lifecycle(format!(
                "dialog {} is shown inside {} rather than hosted by it",
                resource, window
            )));
        }
        self.destroy_window(graph, window)
    }

    // ------------------------------------------------------------------
    // Controls
    // ------------------------------------------------------------------

    fn show_controls(
        &mut self,
        graph: &mut GuiGraph,
        resource: Handle<Resource>,
        window: Handle<Window>,
        at: Point,
        activate: bool,
    ) -> GuiResult<()> {
        let parent = self.native_of(graph, window)?;
        let res = graph.resource(resource)?;
        if !matches!(res.kind, ResourceKind::Panel | ResourceKind::Dialog) {
            return Err(GuiError::wrong_resource_kind("panel or dialog", res.kind));
        }
        match res.placement {
            Placement::Detached => {}
            Placement::Shown { window: shown_in, .. } if shown_in == window => {
                tracing::debug!("resource {} already shown in {}", resource, window);
                return Ok(());
            }
            other => {
                return Err(GuiError::wrong_lifecycle(format!(
                    "resource {} is attached to {:?}",
                    resource,
                    other.window()
                )));
            }
        }

        let peers = self.create_peers(graph, resource, parent, at)?;
        Self::attach_peers(graph, resource, peers)?;
        graph.link_resource(window, resource, at)?;
        graph.relayout(window)?;
        self.sync_scroll(graph, window);
        if activate {
            self.fix_focus(graph, window);
        }
        tracing::debug!("Showed resource {} in window {}", resource, window);
        self.emit(
            GuiEvent::new(GuiEventKind::ResourceShown)
                .window(window)
                .resource(resource),
        );
        Ok(())
    }

    /// Returns whether anything was hidden; hiding a detached resource is a
    /// no-op.
    fn hide_resource(
        &mut self,
        graph: &mut GuiGraph,
        resource: Handle<Resource>,
    ) -> GuiResult<bool> {
        let Placement::Shown { window, .. } = graph.resource(resource)?.placement else {
            return Ok(false);
        };
        self.release_peers(graph, resource);
        graph.unlink_resource(window, resource);

        let win = graph.window_mut(window)?;
        let lost_focus = win.focus.map_or(false, |f| f.resource == resource);
        if lost_focus {
            win.focus = None;
        }
        if win.lifecycle == Lifecycle::Created {
            graph.relayout(window)?;
            self.sync_scroll(graph, window);
            if lost_focus {
                self.fix_focus(graph, window);
            }
        }
        tracing::debug!("Hid resource {} from window {}", resource, window);
        self.emit(
            GuiEvent::new(GuiEventKind::ResourceHidden)
                .window(window)
                .resource(resource),
        );
        Ok(true)
    }

    fn destroy_resource(
        &mut self,
        graph: &mut GuiGraph,
        resource: Handle<Resource>,
    ) -> GuiResult<()> {
        let placement = graph.resource(resource)?.placement;
        match placement {
            Placement::Shown { window, .. } => {
                let hosted = graph
                    .window(window)
                    .map(|w| w.dialog == Some(resource))
                    .unwrap_or(false);
                if hosted {
                    self.destroy_window(graph, window)?;
                } else {
                    self.hide_resource(graph, resource)?;
                }
            }
            Placement::Menu { .. } => self.detach_menu(graph, resource)?,
            Placement::Toolbar { .. } => self.detach_toolbar(graph, resource)?,
            Placement::Detached => {}
        }
        graph.free_resource(resource);
        tracing::debug!("Destroyed resource {}", resource);
        Ok(())
    }

    /// Keep the window's focus if it is still valid, otherwise move it to
    /// the first focusable shown control.
    fn fix_focus(&mut self, graph: &mut GuiGraph, window: Handle<Window>) {
        let current = graph.window(window).ok().and_then(|w| w.focus);
        if let Some(focus) = current {
            if graph.resolve_focus(window, focus).is_some() {
                return;
            }
        }
        let target = graph.first_focusable(window);
        if let Err(err) = self.apply_focus(graph, window, target) {
            tracing::warn!("focus fix-up in {} failed: {}", window, err);
        }
    }

    fn apply_focus(
        &mut self,
        graph: &mut GuiGraph,
        window: Handle<Window>,
        target: Option<ControlRef>,
    ) -> GuiResult<()> {
        let Some(target) = target else {
            graph.window_mut(window)?.focus = None;
            return Ok(());
        };
        let control = graph
            .controls(target.resource)?
            .get(target.index)
            .ok_or_else(|| GuiError::generic(format!("stale focus index {}", target.index)))?;
        let control_id = control.id;
        let peer = control.peer.ok_or_else(|| {
            GuiError::wrong_lifecycle(format!("control {} is not shown", control_id))
        })?;
        self.backend.set_focus(peer)?;
        graph.window_mut(window)?.focus = Some(target);
        self.emit(
            GuiEvent::new(GuiEventKind::FocusChanged)
                .window(window)
                .resource(target.resource)
                .control(control_id),
        );
        Ok(())
    }

    fn set_focus(
        &mut self,
        graph: &mut GuiGraph,
        resource: Handle<Resource>,
        control_id: u16,
    ) -> GuiResult<()> {
        let Placement::Shown { window, .. } = graph.resource(resource)?.placement else {
            return Err(GuiError::wrong_lifecycle(format!(
                "resource {} is not shown",
                resource
            )));
        };
        graph.live_window(window)?;
        let index = graph.control_index(resource, control_id)?;
        if !graph.controls(resource)?[index].kind.is_focusable() {
            return Err(GuiError::invalid_options(format!(
                "control {} cannot take the focus",
                control_id
            )));
        }
        self.apply_focus(graph, window, Some(ControlRef { resource, index }))
    }

    fn shown_control<'g>(
        graph: &'g GuiGraph,
        resource: Handle<Resource>,
        control_id: u16,
    ) -> GuiResult<(&'g Control, NativeId)> {
        let control = graph.control(resource, control_id)?;
        let peer = control.peer.ok_or_else(|| {
            GuiError::wrong_lifecycle(format!(
                "control {} of resource {} is not shown",
                control_id, resource
            ))
        })?;
        Ok((control, peer))
    }

    fn control_text(
        &self,
        graph: &GuiGraph,
        resource: Handle<Resource>,
        control_id: u16,
    ) -> GuiResult<String> {
        let (_, peer) = Self::shown_control(graph, resource, control_id)?;
        Ok(self.backend.text(peer)?)
    }

    fn selected_tree_item_text(
        &self,
        graph: &GuiGraph,
        resource: Handle<Resource>,
        control_id: u16,
    ) -> GuiResult<Option<String>> {
        let (control, peer) = Self::shown_control(graph, resource, control_id)?;
        if control.kind != crate::ControlKind::Tree {
            return Err(GuiError::invalid_options(format!(
                "control {} is a {:?}, not a tree",
                control_id, control.kind
            )));
        }
        Ok(self.backend.selected_item_text(peer)?)
    }

    fn erase_drop_list(
        &mut self,
        graph: &mut GuiGraph,
        resource: Handle<Resource>,
        control_id: u16,
    ) -> GuiResult<()> {
        let (control, peer) = Self::shown_control(graph, resource, control_id)?;
        if !control.kind.holds_items() {
            return Err(GuiError::invalid_options(format!(
                "control {} is a {:?}, which has no items",
                control_id, control.kind
            )));
        }
        self.backend.clear_items(peer)?;
        let left = self.backend.item_count(peer)?;
        if left != 0 {
            return Err(GuiError::native_failure(format!(
                "control {} still holds {} items after erase",
                control_id, left
            )));
        }
        let index = graph.control_index(resource, control_id)?;
        graph.controls_mut(resource)?[index].items.clear();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Menus, toolbars, status bars
    // ------------------------------------------------------------------

    fn create_menu(
        &mut self,
        graph: &mut GuiGraph,
        resource: Handle<Resource>,
        window: Handle<Window>,
    ) -> GuiResult<()> {
        let parent = self.native_of(graph, window)?;
        self.expect_kind(graph, resource, ResourceKind::Menu)?;
        let placement = graph.resource(resource)?.placement;
        match placement {
            Placement::Detached => {}
            Placement::Menu { window: on, .. } if on == window => return Ok(()),
            other => {
                return Err(GuiError::wrong_lifecycle(format!(
                    "menu {} is attached to {:?}",
                    resource,
                    other.window()
                )));
            }
        }
        let native = {
            let specs: Vec<ControlSpec<'_>> = graph
                .controls(resource)?
                .iter()
                .map(|c| spec_of(c, Point::ORIGIN))
                .collect();
            self.backend.create_menu(parent, &specs)?
        };
        let old = graph.window(window)?.menu;
        if let Some(old) = old {
            self.detach_menu(graph, old)?;
        }
        graph.resource_mut(resource)?.placement = Placement::Menu { window, native };
        graph.window_mut(window)?.menu = Some(resource);
        tracing::debug!("Attached menu {} to window {}", resource, window);
        Ok(())
    }

    fn detach_menu(&mut self, graph: &mut GuiGraph, resource: Handle<Resource>) -> GuiResult<()> {
        let Placement::Menu { window, native } = graph.resource(resource)?.placement else {
            return Ok(());
        };
        self.destroy_native("menu", native);
        graph.resource_mut(resource)?.placement = Placement::Detached;
        if let Ok(win) = graph.window_mut(window) {
            if win.menu == Some(resource) {
                win.menu = None;
            }
        }
        Ok(())
    }

    /// Append an item to a menu resource, and to its native menu when the
    /// menu is attached to a window.
    fn add_menu_item(
        &mut self,
        graph: &mut GuiGraph,
        resource: Handle<Resource>,
        item: ControlDef,
    ) -> GuiResult<()> {
        self.expect_kind(graph, resource, ResourceKind::Menu)?;
        let item_id = item.id;
        let index = graph.push_control(resource, item)?;
        let Placement::Menu { native, .. } = graph.resource(resource)?.placement else {
            return Ok(());
        };
        let inserted = {
            let control = &graph.controls(resource)?[index];
            self.backend
                .insert_menu_item(native, index, &spec_of(control, Point::ORIGIN))
        };
        if let Err(err) = inserted {
            graph.remove_control(resource, item_id)?;
            return Err(err.into());
        }
        Ok(())
    }

    fn delete_menu_item(
        &mut self,
        graph: &mut GuiGraph,
        resource: Handle<Resource>,
        item_id: u16,
    ) -> GuiResult<()> {
        self.expect_kind(graph, resource, ResourceKind::Menu)?;
        let index = graph.control_index(resource, item_id)?;
        if let Placement::Menu { native, .. } = graph.resource(resource)?.placement {
            self.backend.remove_menu_item(native, index)?;
        }
        graph.remove_control(resource, item_id)?;
        Ok(())
    }

    /// Pop a detached menu resource up as a context menu.
    fn show_popup_menu(
        &mut self,
        graph: &GuiGraph,
        resource: Handle<Resource>,
        window: Handle<Window>,
        at: Point,
    ) -> GuiResult<()> {
        let parent = self.native_of(graph, window)?;
        self.expect_kind(graph, resource, ResourceKind::Menu)?;
        if let Placement::Menu { window: bar, .. } = graph.resource(resource)?.placement {
            return Err(GuiError::wrong_lifecycle(format!(
                "menu {} is the menu bar of {}",
                resource, bar
            )));
        }
        let specs: Vec<ControlSpec<'_>> = graph
            .controls(resource)?
            .iter()
            .map(|c| spec_of(c, Point::ORIGIN))
            .collect();
        self.backend.popup_menu(parent, at, &specs)?;
        Ok(())
    }

    fn create_toolbar(
        &mut self,
        graph: &mut GuiGraph,
        resource: Handle<Resource>,
        window: Handle<Window>,
    ) -> GuiResult<()> {
        let parent = self.native_of(graph, window)?;
        self.expect_kind(graph, resource, ResourceKind::Toolbar)?;
        let placement = graph.resource(resource)?.placement;
        match placement {
            Placement::Detached => {}
            Placement::Toolbar { window: on, .. } if on == window => return Ok(()),
            other => {
                return Err(GuiError::wrong_lifecycle(format!(
                    "toolbar {} is attached to {:?}",
                    resource,
                    other.window()
                )));
            }
        }
        let native = self.backend.create_toolbar(parent)?;
        let peers = match self.create_peers(graph, resource, native, Point::ORIGIN) {
            Ok(peers) => peers,
            Err(err) => {
                self.destroy_native("toolbar", native);
                return Err(err);
            }
        };
        let old = graph.window(window)?.toolbar;
        if let Some(old) = old {
            self.detach_toolbar(graph, old)?;
        }
        Self::attach_peers(graph, resource, peers)?;
        graph.resource_mut(resource)?.placement = Placement::Toolbar { window, native };
        graph.window_mut(window)?.toolbar = Some(resource);
        tracing::debug!("Attached toolbar {} to window {}", resource, window);
        Ok(())
    }

    fn detach_toolbar(
        &mut self,
        graph: &mut GuiGraph,
        resource: Handle<Resource>,
    ) -> GuiResult<()> {
        let Placement::Toolbar { window, native } = graph.resource(resource)?.placement else {
            return Ok(());
        };
        self.release_peers(graph, resource);
        self.destroy_native("toolbar", native);
        graph.resource_mut(resource)?.placement = Placement::Detached;
        if let Ok(win) = graph.window_mut(window) {
            if win.toolbar == Some(resource) {
                win.toolbar = None;
            }
        }
        Ok(())
    }

    fn set_toolbar_text(
        &mut self,
        graph: &mut GuiGraph,
        resource: Handle<Resource>,
        control_id: u16,
        text: String,
    ) -> GuiResult<()> {
        self.expect_kind(graph, resource, ResourceKind::Toolbar)?;
        let index = graph.control_index(resource, control_id)?;
        if let Some(peer) = graph.controls(resource)?[index].peer {
            self.backend.set_text(peer, &text)?;
        }
        graph.controls_mut(resource)?[index].text = text;
        Ok(())
    }

    fn create_statusbar(
        &mut self,
        graph: &mut GuiGraph,
        window: Handle<Window>,
        text: String,
    ) -> GuiResult<()> {
        let parent = self.native_of(graph, window)?;
        let existing = graph.window(window)?.status.as_ref().map(|s| s.native);
        if let Some(existing) = existing {
            self.backend.set_text(existing, &text)?;
            if let Some(status) = graph.window_mut(window)?.status.as_mut() {
                status.text = text;
            }
            return Ok(());
        }
        let native = self.backend.create_statusbar(parent, &text)?;
        graph.window_mut(window)?.status = Some(StatusBar { native, text });
        Ok(())
    }

    fn destroy_statusbar(&mut self, graph: &mut GuiGraph, window: Handle<Window>) -> GuiResult<()> {
        graph.live_window(window)?;
        if let Some(status) = graph.window_mut(window)?.status.take() {
            self.destroy_native("status bar", status.native);
        }
        Ok(())
    }

    fn set_statusbar_text(
        &mut self,
        graph: &mut GuiGraph,
        window: Handle<Window>,
        text: String,
    ) -> GuiResult<()> {
        graph.live_window(window)?;
        let win = graph.window_mut(window)?;
        let Some(status) = win.status.as_mut() else {
            return Err(GuiError::wrong_lifecycle(format!(
                "window {} has no status bar",
                window
            )));
        };
        self.backend.set_text(status.native, &text)?;
        status.text = text;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pixel maps
    // ------------------------------------------------------------------

    fn show_pixmap(
        &mut self,
        graph: &mut GuiGraph,
        pixmap: Handle<Pixmap>,
        window: Handle<Window>,
        at: Point,
    ) -> GuiResult<()> {
        graph.live_window(window)?;
        let current = graph.pixmap(pixmap)?.window;
        match current {
            Some(current) if current == window => {
                graph.pixmap_mut(pixmap)?.origin = at;
            }
            Some(other) => {
                self.unlink_pixmap(graph, other, pixmap)?;
                graph.link_pixmap(window, pixmap, at)?;
            }
            None => graph.link_pixmap(window, pixmap, at)?,
        }
        graph.relayout(window)?;
        self.sync_scroll(graph, window);
        self.post_repaint(window);
        Ok(())
    }

    fn unlink_pixmap(
        &mut self,
        graph: &mut GuiGraph,
        window: Handle<Window>,
        pixmap: Handle<Pixmap>,
    ) -> GuiResult<()> {
        graph.unlink_pixmap(window, pixmap);
        if graph.window(window)?.lifecycle == Lifecycle::Created {
            graph.relayout(window)?;
            self.sync_scroll(graph, window);
            self.post_repaint(window);
        }
        Ok(())
    }

    fn hide_pixmap(&mut self, graph: &mut GuiGraph, pixmap: Handle<Pixmap>) -> GuiResult<()> {
        let current = graph.pixmap(pixmap)?.window;
        match current {
            Some(window) => self.unlink_pixmap(graph, window, pixmap),
            None => Ok(()),
        }
    }

    fn copy_pixels(
        &mut self,
        graph: &mut GuiGraph,
        pixmap: Handle<Pixmap>,
        image: DecodedImage,
    ) -> GuiResult<()> {
        let pix = graph.pixmap(pixmap)?;
        {
            let mut bitmap = pix.paint.lock_for(self.paint_timeout)?;
            bitmap.copy_from(&image);
        }
        let shown_in = pix.window;
        if let Some(window) = shown_in {
            self.post_repaint(window);
        }
        Ok(())
    }

    fn destroy_pixmap(&mut self, graph: &mut GuiGraph, pixmap: Handle<Pixmap>) -> GuiResult<()> {
        let pix = graph.pixmap(pixmap)?;
        // A draw session still open on the interpreter thread keeps it alive.
        drop(pix.paint.lock_for(self.paint_timeout)?);
        let shown_in = pix.window;
        if let Some(window) = shown_in {
            self.unlink_pixmap(graph, window, pixmap)?;
        }
        graph.free_pixmap(pixmap);
        tracing::debug!("Destroyed pixmap {}", pixmap);
        Ok(())
    }

    /// Present every shown pixel map of the window. A map whose paint lock
    /// stays busy for the whole timeout is skipped this round; the session
    /// holding it posts another repaint when it ends.
    fn repaint(&mut self, graph: &GuiGraph, window: Handle<Window>) -> GuiResult<()> {
        let Ok(win) = graph.window(window) else {
            tracing::trace!("repaint for vanished window {}", window);
            return Ok(());
        };
        if win.lifecycle != Lifecycle::Created {
            return Ok(());
        }
        let Some(native) = win.native else {
            return Ok(());
        };
        self.ctx.stats().record_repaint();
        for handle in graph.shown_pixmaps(window) {
            let pix = graph.pixmap(handle)?;
            match pix.paint.lock_for(self.paint_timeout) {
                Ok(mut bitmap) => {
                    self.backend.present(native, pix.origin, &bitmap)?;
                    bitmap.clear_dirty();
                }
                Err(err) => {
                    self.ctx.stats().record_skipped_repaint();
                    tracing::debug!("skipping {} this repaint: {}", handle, err);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    fn shutdown(&mut self, graph: &mut GuiGraph) -> TeardownReport {
        let mut report = TeardownReport::default();
        for window in graph.window_handles() {
            let live = graph
                .window(window)
                .map(|w| w.lifecycle == Lifecycle::Created)
                .unwrap_or(false);
            if live {
                if let Err(err) = self.destroy_window(graph, window) {
                    tracing::warn!("destroying {} during shutdown: {}", window, err);
                }
            }
            graph.free_window(window);
            report.windows += 1;
        }
        for resource in graph.resource_handles() {
            graph.free_resource(resource);
            report.resources += 1;
        }
        for pixmap in graph.pixmap_handles() {
            graph.free_pixmap(pixmap);
            report.pixmaps += 1;
        }
        graph.compact();
        tracing::info!(
            "GUI shut down: released {} windows, {} resources, {} pixmaps",
            report.windows,
            report.resources,
            report.pixmaps
        );
        report
    }
}

fn reply<T>(name: &'static str, respond: Reply<T>, result: GuiResult<T>) {
    if let Err(err) = &result {
        tracing::debug!("{} failed: {}", name, err);
    }
    if respond.send(result).is_err() {
        tracing::debug!("{} reply dropped: caller gone", name);
    }
}

fn spec_of(control: &Control, origin: Point) -> ControlSpec<'_> {
    ControlSpec {
        id: control.id,
        kind: control.kind,
        text: &control.text,
        rect: control.rect.offset(origin),
        items: &control.items,
    }
}

/// Client size that fits every control of a dialog plus a margin.
fn fitted_extent(controls: &[Control]) -> (u32, u32) {
    let bounds = controls.iter().fold(Rect::default(), |acc, c| {
        Rect::new(
            0,
            0,
            acc.width.max(c.rect.right().max(0) as u32),
            acc.height.max(c.rect.bottom().max(0) as u32),
        )
    });
    (
        bounds.width.saturating_add(DIALOG_MARGIN).max(64),
        bounds.height.saturating_add(DIALOG_MARGIN).max(32),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ControlKind;
    use crate::native::HeadlessBackend;
    use crate::{ControlDef, GuiConfig, GuiErrorCode, ResourceDef};
    use tokio::sync::oneshot;

    struct Fixture {
        manager: GuiManager<HeadlessBackend>,
        probe: crate::HeadlessProbe,
        ctx: Arc<GuiContext>,
        queued: mpsc::UnboundedReceiver<GuiCmd>,
        _sender: mpsc::UnboundedSender<GuiCmd>,
        events: mpsc::Receiver<GuiEvent>,
    }

    fn fixture() -> Fixture {
        let ctx = GuiContext::init(GuiConfig {
            paint_timeout_ms: 5,
            ..Default::default()
        });
        let backend = HeadlessBackend::new();
        let probe = backend.probe();
        let (self_tx, queued) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::channel(64);
        Fixture {
            manager: GuiManager::new(ctx.clone(), backend, self_tx.downgrade(), events_tx),
            probe,
            ctx,
            queued,
            _sender: self_tx,
            events,
        }
    }

    fn call<T>(
        manager: &mut GuiManager<HeadlessBackend>,
        make: impl FnOnce(Reply<T>) -> GuiCmd,
    ) -> GuiResult<T> {
        let (tx, mut rx) = oneshot::channel();
        assert!(manager.handle(make(tx)));
        rx.try_recv().expect("reply sent before handle returns")
    }

    fn panel(ctx: &GuiContext, kinds: &[ControlKind]) -> Handle<Resource> {
        ctx.define_resource(ResourceDef {
            name: "panel".into(),
            kind: ResourceKind::Panel,
            title: None,
            controls: kinds
                .iter()
                .enumerate()
                .map(|(i, k)| {
                    ControlDef::new(i as u16 + 1, *k, Rect::new(0, 20 * i as i32, 80, 16))
                })
                .collect(),
        })
        .unwrap()
    }

    fn open_window(f: &mut Fixture) -> Handle<Window> {
        call(&mut f.manager, |respond| GuiCmd::CreateWindow {
            opts: WindowOpts {
                title: Some("main".into()),
                width: Some(100),
                height: Some(40),
                ..Default::default()
            },
            respond,
        })
        .unwrap()
    }

    #[test]
    fn test_show_then_hide_round_trip() {
        let mut f = fixture();
        let window = open_window(&mut f);
        let res = panel(&f.ctx, &[ControlKind::Text, ControlKind::Edit, ControlKind::Button]);

        call(&mut f.manager, |respond| GuiCmd::ShowControls {
            resource: res,
            window,
            at: Point::ORIGIN,
            activate: true,
            respond,
        })
        .unwrap();
        {
            let graph = f.ctx.enter();
            assert!(graph.controls(res).unwrap().iter().all(|c| c.is_shown()));
            let focus = graph.focus(window).unwrap().unwrap();
            assert_eq!(focus.control_id, 2);
            let peer = graph.control(res, 2).unwrap().peer();
            assert_eq!(f.probe.focused(), peer);
            assert_eq!(graph.window(window).unwrap().extent().height, 56);
        }

        call(&mut f.manager, |respond| GuiCmd::HideControls {
            resource: res,
            respond,
        })
        .unwrap();
        let graph = f.ctx.enter();
        assert!(graph.controls(res).unwrap().iter().all(|c| c.peer().is_none()));
        assert_eq!(graph.focus(window).unwrap(), None);
        assert_eq!(graph.window(window).unwrap().extent().height, 0);
        assert_eq!(f.probe.live_objects(), 1);
    }

    #[test]
    fn test_show_failure_rolls_back_peers() {
        let mut f = fixture();
        let window = open_window(&mut f);
        let res = panel(&f.ctx, &[ControlKind::Edit, ControlKind::Edit, ControlKind::Edit]);
        let before = f.probe.live_objects();

        f.probe.fail_after("create_control", 2);
        let err = call(&mut f.manager, |respond| GuiCmd::ShowControls {
            resource: res,
            window,
            at: Point::ORIGIN,
            activate: true,
            respond,
        })
        .unwrap_err();
        assert_eq!(err.code(), GuiErrorCode::NativeFailure as u32);
        assert_eq!(f.probe.live_objects(), before);
        let graph = f.ctx.enter();
        assert_eq!(graph.resource(res).unwrap().placement(), Placement::Detached);
        assert!(graph.shown_resources(window).is_empty());
    }

    #[test]
    fn test_destroy_window_cascades() {
        let mut f = fixture();
        let window = open_window(&mut f);
        let res = panel(&f.ctx, &[ControlKind::Edit]);
        call(&mut f.manager, |respond| GuiCmd::ShowControls {
            resource: res,
            window,
            at: Point::ORIGIN,
            activate: true,
            respond,
        })
        .unwrap();
        call(&mut f.manager, |respond| GuiCmd::CreateStatusBar {
            window,
            text: "ready".into(),
            respond,
        })
        .unwrap();

        call(&mut f.manager, |respond| GuiCmd::DestroyWindow { window, respond }).unwrap();
        assert_eq!(f.probe.live_objects(), 0);
        {
            let graph = f.ctx.enter();
            assert!(graph.window(window).is_err());
            let r = graph.resource(res).unwrap();
            assert_eq!(r.placement(), Placement::Detached);
            assert!(graph.controls(res).unwrap()[0].peer().is_none());
        }

        let err = call(&mut f.manager, |respond| GuiCmd::GetWindowText { window, respond })
            .unwrap_err();
        assert_eq!(err.code(), GuiErrorCode::InvalidHandle as u32);
    }

    #[test]
    fn test_posted_failure_becomes_event() {
        let mut f = fixture();
        assert!(f.manager.handle(GuiCmd::SetWindowTitle {
            window: Handle::from_raw(0xdead),
            title: "x".into(),
        }));
        let event = f.events.try_recv().unwrap();
        assert_eq!(event.kind, GuiEventKind::CommandFailed);
        assert_eq!(event.payload["command"], "SetWindowTitle");
        assert_eq!(event.payload["code"], GuiErrorCode::InvalidHandle as u32);
    }

    #[test]
    fn test_copy_pixels_busy_while_session_open() {
        let mut f = fixture();
        let pixmap = f
            .ctx
            .define_pixmap(crate::PixmapOpts {
                name: Some("canvas".into()),
                width: 2,
                height: 2,
                bits_per_pixel: 24,
                fill: 0,
            })
            .unwrap();
        let paint = call(&mut f.manager, |respond| GuiCmd::StartDraw { pixmap, respond }).unwrap();

        let holder = std::thread::spawn(move || {
            let _session = paint.lock_owned();
            std::thread::sleep(Duration::from_millis(100));
        });
        std::thread::sleep(Duration::from_millis(20));

        let image = DecodedImage {
            width: 2,
            height: 2,
            pixels: vec![1; 4],
        };
        let err = call(&mut f.manager, |respond| GuiCmd::CopyPixels {
            pixmap,
            image: image.clone(),
            respond,
        })
        .unwrap_err();
        assert_eq!(err.code(), GuiErrorCode::PaintBusy as u32);
        let err = call(&mut f.manager, |respond| GuiCmd::DestroyPixmap { pixmap, respond })
            .unwrap_err();
        assert_eq!(err.code(), GuiErrorCode::PaintBusy as u32);

        holder.join().unwrap();
        call(&mut f.manager, |respond| GuiCmd::CopyPixels {
            pixmap,
            image,
            respond,
        })
        .unwrap();
        let graph = f.ctx.enter();
        let pix = graph.pixmap(pixmap).unwrap();
        assert_eq!(pix.paint().lock_for(Duration::from_millis(5)).unwrap().pixels(), &[1; 4]);
    }

    #[test]
    fn test_show_pixmap_queues_repaint() {
        let mut f = fixture();
        let window = open_window(&mut f);
        let pixmap = f
            .ctx
            .define_pixmap(crate::PixmapOpts {
                name: None,
                width: 3,
                height: 3,
                bits_per_pixel: 24,
                fill: 7,
            })
            .unwrap();
        call(&mut f.manager, |respond| GuiCmd::ShowPixmap {
            pixmap,
            window,
            at: Point::new(1, 1),
            respond,
        })
        .unwrap();
        let queued = f.queued.try_recv().unwrap();
        assert_eq!(queued.name(), "Repaint");
        assert!(f.manager.handle(queued));
        let frames = f.probe.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].at, Point::new(1, 1));
        assert!(frames[0].is_uniform());
        assert_eq!(frames[0].pixels[0], 7);
    }

    #[test]
    fn test_dialog_lifecycle() {
        let mut f = fixture();
        let dialog = f
            .ctx
            .define_resource(ResourceDef {
                name: "confirm".into(),
                kind: ResourceKind::Dialog,
                title: Some("Confirm".into()),
                controls: vec![
                    ControlDef::new(1, ControlKind::Text, Rect::new(8, 8, 120, 16))
                        .with_text("Sure?"),
                    ControlDef::new(2, ControlKind::DefPushButton, Rect::new(8, 30, 60, 20))
                        .with_text("OK"),
                ],
            })
            .unwrap();
        let host = call(&mut f.manager, |respond| GuiCmd::CreateDialog {
            resource: dialog,
            opts: WindowOpts::default(),
            respond,
        })
        .unwrap();
        let text = call(&mut f.manager, |respond| GuiCmd::GetWindowText {
            window: host,
            respond,
        })
        .unwrap();
        assert_eq!(text, "Confirm");
        {
            let graph = f.ctx.enter();
            let win = graph.window(host).unwrap();
            assert_eq!(win.kind, WindowKind::Dialog);
            assert_eq!(win.client_size(), crate::Size::new(136, 58));
            assert_eq!(graph.focus(host).unwrap().unwrap().control_id, 2);
        }

        let err = call(&mut f.manager, |respond| GuiCmd::CreateDialog {
            resource: dialog,
            opts: WindowOpts::default(),
            respond,
        })
        .unwrap_err();
        assert_eq!(err.code(), GuiErrorCode::WrongLifecycle as u32);

        call(&mut f.manager, |respond| GuiCmd::DestroyDialog {
            resource: dialog,
            respond,
        })
        .unwrap();
        assert_eq!(f.probe.live_objects(), 0);
        assert!(f.ctx.enter().window(host).is_err());
    }

    #[test]
    fn test_menu_and_toolbar_attach() {
        let mut f = fixture();
        let window = open_window(&mut f);
        let menu = f
            .ctx
            .define_resource(ResourceDef {
                name: "file".into(),
                kind: ResourceKind::Menu,
                title: None,
                controls: vec![
                    ControlDef::new(1, ControlKind::MenuItem, Rect::default()).with_text("Open"),
                    ControlDef::new(2, ControlKind::MenuSeparator, Rect::default()),
                ],
            })
            .unwrap();
        let toolbar = f
            .ctx
            .define_resource(ResourceDef {
                name: "tools".into(),
                kind: ResourceKind::Toolbar,
                title: None,
                controls: vec![ControlDef::new(
                    1,
                    ControlKind::ToolbarButton,
                    Rect::new(0, 0, 16, 16),
                )],
            })
            .unwrap();

        let err = call(&mut f.manager, |respond| GuiCmd::CreateMenu {
            resource: toolbar,
            window,
            respond,
        })
        .unwrap_err();
        assert_eq!(err.code(), GuiErrorCode::WrongResourceKind as u32);

        call(&mut f.manager, |respond| GuiCmd::CreateMenu {
            resource: menu,
            window,
            respond,
        })
        .unwrap();
        call(&mut f.manager, |respond| GuiCmd::CreateToolbar {
            resource: toolbar,
            window,
            respond,
        })
        .unwrap();
        // window + menu + toolbar + one button
        assert_eq!(f.probe.live_objects(), 4);
        {
            let graph = f.ctx.enter();
            let win = graph.window(window).unwrap();
            assert_eq!(win.menu(), Some(menu));
            assert_eq!(win.toolbar(), Some(toolbar));
        }

        call(&mut f.manager, |respond| GuiCmd::DestroyToolbar {
            resource: toolbar,
            respond,
        })
        .unwrap();
        call(&mut f.manager, |respond| GuiCmd::DestroyMenu { resource: menu, respond }).unwrap();
        assert_eq!(f.probe.live_objects(), 1);
        let graph = f.ctx.enter();
        assert_eq!(graph.window(window).unwrap().menu(), None);
        assert_eq!(graph.resource(toolbar).unwrap().placement(), Placement::Detached);
    }

    fn file_menu(ctx: &GuiContext) -> Handle<Resource> {
        ctx.define_resource(ResourceDef {
            name: "file".into(),
            kind: ResourceKind::Menu,
            title: None,
            controls: vec![
                ControlDef::new(1, ControlKind::MenuItem, Rect::default()).with_text("Open"),
                ControlDef::new(2, ControlKind::MenuSeparator, Rect::default()),
            ],
        })
        .unwrap()
    }

    fn menu_native(ctx: &GuiContext, menu: Handle<Resource>) -> NativeId {
        match ctx.enter().resource(menu).unwrap().placement() {
            Placement::Menu { native, .. } => native,
            other => panic!("menu not attached: {:?}", other),
        }
    }

    #[test]
    fn test_menu_items_follow_attached_menu() {
        let mut f = fixture();
        let window = open_window(&mut f);
        let menu = file_menu(&f.ctx);
        let item = |id, text: &str| ControlDef::new(id, ControlKind::MenuItem, Rect::default())
            .with_text(text);

        call(&mut f.manager, |respond| GuiCmd::AddMenuItem {
            resource: menu,
            item: item(3, "Save"),
            respond,
        })
        .unwrap();
        call(&mut f.manager, |respond| GuiCmd::CreateMenu {
            resource: menu,
            window,
            respond,
        })
        .unwrap();
        let native = menu_native(&f.ctx, menu);
        assert_eq!(f.probe.items(native).unwrap(), vec!["Open", "", "Save"]);

        call(&mut f.manager, |respond| GuiCmd::AddMenuItem {
            resource: menu,
            item: item(4, "Quit"),
            respond,
        })
        .unwrap();
        call(&mut f.manager, |respond| GuiCmd::DeleteMenuItem {
            resource: menu,
            item_id: 1,
            respond,
        })
        .unwrap();
        assert_eq!(f.probe.items(native).unwrap(), vec!["", "Save", "Quit"]);

        let err = call(&mut f.manager, |respond| GuiCmd::AddMenuItem {
            resource: menu,
            item: item(3, "Again"),
            respond,
        })
        .unwrap_err();
        assert_eq!(err.code(), GuiErrorCode::InvalidOptions as u32);
        let err = call(&mut f.manager, |respond| GuiCmd::DeleteMenuItem {
            resource: menu,
            item_id: 9,
            respond,
        })
        .unwrap_err();
        assert_eq!(err.code(), GuiErrorCode::ControlNotFound as u32);

        f.probe.fail_next("insert_menu_item");
        let err = call(&mut f.manager, |respond| GuiCmd::AddMenuItem {
            resource: menu,
            item: item(5, "Print"),
            respond,
        })
        .unwrap_err();
        assert_eq!(err.code(), GuiErrorCode::NativeFailure as u32);
        assert_eq!(f.ctx.enter().controls(menu).unwrap().len(), 3);
        assert_eq!(f.probe.items(native).unwrap().len(), 3);
    }

    #[test]
    fn test_popup_menu_and_toolbar_text() {
        let mut f = fixture();
        let window = open_window(&mut f);
        let menu = file_menu(&f.ctx);
        let toolbar = f
            .ctx
            .define_resource(ResourceDef {
                name: "tools".into(),
                kind: ResourceKind::Toolbar,
                title: None,
                controls: vec![ControlDef::new(
                    1,
                    ControlKind::ToolbarButton,
                    Rect::new(0, 0, 16, 16),
                )
                .with_text("Copy")],
            })
            .unwrap();

        call(&mut f.manager, |respond| GuiCmd::ShowPopupMenu {
            resource: menu,
            window,
            at: Point::new(30, 12),
            respond,
        })
        .unwrap();
        let popup = f.probe.last_popup().unwrap();
        assert_eq!(popup.at, Point::new(30, 12));
        assert_eq!(popup.items, vec!["Open", ""]);

        call(&mut f.manager, |respond| GuiCmd::CreateMenu {
            resource: menu,
            window,
            respond,
        })
        .unwrap();
        let err = call(&mut f.manager, |respond| GuiCmd::ShowPopupMenu {
            resource: menu,
            window,
            at: Point::ORIGIN,
            respond,
        })
        .unwrap_err();
        assert_eq!(err.code(), GuiErrorCode::WrongLifecycle as u32);

        call(&mut f.manager, |respond| GuiCmd::CreateToolbar {
            resource: toolbar,
            window,
            respond,
        })
        .unwrap();
        assert!(f.manager.handle(GuiCmd::SetToolbarText {
            resource: toolbar,
            control_id: 1,
            text: "Paste".into(),
        }));
        let peer = f.ctx.enter().control(toolbar, 1).unwrap().peer().unwrap();
        assert_eq!(f.probe.text(peer).as_deref(), Some("Paste"));

        while f.events.try_recv().is_ok() {}
        assert!(f.manager.handle(GuiCmd::SetToolbarText {
            resource: menu,
            control_id: 1,
            text: "Nope".into(),
        }));
        let event = f.events.try_recv().unwrap();
        assert_eq!(event.kind, GuiEventKind::CommandFailed);
        assert_eq!(event.payload["code"], GuiErrorCode::WrongResourceKind as u32);
    }

    #[test]
    fn test_caret_and_activation() {
        let mut f = fixture();
        let window = open_window(&mut f);
        let native = f.ctx.enter().window(window).unwrap().native().unwrap();

        assert!(f.manager.handle(GuiCmd::MoveCaret {
            window,
            at: Point::new(5, 6),
        }));
        assert!(f.manager.handle(GuiCmd::ShowCaret { window }));
        let calls = f.probe.calls();
        assert!(f.manager.handle(GuiCmd::ShowCaret { window }));
        assert_eq!(f.probe.calls(), calls);
        assert_eq!(
            f.probe.caret(native),
            Some(Caret {
                visible: true,
                at: Point::new(5, 6),
            })
        );
        let info = call(&mut f.manager, |respond| GuiCmd::GetWindowInfo { window, respond })
            .unwrap();
        assert!(info.caret.visible);
        assert!(f.manager.handle(GuiCmd::HideCaret { window }));
        assert!(!f.probe.caret(native).unwrap().visible);

        while f.events.try_recv().is_ok() {}
        call(&mut f.manager, |respond| GuiCmd::ActivateWindow { window, respond }).unwrap();
        assert_eq!(f.probe.active(), Some(native));
        assert_eq!(f.events.try_recv().unwrap().kind, GuiEventKind::WindowActivated);
    }

    #[test]
    fn test_shutdown_releases_all() {
        let mut f = fixture();
        let window = open_window(&mut f);
        let res = panel(&f.ctx, &[ControlKind::Edit]);
        call(&mut f.manager, |respond| GuiCmd::ShowControls {
            resource: res,
            window,
            at: Point::ORIGIN,
            activate: false,
            respond,
        })
        .unwrap();
        assert_eq!(f.ctx.enter().focus(window).unwrap(), None);

        let (tx, mut rx) = oneshot::channel();
        assert!(!f.manager.handle(GuiCmd::Shutdown { respond: tx }));
        let report = rx.try_recv().unwrap();
        assert_eq!(report.windows, 1);
        assert_eq!(report.resources, 1);
        assert_eq!(f.probe.live_objects(), 0);
        assert_eq!(f.ctx.teardown().total(), 0);
    }
}
