//! The object graph: every window, resource, control array and pixel map,
//! plus the structural edits (linking, layout) the manager performs on them.
//!
//! A `GuiGraph` is only reachable through [`GuiContext::enter`], so holding a
//! `&mut GuiGraph` means holding the critical section.
//!
//! [`GuiContext::enter`]: crate::GuiContext::enter

use crate::handles::{Handle, HandleKind, HandleTable};
use crate::model::{
    Control, ControlRef, Pixmap, Placement, Point, Resource, Size, Window,
};
use crate::{ControlDef, FocusInfo, GuiError, GuiResult, PixmapOpts, ResourceDef, WindowInfo};
use serde::Serialize;

/// Live object counts per table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct GraphCounts {
    pub windows: usize,
    pub resources: usize,
    pub control_arrays: usize,
    pub pixmaps: usize,
}

pub struct GuiGraph {
    windows: HandleTable<Window>,
    resources: HandleTable<Resource>,
    controls: HandleTable<Vec<Control>>,
    pixmaps: HandleTable<Pixmap>,
    pixmap_serial: u64,
    max_pixmap_pixels: u64,
}

impl GuiGraph {
    pub fn new(max_handles: usize) -> Self {
        Self {
            windows: HandleTable::new(HandleKind::Window, max_handles),
            resources: HandleTable::new(HandleKind::Resource, max_handles),
            controls: HandleTable::new(HandleKind::Controls, max_handles),
            pixmaps: HandleTable::new(HandleKind::Pixmap, max_handles),
            pixmap_serial: 0,
            max_pixmap_pixels: u64::MAX,
        }
    }

    /// Refuse pixel maps larger than `pixels` with `OutOfMemory`.
    pub fn with_pixel_limit(mut self, pixels: u64) -> Self {
        self.max_pixmap_pixels = pixels;
        self
    }

    pub fn counts(&self) -> GraphCounts {
        GraphCounts {
            windows: self.windows.len(),
            resources: self.resources.len(),
            control_arrays: self.controls.len(),
            pixmaps: self.pixmaps.len(),
        }
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn window(&self, handle: Handle<Window>) -> GuiResult<&Window> {
        self.windows.deref(handle)
    }

    pub fn window_mut(&mut self, handle: Handle<Window>) -> GuiResult<&mut Window> {
        self.windows.deref_mut(handle)
    }

    pub fn resource(&self, handle: Handle<Resource>) -> GuiResult<&Resource> {
        self.resources.deref(handle)
    }

    pub fn resource_mut(&mut self, handle: Handle<Resource>) -> GuiResult<&mut Resource> {
        self.resources.deref_mut(handle)
    }

    pub fn controls(&self, resource: Handle<Resource>) -> GuiResult<&[Control]> {
        let array = self.resource(resource)?.controls;
        Ok(self.controls.deref(array)?.as_slice())
    }

    pub fn controls_mut(&mut self, resource: Handle<Resource>) -> GuiResult<&mut Vec<Control>> {
        let array = self.resource(resource)?.controls;
        self.controls.deref_mut(array)
    }

    pub fn control_index(&self, resource: Handle<Resource>, control_id: u16) -> GuiResult<usize> {
        self.controls(resource)?
            .iter()
            .position(|c| c.id == control_id)
            .ok_or_else(|| GuiError::control_not_found(resource, control_id))
    }

    pub fn control(&self, resource: Handle<Resource>, control_id: u16) -> GuiResult<&Control> {
        let index = self.control_index(resource, control_id)?;
        Ok(&self.controls(resource)?[index])
    }

    pub fn pixmap(&self, handle: Handle<Pixmap>) -> GuiResult<&Pixmap> {
        self.pixmaps.deref(handle)
    }

    pub fn pixmap_mut(&mut self, handle: Handle<Pixmap>) -> GuiResult<&mut Pixmap> {
        self.pixmaps.deref_mut(handle)
    }

    /// The window must exist and be fully created.
    pub fn live_window(&self, handle: Handle<Window>) -> GuiResult<&Window> {
        let window = self.window(handle)?;
        if window.lifecycle != crate::Lifecycle::Created {
            return Err(GuiError::wrong_lifecycle(format!(
                "window {} is {}",
                handle, window.lifecycle
            )));
        }
        Ok(window)
    }

    pub fn window_handles(&self) -> Vec<Handle<Window>> {
        self.windows.handles()
    }

    pub fn resource_handles(&self) -> Vec<Handle<Resource>> {
        self.resources.handles()
    }

    pub fn pixmap_handles(&self) -> Vec<Handle<Pixmap>> {
        self.pixmaps.handles()
    }

    // ------------------------------------------------------------------
    // Definition (interpreter side, no native objects involved)
    // ------------------------------------------------------------------

    pub fn define_resource(&mut self, def: ResourceDef) -> GuiResult<Handle<Resource>> {
        if def.name.is_empty() {
            return Err(GuiError::invalid_options("resource name must not be empty"));
        }
        for c in &def.controls {
            if !c.kind.fits(def.kind) {
                return Err(GuiError::invalid_options(format!(
                    "{:?} control {} does not belong in a {}",
                    c.kind, c.id, def.kind
                )));
            }
        }
        let array = self.controls.allocate(Vec::new())?;
        let resource = match self.resources.allocate(Resource {
            name: def.name,
            kind: def.kind,
            title: def.title,
            controls: array,
            placement: Placement::Detached,
            next_shown: None,
        }) {
            Ok(handle) => handle,
            Err(err) => {
                self.controls.free(array);
                return Err(err);
            }
        };
        for c in def.controls {
            if let Err(err) = self.append_control(resource, c) {
                self.free_resource(resource);
                return Err(err);
            }
        }
        Ok(resource)
    }

    /// Grow the resource's control array by one. Only allowed while the
    /// resource is not attached to a window.
    pub fn append_control(&mut self, resource: Handle<Resource>, def: ControlDef) -> GuiResult<()> {
        if self.resource(resource)?.placement != Placement::Detached {
            return Err(GuiError::wrong_lifecycle(format!(
                "resource {} is attached; hide it before adding controls",
                resource
            )));
        }
        self.push_control(resource, def).map(|_| ())
    }

    /// Append without the detached check; the UI thread uses this for menus
    /// whose native peer it updates itself. Returns the new index.
    pub(crate) fn push_control(
        &mut self,
        resource: Handle<Resource>,
        def: ControlDef,
    ) -> GuiResult<usize> {
        let res = self.resource(resource)?;
        if !def.kind.fits(res.kind) {
            return Err(GuiError::invalid_options(format!(
                "{:?} control does not belong in a {}",
                def.kind, res.kind
            )));
        }
        if self.controls(resource)?.iter().any(|c| c.id == def.id) {
            return Err(GuiError::invalid_options(format!(
                "duplicate control id {} in resource {}",
                def.id, resource
            )));
        }
        let array = res.controls;
        let len = self.controls.deref(array)?.len();
        let array = self.controls.resize(array, len + 1)?;
        let slot = &mut self.controls.deref_mut(array)?[len];
        *slot = Control {
            id: def.id,
            kind: def.kind,
            rect: def.rect(),
            text: def.text,
            items: def.items,
            peer: None,
            resource: Some(resource),
        };
        Ok(len)
    }

    /// Remove a control from its resource's array, shrinking it by one.
    /// Returns the removed control and the index it had.
    pub(crate) fn remove_control(
        &mut self,
        resource: Handle<Resource>,
        control_id: u16,
    ) -> GuiResult<(usize, Control)> {
        let index = self.control_index(resource, control_id)?;
        let array = self.resource(resource)?.controls;
        let control = self.controls.deref_mut(array)?.remove(index);
        Ok((index, control))
    }

    pub fn define_pixmap(&mut self, opts: PixmapOpts) -> GuiResult<Handle<Pixmap>> {
        if opts.width == 0 || opts.height == 0 {
            return Err(GuiError::invalid_options("pixel map must not be empty"));
        }
        if !matches!(opts.bits_per_pixel, 1 | 4 | 8 | 16 | 24 | 32) {
            return Err(GuiError::invalid_options(format!(
                "unsupported depth {}",
                opts.bits_per_pixel
            )));
        }
        let pixels = u64::from(opts.width) * u64::from(opts.height);
        if pixels > self.max_pixmap_pixels {
            return Err(GuiError::out_of_memory(format!(
                "{}x{} pixel map exceeds the limit of {} pixels",
                opts.width, opts.height, self.max_pixmap_pixels
            )));
        }
        self.pixmap_serial += 1;
        let name = opts
            .name
            .unwrap_or_else(|| format!("pixmap-{}", self.pixmap_serial));
        let pixmap = Pixmap::new(
            name,
            Size::new(opts.width, opts.height),
            opts.bits_per_pixel,
            opts.fill,
        )?;
        self.pixmaps.allocate(pixmap)
    }

    // ------------------------------------------------------------------
    // Allocation and release (UI thread)
    // ------------------------------------------------------------------

    pub(crate) fn insert_window(&mut self, window: Window) -> GuiResult<Handle<Window>> {
        self.windows.allocate(window)
    }

    pub(crate) fn free_window(&mut self, handle: Handle<Window>) -> Option<Window> {
        self.windows.free(handle)
    }

    /// Release a resource and its control array. The caller has already
    /// detached it.
    pub(crate) fn free_resource(&mut self, handle: Handle<Resource>) -> Option<Resource> {
        let resource = self.resources.free(handle)?;
        self.controls.free(resource.controls);
        Some(resource)
    }

    pub(crate) fn free_pixmap(&mut self, handle: Handle<Pixmap>) -> Option<Pixmap> {
        self.pixmaps.free(handle)
    }

    pub(crate) fn compact(&mut self) {
        self.windows.compact();
        self.resources.compact();
        self.controls.compact();
        self.pixmaps.compact();
    }

    // ------------------------------------------------------------------
    // Shown lists
    // ------------------------------------------------------------------

    /// Resources shown in the window, oldest first.
    pub fn shown_resources(&self, window: Handle<Window>) -> Vec<Handle<Resource>> {
        let mut out = Vec::new();
        let mut cursor = self.windows.get(window).and_then(|w| w.shown_head);
        while let Some(handle) = cursor {
            let Some(resource) = self.resources.get(handle) else {
                break;
            };
            out.push(handle);
            cursor = resource.next_shown;
        }
        out
    }

    /// Pixel maps shown in the window, oldest first.
    pub fn shown_pixmaps(&self, window: Handle<Window>) -> Vec<Handle<Pixmap>> {
        let mut out = Vec::new();
        let mut cursor = self.windows.get(window).and_then(|w| w.pix_head);
        while let Some(handle) = cursor {
            let Some(pixmap) = self.pixmaps.get(handle) else {
                break;
            };
            out.push(handle);
            cursor = pixmap.next_shown;
        }
        out
    }

    pub(crate) fn link_resource(
        &mut self,
        window: Handle<Window>,
        resource: Handle<Resource>,
        origin: Point,
    ) -> GuiResult<()> {
        let tail = self.shown_resources(window).last().copied();
        match tail {
            Some(tail) => self.resource_mut(tail)?.next_shown = Some(resource),
            None => self.window_mut(window)?.shown_head = Some(resource),
        }
        let res = self.resource_mut(resource)?;
        res.next_shown = None;
        res.placement = Placement::Shown { window, origin };
        Ok(())
    }

    pub(crate) fn unlink_resource(&mut self, window: Handle<Window>, resource: Handle<Resource>) {
        let next = self.resources.get(resource).and_then(|r| r.next_shown);
        let list = self.shown_resources(window);
        match list.iter().position(|h| *h == resource) {
            Some(0) => {
                if let Some(w) = self.windows.get_mut(window) {
                    w.shown_head = next;
                }
            }
            Some(i) => {
                if let Some(prev) = self.resources.get_mut(list[i - 1]) {
                    prev.next_shown = next;
                }
            }
            None => {}
        }
        if let Some(res) = self.resources.get_mut(resource) {
            res.next_shown = None;
            res.placement = Placement::Detached;
        }
    }

    pub(crate) fn link_pixmap(
        &mut self,
        window: Handle<Window>,
        pixmap: Handle<Pixmap>,
        origin: Point,
    ) -> GuiResult<()> {
        let tail = self.shown_pixmaps(window).last().copied();
        match tail {
            Some(tail) => self.pixmap_mut(tail)?.next_shown = Some(pixmap),
            None => self.window_mut(window)?.pix_head = Some(pixmap),
        }
        let pix = self.pixmap_mut(pixmap)?;
        pix.next_shown = None;
        pix.window = Some(window);
        pix.origin = origin;
        Ok(())
    }

    pub(crate) fn unlink_pixmap(&mut self, window: Handle<Window>, pixmap: Handle<Pixmap>) {
        let next = self.pixmaps.get(pixmap).and_then(|p| p.next_shown);
        let list = self.shown_pixmaps(window);
        match list.iter().position(|h| *h == pixmap) {
            Some(0) => {
                if let Some(w) = self.windows.get_mut(window) {
                    w.pix_head = next;
                }
            }
            Some(i) => {
                if let Some(prev) = self.pixmaps.get_mut(list[i - 1]) {
                    prev.next_shown = next;
                }
            }
            None => {}
        }
        if let Some(pix) = self.pixmaps.get_mut(pixmap) {
            pix.next_shown = None;
            pix.window = None;
        }
    }

    // ------------------------------------------------------------------
    // Layout and focus
    // ------------------------------------------------------------------

    /// Recompute the window's content extent and scroll ranges from what is
    /// shown in it.
    pub(crate) fn relayout(&mut self, window: Handle<Window>) -> GuiResult<()> {
        let (mut right, mut bottom) = (0i32, 0i32);
        for handle in self.shown_resources(window) {
            let Placement::Shown { origin, .. } = self.resource(handle)?.placement else {
                continue;
            };
            for control in self.controls(handle)? {
                let rect = control.rect.offset(origin);
                right = right.max(rect.right());
                bottom = bottom.max(rect.bottom());
            }
        }
        for handle in self.shown_pixmaps(window) {
            let bounds = self.pixmap(handle)?.bounds();
            right = right.max(bounds.right());
            bottom = bottom.max(bounds.bottom());
        }
        let win = self.window_mut(window)?;
        win.extent = Size::new(right.max(0) as u32, bottom.max(0) as u32);
        let client = win.client;
        let extent = win.extent;
        win.scroll.fit(extent, client);
        Ok(())
    }

    /// The window's focus if it still names a shown control of a resource
    /// shown in that window.
    pub fn focus(&self, window: Handle<Window>) -> GuiResult<Option<FocusInfo>> {
        let Some(focus) = self.window(window)?.focus else {
            return Ok(None);
        };
        Ok(self.resolve_focus(window, focus))
    }

    pub(crate) fn resolve_focus(
        &self,
        window: Handle<Window>,
        focus: ControlRef,
    ) -> Option<FocusInfo> {
        let resource = self.resources.get(focus.resource)?;
        if resource.placement.window() != Some(window) || !resource.is_shown() {
            return None;
        }
        let control = self.controls.get(resource.controls)?.get(focus.index)?;
        control.peer?;
        Some(FocusInfo {
            resource: focus.resource,
            control_id: control.id,
        })
    }

    /// First focusable shown control of the window, in show order.
    pub(crate) fn first_focusable(&self, window: Handle<Window>) -> Option<ControlRef> {
        self.shown_resources(window).into_iter().find_map(|resource| {
            let controls = self.controls(resource).ok()?;
            controls
                .iter()
                .position(|c| c.kind.is_focusable() && c.peer.is_some())
                .map(|index| ControlRef { resource, index })
        })
    }

    pub fn window_info(&self, window: Handle<Window>) -> GuiResult<WindowInfo> {
        let win = self.window(window)?;
        Ok(WindowInfo {
            kind: win.kind,
            lifecycle: win.lifecycle,
            title: win.title.clone(),
            position: win.position,
            client: win.client,
            extent: win.extent,
            scroll: win.scroll,
            shown_resources: self.shown_resources(window),
            shown_pixmaps: self.shown_pixmaps(window),
            focus: self.focus(window)?,
            menu: win.menu,
            toolbar: win.toolbar,
            status_text: win.status_text().map(str::to_string),
            caret: win.caret,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ControlKind, Rect, ResourceKind, WindowKind};
    use crate::GuiErrorCode;

    fn panel(name: &str, ids: &[u16]) -> ResourceDef {
        ResourceDef {
            name: name.to_string(),
            kind: ResourceKind::Panel,
            title: None,
            controls: ids
                .iter()
                .map(|&id| {
                    ControlDef::new(id, ControlKind::Edit, Rect::new(0, 20 * id as i32, 100, 16))
                })
                .collect(),
        }
    }

    fn window(graph: &mut GuiGraph) -> Handle<Window> {
        graph
            .insert_window(Window::new(
                WindowKind::TopLevel,
                "w".into(),
                Point::ORIGIN,
                Size::new(100, 50),
            ))
            .unwrap()
    }

    #[test]
    fn test_define_resource_builds_control_array() {
        let mut graph = GuiGraph::new(64);
        let res = graph.define_resource(panel("p", &[1, 2, 3])).unwrap();
        let controls = graph.controls(res).unwrap();
        assert_eq!(controls.len(), 3);
        assert!(controls.iter().all(|c| c.resource() == Some(res) && c.peer().is_none()));
        assert_eq!(graph.control_index(res, 3).unwrap(), 2);

        let err = graph.control_index(res, 9).unwrap_err();
        assert_eq!(err.code(), GuiErrorCode::ControlNotFound as u32);
    }

    #[test]
    fn test_define_resource_rejects_bad_controls() {
        let mut graph = GuiGraph::new(64);
        let mut def = panel("p", &[1, 1]);
        let err = graph.define_resource(def.clone()).unwrap_err();
        assert_eq!(err.code(), GuiErrorCode::InvalidOptions as u32);
        // Nothing leaks from a failed definition.
        assert_eq!(graph.counts(), GraphCounts::default());

        def.kind = ResourceKind::Menu;
        assert!(graph.define_resource(def).is_err());
    }

    #[test]
    fn test_shown_list_keeps_show_order() {
        let mut graph = GuiGraph::new(64);
        let win = window(&mut graph);
        let a = graph.define_resource(panel("a", &[1])).unwrap();
        let b = graph.define_resource(panel("b", &[1])).unwrap();
        let c = graph.define_resource(panel("c", &[1])).unwrap();
        for r in [a, b, c] {
            graph.link_resource(win, r, Point::ORIGIN).unwrap();
        }
        assert_eq!(graph.shown_resources(win), vec![a, b, c]);

        graph.unlink_resource(win, b);
        assert_eq!(graph.shown_resources(win), vec![a, c]);
        graph.unlink_resource(win, a);
        assert_eq!(graph.shown_resources(win), vec![c]);
        assert_eq!(graph.resource(a).unwrap().placement(), Placement::Detached);
        // Unlinking something not in the list is a no-op.
        graph.unlink_resource(win, a);
        assert_eq!(graph.shown_resources(win), vec![c]);
    }

    #[test]
    fn test_relayout_tracks_extent() {
        let mut graph = GuiGraph::new(64);
        let win = window(&mut graph);
        let res = graph.define_resource(panel("p", &[1, 2, 3])).unwrap();
        graph.link_resource(win, res, Point::new(10, 0)).unwrap();
        graph.relayout(win).unwrap();
        let w = graph.window(win).unwrap();
        assert_eq!(w.extent(), Size::new(110, 76));
        assert_eq!(w.scroll().h_max, 10);
        assert_eq!(w.scroll().v_max, 26);

        graph.unlink_resource(win, res);
        graph.relayout(win).unwrap();
        assert_eq!(graph.window(win).unwrap().extent(), Size::default());
    }

    #[test]
    fn test_append_control_refused_while_attached() {
        let mut graph = GuiGraph::new(64);
        let win = window(&mut graph);
        let res = graph.define_resource(panel("p", &[1])).unwrap();
        graph
            .append_control(res, ControlDef::new(2, ControlKind::Button, Rect::default()))
            .unwrap();
        graph.link_resource(win, res, Point::ORIGIN).unwrap();
        let err = graph
            .append_control(res, ControlDef::new(3, ControlKind::Button, Rect::default()))
            .unwrap_err();
        assert_eq!(err.code(), GuiErrorCode::WrongLifecycle as u32);
    }

    #[test]
    fn test_free_resource_releases_array() {
        let mut graph = GuiGraph::new(64);
        let res = graph.define_resource(panel("p", &[1])).unwrap();
        assert_eq!(graph.counts().control_arrays, 1);
        assert!(graph.free_resource(res).is_some());
        assert_eq!(graph.counts().control_arrays, 0);
        assert!(graph.resource(res).is_err());
        assert!(graph.free_resource(res).is_none());
    }
}
