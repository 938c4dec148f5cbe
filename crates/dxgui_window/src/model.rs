//! Entities of the shared object graph.
//!
//! Fields that tie an entity to native objects or to other entities are
//! crate-private: only the UI thread changes them, while executing a command
//! under the critical section. The interpreter side reads them through the
//! accessors.

use crate::handles::Handle;
use crate::native::NativeId;
use crate::{DecodedImage, GuiError, GuiResult};
use dxgui_sync::PaintMutex;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const ORIGIN: Point = Point { x: 0, y: 0 };

    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> i32 {
        self.x.saturating_add(span(self.width))
    }

    pub fn bottom(&self) -> i32 {
        self.y.saturating_add(span(self.height))
    }

    pub fn offset(&self, by: Point) -> Rect {
        Rect::new(
            self.x.saturating_add(by.x),
            self.y.saturating_add(by.y),
            self.width,
            self.height,
        )
    }
}

/// A length as a coordinate distance, saturating at `i32::MAX`.
fn span(length: u32) -> i32 {
    i32::try_from(length).unwrap_or(i32::MAX)
}

/// Where a window is in its life. Commands other than destroy require
/// `Created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    NotCreated,
    Created,
    Destroying,
    Destroyed,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::NotCreated => "not created",
            Lifecycle::Created => "created",
            Lifecycle::Destroying => "being destroyed",
            Lifecycle::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    TopLevel,
    Floating,
    /// Host window created for a dialog resource.
    Dialog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Panel,
    Dialog,
    Menu,
    Toolbar,
    Icon,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Panel => "panel",
            ResourceKind::Dialog => "dialog",
            ResourceKind::Menu => "menu",
            ResourceKind::Toolbar => "toolbar",
            ResourceKind::Icon => "icon",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    #[default]
    Text,
    Box,
    Icon,
    Edit,
    MultiLineEdit,
    Button,
    DefPushButton,
    CheckBox,
    RadioButton,
    ListBox,
    DropBox,
    Tree,
    Progress,
    HScrollBar,
    VScrollBar,
    MenuItem,
    MenuSeparator,
    ToolbarButton,
}

impl ControlKind {
    /// Whether the control can hold the keyboard focus.
    pub fn is_focusable(self) -> bool {
        matches!(
            self,
            ControlKind::Edit
                | ControlKind::MultiLineEdit
                | ControlKind::Button
                | ControlKind::DefPushButton
                | ControlKind::CheckBox
                | ControlKind::RadioButton
                | ControlKind::ListBox
                | ControlKind::DropBox
                | ControlKind::Tree
                | ControlKind::HScrollBar
                | ControlKind::VScrollBar
        )
    }

    /// Whether the control shows a list of items.
    pub fn holds_items(self) -> bool {
        matches!(
            self,
            ControlKind::ListBox | ControlKind::DropBox | ControlKind::Tree
        )
    }

    /// Whether the control makes sense inside a resource of `kind`.
    pub fn fits(self, kind: ResourceKind) -> bool {
        match kind {
            ResourceKind::Menu => {
                matches!(self, ControlKind::MenuItem | ControlKind::MenuSeparator)
            }
            ResourceKind::Toolbar => matches!(
                self,
                ControlKind::ToolbarButton | ControlKind::Icon | ControlKind::DropBox
            ),
            ResourceKind::Icon => matches!(self, ControlKind::Icon),
            ResourceKind::Panel | ResourceKind::Dialog => !matches!(
                self,
                ControlKind::MenuItem | ControlKind::MenuSeparator | ControlKind::ToolbarButton
            ),
        }
    }
}

/// Position of a control within its window: owning resource plus index into
/// that resource's control array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRef {
    pub resource: Handle<Resource>,
    pub index: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Control {
    pub id: u16,
    pub kind: ControlKind,
    pub text: String,
    pub rect: Rect,
    pub items: Vec<String>,
    pub(crate) peer: Option<NativeId>,
    pub(crate) resource: Option<Handle<Resource>>,
}

impl Control {
    /// Native peer, present exactly while the owning resource is shown.
    pub fn peer(&self) -> Option<NativeId> {
        self.peer
    }

    pub fn is_shown(&self) -> bool {
        self.peer.is_some()
    }

    pub fn resource(&self) -> Option<Handle<Resource>> {
        self.resource
    }
}

/// How a resource is attached to a window, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    #[default]
    Detached,
    Shown {
        window: Handle<Window>,
        origin: Point,
    },
    Menu {
        window: Handle<Window>,
        native: NativeId,
    },
    Toolbar {
        window: Handle<Window>,
        native: NativeId,
    },
}

impl Placement {
    pub fn window(&self) -> Option<Handle<Window>> {
        match *self {
            Placement::Detached => None,
            Placement::Shown { window, .. }
            | Placement::Menu { window, .. }
            | Placement::Toolbar { window, .. } => Some(window),
        }
    }
}

#[derive(Debug)]
pub struct Resource {
    pub name: String,
    pub kind: ResourceKind,
    pub title: Option<String>,
    pub(crate) controls: Handle<Vec<Control>>,
    pub(crate) placement: Placement,
    pub(crate) next_shown: Option<Handle<Resource>>,
}

impl Resource {
    pub fn controls_handle(&self) -> Handle<Vec<Control>> {
        self.controls
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub fn is_shown(&self) -> bool {
        matches!(self.placement, Placement::Shown { .. })
    }

    pub fn window(&self) -> Option<Handle<Window>> {
        self.placement.window()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScrollState {
    pub h_max: u32,
    pub v_max: u32,
    pub h_pos: u32,
    pub v_pos: u32,
}

impl ScrollState {
    /// Recompute the ranges for a content extent inside a client area and
    /// pull the positions back into range.
    pub fn fit(&mut self, extent: Size, client: Size) {
        self.h_max = extent.width.saturating_sub(client.width);
        self.v_max = extent.height.saturating_sub(client.height);
        self.h_pos = self.h_pos.min(self.h_max);
        self.v_pos = self.v_pos.min(self.v_max);
    }

    pub fn needs_horizontal(&self) -> bool {
        self.h_max > 0
    }

    pub fn needs_vertical(&self) -> bool {
        self.v_max > 0
    }
}

/// Text-insertion caret of a window, in client coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Caret {
    pub visible: bool,
    pub at: Point,
}

#[derive(Debug, Clone)]
pub(crate) struct StatusBar {
    pub(crate) native: NativeId,
    pub(crate) text: String,
}

#[derive(Debug)]
pub struct Window {
    pub kind: WindowKind,
    pub title: String,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) native: Option<NativeId>,
    pub(crate) position: Point,
    pub(crate) client: Size,
    pub(crate) extent: Size,
    pub(crate) scroll: ScrollState,
    pub(crate) shown_head: Option<Handle<Resource>>,
    pub(crate) pix_head: Option<Handle<Pixmap>>,
    pub(crate) focus: Option<ControlRef>,
    pub(crate) menu: Option<Handle<Resource>>,
    pub(crate) toolbar: Option<Handle<Resource>>,
    pub(crate) status: Option<StatusBar>,
    pub(crate) caret: Caret,
    /// The dialog resource this window hosts, for `WindowKind::Dialog`.
    pub(crate) dialog: Option<Handle<Resource>>,
}

impl Window {
    pub(crate) fn new(kind: WindowKind, title: String, position: Point, client: Size) -> Self {
        Self {
            kind,
            title,
            lifecycle: Lifecycle::NotCreated,
            native: None,
            position,
            client,
            extent: Size::default(),
            scroll: ScrollState::default(),
            shown_head: None,
            pix_head: None,
            focus: None,
            menu: None,
            toolbar: None,
            status: None,
            caret: Caret::default(),
            dialog: None,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn native(&self) -> Option<NativeId> {
        self.native
    }

    pub fn position(&self) -> Point {
        self.position
    }

    pub fn client_size(&self) -> Size {
        self.client
    }

    /// Bounding size of everything shown in the window.
    pub fn extent(&self) -> Size {
        self.extent
    }

    pub fn scroll(&self) -> ScrollState {
        self.scroll
    }

    pub fn focus(&self) -> Option<ControlRef> {
        self.focus
    }

    pub fn menu(&self) -> Option<Handle<Resource>> {
        self.menu
    }

    pub fn toolbar(&self) -> Option<Handle<Resource>> {
        self.toolbar
    }

    pub fn status_text(&self) -> Option<&str> {
        self.status.as_ref().map(|s| s.text.as_str())
    }

    pub fn caret(&self) -> Caret {
        self.caret
    }

    pub fn hosted_dialog(&self) -> Option<Handle<Resource>> {
        self.dialog
    }
}

/// Pixel storage behind a pixmap's paint mutex. Pixels are `0x00RRGGBB`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    pixels: Vec<u32>,
    dirty: bool,
}

impl Bitmap {
    /// Allocate a `width` by `height` bitmap. Fails with `OutOfMemory` when
    /// the pixel count overflows or the allocator refuses it.
    pub fn new(width: u32, height: u32, fill: u32) -> GuiResult<Self> {
        let len = (width as usize)
            .checked_mul(height as usize)
            .ok_or_else(|| {
                GuiError::out_of_memory(format!("{}x{} bitmap overflows", width, height))
            })?;
        let mut pixels = Vec::new();
        pixels.try_reserve_exact(len).map_err(|e| {
            GuiError::out_of_memory(format!("{}x{} bitmap: {}", width, height, e))
        })?;
        pixels.resize(len, fill);
        Ok(Self {
            width,
            height,
            pixels,
            dirty: false,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }

    fn offset(&self, x: i64, y: i64) -> Option<usize> {
        if x < 0 || y < 0 || x >= i64::from(self.width) || y >= i64::from(self.height) {
            return None;
        }
        Some(y as usize * self.width as usize + x as usize)
    }

    pub fn pixel(&self, x: i32, y: i32) -> Option<u32> {
        self.offset(x.into(), y.into()).map(|i| self.pixels[i])
    }

    /// Writes outside the bitmap are clipped.
    pub fn set_pixel(&mut self, x: i32, y: i32, color: u32) {
        self.put(x.into(), y.into(), color);
    }

    fn put(&mut self, x: i64, y: i64, color: u32) {
        if let Some(i) = self.offset(x, y) {
            self.pixels[i] = color;
            self.dirty = true;
        }
    }

    pub fn clear(&mut self, color: u32) {
        self.pixels.fill(color);
        self.dirty = true;
    }

    pub fn fill_rect(&mut self, rect: Rect, color: u32) {
        let x0 = rect.x.clamp(0, span(self.width));
        let y0 = rect.y.max(0);
        let x1 = rect.right().min(span(self.width));
        let y1 = rect.bottom().min(span(self.height));
        for y in y0..y1 {
            let row = y as usize * self.width as usize;
            self.pixels[row + x0 as usize..row + x1.max(x0) as usize].fill(color);
        }
        self.dirty = true;
    }

    pub fn draw_rect(&mut self, rect: Rect, color: u32) {
        if rect.width == 0 || rect.height == 0 {
            return;
        }
        let (r, b) = (rect.right() - 1, rect.bottom() - 1);
        self.draw_line(Point::new(rect.x, rect.y), Point::new(r, rect.y), color);
        self.draw_line(Point::new(r, rect.y), Point::new(r, b), color);
        self.draw_line(Point::new(r, b), Point::new(rect.x, b), color);
        self.draw_line(Point::new(rect.x, b), Point::new(rect.x, rect.y), color);
    }

    /// Bresenham line, endpoints included. The segment is clipped to the
    /// bitmap first, so far-away endpoints cost nothing.
    pub fn draw_line(&mut self, from: Point, to: Point, color: u32) {
        let Some(((mut x, mut y), (x1, y1))) = self.clip_line(from, to) else {
            return;
        };
        let dx = (x1 - x).abs();
        let dy = -(y1 - y).abs();
        let sx = if x < x1 { 1 } else { -1 };
        let sy = if y < y1 { 1 } else { -1 };
        let mut err = dx + dy;
        loop {
            self.put(x, y, color);
            if x == x1 && y == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
        self.dirty = true;
    }

    /// Liang-Barsky clip of a segment to the pixel grid. `None` when the
    /// segment misses the bitmap.
    fn clip_line(&self, from: Point, to: Point) -> Option<((i64, i64), (i64, i64))> {
        if self.width == 0 || self.height == 0 {
            return None;
        }
        let (x0, y0) = (f64::from(from.x), f64::from(from.y));
        let (dx, dy) = (f64::from(to.x) - x0, f64::from(to.y) - y0);
        let x_max = f64::from(self.width - 1);
        let y_max = f64::from(self.height - 1);
        let (mut t0, mut t1) = (0.0f64, 1.0f64);
        for (p, q) in [(-dx, x0), (dx, x_max - x0), (-dy, y0), (dy, y_max - y0)] {
            if p == 0.0 {
                if q < 0.0 {
                    return None;
                }
                continue;
            }
            let r = q / p;
            if p < 0.0 {
                if r > t1 {
                    return None;
                }
                t0 = t0.max(r);
            } else {
                if r < t0 {
                    return None;
                }
                t1 = t1.min(r);
            }
        }
        let at = |t: f64| {
            let x = (x0 + t * dx).round().clamp(0.0, x_max) as i64;
            let y = (y0 + t * dy).round().clamp(0.0, y_max) as i64;
            (x, y)
        };
        Some((at(t0), at(t1)))
    }

    /// Copy a decoded image in at the top left, clipped to the bitmap.
    pub fn copy_from(&mut self, image: &DecodedImage) {
        let w = image.width.min(self.width) as usize;
        let h = image.height.min(self.height) as usize;
        for row in 0..h {
            let src = row * image.width as usize;
            let dst = row * self.width as usize;
            let Some(line) = image.pixels.get(src..src + w) else {
                break;
            };
            self.pixels[dst..dst + w].copy_from_slice(line);
        }
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

#[derive(Debug)]
pub struct Pixmap {
    pub name: String,
    pub size: Size,
    pub bits_per_pixel: u8,
    pub(crate) paint: PaintMutex<Bitmap>,
    pub(crate) window: Option<Handle<Window>>,
    pub(crate) origin: Point,
    pub(crate) next_shown: Option<Handle<Pixmap>>,
}

impl Pixmap {
    pub(crate) fn new(name: String, size: Size, bits_per_pixel: u8, fill: u32) -> GuiResult<Self> {
        let paint = PaintMutex::new(
            format!("pixmap:{}", name),
            Bitmap::new(size.width, size.height, fill)?,
        );
        Ok(Self {
            name,
            size,
            bits_per_pixel,
            paint,
            window: None,
            origin: Point::ORIGIN,
            next_shown: None,
        })
    }

    pub fn paint(&self) -> &PaintMutex<Bitmap> {
        &self.paint
    }

    pub fn window(&self) -> Option<Handle<Window>> {
        self.window
    }

    pub fn origin(&self) -> Point {
        self.origin
    }

    pub fn is_shown(&self) -> bool {
        self.window.is_some()
    }

    pub fn bounds(&self) -> Rect {
        Rect::new(self.origin.x, self.origin.y, self.size.width, self.size.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GuiErrorCode;

    #[test]
    fn test_bitmap_clips_writes() {
        let mut bmp = Bitmap::new(4, 3, 0).unwrap();
        bmp.set_pixel(-1, 0, 9);
        bmp.set_pixel(4, 0, 9);
        assert!(!bmp.is_dirty());
        bmp.fill_rect(Rect::new(2, 1, 10, 10), 5);
        assert_eq!(bmp.pixel(1, 1), Some(0));
        assert_eq!(bmp.pixel(3, 2), Some(5));
        assert_eq!(bmp.pixel(4, 2), None);
        assert!(bmp.is_dirty());
    }

    #[test]
    fn test_draw_line_and_rect() {
        let mut bmp = Bitmap::new(5, 5, 0).unwrap();
        bmp.draw_line(Point::new(0, 0), Point::new(4, 4), 1);
        for i in 0..5 {
            assert_eq!(bmp.pixel(i, i), Some(1));
        }
        let mut bmp = Bitmap::new(5, 5, 0).unwrap();
        bmp.draw_rect(Rect::new(0, 0, 5, 5), 2);
        assert_eq!(bmp.pixel(0, 4), Some(2));
        assert_eq!(bmp.pixel(4, 0), Some(2));
        assert_eq!(bmp.pixel(2, 2), Some(0));
    }

    #[test]
    fn test_oversized_bitmap_is_out_of_memory() {
        let err = Bitmap::new(u32::MAX, u32::MAX, 0).unwrap_err();
        assert_eq!(err.code(), GuiErrorCode::OutOfMemory as u32);
    }

    #[test]
    fn test_far_away_line_is_clipped() {
        let mut bmp = Bitmap::new(4, 2, 0).unwrap();
        bmp.draw_line(Point::new(i32::MIN, 0), Point::new(i32::MAX, 0), 3);
        assert_eq!(&bmp.pixels()[..4], &[3, 3, 3, 3]);
        assert_eq!(&bmp.pixels()[4..], &[0, 0, 0, 0]);

        let mut bmp = Bitmap::new(4, 4, 0).unwrap();
        bmp.draw_line(Point::new(i32::MIN, i32::MIN), Point::new(i32::MIN, i32::MAX), 3);
        bmp.draw_line(Point::new(-10, 100), Point::new(100, -10), 5);
        assert_eq!(bmp.pixels().iter().filter(|&&p| p == 3).count(), 0);
        assert!(bmp.pixels().iter().all(|&p| p == 0 || p == 5));
    }

    #[test]
    fn test_extreme_rects_saturate() {
        let rect = Rect::new(i32::MAX - 1, i32::MIN, u32::MAX, 4);
        assert_eq!(rect.right(), i32::MAX);
        assert_eq!(rect.bottom(), i32::MIN + 4);
        let moved = rect.offset(Point::new(10, -10));
        assert_eq!((moved.x, moved.y), (i32::MAX, i32::MIN));

        let mut bmp = Bitmap::new(3, 3, 0).unwrap();
        bmp.fill_rect(Rect::new(-1, -1, u32::MAX, u32::MAX), 1);
        assert!(bmp.pixels().iter().all(|&p| p == 1));
        bmp.draw_rect(Rect::new(i32::MAX - 2, 0, u32::MAX, u32::MAX), 2);
        assert!(bmp.pixels().iter().all(|&p| p == 1));
    }

    #[test]
    fn test_copy_from_clips_to_bitmap() {
        let mut bmp = Bitmap::new(2, 2, 0).unwrap();
        let image = DecodedImage {
            width: 3,
            height: 1,
            pixels: vec![7, 8, 9],
        };
        bmp.copy_from(&image);
        assert_eq!(bmp.pixels(), &[7, 8, 0, 0]);
    }

    #[test]
    fn test_scroll_fit_clamps_positions() {
        let mut scroll = ScrollState {
            h_pos: 500,
            v_pos: 10,
            ..Default::default()
        };
        scroll.fit(Size::new(300, 100), Size::new(200, 200));
        assert_eq!(scroll.h_max, 100);
        assert_eq!(scroll.h_pos, 100);
        assert_eq!(scroll.v_max, 0);
        assert_eq!(scroll.v_pos, 0);
        assert!(scroll.needs_horizontal());
        assert!(!scroll.needs_vertical());
    }

    #[test]
    fn test_control_kind_fits_resource() {
        assert!(ControlKind::MenuItem.fits(ResourceKind::Menu));
        assert!(!ControlKind::Edit.fits(ResourceKind::Menu));
        assert!(ControlKind::Edit.fits(ResourceKind::Panel));
        assert!(!ControlKind::ToolbarButton.fits(ResourceKind::Dialog));
        assert!(ControlKind::Tree.holds_items());
        assert!(!ControlKind::Text.is_focusable());
    }
}
