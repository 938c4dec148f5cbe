//! Scripted interpreter: a JSON array of steps run against a [`GuiClient`].
//!
//! Objects are referred to by name in the script; the runner keeps the
//! name-to-handle maps. A failing step is reported and the script goes on
//! with the next one.

use anyhow::{anyhow, bail, Context, Result};
use dxgui_window::{
    DecodedImage, GuiClient, GuiEvent, Handle, HeadlessProbe, PixmapOpts, Pixmap, Point, Rect,
    Resource, ResourceDef, TeardownReport, Window, WindowOpts,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// `0x00RRGGBB`, written in a script as a number or as `"#rrggbb"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "ColorRepr")]
pub struct Color(pub u32);

#[derive(Deserialize)]
#[serde(untagged)]
enum ColorRepr {
    Number(u32),
    Hex(String),
}

impl TryFrom<ColorRepr> for Color {
    type Error = String;

    fn try_from(repr: ColorRepr) -> Result<Self, Self::Error> {
        match repr {
            ColorRepr::Number(n) if n <= 0xffffff => Ok(Color(n)),
            ColorRepr::Number(n) => Err(format!("color {:#x} is wider than 24 bits", n)),
            ColorRepr::Hex(s) => {
                let digits = s
                    .strip_prefix('#')
                    .ok_or_else(|| format!("color `{}` must start with #", s))?;
                if digits.len() != 6 {
                    return Err(format!("color `{}` must have six hex digits", s));
                }
                u32::from_str_radix(digits, 16)
                    .map(Color)
                    .map_err(|e| format!("color `{}`: {}", s, e))
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Shape {
    Clear {
        color: Color,
    },
    Fill {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        color: Color,
    },
    Frame {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        color: Color,
    },
    Line {
        from: (i32, i32),
        to: (i32, i32),
        color: Color,
    },
    Pixel {
        x: i32,
        y: i32,
        color: Color,
    },
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    CreateWindow {
        name: String,
        #[serde(flatten)]
        opts: WindowOpts,
    },
    DestroyWindow {
        window: String,
    },
    SetTitle {
        window: String,
        title: String,
    },
    WindowText {
        window: String,
    },
    WindowInfo {
        window: String,
    },
    Invalidate {
        window: String,
    },
    DefineResource(ResourceDef),
    DestroyResource {
        resource: String,
    },
    Show {
        resource: String,
        window: String,
        #[serde(default)]
        x: i32,
        #[serde(default)]
        y: i32,
        #[serde(default = "yes")]
        activate: bool,
    },
    Hide {
        resource: String,
    },
    OpenDialog {
        resource: String,
        #[serde(flatten)]
        opts: WindowOpts,
    },
    CloseDialog {
        resource: String,
    },
    Menu {
        resource: String,
        window: String,
    },
    RemoveMenu {
        resource: String,
    },
    Toolbar {
        resource: String,
        window: String,
    },
    RemoveToolbar {
        resource: String,
    },
    StatusBar {
        window: String,
        #[serde(default)]
        text: String,
    },
    RemoveStatusBar {
        window: String,
    },
    Status {
        window: String,
        text: String,
    },
    Focus {
        resource: String,
        control: u16,
    },
    ReadFocus {
        window: String,
    },
    ReadText {
        resource: String,
        control: u16,
    },
    ReadTreeSelection {
        resource: String,
        control: u16,
    },
    EraseList {
        resource: String,
        control: u16,
    },
    /// Simulated user typing into a shown control.
    TypeText {
        resource: String,
        control: u16,
        text: String,
    },
    /// Simulated user selection in a list or tree.
    SelectItem {
        resource: String,
        control: u16,
        index: usize,
    },
    DefinePixmap(PixmapOpts),
    ShowPixmap {
        pixmap: String,
        window: String,
        #[serde(default)]
        x: i32,
        #[serde(default)]
        y: i32,
    },
    HidePixmap {
        pixmap: String,
    },
    Draw {
        pixmap: String,
        shapes: Vec<Shape>,
    },
    LoadImage {
        pixmap: String,
        path: PathBuf,
    },
    DestroyPixmap {
        pixmap: String,
    },
    Sleep {
        ms: u64,
    },
    Suspend,
    Resume,
    Sync,
}

impl Step {
    pub fn op(&self) -> &'static str {
        match self {
            Step::CreateWindow { .. } => "create_window",
            Step::DestroyWindow { .. } => "destroy_window",
            Step::SetTitle { .. } => "set_title",
            Step::WindowText { .. } => "window_text",
            Step::WindowInfo { .. } => "window_info",
            Step::Invalidate { .. } => "invalidate",
            Step::DefineResource(_) => "define_resource",
            Step::DestroyResource { .. } => "destroy_resource",
            Step::Show { .. } => "show",
            Step::Hide { .. } => "hide",
            Step::OpenDialog { .. } => "open_dialog",
            Step::CloseDialog { .. } => "close_dialog",
            Step::Menu { .. } => "menu",
            Step::RemoveMenu { .. } => "remove_menu",
            Step::Toolbar { .. } => "toolbar",
            Step::RemoveToolbar { .. } => "remove_toolbar",
            Step::StatusBar { .. } => "status_bar",
            Step::RemoveStatusBar { .. } => "remove_status_bar",
            Step::Status { .. } => "status",
            Step::Focus { .. } => "focus",
            Step::ReadFocus { .. } => "read_focus",
            Step::ReadText { .. } => "read_text",
            Step::ReadTreeSelection { .. } => "read_tree_selection",
            Step::EraseList { .. } => "erase_list",
            Step::TypeText { .. } => "type_text",
            Step::SelectItem { .. } => "select_item",
            Step::DefinePixmap(_) => "define_pixmap",
            Step::ShowPixmap { .. } => "show_pixmap",
            Step::HidePixmap { .. } => "hide_pixmap",
            Step::Draw { .. } => "draw",
            Step::LoadImage { .. } => "load_image",
            Step::DestroyPixmap { .. } => "destroy_pixmap",
            Step::Sleep { .. } => "sleep",
            Step::Suspend => "suspend",
            Step::Resume => "resume",
            Step::Sync => "sync",
        }
    }
}

pub fn parse(text: &str) -> Result<Vec<Step>> {
    Ok(serde_json::from_str(text)?)
}

pub fn load(path: &Path) -> Result<Vec<Step>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading script at {}", path.display()))?;
    parse(&text).with_context(|| format!("parsing script at {}", path.display()))
}

/// Decode an image file into pixels a pixel map can take.
pub fn decode_image(path: &Path) -> Result<DecodedImage> {
    let img = image::open(path).with_context(|| format!("decoding {}", path.display()))?;
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    let pixels = rgb
        .pixels()
        .map(|p| (u32::from(p[0]) << 16) | (u32::from(p[1]) << 8) | u32::from(p[2]))
        .collect();
    Ok(DecodedImage {
        width,
        height,
        pixels,
    })
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RunSummary {
    pub steps: usize,
    pub failed: usize,
    pub events: usize,
}

pub struct Runner {
    client: GuiClient,
    probe: Option<HeadlessProbe>,
    windows: HashMap<String, Handle<Window>>,
    resources: HashMap<String, Handle<Resource>>,
    pixmaps: HashMap<String, Handle<Pixmap>>,
    summary: RunSummary,
}

impl Runner {
    /// `probe` enables the simulated-input steps.
    pub fn new(client: GuiClient, probe: Option<HeadlessProbe>) -> Self {
        Self {
            client,
            probe,
            windows: HashMap::new(),
            resources: HashMap::new(),
            pixmaps: HashMap::new(),
            summary: RunSummary::default(),
        }
    }

    pub fn run(&mut self, steps: &[Step]) -> RunSummary {
        for (index, step) in steps.iter().enumerate() {
            self.summary.steps += 1;
            if let Err(err) = self.step(step) {
                self.summary.failed += 1;
                tracing::warn!("step {} ({}) failed: {:#}", index + 1, step.op(), err);
            }
            self.drain_events();
        }
        self.summary
    }

    /// Stop the UI thread. Returns the last summary and what the UI thread
    /// released.
    pub fn finish(mut self) -> Result<(RunSummary, TeardownReport)> {
        if self.client.is_suspended() {
            self.client.resume()?;
        }
        self.drain_events();
        let summary = self.summary;
        let report = self.client.shutdown()?;
        Ok((summary, report))
    }

    fn drain_events(&mut self) {
        while let Some(event) = self.client.poll_event() {
            self.summary.events += 1;
            log_event(&event);
        }
    }

    fn window(&self, name: &str) -> Result<Handle<Window>> {
        self.windows
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("no window named `{}`", name))
    }

    fn resource(&self, name: &str) -> Result<Handle<Resource>> {
        self.resources
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("no resource named `{}`", name))
    }

    fn pixmap(&self, name: &str) -> Result<Handle<Pixmap>> {
        self.pixmaps
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("no pixmap named `{}`", name))
    }

    fn probe(&self) -> Result<&HeadlessProbe> {
        self.probe
            .as_ref()
            .ok_or_else(|| anyhow!("simulated input needs the headless backend"))
    }

    fn peer(&self, resource: &str, control: u16) -> Result<dxgui_window::NativeId> {
        let resource = self.resource(resource)?;
        let graph = self.client.context().checked_enter("peer lookup")?;
        graph
            .control(resource, control)?
            .peer()
            .ok_or_else(|| anyhow!("control {} is not shown", control))
    }

    fn step(&mut self, step: &Step) -> Result<()> {
        let client = &self.client;
        match step {
            Step::CreateWindow { name, opts } => {
                let mut opts = opts.clone();
                opts.title.get_or_insert_with(|| name.clone());
                let handle = client.create_window(opts)?;
                self.windows.insert(name.clone(), handle);
            }
            Step::DestroyWindow { window } => {
                client.destroy_window(self.window(window)?)?;
                self.windows.remove(window);
            }
            Step::SetTitle { window, title } => {
                client.set_window_title(self.window(window)?, title.as_str())?;
            }
            Step::WindowText { window } => {
                let text = client.window_text(self.window(window)?)?;
                tracing::info!("window `{}` reads {:?}", window, text);
            }
            Step::WindowInfo { window } => {
                let info = client.window_info(self.window(window)?)?;
                tracing::info!("window `{}`: {}", window, serde_json::to_string(&info)?);
            }
            Step::Invalidate { window } => client.invalidate(self.window(window)?)?,
            Step::DefineResource(def) => {
                if self.resources.contains_key(&def.name) {
                    bail!("resource `{}` is already defined", def.name);
                }
                let handle = client.define_resource(def.clone())?;
                self.resources.insert(def.name.clone(), handle);
            }
            Step::DestroyResource { resource } => {
                client.destroy_resource(self.resource(resource)?)?;
                self.resources.remove(resource);
            }
            Step::Show {
                resource,
                window,
                x,
                y,
                activate,
            } => {
                let res = self.resource(resource)?;
                let win = self.window(window)?;
                let at = Point::new(*x, *y);
                if *activate {
                    client.show_controls(res, win, at)?;
                } else {
                    client.show_controls_inactive(res, win, at)?;
                }
            }
            Step::Hide { resource } => client.hide_controls(self.resource(resource)?)?,
            Step::OpenDialog { resource, opts } => {
                let window = client.create_dialog(self.resource(resource)?, opts.clone())?;
                self.windows.insert(resource.clone(), window);
            }
            Step::CloseDialog { resource } => {
                client.destroy_dialog(self.resource(resource)?)?;
                self.windows.remove(resource);
            }
            Step::Menu { resource, window } => {
                client.create_menu(self.resource(resource)?, self.window(window)?)?;
            }
            Step::RemoveMenu { resource } => client.destroy_menu(self.resource(resource)?)?,
            Step::Toolbar { resource, window } => {
                client.create_toolbar(self.resource(resource)?, self.window(window)?)?;
            }
            Step::RemoveToolbar { resource } => client.destroy_toolbar(self.resource(resource)?)?,
            Step::StatusBar { window, text } => {
                client.create_status_bar(self.window(window)?, text.as_str())?;
            }
            Step::RemoveStatusBar { window } => client.destroy_status_bar(self.window(window)?)?,
            Step::Status { window, text } => {
                client.set_status_text(self.window(window)?, text.as_str())?;
            }
            Step::Focus { resource, control } => {
                client.set_focus(self.resource(resource)?, *control)?;
            }
            Step::ReadFocus { window } => match client.focus(self.window(window)?)? {
                Some(focus) => {
                    let name = self
                        .resources
                        .iter()
                        .find(|(_, h)| **h == focus.resource)
                        .map_or("?", |(n, _)| n.as_str());
                    tracing::info!(
                        "focus in `{}` is control {} of `{}`",
                        window,
                        focus.control_id,
                        name
                    );
                }
                None => tracing::info!("nothing has the focus in `{}`", window),
            },
            Step::ReadText { resource, control } => {
                let text = client.control_text(self.resource(resource)?, *control)?;
                tracing::info!("control {} of `{}` reads {:?}", control, resource, text);
            }
            Step::ReadTreeSelection { resource, control } => {
                let text = client.selected_tree_item_text(self.resource(resource)?, *control)?;
                tracing::info!("tree {} of `{}` has {:?} selected", control, resource, text);
            }
            Step::EraseList { resource, control } => {
                let res = self.resource(resource)?;
                self.client.erase_drop_list(res, *control)?;
            }
            Step::TypeText {
                resource,
                control,
                text,
            } => {
                let peer = self.peer(resource, *control)?;
                self.probe()?.type_text(peer, text);
            }
            Step::SelectItem {
                resource,
                control,
                index,
            } => {
                let peer = self.peer(resource, *control)?;
                self.probe()?.select_item(peer, *index);
            }
            Step::DefinePixmap(opts) => {
                let name = opts
                    .name
                    .clone()
                    .ok_or_else(|| anyhow!("a scripted pixmap needs a name"))?;
                if self.pixmaps.contains_key(&name) {
                    bail!("pixmap `{}` is already defined", name);
                }
                let handle = client.define_pixmap(opts.clone())?;
                self.pixmaps.insert(name, handle);
            }
            Step::ShowPixmap { pixmap, window, x, y } => {
                client.show_pixmap(self.pixmap(pixmap)?, self.window(window)?, Point::new(*x, *y))?;
            }
            Step::HidePixmap { pixmap } => client.hide_pixmap(self.pixmap(pixmap)?)?,
            Step::Draw { pixmap, shapes } => {
                let mut session = client.start_draw(self.pixmap(pixmap)?)?;
                for shape in shapes {
                    match *shape {
                        Shape::Clear { color } => session.clear(color.0),
                        Shape::Fill {
                            x,
                            y,
                            width,
                            height,
                            color,
                        } => session.fill_rect(Rect::new(x, y, width, height), color.0),
                        Shape::Frame {
                            x,
                            y,
                            width,
                            height,
                            color,
                        } => session.draw_rect(Rect::new(x, y, width, height), color.0),
                        Shape::Line { from, to, color } => session.draw_line(
                            Point::new(from.0, from.1),
                            Point::new(to.0, to.1),
                            color.0,
                        ),
                        Shape::Pixel { x, y, color } => session.set_pixel(x, y, color.0),
                    }
                }
                session.finish()?;
            }
            Step::LoadImage { pixmap, path } => {
                let handle = self.pixmap(pixmap)?;
                let image = decode_image(path)?;
                tracing::debug!(
                    "loaded {}x{} image from {}",
                    image.width,
                    image.height,
                    path.display()
                );
                client.copy_pixels(handle, image)?;
            }
            Step::DestroyPixmap { pixmap } => {
                client.destroy_pixmap(self.pixmap(pixmap)?)?;
                self.pixmaps.remove(pixmap);
            }
            Step::Sleep { ms } => std::thread::sleep(Duration::from_millis(*ms)),
            Step::Suspend => client.suspend(),
            Step::Resume => client.resume()?,
            Step::Sync => client.sync()?,
        }
        Ok(())
    }
}

fn log_event(event: &GuiEvent) {
    match serde_json::to_string(event) {
        Ok(json) => tracing::debug!("event {}", json),
        Err(err) => tracing::debug!("event {:?} ({})", event.kind, err),
    }
}
