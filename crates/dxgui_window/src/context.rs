use crate::graph::GuiGraph;
use crate::handles::Handle;
use crate::model::{Pixmap, Resource};
use crate::{ControlDef, GuiError, GuiResult, PixmapOpts, ResourceDef};
use dxgui_sync::{order, CriticalGuard, CriticalSection};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Tunables for the GUI core, read from the `[gui]` table of the host
/// manifest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct GuiConfig {
    /// Longest a repaint or pixel copy waits for a pixel map's paint lock.
    pub paint_timeout_ms: u64,
    /// Upper bound on live objects per handle table.
    pub max_handles: usize,
    /// Capacity of the UI-to-interpreter event queue.
    pub event_capacity: usize,
    /// Largest pixel map, in pixels, a definition may ask for.
    pub max_pixmap_pixels: u64,
    /// Frames the headless backend keeps per window for inspection.
    pub frame_history: usize,
}

impl Default for GuiConfig {
    fn default() -> Self {
        Self {
            paint_timeout_ms: 50,
            max_handles: 16384,
            event_capacity: 256,
            max_pixmap_pixels: 1 << 26,
            frame_history: 8,
        }
    }
}

impl GuiConfig {
    pub fn paint_timeout(&self) -> Duration {
        Duration::from_millis(self.paint_timeout_ms)
    }
}

/// Counters readable from any thread without the critical section.
#[derive(Debug, Default)]
pub struct GuiStats {
    commands: AtomicU64,
    deferred: AtomicU64,
    repaints: AtomicU64,
    repaints_skipped: AtomicU64,
}

impl GuiStats {
    pub fn commands(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    pub fn deferred(&self) -> u64 {
        self.deferred.load(Ordering::Relaxed)
    }

    pub fn repaints(&self) -> u64 {
        self.repaints.load(Ordering::Relaxed)
    }

    /// Pixel-map paints skipped because a draw session held the lock.
    pub fn repaints_skipped(&self) -> u64 {
        self.repaints_skipped.load(Ordering::Relaxed)
    }

    pub(crate) fn record_command(&self) {
        self.commands.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deferred(&self) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_repaint(&self) {
        self.repaints.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped_repaint(&self) {
        self.repaints_skipped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Objects released by a shutdown or teardown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    pub windows: usize,
    pub resources: usize,
    pub pixmaps: usize,
}

impl TeardownReport {
    pub fn total(&self) -> usize {
        self.windows + self.resources + self.pixmaps
    }
}

/// Process-wide GUI state: the critical section over the object graph plus
/// the flags both threads consult.
///
/// Created once before the UI thread starts and shared by `Arc`.
pub struct GuiContext {
    config: GuiConfig,
    graph: CriticalSection<GuiGraph>,
    suspended: AtomicBool,
    stats: GuiStats,
}

impl GuiContext {
    pub fn init(config: GuiConfig) -> Arc<Self> {
        tracing::info!(
            "GUI context initialized (paint timeout {:?}, {} handles per table)",
            config.paint_timeout(),
            config.max_handles
        );
        Arc::new(Self {
            graph: CriticalSection::new(
                "gui",
                GuiGraph::new(config.max_handles).with_pixel_limit(config.max_pixmap_pixels),
            ),
            config,
            suspended: AtomicBool::new(false),
            stats: GuiStats::default(),
        })
    }

    pub fn config(&self) -> &GuiConfig {
        &self.config
    }

    pub fn stats(&self) -> &GuiStats {
        &self.stats
    }

    /// Enter the critical section. Everything in the graph, handles
    /// included, is only reachable through the returned guard.
    pub fn enter(&self) -> CriticalGuard<'_, GuiGraph> {
        self.graph.enter()
    }

    pub fn try_enter(&self) -> Option<CriticalGuard<'_, GuiGraph>> {
        self.graph.try_enter()
    }

    /// Like [`enter`](Self::enter), but fails with `WrongLifecycle` instead
    /// of breaking the lock order when this thread already holds the
    /// critical section or a paint lock (an open draw session).
    pub fn checked_enter(&self, what: &str) -> GuiResult<CriticalGuard<'_, GuiGraph>> {
        if order::critical_held() {
            return Err(GuiError::wrong_lifecycle(format!(
                "{}: critical section already held on this thread",
                what
            )));
        }
        if order::paint_depth() > 0 {
            return Err(GuiError::wrong_lifecycle(format!(
                "{}: a draw session is open on this thread",
                what
            )));
        }
        Ok(self.graph.enter())
    }

    pub fn define_resource(&self, def: ResourceDef) -> GuiResult<Handle<Resource>> {
        let name = def.name.clone();
        let handle = self.checked_enter("define resource")?.define_resource(def)?;
        tracing::debug!("defined resource `{}` as {}", name, handle);
        Ok(handle)
    }

    pub fn append_control(&self, resource: Handle<Resource>, def: ControlDef) -> GuiResult<()> {
        self.checked_enter("append control")?.append_control(resource, def)
    }

    pub fn define_pixmap(&self, opts: PixmapOpts) -> GuiResult<Handle<Pixmap>> {
        self.checked_enter("define pixmap")?.define_pixmap(opts)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub(crate) fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
    }

    /// Release whatever the graph still holds. Only meaningful once the UI
    /// thread has stopped; native objects are assumed gone with it.
    pub fn teardown(&self) -> TeardownReport {
        let mut graph = self.enter();
        let mut report = TeardownReport::default();
        for handle in graph.pixmap_handles() {
            graph.free_pixmap(handle);
            report.pixmaps += 1;
        }
        for handle in graph.resource_handles() {
            graph.free_resource(handle);
            report.resources += 1;
        }
        for handle in graph.window_handles() {
            graph.free_window(handle);
            report.windows += 1;
        }
        graph.compact();
        if report.total() > 0 {
            tracing::warn!("teardown released {} leftover objects", report.total());
        } else {
            tracing::debug!("teardown found nothing left");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceKind;

    #[test]
    fn test_config_defaults_and_partial_table() {
        let config = GuiConfig::default();
        assert_eq!(config.paint_timeout(), Duration::from_millis(50));

        let config: GuiConfig = serde_json::from_str(r#"{"paint_timeout_ms": 10}"#).unwrap();
        assert_eq!(config.paint_timeout_ms, 10);
        assert_eq!(config.max_handles, 16384);
        assert_eq!(config.event_capacity, 256);
        assert_eq!(config.max_pixmap_pixels, 1 << 26);
    }

    #[test]
    fn test_pixmap_over_pixel_limit_is_refused() {
        let ctx = GuiContext::init(GuiConfig {
            max_pixmap_pixels: 100,
            ..GuiConfig::default()
        });
        let opts = |width, height| PixmapOpts {
            name: None,
            width,
            height,
            bits_per_pixel: 24,
            fill: 0,
        };
        assert!(ctx.define_pixmap(opts(10, 10)).is_ok());
        let err = ctx.define_pixmap(opts(10, 11)).unwrap_err();
        assert_eq!(err.code(), crate::GuiErrorCode::OutOfMemory as u32);
        assert_eq!(ctx.enter().counts().pixmaps, 1);
    }

    #[test]
    fn test_teardown_releases_everything() {
        let ctx = GuiContext::init(GuiConfig::default());
        ctx.define_resource(ResourceDef {
            name: "panel".into(),
            kind: ResourceKind::Panel,
            title: None,
            controls: vec![],
        })
        .unwrap();
        ctx.define_pixmap(PixmapOpts {
            name: None,
            width: 4,
            height: 4,
            bits_per_pixel: 24,
            fill: 0,
        })
        .unwrap();

        let report = ctx.teardown();
        assert_eq!(report.resources, 1);
        assert_eq!(report.pixmaps, 1);
        assert_eq!(ctx.enter().counts(), crate::graph::GraphCounts::default());
        assert_eq!(ctx.teardown().total(), 0);
    }

    #[test]
    fn test_suspend_flag() {
        let ctx = GuiContext::init(GuiConfig::default());
        assert!(!ctx.is_suspended());
        ctx.set_suspended(true);
        assert!(ctx.is_suspended());
    }
}
