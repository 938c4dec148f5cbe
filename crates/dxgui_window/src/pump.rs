//! The UI thread's message loop.
//!
//! Commands arrive on one unbounded queue in the order they were sent; the
//! pump hands them to the manager one at a time. While the interpreter has
//! suspended the GUI, every non-management command is set aside in arrival
//! order and replayed after `Resume`. Commands that arrive while set-aside
//! ones are still waiting join the back of that line, even if the flag has
//! already been cleared, so the replay never falls behind them.

use crate::client::GuiClient;
use crate::context::{GuiConfig, GuiContext, TeardownReport};
use crate::manager::GuiManager;
use crate::native::NativeBackend;
use crate::{GuiCmd, GuiError, GuiEvent, GuiResult};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;

/// The UI-thread ends of the channels created by [`connect`].
pub struct PumpEnds {
    cmd_tx: mpsc::WeakUnboundedSender<GuiCmd>,
    cmd_rx: mpsc::UnboundedReceiver<GuiCmd>,
    events_tx: mpsc::Sender<GuiEvent>,
}

/// Wire a client to a pump that has yet to be built.
pub fn connect(ctx: Arc<GuiContext>) -> (GuiClient, PumpEnds) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::channel(ctx.config().event_capacity.max(1));
    let ends = PumpEnds {
        cmd_tx: cmd_tx.downgrade(),
        cmd_rx,
        events_tx,
    };
    (GuiClient::new(ctx, cmd_tx, events_rx), ends)
}

pub struct MessagePump<B: NativeBackend> {
    ctx: Arc<GuiContext>,
    manager: GuiManager<B>,
    rx: mpsc::UnboundedReceiver<GuiCmd>,
    deferred: VecDeque<GuiCmd>,
}

impl<B: NativeBackend> MessagePump<B> {
    pub fn new(ctx: Arc<GuiContext>, backend: B, ends: PumpEnds) -> Self {
        let PumpEnds {
            cmd_tx,
            cmd_rx,
            events_tx,
        } = ends;
        Self {
            manager: GuiManager::new(ctx.clone(), backend, cmd_tx, events_tx),
            ctx,
            rx: cmd_rx,
            deferred: VecDeque::new(),
        }
    }

    /// Run until a `Shutdown` command has been executed or every sender is
    /// gone. Blocks the calling thread, which becomes the UI thread.
    pub fn run(mut self) {
        tracing::debug!("message pump started");
        while let Some(cmd) = self.rx.blocking_recv() {
            if !self.dispatch(cmd) {
                break;
            }
        }
        if !self.deferred.is_empty() {
            tracing::warn!(
                "message pump stopped with {} suspended commands",
                self.deferred.len()
            );
        }
        tracing::debug!("message pump stopped");
    }

    /// Returns `false` once the pump should stop.
    fn dispatch(&mut self, cmd: GuiCmd) -> bool {
        let held = self.ctx.is_suspended() || !self.deferred.is_empty();
        if held && !cmd.is_management() {
            tracing::trace!(
                "deferring {} behind {} suspended commands",
                cmd.name(),
                self.deferred.len()
            );
            self.ctx.stats().record_deferred();
            self.deferred.push_back(cmd);
            return true;
        }
        let resumed = matches!(cmd, GuiCmd::Resume);
        if !self.manager.handle(cmd) {
            return false;
        }
        if resumed {
            return self.drain_deferred();
        }
        true
    }

    fn drain_deferred(&mut self) -> bool {
        if !self.deferred.is_empty() {
            tracing::debug!("replaying {} deferred commands", self.deferred.len());
        }
        while !self.ctx.is_suspended() {
            let Some(cmd) = self.deferred.pop_front() else {
                break;
            };
            if !self.manager.handle(cmd) {
                return false;
            }
        }
        true
    }
}

/// A UI thread started by [`launch`].
pub struct UiThread {
    ctx: Arc<GuiContext>,
    handle: thread::JoinHandle<()>,
}

impl UiThread {
    pub fn context(&self) -> &Arc<GuiContext> {
        &self.ctx
    }

    /// Wait for the pump to stop, then release whatever the graph still
    /// holds.
    pub fn join(self) -> GuiResult<TeardownReport> {
        self.handle
            .join()
            .map_err(|_| GuiError::generic("UI thread panicked"))?;
        Ok(self.ctx.teardown())
    }
}

/// Initialize a context and start the UI thread. The backend is built on
/// that thread, since native toolkits tie their objects to the thread that
/// created them.
pub fn launch<B, F>(config: GuiConfig, make_backend: F) -> GuiResult<(GuiClient, UiThread)>
where
    B: NativeBackend + 'static,
    F: FnOnce() -> B + Send + 'static,
{
    let ctx = GuiContext::init(config);
    let (client, ends) = connect(ctx.clone());
    let pump_ctx = ctx.clone();
    let handle = thread::Builder::new()
        .name("dxgui-ui".into())
        .spawn(move || {
            let backend = make_backend();
            MessagePump::new(pump_ctx, backend, ends).run();
        })
        .map_err(|e| GuiError::generic(format!("Failed to spawn UI thread: {}", e)))?;
    Ok((client, UiThread { ctx, handle }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::Handle;
    use crate::model::Window;
    use crate::native::HeadlessBackend;
    use crate::WindowOpts;
    use tokio::sync::oneshot;

    #[test]
    fn test_launch_and_shutdown() {
        let (client, ui) = launch(GuiConfig::default(), HeadlessBackend::new).unwrap();
        client.sync().unwrap();
        let window = client.create_window(WindowOpts::default()).unwrap();
        assert_eq!(client.window_info(window).unwrap().lifecycle, crate::Lifecycle::Created);
        let report = client.shutdown().unwrap();
        assert_eq!(report.windows, 1);
        assert_eq!(ui.join().unwrap().total(), 0);
    }

    fn pump() -> (GuiClient, MessagePump<HeadlessBackend>) {
        let ctx = GuiContext::init(GuiConfig::default());
        let (client, ends) = connect(ctx.clone());
        (client, MessagePump::new(ctx, HeadlessBackend::new(), ends))
    }

    fn pump_pending(pump: &mut MessagePump<HeadlessBackend>) {
        while let Ok(cmd) = pump.rx.try_recv() {
            assert!(pump.dispatch(cmd));
        }
    }

    fn title(pump: &mut MessagePump<HeadlessBackend>, window: Handle<Window>) -> String {
        let (respond, rx) = oneshot::channel();
        assert!(pump.dispatch(GuiCmd::GetWindowText { window, respond }));
        rx.blocking_recv().unwrap().unwrap()
    }

    #[test]
    fn test_resume_replays_before_later_commands() {
        let (client, mut pump) = pump();
        let (respond, rx) = oneshot::channel();
        assert!(pump.dispatch(GuiCmd::CreateWindow {
            opts: WindowOpts::default(),
            respond,
        }));
        let window = rx.blocking_recv().unwrap().unwrap();

        client.suspend();
        client.set_window_title(window, "A").unwrap();
        pump_pending(&mut pump);
        assert_eq!(pump.deferred.len(), 1);

        // Sent during the suspension but only dequeued once the flag is
        // already clear.
        client.set_window_title(window, "B").unwrap();
        client.resume().unwrap();
        client.set_window_title(window, "C").unwrap();
        let b = pump.rx.try_recv().unwrap();
        assert!(pump.dispatch(b));
        assert_eq!(pump.deferred.len(), 2);
        pump_pending(&mut pump);

        assert!(pump.deferred.is_empty());
        assert_eq!(title(&mut pump, window), "C");
        assert_eq!(client.context().stats().deferred(), 2);
    }

    #[test]
    fn test_resuspend_during_replay_keeps_order() {
        let (client, mut pump) = pump();
        let (respond, rx) = oneshot::channel();
        assert!(pump.dispatch(GuiCmd::CreateWindow {
            opts: WindowOpts::default(),
            respond,
        }));
        let window = rx.blocking_recv().unwrap().unwrap();

        client.suspend();
        client.set_window_title(window, "first").unwrap();
        pump_pending(&mut pump);
        client.resume().unwrap();
        client.suspend();
        client.set_window_title(window, "second").unwrap();
        pump_pending(&mut pump);
        assert_eq!(pump.deferred.len(), 2);

        client.resume().unwrap();
        pump_pending(&mut pump);
        assert_eq!(title(&mut pump, window), "second");
    }

    #[test]
    fn test_pump_stops_when_client_dropped() {
        let (client, ui) = launch(GuiConfig::default(), HeadlessBackend::new).unwrap();
        client.sync().unwrap();
        drop(client);
        assert!(ui.join().is_ok());
    }
}
