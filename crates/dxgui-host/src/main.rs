use anyhow::{anyhow, Context, Result};
use dxgui_window::{connect, GuiContext, HeadlessBackend, MessagePump};
use std::env;
use std::path::PathBuf;
use std::thread;

mod config;
mod script;

use config::Manifest;
use script::Runner;

fn main() -> Result<()> {
    // Use DXGUI_LOG env var for log level configuration, default to "info"
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("DXGUI_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    // Parse args: --config <file> --script <file>
    let mut args = env::args().skip(1);
    let mut config_path = PathBuf::from("demos/dxgui.toml");
    let mut script_path = PathBuf::from("demos/hello.json");
    while let Some(a) = args.next() {
        match a.as_str() {
            "--config" => {
                config_path = PathBuf::from(args.next().context("--config requires a path")?);
            }
            "--script" => {
                script_path = PathBuf::from(args.next().context("--script requires a path")?);
            }
            other => tracing::warn!("ignoring unknown argument `{}`", other),
        }
    }

    let manifest = Manifest::load(&config_path)?;
    let steps = script::load(&script_path)?;
    tracing::info!(
        "Starting {}: {} steps from {}",
        manifest.app.name,
        steps.len(),
        script_path.display()
    );

    let ctx = GuiContext::init(manifest.gui.clone());
    let backend = HeadlessBackend::new().with_frame_history(manifest.gui.frame_history);
    let probe = backend.probe();
    let (client, ends) = connect(ctx.clone());

    // The interpreter gets its own thread; this one becomes the UI thread.
    let interpreter = thread::Builder::new()
        .name("dxgui-interpreter".into())
        .spawn(move || {
            let mut runner = Runner::new(client, Some(probe));
            runner.run(&steps);
            runner.finish()
        })
        .context("spawning interpreter thread")?;

    MessagePump::new(ctx.clone(), backend, ends).run();

    let (summary, released) = interpreter
        .join()
        .map_err(|_| anyhow!("interpreter thread panicked"))??;
    let leftover = ctx.teardown();
    tracing::info!(
        "{} steps run, {} failed, {} events; shutdown released {} objects, {} left over",
        summary.steps,
        summary.failed,
        summary.events,
        released.total(),
        leftover.total()
    );
    Ok(())
}
