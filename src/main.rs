use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::Parser;
use pulsebeam_watchdog::{StackSource, Watchdog, WatchdogConfig};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

/// Runs a tokio current-thread runtime as the watched target, stalls it on purpose and prints
/// what the watchdog captured.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// TOML file with watchdog settings; WATCHDOG_* variables override it
    #[arg(short, long, env = "WATCHDOG_CONFIG")]
    config: Option<PathBuf>,

    /// Number of stalls to inject
    #[arg(long, default_value_t = 3)]
    stalls: u32,

    /// Length of each stall
    #[arg(long, default_value_t = 1500)]
    stall_ms: u64,

    /// Responsive time between stalls
    #[arg(long, default_value_t = 500)]
    gap_ms: u64,

    /// Pretty-print the JSON output
    #[arg(long)]
    pretty: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pulsebeam_watchdog=info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    let config = WatchdogConfig::load(args.config.as_deref()).context("loading config")?;

    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
    let target = thread::Builder::new()
        .name("target".to_string())
        .spawn(move || -> anyhow::Result<()> {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            ready_tx
                .send((rt.handle().clone(), target_stack_source()))
                .map_err(|_| anyhow!("main thread went away"))?;
            rt.block_on(async {
                let _ = done_rx.await;
            });
            Ok(())
        })?;

    let (handle, stack_source) = ready_rx.recv().context("target thread failed to start")?;
    let watchdog = Watchdog::builder(Arc::new(handle.clone()), stack_source)
        .with_config(config)
        .build()?;
    watchdog.add_listener(Arc::new(|event: pulsebeam_watchdog::BlockageEvent| {
        tracing::debug!(event = event.name(), ts = event.timestamp(), "blockage event");
    }));
    watchdog.start()?;

    // let the first probes round-trip before stalling
    thread::sleep(Duration::from_millis(args.gap_ms));
    for n in 0..args.stalls {
        let stall = Duration::from_millis(args.stall_ms);
        tracing::info!(n, stall_ms = args.stall_ms, "injecting stall");
        handle.spawn(async move { simulated_stall(stall) });
        thread::sleep(stall + Duration::from_millis(args.gap_ms));
    }

    watchdog.on_background();
    let intervals = watchdog.captured_intervals();
    let _ = done_tx.send(());
    target
        .join()
        .map_err(|_| anyhow!("target thread panicked"))??;

    let json = if args.pretty {
        serde_json::to_string_pretty(&intervals)?
    } else {
        serde_json::to_string(&intervals)?
    };
    println!("{json}");
    Ok(())
}

#[inline(never)]
fn simulated_stall(duration: Duration) {
    thread::sleep(duration);
}

#[cfg(unix)]
fn target_stack_source() -> Arc<dyn StackSource> {
    pulsebeam_watchdog::stack::unix::SignalStackSource::register_current_thread()
}

#[cfg(not(unix))]
fn target_stack_source() -> Arc<dyn StackSource> {
    use pulsebeam_watchdog::{CaptureError, ThreadSnapshot};
    Arc::new(|| -> Result<ThreadSnapshot, CaptureError> { Err(CaptureError::Unsupported) })
}
