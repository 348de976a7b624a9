mod config;
mod event;
mod installer;
mod interface;
mod link_monitor;
mod orchestrator;
mod paths;
mod process_monitor;
mod status;
mod window_monitor;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::event::DaemonEvent;
use crate::interface::InterfaceActuator;
use crate::link_monitor::LinkStateWatcher;
use crate::orchestrator::Orchestrator;
use crate::process_monitor::ProcessWatcher;

#[derive(Parser)]
#[command(name = "awdl-guard", about = "Keeps AWDL down while GeForce NOW streams full screen")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Log everything, including per-poll decisions
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground (default)
    Run(RunArgs),
    /// Install the binary and register it with launchd
    Install(PrefixArgs),
    /// Unregister from launchd and remove installed files
    Uninstall(PrefixArgs),
    /// Show installation, interface and daemon state
    Status(PrefixArgs),
}

#[derive(Args, Default)]
struct RunArgs {
    /// Interface to hold down, overriding the config file
    #[arg(long)]
    interface: Option<String>,
}

#[derive(Args)]
struct PrefixArgs {
    /// Installation prefix; the binary lives in <prefix>/bin
    #[arg(long, default_value = installer::DEFAULT_PREFIX)]
    prefix: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command.unwrap_or(Command::Run(RunArgs::default())) {
        Command::Run(args) => run(args),
        Command::Install(args) => installer::install(&args.prefix).map_err(Into::into),
        Command::Uninstall(args) => installer::uninstall(&args.prefix).map_err(Into::into),
        Command::Status(args) => show_status(&args.prefix),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn show_status(prefix: &std::path::Path) -> Result<()> {
    let config = config::load_or_default(&paths::config_file_path()).unwrap_or_else(|e| {
        warn!("{e:#}; using defaults");
        config::Config::default()
    });
    installer::status(prefix, &config, &paths::status_file_path())
}

fn run(args: RunArgs) -> Result<()> {
    // ── Configuration ─────────────────────────────────────────────────────────
    let config = config::load_or_default(&paths::config_file_path())?;
    let interface = config.effective_interface(args.interface.as_deref());
    let actuator = InterfaceActuator::new(interface)
        .with_context(|| format!("Cannot guard interface {interface:?}"))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the tokio runtime")?;
    let _entered = runtime.enter();

    // ── Orchestrator ──────────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<DaemonEvent>();

    let orchestrator = Orchestrator::new(
        actuator.clone(),
        window_monitor::platform_source(),
        config.window_watch(),
        event_tx.clone(),
        shutdown.clone(),
    )
    .with_status_file(paths::status_file_path());
    let daemon = runtime.spawn(orchestrator.run(event_rx));
    runtime.spawn(wait_for_signal(shutdown.clone()));

    // ── Push watchers (registered on this thread's run loop) ──────────────────
    let watchers = ProcessWatcher::start(&config.target(), event_tx.clone())
        .context("Failed to start the process watcher")
        .and_then(|process| {
            LinkStateWatcher::start(actuator, event_tx)
                .context("Failed to start the link state watcher")
                .map(|link| (process, link))
        });
    let _watchers = match watchers {
        Ok(w) => w,
        Err(e) => {
            shutdown.cancel();
            runtime.block_on(join_after_abort(daemon));
            return Err(e);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        interface,
        bundle_id = %config.target_bundle_id,
        "awdl-guard started"
    );

    #[cfg(target_os = "macos")]
    pump_main_run_loop(&daemon);

    runtime.block_on(daemon).context("Orchestrator task failed")?;
    info!("awdl-guard stopped");
    Ok(())
}

/// Services Cocoa and CoreFoundation callbacks until the daemon task ends.
#[cfg(target_os = "macos")]
fn pump_main_run_loop(daemon: &tokio::task::JoinHandle<()>) {
    use objc2_foundation::{NSDate, NSRunLoop};

    let run_loop = NSRunLoop::mainRunLoop();
    while !daemon.is_finished() {
        run_loop.runUntilDate(&NSDate::dateWithTimeIntervalSinceNow(1.0));
    }
}

/// Waits for the orchestrator after a failed startup.  A failure of the task
/// itself is logged so the startup error stays the one reported.
async fn join_after_abort(daemon: tokio::task::JoinHandle<()>) {
    if let Err(e) = daemon.await {
        warn!(error = %e, "orchestrator task failed during startup abort");
    }
}

/// Cancels `shutdown` on SIGINT or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::pin!(terminate);

    let interrupted = tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = &mut terminate => Ok(()),
    };
    if let Err(e) = interrupted {
        warn!(error = %e, "cannot listen for SIGINT");
        terminate.await;
    }

    info!("termination signal received");
    shutdown.cancel();
}
