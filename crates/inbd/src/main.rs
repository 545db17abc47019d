//! `inbd` Daemon
//!
//! Verifies any update pending from before the last reboot, then serves
//! update and configuration requests on a local Unix socket.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use inbd::config::Settings;
use inbd::disk::StatvfsProbe;
use inbd::server::{DEFAULT_SOCKET, RequestServer};
use inbd::Orchestrator;
use inbd_core::exec::{IMAGE_TOOL, SNAPSHOT_TOOL};
use inbd_core::{Executor, SafeFs};

#[derive(Parser, Debug)]
#[command(name = "inbd")]
#[command(version, about = "inbd - system software update orchestrator")]
struct Args {
    /// Unix socket to serve requests on
    #[arg(long, default_value = DEFAULT_SOCKET, env = "INBD_SOCKET")]
    socket_path: PathBuf,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "INBD_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "INBD_LOG_JSON")]
    log_json: bool,

    /// Image-update tool (image-based distributions)
    #[arg(long, default_value = IMAGE_TOOL, env = "INBD_IMAGE_TOOL")]
    image_tool: PathBuf,

    /// Filesystem snapshot tool (package-based distributions)
    #[arg(long, default_value = SNAPSHOT_TOOL, env = "INBD_SNAPSHOT_TOOL")]
    snapshot_tool: PathBuf,

    /// Access token for artifact servers
    #[arg(long, env = "INBD_TOKEN_PATH")]
    token_path: Option<PathBuf>,

    /// Verify a pending update and exit without serving.
    #[arg(long)]
    verify_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    inbd_core::tracing_init::init_tracing(
        &inbd_core::tracing_init::default_filter(&args.log_level),
        args.log_json,
    )?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        socket = %args.socket_path.display(),
        "Starting inbd"
    );

    let mut settings = Settings::default()
        .with_image_tool(&args.image_tool)
        .with_snapshot_tool(&args.snapshot_tool);
    if let Some(token) = args.token_path {
        settings.paths.token = token;
    }
    let runner = Executor::default()
        .allow(&args.image_tool)
        .allow(&args.snapshot_tool);
    let orchestrator = Arc::new(Orchestrator::new(
        settings,
        SafeFs::default(),
        runner,
        StatvfsProbe,
    ));

    match orchestrator.verify_after_boot().await {
        Ok(outcome) => info!(?outcome, "post-boot verification finished"),
        Err(e) => warn!(error = %e, "post-boot verification failed"),
    }
    if args.verify_only {
        return Ok(());
    }

    let server = RequestServer::bind(Arc::clone(&orchestrator), &args.socket_path)?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // `true` unsets $NOTIFY_SOCKET so update tools don't notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    info!(path = %server.path().display(), "inbd ready");

    tokio::select! {
        result = server.serve() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    if let Err(e) = std::fs::remove_file(&args.socket_path) {
        warn!(error = %e, "failed to remove request socket");
    }
    info!("inbd stopped");
    Ok(())
}
