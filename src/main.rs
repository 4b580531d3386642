//! arca-daemon entry point
//!
//! Loads configuration, boots every subsystem, runs startup
//! reconciliation (§4.9), then serves the thin HTTP surface (§6) over a
//! Unix domain socket until a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use arca_daemon::config::Configuration;
use arca_daemon::router::{self, AppState};
use arca_daemon::Daemon;

#[derive(Parser)]
#[command(name = "arca-daemon")]
#[command(about = "Docker Engine API-compatible daemon fronting a hypervisor-backed container runtime")]
#[command(version)]
struct Cli {
    /// Path to config.json. Defaults to $HOME/.arca/config.json, which is
    /// created with sensible defaults on first run.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Guest kernel image path. Only consulted when config.json does not
    /// exist yet (subsequent runs use the value recorded in it).
    #[arg(long, default_value = "/var/lib/arca/vmlinux")]
    kernel_path: PathBuf,

    /// Force debug logging regardless of config.json's logLevel.
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Configuration::load(path)?,
        None => Configuration::load_default(cli.kernel_path.clone())?,
    };

    let log_level = if cli.debug { "debug" } else { config.log_level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("arca_daemon={log_level}").into()),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting arca-daemon");
    info!(
        socket = %config.socket_path.display(),
        kernel = %config.kernel_path.display(),
        backend = %config.network_backend,
        "configuration loaded",
    );

    let daemon = Arc::new(Daemon::bootstrap(config).await?);

    if let Err(e) = daemon.reconcile().await {
        error!(error = %e, "startup reconciliation failed");
        return Err(e);
    }

    let state = AppState {
        containers: daemon.containers.clone(),
        networks: daemon.networks.clone(),
        config: daemon.config.clone(),
    };
    let app = router::build_router(state);

    let socket_path = daemon.config.socket_path.clone();
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }

    let listener = tokio::net::UnixListener::bind(&socket_path)?;
    info!(path = %socket_path.display(), "listening on unix socket");

    let shutdown_daemon = daemon.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.expect("failed to install CTRL+C handler");
            info!("shutdown signal received, draining outstanding exit monitors");
            shutdown_daemon.shutdown().await;
        })
        .await?;

    info!("arca-daemon stopped");
    Ok(())
}
