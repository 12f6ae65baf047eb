use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use taskmux_server::config::ServerConfig;
use taskmux_server::{AppState, build_cors, serve};

#[derive(Parser, Debug)]
#[command(name = "taskmux-server", about = "Run agent tasks on PTYs and stream their output")]
struct Args {
    /// Address to listen on (overrides the config file).
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for session event logs.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// File recording the pids of spawned processes.
    #[arg(long)]
    pid_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskmux_server=info,libtaskmux=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(log_dir) = args.log_dir {
        config.log_dir = log_dir;
    }
    if let Some(pid_file) = args.pid_file {
        config.pid_file = pid_file;
    }

    let cors = build_cors(&config.allow_origins)?;
    let state = Arc::new(AppState::from_config(&config)?);

    let reaped = state.executor.registry().reconcile();
    if !reaped.is_empty() {
        warn!(count = reaped.len(), pids = ?reaped, "killed processes left by a previous run");
    }

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen))?;
    info!(
        listen = %config.listen,
        log_dir = %config.log_dir.display(),
        pid = std::process::id(),
        "taskmux server started"
    );

    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutting down...");
        shutdown.cancel();
    });

    serve(listener, state, cors).await
}
