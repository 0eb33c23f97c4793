#![forbid(unsafe_code)]

//! `worker-supervisor`: supervisor server binary.
//!
//! Loads configuration, binds the control socket and serves workers until
//! interrupted.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use worker_supervisor::service::Service;
use worker_supervisor::{AppError, Result, SupervisorConfig};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "worker-supervisor", about = "Supervisor for local worker processes", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Overrides the configured root. A configured `ipc_path` still decides
    /// where the socket lives.
    #[arg(long)]
    root: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("worker-supervisor bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => SupervisorConfig::load_from_path(path)?,
        None => {
            let root = std::env::current_dir()
                .map_err(|err| AppError::Config(format!("cannot determine working directory: {err}")))?;
            SupervisorConfig::with_root(root)
        }
    };
    if let Some(root) = &args.root {
        config.set_root(root)?;
        if let Some(ipc_path) = &config.ipc_path {
            warn!(
                ipc_path = %ipc_path.display(),
                "--root does not move the socket while ipc_path is configured"
            );
        }
    }
    info!(root = %config.root.display(), "configuration loaded");

    let mut service = Service::start(config)?;
    info!(title = %service.title(), "ready");

    let ct = CancellationToken::new();
    let shutdown = {
        let ct = ct.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            ct.cancel();
        })
    };

    let result = service.run(ct.clone()).await;
    if let Err(err) = &result {
        error!(%err, "supervisor failed");
    }

    shutdown.abort();
    service.stop();
    info!("worker-supervisor shut down");
    result
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(err) => {
            warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
            let _ = ctrl_c.await;
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
