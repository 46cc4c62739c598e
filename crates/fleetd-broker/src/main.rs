//! fleetd-broker - Privileged Process Broker
//!
//! Started exactly once by the main process, before the main process
//! drops its own privileges. Serves spawn, relay, privileged exec, and
//! kill requests over a Unix socket until it receives a shutdown request
//! or a termination signal.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fleetd_broker::server::BrokerServer;
use fleetd_broker::spawn::WorkerSpec;
use fleetd_core::config::FleetConfig;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// fleetd privileged process broker
#[derive(Parser, Debug)]
#[command(name = "fleetd-broker")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to fleet configuration file
    #[arg(short, long, default_value = "fleet.toml")]
    config: PathBuf,

    /// Path to the broker Unix socket (overrides the config file)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Worker executable to fork for spawn requests (overrides the
    /// config file)
    #[arg(long)]
    worker_command: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("invalid log level")?;

    match &args.log_file {
        Some(path) => {
            let file = std::fs::File::options()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    let config = if args.config.exists() {
        FleetConfig::from_file(&args.config).context("failed to load configuration")?
    } else {
        warn!(path = %args.config.display(), "configuration file not found, using defaults");
        FleetConfig::default()
    };

    let socket = args.socket.unwrap_or_else(|| config.broker.socket.clone());
    let runner = WorkerSpec {
        command: args
            .worker_command
            .unwrap_or_else(|| config.broker.worker_command.clone()),
        args: config.broker.worker_args.clone(),
    };

    let server = BrokerServer::bind(&socket)
        .with_context(|| format!("failed to bind broker socket {}", socket.display()))?;
    info!(
        socket = %socket.display(),
        worker = %runner.command.display(),
        "broker ready"
    );

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    tokio::select! {
        result = server.run(&runner) => {
            result.context("broker server failed")?;
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
        }
        _ = sigint.recv() => {
            info!("received SIGINT, shutting down");
        }
    }

    Ok(())
}
