//! Service account broker
//!
//! Operator CLI over the shared ban store and credential pool:
//! 1. Loads config and opens the ban store
//! 2. Loads service accounts for every configured remote
//! 3. Runs one command (lease, ban, report, serve, ...)
//!
//! `serve` also exposes Prometheus metrics when `[metrics] listen_addr` is set.
//!
//! Machine-readable output goes to stdout; JSON logs go to stderr.

mod broker;
mod cli;
mod config;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::broker::Broker;
use crate::cli::{Cli, Command};
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    let config_path = Config::resolve_path(cli.config.as_deref());
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path).context("failed to load config")?;

    info!(
        remotes = config.remotes.len(),
        parallelism = config.pool.parallelism,
        "configuration loaded"
    );

    let broker = Broker::open(&config).await?;
    let mut out = std::io::stdout().lock();

    match cli.command {
        Command::Lease { remotes } => broker.lease(&remotes, &mut out).await,
        Command::Ban { key, hours } => broker.ban(&key, hours, &mut out).await,
        Command::Unban { key } => broker.unban(&key, &mut out).await,
        Command::Bans => broker.list_bans(&mut out).await,
        Command::Purge => broker.purge(&mut out).await,
        Command::Status => broker.status(&mut out).await,
        Command::Report {
            code,
            remote,
            credentials,
        } => broker.report(code, &remote, &credentials, &mut out).await,
        Command::Serve { remotes } => {
            if let Some(listen) = config.metrics_listen_addr() {
                metrics::install_exporter(listen)?;
            }
            broker
                .serve(&remotes, config.sweep_interval(), &mut out, shutdown_signal())
                .await?;
            info!("shutdown complete");
            Ok(())
        }
    }
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
