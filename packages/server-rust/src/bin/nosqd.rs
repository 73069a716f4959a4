//! `nosqd` -- the NoSQ server binary.
//!
//! Loads configuration (optionally overlaid per environment), starts the
//! server, and runs until `SIGINT`/`SIGTERM` trigger a graceful shutdown.
//! Exit code 0 on a clean stop, 1 on a fatal error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use nosq_server::config::ServerConfig;
use nosq_server::network::Server;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "nosqd", version, about = "NoSQ document database server")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, env = "NOSQD_CONFIG")]
    config: Option<PathBuf>,

    /// Environment overlay name (loads `<config>.<environment>.json`).
    #[arg(long, env = "NOSQD_ENVIRONMENT")]
    environment: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => ServerConfig::load(path, cli.environment.as_deref())?,
        None => ServerConfig::default(),
    };

    let handle = Server::start(config).await?;
    tracing::info!(addr = %handle.addr, "nosqd listening");

    wait_for_signal().await;
    handle.shutdown().await;
    Ok(())
}

/// Resolves on `SIGINT` or `SIGTERM`.
async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    tracing::warn!(%err, "cannot install SIGTERM handler");
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => tracing::info!("SIGINT received"),
            _ = sigterm.recv() => tracing::info!("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        tracing::info!("SIGINT received");
    }
}
