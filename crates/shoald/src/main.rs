//! shoald — the shoal daemon.
//!
//! Opens the cluster store and runs the rolling-update orchestrator until
//! interrupted.
//!
//! # Usage
//!
//! ```text
//! shoald run --config /etc/shoal/shoald.toml --data-dir /var/lib/shoal
//! ```

mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use shoal_update::Orchestrator;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{DaemonConfig, LogFormat};

#[derive(Parser)]
#[command(name = "shoald", about = "Shoal rolling-update daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the update orchestrator.
    Run {
        /// Path to a TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state; overrides the config file.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, data_dir } => {
            let mut cfg = DaemonConfig::load(config.as_deref())?;
            if let Some(dir) = data_dir {
                cfg.data_dir = dir;
            }
            init_tracing(&cfg);
            run(cfg).await
        }
    }
}

fn init_tracing(cfg: &DaemonConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match cfg.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(cfg: DaemonConfig) -> anyhow::Result<()> {
    info!("shoal daemon starting");

    std::fs::create_dir_all(&cfg.data_dir)?;
    let db_path = cfg.store_path();

    // ── Initialize subsystems ──────────────────────────────────

    let store = shoal_state::StateStore::open(&db_path)?.with_event_buffer(cfg.updater.event_buffer);
    info!(path = ?db_path, "state store opened");

    let orchestrator = Orchestrator::new(store, cfg.updater.clone());

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let orchestrator_handle = tokio::spawn(orchestrator.run(shutdown_rx));

    info!(
        monitor_ms = cfg.updater.default_monitor_ms,
        commit_retries = cfg.updater.commit_retries,
        "orchestrator running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    match orchestrator_handle.await? {
        Ok(()) => info!("shoal daemon stopped"),
        Err(e) => {
            error!(error = %e, "orchestrator exited with error");
            return Err(e.into());
        }
    }
    Ok(())
}
