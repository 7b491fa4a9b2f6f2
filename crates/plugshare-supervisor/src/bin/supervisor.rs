//! Plugshare supervisor daemon
//!
//! Usage:
//!   plugshare-supervisor [--config <path>] [--verbose]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use plugshare_core::{logging, shutdown_signal, Config};
use plugshare_supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "plugshare-supervisor")]
#[command(about = "Keep the plugshare services running", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "PLUGSHARE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    let _log_guard = logging::init(&config.logging, cli.verbose);

    let supervisor =
        Arc::new(Supervisor::from_config(&config.supervisor).context("building roster")?);

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown requested, stopping services");
        token.cancel();
    });

    info!(
        "Supervisor started (liveness {}s, preventive restart {}s)",
        config.supervisor.liveness_interval_secs, config.supervisor.preventive_restart_secs
    );
    supervisor.run(cancel).await;
    Ok(())
}
