//! Plugshare CLI - device monitor and share controller processes
//!
//! Usage:
//!   plugshare devices          Mount and unmount removable volumes
//!   plugshare shares           Keep network shares in step with mounts
//!   plugshare reconcile        One-shot share reconciliation
//!   plugshare sample-config    Print a default configuration file

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use plugshare_core::{
    logging, shutdown_signal, Config, OwnerIdentity, MOUNTS_INVENTORY, SHARES_INVENTORY,
};
use plugshare_daemon::hotplug::SYS_CLASS_BLOCK;
use plugshare_daemon::{
    DeviceMonitor, FilesystemProbe, Inventory, MountOps, ShareController, ShareRegistry,
    Systemctl, SystemMounts, UeventSocket,
};

#[derive(Parser)]
#[command(name = "plugshare")]
#[command(about = "Removable volume mounting and network sharing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(short, long, global = true, env = "PLUGSHARE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the device monitor
    Devices,

    /// Run the share controller
    Shares,

    /// Reconcile the share store against live mounts, then exit
    Reconcile,

    /// Print a default configuration file
    SampleConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::SampleConfig = cli.command {
        print!("{}", Config::sample());
        return Ok(());
    }

    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    let _log_guard = logging::init(&config.logging, cli.verbose);

    let user = OwnerIdentity::effective_user(&config.identity.user);
    let owner = OwnerIdentity::resolve(&user).context("resolving owner identity")?;
    let root = config.mount_root(&owner.user);

    match cli.command {
        Commands::Devices => run_devices(config, owner, root).await,
        Commands::Shares => run_shares(config, owner, root).await,
        Commands::Reconcile => {
            let registry = share_registry(&config, owner, root);
            let report = registry.reconcile().await?;
            println!(
                "removed: {:?}\nadded: {:?}\nactive: {}",
                report.removed,
                report.added,
                registry.active_shares().await.len()
            );
            Ok(())
        }
        Commands::SampleConfig => Ok(()),
    }
}

/// Cancelled on SIGINT or SIGTERM
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown requested");
        token.cancel();
    });
    cancel
}

async fn run_devices(config: Config, owner: OwnerIdentity, root: PathBuf) -> Result<()> {
    let ops: Arc<dyn MountOps> = Arc::new(SystemMounts);
    let probe = FilesystemProbe::blkid(config.mounts.probe_attempts, config.mounts.probe_delay());
    let monitor = DeviceMonitor::new(owner, root, config.mounts.clone(), probe, ops)
        .with_inventory(Inventory::new(&config.inventory_dir.0, MOUNTS_INVENTORY));
    let monitor = Arc::new(monitor);

    // Subscribe before the startup scan so nothing plugged in meanwhile is missed
    let socket = UeventSocket::open().context("opening uevent socket")?;
    monitor.startup(Path::new(SYS_CLASS_BLOCK)).await?;

    monitor.run(socket, shutdown_token()).await;
    Ok(())
}

fn share_registry(config: &Config, owner: OwnerIdentity, root: PathBuf) -> ShareRegistry {
    let ops: Arc<dyn MountOps> = Arc::new(SystemMounts);
    let daemon = Arc::new(Systemctl::new(config.shares.daemon_unit.clone()));
    ShareRegistry::new(config.shares.clone(), root, owner, ops, daemon)
        .with_inventory(Inventory::new(&config.inventory_dir.0, SHARES_INVENTORY))
}

async fn run_shares(config: Config, owner: OwnerIdentity, root: PathBuf) -> Result<()> {
    std::fs::create_dir_all(&root).with_context(|| format!("creating {:?}", root))?;

    let registry = Arc::new(share_registry(&config, owner, root));
    let ops: Arc<dyn MountOps> = Arc::new(SystemMounts);
    let controller = ShareController::new(registry, ops, config.shares.settle())
        .with_mount_window(config.mounts.mount_window());

    // Watch before the startup scan so mounts landing meanwhile are seen
    Arc::new(controller)
        .run(shutdown_token())
        .await
        .context("watching mount root")?;
    Ok(())
}
