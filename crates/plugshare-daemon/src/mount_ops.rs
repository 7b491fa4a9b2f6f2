//! OS mount operations
//!
//! The Device Monitor and the Share Registry reach the kernel only through
//! [`MountOps`]. [`SystemMounts`] shells out to mount(8) (needed for FUSE
//! drivers such as ntfs-3g) and calls umount2(2) directly.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::mount::{umount2, MntFlags};
use tokio::process::Command;
use tracing::debug;

use plugshare_core::FilesystemType;

use crate::mountinfo::{self, LiveMount};

/// Unmount escalation level
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnmountMode {
    /// Plain unmount
    Normal,
    /// MNT_FORCE
    Force,
    /// MNT_DETACH: detach now, release when the last user goes away
    Lazy,
}

impl UnmountMode {
    fn flags(self) -> MntFlags {
        match self {
            UnmountMode::Normal => MntFlags::empty(),
            UnmountMode::Force => MntFlags::MNT_FORCE,
            UnmountMode::Lazy => MntFlags::MNT_DETACH,
        }
    }
}

/// Kernel-facing mount operations
#[async_trait]
pub trait MountOps: Send + Sync {
    /// Mount `device` at `target`
    async fn mount(
        &self,
        device: &Path,
        target: &Path,
        fs_type: FilesystemType,
        options: &[String],
    ) -> io::Result<()>;

    /// Unmount whatever is mounted at `target`
    async fn unmount(&self, target: &Path, mode: UnmountMode) -> io::Result<()>;

    fn is_mount_point(&self, path: &Path) -> bool;

    /// Whether any process still uses files under `mount_point`
    fn is_busy(&self, mount_point: &Path) -> bool;

    fn live_mounts(&self) -> io::Result<Vec<LiveMount>>;

    fn device_exists(&self, device: &Path) -> bool;
}

/// Real implementation backed by mount(8), umount2(2) and procfs
#[derive(Default)]
pub struct SystemMounts;

#[async_trait]
impl MountOps for SystemMounts {
    async fn mount(
        &self,
        device: &Path,
        target: &Path,
        fs_type: FilesystemType,
        options: &[String],
    ) -> io::Result<()> {
        let mut cmd = Command::new("mount");
        if let Some(t) = fs_type.mount_type() {
            cmd.arg("-t").arg(t);
        }
        if !options.is_empty() {
            cmd.arg("-o").arg(options.join(","));
        }
        cmd.arg(device).arg(target);
        debug!("Running {:?}", cmd);

        let output = cmd.output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "mount exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn unmount(&self, target: &Path, mode: UnmountMode) -> io::Result<()> {
        let target: PathBuf = target.to_path_buf();
        tokio::task::spawn_blocking(move || umount2(&target, mode.flags()).map_err(io::Error::from))
            .await
            .map_err(io::Error::other)?
    }

    fn is_mount_point(&self, path: &Path) -> bool {
        mountinfo::is_mount_point(path)
    }

    fn is_busy(&self, mount_point: &Path) -> bool {
        mountinfo::mount_in_use(mount_point)
    }

    fn live_mounts(&self) -> io::Result<Vec<LiveMount>> {
        mountinfo::read_live_mounts()
    }

    fn device_exists(&self, device: &Path) -> bool {
        device.exists()
    }
}
