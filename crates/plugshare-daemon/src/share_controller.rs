//! Share Controller - keeps shares in step with mount-point directories
//!
//! Watches the mount root (non-recursively). A new subdirectory that turns
//! out to be a mount point gets a share; a vanished subdirectory loses its
//! share. Notifications are handled one at a time in the order the
//! filesystem reports them.
//!
//! The watch is set up before the startup scan, so a directory created
//! while the scan runs is picked up from the buffered notifications.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mount_ops::MountOps;
use crate::share_registry::ShareRegistry;

/// Checks of a new directory beyond those covering the mount window
pub const MOUNT_CHECKS: u32 = 3;

/// Callbacks for mount-point directories appearing and disappearing
#[async_trait]
pub trait MountPointHandler: Send + Sync {
    async fn on_created(&self, path: &Path);
    async fn on_deleted(&self, path: &Path);
}

/// A change to a direct child of the watched root
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DirChange {
    Created(PathBuf),
    Deleted(PathBuf),
}

/// An active watch on the mount root and its buffered notifications
pub struct RootWatch {
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
}

pub struct ShareController {
    registry: Arc<ShareRegistry>,
    ops: Arc<dyn MountOps>,
    settle: Duration,
    checks: u32,
}

impl ShareController {
    pub fn new(registry: Arc<ShareRegistry>, ops: Arc<dyn MountOps>, settle: Duration) -> Self {
        Self {
            registry,
            ops,
            settle,
            checks: MOUNT_CHECKS,
        }
    }

    /// Keep checking a new directory for as long as the device monitor
    /// may still be retrying its mount.
    pub fn with_mount_window(mut self, window: Duration) -> Self {
        let extra = if self.settle.is_zero() {
            0
        } else {
            let per_check = self.settle.as_millis().max(1);
            u32::try_from(window.as_millis().div_ceil(per_check)).unwrap_or(u32::MAX)
        };
        self.checks = MOUNT_CHECKS.saturating_add(extra);
        self
    }

    pub fn mount_checks(&self) -> u32 {
        self.checks
    }

    pub fn registry(&self) -> &Arc<ShareRegistry> {
        &self.registry
    }

    /// Share every mount point that already exists, then purge stale shares.
    pub async fn startup(&self) {
        if let Err(e) = self.registry.ensure_main_config().await {
            warn!("{}", e);
        }

        let existing = self.registry.live_mount_points();
        info!("Found {} existing mount points", existing.len());
        for mount_point in existing {
            if let Err(e) = self.registry.create(&mount_point).await {
                warn!("Cannot share {:?}: {}", mount_point, e);
            }
        }

        if let Err(e) = self.registry.reconcile().await {
            warn!("Startup reconciliation failed: {}", e);
        }
    }

    pub async fn dispatch(&self, change: DirChange) {
        match change {
            DirChange::Created(path) => self.on_created(&path).await,
            DirChange::Deleted(path) => self.on_deleted(&path).await,
        }
    }

    /// Start watching the root. Notifications queue up until [`serve`].
    ///
    /// [`serve`]: ShareController::serve
    pub fn watch(&self) -> notify::Result<RootWatch> {
        let root = self.registry.root();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                let _ = tx.send(result);
            },
            notify::Config::default(),
        )?;
        watcher.watch(root, RecursiveMode::NonRecursive)?;
        info!("Watching {:?} for mount points", root);

        Ok(RootWatch {
            _watcher: watcher,
            rx,
        })
    }

    /// Watch the root, run the startup pass, then handle notifications
    /// until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> notify::Result<()> {
        let watch = self.watch()?;
        self.startup().await;
        self.serve(watch, cancel).await;
        Ok(())
    }

    /// Handle notifications of an established watch until `cancel` fires.
    pub async fn serve(&self, mut watch: RootWatch, cancel: CancellationToken) {
        let root = self.registry.root().to_path_buf();

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = watch.rx.recv() => match result {
                    Some(result) => result,
                    None => break,
                },
            };

            match result {
                Ok(event) => {
                    for change in classify(&root, &event) {
                        debug!("Root change: {:?}", change);
                        self.dispatch(change).await;
                    }
                }
                Err(e) => warn!("Watch error on {:?}: {}", root, e),
            }
        }

        info!("Share controller stopped");
    }
}

#[async_trait]
impl MountPointHandler for ShareController {
    async fn on_created(&self, path: &Path) {
        for check in 1..=self.checks {
            tokio::time::sleep(self.settle).await;
            if self.ops.is_mount_point(path) {
                if let Err(e) = self.registry.create(path).await {
                    warn!("Cannot share {:?}: {}", path, e);
                }
                return;
            }
            debug!(
                "{:?} is not a mount point yet (check {}/{})",
                path, check, self.checks
            );
        }
        debug!("Ignoring {:?}: never became a mount point", path);
    }

    async fn on_deleted(&self, path: &Path) {
        let Some(name) = self.registry.share_name(path) else {
            return;
        };
        if let Err(e) = self.registry.remove(&[name]).await {
            warn!("Cannot remove share for {:?}: {}", path, e);
        }
    }
}

/// Turn a watcher event into changes of direct children of `root`.
pub fn classify(root: &Path, event: &Event) -> Vec<DirChange> {
    let direct = |p: &&PathBuf| p.parent() == Some(root);

    match &event.kind {
        EventKind::Create(CreateKind::File) => Vec::new(),
        EventKind::Create(_) => event
            .paths
            .iter()
            .filter(direct)
            .map(|p| DirChange::Created(p.clone()))
            .collect(),
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .iter()
            .filter(direct)
            .map(|p| DirChange::Deleted(p.clone()))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .iter()
            .filter(direct)
            .map(|p| DirChange::Created(p.clone()))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut changes = Vec::new();
            if let Some(from) = event.paths.first().filter(|p| p.parent() == Some(root)) {
                changes.push(DirChange::Deleted(from.clone()));
            }
            if let Some(to) = event.paths.get(1).filter(|p| p.parent() == Some(root)) {
                changes.push(DirChange::Created(to.clone()));
            }
            changes
        }
        _ => Vec::new(),
    }
}
