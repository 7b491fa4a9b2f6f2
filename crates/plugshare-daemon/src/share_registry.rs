//! Share Registry - the set of managed network shares
//!
//! The registry is the only writer of the share store. Every mutation
//! rewrites the store in full and then asks the file-sharing daemon to
//! reload. The store on disk is authoritative: a failed reload is logged
//! and left for the next reconciliation pass, it never rolls back the
//! in-memory active set.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use plugshare_core::{share_name, OwnerIdentity, ShareConfig, ShareEntry, ShareError};

use crate::daemon_control::DaemonControl;
use crate::inventory::{write_atomic, Inventory};
use crate::mount_ops::MountOps;
use crate::share_store::{entry_to_section, render_main_config, ShareStore};

/// Result of a reconciliation pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub removed: Vec<String>,
    pub added: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// Active shares by name
#[derive(Default)]
struct RegistryState {
    active: BTreeMap<String, ShareEntry>,
}

pub struct ShareRegistry {
    config: ShareConfig,
    root: PathBuf,
    owner: OwnerIdentity,
    ops: Arc<dyn MountOps>,
    daemon: Arc<dyn DaemonControl>,
    inventory: Option<Inventory>,
    state: Mutex<RegistryState>,
}

impl ShareRegistry {
    pub fn new(
        config: ShareConfig,
        root: PathBuf,
        owner: OwnerIdentity,
        ops: Arc<dyn MountOps>,
        daemon: Arc<dyn DaemonControl>,
    ) -> Self {
        Self {
            config,
            root,
            owner,
            ops,
            daemon,
            inventory: None,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Publish the active set to an inventory file after every change
    pub fn with_inventory(mut self, inventory: Inventory) -> Self {
        self.inventory = Some(inventory);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn share_name(&self, mount_point: &Path) -> Option<String> {
        share_name(&self.config.prefix, mount_point)
    }

    fn is_managed(&self, name: &str) -> bool {
        name.starts_with(&self.config.prefix)
    }

    fn entry_for(&self, name: String, mount_point: &Path) -> ShareEntry {
        let base = mount_point
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        ShareEntry {
            name,
            path: mount_point.to_path_buf(),
            comment: format!("Removable volume {}", base),
            access: self.config.access.clone(),
            owner: Some(self.owner.user.clone()),
            active: true,
        }
    }

    /// Live mount points that are direct children of the root
    pub fn live_mount_points(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut points: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir() && self.ops.is_mount_point(p))
            .collect();
        points.sort();
        points
    }

    /// Add a share for a mount point. No-op if it is already active.
    pub async fn create(&self, mount_point: &Path) -> Result<ShareEntry, ShareError> {
        let name = self
            .share_name(mount_point)
            .ok_or_else(|| ShareError::InvalidMountPoint(mount_point.to_path_buf()))?;

        let mut state = self.state.lock().await;
        if let Some(existing) = state.active.get(&name) {
            debug!("Share {} already active", name);
            return Ok(existing.clone());
        }

        let entry = self.entry_for(name.clone(), mount_point);
        let mut store = ShareStore::load(&self.config.conf_path)?;
        store.upsert(entry_to_section(&entry));
        store.save(&self.config.conf_path)?;

        state.active.insert(name.clone(), entry.clone());
        info!("Share {} -> {:?} created", name, mount_point);
        self.reload().await;
        self.publish(&state);
        Ok(entry)
    }

    /// Remove a batch of shares with one store write and one reload.
    ///
    /// Names that do not exist are ignored. Returns how many were removed.
    pub async fn remove(&self, names: &[String]) -> Result<usize, ShareError> {
        let mut state = self.state.lock().await;
        let mut store = ShareStore::load(&self.config.conf_path)?;

        let mut removed = 0;
        for name in names {
            let in_store = store.remove(name);
            let in_active = state.active.remove(name).is_some();
            if in_store || in_active {
                info!("Share {} removed", name);
                removed += 1;
            }
        }
        if removed == 0 {
            debug!("No shares to remove among {:?}", names);
            return Ok(0);
        }

        store.save(&self.config.conf_path)?;
        self.reload().await;
        self.publish(&state);
        Ok(removed)
    }

    /// Bring the store in line with the live mount points under the root.
    ///
    /// Managed sections whose path is missing, not a live mount point, or
    /// does not match the share name are purged; live mount points without
    /// a section get one. Afterwards the active set mirrors the store.
    pub async fn reconcile(&self) -> Result<ReconcileReport, ShareError> {
        let mut state = self.state.lock().await;
        let mut store = ShareStore::load(&self.config.conf_path)?;
        let mut report = ReconcileReport::default();

        let stale: Vec<String> = store
            .sections()
            .iter()
            .filter(|s| self.is_managed(&s.name))
            .filter(|s| match s.path() {
                Some(path) => {
                    !path.exists()
                        || !self.ops.is_mount_point(&path)
                        || path.parent() != Some(self.root.as_path())
                        || self.share_name(&path).as_deref() != Some(s.name.as_str())
                }
                None => true,
            })
            .map(|s| s.name.clone())
            .collect();
        for name in stale {
            info!("Reconcile: removing stale share {}", name);
            store.remove(&name);
            report.removed.push(name);
        }

        for mount_point in self.live_mount_points() {
            let Some(name) = self.share_name(&mount_point) else {
                continue;
            };
            if store.get(&name).is_none() {
                info!("Reconcile: adding share {} for {:?}", name, mount_point);
                store.upsert(entry_to_section(&self.entry_for(name.clone(), &mount_point)));
                report.added.push(name);
            }
        }

        state.active = store
            .sections()
            .iter()
            .filter(|s| self.is_managed(&s.name))
            .filter_map(|s| s.path().map(|p| (s.name.clone(), p)))
            .map(|(name, path)| (name.clone(), self.entry_for(name, &path)))
            .collect();

        if !report.is_empty() {
            store.save(&self.config.conf_path)?;
            self.reload().await;
        }
        self.publish(&state);
        info!(
            "Reconcile complete: {} active, {} removed, {} added",
            state.active.len(),
            report.removed.len(),
            report.added.len()
        );
        Ok(report)
    }

    /// Snapshot of the active shares
    pub async fn active_shares(&self) -> Vec<ShareEntry> {
        self.state.lock().await.active.values().cloned().collect()
    }

    pub async fn is_active(&self, name: &str) -> bool {
        self.state.lock().await.active.contains_key(name)
    }

    /// Write the main daemon configuration and restart the daemon, if managed
    pub async fn ensure_main_config(&self) -> Result<(), ShareError> {
        if !self.config.manage_main_config {
            return Ok(());
        }

        let text = render_main_config(&self.config.conf_path, &self.config.access);
        write_atomic(&self.config.main_conf_path, text.as_bytes()).map_err(|e| {
            ShareError::ShareWriteFailed {
                path: self.config.main_conf_path.clone(),
                reason: e.to_string(),
            }
        })?;
        info!("Wrote {:?}", self.config.main_conf_path);

        if let Err(e) = self.daemon.restart().await {
            warn!("{}", e);
        }
        Ok(())
    }

    async fn reload(&self) {
        if let Err(e) = self.daemon.reload().await {
            warn!("{} (store stays authoritative)", e);
        }
    }

    fn publish(&self, state: &RegistryState) {
        if let Some(inventory) = &self.inventory {
            let shares: Vec<&ShareEntry> = state.active.values().collect();
            inventory.publish(&shares);
        }
    }
}
