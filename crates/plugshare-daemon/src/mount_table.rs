//! Mount Table - in-memory device to mount-point bindings
//!
//! Owned by the Device Monitor. All access goes through the methods below;
//! the map itself is never handed out. After every mutation the table is
//! re-synced against the kernel's live mount list so that it cannot drift.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, info};

use plugshare_core::{MountBinding, MountState, OwnerIdentity};

use crate::mountinfo::LiveMount;

/// Bindings keyed by device path (at most one per device)
#[derive(Default)]
pub struct MountTable {
    bindings: RwLock<HashMap<PathBuf, MountBinding>>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device: &Path) -> Option<MountBinding> {
        self.bindings.read().get(device).cloned()
    }

    /// Insert or replace the binding for its device
    pub fn insert(&self, binding: MountBinding) {
        debug!(
            "Binding {:?} -> {:?} ({:?})",
            binding.device, binding.mount_point, binding.state
        );
        self.bindings.write().insert(binding.device.clone(), binding);
    }

    /// Update the state of an existing binding. Returns false if there is none.
    pub fn set_state(&self, device: &Path, state: MountState) -> bool {
        match self.bindings.write().get_mut(device) {
            Some(binding) => {
                binding.state = state;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, device: &Path) -> Option<MountBinding> {
        self.bindings.write().remove(device)
    }

    /// Find the binding that references a mount point
    pub fn by_mount_point(&self, mount_point: &Path) -> Option<MountBinding> {
        self.bindings
            .read()
            .values()
            .find(|b| b.mount_point == mount_point)
            .cloned()
    }

    /// All bindings, sorted by device path
    pub fn snapshot(&self) -> Vec<MountBinding> {
        let mut all: Vec<MountBinding> = self.bindings.read().values().cloned().collect();
        all.sort_by(|a, b| a.device.cmp(&b.device));
        all
    }

    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.read().is_empty()
    }

    /// Reconcile against the live mount list.
    ///
    /// Live mounts under `root` whose device still exists and that have no
    /// binding are adopted as MOUNTED. MOUNTED bindings whose mount point is
    /// no longer live are dropped and returned. Bindings in transitional or
    /// STALE states are left to their owner.
    pub fn sync_with(
        &self,
        live: &[LiveMount],
        root: &Path,
        device_exists: impl Fn(&Path) -> bool,
        owner: &OwnerIdentity,
    ) -> Vec<MountBinding> {
        let mut bindings = self.bindings.write();

        let vanished: Vec<PathBuf> = bindings
            .values()
            .filter(|b| b.state == MountState::Mounted)
            .filter(|b| !live.iter().any(|m| m.mount_point == b.mount_point))
            .map(|b| b.device.clone())
            .collect();
        let mut dropped = Vec::with_capacity(vanished.len());
        for device in vanished {
            if let Some(binding) = bindings.remove(&device) {
                info!(
                    "Dropping binding for {:?}: {:?} is no longer mounted",
                    device, binding.mount_point
                );
                dropped.push(binding);
            }
        }

        for mount in live.iter().filter(|m| m.is_under(root)) {
            let known = bindings.contains_key(&mount.source)
                || bindings.values().any(|b| b.mount_point == mount.mount_point);
            if known || !device_exists(&mount.source) {
                continue;
            }
            info!(
                "Adopting existing mount {:?} at {:?}",
                mount.source, mount.mount_point
            );
            bindings.insert(
                mount.source.clone(),
                MountBinding {
                    device: mount.source.clone(),
                    mount_point: mount.mount_point.clone(),
                    uid: owner.uid,
                    gid: owner.gid,
                    options: mount.options.clone(),
                    state: MountState::Mounted,
                },
            );
        }

        dropped
    }
}
