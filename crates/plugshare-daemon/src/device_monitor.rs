//! Device Monitor - hotplug driven mount/unmount
//!
//! Consumes add/remove events, resolves filesystem types, mounts volumes
//! under the managed root with the per-type policy, and tears them down
//! again with a busy check and lazy/forced escalation. At startup it
//! reclaims stale mounts left behind by a previous run and mounts
//! partitions that were plugged in while it was not running.
//!
//! Events for the same device are handled in arrival order by a dedicated
//! worker; different devices proceed independently.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::unistd::{chown, Gid, Uid};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use plugshare_core::{
    BlockDevice, DeviceError, FilesystemType, MountBinding, MountConfig, MountState,
    OwnerIdentity, DIR_MODE, FILE_MODE,
};

use crate::hotplug::{scan_partitions, HotplugAction, HotplugEvent, HotplugSource};
use crate::inventory::Inventory;
use crate::mount_ops::{MountOps, UnmountMode};
use crate::mount_table::MountTable;
use crate::policy;
use crate::probe::FilesystemProbe;

/// Hotplug-driven mount manager
pub struct DeviceMonitor {
    owner: OwnerIdentity,
    root: PathBuf,
    config: MountConfig,
    probe: FilesystemProbe,
    ops: Arc<dyn MountOps>,
    table: MountTable,
    inventory: Option<Inventory>,
    /// Serialises snapshot + write so the last writer sees the latest table
    publish_lock: Mutex<()>,
}

impl DeviceMonitor {
    pub fn new(
        owner: OwnerIdentity,
        root: PathBuf,
        config: MountConfig,
        probe: FilesystemProbe,
        ops: Arc<dyn MountOps>,
    ) -> Self {
        Self {
            owner,
            root,
            config,
            probe,
            ops,
            table: MountTable::new(),
            inventory: None,
            publish_lock: Mutex::new(()),
        }
    }

    /// Publish the mount table to an inventory file after every change
    pub fn with_inventory(mut self, inventory: Inventory) -> Self {
        self.inventory = Some(inventory);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table(&self) -> &MountTable {
        &self.table
    }

    /// Mount point for a device: `<root>/<device basename>`
    pub fn mount_point_for(&self, device: &Path) -> Option<PathBuf> {
        device.file_name().map(|name| self.root.join(name))
    }

    /// Create the managed root, owned by the owner, mode 0755
    pub fn prepare_root(&self) -> Result<(), DeviceError> {
        let io_err = |source| DeviceError::Io {
            path: self.root.clone(),
            source,
        };
        fs::create_dir_all(&self.root).map_err(io_err)?;
        self.set_owner(&self.root).map_err(io_err)?;
        fs::set_permissions(&self.root, fs::Permissions::from_mode(DIR_MODE)).map_err(io_err)?;
        info!("Mount root {:?} ready", self.root);
        Ok(())
    }

    /// Startup pass: prepare the root, reclaim stale mounts, adopt live
    /// ones, drop orphaned directories, then mount partitions already present.
    pub async fn startup(&self, sys_class_block: &Path) -> Result<(), DeviceError> {
        self.prepare_root()?;
        self.reconcile_startup().await;

        match scan_partitions(sys_class_block) {
            Ok(events) => self.scan_existing(events).await,
            Err(e) => warn!("Cannot scan {:?} for existing partitions: {}", sys_class_block, e),
        }
        Ok(())
    }

    /// Reclaim live mounts under the root whose device is gone.
    pub async fn reconcile_startup(&self) {
        let live = match self.ops.live_mounts() {
            Ok(live) => live,
            Err(e) => {
                warn!("Cannot read live mounts: {}", e);
                return;
            }
        };

        for mount in live.iter().filter(|m| m.is_under(&self.root)) {
            if self.ops.device_exists(&mount.source) {
                continue;
            }

            warn!(
                "Stale mount {:?} at {:?}: device is gone, reclaiming",
                mount.source, mount.mount_point
            );
            self.table.insert(MountBinding {
                device: mount.source.clone(),
                mount_point: mount.mount_point.clone(),
                uid: self.owner.uid,
                gid: self.owner.gid,
                options: mount.options.clone(),
                state: MountState::Stale,
            });

            match self.release(&mount.mount_point).await {
                Ok(mode) => {
                    info!("Reclaimed stale mount {:?} ({:?})", mount.mount_point, mode);
                    self.table.remove(&mount.source);
                    remove_dir_if_empty(&mount.mount_point);
                }
                Err(reason) => {
                    let err = DeviceError::UnmountFailed {
                        mount_point: mount.mount_point.clone(),
                        reason,
                    };
                    error!("{}", err);
                }
            }
        }

        self.sync();
        self.prune_orphan_dirs();
    }

    /// Remove empty directories under the root that nothing is mounted on
    fn prune_orphan_dirs(&self) {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() || self.ops.is_mount_point(&path) {
                continue;
            }
            if self.table.by_mount_point(&path).is_some() {
                continue;
            }
            debug!("Pruning orphaned mount point {:?}", path);
            remove_dir_if_empty(&path);
        }
    }

    /// Mount partitions found at startup that are not mounted yet
    pub async fn scan_existing(&self, events: Vec<HotplugEvent>) {
        for event in events {
            if self.table.get(&event.device).is_some() {
                continue;
            }
            if let Err(e) = self.add_device(&event).await {
                warn!("Existing device {:?} not mounted: {}", event.device, e);
            }
        }
    }

    /// Handle one hotplug event. Errors are logged and contained.
    pub async fn handle_event(&self, event: &HotplugEvent) {
        match event.action {
            HotplugAction::Add => {
                if !self.config.add_settle().is_zero() {
                    tokio::time::sleep(self.config.add_settle()).await;
                }
                if let Err(e) = self.add_device(event).await {
                    warn!("{}", e);
                }
            }
            HotplugAction::Remove => {
                if let Err(e) = self.unmount(&event.device).await {
                    error!("{}", e);
                }
            }
        }
    }

    /// Filter, probe, and mount a newly seen partition.
    ///
    /// Returns Ok(None) when the device is filtered out.
    pub async fn add_device(
        &self,
        event: &HotplugEvent,
    ) -> Result<Option<MountBinding>, DeviceError> {
        if self.config.usb_only && !event.usb {
            debug!("Ignoring non-USB device {:?}", event.device);
            return Ok(None);
        }

        let fs_type = self.probe.resolve(&event.device).await;
        if fs_type == FilesystemType::Unknown {
            return Err(DeviceError::ProbeInconclusive {
                device: event.device.clone(),
                attempts: self.config.probe_attempts,
            });
        }

        let device = BlockDevice {
            path: event.device.clone(),
            fs_type,
            usb: event.usb,
        };
        self.mount(&device).await.map(Some)
    }

    /// Mount a resolved device under the root.
    ///
    /// Mounting an already mounted device is a no-op. On failure the mount
    /// point is cleaned up and no binding is left behind.
    pub async fn mount(&self, device: &BlockDevice) -> Result<MountBinding, DeviceError> {
        if let Some(existing) = self.table.get(&device.path) {
            if existing.state == MountState::Mounted
                && self.ops.is_mount_point(&existing.mount_point)
            {
                debug!("{:?} already mounted at {:?}", device.path, existing.mount_point);
                return Ok(existing);
            }
        }

        let mount_point = self.mount_point_for(&device.path).ok_or_else(|| {
            DeviceError::MountFailed {
                device: device.path.clone(),
                mount_point: self.root.clone(),
                reason: "device path has no file name".to_string(),
            }
        })?;
        let fail = |reason: String| DeviceError::MountFailed {
            device: device.path.clone(),
            mount_point: mount_point.clone(),
            reason,
        };

        if let Ok(live) = self.ops.live_mounts() {
            if let Some(current) = live.iter().find(|m| m.source == device.path) {
                if current.mount_point != mount_point {
                    return Err(fail(format!(
                        "already mounted at {:?}",
                        current.mount_point
                    )));
                }
                let binding = MountBinding {
                    device: device.path.clone(),
                    mount_point: mount_point.clone(),
                    uid: self.owner.uid,
                    gid: self.owner.gid,
                    options: current.options.clone(),
                    state: MountState::Mounted,
                };
                info!("Adopting existing mount of {:?} at {:?}", device.path, mount_point);
                self.table.insert(binding.clone());
                self.sync();
                return Ok(binding);
            }
        }
        if self.ops.is_mount_point(&mount_point) {
            return Err(fail("mount point is occupied by another device".to_string()));
        }

        let opts = policy::options_for(device.fs_type, self.owner.uid, self.owner.gid);
        let mut binding = MountBinding {
            device: device.path.clone(),
            mount_point: mount_point.clone(),
            uid: self.owner.uid,
            gid: self.owner.gid,
            options: opts.options.clone(),
            state: MountState::Mounting,
        };
        self.table.insert(binding.clone());

        if let Err(e) = fs::create_dir_all(&mount_point).and_then(|_| self.set_owner(&mount_point))
        {
            self.abandon(&device.path, &mount_point);
            return Err(fail(format!("preparing mount point: {}", e)));
        }

        let attempts = self.config.mount_attempts.max(1);
        let mut last_error = String::new();
        let mut mounted = false;
        for attempt in 1..=attempts {
            match self
                .ops
                .mount(&device.path, &mount_point, device.fs_type, &opts.options)
                .await
            {
                Ok(()) => {
                    mounted = true;
                    break;
                }
                Err(e) => {
                    warn!(
                        "Mount of {:?} failed (attempt {}/{}): {}",
                        device.path, attempt, attempts, e
                    );
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.config.mount_retry_delay()).await;
                    }
                }
            }
        }

        if !mounted {
            self.abandon(&device.path, &mount_point);
            return Err(fail(last_error));
        }
        if !self.ops.is_mount_point(&mount_point) {
            self.abandon(&device.path, &mount_point);
            return Err(fail("mount reported success but nothing is mounted".to_string()));
        }

        if opts.chown_tree {
            let (path, uid, gid) = (mount_point.clone(), self.owner.uid, self.owner.gid);
            match tokio::task::spawn_blocking(move || normalize_tree(&path, uid, gid)).await {
                Ok(0) => {}
                Ok(failures) => warn!(
                    "{} entries under {:?} could not be normalised",
                    failures, mount_point
                ),
                Err(e) => warn!("Permission pass on {:?} aborted: {}", mount_point, e),
            }
        }

        binding.state = MountState::Mounted;
        self.table.insert(binding.clone());
        info!(
            "Mounted {:?} ({}) at {:?}",
            device.path, device.fs_type, mount_point
        );
        self.sync();
        Ok(binding)
    }

    /// Unmount a device and remove its mount point if empty.
    ///
    /// Unmounting a device that is not mounted is a no-op. If every
    /// escalation step fails the binding is marked STALE and the
    /// directory is kept.
    pub async fn unmount(&self, device: &Path) -> Result<(), DeviceError> {
        let mount_point = match self.table.get(device) {
            Some(binding) => binding.mount_point,
            None => match self.live_mount_point(device) {
                Some(mp) => mp,
                None => {
                    debug!("{:?} is not mounted, nothing to do", device);
                    return Ok(());
                }
            },
        };

        if !self.table.set_state(device, MountState::Unmounting) {
            self.table.insert(MountBinding {
                device: device.to_path_buf(),
                mount_point: mount_point.clone(),
                uid: self.owner.uid,
                gid: self.owner.gid,
                options: Vec::new(),
                state: MountState::Unmounting,
            });
        }

        if self.is_live(&mount_point) {
            if let Err(reason) = self.release(&mount_point).await {
                self.table.set_state(device, MountState::Stale);
                self.publish();
                return Err(DeviceError::UnmountFailed {
                    mount_point,
                    reason,
                });
            }
        }

        self.table.remove(device);
        remove_dir_if_empty(&mount_point);
        info!("Unmounted {:?} from {:?}", device, mount_point);
        self.sync();
        Ok(())
    }

    /// Busy check, then lazy unmount or graceful with forced fallback.
    async fn release(&self, mount_point: &Path) -> Result<UnmountMode, String> {
        if self.ops.is_busy(mount_point) {
            info!("{:?} is in use, detaching lazily", mount_point);
            return self
                .ops
                .unmount(mount_point, UnmountMode::Lazy)
                .await
                .map(|_| UnmountMode::Lazy)
                .map_err(|e| format!("lazy unmount: {}", e));
        }

        match self.ops.unmount(mount_point, UnmountMode::Normal).await {
            Ok(()) => Ok(UnmountMode::Normal),
            Err(e) => {
                warn!("Unmount of {:?} failed ({}), forcing", mount_point, e);
                self.ops
                    .unmount(mount_point, UnmountMode::Force)
                    .await
                    .map(|_| UnmountMode::Force)
                    .map_err(|e| format!("forced unmount: {}", e))
            }
        }
    }

    /// Whether the kernel still lists a mount at `mount_point`.
    ///
    /// A FUSE mount whose daemon died fails every stat, so the live mount
    /// list decides. The stat test is only a fallback.
    fn is_live(&self, mount_point: &Path) -> bool {
        match self.ops.live_mounts() {
            Ok(live) => live.iter().any(|m| m.mount_point == mount_point),
            Err(e) => {
                warn!("Cannot read live mounts: {}", e);
                self.ops.is_mount_point(mount_point)
            }
        }
    }

    fn live_mount_point(&self, device: &Path) -> Option<PathBuf> {
        let live = self.ops.live_mounts().ok()?;
        live.into_iter()
            .find(|m| m.source == device && m.is_under(&self.root))
            .map(|m| m.mount_point)
    }

    /// Drop a half-made binding and its directory
    fn abandon(&self, device: &Path, mount_point: &Path) {
        self.table.remove(device);
        remove_dir_if_empty(mount_point);
        self.publish();
    }

    /// Re-sync the table with the kernel and publish it
    fn sync(&self) {
        match self.ops.live_mounts() {
            Ok(live) => {
                let ops = &self.ops;
                let dropped =
                    self.table
                        .sync_with(&live, &self.root, |d| ops.device_exists(d), &self.owner);
                for binding in dropped {
                    remove_dir_if_empty(&binding.mount_point);
                }
            }
            Err(e) => warn!("Cannot read live mounts: {}", e),
        }
        self.publish();
    }

    fn publish(&self) {
        if let Some(inventory) = &self.inventory {
            let _guard = self.publish_lock.lock();
            inventory.publish(&self.table.snapshot());
        }
    }

    fn set_owner(&self, path: &Path) -> io::Result<()> {
        chown(
            path,
            Some(Uid::from_raw(self.owner.uid)),
            Some(Gid::from_raw(self.owner.gid)),
        )
        .map_err(io::Error::from)
    }

    /// Consume hotplug events until the source ends or `cancel` fires.
    pub async fn run(self: Arc<Self>, mut source: impl HotplugSource, cancel: CancellationToken) {
        let mut workers = DeviceWorkers::new(self.clone(), cancel.clone());

        info!("Device monitor watching for hotplug events");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = source.next_event() => match event {
                    Some(event) => event,
                    None => {
                        warn!("Hotplug source closed");
                        break;
                    }
                },
            };
            debug!("Hotplug {:?} {:?} (usb={})", event.action, event.device, event.usb);
            workers.dispatch(event);
        }

        workers.shutdown().await;
        info!("Device monitor stopped");
    }
}

/// One worker task per device path.
///
/// A worker retires once its device's remove event has been queued. A
/// later event for the same path starts a fresh worker that first waits
/// for the retiring one, so per-device order holds across the handover.
struct DeviceWorkers {
    monitor: Arc<DeviceMonitor>,
    cancel: CancellationToken,
    senders: HashMap<PathBuf, mpsc::UnboundedSender<HotplugEvent>>,
    handles: HashMap<PathBuf, JoinHandle<()>>,
}

impl DeviceWorkers {
    fn new(monitor: Arc<DeviceMonitor>, cancel: CancellationToken) -> Self {
        Self {
            monitor,
            cancel,
            senders: HashMap::new(),
            handles: HashMap::new(),
        }
    }

    fn dispatch(&mut self, event: HotplugEvent) {
        self.handles.retain(|_, handle| !handle.is_finished());

        let device = event.device.clone();
        let retire = event.action == HotplugAction::Remove;

        if !self.senders.contains_key(&device) {
            let (tx, rx) = mpsc::unbounded_channel();
            let previous = self.handles.remove(&device);
            let handle = tokio::spawn(device_worker(
                self.monitor.clone(),
                rx,
                self.cancel.clone(),
                previous,
            ));
            self.handles.insert(device.clone(), handle);
            self.senders.insert(device.clone(), tx);
        }

        if let Some(tx) = self.senders.get(&device) {
            if tx.send(event).is_err() {
                warn!("Device worker for {:?} exited unexpectedly", device);
            }
        }
        if retire {
            self.senders.remove(&device);
        }
    }

    /// Workers still running
    fn active(&mut self) -> usize {
        self.handles.retain(|_, handle| !handle.is_finished());
        self.handles.len()
    }

    async fn shutdown(mut self) {
        self.senders.clear();
        futures::future::join_all(self.handles.into_values()).await;
    }
}

/// Serialises the events of one device
async fn device_worker(
    monitor: Arc<DeviceMonitor>,
    mut rx: mpsc::UnboundedReceiver<HotplugEvent>,
    cancel: CancellationToken,
    previous: Option<JoinHandle<()>>,
) {
    if let Some(previous) = previous {
        let _ = previous.await;
    }
    while let Some(event) = rx.recv().await {
        if cancel.is_cancelled() {
            break;
        }
        monitor.handle_event(&event).await;
    }
}

/// Delete a mount-point directory only if it is empty
fn remove_dir_if_empty(path: &Path) {
    let mut entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!("Cannot inspect {:?}: {}", path, e);
            return;
        }
    };
    if entries.next().is_some() {
        info!("Keeping {:?}: directory is not empty", path);
        return;
    }
    match fs::remove_dir(path) {
        Ok(()) => debug!("Removed mount point {:?}", path),
        Err(e) => warn!("Failed to remove {:?}: {}", path, e),
    }
}

/// Recursively chown to uid:gid and chmod dirs 0755 / files 0644.
///
/// Symlinks are left alone and the walk stays on the mounted filesystem.
/// Returns the number of entries that failed.
fn normalize_tree(root: &Path, uid: u32, gid: u32) -> usize {
    let mut failures = 0;

    for entry in WalkDir::new(root).follow_links(false).same_file_system(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Skipping unreadable entry: {}", e);
                failures += 1;
                continue;
            }
        };
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            continue;
        }

        let mode = if file_type.is_dir() { DIR_MODE } else { FILE_MODE };
        let path = entry.path();
        let owned = chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)));
        let moded = fs::set_permissions(path, fs::Permissions::from_mode(mode));
        if owned.is_err() || moded.is_err() {
            failures += 1;
        }
    }

    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount_ops::fake::FakeMounts;
    use crate::probe::FsTypeQuery;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Reports a fixed type per device
    struct FixedQuery(HashMap<PathBuf, &'static str>);

    #[async_trait]
    impl FsTypeQuery for FixedQuery {
        async fn query(&self, device: &Path) -> Option<String> {
            self.0.get(device).map(|s| s.to_string())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        root: PathBuf,
        ops: Arc<FakeMounts>,
        monitor: Arc<DeviceMonitor>,
    }

    fn current_owner() -> OwnerIdentity {
        OwnerIdentity {
            user: "owner".to_string(),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }

    fn harness(types: &[(&str, &'static str)]) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("media/owner");
        let ops = Arc::new(FakeMounts::new());
        for (device, _) in types {
            ops.add_device(device);
        }

        let query = FixedQuery(
            types
                .iter()
                .map(|(d, t)| (PathBuf::from(d), *t))
                .collect(),
        );
        let config = MountConfig {
            probe_delay_ms: 0,
            mount_retry_delay_ms: 0,
            add_settle_ms: 0,
            ..MountConfig::default()
        };
        let probe = FilesystemProbe::new(Arc::new(query), 3, Duration::ZERO);
        let monitor = DeviceMonitor::new(current_owner(), root.clone(), config, probe, ops.clone())
            .with_inventory(Inventory::new(&dir.path().join("run"), "mounts.json"));
        monitor.prepare_root().unwrap();

        Harness {
            _dir: dir,
            root,
            ops,
            monitor: Arc::new(monitor),
        }
    }

    fn add(device: &str) -> HotplugEvent {
        HotplugEvent {
            action: HotplugAction::Add,
            device: PathBuf::from(device),
            usb: true,
        }
    }

    fn remove(device: &str) -> HotplugEvent {
        HotplugEvent {
            action: HotplugAction::Remove,
            device: PathBuf::from(device),
            usb: true,
        }
    }

    #[tokio::test]
    async fn test_fat32_add_mounts_with_policy_options() {
        let h = harness(&[("/dev/sda1", "vfat")]);
        let owner = current_owner();

        let binding = h.monitor.add_device(&add("/dev/sda1")).await.unwrap().unwrap();

        let mp = h.root.join("sda1");
        assert_eq!(binding.mount_point, mp);
        assert_eq!(binding.state, MountState::Mounted);
        assert!(mp.is_dir());
        assert_eq!(
            h.ops.options_at(&mp).unwrap(),
            vec![
                format!("uid={}", owner.uid),
                format!("gid={}", owner.gid),
                "rw".to_string(),
                "dmask=022".to_string(),
                "fmask=133".to_string(),
                "utf8".to_string(),
                "flush".to_string(),
            ]
        );
        assert_eq!(
            h.monitor.table().get(Path::new("/dev/sda1")).unwrap().state,
            MountState::Mounted
        );
    }

    #[tokio::test]
    async fn test_mount_is_idempotent() {
        let h = harness(&[("/dev/sda1", "vfat")]);

        h.monitor.add_device(&add("/dev/sda1")).await.unwrap();
        h.monitor.add_device(&add("/dev/sda1")).await.unwrap();

        assert_eq!(h.ops.mount_calls(), 1);
        assert_eq!(h.monitor.table().len(), 1);
    }

    #[tokio::test]
    async fn test_mount_retries_then_succeeds() {
        let h = harness(&[("/dev/sda1", "exfat")]);
        h.ops.fail_mounts(2);

        let binding = h.monitor.add_device(&add("/dev/sda1")).await.unwrap();

        assert!(binding.is_some());
        assert_eq!(h.ops.mount_calls(), 3);
    }

    #[tokio::test]
    async fn test_mount_failure_cleans_up() {
        let h = harness(&[("/dev/sda1", "ntfs")]);
        h.ops.fail_mounts(3);

        let err = h.monitor.add_device(&add("/dev/sda1")).await.unwrap_err();

        assert!(matches!(err, DeviceError::MountFailed { .. }));
        assert_eq!(h.ops.mount_calls(), 3);
        assert!(!h.root.join("sda1").exists());
        assert!(h.monitor.table().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_filesystem_not_mounted() {
        let h = harness(&[("/dev/sda1", "btrfs")]);

        let err = h.monitor.add_device(&add("/dev/sda1")).await.unwrap_err();

        assert!(matches!(err, DeviceError::ProbeInconclusive { .. }));
        assert_eq!(h.ops.mount_calls(), 0);
        assert!(!h.root.join("sda1").exists());
    }

    #[tokio::test]
    async fn test_non_usb_device_ignored() {
        let h = harness(&[("/dev/sdb1", "vfat")]);
        let mut event = add("/dev/sdb1");
        event.usb = false;

        let result = h.monitor.add_device(&event).await.unwrap();

        assert!(result.is_none());
        assert_eq!(h.ops.mount_calls(), 0);
    }

    #[tokio::test]
    async fn test_busy_unmount_goes_lazy_and_removes_dir() {
        let h = harness(&[("/dev/sda1", "vfat")]);
        h.monitor.add_device(&add("/dev/sda1")).await.unwrap();
        let mp = h.root.join("sda1");
        h.ops.set_busy(&mp, true);

        h.monitor.unmount(Path::new("/dev/sda1")).await.unwrap();

        assert_eq!(h.ops.unmount_calls(), vec![(mp.clone(), UnmountMode::Lazy)]);
        assert!(!mp.exists());
        assert!(h.monitor.table().is_empty());
    }

    #[tokio::test]
    async fn test_unmount_escalates_to_force() {
        let h = harness(&[("/dev/sda1", "vfat")]);
        h.monitor.add_device(&add("/dev/sda1")).await.unwrap();
        let mp = h.root.join("sda1");
        h.ops.fail_unmount_mode(UnmountMode::Normal);

        h.monitor.unmount(Path::new("/dev/sda1")).await.unwrap();

        assert_eq!(
            h.ops.unmount_calls(),
            vec![(mp.clone(), UnmountMode::Normal), (mp.clone(), UnmountMode::Force)]
        );
        assert!(!mp.exists());
    }

    #[tokio::test]
    async fn test_unmount_failure_marks_stale() {
        let h = harness(&[("/dev/sda1", "vfat")]);
        h.monitor.add_device(&add("/dev/sda1")).await.unwrap();
        h.ops.fail_unmount_mode(UnmountMode::Normal);
        h.ops.fail_unmount_mode(UnmountMode::Force);

        let err = h.monitor.unmount(Path::new("/dev/sda1")).await.unwrap_err();

        assert!(matches!(err, DeviceError::UnmountFailed { .. }));
        assert!(h.root.join("sda1").is_dir());
        assert_eq!(
            h.monitor.table().get(Path::new("/dev/sda1")).unwrap().state,
            MountState::Stale
        );
    }

    #[tokio::test]
    async fn test_unmount_keeps_non_empty_dir() {
        let h = harness(&[("/dev/sda1", "vfat")]);
        h.monitor.add_device(&add("/dev/sda1")).await.unwrap();
        let mp = h.root.join("sda1");
        fs::write(mp.join("notes.txt"), "keep me").unwrap();

        h.monitor.unmount(Path::new("/dev/sda1")).await.unwrap();

        assert!(mp.join("notes.txt").exists());
        assert!(h.monitor.table().is_empty());
    }

    #[tokio::test]
    async fn test_unmount_of_unmounted_device_is_noop() {
        let h = harness(&[]);

        h.monitor.unmount(Path::new("/dev/sdz1")).await.unwrap();

        assert!(h.ops.unmount_calls().is_empty());
    }

    #[tokio::test]
    async fn test_ext_tree_is_normalised() {
        let h = harness(&[("/dev/sdd1", "ext4")]);
        let mp = h.root.join("sdd1");
        fs::create_dir_all(mp.join("photos")).unwrap();
        fs::write(mp.join("photos/a.jpg"), b"jpg").unwrap();
        fs::set_permissions(mp.join("photos/a.jpg"), fs::Permissions::from_mode(0o600)).unwrap();
        fs::set_permissions(mp.join("photos"), fs::Permissions::from_mode(0o700)).unwrap();

        let binding = h.monitor.add_device(&add("/dev/sdd1")).await.unwrap().unwrap();

        assert_eq!(binding.options, vec!["rw", "defaults", "user_xattr"]);
        let file_mode = fs::metadata(mp.join("photos/a.jpg")).unwrap().permissions().mode();
        let dir_mode = fs::metadata(mp.join("photos")).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, FILE_MODE);
        assert_eq!(dir_mode & 0o777, DIR_MODE);
    }

    #[tokio::test]
    async fn test_startup_reclaims_stale_and_adopts_live() {
        let h = harness(&[("/dev/sdc1", "vfat")]);
        let stale = h.root.join("sdb1");
        let live = h.root.join("sdc1");
        fs::create_dir_all(&stale).unwrap();
        fs::create_dir_all(&live).unwrap();
        fs::create_dir_all(h.root.join("leftover")).unwrap();
        h.ops.preload("/dev/sdb1", &stale);
        h.ops.preload("/dev/sdc1", &live);

        h.monitor.reconcile_startup().await;

        assert_eq!(h.ops.unmount_calls(), vec![(stale.clone(), UnmountMode::Normal)]);
        assert!(!stale.exists());
        assert!(!h.root.join("leftover").exists());
        assert!(live.is_dir());
        assert!(h.monitor.table().get(Path::new("/dev/sdb1")).is_none());
        assert_eq!(
            h.monitor.table().get(Path::new("/dev/sdc1")).unwrap().state,
            MountState::Mounted
        );
    }

    #[tokio::test]
    async fn test_scan_existing_skips_adopted() {
        let h = harness(&[("/dev/sdc1", "vfat"), ("/dev/sde1", "vfat")]);
        let live = h.root.join("sdc1");
        fs::create_dir_all(&live).unwrap();
        h.ops.preload("/dev/sdc1", &live);
        h.monitor.reconcile_startup().await;

        h.monitor
            .scan_existing(vec![add("/dev/sdc1"), add("/dev/sde1")])
            .await;

        assert_eq!(h.ops.mount_calls(), 1);
        assert!(h.root.join("sde1").is_dir());
    }

    #[tokio::test]
    async fn test_run_processes_device_events_in_order() {
        let h = harness(&[("/dev/sda1", "vfat"), ("/dev/sdb1", "exfat")]);
        let (tx, rx) = mpsc::channel(16);
        tx.send(add("/dev/sda1")).await.unwrap();
        tx.send(add("/dev/sdb1")).await.unwrap();
        tx.send(remove("/dev/sda1")).await.unwrap();
        drop(tx);

        h.monitor.clone().run(rx, CancellationToken::new()).await;

        assert!(h.monitor.table().get(Path::new("/dev/sda1")).is_none());
        assert!(!h.root.join("sda1").exists());
        assert_eq!(
            h.monitor.table().get(Path::new("/dev/sdb1")).unwrap().state,
            MountState::Mounted
        );

        let inventory = fs::read_to_string(h._dir.path().join("run/mounts.json")).unwrap();
        assert!(inventory.contains("/dev/sdb1"));
        assert!(!inventory.contains("/dev/sda1"));
    }

    #[tokio::test]
    async fn test_unmount_reaches_dead_mount_still_listed() {
        let h = harness(&[("/dev/sda1", "ntfs")]);
        h.monitor.add_device(&add("/dev/sda1")).await.unwrap();
        let mp = h.root.join("sda1");
        h.ops.set_unreachable(&mp);

        h.monitor.unmount(Path::new("/dev/sda1")).await.unwrap();

        assert_eq!(h.ops.unmount_calls(), vec![(mp.clone(), UnmountMode::Normal)]);
        assert!(h.ops.live_mounts().unwrap().is_empty());
        assert!(h.monitor.table().is_empty());
    }

    #[tokio::test]
    async fn test_startup_busy_stale_mount_detaches_lazily() {
        let h = harness(&[]);
        let stale = h.root.join("sdb1");
        fs::create_dir_all(&stale).unwrap();
        h.ops.preload("/dev/sdb1", &stale);
        h.ops.set_busy(&stale, true);

        h.monitor.reconcile_startup().await;

        assert_eq!(h.ops.unmount_calls(), vec![(stale.clone(), UnmountMode::Lazy)]);
        assert!(!stale.exists());
        assert!(h.monitor.table().is_empty());
    }

    #[tokio::test]
    async fn test_startup_stale_mount_escalates_to_force() {
        let h = harness(&[]);
        let stale = h.root.join("sdb1");
        fs::create_dir_all(&stale).unwrap();
        h.ops.preload("/dev/sdb1", &stale);
        h.ops.fail_unmount_mode(UnmountMode::Normal);

        h.monitor.reconcile_startup().await;

        assert_eq!(
            h.ops.unmount_calls(),
            vec![(stale.clone(), UnmountMode::Normal), (stale.clone(), UnmountMode::Force)]
        );
        assert!(!stale.exists());
        assert!(h.monitor.table().is_empty());
    }

    #[tokio::test]
    async fn test_add_adopts_untracked_mount_at_own_mount_point() {
        let h = harness(&[("/dev/sda1", "vfat")]);
        let mp = h.root.join("sda1");
        fs::create_dir_all(&mp).unwrap();
        h.ops.preload("/dev/sda1", &mp);

        let binding = h.monitor.add_device(&add("/dev/sda1")).await.unwrap().unwrap();

        assert_eq!(binding.mount_point, mp);
        assert_eq!(binding.state, MountState::Mounted);
        assert_eq!(h.ops.mount_calls(), 0);
        assert_eq!(
            h.monitor.table().get(Path::new("/dev/sda1")).unwrap().state,
            MountState::Mounted
        );
    }

    #[tokio::test]
    async fn test_add_rejects_mount_point_held_by_other_device() {
        let h = harness(&[("/dev/sda1", "vfat")]);
        let mp = h.root.join("sda1");
        fs::create_dir_all(&mp).unwrap();
        h.ops.preload("/dev/sdx9", &mp);

        let err = h.monitor.add_device(&add("/dev/sda1")).await.unwrap_err();

        assert!(matches!(err, DeviceError::MountFailed { .. }));
        assert_eq!(h.ops.mount_calls(), 0);
    }

    #[tokio::test]
    async fn test_worker_retires_after_remove() {
        let h = harness(&[("/dev/sda1", "vfat")]);
        let mut workers = DeviceWorkers::new(h.monitor.clone(), CancellationToken::new());

        workers.dispatch(add("/dev/sda1"));
        workers.dispatch(remove("/dev/sda1"));
        for _ in 0..50 {
            if workers.active() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(workers.active(), 0);
        assert!(h.monitor.table().is_empty());

        workers.dispatch(add("/dev/sda1"));
        workers.shutdown().await;

        assert_eq!(h.ops.mount_calls(), 2);
        assert_eq!(
            h.monitor.table().get(Path::new("/dev/sda1")).unwrap().state,
            MountState::Mounted
        );
    }

    #[tokio::test]
    async fn test_run_keeps_order_when_device_returns() {
        let h = harness(&[("/dev/sda1", "vfat")]);
        let (tx, rx) = mpsc::channel(16);
        tx.send(add("/dev/sda1")).await.unwrap();
        tx.send(remove("/dev/sda1")).await.unwrap();
        tx.send(add("/dev/sda1")).await.unwrap();
        tx.send(remove("/dev/sda1")).await.unwrap();
        drop(tx);

        h.monitor.clone().run(rx, CancellationToken::new()).await;

        assert_eq!(h.ops.mount_calls(), 2);
        assert!(h.monitor.table().is_empty());
        assert!(!h.root.join("sda1").exists());
    }
}
