//! Plugshare Daemon - removable volume mounting and share management
//!
//! This crate provides:
//! - The Device Monitor: hotplug events in, mounted volumes out
//! - The Share Registry and Share Controller: mounted volumes in, network
//!   shares out
//!
//! # Architecture
//!
//! ```text
//! kernel uevent ──► DeviceMonitor ──► mount(8) / umount2(2)
//!                        │
//!                        ▼ mount-point directory appears / disappears
//!                  ShareController (notify watch on the mount root)
//!                        │
//!                        ▼
//!                  ShareRegistry ──► share store rewrite ──► daemon reload
//! ```
//!
//! The two halves never call each other. The mount root on disk is the
//! only thing they share: the Device Monitor is its sole writer and the
//! Share Controller only observes it.

pub mod daemon_control;
pub mod device_monitor;
pub mod hotplug;
pub mod inventory;
pub mod mount_ops;
pub mod mount_table;
pub mod mountinfo;
pub mod policy;
pub mod probe;
pub mod share_controller;
pub mod share_registry;
pub mod share_store;

pub use daemon_control::{DaemonControl, Systemctl};
pub use device_monitor::DeviceMonitor;
pub use hotplug::{HotplugAction, HotplugEvent, HotplugSource, UeventSocket};
pub use inventory::Inventory;
pub use mount_ops::{MountOps, SystemMounts, UnmountMode};
pub use mount_table::MountTable;
pub use mountinfo::LiveMount;
pub use policy::{options_for, MountOptions};
pub use probe::{Blkid, FilesystemProbe, FsTypeQuery};
pub use share_controller::{MountPointHandler, RootWatch, ShareController};
pub use share_registry::{ReconcileReport, ShareRegistry};
pub use share_store::ShareStore;
