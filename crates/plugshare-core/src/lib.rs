//! Plugshare Core - Shared types, configuration, and error taxonomy
//!
//! This crate contains the foundational types used by the device monitor,
//! the share controller, and the process supervisor. It has no dependencies
//! on mount, hotplug, or process-management code.

pub mod config;
pub mod error;
pub mod identity;
pub mod logging;
pub mod shutdown;
pub mod types;

pub use config::{
    Config, ConfigError, IdentityConfig, LoggingConfig, MountConfig, ServiceCommand, ShareConfig,
    SupervisorConfig,
};
pub use error::*;
pub use identity::OwnerIdentity;
pub use shutdown::shutdown_signal;
pub use types::*;

/// Mode applied to the mount root and to directories on ext volumes
pub const DIR_MODE: u32 = 0o755;

/// Mode applied to files on ext volumes
pub const FILE_MODE: u32 = 0o644;

/// Inventory file written by the device monitor
pub const MOUNTS_INVENTORY: &str = "mounts.json";

/// Inventory file written by the share registry
pub const SHARES_INVENTORY: &str = "shares.json";
