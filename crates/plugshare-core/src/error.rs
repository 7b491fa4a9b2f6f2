//! Error types for plugshare
//!
//! Each component reports failures through one of the enums below. Errors
//! raised while handling a single device, share, or service are logged and
//! contained by the owning loop; only identity resolution and roster
//! construction failures are allowed to stop a process.

use std::path::PathBuf;

use thiserror::Error;

/// Device Monitor errors
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("filesystem type of {device:?} undetermined after {attempts} attempts")]
    ProbeInconclusive { device: PathBuf, attempts: u32 },

    #[error("mounting {device:?} at {mount_point:?} failed: {reason}")]
    MountFailed {
        device: PathBuf,
        mount_point: PathBuf,
        reason: String,
    },

    #[error("unmounting {mount_point:?} failed after all escalation steps: {reason}")]
    UnmountFailed { mount_point: PathBuf, reason: String },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Share Registry errors
#[derive(Error, Debug)]
pub enum ShareError {
    #[error("writing share store {path:?} failed: {reason}")]
    ShareWriteFailed { path: PathBuf, reason: String },

    #[error("reloading sharing daemon {unit} failed: {reason}")]
    DaemonReloadFailed { unit: String, reason: String },

    #[error("mount point {0:?} has no final path segment")]
    InvalidMountPoint(PathBuf),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Process Supervisor errors
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("failed to start service {name}: {reason}")]
    ProcessStartFailed { name: String, reason: String },

    #[error("service {name} (pid {pid}) did not exit within {timeout_secs}s")]
    ProcessTerminateTimeout {
        name: String,
        pid: u32,
        timeout_secs: u64,
    },

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("invalid roster: {0}")]
    InvalidRoster(String),
}

/// Owner identity resolution errors (fatal at startup)
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("user {0} not found in system")]
    UserNotFound(String),

    #[error("looking up user {user} failed: {reason}")]
    Lookup { user: String, reason: String },
}
