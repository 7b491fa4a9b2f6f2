//! Filesystem Probe - bounded-retry filesystem type detection
//!
//! Right after a hotplug add event the device node or its superblock may
//! not be readable yet, so the probe asks a few times with a fixed pause
//! before giving up. Giving up is not an error: the result is `Unknown`
//! and the caller waits for the next event.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use plugshare_core::FilesystemType;

/// Default number of probe attempts
pub const DEFAULT_PROBE_ATTEMPTS: u32 = 3;

/// Source of raw filesystem type strings
#[async_trait]
pub trait FsTypeQuery: Send + Sync {
    /// Return the reported type, or None if the device reports nothing (yet).
    async fn query(&self, device: &Path) -> Option<String>;
}

/// Queries `blkid -o value -s TYPE <device>`
pub struct Blkid;

#[async_trait]
impl FsTypeQuery for Blkid {
    async fn query(&self, device: &Path) -> Option<String> {
        let output = match Command::new("blkid")
            .args(["-o", "value", "-s", "TYPE"])
            .arg(device)
            .output()
            .await
        {
            Ok(o) => o,
            Err(e) => {
                warn!("Failed to run blkid for {:?}: {}", device, e);
                return None;
            }
        };

        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }
}

/// Resolves a device's filesystem type with bounded retries
pub struct FilesystemProbe {
    query: Arc<dyn FsTypeQuery>,
    attempts: u32,
    delay: Duration,
}

impl FilesystemProbe {
    pub fn new(query: Arc<dyn FsTypeQuery>, attempts: u32, delay: Duration) -> Self {
        Self {
            query,
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Probe backed by blkid
    pub fn blkid(attempts: u32, delay: Duration) -> Self {
        Self::new(Arc::new(Blkid), attempts, delay)
    }

    /// Resolve the filesystem type, returning `Unknown` if nothing is reported.
    pub async fn resolve(&self, device: &Path) -> FilesystemType {
        for attempt in 1..=self.attempts {
            if let Some(raw) = self.query.query(device).await {
                let fs_type = FilesystemType::from_probe(&raw);
                if fs_type == FilesystemType::Unknown {
                    warn!("{:?} reports unsupported filesystem {:?}", device, raw);
                } else {
                    debug!("{:?} resolved to {} on attempt {}", device, fs_type, attempt);
                }
                return fs_type;
            }

            debug!(
                "No filesystem type for {:?} (attempt {}/{})",
                device, attempt, self.attempts
            );
            if attempt < self.attempts {
                tokio::time::sleep(self.delay).await;
            }
        }

        FilesystemType::Unknown
    }
}
