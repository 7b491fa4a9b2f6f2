//! File-sharing daemon control through the service manager

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use plugshare_core::ShareError;

/// Reload/restart of the file-sharing daemon
#[async_trait]
pub trait DaemonControl: Send + Sync {
    /// Ask the daemon to re-read its share configuration
    async fn reload(&self) -> Result<(), ShareError>;

    /// Full restart (needed after global configuration changes)
    async fn restart(&self) -> Result<(), ShareError>;
}

/// `systemctl reload|restart <unit>`
pub struct Systemctl {
    unit: String,
}

impl Systemctl {
    pub fn new(unit: impl Into<String>) -> Self {
        Self { unit: unit.into() }
    }

    async fn run(&self, verb: &str) -> Result<(), ShareError> {
        debug!("systemctl {} {}", verb, self.unit);
        let output = Command::new("systemctl")
            .arg(verb)
            .arg(&self.unit)
            .output()
            .await
            .map_err(|e| ShareError::DaemonReloadFailed {
                unit: self.unit.clone(),
                reason: e.to_string(),
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ShareError::DaemonReloadFailed {
                unit: self.unit.clone(),
                reason: format!(
                    "systemctl {} exited with {}: {}",
                    verb,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            })
        }
    }
}

#[async_trait]
impl DaemonControl for Systemctl {
    async fn reload(&self) -> Result<(), ShareError> {
        self.run("reload").await
    }

    async fn restart(&self) -> Result<(), ShareError> {
        self.run("restart").await
    }
}
