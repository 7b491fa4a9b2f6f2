//! Configuration system for plugshare
//!
//! Supports a TOML configuration file with sensible defaults. Every section
//! is optional; missing keys fall back to the values below. The file is read
//! from `/etc/plugshare/config.toml` unless a path is given explicitly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::ShareAccess;

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "/etc/plugshare/config.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory for the live mount/share inventory files
    pub inventory_dir: InventoryDir,
    /// Owner identity settings
    pub identity: IdentityConfig,
    /// Device Monitor settings
    pub mounts: MountConfig,
    /// Share Registry / Share Controller settings
    pub shares: ShareConfig,
    /// Process Supervisor settings
    pub supervisor: SupervisorConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

/// Owner identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// System user that owns mounts and shared files
    pub user: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            user: "plugshare".to_string(),
        }
    }
}

/// Device Monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Managed mount-point root (defaults to /media/<user>)
    pub root: Option<PathBuf>,
    /// Filesystem probe attempts
    pub probe_attempts: u32,
    /// Delay between probe attempts in milliseconds
    pub probe_delay_ms: u64,
    /// Mount attempts
    pub mount_attempts: u32,
    /// Delay between mount attempts in milliseconds
    pub mount_retry_delay_ms: u64,
    /// Delay after an add event before probing, in milliseconds
    pub add_settle_ms: u64,
    /// Only manage partitions on USB-attached devices
    pub usb_only: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            root: None,
            probe_attempts: 3,
            probe_delay_ms: 1000,
            mount_attempts: 3,
            mount_retry_delay_ms: 1000,
            add_settle_ms: 1000,
            usb_only: true,
        }
    }
}

impl MountConfig {
    pub fn probe_delay(&self) -> Duration {
        Duration::from_millis(self.probe_delay_ms)
    }

    pub fn mount_retry_delay(&self) -> Duration {
        Duration::from_millis(self.mount_retry_delay_ms)
    }

    pub fn add_settle(&self) -> Duration {
        Duration::from_millis(self.add_settle_ms)
    }

    /// How long a mount-point directory may exist before its mount lands:
    /// every attempt, each followed by the retry delay.
    pub fn mount_window(&self) -> Duration {
        self.mount_retry_delay() * self.mount_attempts.max(1)
    }
}

/// Share configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareConfig {
    /// Share store rewritten on every mutation
    pub conf_path: PathBuf,
    /// Main daemon configuration that includes the share store
    pub main_conf_path: PathBuf,
    /// Write the main daemon configuration at startup
    pub manage_main_config: bool,
    /// Prefix of every managed share name
    pub prefix: String,
    /// Service-manager unit of the file-sharing daemon
    pub daemon_unit: String,
    /// Delay between a directory appearing and the mount-point check, in milliseconds
    pub settle_ms: u64,
    /// Access-control parameters for managed shares
    pub access: ShareAccess,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            conf_path: PathBuf::from("/etc/samba/shares.conf"),
            main_conf_path: PathBuf::from("/etc/samba/smb.conf"),
            manage_main_config: false,
            prefix: "USB_".to_string(),
            daemon_unit: "smbd".to_string(),
            settle_ms: 1000,
            access: ShareAccess::default(),
        }
    }
}

impl ShareConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Launch command for a roster service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ServiceCommand {
    pub fn new(program: impl Into<PathBuf>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Process Supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Liveness poll interval in seconds
    pub liveness_interval_secs: u64,
    /// Preventive Device Monitor restart interval in seconds
    pub preventive_restart_secs: u64,
    /// Refresh trigger poll interval in seconds
    pub refresh_poll_secs: u64,
    /// Refresh trigger file
    pub refresh_file: PathBuf,
    /// Grace period before a forced kill, in seconds
    pub stop_timeout_secs: u64,
    /// Pause between stop and start of a targeted restart, in seconds
    pub restart_settle_secs: u64,
    pub device_monitor: ServiceCommand,
    pub share_controller: ServiceCommand,
    pub file_server: ServiceCommand,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            liveness_interval_secs: 5,
            preventive_restart_secs: 4 * 60 * 60,
            refresh_poll_secs: 5,
            refresh_file: PathBuf::from("/run/plugshare/refresh"),
            stop_timeout_secs: 5,
            restart_settle_secs: 2,
            device_monitor: ServiceCommand::new("/usr/bin/plugshare", &["devices"]),
            share_controller: ServiceCommand::new("/usr/bin/plugshare", &["shares"]),
            file_server: ServiceCommand::new("/usr/bin/plugshare-fileserver", &[]),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level filter (RUST_LOG takes precedence)
    pub level: String,
    /// Optional log file; stderr is used when unset
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Inventory directory (newtype so the TOML key stays a plain path)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InventoryDir(pub PathBuf);

impl Default for InventoryDir {
    fn default() -> Self {
        Self(PathBuf::from("/run/plugshare"))
    }
}

impl Config {
    /// Load configuration from an explicit path or the default location.
    ///
    /// A missing file yields defaults; a malformed file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        Self::load_from(path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Effective mount-point root for an owner
    pub fn mount_root(&self, user: &str) -> PathBuf {
        self.mounts
            .root
            .clone()
            .unwrap_or_else(|| PathBuf::from("/media").join(user))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.mounts.probe_attempts, 3);
        assert_eq!(config.shares.prefix, "USB_");
        assert_eq!(config.supervisor.preventive_restart_secs, 14400);
        assert_eq!(config.mount_root("owner"), PathBuf::from("/media/owner"));
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
            [mounts]
            root = "/srv/usb"
            usb_only = false

            [shares.access]
            guest_ok = true
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.mount_root("owner"), PathBuf::from("/srv/usb"));
        assert!(!config.mounts.usb_only);
        assert!(config.shares.access.guest_ok);
        // Other values should be defaults
        assert_eq!(config.mounts.mount_attempts, 3);
        assert_eq!(config.shares.access.create_mask, "0666");
        assert_eq!(config.inventory_dir.0, PathBuf::from("/run/plugshare"));
    }

    #[test]
    fn test_mount_window() {
        let mounts = MountConfig::default();
        assert_eq!(mounts.mount_window(), Duration::from_secs(3));

        let single = MountConfig {
            mount_attempts: 0,
            mount_retry_delay_ms: 500,
            ..MountConfig::default()
        };
        assert_eq!(single.mount_window(), Duration::from_millis(500));
    }

    #[test]
    fn test_service_command_args_optional() {
        let toml_str = r#"
            [supervisor.file_server]
            program = "/opt/fs/server"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.supervisor.file_server.program, PathBuf::from("/opt/fs/server"));
        assert!(config.supervisor.file_server.args.is_empty());
    }

    #[test]
    fn test_sample_config_roundtrips() {
        let sample = Config::sample();
        assert!(sample.contains("[mounts]"));
        assert!(sample.contains("[supervisor]"));
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.shares.daemon_unit, "smbd");
    }

    #[test]
    fn test_config_load_missing() {
        let config = Config::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.mounts.probe_attempts, 3);
    }

    #[test]
    fn test_config_load_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[mounts\nroot = ").unwrap();
        assert!(matches!(Config::load_from(&path), Err(ConfigError::Parse(_))));
    }
}
