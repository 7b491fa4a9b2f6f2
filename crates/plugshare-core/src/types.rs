//! Data model shared by the device and share components

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Filesystem types the mount policy knows about
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemType {
    Fat32,
    Ntfs,
    Exfat,
    Ext2,
    Ext3,
    Ext4,
    Unknown,
}

impl FilesystemType {
    /// Map a probe result (as reported by blkid) to a filesystem type.
    ///
    /// Anything outside the policy table is `Unknown`.
    pub fn from_probe(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "vfat" | "fat32" | "msdos" => FilesystemType::Fat32,
            "ntfs" | "ntfs3" => FilesystemType::Ntfs,
            "exfat" => FilesystemType::Exfat,
            "ext2" => FilesystemType::Ext2,
            "ext3" => FilesystemType::Ext3,
            "ext4" => FilesystemType::Ext4,
            _ => FilesystemType::Unknown,
        }
    }

    /// Ext filesystems carry ownership on disk; it cannot be set at mount time.
    pub fn is_ext(self) -> bool {
        matches!(
            self,
            FilesystemType::Ext2 | FilesystemType::Ext3 | FilesystemType::Ext4
        )
    }

    /// Filesystem type name passed to mount(8)
    pub fn mount_type(self) -> Option<&'static str> {
        match self {
            FilesystemType::Fat32 => Some("vfat"),
            FilesystemType::Ntfs => Some("ntfs-3g"),
            FilesystemType::Exfat => Some("exfat"),
            FilesystemType::Ext2 => Some("ext2"),
            FilesystemType::Ext3 => Some("ext3"),
            FilesystemType::Ext4 => Some("ext4"),
            FilesystemType::Unknown => None,
        }
    }
}

impl fmt::Display for FilesystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilesystemType::Fat32 => "fat32",
            FilesystemType::Ntfs => "ntfs",
            FilesystemType::Exfat => "exfat",
            FilesystemType::Ext2 => "ext2",
            FilesystemType::Ext3 => "ext3",
            FilesystemType::Ext4 => "ext4",
            FilesystemType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A resolved block device. Re-derived on every add event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BlockDevice {
    /// Device node, e.g. /dev/sda1
    pub path: PathBuf,
    pub fs_type: FilesystemType,
    /// True if any sysfs ancestor belongs to the usb subsystem
    pub usb: bool,
}

/// Lifecycle state of a mount binding
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountState {
    Unmounted,
    Mounting,
    Mounted,
    Stale,
    Unmounting,
}

/// Device to mount-point binding
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MountBinding {
    pub device: PathBuf,
    pub mount_point: PathBuf,
    pub uid: u32,
    pub gid: u32,
    pub options: Vec<String>,
    pub state: MountState,
}

/// Access-control parameters applied to every managed share
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareAccess {
    pub browsable: bool,
    pub read_only: bool,
    pub guest_ok: bool,
    /// Users allowed to connect (None = any authenticated user)
    pub valid_users: Option<String>,
    pub create_mask: String,
    pub directory_mask: String,
    /// Force file ownership to the resolved owner identity
    pub force_owner: bool,
}

impl Default for ShareAccess {
    fn default() -> Self {
        Self {
            browsable: true,
            read_only: false,
            guest_ok: false,
            valid_users: Some("plugshare".to_string()),
            create_mask: "0666".to_string(),
            directory_mask: "0777".to_string(),
            force_owner: true,
        }
    }
}

/// A named network share bound to a mount point
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ShareEntry {
    pub name: String,
    pub path: PathBuf,
    pub comment: String,
    pub access: ShareAccess,
    /// Owner name written as `force user` / `force group`
    pub owner: Option<String>,
    pub active: bool,
}

/// Deterministic share name: prefix plus the mount point's final segment.
///
/// Returns None for paths without a final segment (e.g. `/`).
pub fn share_name(prefix: &str, mount_point: &Path) -> Option<String> {
    let base = mount_point.file_name()?.to_str()?;
    if base.is_empty() {
        return None;
    }
    Some(format!("{}{}", prefix, base))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_type_from_probe() {
        assert_eq!(FilesystemType::from_probe("vfat\n"), FilesystemType::Fat32);
        assert_eq!(FilesystemType::from_probe("NTFS"), FilesystemType::Ntfs);
        assert_eq!(FilesystemType::from_probe("exfat"), FilesystemType::Exfat);
        assert_eq!(FilesystemType::from_probe("ext4"), FilesystemType::Ext4);
        assert_eq!(FilesystemType::from_probe("btrfs"), FilesystemType::Unknown);
        assert_eq!(FilesystemType::from_probe(""), FilesystemType::Unknown);
    }

    #[test]
    fn test_ext_family() {
        assert!(FilesystemType::Ext2.is_ext());
        assert!(FilesystemType::Ext4.is_ext());
        assert!(!FilesystemType::Fat32.is_ext());
        assert_eq!(FilesystemType::Unknown.mount_type(), None);
    }

    #[test]
    fn test_share_name() {
        assert_eq!(
            share_name("USB_", Path::new("/media/owner/sda1")).as_deref(),
            Some("USB_sda1")
        );
        assert_eq!(
            share_name("USB_", Path::new("/media/owner/sdb1/")).as_deref(),
            Some("USB_sdb1")
        );
        assert_eq!(share_name("USB_", Path::new("/")), None);
    }
}
