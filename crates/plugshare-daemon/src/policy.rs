//! Mount policy table
//!
//! Maps each filesystem type to a pure function from the owner's (uid, gid)
//! to a mount option list. FAT-family and NTFS volumes take ownership from
//! mount options; ext volumes keep ownership on disk, so the tree has to be
//! chowned after mounting instead.

use plugshare_core::FilesystemType;

/// Mount options plus post-mount requirements
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountOptions {
    pub options: Vec<String>,
    /// Ownership must be applied recursively after mount
    pub chown_tree: bool,
}

type OptionFn = fn(u32, u32) -> Vec<String>;

struct PolicyEntry {
    fs_type: FilesystemType,
    options: OptionFn,
    chown_tree: bool,
}

const POLICY: &[PolicyEntry] = &[
    PolicyEntry {
        fs_type: FilesystemType::Fat32,
        options: fat_options,
        chown_tree: false,
    },
    PolicyEntry {
        fs_type: FilesystemType::Ntfs,
        options: ntfs_options,
        chown_tree: false,
    },
    PolicyEntry {
        fs_type: FilesystemType::Exfat,
        options: exfat_options,
        chown_tree: false,
    },
    PolicyEntry {
        fs_type: FilesystemType::Ext2,
        options: ext_options,
        chown_tree: true,
    },
    PolicyEntry {
        fs_type: FilesystemType::Ext3,
        options: ext_options,
        chown_tree: true,
    },
    PolicyEntry {
        fs_type: FilesystemType::Ext4,
        options: ext_options,
        chown_tree: true,
    },
];

fn owned(uid: u32, gid: u32) -> Vec<String> {
    vec![
        format!("uid={}", uid),
        format!("gid={}", gid),
        "rw".to_string(),
        "dmask=022".to_string(),
        "fmask=133".to_string(),
    ]
}

fn fat_options(uid: u32, gid: u32) -> Vec<String> {
    let mut opts = owned(uid, gid);
    opts.extend(["utf8".to_string(), "flush".to_string()]);
    opts
}

fn ntfs_options(uid: u32, gid: u32) -> Vec<String> {
    let mut opts = owned(uid, gid);
    opts.extend(["windows_names".to_string(), "big_writes".to_string()]);
    opts
}

fn exfat_options(uid: u32, gid: u32) -> Vec<String> {
    owned(uid, gid)
}

fn ext_options(_uid: u32, _gid: u32) -> Vec<String> {
    vec![
        "rw".to_string(),
        "defaults".to_string(),
        "user_xattr".to_string(),
    ]
}

/// Look up the policy for a filesystem type.
///
/// Types without an entry get an empty option list ("no managed options").
pub fn options_for(fs_type: FilesystemType, uid: u32, gid: u32) -> MountOptions {
    match POLICY.iter().find(|e| e.fs_type == fs_type) {
        Some(entry) => MountOptions {
            options: (entry.options)(uid, gid),
            chown_tree: entry.chown_tree,
        },
        None => MountOptions {
            options: Vec::new(),
            chown_tree: false,
        },
    }
}
