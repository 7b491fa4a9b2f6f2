//! Live mount list and mount-point queries
//!
//! Reads `/proc/self/mountinfo` for the kernel's view of mounted filesystems
//! and walks the process list to decide whether a mount point is in use.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use procfs::process::{all_processes, FDTarget, Process};
use tracing::{trace, warn};

/// Kernel mount table
pub const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// One entry of the live mount list
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiveMount {
    /// Mount source, e.g. /dev/sda1
    pub source: PathBuf,
    pub mount_point: PathBuf,
    pub fs_type: String,
    /// Per-superblock options (where uid=, gid=, ... show up)
    pub options: Vec<String>,
}

impl LiveMount {
    /// True if the mount point is a direct child of `root`
    pub fn is_under(&self, root: &Path) -> bool {
        self.mount_point.parent() == Some(root)
    }
}

/// Read the live mount list of this process's namespace
pub fn read_live_mounts() -> io::Result<Vec<LiveMount>> {
    let contents = fs::read_to_string(MOUNTINFO_PATH)?;
    Ok(parse_mountinfo(&contents))
}

/// Parse mountinfo content, skipping malformed lines.
///
/// Line format (proc(5)):
/// `id parent maj:min root mount_point mount_opts [optional...] - fstype source super_opts`
pub fn parse_mountinfo(contents: &str) -> Vec<LiveMount> {
    contents.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<LiveMount> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let sep = fields.iter().position(|f| *f == "-")?;
    if sep < 6 || fields.len() < sep + 3 {
        trace!("Skipping malformed mountinfo line: {}", line);
        return None;
    }

    let super_opts = fields.get(sep + 3).copied().unwrap_or("");
    Some(LiveMount {
        source: PathBuf::from(decode_escapes(fields[sep + 2])),
        mount_point: PathBuf::from(decode_escapes(fields[4])),
        fs_type: fields[sep + 1].to_string(),
        options: super_opts
            .split(',')
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect(),
    })
}

/// Undo the kernel's octal escaping of space, tab, newline and backslash
fn decode_escapes(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let byte = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(byte) = u8::try_from(byte) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Whether `path` is a mount point (same test as `mountpoint(1)`).
///
/// A path is a mount point when it lives on a different device than its
/// parent, or when it is its parent (the root directory).
pub fn is_mount_point(path: &Path) -> bool {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return false;
    };
    if !meta.is_dir() {
        return false;
    }
    let parent = path.join("..");
    let Ok(parent_meta) = fs::symlink_metadata(&parent) else {
        return false;
    };
    meta.dev() != parent_meta.dev() || meta.ino() == parent_meta.ino()
}

/// Whether any process holds a file, cwd, root, or executable under
/// `mount_point`.
pub fn mount_in_use(mount_point: &Path) -> bool {
    let processes = match all_processes() {
        Ok(processes) => processes,
        Err(e) => {
            warn!("Cannot list processes: {}", e);
            return false;
        }
    };
    processes
        .flatten()
        .any(|process| process_uses(&process, mount_point))
}

fn process_uses(process: &Process, mount_point: &Path) -> bool {
    let linked = [process.cwd(), process.root(), process.exe()]
        .into_iter()
        .flatten()
        .any(|target| target.starts_with(mount_point));
    if linked {
        trace!("pid {} uses {:?}", process.pid, mount_point);
        return true;
    }

    let Ok(fds) = process.fd() else {
        return false;
    };
    for fd in fds.flatten() {
        if let FDTarget::Path(target) = fd.target {
            if target.starts_with(mount_point) {
                trace!("pid {} holds {:?}", process.pid, target);
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
22 1 8:2 / / rw,relatime shared:1 - ext4 /dev/sda2 rw,errors=remount-ro
36 22 8:17 / /media/owner/sdb1 rw,relatime shared:30 - vfat /dev/sdb1 rw,uid=1000,gid=1000,fmask=0133,dmask=0022,utf8,flush
37 22 8:33 / /media/owner/my\\040disk rw,relatime - exfat /dev/sdc1 rw,uid=1000
garbage line
";

    #[test]
    fn test_parse_mountinfo() {
        let mounts = parse_mountinfo(SAMPLE);
        assert_eq!(mounts.len(), 3);

        assert_eq!(mounts[1].source, PathBuf::from("/dev/sdb1"));
        assert_eq!(mounts[1].mount_point, PathBuf::from("/media/owner/sdb1"));
        assert_eq!(mounts[1].fs_type, "vfat");
        assert!(mounts[1].options.contains(&"uid=1000".to_string()));
        assert!(mounts[1].options.contains(&"flush".to_string()));
    }

    #[test]
    fn test_parse_escaped_mount_point() {
        let mounts = parse_mountinfo(SAMPLE);
        assert_eq!(mounts[2].mount_point, PathBuf::from("/media/owner/my disk"));
    }

    #[test]
    fn test_is_under_root() {
        let mounts = parse_mountinfo(SAMPLE);
        let root = Path::new("/media/owner");
        assert!(!mounts[0].is_under(root));
        assert!(mounts[1].is_under(root));
    }

    #[test]
    fn test_is_mount_point() {
        assert!(is_mount_point(Path::new("/")));

        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("plain");
        fs::create_dir(&sub).unwrap();
        assert!(!is_mount_point(&sub));
        assert!(!is_mount_point(&dir.path().join("missing")));
    }

    #[test]
    fn test_open_file_marks_directory_in_use() {
        let used = tempfile::tempdir().unwrap();
        let idle = tempfile::tempdir().unwrap();
        let used_path = used.path().canonicalize().unwrap();
        let idle_path = idle.path().canonicalize().unwrap();

        let _held = fs::File::create(used_path.join("video.mp4")).unwrap();

        assert!(mount_in_use(&used_path));
        assert!(!mount_in_use(&idle_path));
    }
}
