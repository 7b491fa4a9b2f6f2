//! Hotplug event source
//!
//! Block-device add/remove notifications come from the kernel's uevent
//! netlink multicast group. Only partition events of the `block` subsystem
//! are passed on. USB origin is derived from the sysfs device path.
//!
//! [`scan_partitions`] produces the same events for partitions that were
//! already present before the monitor started.

use std::fs;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// sysfs directory listing every block device
pub const SYS_CLASS_BLOCK: &str = "/sys/class/block";

/// Kernel uevent multicast group
const UEVENT_GROUP_KERNEL: u32 = 1;

const RECV_BUFFER_SIZE: usize = 16 * 1024;

/// Hotplug action
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HotplugAction {
    Add,
    Remove,
}

/// One block-partition hotplug event
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HotplugEvent {
    pub action: HotplugAction,
    /// Device node, e.g. /dev/sda1
    pub device: PathBuf,
    /// Any ancestor of the device belongs to the usb subsystem
    pub usb: bool,
}

/// Inbound stream of hotplug events
#[async_trait]
pub trait HotplugSource: Send {
    /// Next event, or None once the source is exhausted
    async fn next_event(&mut self) -> Option<HotplugEvent>;
}

#[async_trait]
impl HotplugSource for mpsc::Receiver<HotplugEvent> {
    async fn next_event(&mut self) -> Option<HotplugEvent> {
        self.recv().await
    }
}

/// NETLINK_KOBJECT_UEVENT socket subscribed to kernel uevents
pub struct UeventSocket {
    fd: AsyncFd<OwnedFd>,
    buf: Vec<u8>,
}

impl UeventSocket {
    pub fn open() -> io::Result<Self> {
        // SAFETY: plain socket(2) call; the result is checked before use
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                libc::NETLINK_KOBJECT_UEVENT,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: raw is a freshly created descriptor owned by nobody else
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = UEVENT_GROUP_KERNEL;

        // SAFETY: addr outlives the call and the length matches its type
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        debug!("Subscribed to kernel uevents");
        Ok(Self {
            fd: AsyncFd::new(fd)?,
            buf: vec![0u8; RECV_BUFFER_SIZE],
        })
    }

    async fn recv(&mut self) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let buf = &mut self.buf;
            let result = guard.try_io(|inner| {
                // SAFETY: buf is valid for buf.len() writable bytes
                let n = unsafe {
                    libc::recv(
                        inner.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        0,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(read) => return read,
                Err(_would_block) => continue,
            }
        }
    }
}

#[async_trait]
impl HotplugSource for UeventSocket {
    async fn next_event(&mut self) -> Option<HotplugEvent> {
        loop {
            match self.recv().await {
                Ok(n) => {
                    if let Some(event) = parse_uevent(&self.buf[..n]) {
                        return Some(event);
                    }
                }
                // Receive queue overflowed; events were lost but the socket is fine
                Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                    warn!("Uevent buffer overrun, some events were dropped");
                }
                Err(e) => {
                    warn!("Uevent socket failed: {}", e);
                    return None;
                }
            }
        }
    }
}

/// Parse one kernel uevent datagram (`action@devpath\0KEY=VALUE\0...`).
///
/// Returns None for anything other than add/remove of a block partition.
pub fn parse_uevent(datagram: &[u8]) -> Option<HotplugEvent> {
    let mut action = None;
    let mut subsystem = None;
    let mut devtype = None;
    let mut devname = None;
    let mut devpath = None;

    for field in datagram.split(|b| *b == 0) {
        let Ok(field) = std::str::from_utf8(field) else {
            continue;
        };
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        match key {
            "ACTION" => action = Some(value),
            "SUBSYSTEM" => subsystem = Some(value),
            "DEVTYPE" => devtype = Some(value),
            "DEVNAME" => devname = Some(value),
            "DEVPATH" => devpath = Some(value),
            _ => {}
        }
    }

    if subsystem != Some("block") || devtype != Some("partition") {
        return None;
    }
    let action = match action? {
        "add" => HotplugAction::Add,
        "remove" => HotplugAction::Remove,
        other => {
            trace!("Ignoring uevent action {}", other);
            return None;
        }
    };

    Some(HotplugEvent {
        action,
        device: device_node(devname?),
        usb: devpath.map(devpath_is_usb).unwrap_or(false),
    })
}

fn device_node(devname: &str) -> PathBuf {
    if devname.starts_with('/') {
        PathBuf::from(devname)
    } else {
        Path::new("/dev").join(devname)
    }
}

/// True if any component of a sysfs device path is a USB bus (`usb<N>`)
pub fn devpath_is_usb(devpath: &str) -> bool {
    devpath.split('/').any(|component| {
        component
            .strip_prefix("usb")
            .map(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
            .unwrap_or(false)
    })
}

/// Enumerate partitions already present, as synthetic add events.
pub fn scan_partitions(sys_class_block: &Path) -> io::Result<Vec<HotplugEvent>> {
    let mut events = Vec::new();

    for entry in fs::read_dir(sys_class_block)?.flatten() {
        let path = entry.path();
        let Ok(uevent) = fs::read_to_string(path.join("uevent")) else {
            continue;
        };

        let mut devtype = None;
        let mut devname = None;
        for line in uevent.lines() {
            match line.split_once('=') {
                Some(("DEVTYPE", v)) => devtype = Some(v.to_string()),
                Some(("DEVNAME", v)) => devname = Some(v.to_string()),
                _ => {}
            }
        }
        if devtype.as_deref() != Some("partition") {
            continue;
        }
        let Some(devname) = devname else { continue };

        let usb = fs::canonicalize(&path)
            .map(|real| devpath_is_usb(&real.to_string_lossy()))
            .unwrap_or(false);

        events.push(HotplugEvent {
            action: HotplugAction::Add,
            device: device_node(&devname),
            usb,
        });
    }

    events.sort_by(|a, b| a.device.cmp(&b.device));
    Ok(events)
}
