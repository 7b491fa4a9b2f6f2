//! Plugshare Supervisor - keeps the plugshare services alive
//!
//! Owns a fixed roster (device monitor, share controller, file server),
//! restarts crashed services, restarts the device monitor on a long
//! schedule, and performs targeted restarts when an outside tool drops a
//! refresh request.

pub mod refresh;
pub mod roster;
pub mod supervisor;

pub use refresh::RefreshTrigger;
pub use roster::{Roster, ServiceSpec, DEVICE_MONITOR, FILE_SERVER, SHARE_CONTROLLER};
pub use supervisor::{ServiceStatus, Supervisor, SupervisorTimings};
