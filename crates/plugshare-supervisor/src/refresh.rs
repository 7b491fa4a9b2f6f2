//! Refresh trigger file
//!
//! An outside tool requests a targeted restart by writing a numeric
//! timestamp to a well-known file. Each distinct, increasing timestamp is
//! acted on once; the file is deleted after it has been read.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};

pub struct RefreshTrigger {
    path: PathBuf,
    last_seen: Option<f64>,
}

impl RefreshTrigger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_seen: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_seen(&self) -> Option<f64> {
        self.last_seen
    }

    /// Consume the trigger file if present.
    ///
    /// Returns the timestamp when it is newer than anything seen before.
    /// Content that is not a number counts as "now".
    pub fn poll(&mut self) -> Option<f64> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Cannot read refresh trigger {:?}: {}", self.path, e);
                return None;
            }
        };

        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Cannot remove refresh trigger {:?}: {}", self.path, e);
        }

        let timestamp = match contents.trim().parse::<f64>() {
            Ok(t) if t.is_finite() => t,
            _ => {
                debug!("Refresh payload {:?} is not a timestamp, using now", contents.trim());
                Utc::now().timestamp_millis() as f64 / 1000.0
            }
        };

        if let Some(last) = self.last_seen {
            if timestamp <= last {
                debug!("Ignoring refresh request {} (last seen {})", timestamp, last);
                return None;
            }
        }

        info!("Refresh requested at {}", timestamp);
        self.last_seen = Some(timestamp);
        Some(timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut trigger = RefreshTrigger::new(dir.path().join("refresh"));
        assert_eq!(trigger.poll(), None);
    }

    #[test]
    fn test_same_timestamp_acted_on_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("refresh");
        let mut trigger = RefreshTrigger::new(&path);

        fs::write(&path, "1700000000.5\n").unwrap();
        assert_eq!(trigger.poll(), Some(1_700_000_000.5));
        assert!(!path.exists());

        fs::write(&path, "1700000000.5").unwrap();
        assert_eq!(trigger.poll(), None);
        assert!(!path.exists());

        fs::write(&path, "1699999999").unwrap();
        assert_eq!(trigger.poll(), None);

        fs::write(&path, "1700000001").unwrap();
        assert_eq!(trigger.poll(), Some(1_700_000_001.0));
    }

    #[test]
    fn test_garbage_payload_counts_as_now() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("refresh");
        let mut trigger = RefreshTrigger::new(&path);

        fs::write(&path, "please refresh").unwrap();
        let seen = trigger.poll().unwrap();

        assert!(seen > 1_600_000_000.0);
        assert!(!path.exists());
    }
}
