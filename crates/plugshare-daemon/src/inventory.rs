//! Live mount/share inventory export
//!
//! Small JSON documents rewritten after every mutation so that outside
//! readers (the web interface, scripts) can see what is mounted and shared
//! without talking to the daemons.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::{trace, warn};

#[derive(Serialize)]
struct Document<'a, T: Serialize> {
    updated_at: String,
    items: &'a [T],
}

/// Writer for one inventory file
#[derive(Clone, Debug)]
pub struct Inventory {
    path: PathBuf,
}

impl Inventory {
    pub fn new(dir: &Path, file_name: &str) -> Self {
        Self {
            path: dir.join(file_name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the inventory with `items`. Failures are logged only.
    pub fn publish<T: Serialize>(&self, items: &[T]) {
        let doc = Document {
            updated_at: Utc::now().to_rfc3339(),
            items,
        };
        let result = serde_json::to_vec_pretty(&doc)
            .map_err(io::Error::other)
            .and_then(|json| write_atomic(&self.path, &json));

        match result {
            Ok(()) => trace!("Updated inventory {:?} ({} items)", self.path, items.len()),
            Err(e) => warn!("Failed to write inventory {:?}: {}", self.path, e),
        }
    }
}

/// Write a file atomically (tmp file + rename)
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }

    fs::rename(&temp_path, path)
}
