//! Share configuration store
//!
//! A section-per-share text file in the format the file-sharing daemon
//! reads (`[name]` headers followed by `key = value` lines). The store is
//! always rewritten in full. Sections the registry does not manage are
//! carried through untouched.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use plugshare_core::{ShareAccess, ShareEntry, ShareError};

use crate::inventory::write_atomic;

/// Header written into a freshly created store
pub const STORE_HEADER: &str = "; Removable volume shares, rewritten by plugshare";

/// One `[name]` section
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub entries: Vec<(String, String)>,
}

impl Section {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    /// Backing path of the share
    pub fn path(&self) -> Option<PathBuf> {
        self.get("path").map(PathBuf::from)
    }
}

/// In-memory copy of the share store
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShareStore {
    /// Lines before the first section
    preamble: Vec<String>,
    sections: Vec<Section>,
}

impl ShareStore {
    /// Load from disk. A missing file is an empty store.
    pub fn load(path: &Path) -> Result<Self, ShareError> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Self::parse(&contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self {
                preamble: vec![STORE_HEADER.to_string()],
                sections: Vec::new(),
            }),
            Err(source) => Err(ShareError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Rewrite the whole store atomically
    pub fn save(&self, path: &Path) -> Result<(), ShareError> {
        write_atomic(path, self.render().as_bytes()).map_err(|e| ShareError::ShareWriteFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn parse(contents: &str) -> Self {
        let mut store = Self::default();

        for raw in contents.lines() {
            let line = raw.trim();
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                store.sections.push(Section::new(name.trim()));
                continue;
            }

            match store.sections.last_mut() {
                None => {
                    if !line.is_empty() {
                        store.preamble.push(line.to_string());
                    }
                }
                Some(section) => {
                    if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                        continue;
                    }
                    if let Some((key, value)) = line.split_once('=') {
                        section
                            .entries
                            .push((key.trim().to_string(), value.trim().to_string()));
                    }
                }
            }
        }

        store
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.preamble {
            let _ = writeln!(out, "{}", line);
        }
        for section in &self.sections {
            if !out.is_empty() {
                out.push('\n');
            }
            let _ = writeln!(out, "[{}]", section.name);
            for (key, value) in &section.entries {
                let _ = writeln!(out, "   {} = {}", key, value);
            }
        }
        out
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn get(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Insert a section, replacing one with the same name in place
    pub fn upsert(&mut self, section: Section) {
        match self.sections.iter_mut().find(|s| s.name == section.name) {
            Some(existing) => *existing = section,
            None => self.sections.push(section),
        }
    }

    /// Remove a section by name. Returns true if it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.sections.len();
        self.sections.retain(|s| s.name != name);
        self.sections.len() != before
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

/// Render a share entry as a store section
pub fn entry_to_section(entry: &ShareEntry) -> Section {
    let access: &ShareAccess = &entry.access;
    let mut section = Section::new(entry.name.clone());

    section.set("comment", entry.comment.clone());
    section.set("path", entry.path.to_string_lossy());
    section.set("browseable", yes_no(access.browsable));
    section.set("read only", yes_no(access.read_only));
    section.set("writable", yes_no(!access.read_only));
    section.set("guest ok", yes_no(access.guest_ok));
    if !access.guest_ok {
        if let Some(users) = &access.valid_users {
            section.set("valid users", users.clone());
        }
    }
    section.set("create mask", access.create_mask.clone());
    section.set("directory mask", access.directory_mask.clone());
    if access.force_owner {
        if let Some(owner) = &entry.owner {
            section.set("force user", owner.clone());
            section.set("force group", owner.clone());
        }
    }

    section
}

/// Main daemon configuration that pulls in the share store
pub fn render_main_config(share_store: &Path, access: &ShareAccess) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "[global]");
    let _ = writeln!(out, "   workgroup = WORKGROUP");
    let _ = writeln!(out, "   server string = plugshare");
    let _ = writeln!(out, "   server role = standalone server");
    let _ = writeln!(out, "   security = user");
    let _ = writeln!(
        out,
        "   map to guest = {}",
        if access.guest_ok { "Bad User" } else { "Never" }
    );
    let _ = writeln!(out, "   load printers = no");
    let _ = writeln!(out, "   disable spoolss = yes");
    let _ = writeln!(out, "   include = {}", share_store.display());
    out
}
