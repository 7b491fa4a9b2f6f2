//! Owner identity resolution
//!
//! Mount points, ext trees, and forced share ownership all use the same
//! UID/GID pair, resolved once at process start from a system user name.

use nix::unistd::{Group, User};
use tracing::info;

use crate::error::IdentityError;

/// Environment variable that overrides the configured owner
pub const OWNER_ENV: &str = "SUDO_USER";

/// Resolved owner of mounts and shares
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerIdentity {
    pub user: String,
    pub uid: u32,
    pub gid: u32,
}

impl OwnerIdentity {
    /// Resolve a user name to its UID and GID.
    ///
    /// The GID comes from the group of the same name when one exists,
    /// otherwise from the user's primary group.
    pub fn resolve(user: &str) -> Result<Self, IdentityError> {
        let entry = User::from_name(user)
            .map_err(|e| IdentityError::Lookup {
                user: user.to_string(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| IdentityError::UserNotFound(user.to_string()))?;

        let gid = match Group::from_name(user) {
            Ok(Some(group)) => group.gid.as_raw(),
            _ => entry.gid.as_raw(),
        };

        let identity = Self {
            user: user.to_string(),
            uid: entry.uid.as_raw(),
            gid,
        };
        info!(
            "Resolved owner {} (uid={}, gid={})",
            identity.user, identity.uid, identity.gid
        );
        Ok(identity)
    }

    /// Pick the owner name: `SUDO_USER` when set and non-empty, else the configured user.
    pub fn effective_user(configured: &str) -> String {
        match std::env::var(OWNER_ENV) {
            Ok(user) if !user.trim().is_empty() => user,
            _ => configured.to_string(),
        }
    }
}
