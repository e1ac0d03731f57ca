//! Collection layout constants, root location and connection settings
//!
//! A collection root is any directory holding a [`MIMIC_DIR`] subdirectory.
//! That directory contains the manifest ([`CHECKSUM_FILE`]), the optional
//! bundle list ([`BUNDLE_FILE`]) and the connection configuration
//! ([`CONFIG_FILE`]).
//!
//! The connection configuration is a JSON object keyed by direction:
//!
//! ```json
//! {
//!    "Pull": {
//!       "uri": "https://example.org/archive",
//!       "username": "anonymous"
//!    }
//! }
//! ```

use crate::error::{MimicError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Name of the hidden management directory
pub const MIMIC_DIR: &str = ".mimic";

/// Manifest file, relative to the collection root
pub const CHECKSUM_FILE: &str = ".mimic/checksum.mimic";

/// Bundle file, relative to the collection root
pub const BUNDLE_FILE: &str = ".mimic/bundle";

/// Connection configuration file, relative to the collection root
pub const CONFIG_FILE: &str = ".mimic/config";

/// Synchronization direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Local collection is updated from a remote source
    Pull,
    /// Reserved, not implemented
    Push,
}

impl Direction {
    /// Key used in the configuration file
    pub fn key(&self) -> &'static str {
        match self {
            Direction::Pull => "Pull",
            Direction::Push => "Push",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Connection settings for one direction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostSettings {
    /// Remote collection URI including scheme, host and path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Account name at the remote host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// SSH private key used by scp transfers
    #[serde(default, alias = "keyfile", skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    /// Free-form name tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Keep the cipher active for transfers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_cipher: Option<bool>,
}

impl HostSettings {
    /// Settings for a remote URI with a username
    pub fn new(uri: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            uri: Some(uri.into()),
            username: Some(username.into()),
            ..Default::default()
        }
    }

    /// Overlay every field that is set in `other`
    pub fn merge(&mut self, other: HostSettings) {
        if other.uri.is_some() {
            self.uri = other.uri;
        }
        if other.username.is_some() {
            self.username = other.username;
        }
        if other.key_file.is_some() {
            self.key_file = other.key_file;
        }
        if other.tag.is_some() {
            self.tag = other.tag;
        }
        if other.with_cipher.is_some() {
            self.with_cipher = other.with_cipher;
        }
    }
}

/// Connection configuration of a collection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Settings used by pull and incremental sync
    #[serde(rename = "Pull", default, skip_serializing_if = "Option::is_none")]
    pub pull: Option<HostSettings>,
    /// Reserved for push synchronization
    #[serde(rename = "Push", default, skip_serializing_if = "Option::is_none")]
    pub push: Option<HostSettings>,
}

impl ConnectionConfig {
    /// Settings for a direction, if any
    pub fn settings(&self, direction: Direction) -> Option<&HostSettings> {
        match direction {
            Direction::Pull => self.pull.as_ref(),
            Direction::Push => self.push.as_ref(),
        }
    }

    /// Mutable settings for a direction, created empty if absent
    pub fn settings_mut(&mut self, direction: Direction) -> &mut HostSettings {
        match direction {
            Direction::Pull => self.pull.get_or_insert_with(HostSettings::default),
            Direction::Push => self.push.get_or_insert_with(HostSettings::default),
        }
    }

    /// Load the configuration stored under a collection root
    ///
    /// A missing file yields an empty configuration.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            debug!("Configuration file is missing: {:?}", path);
            return Ok(Self::default());
        }
        let content = fs::read(&path)?;
        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(&content)?)
    }

    /// Store the configuration under a collection root
    pub fn store(&self, root: &Path) -> Result<()> {
        let path = root.join(CONFIG_FILE);
        crate::utils::atomic_write(&path, self.to_json()?.as_bytes())
    }

    /// Render as JSON with a 3-space indent
    pub fn to_json(&self) -> Result<String> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"   ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut serializer)?;
        String::from_utf8(out).map_err(|e| MimicError::internal(e.to_string()))
    }
}

/// Determine if a folder itself is a collection root
///
/// Returns the normalized path when `base` contains a management directory.
pub fn get_root(base: &Path) -> Option<PathBuf> {
    let normalized = absolutize(base).ok()?;
    if normalized.join(MIMIC_DIR).is_dir() {
        Some(normalized)
    } else {
        None
    }
}

/// Search for the root of the collection managing `base`
///
/// The given directory is tested first, then each ancestor up to the
/// filesystem root. Returns `None` if no ancestor is managed.
pub fn find_root(base: &Path) -> Option<PathBuf> {
    let start = absolutize(base).ok()?;
    for candidate in start.ancestors() {
        trace!("Looking for {} in {:?}", MIMIC_DIR, candidate);
        if candidate.join(MIMIC_DIR).is_dir() {
            return Some(candidate.to_path_buf());
        }
    }
    None
}

/// Like [`find_root`] but fails with [`MimicError::RootNotManaged`]
pub fn require_root(base: &Path) -> Result<PathBuf> {
    find_root(base).ok_or_else(|| MimicError::RootNotManaged(base.to_path_buf()))
}

/// Resolve to an absolute path, canonicalizing when the path exists
fn absolutize(path: &Path) -> Result<PathBuf> {
    if let Ok(canon) = path.canonicalize() {
        return Ok(canon);
    }
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
