//! Utility functions for Mimic
//!
//! Small helpers shared across modules:
//!
//! - **Atomic writes**: manifest, bundle and configuration files are replaced
//!   through a temporary file in the same directory followed by a rename, so a
//!   reader sees either the old or the new content.
//! - **Record keys**: conversion between filesystem paths and the `./`-prefixed,
//!   forward-slash keys used in manifests, with a guard against keys that would
//!   escape the collection home.
//! - **Timestamps**: integer millisecond conversions and mtime restamping.
//! - **URLs and sizes**: joining remote names onto a base URI, human-readable
//!   byte counts for summaries.

use crate::error::{MimicError, Result};
use filetime::FileTime;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use tracing::{info, trace};
use url::Url;

/// Log a per-item event at info level when verbose, trace otherwise
pub fn note(verbose: bool, message: std::fmt::Arguments<'_>) {
    if verbose {
        info!("{}", message);
    } else {
        trace!("{}", message);
    }
}

/// Atomic file write (write to temp file then rename)
///
/// The temporary file is created next to `path` so the final rename never
/// crosses a filesystem boundary. On failure the temporary file is removed.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| MimicError::Io(e.error))?;
    trace!("Atomically wrote {} bytes to {:?}", content.len(), path);
    Ok(())
}

/// Make a path relative to a base path
///
/// Tries a lexical strip first and falls back to canonicalizing both paths.
pub fn make_relative(path: &Path, base: &Path) -> Result<PathBuf> {
    if let Ok(relative) = path.strip_prefix(base) {
        return Ok(relative.to_path_buf());
    }

    let path_canon = path.canonicalize()?;
    let base_canon = base.canonicalize()?;

    path_canon
        .strip_prefix(&base_canon)
        .map(|p| p.to_path_buf())
        .map_err(|_| {
            MimicError::internal(format!(
                "Path {:?} is not relative to {:?}",
                path_canon, base_canon
            ))
        })
}

/// Build the manifest key for a path relative to the collection root
///
/// `a/b.txt` becomes `./a/b.txt`; an empty path becomes `./`.
pub fn record_key(relative: &Path) -> String {
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    format!("./{}", parts.join("/"))
}

/// Strip the `./` or `/` prefix from a manifest key
pub fn trim_key(key: &str) -> &str {
    let key = key.strip_prefix("./").unwrap_or(key);
    key.trim_start_matches('/')
}

/// Resolve a manifest key to a path under `home`
///
/// Rejects keys that are absolute or contain `..` so that a remote manifest
/// can never direct writes outside the collection.
pub fn resolve_key(home: &Path, key: &str) -> Result<PathBuf> {
    let relative = Path::new(trim_key(key));
    let mut out = home.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return Err(MimicError::UnsafePath(key.to_string())),
        }
    }
    Ok(out)
}

/// Join a remote name onto a base URI
///
/// Leading `./` and `/` are removed from `back`; `front` gets a trailing `/`.
pub fn join_url(front: &str, back: &str) -> String {
    let back = trim_key(back);
    if front.ends_with('/') {
        format!("{}{}", front, back)
    } else {
        format!("{}/{}", front, back)
    }
}

/// URL of a manifest key under a base URI
///
/// Each path segment of `name` is percent-encoded, so names holding `#`, `?`
/// or spaces address the file itself rather than a fragment or query.
pub fn resource_url(base: &str, name: &str) -> Result<Url> {
    let mut url = Url::parse(base)?;
    url.path_segments_mut()
        .map_err(|_| MimicError::custom(format!("URI '{}' cannot hold a path", base)))?
        .pop_if_empty()
        .extend(trim_key(name).split('/'));
    Ok(url)
}

/// Milliseconds since the Unix epoch, floored
pub fn to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Convert epoch milliseconds back to a `SystemTime`
pub fn from_millis(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}

/// Set both access and modification time of a path to `millis`
pub fn stamp(path: &Path, millis: u64) -> Result<()> {
    let time = FileTime::from_system_time(from_millis(millis));
    filetime::set_file_times(path, time, time).map_err(|e| MimicError::filesystem(path, e))
}

/// Expand a leading `~` to the user's home directory
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest.trim_start_matches(['/', '\\']));
        }
    }
    PathBuf::from(path)
}

/// Format bytes in human-readable form
///
/// Uses 1024 as the conversion factor; values under 1 KB are whole numbers.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Remove a file, or a directory if it is empty
///
/// Returns `Ok(false)` when the path does not exist.
pub fn remove_entry(path: &Path, is_dir: bool) -> Result<bool> {
    let result = if is_dir {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(MimicError::filesystem(path, e)),
    }
}
