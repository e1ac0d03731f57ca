//! Directory walker
//!
//! Produces a lazy, filtered sequence of filesystem entries below a starting
//! point, keyed relative to a collection root.
//!
//! ## Filtering
//!
//! - Directories whose name starts with `.` are skipped together with their
//!   subtrees. This keeps `.mimic` and other management folders out of the
//!   inventory. Hidden regular files are kept.
//! - Any entry whose key (without the leading `./`) starts with one of the
//!   configured exclusion prefixes is skipped, including its subtree.
//! - The starting directory itself is never yielded.
//!
//! Entries are yielded in file-name order within each directory, parents
//! before children. A starting point that is a regular file yields exactly
//! that file.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mimic::walker::DirWalker;
//! use std::path::Path;
//!
//! # fn example() -> mimic::Result<()> {
//! let walker = DirWalker::new(Path::new("/data/archive"), Path::new("/data/archive/docs"))
//!     .with_recursion(false);
//! for entry in walker.entries() {
//!     let entry = entry?;
//!     println!("{} ({} bytes)", entry.key, entry.size);
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{MimicError, Result};
use crate::utils;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{trace, warn};
use walkdir::{DirEntry, WalkDir};

/// One walked filesystem entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// Absolute path on disk
    pub path: PathBuf,
    /// Manifest key relative to the root (`./a/b.txt`)
    pub key: String,
    /// Whether the entry is a directory
    pub is_dir: bool,
    /// Size in bytes, 0 for directories
    pub size: u64,
    /// Last modified time, epoch milliseconds floored
    pub modified: u64,
}

/// Lazy, filtered walker over a subtree of a collection
#[derive(Debug, Clone)]
pub struct DirWalker {
    root: PathBuf,
    start: PathBuf,
    recursive: bool,
    exclude: Vec<String>,
}

impl DirWalker {
    /// Create a walker over `start`, producing keys relative to `root`
    ///
    /// `start` must be `root` or a path below it. Recursion is on and no
    /// prefixes are excluded by default.
    pub fn new(root: &Path, start: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            start: start.to_path_buf(),
            recursive: true,
            exclude: Vec::new(),
        }
    }

    /// Descend into subdirectories (default) or stay at the first level
    pub fn with_recursion(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Skip entries whose relative key starts with one of `prefixes`
    ///
    /// Prefixes are compared without the leading `./`; empty prefixes are
    /// ignored.
    pub fn with_exclusions(mut self, prefixes: Vec<String>) -> Self {
        self.exclude = prefixes
            .into_iter()
            .map(|p| utils::trim_key(&p).to_string())
            .filter(|p| !p.is_empty())
            .collect();
        self
    }

    /// Root the keys are relative to
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Iterate entries lazily
    ///
    /// Each item is either an entry or the error encountered reading it; the
    /// walk continues after an error.
    pub fn entries(&self) -> Box<dyn Iterator<Item = Result<WalkEntry>> + '_> {
        if self.start.is_file() {
            return Box::new(self.entry(&self.start).transpose().into_iter());
        }

        let mut walk = WalkDir::new(&self.start)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name();
        if !self.recursive {
            walk = walk.max_depth(1);
        }

        Box::new(
            walk.into_iter()
                .filter_entry(move |e| self.admits(e))
                .filter_map(move |item| match item {
                    Ok(e) => self.entry(e.path()).transpose(),
                    Err(e) => Some(Err(MimicError::from(e))),
                }),
        )
    }

    /// Whether an entry passes the hidden-folder and exclusion filters
    fn admits(&self, entry: &DirEntry) -> bool {
        if entry.depth() == 0 {
            return true;
        }
        if entry.file_type().is_dir() && entry.file_name().to_string_lossy().starts_with('.') {
            trace!("Skipping hidden folder {:?}", entry.path());
            return false;
        }
        if self.exclude.is_empty() {
            return true;
        }
        match utils::make_relative(entry.path(), &self.root) {
            Ok(relative) => {
                let key = utils::record_key(&relative);
                let key = utils::trim_key(&key);
                let excluded = self.exclude.iter().any(|p| key.starts_with(p.as_str()));
                if excluded {
                    trace!("Excluding {}", key);
                }
                !excluded
            }
            Err(_) => true,
        }
    }

    /// Build the entry for a path, or `None` when it should be skipped
    fn entry(&self, path: &Path) -> Result<Option<WalkEntry>> {
        // Follows symlinks; dangling links are skipped
        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Skipping dangling entry {:?}", path);
                return Ok(None);
            }
            Err(e) => return Err(MimicError::filesystem(path, e)),
        };

        let is_dir = metadata.is_dir();
        if !is_dir && !metadata.is_file() {
            trace!("Skipping special file {:?}", path);
            return Ok(None);
        }

        let relative = utils::make_relative(path, &self.root)?;
        if relative.as_os_str().is_empty() {
            return Ok(None);
        }

        Ok(Some(WalkEntry {
            path: path.to_path_buf(),
            key: utils::record_key(&relative),
            is_dir,
            size: if is_dir { 0 } else { metadata.len() },
            modified: metadata.modified().map(utils::to_millis).unwrap_or(0),
        }))
    }
}
