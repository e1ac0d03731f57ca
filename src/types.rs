//! Core data types used throughout the Mimic library
//!
//! ## Overview
//!
//! - **Inventory**: [`ManifestRecord`], [`Manifest`], [`BundleRecord`],
//!   [`BundleList`] - what a collection tracks and which nested collections it
//!   bundles
//! - **Options**: [`ScanOptions`], [`RefreshOptions`], [`TransferOptions`],
//!   [`TestMode`] - parameters threaded explicitly through each operation
//! - **Reports**: [`AddSummary`], [`RefreshReport`], [`SyncReport`],
//!   [`InventorySummary`] - what an operation did
//!
//! Manifests and bundle lists are ordered maps keyed by the record path.
//! Iteration is ascending byte order of the key; [`Manifest::descending`]
//! yields children before their parent directories.

use crate::checksum::{is_dir_sentinel, DIR_SENTINEL};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::{self, BTreeMap};
use std::fmt;

/// One tracked file or directory
///
/// Directory records carry [`DIR_SENTINEL`] as digest and a length of zero.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestRecord {
    /// Size in bytes (0 for directories)
    pub length: u64,
    /// Last modified time in milliseconds since the Unix epoch
    pub modified: u64,
    /// Hex content digest, or [`DIR_SENTINEL`]
    pub checksum: String,
    /// `./`-prefixed, forward-slash path relative to the collection root
    pub path: String,
}

impl ManifestRecord {
    /// Create a file record
    pub fn file(length: u64, modified: u64, checksum: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            length,
            modified,
            checksum: checksum.into(),
            path: path.into(),
        }
    }

    /// Create a directory record
    pub fn directory(modified: u64, path: impl Into<String>) -> Self {
        Self {
            length: 0,
            modified,
            checksum: DIR_SENTINEL.to_string(),
            path: path.into(),
        }
    }

    /// Whether the record describes a directory
    pub fn is_dir(&self) -> bool {
        is_dir_sentinel(&self.checksum)
    }
}

impl fmt::Display for ManifestRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.length, self.modified, self.checksum, self.path)
    }
}

/// Ordered mapping from record path to [`ManifestRecord`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    records: BTreeMap<String, ManifestRecord>,
}

impl Manifest {
    /// Create an empty manifest
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record keyed by its path, returning any previous record
    pub fn insert(&mut self, record: ManifestRecord) -> Option<ManifestRecord> {
        self.records.insert(record.path.clone(), record)
    }

    /// Look up a record by path
    pub fn get(&self, path: &str) -> Option<&ManifestRecord> {
        self.records.get(path)
    }

    /// Remove a record by path
    pub fn remove(&mut self, path: &str) -> Option<ManifestRecord> {
        self.records.remove(path)
    }

    /// Whether a path is tracked
    pub fn contains(&self, path: &str) -> bool {
        self.records.contains_key(path)
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the manifest has no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in ascending path order
    pub fn iter(&self) -> btree_map::Values<'_, String, ManifestRecord> {
        self.records.values()
    }

    /// Tracked paths in ascending order
    pub fn keys(&self) -> btree_map::Keys<'_, String, ManifestRecord> {
        self.records.keys()
    }

    /// Records in descending path order
    ///
    /// A path is always a strict prefix of its descendants, so every child
    /// sorts after its parent ascending and before it descending.
    pub fn descending(&self) -> impl Iterator<Item = &ManifestRecord> {
        self.records.values().rev()
    }

    /// Remove every record whose path starts with `prefix`, returning them
    pub fn drain_prefix(&mut self, prefix: &str) -> Vec<ManifestRecord> {
        let keys: Vec<String> = self
            .records
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.iter().filter_map(|k| self.records.remove(k)).collect()
    }

    /// Split into (directories, files), both in ascending path order
    pub fn partition(&self) -> (Vec<ManifestRecord>, Vec<ManifestRecord>) {
        self.records.values().cloned().partition(ManifestRecord::is_dir)
    }

    /// Sum of all record lengths
    pub fn total_bytes(&self) -> u64 {
        self.records.values().map(|r| r.length).sum()
    }
}

impl FromIterator<ManifestRecord> for Manifest {
    fn from_iter<I: IntoIterator<Item = ManifestRecord>>(iter: I) -> Self {
        let mut manifest = Manifest::new();
        for record in iter {
            manifest.insert(record);
        }
        manifest
    }
}

impl<'a> IntoIterator for &'a Manifest {
    type Item = &'a ManifestRecord;
    type IntoIter = btree_map::Values<'a, String, ManifestRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.values()
    }
}

/// Reference to a nested collection root
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BundleRecord {
    /// Last modified time of the referenced directory, epoch milliseconds
    pub modified: u64,
    /// Path of the nested root relative to the parent root
    pub path: String,
}

impl fmt::Display for BundleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.modified, self.path)
    }
}

/// Ordered mapping from nested collection path to [`BundleRecord`]
pub type BundleList = BTreeMap<String, BundleRecord>;

/// How refresh applies what it finds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestMode {
    /// Apply changes and write the manifest
    #[default]
    Apply,
    /// Report only
    DryRun,
    /// Report only, including unchanged entries as OK
    Status,
}

impl TestMode {
    /// Whether changes are written
    pub fn applies(&self) -> bool {
        matches!(self, TestMode::Apply)
    }
}

impl From<bool> for TestMode {
    fn from(test: bool) -> Self {
        if test {
            TestMode::DryRun
        } else {
            TestMode::Apply
        }
    }
}

/// Options for walking a collection
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Descend into subdirectories
    pub recurse: bool,
    /// Log per-entry events at info level
    pub verbose: bool,
    /// Whether to write the manifest
    pub test_mode: TestMode,
    /// Relative path prefixes to skip (without the leading `./`)
    pub exclude: Vec<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            recurse: true,
            verbose: false,
            test_mode: TestMode::Apply,
            exclude: vec![crate::config::MIMIC_DIR.to_string()],
        }
    }
}

/// Options for refresh and status
#[derive(Debug, Clone, Default)]
pub struct RefreshOptions {
    /// Skip digest recomputation
    pub quick: bool,
    /// Walk options
    pub scan: ScanOptions,
}

/// Lower bound for per-phase concurrency
pub const MIN_CONCURRENCY: usize = 1;

/// Upper bound for per-phase concurrency
pub const MAX_CONCURRENCY: usize = 256;

/// Options for network operations
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Log per-item events at info level
    pub verbose: bool,
    /// Maximum items in flight within one phase
    pub max_concurrency: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            max_concurrency: (num_cpus::get() * 4).clamp(MIN_CONCURRENCY, MAX_CONCURRENCY),
        }
    }
}

impl TransferOptions {
    /// Set the per-phase concurrency, clamped to `[1, 256]`
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY);
        self
    }

    /// Enable verbose per-item logging
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Result of `add`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddSummary {
    /// New directories found
    pub folders: usize,
    /// New files found
    pub files: usize,
    /// Paths of new entries
    pub added: Vec<String>,
    /// Whether the manifest was written
    pub stored: bool,
}

/// Folder/file pair of counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    /// Directories
    pub folders: usize,
    /// Files
    pub files: usize,
}

impl Tally {
    /// Count one entry
    pub fn count(&mut self, is_dir: bool) {
        if is_dir {
            self.folders += 1;
        } else {
            self.files += 1;
        }
    }

    /// Folders plus files
    pub fn total(&self) -> usize {
        self.folders + self.files
    }
}

/// Result of `refresh` and `status`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshReport {
    /// Entries walked
    pub scanned: Tally,
    /// Entries not previously tracked
    pub added: Tally,
    /// Tracked entries no longer present
    pub removed: Tally,
    /// Tracked entries whose metadata or digest changed
    pub updated: Tally,
    /// Paths of added entries
    pub added_paths: Vec<String>,
    /// Paths of removed entries
    pub removed_paths: Vec<String>,
    /// Paths of updated entries
    pub updated_paths: Vec<String>,
    /// Paths found unchanged (status mode only)
    pub unchanged_paths: Vec<String>,
    /// Whether the manifest was written
    pub stored: bool,
}

impl RefreshReport {
    /// Whether anything differs from the manifest
    pub fn has_changes(&self) -> bool {
        self.added.total() > 0 || self.removed.total() > 0 || self.updated.total() > 0
    }
}

/// Result of `pull`, `sync_with_pull` and `download`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    /// Files fetched
    pub copied: usize,
    /// Bytes fetched
    pub bytes: u64,
    /// Directories created
    pub created: usize,
    /// Local entries removed
    pub removed: usize,
    /// Items whose fetch or local mutation failed
    pub failed: Vec<String>,
    /// Whether the remote manifest was committed locally
    pub committed: bool,
}

impl SyncReport {
    /// Whether every item succeeded
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Counts from a stored manifest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySummary {
    /// File records
    pub files: usize,
    /// Directory records
    pub folders: usize,
    /// Sum of file lengths
    pub bytes: u64,
}
