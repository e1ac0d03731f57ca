//! Handle on one managed collection root
//!
//! A [`Collection`] owns the resolved root path and provides access to the
//! files kept under `.mimic/`. The synchronization operations are implemented
//! on this type in [`crate::sync`]; the nested-collection drivers live in
//! [`crate::bundle`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use mimic::{Collection, ScanOptions};
//! use std::path::Path;
//!
//! # fn example() -> mimic::Result<()> {
//! let collection = Collection::init(Path::new("./archive"))?;
//! let summary = collection.add(collection.root(), &ScanOptions::default())?;
//! println!("{} new file(s)", summary.files);
//! # Ok(())
//! # }
//! ```

use crate::config::{
    self, ConnectionConfig, Direction, HostSettings, BUNDLE_FILE, CHECKSUM_FILE, MIMIC_DIR,
};
use crate::error::{MimicError, Result};
use crate::manifest;
use crate::types::{InventorySummary, Manifest};
use crate::utils;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Suffix of the file a remote manifest is staged in before commit
pub const STAGING_SUFFIX: &str = ".tmp";

/// One managed collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    root: PathBuf,
}

impl Collection {
    /// Place a directory under management
    ///
    /// Creates the directory if needed, then the management directory and an
    /// empty manifest. Fails with [`MimicError::AlreadyInitialized`] if the
    /// directory is already a collection root.
    pub fn init(path: &Path) -> Result<Self> {
        fs::create_dir_all(path).map_err(|e| MimicError::filesystem(path, e))?;
        let root = path.canonicalize()?;
        let mimic_dir = root.join(MIMIC_DIR);
        if mimic_dir.exists() {
            return Err(MimicError::AlreadyInitialized(root));
        }

        fs::create_dir(&mimic_dir).map_err(|e| MimicError::filesystem(&mimic_dir, e))?;
        File::create(root.join(CHECKSUM_FILE))?;
        info!("Initialized collection at {:?}", root);
        Ok(Self { root })
    }

    /// Open the collection managing `path`, searching ancestors
    pub fn open(path: &Path) -> Result<Self> {
        let root = config::require_root(path)?;
        debug!("Collection root for {:?} is {:?}", path, root);
        Ok(Self { root })
    }

    /// Open `path` only if it is itself a collection root
    pub fn open_exact(path: &Path) -> Option<Self> {
        config::get_root(path).map(|root| Self { root })
    }

    /// Collection root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Manifest file path
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(CHECKSUM_FILE)
    }

    /// Staging file for a fetched remote manifest
    pub fn staging_path(&self) -> PathBuf {
        self.root.join(format!("{}{}", CHECKSUM_FILE, STAGING_SUFFIX))
    }

    /// Bundle file path
    pub fn bundle_path(&self) -> PathBuf {
        self.root.join(BUNDLE_FILE)
    }

    /// Load the manifest, creating an empty one if absent
    pub fn load_manifest(&self) -> Result<Manifest> {
        manifest::load(&self.root)
    }

    /// Replace the manifest
    pub fn store_manifest(&self, records: &Manifest) -> Result<()> {
        manifest::store(&self.root, records)
    }

    /// Load the connection configuration
    pub fn load_config(&self) -> Result<ConnectionConfig> {
        ConnectionConfig::load(&self.root)
    }

    /// Store the connection configuration
    pub fn store_config(&self, config: &ConnectionConfig) -> Result<()> {
        config.store(&self.root)
    }

    /// Merge `settings` into one direction and store the result
    pub fn configure(&self, direction: Direction, settings: HostSettings) -> Result<ConnectionConfig> {
        let mut config = self.load_config()?;
        config.settings_mut(direction).merge(settings);
        self.store_config(&config)?;
        Ok(config)
    }

    /// Settings used for pulling
    ///
    /// Fails with [`MimicError::ConfigurationMissing`] when no `Pull` entry
    /// with a URI exists.
    pub fn pull_settings(&self) -> Result<HostSettings> {
        self.load_config()?
            .settings(Direction::Pull)
            .filter(|s| s.uri.is_some())
            .cloned()
            .ok_or_else(|| MimicError::ConfigurationMissing {
                direction: Direction::Pull.key().to_string(),
                root: self.root.clone(),
            })
    }

    /// File count, folder count and byte total of the stored manifest
    pub fn info(&self) -> Result<InventorySummary> {
        let records = manifest::load_from(&self.manifest_path())?;
        let folders = records.iter().filter(|r| r.is_dir()).count();
        Ok(InventorySummary {
            files: records.len() - folders,
            folders,
            bytes: records.total_bytes(),
        })
    }

    /// Drop every manifest entry whose key starts with `prefix`
    ///
    /// The prefix may be given with or without the leading `./`. Returns the
    /// removed keys; the manifest is only written when `test` is false and
    /// something matched.
    pub fn prune(&self, prefix: &str, test: bool, verbose: bool) -> Result<Vec<String>> {
        let prefix = format!("./{}", utils::trim_key(prefix));
        let mut records = self.load_manifest()?;
        let removed: Vec<String> = records
            .drain_prefix(&prefix)
            .into_iter()
            .map(|r| r.path)
            .collect();

        for key in &removed {
            utils::note(verbose || test, format_args!("Remove: {}", key));
        }
        if !test && !removed.is_empty() {
            self.store_manifest(&records)?;
        }
        Ok(removed)
    }
}
