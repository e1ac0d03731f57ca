//! Bundle manager
//!
//! A bundle file lists nested collection roots, relative to the collection
//! that bundles them:
//!
//! ```text
//! 1600000000000,./instruments/mag
//! 1600000000000,./instruments/plasma
//! ```
//!
//! The recursive drivers ([`refresh_all`], [`add_all`], [`pull_all`],
//! [`clone_all`]) apply one sync operation to every bundled collection, then
//! descend into that collection's own bundle. Traversal is depth-first in
//! bundle key order, and each nested root is visited at most once per call
//! even if several bundle entries resolve to it.
//!
//! [`clone_collection`] creates a collection from a remote one and, when the
//! remote publishes a bundle file, clones the whole nested layout with it.

use crate::collection::Collection;
use crate::config::{self, Direction, HostSettings, BUNDLE_FILE};
use crate::error::{MimicError, Result};
use crate::manifest;
use crate::transfer::Transfer;
use crate::types::{
    AddSummary, BundleList, BundleRecord, RefreshOptions, RefreshReport, ScanOptions, SyncReport,
    TransferOptions,
};
use crate::utils;
use std::collections::HashSet;
use std::fs::{self, File};
use std::future::Future;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tracing::{debug, info, instrument, warn};

/// Parse bundle text, skipping malformed lines with a warning
pub fn parse_bundle<R: BufRead>(reader: R) -> Result<BundleList> {
    let mut list = BundleList::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        match manifest::parse_bundle_record(&line, index + 1) {
            Ok(Some(record)) => {
                list.insert(record.path.clone(), record);
            }
            Ok(None) => {}
            Err(e) => warn!("Skipping bundle line: {}", e),
        }
    }
    Ok(list)
}

/// Render a bundle list, one record per line
pub fn format_bundle(list: &BundleList) -> String {
    list.values().map(|r| format!("{}\n", r)).collect()
}

/// Load a bundle list from an explicit file
pub fn load_from(path: &Path) -> Result<BundleList> {
    parse_bundle(BufReader::new(File::open(path)?))
}

/// Load the bundle list of the collection managing `path`
///
/// A collection without a bundle file has an empty list.
pub fn load(path: &Path) -> Result<BundleList> {
    let root = config::require_root(path)?;
    let bundle_path = root.join(BUNDLE_FILE);
    if !bundle_path.exists() {
        return Ok(BundleList::new());
    }
    load_from(&bundle_path)
}

/// Replace the bundle list of the collection managing `path`
pub fn store(path: &Path, list: &BundleList) -> Result<()> {
    let root = config::require_root(path)?;
    utils::atomic_write(&root.join(BUNDLE_FILE), format_bundle(list).as_bytes())
}

impl Collection {
    /// Bundled collections of this collection
    pub fn load_bundle(&self) -> Result<BundleList> {
        load(self.root())
    }

    /// Replace the bundle list
    pub fn store_bundle(&self, list: &BundleList) -> Result<()> {
        store(self.root(), list)
    }

    /// Bundle key for a path on disk or an existing key
    fn bundle_key(&self, target: &str) -> String {
        let path = Path::new(target);
        if let Ok(canon) = path.canonicalize() {
            if let Ok(relative) = utils::make_relative(&canon, self.root()) {
                return utils::record_key(&relative);
            }
        }
        format!("./{}", utils::trim_key(target))
    }

    /// Reference a nested directory in the bundle list
    ///
    /// The record carries the directory's modified time. Nothing is written
    /// when `test` is set.
    pub fn bundle_add(&self, target: &Path, test: bool) -> Result<BundleRecord> {
        let path = target
            .canonicalize()
            .map_err(|e| MimicError::filesystem(target, e))?;
        let relative = utils::make_relative(&path, self.root())
            .map_err(|_| MimicError::UnsafePath(target.display().to_string()))?;
        if relative.as_os_str().is_empty() {
            return Err(MimicError::custom("A collection cannot bundle itself"));
        }

        let modified = fs::metadata(&path)?.modified().map(utils::to_millis)?;
        let record = BundleRecord {
            modified,
            path: utils::record_key(&relative),
        };

        let mut list = self.load_bundle()?;
        list.insert(record.path.clone(), record.clone());
        if !test {
            self.store_bundle(&list)?;
        }
        Ok(record)
    }

    /// Drop a bundle entry by key or path
    pub fn bundle_remove(&self, target: &str, test: bool) -> Result<Option<BundleRecord>> {
        let key = self.bundle_key(target);
        let mut list = self.load_bundle()?;
        let removed = list.remove(&key);
        if removed.is_some() && !test {
            self.store_bundle(&list)?;
        }
        Ok(removed)
    }
}

/// Operation applied to every bundled collection
#[derive(Debug, Clone)]
pub enum BundleAction {
    /// `refresh` each collection
    Refresh(RefreshOptions),
    /// `add` each collection
    Add(ScanOptions),
    /// Incremental sync with each collection's own `Pull` settings
    Pull(TransferOptions),
    /// Initialize, configure and mirror each collection from the parent's remote
    Clone(TransferOptions),
}

impl BundleAction {
    fn name(&self) -> &'static str {
        match self {
            BundleAction::Refresh(_) => "refresh",
            BundleAction::Add(_) => "add",
            BundleAction::Pull(_) => "pull",
            BundleAction::Clone(_) => "clone",
        }
    }
}

/// What an action produced for one collection
#[derive(Debug)]
pub enum BundleOutcome {
    /// From [`BundleAction::Refresh`]
    Refreshed(RefreshReport),
    /// From [`BundleAction::Add`]
    Added(AddSummary),
    /// From [`BundleAction::Pull`] and [`BundleAction::Clone`]
    Pulled(SyncReport),
}

/// One visited nested collection
#[derive(Debug)]
pub struct BundleVisit {
    /// Nested collection root
    pub root: PathBuf,
    /// Outcome; a failure here does not stop the traversal
    pub result: Result<BundleOutcome>,
}

/// Result of cloning a remote collection
#[derive(Debug)]
pub struct CloneReport {
    /// Local root created
    pub root: PathBuf,
    /// Initial pull of the top collection
    pub report: SyncReport,
    /// Nested collections cloned through the remote bundle
    pub nested: Vec<BundleVisit>,
}

type Descent<'a> = Pin<Box<dyn Future<Output = Result<()>> + 'a>>;

/// Depth-first walk state for one top-level call
struct Traversal {
    visited: HashSet<PathBuf>,
    visits: Vec<BundleVisit>,
}

impl Traversal {
    fn new(top: &Path) -> Self {
        let mut visited = HashSet::new();
        visited.insert(top.to_path_buf());
        Self {
            visited,
            visits: Vec::new(),
        }
    }

    fn descend<'a>(
        &'a mut self,
        parent: &'a Collection,
        list: BundleList,
        action: &'a BundleAction,
    ) -> Descent<'a> {
        Box::pin(async move {
            for record in list.values() {
                let path = match utils::resolve_key(parent.root(), &record.path) {
                    Ok(path) => path,
                    Err(e) => {
                        warn!("Skipping bundle entry: {}", e);
                        continue;
                    }
                };

                let nested = match Collection::open_exact(&path) {
                    Some(nested) => nested,
                    None if matches!(action, BundleAction::Clone(_)) => {
                        match Collection::init(&path) {
                            Ok(nested) => nested,
                            Err(e) => {
                                self.visits.push(BundleVisit { root: path, result: Err(e) });
                                continue;
                            }
                        }
                    }
                    None => {
                        warn!("Bundled folder {:?} is not a collection root", path);
                        continue;
                    }
                };

                if !self.visited.insert(nested.root().to_path_buf()) {
                    debug!("Already visited {:?}", nested.root());
                    continue;
                }

                info!("Bundle {}: {}", action.name(), record.path);
                let result = run(parent, &nested, record, action).await;
                if let Err(e) = &result {
                    warn!("Bundle {} failed for {}: {}", action.name(), record.path, e);
                }
                self.visits.push(BundleVisit {
                    root: nested.root().to_path_buf(),
                    result,
                });

                match nested.load_bundle() {
                    Ok(inner) if !inner.is_empty() => self.descend(&nested, inner, action).await?,
                    Ok(_) => {}
                    Err(e) => warn!("Unable to read bundle of {:?}: {}", nested.root(), e),
                }
            }
            Ok(())
        })
    }
}

/// Settings for a nested collection derived from its parent's
fn nested_settings(parent: &Collection, record: &BundleRecord) -> Result<HostSettings> {
    let mut settings = parent.pull_settings()?;
    let parent_uri = settings.uri.clone().unwrap_or_default();
    settings.uri = Some(utils::resource_url(&parent_uri, &record.path)?.to_string());
    Ok(settings)
}

/// Fetch the remote bundle file, if the remote publishes one
async fn fetch_remote_bundle(collection: &Collection, settings: &HostSettings) -> Result<bool> {
    let transfer = Transfer::from_settings(settings)?;
    let dest = collection.bundle_path();
    match transfer.fetch(BUNDLE_FILE, &dest).await {
        Ok(_) => Ok(true),
        Err(e) => {
            debug!("No remote bundle for {:?}: {}", collection.root(), e);
            let _ = fs::remove_file(&dest);
            Ok(false)
        }
    }
}

async fn run(
    parent: &Collection,
    nested: &Collection,
    record: &BundleRecord,
    action: &BundleAction,
) -> Result<BundleOutcome> {
    match action {
        BundleAction::Refresh(opts) => nested.refresh(nested.root(), opts).map(BundleOutcome::Refreshed),
        BundleAction::Add(opts) => nested.add(nested.root(), opts).map(BundleOutcome::Added),
        BundleAction::Pull(opts) => nested.sync_pull(opts).await.map(BundleOutcome::Pulled),
        BundleAction::Clone(opts) => {
            let settings = nested_settings(parent, record)?;
            let mut config = nested.load_config()?;
            config.pull = Some(settings.clone());
            nested.store_config(&config)?;

            let report = if nested.load_manifest()?.is_empty() {
                nested.pull(&settings, opts).await?
            } else {
                nested.sync_with_pull(&settings, opts).await?
            };
            fetch_remote_bundle(nested, &settings).await?;
            Ok(BundleOutcome::Pulled(report))
        }
    }
}

/// Apply `action` to every collection reachable through `list`
pub async fn perform(
    collection: &Collection,
    list: BundleList,
    action: &BundleAction,
) -> Result<Vec<BundleVisit>> {
    let mut traversal = Traversal::new(collection.root());
    traversal.descend(collection, list, action).await?;
    Ok(traversal.visits)
}

/// Refresh every bundled collection, depth-first
#[instrument(skip(collection, opts), fields(root = ?collection.root()))]
pub async fn refresh_all(collection: &Collection, opts: &RefreshOptions) -> Result<Vec<BundleVisit>> {
    let list = collection.load_bundle()?;
    perform(collection, list, &BundleAction::Refresh(opts.clone())).await
}

/// Add new entries in every bundled collection, depth-first
#[instrument(skip(collection, opts), fields(root = ?collection.root()))]
pub async fn add_all(collection: &Collection, opts: &ScanOptions) -> Result<Vec<BundleVisit>> {
    let list = collection.load_bundle()?;
    perform(collection, list, &BundleAction::Add(opts.clone())).await
}

/// Sync every bundled collection from its own remote, depth-first
#[instrument(skip(collection, opts), fields(root = ?collection.root()))]
pub async fn pull_all(collection: &Collection, opts: &TransferOptions) -> Result<Vec<BundleVisit>> {
    let list = collection.load_bundle()?;
    perform(collection, list, &BundleAction::Pull(opts.clone())).await
}

/// Clone every collection in `list` below `collection`, depth-first
///
/// Each nested remote URI is the parent's URI joined with the bundle path.
#[instrument(skip(collection, list, opts), fields(root = ?collection.root()))]
pub async fn clone_all(
    collection: &Collection,
    list: BundleList,
    opts: &TransferOptions,
) -> Result<Vec<BundleVisit>> {
    perform(collection, list, &BundleAction::Clone(opts.clone())).await
}

/// Create a collection at `path` mirroring a remote collection
///
/// Only the pull direction is supported. Fails with
/// [`MimicError::AlreadyInitialized`] if `path` is already a collection root.
#[instrument(skip(settings, opts), fields(uri = ?settings.uri))]
pub async fn clone_collection(
    path: &Path,
    direction: Direction,
    settings: HostSettings,
    opts: &TransferOptions,
) -> Result<CloneReport> {
    if direction == Direction::Push {
        return Err(MimicError::PushNotImplemented);
    }
    // Validate before touching the filesystem
    Transfer::from_settings(&settings)?;

    let collection = Collection::init(path)?;
    collection.configure(Direction::Pull, settings)?;
    let settings = collection.pull_settings()?;
    let report = collection.pull(&settings, opts).await?;

    let nested = if fetch_remote_bundle(&collection, &settings).await? {
        let list = collection.load_bundle()?;
        clone_all(&collection, list, opts).await?
    } else {
        Vec::new()
    };

    Ok(CloneReport {
        root: collection.root().to_path_buf(),
        report,
        nested,
    })
}
