//! Sync engine
//!
//! Reconciles a collection with the live filesystem ([`Collection::add`],
//! [`Collection::refresh`], [`Collection::status`]) and with a remote copy
//! ([`Collection::pull`], [`Collection::sync_with_pull`],
//! [`Collection::sync_pull`], [`download`]).
//!
//! ## Remote phases
//!
//! Every remote operation runs the same strictly sequential phases, each of
//! which fans its items out concurrently (bounded by
//! [`TransferOptions::max_concurrency`]) and joins them all before the next
//! phase starts:
//!
//! 1. delete divergent local entries, deepest paths first
//! 2. create directories
//! 3. fetch files through the [`Transfer`] selected by the URI scheme
//! 4. restamp directory modification times
//! 5. commit the remote manifest, only if no item failed
//!
//! Directory times are fixed last because creating children updates the
//! parent's modification time. The manifest commit is the only write that
//! makes a pass visible; an interrupted or partially failed pass leaves the
//! previous manifest in place so the next pass sees the divergence.

use crate::checksum;
use crate::collection::Collection;
use crate::config::{HostSettings, CHECKSUM_FILE, MIMIC_DIR};
use crate::error::{MimicError, Result};
use crate::manifest;
use crate::transfer::{Transfer, TransferOutcome};
use crate::types::{
    AddSummary, Manifest, ManifestRecord, RefreshOptions, RefreshReport, ScanOptions, SyncReport,
    TestMode, TransferOptions,
};
use crate::utils;
use crate::walker::{DirWalker, WalkEntry};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

/// Work derived from comparing two manifests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// Records to bring over, ascending path order
    pub copy: Vec<ManifestRecord>,
    /// Local records to remove, descending path order
    pub delete: Vec<ManifestRecord>,
    /// Directory records whose times are set after all transfers
    pub restamp: Vec<ManifestRecord>,
}

impl SyncPlan {
    /// Plan that mirrors every record of `records` without deleting anything
    pub fn mirror(records: &Manifest) -> Self {
        let (restamp, _) = records.partition();
        Self {
            copy: records.iter().cloned().collect(),
            delete: Vec::new(),
            restamp,
        }
    }

    /// Whether the plan has nothing to do
    pub fn is_empty(&self) -> bool {
        self.copy.is_empty() && self.delete.is_empty()
    }
}

/// Compare a local manifest with a remote one
///
/// A remote record is copied when the local side lacks it or holds a
/// different record. A local record is deleted when the remote side lacks it
/// or holds a different record. Records are compared field by field.
pub fn diff(local: &Manifest, remote: &Manifest) -> SyncPlan {
    let copy = remote
        .iter()
        .filter(|r| local.get(&r.path) != Some(*r))
        .cloned()
        .collect();
    let delete = local
        .descending()
        .filter(|r| remote.get(&r.path) != Some(*r))
        .cloned()
        .collect();
    let (restamp, _) = remote.partition();
    SyncPlan { copy, delete, restamp }
}

/// Group deletions so that every entry is removed before its ancestors
///
/// Waves are ordered deepest first; within a wave records keep descending
/// path order. Entries of one wave never contain each other.
pub fn deletion_waves(records: &[ManifestRecord]) -> Vec<Vec<ManifestRecord>> {
    let mut by_depth: BTreeMap<usize, Vec<ManifestRecord>> = BTreeMap::new();
    for record in records {
        let depth = utils::trim_key(&record.path).split('/').count();
        by_depth.entry(depth).or_default().push(record.clone());
    }
    by_depth
        .into_values()
        .rev()
        .map(|mut wave| {
            wave.sort_by(|a, b| b.path.cmp(&a.path));
            wave
        })
        .collect()
}

/// Drop remote records that could write outside the collection home or into
/// its `.mimic` folder
fn sanitize(records: Manifest, home: &Path) -> Manifest {
    records
        .iter()
        .filter(|r| {
            let key = utils::trim_key(&r.path);
            let safe = !key.is_empty()
                && key.split('/').next() != Some(MIMIC_DIR)
                && utils::resolve_key(home, &r.path).is_ok();
            if !safe {
                warn!("Ignoring unsafe remote record '{}'", r.path);
            }
            safe
        })
        .cloned()
        .collect()
}

/// Run one phase: start a task per item, at most `limit` at a time, and
/// join them all in input order
///
/// Every task is joined even when one of them panics; the first join error is
/// returned afterwards.
async fn fan_out<I, F, Fut>(items: Vec<I>, limit: usize, task: F) -> Result<Vec<Fut::Output>>
where
    F: Fn(I) -> Fut,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut handles = Vec::with_capacity(items.len());

    for item in items {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| MimicError::internal(e.to_string()))?;
        let job = task(item);
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            job.await
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    let mut first_error = None;
    for handle in handles {
        match handle.await {
            Ok(output) => results.push(output),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e.into()),
        None => Ok(results),
    }
}

/// Outcome of one local mutation
#[derive(Debug)]
enum Step {
    Done,
    Skipped,
    Failed(MimicError),
}

/// Keep going past an item-local failure, abort on anything else
fn tolerate(error: MimicError, action: &str, record: &ManifestRecord) -> Result<()> {
    if error.is_item_local() {
        warn!("Unable to {} {}: {}", action, record.path, error);
        Ok(())
    } else {
        Err(error)
    }
}

fn remove_local(home: &Path, record: &ManifestRecord, verbose: bool) -> Step {
    let path = match utils::resolve_key(home, &record.path) {
        Ok(path) => path,
        Err(e) => return Step::Failed(e),
    };
    match utils::remove_entry(&path, record.is_dir()) {
        Ok(true) => {
            utils::note(verbose, format_args!("Removed: {}", record.path));
            Step::Done
        }
        Ok(false) => Step::Skipped,
        Err(e) if record.is_dir() => {
            // Still holds entries that are kept or untracked
            debug!("Folder {} not removed: {}", record.path, e);
            Step::Skipped
        }
        Err(e) => Step::Failed(e),
    }
}

fn create_folder(home: &Path, record: &ManifestRecord, verbose: bool) -> Step {
    let path = match utils::resolve_key(home, &record.path) {
        Ok(path) => path,
        Err(e) => return Step::Failed(e),
    };
    if path.is_dir() {
        return Step::Skipped;
    }
    match std::fs::create_dir_all(&path) {
        Ok(()) => {
            utils::note(verbose, format_args!("Created: {}", record.path));
            Step::Done
        }
        Err(e) => Step::Failed(MimicError::filesystem(&path, e)),
    }
}

fn restamp_folder(home: &Path, record: &ManifestRecord) {
    let stamped = utils::resolve_key(home, &record.path)
        .and_then(|path| utils::stamp(&path, record.modified));
    if let Err(e) = stamped {
        warn!("Unable to set time on {}: {}", record.path, e);
    }
}

/// Execute the delete, create, fetch and restamp phases of a plan
#[instrument(skip(transfer, plan, opts), fields(copy = plan.copy.len(), delete = plan.delete.len()))]
async fn apply(
    home: &Path,
    transfer: Arc<Transfer>,
    plan: SyncPlan,
    opts: &TransferOptions,
) -> Result<SyncReport> {
    let mut report = SyncReport::default();
    let limit = opts.max_concurrency;
    let verbose = opts.verbose;
    let home = Arc::new(home.to_path_buf());

    // Phase 1: deletions, children before parents
    for wave in deletion_waves(&plan.delete) {
        let steps = fan_out(wave.clone(), limit, |record| {
            let home = home.clone();
            async move { remove_local(&home, &record, verbose) }
        })
        .await?;
        for (record, step) in wave.iter().zip(steps) {
            match step {
                Step::Done => report.removed += 1,
                Step::Skipped => {}
                Step::Failed(e) => tolerate(e, "remove", record)?,
            }
        }
    }

    let (folders, files): (Vec<ManifestRecord>, Vec<ManifestRecord>) =
        plan.copy.into_iter().partition(ManifestRecord::is_dir);

    // Phase 2: folders
    let steps = fan_out(folders.clone(), limit, |record| {
        let home = home.clone();
        async move { create_folder(&home, &record, verbose) }
    })
    .await?;
    for (record, step) in folders.iter().zip(steps) {
        match step {
            Step::Done => report.created += 1,
            Step::Skipped => {}
            Step::Failed(e) => {
                tolerate(e, "create", record)?;
                report.failed.push(record.path.clone());
            }
        }
    }

    // Phase 3: files
    let outcomes: Vec<TransferOutcome> = fan_out(files, limit, |record| {
        let home = home.clone();
        let transfer = transfer.clone();
        async move { transfer.fetch_record(&home, &record).await }
    })
    .await?;
    for outcome in outcomes {
        if outcome.is_failure() {
            report.failed.push(outcome.name);
        } else {
            utils::note(verbose, format_args!("Copied: {}", outcome.name));
            report.copied += 1;
            report.bytes += outcome.bytes;
        }
    }

    // Phase 4: folder times
    fan_out(plan.restamp, limit, |record| {
        let home = home.clone();
        async move { restamp_folder(&home, &record) }
    })
    .await?;

    Ok(report)
}

/// Which manifest keys a walk covers
#[derive(Debug, Clone)]
struct Scope {
    /// Root-relative base without `./`, empty for the whole collection
    base: String,
    /// Target is a single file
    single: bool,
    recursive: bool,
    exclude: Vec<String>,
}

impl Scope {
    fn new(root: &Path, target: &Path, opts: &ScanOptions) -> Result<Self> {
        let relative = utils::make_relative(target, root)?;
        Ok(Self {
            base: utils::trim_key(&utils::record_key(&relative)).to_string(),
            single: target.is_file(),
            recursive: opts.recurse,
            exclude: opts
                .exclude
                .iter()
                .map(|p| utils::trim_key(p).to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        })
    }

    /// Whether the walk could have produced this record
    fn contains(&self, record: &ManifestRecord) -> bool {
        let key = utils::trim_key(&record.path);
        if key.is_empty() || self.exclude.iter().any(|p| key.starts_with(p.as_str())) {
            return false;
        }
        if self.single {
            return key == self.base;
        }
        let rest = if self.base.is_empty() {
            key
        } else {
            match key
                .strip_prefix(self.base.as_str())
                .and_then(|r| r.strip_prefix('/'))
            {
                Some(rest) => rest,
                None => return false,
            }
        };
        let parts: Vec<&str> = rest.split('/').collect();
        let Some((last, parents)) = parts.split_last() else {
            return false;
        };
        if parents.iter().any(|p| p.starts_with('.')) || (record.is_dir() && last.starts_with('.')) {
            return false;
        }
        self.recursive || parents.is_empty()
    }
}

/// Build a new record for a walked entry
fn record_for(entry: &WalkEntry) -> Result<ManifestRecord> {
    if entry.is_dir {
        Ok(ManifestRecord::directory(entry.modified, entry.key.clone()))
    } else {
        let digest = checksum::digest_file(&entry.path)?;
        Ok(ManifestRecord::file(entry.size, entry.modified, digest, entry.key.clone()))
    }
}

fn resolve_target(target: &Path) -> Result<PathBuf> {
    target.canonicalize().map_err(|e| MimicError::filesystem(target, e))
}

impl Collection {
    fn walker(&self, target: &Path, opts: &ScanOptions) -> DirWalker {
        DirWalker::new(self.root(), target)
            .with_recursion(opts.recurse)
            .with_exclusions(opts.exclude.clone())
    }

    /// Track entries below `target` that are not in the manifest yet
    ///
    /// Existing records are never touched.
    #[instrument(skip(self, opts), fields(root = ?self.root()))]
    pub fn add(&self, target: &Path, opts: &ScanOptions) -> Result<AddSummary> {
        let target = resolve_target(target)?;
        let mut records = self.load_manifest()?;
        let mut summary = AddSummary::default();
        let apply = opts.test_mode.applies();

        for item in self.walker(&target, opts).entries() {
            let entry = match item {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping entry: {}", e);
                    continue;
                }
            };
            if records.contains(&entry.key) {
                continue;
            }
            if apply {
                match record_for(&entry) {
                    Ok(record) => {
                        records.insert(record);
                    }
                    Err(e) => {
                        warn!("Unable to add {}: {}", entry.key, e);
                        continue;
                    }
                }
            }
            if entry.is_dir {
                summary.folders += 1;
            } else {
                summary.files += 1;
            }
            utils::note(opts.verbose || !apply, format_args!("New: {}", entry.key));
            summary.added.push(entry.key);
        }

        if apply && !summary.added.is_empty() {
            self.store_manifest(&records)?;
            summary.stored = true;
        }
        info!(
            "Add found {} folder(s) and {} file(s)",
            summary.folders, summary.files
        );
        Ok(summary)
    }

    /// Reconcile the manifest with the filesystem below `target`
    ///
    /// New entries are added, entries whose size or modified time changed are
    /// updated, and unless `quick` file digests are recomputed and compared.
    /// Tracked entries inside the walked scope that no longer exist are
    /// removed; records outside the scope are kept as they are.
    #[instrument(skip(self, opts), fields(root = ?self.root(), quick = opts.quick))]
    pub fn refresh(&self, target: &Path, opts: &RefreshOptions) -> Result<RefreshReport> {
        let target = resolve_target(target)?;
        let scan = &opts.scan;
        let scope = Scope::new(self.root(), &target, scan)?;
        let old = self.load_manifest()?;
        let apply = scan.test_mode.applies();
        let loud = scan.verbose || !apply;

        if scan.verbose && !opts.quick {
            info!("Inspecting checksums can take a while; quick mode skips them");
        }
        debug!("Checking {} record(s)", old.len());

        let mut fresh = Manifest::new();
        let mut report = RefreshReport::default();

        for item in self.walker(&target, scan).entries() {
            let entry = match item {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping entry: {}", e);
                    continue;
                }
            };
            report.scanned.count(entry.is_dir);

            let Some(previous) = old.get(&entry.key) else {
                match record_for(&entry) {
                    Ok(record) => {
                        fresh.insert(record);
                    }
                    Err(e) => {
                        warn!("Unable to add {}: {}", entry.key, e);
                        continue;
                    }
                }
                report.added.count(entry.is_dir);
                utils::note(loud, format_args!("New: {}", entry.key));
                report.added_paths.push(entry.key);
                continue;
            };

            let mut record = previous.clone();
            let mut changed = false;
            if previous.is_dir() != entry.is_dir {
                match record_for(&entry) {
                    Ok(replacement) => record = replacement,
                    Err(e) => warn!("Unable to inspect {}: {}", entry.key, e),
                }
                changed = true;
            } else {
                if previous.modified != entry.modified || previous.length != entry.size {
                    record.modified = entry.modified;
                    record.length = entry.size;
                    changed = true;
                }
                if !opts.quick && !entry.is_dir {
                    match checksum::digest_file(&entry.path) {
                        Ok(digest) if digest != previous.checksum => {
                            record.checksum = digest;
                            changed = true;
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Unable to digest {}: {}", entry.key, e),
                    }
                }
            }

            if changed {
                report.updated.count(entry.is_dir);
                utils::note(loud, format_args!("Update: {}", entry.key));
                report.updated_paths.push(entry.key.clone());
            } else if scan.test_mode == TestMode::Status {
                utils::note(scan.verbose, format_args!("OK: {}", entry.key));
                report.unchanged_paths.push(entry.key.clone());
            }
            fresh.insert(record);
        }

        for record in &old {
            if fresh.contains(&record.path) {
                continue;
            }
            if scope.contains(record) {
                report.removed.count(record.is_dir());
                utils::note(loud, format_args!("Remove: {}", record.path));
                report.removed_paths.push(record.path.clone());
            } else {
                fresh.insert(record.clone());
            }
        }

        if apply && report.has_changes() {
            self.store_manifest(&fresh)?;
            report.stored = true;
        }
        info!(
            "Refresh scanned {} entries: {} added, {} removed, {} updated",
            report.scanned.total(),
            report.added.total(),
            report.removed.total(),
            report.updated.total()
        );
        Ok(report)
    }

    /// Report differences without writing, listing unchanged entries too
    pub fn status(&self, target: &Path, opts: &RefreshOptions) -> Result<RefreshReport> {
        let mut opts = opts.clone();
        opts.scan.test_mode = TestMode::Status;
        self.refresh(target, &opts)
    }

    /// Fetch the remote manifest into the staging file and load it
    async fn fetch_remote_manifest(&self, transfer: &Transfer) -> Result<Manifest> {
        let staging = self.staging_path();
        if let Err(e) = transfer.fetch(CHECKSUM_FILE, &staging).await {
            let _ = std::fs::remove_file(&staging);
            return Err(e);
        }
        let remote = manifest::load_from(&staging)?;
        debug!("Remote manifest has {} record(s)", remote.len());
        Ok(sanitize(remote, self.root()))
    }

    /// Store the remote manifest if every item succeeded, then drop staging
    fn commit(&self, remote: &Manifest, report: &mut SyncReport) -> Result<()> {
        if report.is_complete() {
            self.store_manifest(remote)?;
            report.committed = true;
        } else {
            warn!(
                "{} item(s) failed; manifest left unchanged",
                report.failed.len()
            );
        }
        utils::remove_entry(&self.staging_path(), false)?;
        Ok(())
    }

    /// Initial full mirror of a remote collection
    #[instrument(skip(self, settings, opts), fields(root = ?self.root(), uri = ?settings.uri))]
    pub async fn pull(&self, settings: &HostSettings, opts: &TransferOptions) -> Result<SyncReport> {
        let transfer = Arc::new(Transfer::from_settings(settings)?);
        let remote = self.fetch_remote_manifest(&transfer).await?;

        let mut report = apply(self.root(), transfer, SyncPlan::mirror(&remote), opts).await?;
        self.commit(&remote, &mut report)?;
        Ok(report)
    }

    /// Incremental sync against a remote collection
    ///
    /// Only divergent records are deleted and fetched. The remote manifest
    /// becomes the local manifest when every item succeeded.
    #[instrument(skip(self, settings, opts), fields(root = ?self.root(), uri = ?settings.uri))]
    pub async fn sync_with_pull(
        &self,
        settings: &HostSettings,
        opts: &TransferOptions,
    ) -> Result<SyncReport> {
        let transfer = Arc::new(Transfer::from_settings(settings)?);
        let remote = self.fetch_remote_manifest(&transfer).await?;
        let local = self.load_manifest()?;

        let plan = diff(&local, &remote);
        debug!(
            "Sync plan: {} to copy, {} to delete",
            plan.copy.len(),
            plan.delete.len()
        );
        let mut report = apply(self.root(), transfer, plan, opts).await?;
        self.commit(&remote, &mut report)?;
        Ok(report)
    }

    /// Incremental sync using the stored `Pull` settings
    pub async fn sync_pull(&self, opts: &TransferOptions) -> Result<SyncReport> {
        let settings = self.pull_settings()?;
        self.sync_with_pull(&settings, opts).await
    }
}

/// Fetch an ad hoc package described by a directive file into `home`
///
/// The header's `uri` names the source; the records are mirrored below
/// `home`, which need not be a collection. No manifest is written.
#[instrument(skip(opts))]
pub async fn download(
    home: &Path,
    package: &Path,
    username: Option<&str>,
    key_file: Option<&str>,
    opts: &TransferOptions,
) -> Result<SyncReport> {
    let (directive, records) = manifest::load_package(package)?;
    std::fs::create_dir_all(home).map_err(|e| MimicError::filesystem(home, e))?;
    let home = home.canonicalize()?;

    let transfer = Arc::new(Transfer::from_uri(&directive.uri, username, key_file)?);
    let records = sanitize(records, &home);
    apply(&home, transfer, SyncPlan::mirror(&records), opts).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn manifest(records: Vec<ManifestRecord>) -> Manifest {
        records.into_iter().collect()
    }

    #[test]
    fn test_diff_example() {
        let local = manifest(vec![ManifestRecord::file(10, 100, "aaaa", "./x")]);
        let remote = manifest(vec![
            ManifestRecord::file(10, 200, "aaaa", "./x"),
            ManifestRecord::file(5, 50, "bbbb", "./y"),
        ]);

        let plan = diff(&local, &remote);
        let copy: Vec<&str> = plan.copy.iter().map(|r| r.path.as_str()).collect();
        let delete: Vec<&str> = plan.delete.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(copy, vec!["./x", "./y"]);
        assert_eq!(delete, vec!["./x"]);
    }

    #[test]
    fn test_diff_converged_is_empty() {
        let same = manifest(vec![
            ManifestRecord::directory(1, "./a"),
            ManifestRecord::file(3, 2, "cc", "./a/b"),
        ]);
        let plan = diff(&same, &same);
        assert!(plan.is_empty());
        assert_eq!(plan.restamp.len(), 1);
    }

    #[test]
    fn test_deletion_waves_children_first() {
        let records = vec![
            ManifestRecord::directory(1, "./a"),
            ManifestRecord::file(1, 1, "bb", "./a/b.txt"),
            ManifestRecord::directory(1, "./a/c"),
            ManifestRecord::file(1, 1, "dd", "./a/c/d.txt"),
            ManifestRecord::file(1, 1, "ee", "./e.txt"),
        ];
        let waves = deletion_waves(&records);
        let wave_of = |path: &str| {
            waves
                .iter()
                .position(|w| w.iter().any(|r| r.path == path))
                .unwrap()
        };
        assert!(wave_of("./a/b.txt") < wave_of("./a"));
        assert!(wave_of("./a/c/d.txt") < wave_of("./a/c"));
        assert!(wave_of("./a/c") < wave_of("./a"));
        assert_eq!(waves.iter().map(Vec::len).sum::<usize>(), records.len());
    }

    #[test]
    fn test_sanitize_drops_escaping_records() {
        let records = manifest(vec![
            ManifestRecord::file(1, 1, "aa", "./ok.txt"),
            ManifestRecord::file(1, 1, "bb", "./../evil.txt"),
            ManifestRecord::directory(1, "./"),
        ]);
        let safe = sanitize(records, Path::new("/home/data"));
        assert_eq!(safe.len(), 1);
        assert!(safe.contains("./ok.txt"));
    }

    #[test]
    fn test_scope_rules() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("b/deep")).unwrap();
        let opts = ScanOptions::default();

        let whole = Scope::new(&root, &root, &opts).unwrap();
        assert!(whole.contains(&ManifestRecord::file(1, 1, "aa", "./b/deep/x")));
        assert!(!whole.contains(&ManifestRecord::file(1, 1, "aa", "./.mimic/checksum.mimic")));
        assert!(!whole.contains(&ManifestRecord::file(1, 1, "aa", "./.git/config")));
        assert!(whole.contains(&ManifestRecord::file(1, 1, "aa", "./.hidden")));

        let sub = Scope::new(&root, &root.join("b"), &opts).unwrap();
        assert!(sub.contains(&ManifestRecord::file(1, 1, "aa", "./b/deep/x")));
        assert!(!sub.contains(&ManifestRecord::file(1, 1, "aa", "./bb/x")));
        assert!(!sub.contains(&ManifestRecord::directory(1, "./b")));

        let shallow_opts = ScanOptions { recurse: false, ..ScanOptions::default() };
        let shallow = Scope::new(&root, &root, &shallow_opts).unwrap();
        assert!(shallow.contains(&ManifestRecord::directory(1, "./b")));
        assert!(!shallow.contains(&ManifestRecord::file(1, 1, "aa", "./b/x")));
    }

    fn sample_collection() -> (TempDir, Collection) {
        let temp_dir = TempDir::new().unwrap();
        let collection = Collection::init(temp_dir.path()).unwrap();
        fs::write(temp_dir.path().join("a.txt"), b"0123456789").unwrap();
        fs::create_dir(temp_dir.path().join("b")).unwrap();
        fs::write(temp_dir.path().join("b/c.txt"), b"12345").unwrap();
        (temp_dir, collection)
    }

    #[test]
    fn test_add_tracks_new_entries_once() {
        let (temp_dir, collection) = sample_collection();
        let summary = collection.add(temp_dir.path(), &ScanOptions::default()).unwrap();
        assert_eq!((summary.folders, summary.files), (1, 2));
        assert!(summary.stored);

        let records = collection.load_manifest().unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.get("./b").unwrap().is_dir());
        assert_eq!(
            records.get("./a.txt").unwrap().checksum,
            checksum::digest_bytes(b"0123456789")
        );

        let again = collection.add(temp_dir.path(), &ScanOptions::default()).unwrap();
        assert!(again.added.is_empty());
        assert!(!again.stored);
    }

    #[test]
    fn test_add_dry_run_writes_nothing() {
        let (temp_dir, collection) = sample_collection();
        let opts = ScanOptions { test_mode: TestMode::DryRun, ..ScanOptions::default() };
        let summary = collection.add(temp_dir.path(), &opts).unwrap();
        assert_eq!(summary.added.len(), 3);
        assert!(collection.load_manifest().unwrap().is_empty());
    }

    #[test]
    fn test_add_single_file() {
        let (temp_dir, collection) = sample_collection();
        let summary = collection
            .add(&temp_dir.path().join("b/c.txt"), &ScanOptions::default())
            .unwrap();
        assert_eq!(summary.added, vec!["./b/c.txt".to_string()]);
    }

    #[test]
    fn test_refresh_is_idempotent() {
        let (temp_dir, collection) = sample_collection();
        let opts = RefreshOptions::default();
        let first = collection.refresh(temp_dir.path(), &opts).unwrap();
        assert_eq!(first.added.total(), 3);

        let second = collection.refresh(temp_dir.path(), &opts).unwrap();
        assert!(!second.has_changes());
        assert!(!second.stored);
        assert_eq!(second.scanned.total(), 3);
    }

    #[test]
    fn test_refresh_digest_catches_same_metadata_change() {
        let (temp_dir, collection) = sample_collection();
        collection.add(temp_dir.path(), &ScanOptions::default()).unwrap();

        // Same length, same pinned time, different content
        let file = temp_dir.path().join("a.txt");
        let modified = collection.load_manifest().unwrap().get("./a.txt").unwrap().modified;
        fs::write(&file, b"abcdefghij").unwrap();
        utils::stamp(&file, modified).unwrap();

        let quick = RefreshOptions { quick: true, ..RefreshOptions::default() };
        let report = collection.status(temp_dir.path(), &quick).unwrap();
        assert!(!report.has_changes());
        assert!(report.unchanged_paths.contains(&"./a.txt".to_string()));

        let report = collection.refresh(temp_dir.path(), &RefreshOptions::default()).unwrap();
        assert_eq!(report.updated.files, 1);
        assert_eq!(report.updated_paths, vec!["./a.txt".to_string()]);
    }

    #[test]
    fn test_refresh_subtree_keeps_outside_records() {
        let (temp_dir, collection) = sample_collection();
        collection.add(temp_dir.path(), &ScanOptions::default()).unwrap();

        let report = collection
            .refresh(&temp_dir.path().join("b"), &RefreshOptions::default())
            .unwrap();
        assert_eq!(report.scanned.total(), 1);
        assert!(!report.has_changes());
        assert_eq!(collection.load_manifest().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_sync_pull_requires_settings() {
        let (_temp_dir, collection) = sample_collection();
        let result = collection.sync_pull(&TransferOptions::default()).await;
        assert!(matches!(result, Err(MimicError::ConfigurationMissing { .. })));
    }

    #[tokio::test]
    async fn test_pull_unsupported_protocol() {
        let (_temp_dir, collection) = sample_collection();
        let settings = HostSettings::new("gopher://h/data", "anonymous");
        let result = collection.pull(&settings, &TransferOptions::default()).await;
        assert!(matches!(result, Err(MimicError::UnsupportedProtocol(_))));
    }

    #[tokio::test]
    async fn test_unreachable_remote_leaves_manifest() {
        let (temp_dir, collection) = sample_collection();
        collection.add(temp_dir.path(), &ScanOptions::default()).unwrap();
        let before = collection.load_manifest().unwrap();

        let settings = HostSettings::new("http://127.0.0.1:9/none", "anonymous");
        assert!(collection
            .sync_with_pull(&settings, &TransferOptions::default())
            .await
            .is_err());
        assert_eq!(collection.load_manifest().unwrap(), before);
        assert!(!collection.staging_path().exists());
    }

    #[tokio::test]
    async fn test_apply_deletes_local_only_entries() {
        let temp_dir = TempDir::new().unwrap();
        let home = temp_dir.path();
        fs::create_dir_all(home.join("a/c")).unwrap();
        fs::write(home.join("a/b.txt"), b"b").unwrap();
        fs::write(home.join("a/c/d.txt"), b"d").unwrap();

        let local = manifest(vec![
            ManifestRecord::directory(1, "./a"),
            ManifestRecord::file(1, 1, "bb", "./a/b.txt"),
            ManifestRecord::directory(1, "./a/c"),
            ManifestRecord::file(1, 1, "dd", "./a/c/d.txt"),
        ]);
        let plan = diff(&local, &Manifest::new());
        let transfer = Arc::new(Transfer::from_uri("http://127.0.0.1:9/none", None, None).unwrap());
        let opts = TransferOptions::default().with_max_concurrency(4);

        let report = apply(home, transfer, plan, &opts).await.unwrap();
        assert_eq!(report.removed, 4);
        assert!(report.is_complete());
        assert!(!home.join("a").exists());
    }

    #[tokio::test]
    async fn test_apply_records_blocked_folder_and_continues() {
        let temp_dir = TempDir::new().unwrap();
        let home = temp_dir.path();
        fs::write(home.join("blocked"), b"file").unwrap();

        let remote = manifest(vec![
            ManifestRecord::directory(1_600_000_000_000, "./blocked"),
            ManifestRecord::directory(1_600_000_000_000, "./open"),
            ManifestRecord::directory(1_600_000_000_000, "./open/inner"),
        ]);
        let plan = diff(&Manifest::new(), &remote);
        let transfer = Arc::new(Transfer::from_uri("http://127.0.0.1:9/none", None, None).unwrap());
        let opts = TransferOptions::default().with_max_concurrency(4);

        let report = apply(home, transfer, plan, &opts).await.unwrap();
        assert_eq!(report.failed, vec!["./blocked".to_string()]);
        assert_eq!(report.created, 2);
        assert!(!report.is_complete());
        assert!(home.join("open/inner").is_dir());
        assert!(home.join("blocked").is_file());
    }

    #[test]
    fn test_tolerate_only_item_local_errors() {
        let record = ManifestRecord::directory(1, "./a");
        let local = MimicError::filesystem(Path::new("/x/a"), std::io::Error::other("denied"));
        assert!(tolerate(local, "create", &record).is_ok());

        let fatal = MimicError::UnsupportedProtocol("gopher".into());
        assert!(matches!(
            tolerate(fatal, "create", &record),
            Err(MimicError::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn test_sanitize_drops_mimic_dir_records() {
        let records = manifest(vec![
            ManifestRecord::file(1, 1, "aa", "./ok.txt"),
            ManifestRecord::file(1, 1, "bb", "./.mimic/config"),
            ManifestRecord::directory(1, "./.mimic"),
            ManifestRecord::file(1, 1, "cc", "./.mimicry/kept.txt"),
        ]);
        let safe = sanitize(records, Path::new("/home/data"));
        let keys: Vec<&str> = safe.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["./.mimicry/kept.txt", "./ok.txt"]);
    }

    #[tokio::test]
    async fn test_fan_out_joins_every_task_before_reporting_a_panic() {
        let done = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = done.clone();
        let result = fan_out(vec![0u64, 1, 2, 3], 4, move |i| {
            let counter = counter.clone();
            async move {
                if i == 0 {
                    panic!("task {} failed", i);
                }
                tokio::time::sleep(std::time::Duration::from_millis(20 * i)).await;
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(done.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
