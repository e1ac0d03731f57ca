//! # Mimic CLI - Mirror file collections from remote hosts
//!
//! Command-line interface for the Mimic library.
//!
//! ## Features
//! - Place a directory under management and track its files by checksum
//! - Detect added, changed and removed entries
//! - Clone a remote collection and keep it current with incremental pulls
//! - Operate on nested collections through bundle lists
//!
//! ## Usage
//! ```bash
//! # Place the current directory under management and track everything
//! mimic init
//! mimic add
//!
//! # Show what changed since the last refresh
//! mimic status
//!
//! # Mirror a remote collection, then keep it current
//! mimic clone ./archive -d pull -i https://example.org/archive
//! mimic pull ./archive
//!
//! # Refresh every bundled collection
//! mimic bundle -p refresh
//! ```

use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use mimic::utils::format_bytes;
use mimic::{
    BundleAction, BundleOutcome, BundleVisit, Collection, Direction, DirWalker, HostSettings,
    MimicError, RefreshOptions, RefreshReport, Result, ScanOptions, SyncReport, TestMode,
    TransferOptions,
};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Mimic CLI - Checksum inventories and pull synchronization for collections
#[derive(Parser)]
#[command(name = "mimic")]
#[command(version)]
#[command(about = "Mirror file collections from remote hosts")]
#[command(long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Maximum transfers in flight at once
    #[arg(short = 'j', long, global = true)]
    jobs: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Place a folder under Mimic management
    Init {
        /// Folder to initialize
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Track entries that are not yet in the manifest
    Add {
        /// Folder or file to scan
        #[arg(default_value = ".")]
        path: PathBuf,

        #[command(flatten)]
        scan: ScanArgs,

        /// Report only; make no changes
        #[arg(short, long)]
        test: bool,
    },

    /// Bring the manifest up to date with the folder
    Refresh {
        /// Folder or file to scan
        #[arg(default_value = ".")]
        path: PathBuf,

        #[command(flatten)]
        scan: ScanArgs,

        /// Compare size and time only; skip checksums
        #[arg(short, long)]
        quick: bool,

        /// Report only; make no changes
        #[arg(short, long)]
        test: bool,
    },

    /// Compare the folder with the manifest without changing anything
    Status {
        /// Folder or file to scan
        #[arg(default_value = ".")]
        path: PathBuf,

        #[command(flatten)]
        scan: ScanArgs,

        /// Compare size and time only; skip checksums
        #[arg(short, long)]
        quick: bool,
    },

    /// Fetch what differs from the configured remote collection
    Pull {
        /// Any folder within the collection
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Create a collection mirroring a remote one
    Clone {
        /// Folder to create
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Direction of synchronization
        #[arg(short, long, value_enum)]
        direction: DirectionArg,

        /// URI of the remote collection
        #[arg(short = 'i', long)]
        uri: String,

        /// Account on the remote host
        #[arg(short, long, default_value = "anonymous")]
        username: String,

        /// Private key file for SCP
        #[arg(short, long)]
        keyfile: Option<String>,

        /// Free-form label stored with the settings
        #[arg(short, long)]
        tag: Option<String>,

        /// Record that transfers should be encrypted
        #[arg(short, long)]
        cipher: bool,
    },

    /// Manage and operate on nested collections
    Bundle {
        /// Any folder within the parent collection
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Add a nested collection root to the bundle
        #[arg(short, long)]
        add: Option<PathBuf>,

        /// Remove a nested collection from the bundle
        #[arg(short, long)]
        remove: Option<String>,

        /// List bundled collections
        #[arg(short, long)]
        list: bool,

        /// Apply an operation to every bundled collection
        #[arg(short, long, value_enum)]
        perform: Option<Perform>,

        /// Compare size and time only; skip checksums
        #[arg(short, long)]
        quick: bool,

        /// Report only; make no changes
        #[arg(short, long)]
        test: bool,

        /// Relative path prefixes to skip
        #[arg(short = 'x', long)]
        exclude: Vec<String>,
    },

    /// Drop manifest entries under a path prefix
    Prune {
        /// Any folder within the collection
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Path prefix to remove
        #[arg(short, long)]
        prefix: String,

        /// Report only; make no changes
        #[arg(short, long)]
        test: bool,
    },

    /// List files below a folder, managed or not
    Tree {
        /// Folder to list
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Descend into subfolders
        #[arg(short, long)]
        recurse: bool,

        /// Only list files with this extension
        #[arg(short = 'x', long, default_value = "")]
        ext: String,
    },

    /// Fetch the files listed in a package file
    Download {
        /// Folder to download into
        #[arg(default_value = ".")]
        home: PathBuf,

        /// Package file with a directive header
        #[arg(short, long)]
        pack: PathBuf,

        /// Account on the remote host
        #[arg(short, long)]
        username: Option<String>,

        /// Private key file for SCP
        #[arg(short, long)]
        keyfile: Option<String>,
    },

    /// Show connection settings and inventory totals
    Info {
        /// Any folder within the collection
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Show or change connection settings
    Config {
        /// Any folder within the collection
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Print the stored settings
        #[arg(short, long)]
        list: bool,

        /// Direction the settings apply to
        #[arg(short, long, value_enum, default_value = "pull")]
        direction: DirectionArg,

        /// URI of the remote collection
        #[arg(short = 'i', long)]
        uri: Option<String>,

        /// Account on the remote host
        #[arg(short, long)]
        username: Option<String>,

        /// Private key file for SCP
        #[arg(short, long)]
        keyfile: Option<String>,

        /// Free-form label
        #[arg(short, long)]
        tag: Option<String>,

        /// Record that transfers should be encrypted
        #[arg(short, long)]
        cipher: Option<bool>,
    },
}

#[derive(Args)]
struct ScanArgs {
    /// Only scan the named folder, not its subfolders
    #[arg(long)]
    no_recurse: bool,

    /// Relative path prefixes to skip
    #[arg(short = 'x', long)]
    exclude: Vec<String>,
}

impl ScanArgs {
    fn options(&self, verbose: bool, test_mode: TestMode) -> ScanOptions {
        let mut opts = ScanOptions {
            recurse: !self.no_recurse,
            verbose,
            test_mode,
            ..ScanOptions::default()
        };
        opts.exclude.extend(self.exclude.iter().cloned());
        opts
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum DirectionArg {
    Pull,
    Push,
}

impl From<DirectionArg> for Direction {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::Pull => Direction::Pull,
            DirectionArg::Push => Direction::Push,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Perform {
    Refresh,
    Pull,
    Add,
    Clone,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "mimic=debug" } else { "mimic=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_target(cli.verbose)
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli).await {
        eprintln!("{}: {}", "Error".red().bold(), e.user_message());
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let verbose = cli.verbose;
    let mut transfer = TransferOptions::default().with_verbose(verbose);
    if let Some(jobs) = cli.jobs {
        transfer = transfer.with_max_concurrency(jobs);
    }

    match cli.command {
        Commands::Init { path } => cmd_init(&path),
        Commands::Add { path, scan, test } => {
            cmd_add(&path, &scan.options(verbose, TestMode::from(test)))
        }
        Commands::Refresh {
            path,
            scan,
            quick,
            test,
        } => {
            let opts = RefreshOptions {
                quick,
                scan: scan.options(verbose, TestMode::from(test)),
            };
            cmd_refresh(&path, &opts)
        }
        Commands::Status { path, scan, quick } => {
            let opts = RefreshOptions {
                quick,
                scan: scan.options(verbose, TestMode::Status),
            };
            cmd_status(&path, &opts)
        }
        Commands::Pull { path } => cmd_pull(&path, &transfer).await,
        Commands::Clone {
            path,
            direction,
            uri,
            username,
            keyfile,
            tag,
            cipher,
        } => {
            let mut settings = HostSettings::new(uri, username);
            settings.key_file = keyfile;
            settings.tag = tag;
            settings.with_cipher = Some(cipher);
            cmd_clone(&path, direction.into(), settings, &transfer).await
        }
        Commands::Bundle {
            path,
            add,
            remove,
            list,
            perform,
            quick,
            test,
            exclude,
        } => {
            let mut scan = ScanOptions {
                verbose,
                test_mode: TestMode::from(test),
                ..ScanOptions::default()
            };
            scan.exclude.extend(exclude);
            let action = perform.map(|p| match p {
                Perform::Refresh => BundleAction::Refresh(RefreshOptions { quick, scan }),
                Perform::Add => BundleAction::Add(scan),
                Perform::Pull => BundleAction::Pull(transfer),
                Perform::Clone => BundleAction::Clone(transfer),
            });
            cmd_bundle(&path, add.as_deref(), remove.as_deref(), list, action, test).await
        }
        Commands::Prune { path, prefix, test } => cmd_prune(&path, &prefix, test, verbose),
        Commands::Tree { path, recurse, ext } => cmd_tree(&path, recurse, &ext),
        Commands::Download {
            home,
            pack,
            username,
            keyfile,
        } => {
            cmd_download(
                &home,
                &pack,
                username.as_deref(),
                keyfile.as_deref(),
                &transfer,
            )
            .await
        }
        Commands::Info { path } => cmd_info(&path),
        Commands::Config {
            path,
            list,
            direction,
            uri,
            username,
            keyfile,
            tag,
            cipher,
        } => {
            let settings = HostSettings {
                uri,
                username,
                key_file: keyfile,
                tag,
                with_cipher: cipher,
            };
            cmd_config(&path, list, direction.into(), settings)
        }
    }
}

fn cmd_init(path: &Path) -> Result<()> {
    let collection = Collection::init(path)?;
    println!(
        "{} Initialized Mimic collection at {}",
        "✓".green().bold(),
        collection.root().display().to_string().cyan()
    );
    Ok(())
}

fn cmd_add(path: &Path, opts: &ScanOptions) -> Result<()> {
    let collection = Collection::open(path)?;
    let summary = collection.add(path, opts)?;

    if opts.verbose || !opts.test_mode.applies() {
        for key in &summary.added {
            println!("  {} {}", "Add:".green(), key);
        }
    }

    println!();
    println!("{}", "Summary".bold());
    println!(
        "  Add: {} folder(s); {} file(s)",
        summary.folders, summary.files
    );
    print_test_notice(!opts.test_mode.applies());
    Ok(())
}

fn cmd_refresh(path: &Path, opts: &RefreshOptions) -> Result<()> {
    let collection = Collection::open(path)?;
    let start = Instant::now();
    let report = collection.refresh(path, opts)?;

    if opts.scan.verbose || !opts.scan.test_mode.applies() {
        print_changes(&report);
    }
    print_refresh_summary(&report);
    println!("  Took: {}", format_duration(round(start.elapsed())));
    print_test_notice(!opts.scan.test_mode.applies());
    Ok(())
}

fn cmd_status(path: &Path, opts: &RefreshOptions) -> Result<()> {
    let collection = Collection::open(path)?;
    let report = collection.status(path, opts)?;

    if opts.scan.verbose {
        for key in &report.unchanged_paths {
            println!("  {} {}", "OK:".dimmed(), key);
        }
    }
    print_changes(&report);

    if report.has_changes() {
        print_refresh_summary(&report);
    } else {
        println!(
            "{} Collection matches the manifest ({} entries scanned)",
            "✓".green().bold(),
            report.scanned.total()
        );
    }
    Ok(())
}

async fn cmd_pull(path: &Path, opts: &TransferOptions) -> Result<()> {
    let collection = Collection::open(path)?;
    let settings = collection.pull_settings()?;
    let source = settings.uri.clone().unwrap_or_default();

    let start = Instant::now();
    let pb = spinner(format!("Pulling from {}", source), opts.verbose);
    let report = collection.sync_with_pull(&settings, opts).await;
    pb.finish_and_clear();
    let report = report?;

    print_sync_summary(&report, start.elapsed());
    Ok(())
}

async fn cmd_clone(
    path: &Path,
    direction: Direction,
    settings: HostSettings,
    opts: &TransferOptions,
) -> Result<()> {
    let source = settings.uri.clone().unwrap_or_default();
    let start = Instant::now();
    let pb = spinner(format!("Cloning {}", source), opts.verbose);
    let result = mimic::clone_collection(path, direction, settings, opts).await;
    pb.finish_and_clear();
    let clone = result?;

    println!(
        "{} Cloned {} into {}",
        "✓".green().bold(),
        source.cyan(),
        clone.root.display()
    );
    print_sync_summary(&clone.report, start.elapsed());
    if !clone.nested.is_empty() {
        print_visits(&clone.nested);
    }
    Ok(())
}

async fn cmd_bundle(
    path: &Path,
    add: Option<&Path>,
    remove: Option<&str>,
    list: bool,
    action: Option<BundleAction>,
    test: bool,
) -> Result<()> {
    let collection = Collection::open(path)?;

    if let Some(target) = add {
        let record = collection.bundle_add(target, test)?;
        println!("  {} {}", "Adding:".green(), record.path);
    }

    if let Some(target) = remove {
        match collection.bundle_remove(target, test)? {
            Some(record) => println!("  {} {}", "Removing:".yellow(), record.path),
            None => println!("  {} {} is not bundled", "Note:".yellow(), target),
        }
    }

    if list {
        let bundles = collection.load_bundle()?;
        println!();
        println!("{}", "* Bundled Collections *".bold());
        println!();
        for record in bundles.values() {
            println!("   {}", record.path);
        }
        println!();
        println!("Collections: {}", bundles.len());
    }

    if let Some(action) = action {
        let bundles = collection.load_bundle()?;
        let start = Instant::now();
        let visits = mimic::bundle::perform(&collection, bundles, &action).await?;
        print_visits(&visits);
        println!("  Took: {}", format_duration(round(start.elapsed())));
    }

    if test {
        println!("Test mode: No changes have been made.");
    }
    Ok(())
}

fn cmd_prune(path: &Path, prefix: &str, test: bool, verbose: bool) -> Result<()> {
    let collection = Collection::open(path)?;
    let removed = collection.prune(prefix, test, verbose)?;

    if verbose || test {
        for key in &removed {
            println!("  {} {}", "Remove:".red(), key);
        }
    }
    println!("{}", "Summary".bold());
    println!("  Removed: {} files(s)", removed.len());
    print_test_notice(test);
    Ok(())
}

fn cmd_tree(path: &Path, recurse: bool, ext: &str) -> Result<()> {
    if !path.exists() {
        return Err(MimicError::custom(format!(
            "Folder not found: {}",
            path.display()
        )));
    }

    let walker = DirWalker::new(path, path).with_recursion(recurse);
    let mut count = 0usize;
    for entry in walker.entries() {
        let entry = entry?;
        if entry.is_dir || !entry.key.ends_with(ext) {
            continue;
        }
        println!("{}", entry.path.display());
        count += 1;
    }

    println!();
    println!(" Summary: {} files(s)", count);
    Ok(())
}

async fn cmd_download(
    home: &Path,
    pack: &Path,
    username: Option<&str>,
    key_file: Option<&str>,
    opts: &TransferOptions,
) -> Result<()> {
    let start = Instant::now();
    let pb = spinner(format!("Downloading {}", pack.display()), opts.verbose);
    let result = mimic::download(home, pack, username, key_file, opts).await;
    pb.finish_and_clear();
    let report = result?;

    print_sync_summary(&report, start.elapsed());
    Ok(())
}

fn cmd_info(path: &Path) -> Result<()> {
    let collection = Collection::open(path)?;
    println!("mimic base at: {}", collection.root().display());

    if !collection.manifest_path().exists() {
        println!("{}", "Checksum file is missing.".yellow());
        return Ok(());
    }

    println!();
    println!("{}", "* Connections *".bold());
    println!();
    println!("{}", collection.load_config()?.to_json()?);
    println!();

    let summary = collection.info()?;
    println!("{}", "* Inventory Summary *".bold());
    println!();
    println!("  Files: {}", summary.files);
    println!("  Folders: {}", summary.folders);
    println!("  Bytes: {}", format_bytes(summary.bytes));
    println!();
    Ok(())
}

fn cmd_config(path: &Path, list: bool, direction: Direction, settings: HostSettings) -> Result<()> {
    let collection = Collection::open(path)?;
    let changes = settings != HostSettings::default();

    if changes {
        collection.configure(direction, settings)?;
        println!(
            "{} Updated '{}' settings",
            "✓".green().bold(),
            direction.key().cyan()
        );
    }

    if list || !changes {
        println!("{}", collection.load_config()?.to_json()?);
    }
    Ok(())
}

// Helper functions

fn spinner(message: String, hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn round(elapsed: Duration) -> Duration {
    Duration::from_millis(elapsed.as_millis() as u64)
}

fn print_test_notice(test: bool) {
    if test {
        println!("{}", "Test only. No changes were made.".yellow());
    }
}

fn print_changes(report: &RefreshReport) {
    for key in &report.added_paths {
        println!("  {} {}", "Add:".green(), key);
    }
    for key in &report.updated_paths {
        println!("  {} {}", "Update:".yellow(), key);
    }
    for key in &report.removed_paths {
        println!("  {} {}", "Remove:".red(), key);
    }
}

fn print_refresh_summary(report: &RefreshReport) {
    println!();
    println!("{}", "Summary".bold());
    for (label, tally) in [
        ("Scanned", &report.scanned),
        ("Add", &report.added),
        ("Remove", &report.removed),
        ("Update", &report.updated),
    ] {
        println!(
            "  {}: {} folder(s); {} files(s)",
            label, tally.folders, tally.files
        );
    }
}

fn print_sync_summary(report: &SyncReport, elapsed: Duration) {
    println!();
    println!("{}", "Summary".bold());
    println!("  Removed: {} item(s)", report.removed);
    println!("  Created: {} folder(s)", report.created);
    println!("   Copied: {} file(s)", report.copied);
    println!("    Bytes: {}", format_bytes(report.bytes));
    println!("     Took: {}", format_duration(round(elapsed)));

    if report.is_complete() {
        if report.committed {
            println!("{} Manifest updated", "✓".green().bold());
        }
    } else {
        println!();
        println!(
            "{} {} item(s) failed; the manifest was left unchanged",
            "!".yellow().bold(),
            report.failed.len()
        );
        for name in &report.failed {
            println!("  {}", name.yellow());
        }
    }
}

fn print_visits(visits: &[BundleVisit]) {
    println!();
    println!("{}", "Bundled Collections".bold());
    for visit in visits {
        let root = visit.root.display().to_string();
        match &visit.result {
            Ok(BundleOutcome::Refreshed(report)) => println!(
                "  {} {} (add {}, remove {}, update {})",
                "✓".green(),
                root,
                report.added.total(),
                report.removed.total(),
                report.updated.total()
            ),
            Ok(BundleOutcome::Added(summary)) => println!(
                "  {} {} (add {} folder(s); {} file(s))",
                "✓".green(),
                root,
                summary.folders,
                summary.files
            ),
            Ok(BundleOutcome::Pulled(report)) => {
                let mark = if report.is_complete() {
                    "✓".green()
                } else {
                    "!".yellow()
                };
                println!(
                    "  {} {} (copied {}, removed {}, {})",
                    mark,
                    root,
                    report.copied,
                    report.removed,
                    format_bytes(report.bytes)
                );
            }
            Err(e) => println!("  {} {}: {}", "✗".red(), root, e),
        }
    }
}
