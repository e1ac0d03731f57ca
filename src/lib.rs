//! # Mimic - Mirror file collections from remote hosts
//!
//! A library for keeping a content-addressed inventory of a directory tree and
//! synchronizing that tree from a remote copy over HTTP/HTTPS, FTP or SCP.
//!
//! ## Overview
//!
//! Mimic manages *collections*: directories marked by a hidden `.mimic`
//! folder that holds
//! - a manifest (`.mimic/checksum.mimic`) with one record per tracked file or
//!   folder: size, modified time, SHA-1 digest and relative path
//! - an optional bundle list (`.mimic/bundle`) naming nested collections
//! - a connection configuration (`.mimic/config`) describing the remote source
//!
//! With these it can:
//! - Track new entries and detect added, changed or removed ones
//! - Mirror a remote collection with a single pull
//! - Keep a mirror current by fetching only what differs from the remote
//!   manifest and deleting what the remote no longer has
//! - Apply any of the above recursively across nested collections
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mimic::{Collection, Direction, HostSettings, RefreshOptions, TransferOptions};
//! use std::path::Path;
//!
//! # async fn example() -> mimic::Result<()> {
//! // Mirror a remote collection
//! let report = mimic::clone_collection(
//!     Path::new("./archive"),
//!     Direction::Pull,
//!     HostSettings::new("https://example.org/archive", "anonymous"),
//!     &TransferOptions::default(),
//! )
//! .await?;
//! println!("Copied {} file(s)", report.report.copied);
//!
//! // Later: fetch only what changed
//! let collection = Collection::open(Path::new("./archive"))?;
//! let report = collection.sync_pull(&TransferOptions::default()).await?;
//! println!("Copied {}, removed {}", report.copied, report.removed);
//!
//! // Check local edits against the manifest
//! let status = collection.status(collection.root(), &RefreshOptions::default())?;
//! println!("{} file(s) changed", status.updated.files);
//! # Ok(())
//! # }
//! ```
//!
//! ## Synchronization Model
//!
//! A remote pass fetches the remote manifest into a staging file, compares it
//! with the local manifest record by record and then runs strictly ordered
//! phases: delete, create folders, fetch files, restamp folders, commit. Each
//! phase runs its items concurrently up to
//! [`TransferOptions::max_concurrency`]. The local manifest is replaced only
//! when every item succeeded, so an interrupted or partial pass is picked up
//! by the next one.
//!
//! ## Error Handling
//!
//! All operations return `Result<T, MimicError>`. Errors that concern a single
//! item of a batch (one transfer, one delete) are logged and reported in the
//! operation's summary; see [`MimicError::is_item_local`]. Path and
//! configuration errors abort the operation.
//!
//! ## Module Organization
//!
//! - [`collection`]: the [`Collection`] handle, init, info and prune
//! - [`sync`]: add, refresh, status, pull, incremental sync and package download
//! - [`bundle`]: bundle lists and recursive traversal of nested collections
//! - [`transfer`]: protocol selection and single-item fetches
//! - [`manifest`]: text formats of manifests, bundles and package directives
//! - [`checksum`]: SHA-1 digests and the directory sentinel
//! - [`walker`]: filtered directory iteration
//! - [`config`]: layout constants, root lookup and connection settings
//! - [`types`]: records, options and reports
//! - [`error`]: error types

pub mod bundle;
pub mod checksum;
pub mod collection;
pub mod config;
pub mod error;
pub mod manifest;
pub mod sync;
pub mod transfer;
pub mod types;
pub mod utils;
pub mod walker;

// Re-export main types for convenience
pub use bundle::{
    add_all, clone_all, clone_collection, pull_all, refresh_all, BundleAction, BundleOutcome,
    BundleVisit, CloneReport,
};
pub use checksum::DIR_SENTINEL;
pub use collection::Collection;
pub use config::{ConnectionConfig, Direction, HostSettings};
pub use error::{MimicError, Result};
pub use manifest::PackageDirective;
pub use sync::{diff, download, SyncPlan};
pub use transfer::{Transfer, TransferOutcome};
pub use types::*;
pub use walker::{DirWalker, WalkEntry};
