//! Error types for the Mimic library
//!
//! This module defines all error types that can occur during Mimic operations.
//! Errors fall into two groups:
//!
//! - **Command-level errors** (unmanaged paths, missing configuration, bad
//!   URIs, unsupported protocols) abort the enclosing operation.
//! - **Item-level errors** (one transfer, one delete, one mkdir) are logged and
//!   counted by the caller while the rest of the batch continues. See
//!   [`MimicError::is_item_local`].

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the Mimic library
pub type Result<T> = std::result::Result<T, MimicError>;

/// Main error type for all Mimic operations
#[derive(Debug, Error)]
pub enum MimicError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Malformed URI
    #[error("Invalid URI: {0}")]
    InvalidUri(#[from] url::ParseError),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A spawned task panicked or was cancelled
    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Path is not inside a managed collection
    #[error("Not a Mimic managed collection: {0:?}")]
    RootNotManaged(PathBuf),

    /// Collection already has a management directory
    #[error("Already initialized for use with Mimic: {0:?}")]
    AlreadyInitialized(PathBuf),

    /// A manifest or bundle line has the wrong shape
    #[error("Malformed record on line {line}: found {found} field(s), expected {expected}")]
    MalformedRecord {
        /// 1-based line number in the source file
        line: usize,
        /// Number of fields found
        found: usize,
        /// Number of fields expected
        expected: usize,
    },

    /// A numeric field could not be parsed
    #[error("Malformed record on line {line}: {reason}")]
    MalformedField {
        /// 1-based line number in the source file
        line: usize,
        /// What was wrong
        reason: String,
    },

    /// A single item could not be fetched
    #[error("Transfer of '{name}' failed: {reason}")]
    TransferFailed {
        /// Remote relative name
        name: String,
        /// Underlying cause
        reason: String,
    },

    /// URI scheme is not one of http, https, ftp, scp
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Local filesystem mutation failed for one entry
    #[error("Filesystem error at {path:?}: {source}")]
    Filesystem {
        /// Path being mutated
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// No settings for the requested direction
    #[error("No '{direction}' settings defined for collection at {root:?}")]
    ConfigurationMissing {
        /// Direction name (`Pull` or `Push`)
        direction: String,
        /// Collection root
        root: PathBuf,
    },

    /// Push synchronization was requested
    #[error("Push synchronization is not implemented")]
    PushNotImplemented,

    /// A record path escapes the collection home
    #[error("Unsafe record path: {0}")]
    UnsafePath(String),

    /// Package directive header could not be read
    #[error("Invalid package directive: {0}")]
    InvalidDirective(String),

    /// FTP protocol error
    #[error("FTP error: {0}")]
    Ftp(String),

    /// SCP subprocess error
    #[error("SCP error: {0}")]
    Scp(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),

    /// Custom error type for extensions
    #[error("{0}")]
    Custom(String),
}

impl MimicError {
    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        MimicError::Internal(msg.into())
    }

    /// Create a custom error with a custom message
    pub fn custom(msg: impl Into<String>) -> Self {
        MimicError::Custom(msg.into())
    }

    /// Wrap an I/O error with the path being mutated
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MimicError::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Create a transfer failure for one remote item
    pub fn transfer(name: impl Into<String>, reason: impl ToString) -> Self {
        MimicError::TransferFailed {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if this error only affects a single item of a batch
    ///
    /// Item-local errors are logged and skipped; every other error aborts the
    /// enclosing command.
    pub fn is_item_local(&self) -> bool {
        matches!(
            self,
            MimicError::TransferFailed { .. }
                | MimicError::Filesystem { .. }
                | MimicError::UnsafePath(_)
                | MimicError::Ftp(_)
                | MimicError::Scp(_)
                | MimicError::Http(_)
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            MimicError::RootNotManaged(path) => {
                format!(
                    "The folder {:?} is not under Mimic management.\n\
                     To place it under Mimic management issue the command 'mimic init'\n\
                     in the folder or one of the parent folders.",
                    path
                )
            }
            MimicError::ConfigurationMissing { direction, .. } => {
                format!(
                    "No '{}' source is defined. Mimic collection is not configured to {}. \
                     Use 'mimic config' to define one.",
                    direction,
                    direction.to_lowercase()
                )
            }
            MimicError::AlreadyInitialized(_) => {
                "Folder already initialized for use with Mimic.".to_string()
            }
            MimicError::PushNotImplemented => {
                "Push for direction is not yet implemented.".to_string()
            }
            MimicError::UnsupportedProtocol(scheme) => {
                format!(
                    "Protocol '{}' is not supported. Use http, https, ftp or scp.",
                    scheme
                )
            }
            _ => self.to_string(),
        }
    }
}
