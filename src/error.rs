//! Error types for the arcsavvy library
//!
//! Fatal conditions are returned as [`ArcsavvyError`]. Per-entry anomalies that
//! must not abort an operation (ambiguous rename attribution, store collisions
//! during a snapshot, corrupted objects found by a check) are reported as plain
//! values by the component that finds them, never through this type.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the arcsavvy library
pub type Result<T> = std::result::Result<T, ArcsavvyError>;

/// Main error type for all arcsavvy operations
#[derive(Debug, Error)]
pub enum ArcsavvyError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Reading or hashing the source tree failed; the scan cannot be trusted
    #[error("Scan failed at {path:?}: {source}")]
    Scan {
        /// Path being scanned when the failure occurred
        path: PathBuf,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },

    /// A blob already exists under this hash with different content
    #[error("Store collision for object {hash}: stored {stored_size} bytes, entry {path:?} has {entry_size} bytes")]
    StoreCollision {
        /// Content hash both blobs claim
        hash: String,
        /// Archive path of the conflicting entry
        path: String,
        /// Size of the blob already in the store
        stored_size: u64,
        /// Size recorded for the incoming entry
        entry_size: u64,
    },

    /// Object not found in the object store
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// Snapshot not found in the repository
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Restore refuses to write into an existing directory
    #[error("Restore target already exists: {0:?}")]
    RestoreTargetExists(PathBuf),

    /// Snapshot entry with a type code this version cannot handle
    #[error("Unsupported entry type {code:?} for {path}")]
    UnsupportedEntryType {
        /// Archive path of the entry
        path: String,
        /// Type code found in the snapshot file
        code: String,
    },

    /// A regular file entry without a content hash
    #[error("Invalid entry {path}: {reason}")]
    InvalidEntry {
        /// Archive path of the entry
        path: String,
        /// What is wrong with it
        reason: String,
    },

    /// Pattern parsing error
    #[error("Invalid ignore pattern: {0}")]
    InvalidPattern(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Thread pool error
    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<globset::Error> for ArcsavvyError {
    fn from(err: globset::Error) -> Self {
        ArcsavvyError::InvalidPattern(err.to_string())
    }
}

impl From<rayon::ThreadPoolBuildError> for ArcsavvyError {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        ArcsavvyError::ThreadPool(err.to_string())
    }
}

impl ArcsavvyError {
    /// Create a scan fault for `path`
    pub fn scan(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ArcsavvyError::Scan {
            path: path.into(),
            source,
        }
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        ArcsavvyError::Internal(msg.into())
    }

    /// Check if this error is recoverable
    ///
    /// Collisions only affect the entry that caused them; every other error
    /// aborts the enclosing operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ArcsavvyError::StoreCollision { .. })
    }

    /// Check if this error indicates repository corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ArcsavvyError::StoreCollision { .. }
                | ArcsavvyError::ObjectNotFound(_)
                | ArcsavvyError::UnsupportedEntryType { .. }
                | ArcsavvyError::InvalidEntry { .. }
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            ArcsavvyError::RestoreTargetExists(path) => {
                format!(
                    "Target {:?} already exists. Restore never overwrites; pick a new directory.",
                    path
                )
            }
            ArcsavvyError::SnapshotNotFound(id) => {
                format!("Snapshot '{}' not found. Use 'arcsavvy list' to see available snapshots.", id)
            }
            ArcsavvyError::ObjectNotFound(hash) => {
                format!(
                    "Object {} is missing from the archive. Run 'arcsavvy check --deep' to find affected snapshots.",
                    hash
                )
            }
            ArcsavvyError::Scan { path, source } => {
                format!("Could not read {:?} while scanning: {}. Nothing was written.", path, source)
            }
            _ => self.to_string(),
        }
    }
}
