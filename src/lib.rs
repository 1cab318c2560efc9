//! # arcsavvy - Deduplicating directory archives
//!
//! A content-addressed backup engine: it snapshots a directory tree into an
//! archive that stores each distinct file content exactly once, rebuilds any
//! earlier state on demand, and tells what happened between two states
//! (new, renamed, copied, modified, mode changed, unchanged, deleted) from
//! content hashes and metadata alone.
//!
//! ## Overview
//!
//! - Take immutable, timestamped snapshots of a directory tree
//! - Store every distinct content once, however many paths or snapshots share it
//! - Detect renames and copies without a change log or filesystem events
//! - Verify that every object referenced by every snapshot is intact
//! - Restore any snapshot, content and permission bits, into a fresh directory
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use arcsavvy::{Archiver, SnapshotId};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let archiver = Archiver::open("./backup")?;
//!
//! // Snapshot the tree
//! let outcome = archiver.snapshot(Path::new("./project"))?;
//! for (kind, count) in outcome.stats.iter() {
//!     println!("{}: {}", kind, count);
//! }
//!
//! // Verify the whole archive, re-hashing every object
//! let report = archiver.check(true)?;
//! println!("{} objects checked, ok: {}", report.objects_checked(), report.is_ok());
//!
//! // Bring the newest snapshot back somewhere else
//! archiver.restore(Path::new("./restored"), &SnapshotId::Current)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Archive Layout
//!
//! ```text
//! <archive>/
//!   objects/<hex-hash>              one blob per distinct content
//!   index.json                      newest snapshot (alias)
//!   index-snapshot-<timestamp>.json one file per snapshot
//! ```
//!
//! ## Change Detection
//!
//! Detection runs on two [`DualIndex`] values: the by-path table of a tree
//! state and the derived by-hash table with reference counts. The
//! [`ChangeDetector`] walks the new state, classifies every entry and hands
//! each event to a [`ChangeReaction`]. Snapshots use
//! [`PlainObjectStrategy`], which stores new content and nothing else;
//! [`Archiver::diff`] uses a [`ChangeRecorder`].
//!
//! When one content is held by several historical paths the copy source is
//! chosen by index order. That choice is reported as an
//! [`AmbiguousAttribution`] every time it is made.
//!
//! ## Error Handling
//!
//! Operations return [`Result<T>`] with [`ArcsavvyError`]. Only conditions that
//! make the whole operation untrustworthy are errors (unreadable source,
//! existing restore target, missing object during restore). Per-entry
//! anomalies are returned as values: ambiguity warnings, store collisions,
//! check results.
//!
//! ## Module Organization
//!
//! - [`archiver`]: snapshot, check, restore and diff operations
//! - [`detector`]: change classification and the reaction interface
//! - [`strategy`]: reaction implementations
//! - [`object_store`]: content-addressed blob store
//! - [`snapshot`]: snapshot files and ids
//! - [`scanner`]: source tree walking and hashing
//! - [`indexer`]: by-hash index construction
//! - [`hash`]: pluggable content digest
//! - [`types`]: shared data model
//! - [`error`]: error types

// Public API modules
pub mod archiver;
pub mod detector;
pub mod error;
pub mod hash;
pub mod indexer;
pub mod object_store;
pub mod scanner;
pub mod snapshot;
pub mod strategy;
pub mod types;

// Internal modules
mod utils;

// Re-export main types for convenience
pub use archiver::{
    Archiver, ArchiverBuilder, ArchiverConfig, CheckReport, DiffReport, RestoreResult,
    SnapshotCheck, SnapshotOutcome,
};
pub use detector::{AmbiguousAttribution, ChangeDetector, ChangeReaction, Detection, SeenSet};
pub use error::{ArcsavvyError, Result};
pub use hash::{ContentHasher, Sha256Hasher};
pub use indexer::Indexer;
pub use object_store::{ObjectCheck, ObjectStore, PutOutcome, StoreStats};
pub use scanner::TreeScanner;
pub use snapshot::{SnapshotId, SnapshotManager};
pub use strategy::{ChangeRecorder, NoopReaction, PlainObjectStrategy, StoreFault};
pub use types::*;
