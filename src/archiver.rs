//! Archive operations
//!
//! [`Archiver`] is the entry point of the library. It wires the scanner,
//! detector, object store and snapshot manager together:
//!
//! - **Snapshot**: scan the source tree, classify it against the current
//!   snapshot, store new content, write a new snapshot
//! - **Check**: verify every object referenced by every snapshot
//! - **Restore**: rebuild a snapshot into a directory that does not exist yet
//! - **Diff**: classify changes without touching the archive
//!
//! ## Examples
//!
//! ```rust,no_run
//! use arcsavvy::{Archiver, SnapshotId};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let archiver = Archiver::open("./backup")?;
//!
//! let outcome = archiver.snapshot(Path::new("./project"))?;
//! println!("snapshot {} stored {} new objects", outcome.id, outcome.new_objects);
//!
//! let report = archiver.check(false)?;
//! assert!(report.is_ok());
//!
//! archiver.restore(Path::new("./restored"), &SnapshotId::Current)?;
//! # Ok(())
//! # }
//! ```

use crate::detector::{AmbiguousAttribution, ChangeDetector};
use crate::error::{ArcsavvyError, Result};
use crate::hash::{ContentHasher, Sha256Hasher};
use crate::object_store::{ObjectCheck, ObjectStore, StoreStats};
use crate::scanner::TreeScanner;
use crate::snapshot::{SnapshotId, SnapshotManager};
use crate::strategy::{ChangeRecorder, PlainObjectStrategy, StoreFault};
use crate::types::{ChangeEvent, ChangeKind, ChangeStats, DualIndex, RestoreStatus};
use crate::utils;
use globset::Glob;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Directory of the object store inside an archive
pub const OBJECTS_DIR: &str = "objects";

/// Effective settings of an [`Archiver`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiverConfig {
    /// Threads used for hashing during scans and deep checks
    pub parallel_workers: usize,
    /// Content digest in use
    pub hash_algorithm: String,
    /// Glob patterns excluded from snapshots
    pub ignore_patterns: Vec<String>,
}

/// What a snapshot run produced
#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    /// Id of the written snapshot
    pub id: SnapshotId,
    /// Index that was written
    pub index: DualIndex,
    /// Events per kind, as they apply to the written index
    ///
    /// Files left out after a collision are not counted as new or modified.
    /// A modified file left out counts as deleted, since the written index
    /// no longer has its path.
    pub stats: ChangeStats,
    /// Copy sources picked by the tie-break
    pub warnings: Vec<AmbiguousAttribution>,
    /// Files left out because their content collided with a stored object
    pub faults: Vec<StoreFault>,
    /// Blobs added to the store
    pub new_objects: usize,
    /// Bytes added to the store
    pub bytes_stored: u64,
    /// Wall time in milliseconds
    pub duration_ms: u64,
}

/// Check results of one snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotCheck {
    /// Snapshot checked
    #[serde(with = "snapshot_id_serde")]
    pub id: SnapshotId,
    /// Result per regular file path
    pub results: BTreeMap<String, ObjectCheck>,
    /// Why the snapshot itself could not be read; `results` is empty then
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SnapshotCheck {
    /// Paths whose object failed the check
    pub fn corrupted(&self) -> impl Iterator<Item = (&str, &ObjectCheck)> {
        self.results
            .iter()
            .filter(|(_, check)| !check.is_ok())
            .map(|(path, check)| (path.as_str(), check))
    }

    /// Whether the snapshot was readable and every object passed
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.results.values().all(ObjectCheck::is_ok)
    }
}

/// Result of [`Archiver::check`], one entry per snapshot in history order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    /// Per-snapshot results
    pub snapshots: Vec<SnapshotCheck>,
    /// Whether blobs were re-hashed
    pub deep: bool,
}

impl CheckReport {
    /// Whether every object of every snapshot passed
    pub fn is_ok(&self) -> bool {
        self.snapshots.iter().all(SnapshotCheck::is_ok)
    }

    /// Every failure as `(snapshot, path, result)`
    pub fn corrupted(&self) -> Vec<(&SnapshotId, &str, &ObjectCheck)> {
        self.snapshots
            .iter()
            .flat_map(|snap| snap.corrupted().map(move |(path, check)| (&snap.id, path, check)))
            .collect()
    }

    /// Snapshots that could not be read, with the reason
    pub fn unreadable(&self) -> Vec<(&SnapshotId, &str)> {
        self.snapshots
            .iter()
            .filter_map(|snap| snap.error.as_deref().map(|error| (&snap.id, error)))
            .collect()
    }

    /// Number of objects checked across all snapshots
    pub fn objects_checked(&self) -> usize {
        self.snapshots.iter().map(|s| s.results.len()).sum()
    }
}

/// What a restore did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreResult {
    /// Snapshot restored
    #[serde(with = "snapshot_id_serde")]
    pub snapshot: SnapshotId,
    /// Outcome per archive path
    pub entries: BTreeMap<String, RestoreStatus>,
    /// Regular files written
    pub files_restored: usize,
    /// Directories created
    pub directories_created: usize,
    /// Content bytes written
    pub bytes_written: u64,
    /// Wall time in milliseconds
    pub duration_ms: u64,
    /// Entries that could not be restored and why
    pub warnings: Vec<String>,
}

/// Result of a diff
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffReport {
    /// Every event in detection order
    pub events: Vec<ChangeEvent>,
    /// Events per kind
    pub stats: ChangeStats,
    /// Copy sources picked by the tie-break
    pub warnings: Vec<AmbiguousAttribution>,
}

impl DiffReport {
    /// Events other than `Unchanged`
    pub fn changes(&self) -> impl Iterator<Item = &ChangeEvent> {
        self.events.iter().filter(|e| e.kind() != ChangeKind::Unchanged)
    }

    /// Whether anything changed
    pub fn has_changes(&self) -> bool {
        self.stats.has_changes()
    }
}

mod snapshot_id_serde {
    use super::SnapshotId;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &SnapshotId, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(id)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SnapshotId, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Deduplicating backup archive
pub struct Archiver {
    root: PathBuf,
    config: ArchiverConfig,
    hasher: Arc<dyn ContentHasher>,
    store: ObjectStore,
    snapshots: SnapshotManager,
    detector: ChangeDetector,
}

impl fmt::Debug for Archiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archiver")
            .field("root", &self.root)
            .field("config", &self.config)
            .finish()
    }
}

impl Archiver {
    /// Archiver with default settings for the archive at `root`
    ///
    /// Nothing is created on disk until the first snapshot.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        ArchiverBuilder::new().build(root)
    }

    /// Archive directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Effective settings
    pub fn config(&self) -> &ArchiverConfig {
        &self.config
    }

    /// Object store of this archive
    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// Snapshot manager of this archive
    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    /// Create the archive layout if it does not exist
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(self.store.root())?;
        Ok(())
    }

    /// Snapshot history, oldest first, current alias last
    pub fn list(&self) -> Result<Vec<SnapshotId>> {
        self.snapshots.list()
    }

    /// Load one snapshot
    pub fn read(&self, id: &SnapshotId) -> Result<DualIndex> {
        self.snapshots.read(id)
    }

    /// Object count and size
    pub fn stats(&self) -> Result<StoreStats> {
        self.store.stats()
    }

    /// Take a snapshot of `source`
    ///
    /// The tree is scanned and classified against the current snapshot in a
    /// single pass; new and modified content is stored as it is met. Files
    /// whose content collides with a stored object are reported in
    /// [`SnapshotOutcome::faults`] and left out of the snapshot.
    ///
    /// # Errors
    ///
    /// - [`ArcsavvyError::Scan`] if the source cannot be read; no snapshot
    ///   is written in that case
    #[instrument(skip(self))]
    pub fn snapshot(&self, source: &Path) -> Result<SnapshotOutcome> {
        info!("Taking snapshot of {:?}", source);
        let start = Instant::now();
        self.init()?;

        let historical = self.snapshots.read(&SnapshotId::Current)?;
        debug!("Current snapshot has {} entries", historical.len());

        let scanner = self.scanner(source);
        let mut strategy = PlainObjectStrategy::new(&self.store, source);
        let detection = self
            .detector
            .compare_online(&historical, scanner.walk()?, &mut strategy)?;

        let new_objects = strategy.new_objects();
        let bytes_stored = strategy.bytes_stored();
        let faults = strategy.into_faults();

        let mut stats = detection.stats;
        let index = if faults.is_empty() {
            detection.index
        } else {
            let mut files = detection.index.into_files();
            for fault in &faults {
                files.remove(&fault.path);
                stats.forget(fault.kind);
                match fault.kind {
                    ChangeKind::Modified => stats.record(ChangeKind::Deleted),
                    ChangeKind::ModifiedSharedInstance => stats.record(ChangeKind::DeletedSharedInstance),
                    _ => {}
                }
            }
            DualIndex::from(files)
        };

        let id = self.snapshots.write(&index)?;
        let duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "Snapshot {} written in {}ms ({} entries, {} new objects, {} faults)",
            id,
            duration_ms,
            index.len(),
            new_objects,
            faults.len()
        );

        Ok(SnapshotOutcome {
            id,
            index,
            stats,
            warnings: detection.warnings,
            faults,
            new_objects,
            bytes_stored,
            duration_ms,
        })
    }

    /// Verify every object referenced by every snapshot
    ///
    /// Corruption is reported in the result, never as an error. A snapshot
    /// that cannot be read is reported with [`SnapshotCheck::error`] set and
    /// the remaining snapshots are still checked. Errors only come from
    /// listing the history or building the worker pool.
    #[instrument(skip(self))]
    pub fn check(&self, deep: bool) -> Result<CheckReport> {
        info!("Checking archive {:?} (deep: {})", self.root, deep);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.parallel_workers)
            .build()?;

        let mut report = CheckReport { snapshots: Vec::new(), deep };
        for id in self.snapshots.list()? {
            let files = match self.snapshots.read_files(&id) {
                Ok(files) => files,
                Err(e) => {
                    warn!("Snapshot {} is unreadable: {}", id, e);
                    report.snapshots.push(SnapshotCheck {
                        id,
                        results: BTreeMap::new(),
                        error: Some(e.to_string()),
                    });
                    continue;
                }
            };
            let results: BTreeMap<String, ObjectCheck> = pool.install(|| {
                files
                    .par_iter()
                    .filter(|(_, entry)| entry.is_file())
                    .map(|(path, entry)| (path.clone(), self.store.check(entry, deep)))
                    .collect()
            });

            let check = SnapshotCheck { id, results, error: None };
            for (path, result) in check.corrupted() {
                warn!("Snapshot {}: {} {}", check.id, path, result);
            }
            debug!("Snapshot {}: {} objects checked", check.id, check.results.len());
            report.snapshots.push(check);
        }

        info!(
            "Checked {} objects in {} snapshots, {} corrupted, {} unreadable snapshots",
            report.objects_checked(),
            report.snapshots.len(),
            report.corrupted().len(),
            report.unreadable().len()
        );
        Ok(report)
    }

    /// Rebuild snapshot `id` into `target`, which must not exist
    ///
    /// Directories are created before their contents, file modes are applied
    /// after content is written and directory modes last, deepest first.
    /// Symlinks and special files are skipped with a warning.
    ///
    /// # Errors
    ///
    /// - [`ArcsavvyError::RestoreTargetExists`] if `target` exists
    /// - [`ArcsavvyError::SnapshotNotFound`] if `id` does not exist
    /// - [`ArcsavvyError::ObjectNotFound`] if a referenced blob is missing
    #[instrument(skip(self))]
    pub fn restore(&self, target: &Path, id: &SnapshotId) -> Result<RestoreResult> {
        info!("Restoring snapshot {} into {:?}", id, target);
        let start = Instant::now();

        if target.symlink_metadata().is_ok() {
            return Err(ArcsavvyError::RestoreTargetExists(target.to_path_buf()));
        }
        if !self.snapshots.exists(id) {
            return Err(ArcsavvyError::SnapshotNotFound(id.to_string()));
        }
        let files = self.snapshots.read_files(id)?;

        fs::create_dir_all(target)?;

        let mut result = RestoreResult {
            snapshot: id.clone(),
            entries: BTreeMap::new(),
            files_restored: 0,
            directories_created: 0,
            bytes_written: 0,
            duration_ms: 0,
            warnings: Vec::new(),
        };
        let mut directory_modes = Vec::new();

        // Parents sort before their descendants
        for (path, entry) in &files {
            let dest = restore_path(target, path);

            if entry.is_directory() {
                fs::create_dir_all(&dest)?;
                directory_modes.push((dest, entry.mode));
                result.directories_created += 1;
            } else if let Some(hash) = entry.hash().filter(|_| entry.is_file()) {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut blob = self.store.open(hash)?;
                let mut out = File::create(&dest)?;
                result.bytes_written += io::copy(&mut blob, &mut out)?;
                utils::set_permissions(&dest, entry.mode)?;
                result.files_restored += 1;
            } else {
                warn!("Skipping {}: {:?} entries are not restorable", path, entry.kind);
                result.warnings.push(format!("{}: symlinks and special files are not restored", path));
                result.entries.insert(path.clone(), RestoreStatus::Skipped);
                continue;
            }
            result.entries.insert(path.clone(), RestoreStatus::Restored);
        }

        directory_modes.sort_by_key(|(dest, _)| std::cmp::Reverse(dest.components().count()));
        for (dest, mode) in directory_modes {
            utils::set_permissions(&dest, mode)?;
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Restored {} files and {} directories ({}) in {}ms",
            result.files_restored,
            result.directories_created,
            utils::format_bytes(result.bytes_written),
            result.duration_ms
        );
        Ok(result)
    }

    /// Classify the changes in `source` since the current snapshot
    ///
    /// Nothing is stored or written.
    #[instrument(skip(self))]
    pub fn diff(&self, source: &Path) -> Result<DiffReport> {
        let historical = self.snapshots.read(&SnapshotId::Current)?;
        let files = self.scanner(source).scan()?;
        self.compare(&historical, files)
    }

    /// Classify the changes between two stored snapshots
    pub fn diff_snapshots(&self, from: &SnapshotId, to: &SnapshotId) -> Result<DiffReport> {
        let historical = self.snapshots.read(from)?;
        let files = self.snapshots.read_files(to)?;
        self.compare(&historical, files)
    }

    fn compare(&self, historical: &DualIndex, files: crate::types::FileIndex) -> Result<DiffReport> {
        let mut recorder = ChangeRecorder::new();
        let detection = self.detector.compare(historical, files, &mut recorder)?;
        Ok(DiffReport {
            events: recorder.into_events(),
            stats: detection.stats,
            warnings: detection.warnings,
        })
    }

    fn scanner(&self, source: &Path) -> TreeScanner {
        TreeScanner::new(source)
            .with_ignore_patterns(self.config.ignore_patterns.clone())
            .with_parallel_workers(self.config.parallel_workers)
            .with_hasher(Arc::clone(&self.hasher))
            .with_exclude(&self.root)
    }
}

/// Destination of archive path `path` below `target`
fn restore_path(target: &Path, path: &str) -> PathBuf {
    path.split('/').fold(target.to_path_buf(), |acc, part| acc.join(part))
}

/// Builder for [`Archiver`]
///
/// # Examples
///
/// ```rust
/// use arcsavvy::ArchiverBuilder;
///
/// # fn main() -> arcsavvy::Result<()> {
/// let archiver = ArchiverBuilder::new()
///     .parallel_workers(2)
///     .ignore_patterns(vec!["*.tmp".to_string(), "target/".to_string()])
///     .build("./backup")?;
/// assert_eq!(archiver.config().parallel_workers, 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ArchiverBuilder {
    parallel_workers: usize,
    hasher: Arc<dyn ContentHasher>,
    ignore_patterns: Vec<String>,
}

impl Default for ArchiverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiverBuilder {
    /// Builder with default settings
    pub fn new() -> Self {
        Self {
            parallel_workers: num_cpus::get(),
            hasher: Arc::new(Sha256Hasher),
            ignore_patterns: Vec::new(),
        }
    }

    /// Threads used for hashing
    pub fn parallel_workers(mut self, count: usize) -> Self {
        self.parallel_workers = count;
        self
    }

    /// Content digest
    pub fn hasher(mut self, hasher: Arc<dyn ContentHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    /// Glob patterns excluded from snapshots
    ///
    /// The archive directory is always excluded when it lives inside the
    /// source tree.
    pub fn ignore_patterns(mut self, patterns: Vec<String>) -> Self {
        self.ignore_patterns = patterns;
        self
    }

    /// Build the archiver for the archive at `root`
    ///
    /// # Errors
    ///
    /// - [`ArcsavvyError::InvalidConfiguration`] if `parallel_workers` is zero
    /// - [`ArcsavvyError::InvalidPattern`] if an ignore pattern does not parse
    pub fn build(self, root: impl Into<PathBuf>) -> Result<Archiver> {
        if self.parallel_workers == 0 {
            return Err(ArcsavvyError::InvalidConfiguration(
                "parallel_workers must be at least 1".to_string(),
            ));
        }
        for pattern in &self.ignore_patterns {
            Glob::new(pattern.trim_end_matches('/'))?;
        }

        let root = root.into();
        let config = ArchiverConfig {
            parallel_workers: self.parallel_workers,
            hash_algorithm: self.hasher.algorithm().to_string(),
            ignore_patterns: self.ignore_patterns,
        };

        Ok(Archiver {
            store: ObjectStore::new(root.join(OBJECTS_DIR), Arc::clone(&self.hasher)),
            snapshots: SnapshotManager::new(&root),
            detector: ChangeDetector::new(),
            hasher: self.hasher,
            config,
            root,
        })
    }
}
