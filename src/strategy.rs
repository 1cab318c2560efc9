//! Change reactions
//!
//! Implementations of [`ChangeReaction`] plugged into the detector:
//!
//! - [`PlainObjectStrategy`] stores new content in an [`ObjectStore`] and is
//!   what a snapshot runs with.
//! - [`ChangeRecorder`] keeps every event, for diffs and tests.
//! - [`NoopReaction`] does nothing; detection statistics alone.

use crate::detector::{AmbiguousAttribution, ChangeReaction};
use crate::error::{ArcsavvyError, Result};
use crate::object_store::{ObjectStore, PutOutcome};
use crate::types::{ChangeEvent, ChangeKind, FileEntry};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// A collision recorded while storing content
///
/// The conflicting file is left out of the store; the existing blob wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreFault {
    /// Archive path of the skipped file
    pub path: String,
    /// Hash both contents claim
    pub hash: String,
    /// Length of the blob already stored
    pub stored_size: u64,
    /// Length the skipped file was scanned with
    pub entry_size: u64,
    /// How the detector classified the skipped file
    pub kind: ChangeKind,
}

/// Stores the content of new and modified files, nothing else
///
/// Renames, copies, mode changes and unchanged files reuse content already
/// in the store. Deleted content stays in the store as well: nothing is
/// ever removed by a snapshot.
#[derive(Debug)]
pub struct PlainObjectStrategy<'a> {
    store: &'a ObjectStore,
    source_root: PathBuf,
    faults: Vec<StoreFault>,
    new_objects: usize,
    bytes_stored: u64,
}

impl<'a> PlainObjectStrategy<'a> {
    /// Strategy reading content from below `source_root`
    pub fn new(store: &'a ObjectStore, source_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            source_root: source_root.into(),
            faults: Vec::new(),
            new_objects: 0,
            bytes_stored: 0,
        }
    }

    /// Collisions met so far
    pub fn faults(&self) -> &[StoreFault] {
        &self.faults
    }

    /// Blobs written so far
    pub fn new_objects(&self) -> usize {
        self.new_objects
    }

    /// Bytes written so far
    pub fn bytes_stored(&self) -> u64 {
        self.bytes_stored
    }

    /// Consume the strategy, returning its collisions
    pub fn into_faults(self) -> Vec<StoreFault> {
        self.faults
    }

    fn source_path(&self, entry: &FileEntry) -> PathBuf {
        entry
            .path
            .split('/')
            .fold(self.source_root.clone(), |acc, part| acc.join(part))
    }

    fn store(&mut self, entry: &FileEntry, kind: ChangeKind) -> Result<()> {
        if !entry.is_file() {
            return Ok(());
        }

        let source = self.source_path(entry);
        match self.store.put(entry, &source) {
            Ok(PutOutcome::Stored { bytes }) => {
                self.new_objects += 1;
                self.bytes_stored += bytes;
                Ok(())
            }
            Ok(PutOutcome::AlreadyPresent) => Ok(()),
            Err(ArcsavvyError::StoreCollision { hash, path, stored_size, entry_size }) => {
                warn!("Skipping {}: content collides with stored object {}", path, hash);
                self.faults.push(StoreFault { path, hash, stored_size, entry_size, kind });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Root the strategy reads content from
    pub fn source_root(&self) -> &Path {
        &self.source_root
    }
}

impl ChangeReaction for PlainObjectStrategy<'_> {
    fn on_new(&mut self, entry: &FileEntry) -> Result<()> {
        self.store(entry, ChangeKind::New)
    }

    fn on_renamed(&mut self, _from: &FileEntry, _to: &FileEntry) -> Result<()> {
        Ok(())
    }

    fn on_copied(&mut self, _from: &FileEntry, _to: &FileEntry) -> Result<()> {
        Ok(())
    }

    fn on_modified(&mut self, _from: &FileEntry, to: &FileEntry) -> Result<()> {
        self.store(to, ChangeKind::Modified)
    }

    fn on_modified_shared_instance(&mut self, _from: &FileEntry, to: &FileEntry) -> Result<()> {
        self.store(to, ChangeKind::ModifiedSharedInstance)
    }

    fn on_mode_changed(&mut self, _from: &FileEntry, _to: &FileEntry) -> Result<()> {
        Ok(())
    }

    fn on_unchanged(&mut self, _from: &FileEntry, _to: &FileEntry) -> Result<()> {
        Ok(())
    }

    fn on_deleted(&mut self, _entry: &FileEntry) -> Result<()> {
        Ok(())
    }

    fn on_deleted_shared_instance(&mut self, _entry: &FileEntry) -> Result<()> {
        Ok(())
    }
}

/// Reaction that ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReaction;

impl ChangeReaction for NoopReaction {
    fn on_new(&mut self, _entry: &FileEntry) -> Result<()> {
        Ok(())
    }

    fn on_renamed(&mut self, _from: &FileEntry, _to: &FileEntry) -> Result<()> {
        Ok(())
    }

    fn on_copied(&mut self, _from: &FileEntry, _to: &FileEntry) -> Result<()> {
        Ok(())
    }

    fn on_modified(&mut self, _from: &FileEntry, _to: &FileEntry) -> Result<()> {
        Ok(())
    }

    fn on_modified_shared_instance(&mut self, _from: &FileEntry, _to: &FileEntry) -> Result<()> {
        Ok(())
    }

    fn on_mode_changed(&mut self, _from: &FileEntry, _to: &FileEntry) -> Result<()> {
        Ok(())
    }

    fn on_unchanged(&mut self, _from: &FileEntry, _to: &FileEntry) -> Result<()> {
        Ok(())
    }

    fn on_deleted(&mut self, _entry: &FileEntry) -> Result<()> {
        Ok(())
    }

    fn on_deleted_shared_instance(&mut self, _entry: &FileEntry) -> Result<()> {
        Ok(())
    }
}

/// Reaction that records every event in arrival order
#[derive(Debug, Clone, Default)]
pub struct ChangeRecorder {
    events: Vec<ChangeEvent>,
    warnings: Vec<AmbiguousAttribution>,
}

impl ChangeRecorder {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded events
    pub fn events(&self) -> &[ChangeEvent] {
        &self.events
    }

    /// Recorded ambiguity warnings
    pub fn warnings(&self) -> &[AmbiguousAttribution] {
        &self.warnings
    }

    /// Kinds of the recorded events, in order
    pub fn kinds(&self) -> Vec<ChangeKind> {
        self.events.iter().map(ChangeEvent::kind).collect()
    }

    /// Events other than `Unchanged`
    pub fn changes(&self) -> impl Iterator<Item = &ChangeEvent> {
        self.events.iter().filter(|e| e.kind() != ChangeKind::Unchanged)
    }

    /// Consume the recorder, returning its events
    pub fn into_events(self) -> Vec<ChangeEvent> {
        self.events
    }

    fn push(&mut self, event: ChangeEvent) -> Result<()> {
        self.events.push(event);
        Ok(())
    }
}

impl ChangeReaction for ChangeRecorder {
    fn on_new(&mut self, entry: &FileEntry) -> Result<()> {
        self.push(ChangeEvent::New(entry.clone()))
    }

    fn on_renamed(&mut self, from: &FileEntry, to: &FileEntry) -> Result<()> {
        self.push(ChangeEvent::Renamed { from: from.clone(), to: to.clone() })
    }

    fn on_copied(&mut self, from: &FileEntry, to: &FileEntry) -> Result<()> {
        self.push(ChangeEvent::Copied { from: from.clone(), to: to.clone() })
    }

    fn on_modified(&mut self, from: &FileEntry, to: &FileEntry) -> Result<()> {
        self.push(ChangeEvent::Modified { from: from.clone(), to: to.clone() })
    }

    fn on_modified_shared_instance(&mut self, from: &FileEntry, to: &FileEntry) -> Result<()> {
        self.push(ChangeEvent::ModifiedSharedInstance { from: from.clone(), to: to.clone() })
    }

    fn on_mode_changed(&mut self, from: &FileEntry, to: &FileEntry) -> Result<()> {
        self.push(ChangeEvent::ModeChanged { from: from.clone(), to: to.clone() })
    }

    fn on_unchanged(&mut self, from: &FileEntry, to: &FileEntry) -> Result<()> {
        self.push(ChangeEvent::Unchanged { from: from.clone(), to: to.clone() })
    }

    fn on_deleted(&mut self, entry: &FileEntry) -> Result<()> {
        self.push(ChangeEvent::Deleted(entry.clone()))
    }

    fn on_deleted_shared_instance(&mut self, entry: &FileEntry) -> Result<()> {
        self.push(ChangeEvent::DeletedSharedInstance(entry.clone()))
    }

    fn on_ambiguous(&mut self, warning: &AmbiguousAttribution) {
        self.warnings.push(warning.clone());
    }
}
