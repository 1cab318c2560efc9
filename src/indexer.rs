//! Dual index construction
//!
//! Turns a by-path [`FileIndex`] into the by-hash [`ObjectIndex`] that change
//! detection needs, and pairs the two into a [`DualIndex`]. Pure functions over
//! the data they are given; no I/O, no failure modes.

use crate::types::{DualIndex, FileIndex, ObjectIndex};
use tracing::trace;

/// Builds object indexes from file indexes
#[derive(Debug, Clone, Copy, Default)]
pub struct Indexer;

impl Indexer {
    /// Create an indexer
    pub fn new() -> Self {
        Self
    }

    /// Group the regular files of `files` by content hash
    ///
    /// Each record counts the distinct paths sharing the hash and keeps the
    /// entries in file index order, so the first entry of a record is the
    /// first one met when iterating the file index. Directories and other
    /// entries carry no hash and are left out.
    pub fn build_object_index(&self, files: &FileIndex) -> ObjectIndex {
        let mut objects = ObjectIndex::new();

        for entry in files.values().filter(|e| e.is_file()) {
            let Some(hash) = entry.hash() else {
                continue;
            };
            let record = objects.entry(hash.to_string()).or_default();
            record.refs += 1;
            record.files.push(entry.clone());
        }

        trace!(
            "Indexed {} entries into {} objects",
            files.len(),
            objects.len()
        );
        objects
    }

    /// Pair `files` with its derived object index
    pub fn build_dual_index(&self, files: FileIndex) -> DualIndex {
        let objects = self.build_object_index(&files);
        DualIndex::from_parts(files, objects)
    }
}
