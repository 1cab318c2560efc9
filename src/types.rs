//! Core data types used throughout the arcsavvy library
//!
//! This module contains the data model shared by every component:
//!
//! - **Tree state**: [`FileEntry`], [`FileIndex`] - one scanned element and the
//!   by-path table of a whole tree
//! - **Content view**: [`ObjectRecord`], [`ObjectIndex`] - regular files grouped
//!   by content hash with reference counts
//! - **Unit of exchange**: [`DualIndex`] - both views of one tree state, kept in
//!   lockstep
//! - **Change classification**: [`ChangeEvent`], [`ChangeKind`], [`ChangeStats`]
//!
//! ## Examples
//!
//! ```rust
//! use arcsavvy::types::{DualIndex, FileEntry, FileIndex};
//!
//! let mut files = FileIndex::new();
//! files.insert("a.txt".into(), FileEntry::file("a.txt", 5, 0o644, "h1"));
//! files.insert("b.txt".into(), FileEntry::file("b.txt", 5, 0o644, "h1"));
//!
//! let index = DualIndex::from(files);
//! assert_eq!(index.objects()["h1"].refs, 2);
//! ```

use crate::indexer::Indexer;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;

/// Kind of a filesystem element
///
/// Symbolic links and special files are folded into [`EntryKind::Other`]:
/// they are recorded in snapshots but never hashed, stored or restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// A directory
    Directory,
    /// A regular file with content
    RegularFile,
    /// Symlinks, sockets, fifos, devices
    Other,
}

impl EntryKind {
    /// Single-letter code used in snapshot files
    pub fn code(&self) -> &'static str {
        match self {
            EntryKind::Directory => "D",
            EntryKind::RegularFile => "F",
            EntryKind::Other => "O",
        }
    }

    /// Parse a snapshot type code
    ///
    /// `"L"` (symbolic link) is accepted and folded into [`EntryKind::Other`].
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "D" => Some(EntryKind::Directory),
            "F" => Some(EntryKind::RegularFile),
            "O" | "L" => Some(EntryKind::Other),
            _ => None,
        }
    }
}

/// One filesystem element as of a scan
///
/// Entries are immutable once built. Detection bookkeeping (which historical
/// entries are still represented) lives in a run-scoped side table, never on
/// the entry itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Archive-relative, slash-separated path; unique within one index
    pub path: String,
    /// Final path component
    pub name: String,
    /// Element kind
    pub kind: EntryKind,
    /// Size in bytes (0 for anything but regular files)
    pub size: u64,
    /// Permission bits
    pub mode: u32,
    /// Content digest, present only for regular files
    pub hash: Option<String>,
}

impl FileEntry {
    /// Create a regular file entry
    pub fn file(path: impl Into<String>, size: u64, mode: u32, hash: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            name: base_name(&path),
            path,
            kind: EntryKind::RegularFile,
            size,
            mode,
            hash: Some(hash.into()),
        }
    }

    /// Create a directory entry
    pub fn directory(path: impl Into<String>, mode: u32) -> Self {
        let path = path.into();
        Self {
            name: base_name(&path),
            path,
            kind: EntryKind::Directory,
            size: 0,
            mode,
            hash: None,
        }
    }

    /// Create an entry for a symlink or special file
    pub fn other(path: impl Into<String>, mode: u32) -> Self {
        let path = path.into();
        Self {
            name: base_name(&path),
            path,
            kind: EntryKind::Other,
            size: 0,
            mode,
            hash: None,
        }
    }

    /// Whether this entry is a regular file
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::RegularFile
    }

    /// Whether this entry is a directory
    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Content hash, if any
    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref().filter(|h| !h.is_empty())
    }

    /// Whether size or content differ from `other`
    pub fn content_differs(&self, other: &FileEntry) -> bool {
        self.size != other.size || self.hash() != other.hash()
    }

    /// Abbreviated hash for log output
    pub fn short_hash(&self) -> &str {
        self.hash().map(|h| &h[..8.min(h.len())]).unwrap_or("-")
    }
}

fn base_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

/// By-path table of one tree state
///
/// A `BTreeMap` keeps iteration order stable and reproducible, which the
/// rename/copy tie-break relies on.
pub type FileIndex = BTreeMap<String, FileEntry>;

/// All regular files of one tree state that share a content hash
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Number of distinct paths holding this content
    pub refs: usize,
    /// The entries, in file index order
    pub files: Vec<FileEntry>,
}

/// By-hash table of one tree state
pub type ObjectIndex = BTreeMap<String, ObjectRecord>;

/// Paired by-path and by-hash view of one tree state
///
/// The object table is always the derivation of the file table; the only way
/// to build a `DualIndex` is from a [`FileIndex`] through the [`Indexer`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DualIndex {
    files: FileIndex,
    objects: ObjectIndex,
}

impl DualIndex {
    /// Index of an empty tree (the state of a brand-new repository)
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(files: FileIndex, objects: ObjectIndex) -> Self {
        Self { files, objects }
    }

    /// By-path table
    pub fn files(&self) -> &FileIndex {
        &self.files
    }

    /// By-hash table
    pub fn objects(&self) -> &ObjectIndex {
        &self.objects
    }

    /// Consume the index, keeping only the file table
    pub fn into_files(self) -> FileIndex {
        self.files
    }

    /// Look up an entry by path
    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.files.get(path)
    }

    /// Look up the record for a content hash
    pub fn object(&self, hash: &str) -> Option<&ObjectRecord> {
        self.objects.get(hash)
    }

    /// Number of entries of any kind
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the tree is empty
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Number of distinct content hashes
    pub fn distinct_objects(&self) -> usize {
        self.objects.len()
    }

    /// Total size of all regular files
    pub fn total_size(&self) -> u64 {
        self.files.values().filter(|e| e.is_file()).map(|e| e.size).sum()
    }
}

impl From<FileIndex> for DualIndex {
    fn from(files: FileIndex) -> Self {
        Indexer::new().build_dual_index(files)
    }
}

/// Classification of one path between two tree states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeEvent {
    /// Path and content both unknown historically
    New(FileEntry),
    /// Sole historical holder of this content moved to a new path
    Renamed {
        /// Historical entry
        from: FileEntry,
        /// New entry
        to: FileEntry,
    },
    /// Content already present historically now also at a new path
    Copied {
        /// Historical entry chosen as source
        from: FileEntry,
        /// New entry
        to: FileEntry,
    },
    /// Path kept, content changed, and it was the only holder of the old content
    Modified {
        /// Historical entry
        from: FileEntry,
        /// New entry
        to: FileEntry,
    },
    /// Path kept, content changed, old content still held by other paths
    ModifiedSharedInstance {
        /// Historical entry
        from: FileEntry,
        /// New entry
        to: FileEntry,
    },
    /// Path and content kept, permission bits changed
    ModeChanged {
        /// Historical entry
        from: FileEntry,
        /// New entry
        to: FileEntry,
    },
    /// Path, content and mode all identical
    Unchanged {
        /// Historical entry
        from: FileEntry,
        /// New entry
        to: FileEntry,
    },
    /// Path gone and no path in the new state holds its content
    Deleted(FileEntry),
    /// Path gone but its content is still held elsewhere in the new state
    DeletedSharedInstance(FileEntry),
}

impl ChangeEvent {
    /// Kind of this event
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::New(_) => ChangeKind::New,
            ChangeEvent::Renamed { .. } => ChangeKind::Renamed,
            ChangeEvent::Copied { .. } => ChangeKind::Copied,
            ChangeEvent::Modified { .. } => ChangeKind::Modified,
            ChangeEvent::ModifiedSharedInstance { .. } => ChangeKind::ModifiedSharedInstance,
            ChangeEvent::ModeChanged { .. } => ChangeKind::ModeChanged,
            ChangeEvent::Unchanged { .. } => ChangeKind::Unchanged,
            ChangeEvent::Deleted(_) => ChangeKind::Deleted,
            ChangeEvent::DeletedSharedInstance(_) => ChangeKind::DeletedSharedInstance,
        }
    }

    /// The path this event is reported under
    ///
    /// New-state path for everything except deletions.
    pub fn path(&self) -> &str {
        match self {
            ChangeEvent::New(e) | ChangeEvent::Deleted(e) | ChangeEvent::DeletedSharedInstance(e) => {
                &e.path
            }
            ChangeEvent::Renamed { to, .. }
            | ChangeEvent::Copied { to, .. }
            | ChangeEvent::Modified { to, .. }
            | ChangeEvent::ModifiedSharedInstance { to, .. }
            | ChangeEvent::ModeChanged { to, .. }
            | ChangeEvent::Unchanged { to, .. } => &to.path,
        }
    }

    /// Historical entry, if the event has one
    pub fn source(&self) -> Option<&FileEntry> {
        match self {
            ChangeEvent::New(_) => None,
            ChangeEvent::Deleted(e) | ChangeEvent::DeletedSharedInstance(e) => Some(e),
            ChangeEvent::Renamed { from, .. }
            | ChangeEvent::Copied { from, .. }
            | ChangeEvent::Modified { from, .. }
            | ChangeEvent::ModifiedSharedInstance { from, .. }
            | ChangeEvent::ModeChanged { from, .. }
            | ChangeEvent::Unchanged { from, .. } => Some(from),
        }
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeEvent::Renamed { from, to } | ChangeEvent::Copied { from, to } => {
                write!(f, "{} {} -> {}", self.kind(), from.path, to.path)
            }
            _ => write!(f, "{} {}", self.kind(), self.path()),
        }
    }
}

/// Discriminant of [`ChangeEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChangeKind {
    /// See [`ChangeEvent::New`]
    New,
    /// See [`ChangeEvent::Renamed`]
    Renamed,
    /// See [`ChangeEvent::Copied`]
    Copied,
    /// See [`ChangeEvent::Modified`]
    Modified,
    /// See [`ChangeEvent::ModifiedSharedInstance`]
    ModifiedSharedInstance,
    /// See [`ChangeEvent::ModeChanged`]
    ModeChanged,
    /// See [`ChangeEvent::Unchanged`]
    Unchanged,
    /// See [`ChangeEvent::Deleted`]
    Deleted,
    /// See [`ChangeEvent::DeletedSharedInstance`]
    DeletedSharedInstance,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChangeKind::New => "new",
            ChangeKind::Renamed => "renamed",
            ChangeKind::Copied => "copied",
            ChangeKind::Modified => "modified",
            ChangeKind::ModifiedSharedInstance => "modified (shared)",
            ChangeKind::ModeChanged => "mode changed",
            ChangeKind::Unchanged => "unchanged",
            ChangeKind::Deleted => "deleted",
            ChangeKind::DeletedSharedInstance => "deleted (shared)",
        };
        f.write_str(label)
    }
}

/// Number of events of each kind produced by one detection run
///
/// # Examples
///
/// ```rust
/// # use arcsavvy::types::{ChangeKind, ChangeStats};
/// let mut stats = ChangeStats::default();
/// stats.record(ChangeKind::Unchanged);
/// assert!(!stats.has_changes());
///
/// stats.record(ChangeKind::Renamed);
/// assert!(stats.has_changes());
/// assert_eq!(stats.total(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStats {
    counts: BTreeMap<ChangeKind, usize>,
}

impl ChangeStats {
    /// Count one event
    pub fn record(&mut self, kind: ChangeKind) {
        *self.counts.entry(kind).or_insert(0) += 1;
    }

    /// Take back one event of `kind`, if any was counted
    pub fn forget(&mut self, kind: ChangeKind) {
        if let Entry::Occupied(mut count) = self.counts.entry(kind) {
            if *count.get() > 1 {
                *count.get_mut() -= 1;
            } else {
                count.remove();
            }
        }
    }

    /// Events of `kind`
    pub fn count(&self, kind: ChangeKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    /// Events of every kind
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    /// Whether anything other than `Unchanged` was seen
    pub fn has_changes(&self) -> bool {
        self.counts
            .iter()
            .any(|(kind, count)| *kind != ChangeKind::Unchanged && *count > 0)
    }

    /// Non-zero counts, in kind order
    pub fn iter(&self) -> impl Iterator<Item = (ChangeKind, usize)> + '_ {
        self.counts
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(kind, count)| (*kind, *count))
    }
}

/// Outcome of restoring one snapshot entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreStatus {
    /// Directory created or file content written, mode applied
    Restored,
    /// Entry kind is not restorable (symlinks, special files)
    Skipped,
}
