//! Snapshot persistence
//!
//! A snapshot is the file table of one [`DualIndex`], serialised as JSON and
//! never modified after it is written. Every snapshot lives in its own
//! timestamped file; the newest one is also copied to `index.json`, the
//! stable "current" alias a fresh snapshot run starts from.
//!
//! ```text
//! <archive>/
//!   index.json
//!   index-snapshot-2024-05-01T09-30-12.000417Z.json
//!   index-snapshot-2024-05-02T18-02-55.193006Z.json
//! ```
//!
//! Each file is a JSON object mapping archive path to a [`SnapshotRecord`].
//! An absent or empty `index.json` is the valid state of a new repository
//! and reads as an empty index.

use crate::error::{ArcsavvyError, Result};
use crate::indexer::Indexer;
use crate::types::{DualIndex, EntryKind, FileEntry, FileIndex};
use crate::utils::{atomic_write, is_safe_archive_path};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

/// File name of the current alias
pub const CURRENT_INDEX: &str = "index.json";

const SNAPSHOT_PREFIX: &str = "index-snapshot-";
const SNAPSHOT_SUFFIX: &str = ".json";
const TOKEN_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.6fZ";

/// Identifies one snapshot of a repository
///
/// Ordering follows history: timestamped snapshots oldest first, then the
/// current alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SnapshotId {
    /// An immutable snapshot, named by its UTC timestamp token
    At(String),
    /// The `index.json` alias of the newest snapshot
    Current,
}

impl SnapshotId {
    /// File name of this snapshot inside the archive
    pub fn file_name(&self) -> String {
        match self {
            SnapshotId::At(token) => format!("{}{}{}", SNAPSHOT_PREFIX, token, SNAPSHOT_SUFFIX),
            SnapshotId::Current => CURRENT_INDEX.to_string(),
        }
    }

    /// Whether this is the current alias
    pub fn is_current(&self) -> bool {
        matches!(self, SnapshotId::Current)
    }

    /// Timestamp token, if this is not the alias
    pub fn token(&self) -> Option<&str> {
        match self {
            SnapshotId::At(token) => Some(token),
            SnapshotId::Current => None,
        }
    }

    /// Moment the snapshot was taken, if this is not the alias
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.token().and_then(parse_token)
    }

    fn from_file_name(name: &str) -> Option<Self> {
        if name == CURRENT_INDEX {
            return Some(SnapshotId::Current);
        }
        let token = name.strip_prefix(SNAPSHOT_PREFIX)?.strip_suffix(SNAPSHOT_SUFFIX)?;
        parse_token(token).map(|_| SnapshotId::At(token.to_string()))
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotId::At(token) => f.write_str(token),
            SnapshotId::Current => f.write_str("current"),
        }
    }
}

impl FromStr for SnapshotId {
    type Err = ArcsavvyError;

    /// Accepts `current`, a bare token, or a snapshot file name
    fn from_str(s: &str) -> Result<Self> {
        if s == "current" {
            return Ok(SnapshotId::Current);
        }
        if let Some(id) = SnapshotId::from_file_name(s) {
            return Ok(id);
        }
        match parse_token(s) {
            Some(_) => Ok(SnapshotId::At(s.to_string())),
            None => Err(ArcsavvyError::SnapshotNotFound(s.to_string())),
        }
    }
}

fn parse_token(token: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(token, TOKEN_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

fn format_token(at: DateTime<Utc>) -> String {
    at.format(TOKEN_FORMAT).to_string()
}

/// Token for a snapshot taken at `now`, strictly after `newest`
fn next_token(now: DateTime<Utc>, newest: Option<&str>) -> String {
    let candidate = format_token(now);
    match newest {
        Some(newest) if candidate.as_str() <= newest => match parse_token(newest) {
            Some(at) => format_token(at + Duration::microseconds(1)),
            None => candidate,
        },
        _ => candidate,
    }
}

/// One entry as stored in a snapshot file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Archive-relative path
    pub full_name: String,
    /// Final path component
    pub base_name: String,
    /// Type code: `D`, `F`, `O` or `L`
    #[serde(rename = "type")]
    pub kind: String,
    /// Size in bytes
    #[serde(default)]
    pub size: u64,
    /// Permission bits
    #[serde(default)]
    pub mode: u32,
    /// Content hash, regular files only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl From<&FileEntry> for SnapshotRecord {
    fn from(entry: &FileEntry) -> Self {
        Self {
            full_name: entry.path.clone(),
            base_name: entry.name.clone(),
            kind: entry.kind.code().to_string(),
            size: entry.size,
            mode: entry.mode,
            hash: entry.hash().map(str::to_string),
        }
    }
}

impl SnapshotRecord {
    /// Validate and convert into a [`FileEntry`] stored under `path`
    pub fn into_entry(self, path: &str) -> Result<FileEntry> {
        let kind = EntryKind::from_code(&self.kind).ok_or_else(|| {
            ArcsavvyError::UnsupportedEntryType {
                path: path.to_string(),
                code: self.kind.clone(),
            }
        })?;

        if !is_safe_archive_path(path) {
            return Err(ArcsavvyError::InvalidEntry {
                path: path.to_string(),
                reason: "path escapes the archive root".to_string(),
            });
        }

        let hash = self.hash.filter(|h| !h.is_empty());
        match kind {
            EntryKind::RegularFile => {
                let hash = hash.ok_or_else(|| ArcsavvyError::InvalidEntry {
                    path: path.to_string(),
                    reason: "regular file without content hash".to_string(),
                })?;
                Ok(FileEntry::file(path, self.size, self.mode, hash))
            }
            EntryKind::Directory => Ok(FileEntry::directory(path, self.mode)),
            EntryKind::Other => Ok(FileEntry::other(path, self.mode)),
        }
    }
}

/// Reads and writes the snapshot files of one repository
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    root: PathBuf,
    indexer: Indexer,
}

impl SnapshotManager {
    /// Manager for the repository at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            indexer: Indexer::new(),
        }
    }

    /// Repository directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file backing `id`
    pub fn path_of(&self, id: &SnapshotId) -> PathBuf {
        self.root.join(id.file_name())
    }

    /// Persist the file table of `index` as a new snapshot
    ///
    /// The timestamped file is written first, then the current alias is
    /// replaced. Both writes are atomic.
    pub fn write(&self, index: &DualIndex) -> Result<SnapshotId> {
        let newest = self.latest()?;
        let token = next_token(Utc::now(), newest.as_ref().and_then(SnapshotId::token));
        let id = SnapshotId::At(token);

        let records: BTreeMap<&str, SnapshotRecord> = index
            .files()
            .iter()
            .map(|(path, entry)| (path.as_str(), SnapshotRecord::from(entry)))
            .collect();
        let json = serde_json::to_vec_pretty(&records)?;

        atomic_write(&self.path_of(&id), &json)?;
        atomic_write(&self.path_of(&SnapshotId::Current), &json)?;

        info!("Wrote snapshot {} ({} entries)", id, records.len());
        Ok(id)
    }

    /// Every snapshot, oldest first, with the current alias last
    pub fn list(&self) -> Result<Vec<SnapshotId>> {
        let read_dir = match fs::read_dir(&self.root) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for item in read_dir {
            let item = item?;
            if !item.file_type()?.is_file() {
                continue;
            }
            if let Some(id) = SnapshotId::from_file_name(&item.file_name().to_string_lossy()) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Newest timestamped snapshot
    pub fn latest(&self) -> Result<Option<SnapshotId>> {
        Ok(self.list()?.into_iter().rfind(|id| !id.is_current()))
    }

    /// Whether `id` exists on disk
    pub fn exists(&self, id: &SnapshotId) -> bool {
        self.path_of(id).is_file()
    }

    /// Load the snapshot `id` as a dual index
    ///
    /// A missing or empty current alias is an empty index. A missing
    /// timestamped snapshot is [`ArcsavvyError::SnapshotNotFound`].
    pub fn read(&self, id: &SnapshotId) -> Result<DualIndex> {
        let files = self.read_files(id)?;
        Ok(self.indexer.build_dual_index(files))
    }

    /// Load only the file table of `id`
    pub fn read_files(&self, id: &SnapshotId) -> Result<FileIndex> {
        let path = self.path_of(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound && id.is_current() => {
                debug!("No current index at {:?}, starting empty", path);
                return Ok(FileIndex::new());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ArcsavvyError::SnapshotNotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(FileIndex::new());
        }

        let records: BTreeMap<String, SnapshotRecord> = serde_json::from_slice(&bytes)?;
        let mut files = FileIndex::new();
        for (path, record) in records {
            let entry = record.into_entry(&path)?;
            files.insert(path, entry);
        }

        debug!("Read snapshot {} ({} entries)", id, files.len());
        Ok(files)
    }
}
