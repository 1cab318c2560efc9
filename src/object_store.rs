//! Content-addressable object store
//!
//! Keeps exactly one blob per distinct content hash under `objects/<hash>`,
//! however many paths or snapshots reference it.
//!
//! ## Writing
//!
//! [`ObjectStore::put`] never overwrites: when a blob is already present the
//! store trusts the hash and only compares the blob length with the size the
//! entry was scanned with. A length mismatch means two different contents
//! claim one hash and is reported as [`ArcsavvyError::StoreCollision`];
//! the stored blob is left untouched. Absent blobs are streamed into a
//! temporary file inside `objects/` and renamed into place, so a crash never
//! leaves a truncated blob under a valid name.
//!
//! Puts of the same hash are serialised through a per-hash lock; puts of
//! different hashes run concurrently.
//!
//! ## Verification
//!
//! [`ObjectStore::check`] reports an [`ObjectCheck`] value instead of failing:
//! a shallow check only proves the blob exists, a deep check re-hashes it.
//!
//! ## Example
//!
//! ```rust,ignore
//! use arcsavvy::object_store::ObjectStore;
//! use arcsavvy::hash::Sha256Hasher;
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = ObjectStore::create("archive/objects", Arc::new(Sha256Hasher))?;
//! store.put(&entry, std::path::Path::new("source/a.txt"))?;
//! assert!(store.check(&entry, true).is_ok());
//! # Ok(())
//! # }
//! ```

use crate::error::{ArcsavvyError, Result};
use crate::hash::ContentHasher;
use crate::types::FileEntry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, trace, warn};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// What a successful [`ObjectStore::put`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The blob was absent and has been written
    Stored {
        /// Bytes written
        bytes: u64,
    },
    /// A blob of matching length was already present; nothing was written
    AlreadyPresent,
}

impl PutOutcome {
    /// Whether new content entered the store
    pub fn is_new(&self) -> bool {
        matches!(self, PutOutcome::Stored { .. })
    }
}

/// Result of verifying one referenced object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectCheck {
    /// Blob present (and, for deep checks, matching)
    Ok,
    /// No blob under the entry's hash
    Missing,
    /// Stored bytes hash to something else
    HashMismatch {
        /// Hash recorded in the snapshot
        expected: String,
        /// Hash of the stored blob
        actual: String,
    },
    /// Stored blob length differs from the recorded size
    SizeMismatch {
        /// Size recorded in the snapshot
        expected: u64,
        /// Length of the stored blob
        actual: u64,
    },
    /// The entry or blob could not be verified at all
    Unreadable {
        /// Why
        reason: String,
    },
}

impl ObjectCheck {
    /// Whether the object passed
    pub fn is_ok(&self) -> bool {
        matches!(self, ObjectCheck::Ok)
    }
}

impl fmt::Display for ObjectCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectCheck::Ok => f.write_str("ok"),
            ObjectCheck::Missing => f.write_str("missing object"),
            ObjectCheck::HashMismatch { expected, actual } => {
                write!(f, "hash mismatch: expected {}, found {}", expected, actual)
            }
            ObjectCheck::SizeMismatch { expected, actual } => {
                write!(f, "size mismatch: expected {} bytes, found {}", expected, actual)
            }
            ObjectCheck::Unreadable { reason } => write!(f, "unreadable: {}", reason),
        }
    }
}

/// Aggregate numbers about the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Number of blobs
    pub objects: usize,
    /// Sum of blob sizes
    pub total_bytes: u64,
}

/// Blob repository keyed by content hash
pub struct ObjectStore {
    root: PathBuf,
    hasher: Arc<dyn ContentHasher>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStore")
            .field("root", &self.root)
            .field("hasher", &self.hasher.algorithm())
            .finish()
    }
}

impl ObjectStore {
    /// Store rooted at `root` without touching the filesystem
    pub fn new(root: impl Into<PathBuf>, hasher: Arc<dyn ContentHasher>) -> Self {
        Self {
            root: root.into(),
            hasher,
            locks: DashMap::new(),
        }
    }

    /// Store rooted at `root`, creating the directory if needed
    pub fn create(root: impl Into<PathBuf>, hasher: Arc<dyn ContentHasher>) -> Result<Self> {
        let store = Self::new(root, hasher);
        fs::create_dir_all(&store.root)?;
        Ok(store)
    }

    /// Directory holding the blobs
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the blob for `hash` lives
    pub fn object_path(&self, hash: &str) -> PathBuf {
        self.root.join(hash)
    }

    /// Store the content of `entry`, read from `source`, unless already present
    ///
    /// The source file is opened only when the blob is absent.
    ///
    /// # Errors
    ///
    /// - [`ArcsavvyError::StoreCollision`] if a blob of a different length
    ///   already holds this hash
    /// - [`ArcsavvyError::InvalidEntry`] if `entry` is not a hashed regular file
    /// - [`ArcsavvyError::Scan`] if `source` cannot be opened or read
    /// - [`ArcsavvyError::Io`] if the blob cannot be written into the store
    pub fn put(&self, entry: &FileEntry, source: &Path) -> Result<PutOutcome> {
        self.store_from(entry, source, || File::open(source))
    }

    /// Store the content of `entry`, obtaining a reader from `open` on demand
    ///
    /// Failures of `open` or of the reader are scan faults on `entry.path`.
    pub fn put_with<R, F>(&self, entry: &FileEntry, open: F) -> Result<PutOutcome>
    where
        R: Read,
        F: FnOnce() -> io::Result<R>,
    {
        self.store_from(entry, Path::new(&entry.path), open)
    }

    fn store_from<R, F>(&self, entry: &FileEntry, source: &Path, open: F) -> Result<PutOutcome>
    where
        R: Read,
        F: FnOnce() -> io::Result<R>,
    {
        let hash = blob_hash(entry)?;

        let lock = self.locks.entry(hash.to_string()).or_default().clone();
        let result = {
            let _guard = lock.lock();
            self.write_blob(entry, hash, source, open)
        };
        drop(lock);
        self.release_lock(hash);
        result
    }

    fn write_blob<R, F>(&self, entry: &FileEntry, hash: &str, source: &Path, open: F) -> Result<PutOutcome>
    where
        R: Read,
        F: FnOnce() -> io::Result<R>,
    {
        let path = self.object_path(hash);
        match fs::metadata(&path) {
            Ok(existing) => {
                if existing.len() != entry.size {
                    warn!(
                        "Collision on {}: stored {} bytes, {} has {}",
                        entry.short_hash(),
                        existing.len(),
                        entry.path,
                        entry.size
                    );
                    return Err(ArcsavvyError::StoreCollision {
                        hash: hash.to_string(),
                        path: entry.path.clone(),
                        stored_size: existing.len(),
                        entry_size: entry.size,
                    });
                }
                trace!("Object {} already present", entry.short_hash());
                return Ok(PutOutcome::AlreadyPresent);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut reader = open().map_err(|e| ArcsavvyError::scan(source, e))?;
        let mut temp = NamedTempFile::new_in(&self.root)?;
        let bytes = copy_from_source(&mut reader, &mut temp, source)?;
        if bytes != entry.size {
            return Err(ArcsavvyError::InvalidEntry {
                path: entry.path.clone(),
                reason: format!(
                    "content changed since scan: expected {} bytes, read {}",
                    entry.size, bytes
                ),
            });
        }
        temp.flush()?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| ArcsavvyError::Io(e.error))?;

        debug!("Stored object {} ({} bytes) for {}", entry.short_hash(), bytes, entry.path);
        Ok(PutOutcome::Stored { bytes })
    }

    /// Delete the blob for `hash`
    ///
    /// Callers must make sure no snapshot still references it.
    pub fn remove(&self, hash: &str) -> Result<()> {
        validate_hash(hash)?;
        let lock = self.locks.entry(hash.to_string()).or_default().clone();
        let result = {
            let _guard = lock.lock();
            fs::remove_file(self.object_path(hash))
        };
        drop(lock);
        self.release_lock(hash);

        match result {
            Ok(()) => {
                debug!("Removed object {}", &hash[..8.min(hash.len())]);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ArcsavvyError::ObjectNotFound(hash.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the lock for `hash` once no other caller holds it
    fn release_lock(&self, hash: &str) {
        self.locks.remove_if(hash, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Whether a blob exists for `hash`
    pub fn exists(&self, hash: &str) -> bool {
        validate_hash(hash).is_ok() && self.object_path(hash).is_file()
    }

    /// Open the blob for `hash` for reading
    pub fn open(&self, hash: &str) -> Result<File> {
        validate_hash(hash)?;
        File::open(self.object_path(hash)).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                ArcsavvyError::ObjectNotFound(hash.to_string())
            } else {
                ArcsavvyError::Io(e)
            }
        })
    }

    /// Verify the blob referenced by `entry`
    ///
    /// Shallow checks only test presence. Deep checks re-read the blob and
    /// compare its length and digest with the entry.
    pub fn check(&self, entry: &FileEntry, deep: bool) -> ObjectCheck {
        let hash = match blob_hash(entry) {
            Ok(hash) => hash,
            Err(e) => return ObjectCheck::Unreadable { reason: e.to_string() },
        };
        let path = self.object_path(hash);

        if !deep {
            return if path.is_file() { ObjectCheck::Ok } else { ObjectCheck::Missing };
        }

        match self.hasher.hash_file(&path) {
            Ok((_, actual)) if actual != entry.size => ObjectCheck::SizeMismatch {
                expected: entry.size,
                actual,
            },
            Ok((actual, _)) if actual != hash => ObjectCheck::HashMismatch {
                expected: hash.to_string(),
                actual,
            },
            Ok(_) => ObjectCheck::Ok,
            Err(e) if e.kind() == io::ErrorKind::NotFound => ObjectCheck::Missing,
            Err(e) => ObjectCheck::Unreadable { reason: e.to_string() },
        }
    }

    /// Every stored hash, sorted
    pub fn list(&self) -> Result<Vec<String>> {
        let read_dir = match fs::read_dir(&self.root) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut hashes = Vec::new();
        for item in read_dir {
            let item = item?;
            if !item.file_type()?.is_file() {
                continue;
            }
            let name = item.file_name().to_string_lossy().into_owned();
            // Skips in-flight temp files
            if validate_hash(&name).is_ok() {
                hashes.push(name);
            }
        }
        hashes.sort();
        Ok(hashes)
    }

    /// Count and total size of stored blobs
    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        for hash in self.list()? {
            stats.objects += 1;
            stats.total_bytes += fs::metadata(self.object_path(&hash))?.len();
        }
        Ok(stats)
    }
}

/// Copy `reader` into `writer`, blaming read failures on `source`
fn copy_from_source<R: Read, W: Write>(reader: &mut R, writer: &mut W, source: &Path) -> Result<u64> {
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ArcsavvyError::scan(source, e)),
        };
        writer.write_all(&buffer[..read])?;
        total += read as u64;
    }
}

/// Hash of a storable entry, rejecting anything that cannot name a blob
fn blob_hash(entry: &FileEntry) -> Result<&str> {
    if !entry.is_file() {
        return Err(ArcsavvyError::InvalidEntry {
            path: entry.path.clone(),
            reason: "only regular files have stored content".to_string(),
        });
    }
    let hash = entry.hash().ok_or_else(|| ArcsavvyError::InvalidEntry {
        path: entry.path.clone(),
        reason: "regular file without content hash".to_string(),
    })?;
    validate_hash(hash).map_err(|_| ArcsavvyError::InvalidEntry {
        path: entry.path.clone(),
        reason: format!("malformed content hash {:?}", hash),
    })?;
    Ok(hash)
}

fn validate_hash(hash: &str) -> Result<()> {
    if !hash.is_empty() && hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(ArcsavvyError::internal(format!("Not a content hash: {:?}", hash)))
    }
}
