//! Source tree scanning
//!
//! [`TreeScanner`] turns a directory tree into [`FileEntry`] values keyed by
//! their archive path. Two flavours are offered:
//!
//! - [`TreeScanner::walk`] is lazy: entries are produced one at a time, each
//!   regular file hashed as it is reached. This is what online change
//!   detection consumes.
//! - [`TreeScanner::scan`] walks the tree first and then hashes every regular
//!   file on a bounded rayon pool, returning a complete [`FileIndex`].
//!
//! Both walk in a deterministic order (siblings sorted by name, directories
//! before their contents) and never follow symbolic links: links and special
//! files are reported as [`EntryKind::Other`](crate::types::EntryKind) and
//! never hashed. Any failure to read the tree is an
//! [`ArcsavvyError::Scan`]: a partial scan is never returned.
//!
//! ## Ignore patterns
//!
//! Patterns are globs matched against archive paths (`docs/a.txt`). A
//! pattern without a slash also matches at any depth, and a trailing slash
//! is ignored, so `target/` skips every `target` directory with its whole
//! subtree.
//!
//! ## Example
//!
//! ```rust,ignore
//! use arcsavvy::scanner::TreeScanner;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let scanner = TreeScanner::new("./project")
//!     .with_ignore_patterns(vec!["*.log".to_string(), "target/".to_string()])
//!     .with_parallel_workers(4);
//!
//! let files = scanner.scan()?;
//! println!("{} entries", files.len());
//! # Ok(())
//! # }
//! ```

use crate::error::{ArcsavvyError, Result};
use crate::hash::{ContentHasher, Sha256Hasher};
use crate::types::{FileEntry, FileIndex};
use crate::utils::{archive_path, get_permissions};
use globset::{Glob, GlobSet, GlobSetBuilder};
use rayon::prelude::*;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Walks and hashes a source tree
#[derive(Debug, Clone)]
pub struct TreeScanner {
    root: PathBuf,
    ignore_patterns: Vec<String>,
    exclude: Vec<PathBuf>,
    parallel_workers: usize,
    hasher: Arc<dyn ContentHasher>,
}

impl TreeScanner {
    /// Scanner for the tree rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ignore_patterns: Vec::new(),
            exclude: Vec::new(),
            parallel_workers: num_cpus::get(),
            hasher: Arc::new(Sha256Hasher),
        }
    }

    /// Skip archive paths matching any of `patterns`
    pub fn with_ignore_patterns(mut self, patterns: Vec<String>) -> Self {
        self.ignore_patterns = patterns;
        self
    }

    /// Skip a filesystem path and everything below it
    ///
    /// Used to keep the archive out of its own snapshots when it lives inside
    /// the source tree.
    pub fn with_exclude(mut self, path: impl Into<PathBuf>) -> Self {
        self.exclude.push(path.into());
        self
    }

    /// Threads used by [`scan`](Self::scan) for hashing (at least one)
    pub fn with_parallel_workers(mut self, workers: usize) -> Self {
        self.parallel_workers = workers.max(1);
        self
    }

    /// Digest used for regular file content
    pub fn with_hasher(mut self, hasher: Arc<dyn ContentHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    /// Root being scanned
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lazily walk the tree, hashing each regular file as it is reached
    ///
    /// Fails up front if the root is not a readable directory or a pattern
    /// does not parse. Later failures are yielded as `Err` items.
    pub fn walk(&self) -> Result<impl Iterator<Item = Result<FileEntry>> + '_> {
        let discovery = self.discover()?;
        Ok(discovery.map(move |item| item.and_then(|found| self.build_entry(found))))
    }

    /// Walk the whole tree, then hash regular files in parallel
    pub fn scan(&self) -> Result<FileIndex> {
        let start = Instant::now();
        let found = self.discover()?.collect::<Result<Vec<_>>>()?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.parallel_workers)
            .build()?;
        let entries = pool.install(|| {
            found
                .into_par_iter()
                .map(|item| self.build_entry(item))
                .collect::<Result<Vec<_>>>()
        })?;

        let files: FileIndex = entries.into_iter().map(|e| (e.path.clone(), e)).collect();
        debug!(
            "Scanned {} entries under {:?} in {:?} ({} workers)",
            files.len(),
            self.root,
            start.elapsed(),
            self.parallel_workers
        );
        Ok(files)
    }

    fn discover(&self) -> Result<Discovery> {
        let root = fs::canonicalize(&self.root).map_err(|e| ArcsavvyError::scan(&self.root, e))?;
        let metadata = fs::metadata(&root).map_err(|e| ArcsavvyError::scan(&root, e))?;
        if !metadata.is_dir() {
            return Err(ArcsavvyError::scan(
                &root,
                io::Error::new(io::ErrorKind::InvalidInput, "source is not a directory"),
            ));
        }

        let exclude = self
            .exclude
            .iter()
            .map(|p| fs::canonicalize(p).unwrap_or_else(|_| p.clone()))
            .collect();

        let inner = WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        Ok(Discovery {
            ignore: build_ignore_set(&self.ignore_patterns)?,
            exclude,
            root,
            inner,
        })
    }

    fn build_entry(&self, found: Discovered) -> Result<FileEntry> {
        let mode = get_permissions(&found.metadata);
        let file_type = found.metadata.file_type();

        let entry = if file_type.is_dir() {
            FileEntry::directory(found.rel, mode)
        } else if file_type.is_file() {
            let (hash, size) = self
                .hasher
                .hash_file(&found.path)
                .map_err(|e| ArcsavvyError::scan(&found.path, e))?;
            FileEntry::file(found.rel, size, mode, hash)
        } else {
            FileEntry::other(found.rel, mode)
        };

        trace!("Scanned {} ({})", entry.path, entry.short_hash());
        Ok(entry)
    }
}

/// Compile ignore patterns into one matcher
fn build_ignore_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let pattern = pattern.trim_end_matches('/');
        if pattern.is_empty() {
            continue;
        }
        builder.add(Glob::new(pattern)?);
        if !pattern.contains('/') {
            builder.add(Glob::new(&format!("**/{}", pattern))?);
        }
    }
    Ok(builder.build()?)
}

/// A tree element found by the walk, not yet hashed
struct Discovered {
    path: PathBuf,
    rel: String,
    metadata: fs::Metadata,
}

/// Walk state: the underlying walker plus the filters applied to it
struct Discovery {
    root: PathBuf,
    ignore: GlobSet,
    exclude: Vec<PathBuf>,
    inner: walkdir::IntoIter,
}

impl Discovery {
    fn walk_error(&self, err: walkdir::Error) -> ArcsavvyError {
        let path = err.path().unwrap_or(&self.root).to_path_buf();
        match err.io_error() {
            Some(io) => ArcsavvyError::scan(path, io::Error::new(io.kind(), io.to_string())),
            None => ArcsavvyError::WalkDir(err),
        }
    }

    fn skip(&mut self, is_dir: bool) {
        if is_dir {
            self.inner.skip_current_dir();
        }
    }
}

impl Iterator for Discovery {
    type Item = Result<Discovered>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let dent = match self.inner.next()? {
                Ok(dent) => dent,
                Err(e) => return Some(Err(self.walk_error(e))),
            };
            if dent.depth() == 0 {
                continue;
            }

            let is_dir = dent.file_type().is_dir();
            if self.exclude.iter().any(|ex| dent.path().starts_with(ex)) {
                trace!("Excluded {:?}", dent.path());
                self.skip(is_dir);
                continue;
            }

            let rel = match archive_path(dent.path(), &self.root) {
                Ok(rel) => rel,
                Err(e) => return Some(Err(e)),
            };
            if self.ignore.is_match(&rel) {
                trace!("Ignored {}", rel);
                self.skip(is_dir);
                continue;
            }

            let metadata = match dent.metadata() {
                Ok(metadata) => metadata,
                Err(e) => return Some(Err(self.walk_error(e))),
            };

            return Some(Ok(Discovered {
                path: dent.into_path(),
                rel,
                metadata,
            }));
        }
    }
}
