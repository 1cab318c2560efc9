//! Change detection between two tree states
//!
//! The detector compares a historical [`DualIndex`] against a new tree state
//! and classifies every path present in either state into exactly one
//! [`ChangeEvent`]. It uses nothing but content hashes and metadata: there is
//! no change log and no filesystem event source.
//!
//! ## Algorithm
//!
//! Each entry of the new state is classified against the historical index:
//!
//! - **Same path existed**: the historical entry is marked seen; differing
//!   size or hash gives `Modified` (sole holder of the old content) or
//!   `ModifiedSharedInstance` (other paths hold it too), a differing mode
//!   gives `ModeChanged`, otherwise `Unchanged`.
//! - **Path is new, content unknown**: `New`.
//! - **Path is new, content held by exactly one historical path**: `Renamed`
//!   when the new state is fully known and that path is gone from it (the
//!   source is then marked seen), `Copied` otherwise.
//! - **Path is new, content held by several historical paths**: `Copied` from
//!   the first of them in historical index order. This tie-break is a
//!   heuristic; every time it fires an [`AmbiguousAttribution`] is reported.
//!
//! A trailing pass then visits every historical entry that was never marked
//! seen: `DeletedSharedInstance` if its content is still present in the new
//! state, `Deleted` otherwise.
//!
//! ## Drive modes
//!
//! - **Offline** ([`ChangeDetector::compare`]): the whole new file index is
//!   known up front, which enables rename detection.
//! - **Online** ([`ChangeDetector::compare_online`]): entries arrive one by one
//!   from a live scan and are classified as they come, with no lookahead.
//!   A moved file is reported as `Copied` plus `DeletedSharedInstance` of
//!   its old path instead of `Renamed`.
//!
//! ## Reactions
//!
//! Every event is delivered to a caller-supplied [`ChangeReaction`]. The
//! detector depends only on that trait; what happens per event (storing
//! content, recording a diff, nothing at all) is the reaction's business.

use crate::error::Result;
use crate::indexer::Indexer;
use crate::types::{ChangeEvent, ChangeStats, DualIndex, FileEntry, FileIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, trace, warn};

/// Per-kind callbacks invoked by the detector
///
/// Implementations decide what a change means for them. Returning an error
/// aborts the detection run.
///
/// # Examples
///
/// ```rust
/// use arcsavvy::detector::{ChangeDetector, ChangeReaction};
/// use arcsavvy::types::{DualIndex, FileEntry, FileIndex};
/// use arcsavvy::Result;
///
/// #[derive(Default)]
/// struct CountNew(usize);
///
/// impl ChangeReaction for CountNew {
///     fn on_new(&mut self, _entry: &FileEntry) -> Result<()> { self.0 += 1; Ok(()) }
///     fn on_renamed(&mut self, _: &FileEntry, _: &FileEntry) -> Result<()> { Ok(()) }
///     fn on_copied(&mut self, _: &FileEntry, _: &FileEntry) -> Result<()> { Ok(()) }
///     fn on_modified(&mut self, _: &FileEntry, _: &FileEntry) -> Result<()> { Ok(()) }
///     fn on_modified_shared_instance(&mut self, _: &FileEntry, _: &FileEntry) -> Result<()> { Ok(()) }
///     fn on_mode_changed(&mut self, _: &FileEntry, _: &FileEntry) -> Result<()> { Ok(()) }
///     fn on_unchanged(&mut self, _: &FileEntry, _: &FileEntry) -> Result<()> { Ok(()) }
///     fn on_deleted(&mut self, _: &FileEntry) -> Result<()> { Ok(()) }
///     fn on_deleted_shared_instance(&mut self, _: &FileEntry) -> Result<()> { Ok(()) }
/// }
///
/// # fn main() -> Result<()> {
/// let mut files = FileIndex::new();
/// files.insert("a.txt".into(), FileEntry::file("a.txt", 1, 0o644, "h"));
///
/// let mut reaction = CountNew::default();
/// ChangeDetector::new().compare(&DualIndex::empty(), files, &mut reaction)?;
/// assert_eq!(reaction.0, 1);
/// # Ok(())
/// # }
/// ```
pub trait ChangeReaction {
    /// A path whose content was never seen before
    fn on_new(&mut self, entry: &FileEntry) -> Result<()>;

    /// The sole holder of some content moved from `from` to `to`
    fn on_renamed(&mut self, from: &FileEntry, to: &FileEntry) -> Result<()>;

    /// Known content appeared at a new path
    fn on_copied(&mut self, from: &FileEntry, to: &FileEntry) -> Result<()>;

    /// Content changed at a path that solely held the old content
    fn on_modified(&mut self, from: &FileEntry, to: &FileEntry) -> Result<()>;

    /// Content changed at a path whose old content is held elsewhere too
    fn on_modified_shared_instance(&mut self, from: &FileEntry, to: &FileEntry) -> Result<()>;

    /// Only the permission bits changed
    fn on_mode_changed(&mut self, from: &FileEntry, to: &FileEntry) -> Result<()>;

    /// Nothing changed
    fn on_unchanged(&mut self, from: &FileEntry, to: &FileEntry) -> Result<()>;

    /// A path disappeared together with the last copy of its content
    fn on_deleted(&mut self, entry: &FileEntry) -> Result<()>;

    /// A path disappeared but its content survives at another path
    fn on_deleted_shared_instance(&mut self, entry: &FileEntry) -> Result<()>;

    /// A copy source had to be picked among several candidates
    fn on_ambiguous(&mut self, _warning: &AmbiguousAttribution) {}
}

/// Deliver `event` to the matching callback of `reaction`
pub fn dispatch<R: ChangeReaction + ?Sized>(reaction: &mut R, event: &ChangeEvent) -> Result<()> {
    match event {
        ChangeEvent::New(entry) => reaction.on_new(entry),
        ChangeEvent::Renamed { from, to } => reaction.on_renamed(from, to),
        ChangeEvent::Copied { from, to } => reaction.on_copied(from, to),
        ChangeEvent::Modified { from, to } => reaction.on_modified(from, to),
        ChangeEvent::ModifiedSharedInstance { from, to } => {
            reaction.on_modified_shared_instance(from, to)
        }
        ChangeEvent::ModeChanged { from, to } => reaction.on_mode_changed(from, to),
        ChangeEvent::Unchanged { from, to } => reaction.on_unchanged(from, to),
        ChangeEvent::Deleted(entry) => reaction.on_deleted(entry),
        ChangeEvent::DeletedSharedInstance(entry) => reaction.on_deleted_shared_instance(entry),
    }
}

/// Warning raised when a copy source was chosen by the first-match tie-break
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguousAttribution {
    /// New-state path being classified
    pub path: String,
    /// Content hash shared by all candidates
    pub hash: String,
    /// Historical path chosen as the source
    pub chosen: String,
    /// Every historical path holding the content, in index order
    pub candidates: Vec<String>,
}

impl fmt::Display for AmbiguousAttribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} has {} possible sources ({}); attributed to {}",
            self.path,
            self.candidates.len(),
            self.candidates.join(", "),
            self.chosen
        )
    }
}

/// Historical paths confirmed still represented in the new state
///
/// Scoped to one detection run and discarded afterwards.
#[derive(Debug, Clone, Default)]
pub struct SeenSet {
    paths: HashSet<String>,
}

impl SeenSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a historical path as seen
    pub fn mark(&mut self, path: &str) {
        self.paths.insert(path.to_string());
    }

    /// Whether a historical path was seen
    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    /// Number of seen paths
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Whether nothing was seen yet
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Result of classifying one new-state entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// The event for this entry
    pub event: ChangeEvent,
    /// Set when the copy source came from the tie-break
    pub ambiguity: Option<AmbiguousAttribution>,
}

/// Outcome of a full detection run
#[derive(Debug, Clone)]
pub struct Detection {
    /// Dual index of the new state
    pub index: DualIndex,
    /// Events per kind
    pub stats: ChangeStats,
    /// Tie-break warnings, in the order they fired
    pub warnings: Vec<AmbiguousAttribution>,
}

/// Classifies changes between a historical index and a new tree state
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeDetector {
    indexer: Indexer,
}

impl ChangeDetector {
    /// Create a detector
    pub fn new() -> Self {
        Self { indexer: Indexer::new() }
    }

    /// Classify a single new-state entry
    ///
    /// `new_files` is the complete new file index when it is known (offline
    /// mode) and `None` during a live scan. `seen` is updated with every
    /// historical path this entry accounts for.
    pub fn classify(
        &self,
        historical: &DualIndex,
        entry: &FileEntry,
        new_files: Option<&FileIndex>,
        seen: &mut SeenSet,
    ) -> Classification {
        if let Some(old) = historical.get(&entry.path) {
            seen.mark(&old.path);
            let event = if old.kind != entry.kind || old.content_differs(entry) {
                let refs = old
                    .hash()
                    .and_then(|h| historical.object(h))
                    .map_or(1, |record| record.refs);
                if refs == 1 {
                    ChangeEvent::Modified { from: old.clone(), to: entry.clone() }
                } else {
                    ChangeEvent::ModifiedSharedInstance { from: old.clone(), to: entry.clone() }
                }
            } else if old.mode != entry.mode {
                ChangeEvent::ModeChanged { from: old.clone(), to: entry.clone() }
            } else {
                ChangeEvent::Unchanged { from: old.clone(), to: entry.clone() }
            };
            return Classification { event, ambiguity: None };
        }

        let record = entry.hash().and_then(|h| historical.object(h).map(|r| (h, r)));
        let Some((hash, record)) = record else {
            return Classification { event: ChangeEvent::New(entry.clone()), ambiguity: None };
        };
        let Some(candidate) = record.files.first() else {
            return Classification { event: ChangeEvent::New(entry.clone()), ambiguity: None };
        };

        if record.refs == 1 {
            let moved = new_files
                .map(|files| !files.contains_key(&candidate.path))
                .unwrap_or(false);
            // A source can only be renamed once; later holders are copies of it
            if moved && !seen.contains(&candidate.path) {
                seen.mark(&candidate.path);
                return Classification {
                    event: ChangeEvent::Renamed { from: candidate.clone(), to: entry.clone() },
                    ambiguity: None,
                };
            }
            return Classification {
                event: ChangeEvent::Copied { from: candidate.clone(), to: entry.clone() },
                ambiguity: None,
            };
        }

        let ambiguity = AmbiguousAttribution {
            path: entry.path.clone(),
            hash: hash.to_string(),
            chosen: candidate.path.clone(),
            candidates: record.files.iter().map(|e| e.path.clone()).collect(),
        };
        Classification {
            event: ChangeEvent::Copied { from: candidate.clone(), to: entry.clone() },
            ambiguity: Some(ambiguity),
        }
    }

    /// Compare against a fully known new state (offline mode)
    pub fn compare<R: ChangeReaction + ?Sized>(
        &self,
        historical: &DualIndex,
        new_files: FileIndex,
        reaction: &mut R,
    ) -> Result<Detection> {
        let mut run = DetectionRun::new(historical, reaction);
        for entry in new_files.values() {
            let classification = self.classify(historical, entry, Some(&new_files), &mut run.seen);
            run.deliver(classification)?;
        }

        let index = self.indexer.build_dual_index(new_files);
        run.finish(index)
    }

    /// Compare against entries produced incrementally by a live scan (online mode)
    ///
    /// Each entry is classified as soon as it arrives. A failing item aborts
    /// the run with that error; reactions already delivered are not undone.
    pub fn compare_online<R, I>(
        &self,
        historical: &DualIndex,
        entries: I,
        reaction: &mut R,
    ) -> Result<Detection>
    where
        R: ChangeReaction + ?Sized,
        I: IntoIterator<Item = Result<FileEntry>>,
    {
        let mut run = DetectionRun::new(historical, reaction);
        let mut files = FileIndex::new();

        for entry in entries {
            let entry = entry?;
            let classification = self.classify(historical, &entry, None, &mut run.seen);
            run.deliver(classification)?;
            files.insert(entry.path.clone(), entry);
        }

        let index = self.indexer.build_dual_index(files);
        run.finish(index)
    }
}

/// State of one detection run
struct DetectionRun<'a, R: ChangeReaction + ?Sized> {
    historical: &'a DualIndex,
    reaction: &'a mut R,
    seen: SeenSet,
    stats: ChangeStats,
    warnings: Vec<AmbiguousAttribution>,
}

impl<'a, R: ChangeReaction + ?Sized> DetectionRun<'a, R> {
    fn new(historical: &'a DualIndex, reaction: &'a mut R) -> Self {
        Self {
            historical,
            reaction,
            seen: SeenSet::new(),
            stats: ChangeStats::default(),
            warnings: Vec::new(),
        }
    }

    fn deliver(&mut self, classification: Classification) -> Result<()> {
        if let Some(warning) = classification.ambiguity {
            warn!("Ambiguous attribution: {}", warning);
            self.reaction.on_ambiguous(&warning);
            self.warnings.push(warning);
        }
        self.emit(&classification.event)
    }

    fn emit(&mut self, event: &ChangeEvent) -> Result<()> {
        trace!("{}", event);
        self.stats.record(event.kind());
        dispatch(self.reaction, event)
    }

    /// Trailing pass over historical entries the new state never accounted for
    fn finish(mut self, index: DualIndex) -> Result<Detection> {
        let historical = self.historical;
        for entry in historical.files().values() {
            if self.seen.contains(&entry.path) {
                continue;
            }
            let still_held = entry.hash().is_some_and(|h| index.object(h).is_some());
            let event = if still_held {
                ChangeEvent::DeletedSharedInstance(entry.clone())
            } else {
                ChangeEvent::Deleted(entry.clone())
            };
            self.emit(&event)?;
        }

        debug!(
            "Detection finished: {} historical, {} new, {} events, {} ambiguous",
            historical.len(),
            index.len(),
            self.stats.total(),
            self.warnings.len()
        );

        Ok(Detection {
            index,
            stats: self.stats,
            warnings: self.warnings,
        })
    }
}
