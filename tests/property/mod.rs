//! Property-based testing for arcsavvy
//!
//! Uses proptest to verify storage and detection invariants across
//! randomly generated trees and tree transitions.

use ::arcsavvy::*;
use tempfile::TempDir;
use proptest::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// Strategy for generating file operations
#[derive(Debug, Clone)]
pub enum FileOperation {
    Create { path: PathBuf, content: Vec<u8> },
    Modify { path: PathBuf, content: Vec<u8> },
    Delete { path: PathBuf },
}

/// Generate a random file operation
fn file_operation_strategy() -> impl Strategy<Value = FileOperation> {
    prop_oneof![
        3 => (path_strategy(), content_strategy()).prop_map(|(path, content)| {
            FileOperation::Create { path, content }
        }),
        1 => (path_strategy(), content_strategy()).prop_map(|(path, content)| {
            FileOperation::Modify { path, content }
        }),
        1 => path_strategy().prop_map(|path| FileOperation::Delete { path }),
    ]
}

/// Generate random file paths
///
/// Directory names never contain a dot and file names always do, so a
/// generated file never lands where a generated directory is.
fn path_strategy() -> impl Strategy<Value = PathBuf> {
    let dir_strategy = prop::collection::vec("dir[0-3]", 0..=2);
    let filename_strategy = "[a-e]{1,2}\\.(txt|rs|md)";

    (dir_strategy, filename_strategy).prop_map(|(dirs, filename)| {
        let mut path = PathBuf::new();
        for dir in dirs {
            path = path.join(dir);
        }
        path.join(filename)
    })
}

/// Generate random file content
///
/// A small pool of fixed contents makes duplicates common.
fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        "[a-zA-Z0-9 \n]{0,200}".prop_map(|s| s.into_bytes()),
        prop::collection::vec(any::<u8>(), 1..2000),
        prop::sample::select(vec!["shared", "license", ""]).prop_map(|s| s.as_bytes().to_vec()),
    ]
}

/// Apply a file operation to the filesystem
fn apply_operation(root: &Path, op: &FileOperation) -> anyhow::Result<()> {
    match op {
        FileOperation::Create { path, content } => {
            let full_path = root.join(path);
            if let Some(parent) = full_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(full_path, content)?;
        }
        FileOperation::Modify { path, content } => {
            let full_path = root.join(path);
            if full_path.exists() {
                fs::write(full_path, content)?;
            }
        }
        FileOperation::Delete { path } => {
            let full_path = root.join(path);
            if full_path.exists() {
                fs::remove_file(full_path)?;
            }
        }
    }
    Ok(())
}

/// Compute a hash of the entire directory state
fn compute_directory_hash(root: &Path) -> anyhow::Result<String> {
    use sha2::{Sha256, Digest};
    use walkdir::WalkDir;

    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let relative = entry.path().strip_prefix(root)?;
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update(b"\0");
        if entry.file_type().is_file() {
            hasher.update(&fs::read(entry.path())?);
        }
        hasher.update(b"\0");
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Distinct content hashes of the regular files under `root`
fn distinct_hashes(root: &Path) -> anyhow::Result<BTreeSet<String>> {
    let hasher = Sha256Hasher;
    let mut hashes = BTreeSet::new();
    for entry in walkdir::WalkDir::new(root).min_depth(1) {
        let entry = entry?;
        if entry.file_type().is_file() {
            hashes.insert(hasher.hash_bytes(&fs::read(entry.path())?));
        }
    }
    Ok(hashes)
}

fn build_archiver(storage: &TempDir) -> Archiver {
    ArchiverBuilder::new()
        .parallel_workers(2)
        .build(storage.path().join("archive"))
        .unwrap()
}

/// How one historical file fares in the next state
#[derive(Debug, Clone, Copy)]
enum Fate {
    Keep,
    Modify(u8),
    Delete,
    Move,
    Copy,
}

fn fate_strategy() -> impl Strategy<Value = Fate> {
    prop_oneof![
        3 => Just(Fate::Keep),
        1 => any::<u8>().prop_map(Fate::Modify),
        1 => Just(Fate::Delete),
        1 => Just(Fate::Move),
        1 => Just(Fate::Copy),
    ]
}

fn content_hash(content: u8) -> String {
    Sha256Hasher.hash_bytes(&[content])
}

fn file_index(entries: impl IntoIterator<Item = FileEntry>) -> FileIndex {
    entries.into_iter().map(|e| (e.path.clone(), e)).collect()
}

/// A historical file table and its successor, built from per-file fates
fn transition(contents: &[u8], fates: &[Fate]) -> (FileIndex, FileIndex) {
    let historical = file_index(
        contents
            .iter()
            .enumerate()
            .map(|(i, c)| FileEntry::file(format!("f{:02}", i), 1, 0o644, content_hash(*c))),
    );

    let mut next = Vec::new();
    for ((path, entry), fate) in historical.iter().zip(fates.iter().cycle()) {
        let hash = entry.hash.clone().unwrap_or_default();
        match fate {
            Fate::Keep => next.push(entry.clone()),
            Fate::Modify(c) => {
                next.push(FileEntry::file(path.clone(), 1, 0o644, content_hash(c.wrapping_add(128))))
            }
            Fate::Delete => {}
            Fate::Move => next.push(FileEntry::file(format!("moved/{}", path), 1, 0o644, hash.clone())),
            Fate::Copy => {
                next.push(entry.clone());
                next.push(FileEntry::file(format!("copies/{}", path), 1, 0o644, hash.clone()));
            }
        }
    }
    (historical, file_index(next))
}

fn detect(historical: &FileIndex, next: FileIndex) -> (Vec<ChangeEvent>, Detection) {
    let historical = Indexer::new().build_dual_index(historical.clone());
    let mut recorder = ChangeRecorder::new();
    let detection = ChangeDetector::new()
        .compare(&historical, next, &mut recorder)
        .unwrap();
    (recorder.into_events(), detection)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Restoring a snapshot reproduces the tree exactly
    #[test]
    fn snapshot_restore_identity(
        operations in prop::collection::vec(file_operation_strategy(), 1..40)
    ) {
        let source = TempDir::new().unwrap();
        let storage = TempDir::new().unwrap();
        let archiver = build_archiver(&storage);

        for op in &operations {
            apply_operation(source.path(), op).unwrap();
        }
        let outcome = archiver.snapshot(source.path()).unwrap();
        let original_hash = compute_directory_hash(source.path()).unwrap();

        let target = storage.path().join("restored");
        archiver.restore(&target, &outcome.id).unwrap();
        prop_assert_eq!(original_hash, compute_directory_hash(&target).unwrap());
    }

    /// The store holds exactly one blob per distinct content, across snapshots
    #[test]
    fn store_deduplicates_content(
        first in prop::collection::vec(file_operation_strategy(), 1..30),
        second in prop::collection::vec(file_operation_strategy(), 0..30)
    ) {
        let source = TempDir::new().unwrap();
        let storage = TempDir::new().unwrap();
        let archiver = build_archiver(&storage);

        let mut expected = BTreeSet::new();
        for ops in [&first, &second] {
            for op in ops.iter() {
                apply_operation(source.path(), op).unwrap();
            }
            expected.extend(distinct_hashes(source.path()).unwrap());
            archiver.snapshot(source.path()).unwrap();
        }

        let stored: BTreeSet<String> = archiver.store().list().unwrap().into_iter().collect();
        prop_assert_eq!(stored, expected);
    }

    /// Snapshotting an unchanged tree stores nothing and reports no change
    #[test]
    fn snapshot_is_idempotent(
        operations in prop::collection::vec(file_operation_strategy(), 1..30)
    ) {
        let source = TempDir::new().unwrap();
        let storage = TempDir::new().unwrap();
        let archiver = build_archiver(&storage);

        for op in &operations {
            apply_operation(source.path(), op).unwrap();
        }
        let first = archiver.snapshot(source.path()).unwrap();
        let stats = archiver.stats().unwrap();
        let second = archiver.snapshot(source.path()).unwrap();

        prop_assert_eq!(second.new_objects, 0);
        prop_assert_eq!(archiver.stats().unwrap(), stats);
        prop_assert!(!second.stats.has_changes());
        prop_assert_eq!(second.index, first.index);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Every path gets exactly one event and every historical path is
    /// accounted for
    #[test]
    fn detection_accounts_for_every_path(
        contents in prop::collection::vec(0u8..6, 1..24),
        fates in prop::collection::vec(fate_strategy(), 1..24)
    ) {
        let (historical, next) = transition(&contents, &fates);
        let (events, detection) = detect(&historical, next.clone());
        info!("{} historical, {} new, {} events", historical.len(), next.len(), events.len());

        prop_assert_eq!(detection.stats.total(), events.len());

        let mut by_path = BTreeMap::new();
        for event in &events {
            prop_assert!(by_path.insert(event.path().to_string(), event.kind()).is_none(),
                "{} reported twice", event.path());
        }

        for path in next.keys() {
            let kind = by_path.get(path).copied();
            prop_assert!(kind.is_some(), "{} missing", path);
            prop_assert!(!matches!(kind, Some(ChangeKind::Deleted | ChangeKind::DeletedSharedInstance)));
        }

        let mut rename_sources = BTreeSet::new();
        for event in &events {
            if let ChangeEvent::Renamed { from, .. } = event {
                prop_assert!(!next.contains_key(&from.path));
                prop_assert!(rename_sources.insert(from.path.clone()), "{} renamed twice", from.path);
            }
        }

        for (path, entry) in &historical {
            let accounted = next.contains_key(path) || rename_sources.contains(path);
            match by_path.get(path) {
                Some(ChangeKind::Deleted) => {
                    prop_assert!(!accounted);
                    prop_assert!(detection.index.object(entry.hash().unwrap()).is_none());
                }
                Some(ChangeKind::DeletedSharedInstance) => {
                    prop_assert!(!accounted);
                    prop_assert!(detection.index.object(entry.hash().unwrap()).is_some());
                }
                Some(_) => prop_assert!(next.contains_key(path)),
                None => prop_assert!(rename_sources.contains(path)),
            }
        }
    }

    /// Moving uniquely held content is always seen as a rename from its old path
    #[test]
    fn moves_of_unique_content_are_renames(
        moved in prop::collection::vec(any::<bool>(), 1..20)
    ) {
        let contents: Vec<u8> = (0..moved.len() as u8).collect();
        let fates: Vec<Fate> = moved
            .iter()
            .map(|&m| if m { Fate::Move } else { Fate::Keep })
            .collect();
        let (historical, next) = transition(&contents, &fates);
        let (events, detection) = detect(&historical, next);

        prop_assert!(detection.warnings.is_empty());
        for event in &events {
            match event {
                ChangeEvent::Renamed { from, to } => {
                    prop_assert_eq!(&to.path, &format!("moved/{}", from.path));
                }
                ChangeEvent::Unchanged { .. } => {}
                other => prop_assert!(false, "unexpected event {}", other),
            }
        }
        let renamed = detection.stats.count(ChangeKind::Renamed);
        prop_assert_eq!(renamed, moved.iter().filter(|&&m| m).count());
    }

    /// Comparing a state with itself changes nothing
    #[test]
    fn identical_states_are_unchanged(
        contents in prop::collection::vec(0u8..4, 0..24)
    ) {
        let (historical, _) = transition(&contents, &[Fate::Keep]);
        let (events, detection) = detect(&historical, historical.clone());

        prop_assert_eq!(events.len(), historical.len());
        prop_assert_eq!(detection.stats.count(ChangeKind::Unchanged), historical.len());
        prop_assert!(detection.warnings.is_empty());
    }
}
