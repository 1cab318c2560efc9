//! Chaos testing for arcsavvy
//!
//! Damages a populated archive the way disks and people do (flipped bytes,
//! truncated blobs, deleted objects, mangled snapshot files) and checks that
//! every failure is reported precisely and nothing panics.

use ::arcsavvy::*;
use tempfile::TempDir;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

use tracing::{info, warn};

/// A populated archive plus the tools to damage it
pub struct ArchiveChaosTest {
    pub archiver: Archiver,
    pub source_dir: TempDir,
    pub storage_dir: TempDir,
    pub chaos_engine: ChaosEngine,
}

impl ArchiveChaosTest {
    pub fn new(seed: u64) -> Self {
        let source_dir = TempDir::new().unwrap();
        let storage_dir = TempDir::new().unwrap();

        let archiver = ArchiverBuilder::new()
            .parallel_workers(4)
            .build(storage_dir.path().join("archive"))
            .unwrap();

        Self {
            archiver,
            source_dir,
            storage_dir,
            chaos_engine: ChaosEngine::new(seed),
        }
    }

    /// Write `count` files and take `snapshots` snapshots, changing a few
    /// files in between
    pub fn populate(&mut self, count: usize, snapshots: usize) -> anyhow::Result<Vec<SnapshotId>> {
        let root = self.source_dir.path().to_path_buf();
        fs::create_dir_all(root.join("nested/deeper"))?;
        for i in 0..count {
            let dir = match i % 3 {
                0 => root.clone(),
                1 => root.join("nested"),
                _ => root.join("nested/deeper"),
            };
            let content = format!("file {} {}", i, "payload ".repeat(i % 17 + 1));
            fs::write(dir.join(format!("f{:03}.txt", i)), content)?;
        }

        let mut ids = Vec::new();
        for round in 0..snapshots {
            if round > 0 {
                let victim = root.join(format!("f{:03}.txt", (round * 3) % count.max(1)));
                if victim.exists() {
                    fs::write(&victim, format!("round {}", round))?;
                }
            }
            ids.push(self.archiver.snapshot(&root)?.id);
        }
        info!("Populated archive with {} files and {} snapshots", count, ids.len());
        Ok(ids)
    }

    /// Paths of `id` that reference each damaged blob
    pub fn paths_referencing(&self, id: &SnapshotId, blobs: &[PathBuf]) -> anyhow::Result<BTreeSet<String>> {
        let hashes: BTreeSet<String> = blobs
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        let index = self.archiver.read(id)?;
        Ok(index
            .files()
            .values()
            .filter(|e| e.hash().is_some_and(|h| hashes.contains(h)))
            .map(|e| e.path.clone())
            .collect())
    }
}

/// Chaos engine for simulating damage
pub struct ChaosEngine {
    rng: StdRng,
}

impl ChaosEngine {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn collect_files(dir: &Path) -> Vec<PathBuf> {
        walkdir::WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().to_path_buf())
            .collect()
    }

    fn pick(&mut self, files: &mut Vec<PathBuf>) -> Option<PathBuf> {
        if files.is_empty() {
            return None;
        }
        let idx = self.rng.random_range(0..files.len());
        Some(files.remove(idx))
    }

    /// Flip random bytes of random files, keeping their length
    pub fn corrupt_random_files(&mut self, dir: &Path, count: usize) -> anyhow::Result<Vec<PathBuf>> {
        let mut files = Self::collect_files(dir);
        let mut corrupted = Vec::new();

        while corrupted.len() < count {
            let Some(file_path) = self.pick(&mut files) else { break };
            let mut content = fs::read(&file_path)?;
            if content.is_empty() {
                continue;
            }
            for _ in 0..10 {
                let byte_idx = self.rng.random_range(0..content.len());
                content[byte_idx] ^= self.rng.random_range(1..=255u8);
            }
            fs::write(&file_path, content)?;
            corrupted.push(file_path);
        }

        Ok(corrupted)
    }

    /// Cut random files to a random shorter length
    pub fn truncate_random_files(&mut self, dir: &Path, count: usize) -> anyhow::Result<Vec<PathBuf>> {
        let mut files = Self::collect_files(dir);
        let mut truncated = Vec::new();

        while truncated.len() < count {
            let Some(file_path) = self.pick(&mut files) else { break };
            let len = fs::metadata(&file_path)?.len();
            if len == 0 {
                continue;
            }
            let keep = self.rng.random_range(0..len);
            fs::OpenOptions::new().write(true).open(&file_path)?.set_len(keep)?;
            truncated.push(file_path);
        }

        Ok(truncated)
    }

    /// Chop JSON files in half
    pub fn corrupt_json_files(&mut self, dir: &Path, count: usize) -> anyhow::Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = Self::collect_files(dir)
            .into_iter()
            .filter(|p| p.extension().is_some_and(|e| e == "json"))
            .collect();
        let mut corrupted = Vec::new();

        while corrupted.len() < count {
            let Some(file_path) = self.pick(&mut files) else { break };
            let content = fs::read(&file_path)?;
            if content.len() < 4 {
                continue;
            }
            fs::write(&file_path, &content[..content.len() / 2])?;
            corrupted.push(file_path);
        }

        Ok(corrupted)
    }

    /// Delete random files
    pub fn delete_random_files(&mut self, dir: &Path, count: usize) -> anyhow::Result<Vec<PathBuf>> {
        let mut files = Self::collect_files(dir);
        let mut deleted = Vec::new();

        while deleted.len() < count {
            let Some(file_path) = self.pick(&mut files) else { break };
            fs::remove_file(&file_path)?;
            deleted.push(file_path);
        }

        Ok(deleted)
    }
}

/// Write a hand-made snapshot file as the current alias
fn write_current_index(archiver: &Archiver, records: serde_json::Value) {
    fs::create_dir_all(archiver.root()).unwrap();
    fs::write(
        archiver.snapshots().path_of(&SnapshotId::Current),
        serde_json::to_vec_pretty(&records).unwrap(),
    )
    .unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flipped_blobs_found_by_deep_check_only() {
        let mut chaos = ArchiveChaosTest::new(1);
        let ids = chaos.populate(30, 3).unwrap();
        let objects = chaos.archiver.store().root().to_path_buf();

        let damaged = chaos.chaos_engine.corrupt_random_files(&objects, 4).unwrap();
        assert_eq!(damaged.len(), 4);

        // Presence alone says nothing about content
        assert!(chaos.archiver.check(false).unwrap().is_ok());

        let report = chaos.archiver.check(true).unwrap();
        assert!(!report.is_ok());
        for id in &ids {
            let expected = chaos.paths_referencing(id, &damaged).unwrap();
            let snapshot = report.snapshots.iter().find(|s| &s.id == id).unwrap();
            let broken: BTreeSet<String> = snapshot.corrupted().map(|(p, _)| p.to_string()).collect();
            assert_eq!(broken, expected);
            for (_, result) in snapshot.corrupted() {
                assert!(matches!(result, ObjectCheck::HashMismatch { .. }));
            }
        }
    }

    #[test]
    fn test_truncated_blobs_report_size_mismatch() {
        let mut chaos = ArchiveChaosTest::new(2);
        chaos.populate(20, 1).unwrap();
        let objects = chaos.archiver.store().root().to_path_buf();

        let damaged = chaos.chaos_engine.truncate_random_files(&objects, 3).unwrap();
        let report = chaos.archiver.check(true).unwrap();

        let expected = chaos.paths_referencing(&SnapshotId::Current, &damaged).unwrap();
        let current = report.snapshots.iter().find(|s| s.id.is_current()).unwrap();
        let broken: BTreeMap<&str, &ObjectCheck> = current.corrupted().collect();
        assert_eq!(broken.len(), expected.len());
        for path in &expected {
            assert!(matches!(broken[path.as_str()], ObjectCheck::SizeMismatch { .. }));
        }
    }

    #[test]
    fn test_deleted_blobs_report_missing_and_block_restore() {
        let mut chaos = ArchiveChaosTest::new(3);
        chaos.populate(25, 2).unwrap();
        let objects = chaos.archiver.store().root().to_path_buf();

        let deleted = chaos.chaos_engine.delete_random_files(&objects, 2).unwrap();
        let report = chaos.archiver.check(false).unwrap();

        let expected = chaos.paths_referencing(&SnapshotId::Current, &deleted).unwrap();
        let current = report.snapshots.iter().find(|s| s.id.is_current()).unwrap();
        let broken: BTreeSet<String> = current
            .corrupted()
            .inspect(|(_, result)| assert_eq!(**result, ObjectCheck::Missing))
            .map(|(p, _)| p.to_string())
            .collect();
        assert_eq!(broken, expected);

        if !expected.is_empty() {
            let target = chaos.storage_dir.path().join("restore");
            let err = chaos.archiver.restore(&target, &SnapshotId::Current).unwrap_err();
            assert!(matches!(err, ArcsavvyError::ObjectNotFound(_)));
            assert!(err.is_corruption());
        }
    }

    #[test]
    fn test_mangled_snapshot_file_is_reported() {
        let mut chaos = ArchiveChaosTest::new(4);
        let ids = chaos.populate(10, 2).unwrap();

        // Damage only the oldest snapshot
        let oldest = chaos.archiver.snapshots().path_of(&ids[0]);
        let content = fs::read(&oldest).unwrap();
        fs::write(&oldest, &content[..content.len() / 2]).unwrap();

        assert!(matches!(chaos.archiver.read(&ids[0]), Err(ArcsavvyError::Json(_))));
        assert!(chaos.archiver.read(&ids[1]).is_ok());

        // Check reports the damaged snapshot and still covers the intact ones
        let report = chaos.archiver.check(false).unwrap();
        assert!(!report.is_ok());
        assert_eq!(report.unreadable().len(), 1);
        assert_eq!(report.unreadable()[0].0, &ids[0]);
        let intact: Vec<_> = report.snapshots.iter().filter(|s| s.error.is_none()).collect();
        assert_eq!(intact.len(), 2);
        assert!(intact.iter().all(|s| s.is_ok() && !s.results.is_empty()));
        assert_eq!(intact[0].id, ids[1]);
        assert_eq!(intact[1].id, SnapshotId::Current);

        // Nothing is created when the snapshot cannot be read
        let target = chaos.storage_dir.path().join("restore");
        assert!(chaos.archiver.restore(&target, &ids[0]).is_err());
        assert!(!target.exists());
    }

    #[test]
    fn test_random_json_damage_never_panics() {
        let mut chaos = ArchiveChaosTest::new(5);
        chaos.populate(12, 4).unwrap();
        let root = chaos.archiver.root().to_path_buf();

        let damaged = chaos.chaos_engine.corrupt_json_files(&root, 2).unwrap();
        assert_eq!(damaged.len(), 2);
        for id in chaos.archiver.list().unwrap() {
            if let Err(e) = chaos.archiver.read(&id) {
                warn!("Snapshot {} unreadable: {}", id, e);
                assert!(damaged.contains(&chaos.archiver.snapshots().path_of(&id)));
            }
        }
    }

    #[test]
    fn test_unknown_entry_type_rejected_on_read() {
        let chaos = ArchiveChaosTest::new(6);
        write_current_index(
            &chaos.archiver,
            json!({
                "pipe": {"full_name": "pipe", "base_name": "pipe", "type": "P", "size": 0, "mode": 420}
            }),
        );

        match chaos.archiver.read(&SnapshotId::Current) {
            Err(ArcsavvyError::UnsupportedEntryType { path, code }) => {
                assert_eq!(path, "pipe");
                assert_eq!(code, "P");
            }
            other => panic!("expected unsupported entry type, got {:?}", other),
        }
    }

    #[test]
    fn test_escaping_path_rejected_on_read() {
        let chaos = ArchiveChaosTest::new(7);
        write_current_index(
            &chaos.archiver,
            json!({
                "../outside.txt": {
                    "full_name": "../outside.txt",
                    "base_name": "outside.txt",
                    "type": "F",
                    "size": 4,
                    "mode": 420,
                    "hash": "00".repeat(32)
                }
            }),
        );

        let err = chaos.archiver.read(&SnapshotId::Current).unwrap_err();
        assert!(matches!(err, ArcsavvyError::InvalidEntry { .. }));

        let target = chaos.storage_dir.path().join("restore");
        assert!(chaos.archiver.restore(&target, &SnapshotId::Current).is_err());
        assert!(!chaos.storage_dir.path().join("outside.txt").exists());
    }

    #[test]
    fn test_non_hex_hash_is_unreadable_not_a_path() {
        let chaos = ArchiveChaosTest::new(8);
        write_current_index(
            &chaos.archiver,
            json!({
                "a.txt": {
                    "full_name": "a.txt",
                    "base_name": "a.txt",
                    "type": "F",
                    "size": 1,
                    "mode": 420,
                    "hash": "../../etc/passwd"
                }
            }),
        );

        let report = chaos.archiver.check(true).unwrap();
        let (_, path, result) = report.corrupted()[0];
        assert_eq!(path, "a.txt");
        assert!(matches!(result, ObjectCheck::Unreadable { .. }));
    }

    #[test]
    fn test_planted_collision_excludes_only_that_file() {
        let chaos = ArchiveChaosTest::new(9);
        let src = chaos.source_dir.path().to_path_buf();
        fs::write(src.join("victim.txt"), "victim content").unwrap();
        fs::write(src.join("bystander.txt"), "bystander").unwrap();

        // A blob under the victim's hash with a different length
        let hash = Sha256Hasher.hash_bytes(b"victim content");
        let store = chaos.archiver.store();
        fs::create_dir_all(store.root()).unwrap();
        fs::write(store.object_path(&hash), "x").unwrap();

        let outcome = chaos.archiver.snapshot(&src).unwrap();
        assert_eq!(outcome.faults.len(), 1);
        assert_eq!(outcome.faults[0].path, "victim.txt");
        assert!(outcome.index.get("victim.txt").is_none());
        assert!(outcome.index.get("bystander.txt").is_some());

        let stored = chaos.archiver.read(&outcome.id).unwrap();
        assert!(stored.get("victim.txt").is_none());

        // The planted blob is left as it was
        assert_eq!(fs::read(store.object_path(&hash)).unwrap(), b"x");
    }
}
