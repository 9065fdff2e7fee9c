//! Backup manifest: the checkpoint record of the last successful pass.
//!
//! Exactly one manifest is current at any time. A pass builds a complete
//! replacement in memory and persists it with the write-new-then-rename
//! pattern, so a crash mid-pass leaves the previous checkpoint intact.
//! Older generations are rotated to `manifest.<n>.json` up to the configured
//! history depth.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{DefenseError, Result};

/// File name of the current manifest inside the backup root.
pub const MANIFEST_FILE: &str = "manifest.json";

/// One backed-up file as of the last checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the source root.
    pub relative_path: PathBuf,
    /// SHA-256 of the content as copied.
    pub content_hash: String,
    pub size_bytes: u64,
    /// Source mtime observed when the file was copied (unix millis).
    pub source_mtime_ms: i64,
    pub backed_up_at: DateTime<Utc>,
}

/// Checkpoint state of the backup store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub source_root: PathBuf,
    pub backup_root: PathBuf,
    pub entries: Vec<ManifestEntry>,
    /// Completion time of the last successful pass.
    pub checkpoint: DateTime<Utc>,
}

impl BackupManifest {
    /// An empty manifest for a fresh pairing of source and backup roots.
    #[must_use]
    pub fn empty(source_root: PathBuf, backup_root: PathBuf) -> Self {
        Self {
            source_root,
            backup_root,
            entries: Vec::new(),
            checkpoint: DateTime::<Utc>::MIN_UTC,
        }
    }

    /// Load the current manifest from the backup root, or an empty one if
    /// none exists yet.
    pub fn load_or_empty(source_root: &Path, backup_root: &Path) -> Result<Self> {
        let path = backup_root.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(Self::empty(
                source_root.to_path_buf(),
                backup_root.to_path_buf(),
            ));
        }
        let raw = fs::read_to_string(&path).map_err(|source| DefenseError::Io {
            path: path.clone(),
            source,
        })?;
        let manifest: Self = serde_json::from_str(&raw)?;
        Ok(manifest)
    }

    /// Index entries by relative path for change detection.
    #[must_use]
    pub fn by_relative_path(&self) -> HashMap<&Path, &ManifestEntry> {
        self.entries
            .iter()
            .map(|e| (e.relative_path.as_path(), e))
            .collect()
    }

    /// Index entries by content hash for rename detection.
    #[must_use]
    pub fn by_content_hash(&self) -> HashMap<&str, &ManifestEntry> {
        self.entries
            .iter()
            .map(|e| (e.content_hash.as_str(), e))
            .collect()
    }

    /// Total bytes represented by the checkpoint.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size_bytes).sum()
    }

    /// Atomically replace the on-disk manifest with `self`.
    ///
    /// The previous generation is rotated to `manifest.1.json` (and so on up
    /// to `history_depth`) before the rename lands.
    pub fn persist(&self, history_depth: usize) -> Result<()> {
        let current = self.backup_root.join(MANIFEST_FILE);
        let tmp = self.backup_root.join(format!("{MANIFEST_FILE}.tmp"));

        let json = serde_json::to_string_pretty(self)?;
        fs::write(&tmp, json).map_err(|source| DefenseError::Io {
            path: tmp.clone(),
            source,
        })?;

        if current.exists() {
            rotate_generations(&self.backup_root, history_depth);
        }

        fs::rename(&tmp, &current).map_err(|source| DefenseError::Io {
            path: current.clone(),
            source,
        })?;
        Ok(())
    }
}

/// Shift `manifest.json` → `manifest.1.json` → … keeping `depth` generations.
fn rotate_generations(backup_root: &Path, depth: usize) {
    if depth == 0 {
        return;
    }
    let generation = |n: usize| -> PathBuf {
        if n == 0 {
            backup_root.join(MANIFEST_FILE)
        } else {
            backup_root.join(format!("manifest.{n}.json"))
        }
    };

    // Oldest falls off the end; failures here only cost history, never the
    // current checkpoint.
    let _ = fs::remove_file(generation(depth));
    for n in (0..depth).rev() {
        let from = generation(n);
        if from.exists() {
            let _ = fs::rename(&from, generation(n + 1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_entry(rel: &str, hash: &str, size: u64) -> ManifestEntry {
        ManifestEntry {
            relative_path: PathBuf::from(rel),
            content_hash: hash.to_string(),
            size_bytes: size,
            source_mtime_ms: 1_700_000_000_000,
            backed_up_at: Utc::now(),
        }
    }

    fn sample_manifest(backup_root: &Path) -> BackupManifest {
        BackupManifest {
            source_root: PathBuf::from("/srv/records"),
            backup_root: backup_root.to_path_buf(),
            entries: vec![
                sample_entry("a.txt", "hash-a", 100),
                sample_entry("sub/b.txt", "hash-b", 200),
            ],
            checkpoint: Utc::now(),
        }
    }

    #[test]
    fn load_missing_returns_empty() {
        let tmp = TempDir::new().unwrap();
        let manifest =
            BackupManifest::load_or_empty(Path::new("/srv/records"), tmp.path()).unwrap();
        assert!(manifest.entries.is_empty());
        assert_eq!(manifest.checkpoint, DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn persist_then_load_round_trips() {
        let tmp = TempDir::new().unwrap();
        let manifest = sample_manifest(tmp.path());
        manifest.persist(3).unwrap();

        let loaded =
            BackupManifest::load_or_empty(Path::new("/srv/records"), tmp.path()).unwrap();
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn persist_leaves_no_tmp_file() {
        let tmp = TempDir::new().unwrap();
        sample_manifest(tmp.path()).persist(3).unwrap();
        assert!(!tmp.path().join("manifest.json.tmp").exists());
    }

    #[test]
    fn stale_tmp_file_is_ignored_by_load() {
        let tmp = TempDir::new().unwrap();
        // Simulate a crash between write and rename.
        fs::write(tmp.path().join("manifest.json.tmp"), b"{ partial").unwrap();
        let manifest =
            BackupManifest::load_or_empty(Path::new("/srv/records"), tmp.path()).unwrap();
        assert!(manifest.entries.is_empty());
    }

    #[test]
    fn corrupt_manifest_is_an_error_not_a_panic() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(MANIFEST_FILE), b"not json at all").unwrap();
        let err =
            BackupManifest::load_or_empty(Path::new("/srv/records"), tmp.path()).unwrap_err();
        assert_eq!(err.code(), "RSN-2101");
    }

    #[test]
    fn rotation_keeps_history_depth() {
        let tmp = TempDir::new().unwrap();
        for _ in 0..5 {
            sample_manifest(tmp.path()).persist(2).unwrap();
        }
        assert!(tmp.path().join("manifest.json").exists());
        assert!(tmp.path().join("manifest.1.json").exists());
        assert!(tmp.path().join("manifest.2.json").exists());
        assert!(!tmp.path().join("manifest.3.json").exists());
    }

    #[test]
    fn zero_history_depth_keeps_only_current() {
        let tmp = TempDir::new().unwrap();
        sample_manifest(tmp.path()).persist(0).unwrap();
        sample_manifest(tmp.path()).persist(0).unwrap();
        assert!(tmp.path().join("manifest.json").exists());
        assert!(!tmp.path().join("manifest.1.json").exists());
    }

    #[test]
    fn indices_cover_all_entries() {
        let tmp = TempDir::new().unwrap();
        let manifest = sample_manifest(tmp.path());
        assert_eq!(manifest.by_relative_path().len(), 2);
        assert_eq!(manifest.by_content_hash().len(), 2);
        assert_eq!(manifest.total_bytes(), 300);
        assert!(
            manifest
                .by_relative_path()
                .contains_key(Path::new("sub/b.txt"))
        );
    }
}
