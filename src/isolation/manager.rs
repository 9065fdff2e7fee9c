//! Isolated write capture and reconciliation.
//!
//! While the tier is Emergency, writes destined for the protected store are
//! captured into a clean staging area instead of applied. The cost of
//! isolation is deferred durability, never availability: `intercept` always
//! accepts the payload. Captured operations are journaled to
//! `pending-writes.jsonl` inside the staging root so the pending set
//! survives a process restart, and are replayed in original timestamp order
//! once the tier de-escalates.
//!
//! Locking: the in-memory log mutex guards only flag-check/append/update
//! critical sections; payload I/O happens outside it. The journal has its
//! own mutex (append-only file shared across writer threads). A staging-dir
//! `flock` serializes reconciliation against a concurrent CLI invocation.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::errors::{DefenseError, Result};
use crate::core::paths::sanitize_for_flat_name;
use crate::isolation::gate::IsolationGate;

/// Journal file holding the pending operation set, one JSON object per line.
pub const JOURNAL_FILE: &str = "pending-writes.jsonl";

/// Subdirectory of the staging root receiving captured payloads.
const WRITES_DIR: &str = "writes";

// ──────────────────── operations ────────────────────

/// Reconciliation status of one captured write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum WriteStatus {
    Pending,
    Applied,
    Rejected(String),
}

/// A captured write, mutated only by the reconciliation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOperation {
    pub sequence: u64,
    pub original_path: PathBuf,
    pub staged_path: PathBuf,
    pub payload_size: u64,
    pub at: DateTime<Utc>,
    pub status: WriteStatus,
}

/// Counts returned by one reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    /// Operations newly replayed into the protected store.
    pub applied: usize,
    /// Operations that could not be replayed (recorded per-op, never fatal).
    pub rejected: usize,
    /// Operations already settled by an earlier run.
    pub skipped: usize,
}

// ──────────────────── manager ────────────────────

/// Captures writes into the staging area and reconciles them back.
pub struct IsolatedWriteManager {
    protected_root: PathBuf,
    staging_root: PathBuf,
    gate: IsolationGate,
    log: Mutex<Vec<WriteOperation>>,
    journal: Mutex<()>,
    sequence: AtomicU64,
}

impl IsolatedWriteManager {
    /// Create a manager over the given staging root, loading any journaled
    /// pending operations from a previous run.
    pub fn new(protected_root: PathBuf, staging_root: PathBuf, gate: IsolationGate) -> Result<Self> {
        fs::create_dir_all(staging_root.join(WRITES_DIR)).map_err(|e| {
            DefenseError::StagingUnavailable {
                path: staging_root.clone(),
                details: e.to_string(),
            }
        })?;

        let recovered = load_journal(&staging_root.join(JOURNAL_FILE))?;
        let next_sequence = recovered.iter().map(|op| op.sequence + 1).max().unwrap_or(0);

        Ok(Self {
            protected_root,
            staging_root,
            gate,
            log: Mutex::new(recovered),
            journal: Mutex::new(()),
            sequence: AtomicU64::new(next_sequence),
        })
    }

    /// Number of operations still awaiting reconciliation.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|op| op.status == WriteStatus::Pending)
            .count()
    }

    /// Snapshot of all operations retained in memory.
    #[must_use]
    pub fn operations(&self) -> Vec<WriteOperation> {
        self.log.lock().clone()
    }

    /// Capture a write destined for `original_path`.
    ///
    /// Always succeeds while isolation is active — the payload lands in the
    /// staging area and the operation is journaled as pending. Callers are
    /// never blocked beyond the cost of one local disk write.
    pub fn intercept(&self, original_path: &Path, payload: &[u8]) -> Result<WriteOperation> {
        if !self.gate.is_active() {
            return Err(DefenseError::Runtime {
                details: "write interception requested while isolation is inactive".to_string(),
            });
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let relative = original_path
            .strip_prefix(&self.protected_root)
            .unwrap_or(original_path);
        let staged_path = self
            .staging_root
            .join(WRITES_DIR)
            .join(format!("{sequence:08}_{}", sanitize_for_flat_name(relative)));

        // Payload I/O happens outside every lock.
        fs::write(&staged_path, payload).map_err(|e| DefenseError::StagingUnavailable {
            path: staged_path.clone(),
            details: e.to_string(),
        })?;

        let operation = WriteOperation {
            sequence,
            original_path: original_path.to_path_buf(),
            staged_path,
            payload_size: payload.len() as u64,
            at: Utc::now(),
            status: WriteStatus::Pending,
        };

        self.log.lock().push(operation.clone());
        self.append_journal(&operation)?;
        Ok(operation)
    }

    /// Flip isolation off and replay pending operations in original
    /// timestamp order.
    ///
    /// Idempotent: operations already applied or rejected are skipped, and a
    /// second call with an empty pending set reports zero newly applied.
    pub fn deactivate_and_reconcile(&self) -> Result<ReconciliationReport> {
        self.gate.deactivate();
        let _dir_lock = self.acquire_staging_lock()?;

        // Snapshot under the lock, replay outside it.
        let mut pending: Vec<WriteOperation> = {
            let log = self.log.lock();
            log.iter()
                .filter(|op| op.status == WriteStatus::Pending)
                .cloned()
                .collect()
        };
        let skipped = self.log.lock().len() - pending.len();
        pending.sort_by(|a, b| (a.at, a.sequence).cmp(&(b.at, b.sequence)));

        let mut report = ReconciliationReport {
            skipped,
            ..ReconciliationReport::default()
        };

        let mut settled: Vec<(u64, WriteStatus)> = Vec::with_capacity(pending.len());
        for op in &pending {
            match replay_one(op) {
                Ok(()) => {
                    report.applied += 1;
                    settled.push((op.sequence, WriteStatus::Applied));
                }
                Err(err) => {
                    report.rejected += 1;
                    let reason = match &err {
                        DefenseError::ReconcileConflict { reason, .. } => reason.clone(),
                        other => other.to_string(),
                    };
                    settled.push((op.sequence, WriteStatus::Rejected(reason)));
                }
            }
        }

        {
            let mut log = self.log.lock();
            for (sequence, status) in settled {
                if let Some(op) = log.iter_mut().find(|op| op.sequence == sequence) {
                    op.status = status;
                }
            }
        }

        self.rewrite_journal()?;
        Ok(report)
    }

    /// Remove staged payload files for settled operations and drop them
    /// from the in-memory log.
    pub fn purge_settled(&self) -> Result<usize> {
        let _dir_lock = self.acquire_staging_lock()?;
        let settled: Vec<WriteOperation> = {
            let mut log = self.log.lock();
            let (settled, pending): (Vec<_>, Vec<_>) = log
                .drain(..)
                .partition(|op| op.status != WriteStatus::Pending);
            *log = pending;
            settled
        };

        for op in &settled {
            let _ = fs::remove_file(&op.staged_path);
        }
        self.rewrite_journal()?;
        Ok(settled.len())
    }

    // ──────────── journal ────────────

    fn journal_path(&self) -> PathBuf {
        self.staging_root.join(JOURNAL_FILE)
    }

    fn append_journal(&self, operation: &WriteOperation) -> Result<()> {
        let line = serde_json::to_string(operation)?;
        let _guard = self.journal.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path())
            .map_err(|e| DefenseError::io(self.journal_path(), e))?;
        writeln!(file, "{line}").map_err(|e| DefenseError::io(self.journal_path(), e))?;
        Ok(())
    }

    /// Rewrite the journal to hold exactly the still-pending set, atomically.
    fn rewrite_journal(&self) -> Result<()> {
        let pending: Vec<String> = {
            let log = self.log.lock();
            log.iter()
                .filter(|op| op.status == WriteStatus::Pending)
                .map(serde_json::to_string)
                .collect::<std::result::Result<_, _>>()?
        };

        let _guard = self.journal.lock();
        let path = self.journal_path();
        let tmp = path.with_extension("jsonl.tmp");
        let mut body = pending.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        fs::write(&tmp, body).map_err(|e| DefenseError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| DefenseError::io(&path, e))?;
        Ok(())
    }

    // ──────────── staging dir lock ────────────

    #[cfg(unix)]
    fn acquire_staging_lock(&self) -> Result<nix::fcntl::Flock<File>> {
        let lock_path = self.staging_root.join(".lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| DefenseError::io(&lock_path, e))?;

        #[allow(deprecated)]
        nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusive).map_err(|(_file, e)| {
            DefenseError::StagingUnavailable {
                path: self.staging_root.clone(),
                details: format!("failed to lock staging dir: {e}"),
            }
        })
    }

    #[cfg(not(unix))]
    fn acquire_staging_lock(&self) -> Result<()> {
        Ok(())
    }
}

// ──────────────────── replay ────────────────────

/// Replay one pending operation into the protected store.
fn replay_one(op: &WriteOperation) -> Result<()> {
    if !op.staged_path.exists() {
        return Err(DefenseError::ReconcileConflict {
            path: op.original_path.clone(),
            reason: "staged payload missing".to_string(),
        });
    }

    if let Some(parent) = op.original_path.parent()
        && let Err(e) = fs::create_dir_all(parent)
    {
        return Err(DefenseError::ReconcileConflict {
            path: op.original_path.clone(),
            reason: format!("cannot restore parent directory: {e}"),
        });
    }

    fs::copy(&op.staged_path, &op.original_path).map_err(|e| DefenseError::ReconcileConflict {
        path: op.original_path.clone(),
        reason: e.to_string(),
    })?;
    Ok(())
}

/// Load journaled operations, tolerating a torn trailing line.
fn load_journal(path: &Path) -> Result<Vec<WriteOperation>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path).map_err(|e| DefenseError::io(path, e))?;
    let mut operations = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<WriteOperation>(line) {
            Ok(op) => operations.push(op),
            // A torn final line means the process died mid-append; the
            // payload may exist but was never acknowledged. Drop the line.
            Err(_) => continue,
        }
    }
    Ok(operations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Harness {
        _protected: TempDir,
        _staging: TempDir,
        protected_root: PathBuf,
        staging_root: PathBuf,
        gate: IsolationGate,
    }

    impl Harness {
        fn new() -> Self {
            let protected = TempDir::new().unwrap();
            let staging = TempDir::new().unwrap();
            Self {
                protected_root: protected.path().to_path_buf(),
                staging_root: staging.path().to_path_buf(),
                _protected: protected,
                _staging: staging,
                gate: IsolationGate::new(),
            }
        }

        fn manager(&self) -> IsolatedWriteManager {
            IsolatedWriteManager::new(
                self.protected_root.clone(),
                self.staging_root.clone(),
                self.gate.clone(),
            )
            .unwrap()
        }
    }

    #[test]
    fn intercept_requires_active_isolation() {
        let h = Harness::new();
        let manager = h.manager();
        let err = manager
            .intercept(&h.protected_root.join("f.txt"), b"data")
            .unwrap_err();
        assert_eq!(err.code(), "RSN-3900");
    }

    #[test]
    fn intercept_stages_payload_and_journals() {
        let h = Harness::new();
        let manager = h.manager();
        h.gate.activate();

        let op = manager
            .intercept(&h.protected_root.join("sub/report.txt"), b"captured bytes")
            .unwrap();

        assert_eq!(op.status, WriteStatus::Pending);
        assert_eq!(op.payload_size, 14);
        assert_eq!(fs::read(&op.staged_path).unwrap(), b"captured bytes");
        // Protected store untouched.
        assert!(!h.protected_root.join("sub/report.txt").exists());
        // Journal holds the op.
        let journaled = load_journal(&h.staging_root.join(JOURNAL_FILE)).unwrap();
        assert_eq!(journaled.len(), 1);
        assert_eq!(journaled[0].sequence, op.sequence);
    }

    #[test]
    fn reconcile_applies_in_order_and_is_idempotent() {
        let h = Harness::new();
        let manager = h.manager();
        h.gate.activate();

        let target = h.protected_root.join("doc.txt");
        manager.intercept(&target, b"first").unwrap();
        manager.intercept(&target, b"second").unwrap();
        manager.intercept(&target, b"final").unwrap();

        let report = manager.deactivate_and_reconcile().unwrap();
        assert_eq!(report.applied, 3);
        assert_eq!(report.rejected, 0);
        assert!(!h.gate.is_active());
        // Timestamp order means the last write wins.
        assert_eq!(fs::read(&target).unwrap(), b"final");

        let second = manager.deactivate_and_reconcile().unwrap();
        assert_eq!(second.applied, 0);
        assert_eq!(second.rejected, 0);
        assert_eq!(second.skipped, 3);
    }

    #[test]
    fn missing_staged_payload_is_rejected_not_fatal() {
        let h = Harness::new();
        let manager = h.manager();
        h.gate.activate();

        let op = manager
            .intercept(&h.protected_root.join("x.txt"), b"vanishes")
            .unwrap();
        fs::remove_file(&op.staged_path).unwrap();
        manager.intercept(&h.protected_root.join("y.txt"), b"stays").unwrap();

        let report = manager.deactivate_and_reconcile().unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.rejected, 1);
        assert!(h.protected_root.join("y.txt").exists());

        let rejected: Vec<_> = manager
            .operations()
            .into_iter()
            .filter(|op| matches!(op.status, WriteStatus::Rejected(_)))
            .collect();
        assert_eq!(rejected.len(), 1);
    }

    #[test]
    fn journal_survives_restart() {
        let h = Harness::new();
        h.gate.activate();
        {
            let manager = h.manager();
            manager.intercept(&h.protected_root.join("a.txt"), b"one").unwrap();
            manager.intercept(&h.protected_root.join("b.txt"), b"two").unwrap();
        }

        // Fresh manager over the same staging root: pending set recovered.
        let reborn = h.manager();
        assert_eq!(reborn.pending_count(), 2);

        // Sequences continue past the recovered maximum.
        let op = reborn.intercept(&h.protected_root.join("c.txt"), b"three").unwrap();
        assert_eq!(op.sequence, 2);
    }

    #[test]
    fn reconcile_clears_journal() {
        let h = Harness::new();
        let manager = h.manager();
        h.gate.activate();
        manager.intercept(&h.protected_root.join("a.txt"), b"one").unwrap();

        manager.deactivate_and_reconcile().unwrap();
        let journaled = load_journal(&h.staging_root.join(JOURNAL_FILE)).unwrap();
        assert!(journaled.is_empty());
    }

    #[test]
    fn purge_settled_removes_staged_files() {
        let h = Harness::new();
        let manager = h.manager();
        h.gate.activate();
        let op = manager.intercept(&h.protected_root.join("a.txt"), b"one").unwrap();

        manager.deactivate_and_reconcile().unwrap();
        assert!(op.staged_path.exists());

        let purged = manager.purge_settled().unwrap();
        assert_eq!(purged, 1);
        assert!(!op.staged_path.exists());
        assert!(manager.operations().is_empty());
    }

    #[test]
    fn torn_journal_line_is_dropped() {
        let h = Harness::new();
        {
            let manager = h.manager();
            h.gate.activate();
            manager.intercept(&h.protected_root.join("a.txt"), b"good").unwrap();
        }
        // Simulate a crash mid-append.
        let journal = h.staging_root.join(JOURNAL_FILE);
        let mut raw = fs::read_to_string(&journal).unwrap();
        raw.push_str("{\"sequence\":1,\"original_");
        fs::write(&journal, raw).unwrap();

        let reborn = h.manager();
        assert_eq!(reborn.pending_count(), 1);
    }

    #[test]
    fn concurrent_intercepts_all_land_exactly_once() {
        use std::sync::Arc;

        let h = Harness::new();
        let manager = Arc::new(h.manager());
        h.gate.activate();

        const WRITERS: usize = 8;
        const WRITES_EACH: usize = 25;

        std::thread::scope(|scope| {
            for w in 0..WRITERS {
                let manager = Arc::clone(&manager);
                let root = h.protected_root.clone();
                scope.spawn(move || {
                    for i in 0..WRITES_EACH {
                        manager
                            .intercept(&root.join(format!("w{w}/f{i}.txt")), b"payload")
                            .unwrap();
                    }
                });
            }
        });

        let ops = manager.operations();
        assert_eq!(ops.len(), WRITERS * WRITES_EACH);
        let mut sequences: Vec<u64> = ops.iter().map(|op| op.sequence).collect();
        sequences.sort_unstable();
        sequences.dedup();
        assert_eq!(sequences.len(), WRITERS * WRITES_EACH, "sequences must be unique");

        let journaled = load_journal(&h.staging_root.join(JOURNAL_FILE)).unwrap();
        assert_eq!(journaled.len(), WRITERS * WRITES_EACH);
    }
}
