//! Activity logging coordinator: a dedicated logger thread behind a
//! non-blocking handle.
//!
//! All engine threads send `ActivityEvent` via a bounded crossbeam channel.
//! Non-blocking `try_send()` ensures the monitoring loop is never stalled by
//! logging back-pressure; under pressure events are counted as dropped, not
//! queued without bound.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::errors::{DefenseError, Result};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};

/// Default bounded channel capacity for log events.
const CHANNEL_CAPACITY: usize = 1024;

// ──────────────────── public event type ────────────────────

/// Events logged through the coordinator.
#[derive(Debug, Clone)]
pub enum ActivityEvent {
    EngineStarted {
        version: String,
        config_hash: String,
    },
    EngineStopped {
        reason: String,
        uptime_secs: u64,
    },
    TierChanged {
        from: String,
        to: String,
        score: f64,
    },
    BackupCompleted {
        files_copied: u64,
        bytes_copied: u64,
        files_skipped: u64,
        duration_ms: u64,
    },
    BackupFailed {
        error_code: String,
        error_message: String,
    },
    IsolationActivated {
        score: f64,
    },
    ReconciliationCompleted {
        applied: u64,
        rejected: u64,
        duration_ms: u64,
    },
    ScorerDegraded {
        consecutive_timeouts: u64,
    },
    Error {
        code: String,
        message: String,
    },
    /// Sentinel to request graceful shutdown of the logger thread.
    Shutdown,
}

// ──────────────────── public handle ────────────────────

/// Thread-safe, cheaply-cloneable handle for sending log events.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// Send an event to the logger thread. Non-blocking.
    ///
    /// If the channel is full the event is dropped and the dropped-events
    /// counter is incremented.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
        // Disconnected is fine during shutdown.
    }

    /// Number of events dropped due to channel back-pressure.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Request graceful shutdown of the logger thread.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }
}

// ──────────────────── spawn ────────────────────

/// Spawn the logger thread and return a handle.
pub fn spawn_logger(
    config: JsonlConfig,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ActivityEvent>(CHANNEL_CAPACITY);
    let dropped = Arc::new(AtomicU64::new(0));
    let dropped_clone = Arc::clone(&dropped);

    let handle = ActivityLoggerHandle {
        tx,
        dropped_events: dropped,
    };

    let join = thread::Builder::new()
        .name("rsn-logger".to_string())
        .spawn(move || {
            logger_thread_main(&rx, config, &dropped_clone);
        })
        .map_err(|e| DefenseError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;

    Ok((handle, join))
}

// ──────────────────── logger thread ────────────────────

fn logger_thread_main(rx: &Receiver<ActivityEvent>, config: JsonlConfig, dropped: &AtomicU64) {
    let mut jsonl = JsonlWriter::open(config);
    let mut reported_dropped: u64 = 0;

    while let Ok(event) = rx.recv() {
        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }

        jsonl.write_entry(&entry_for(&event));

        // Surface back-pressure losses in the log itself, once per batch.
        let total_dropped = dropped.load(Ordering::Relaxed);
        if total_dropped > reported_dropped {
            let mut entry = LogEntry::new(EventType::Error, Severity::Warning);
            entry.details = Some(format!(
                "{} activity events dropped under back-pressure",
                total_dropped - reported_dropped
            ));
            jsonl.write_entry(&entry);
            reported_dropped = total_dropped;
        }
    }

    jsonl.fsync();
}

fn entry_for(event: &ActivityEvent) -> LogEntry {
    match event {
        ActivityEvent::EngineStarted {
            version,
            config_hash,
        } => {
            let mut entry = LogEntry::new(EventType::EngineStart, Severity::Info);
            entry.details = Some(format!("version={version} config={config_hash}"));
            entry
        }
        ActivityEvent::EngineStopped {
            reason,
            uptime_secs,
        } => {
            let mut entry = LogEntry::new(EventType::EngineStop, Severity::Info);
            entry.details = Some(format!("reason={reason} uptime_secs={uptime_secs}"));
            entry
        }
        ActivityEvent::TierChanged { from, to, score } => {
            let severity = if to == "emergency" {
                Severity::Critical
            } else {
                Severity::Warning
            };
            let mut entry = LogEntry::new(EventType::TierChange, severity);
            entry.tier = Some(to.clone());
            entry.score = Some(*score);
            entry.details = Some(format!("{from} -> {to}"));
            entry
        }
        ActivityEvent::BackupCompleted {
            files_copied,
            bytes_copied,
            files_skipped,
            duration_ms,
        } => {
            let mut entry = LogEntry::new(EventType::BackupComplete, Severity::Info);
            entry.files = Some(*files_copied);
            entry.bytes = Some(*bytes_copied);
            entry.rejected = Some(*files_skipped);
            entry.duration_ms = Some(*duration_ms);
            entry.ok = Some(true);
            entry
        }
        ActivityEvent::BackupFailed {
            error_code,
            error_message,
        } => {
            let mut entry = LogEntry::new(EventType::BackupFail, Severity::Critical);
            entry.ok = Some(false);
            entry.error_code = Some(error_code.clone());
            entry.error_message = Some(error_message.clone());
            entry
        }
        ActivityEvent::IsolationActivated { score } => {
            let mut entry = LogEntry::new(EventType::IsolationActivate, Severity::Critical);
            entry.score = Some(*score);
            entry
        }
        ActivityEvent::ReconciliationCompleted {
            applied,
            rejected,
            duration_ms,
        } => {
            let mut entry = LogEntry::new(EventType::ReconcileComplete, Severity::Info);
            entry.files = Some(*applied);
            entry.rejected = Some(*rejected);
            entry.duration_ms = Some(*duration_ms);
            entry.ok = Some(*rejected == 0);
            entry
        }
        ActivityEvent::ScorerDegraded {
            consecutive_timeouts,
        } => {
            let mut entry = LogEntry::new(EventType::ScorerDegraded, Severity::Warning);
            entry.details = Some(format!("consecutive_timeouts={consecutive_timeouts}"));
            entry
        }
        ActivityEvent::Error { code, message } => {
            let mut entry = LogEntry::new(EventType::Error, Severity::Warning);
            entry.error_code = Some(code.clone());
            entry.error_message = Some(message.clone());
            entry
        }
        ActivityEvent::Shutdown => LogEntry::new(EventType::EngineStop, Severity::Info),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn config_in(dir: &std::path::Path) -> JsonlConfig {
        JsonlConfig {
            path: dir.join("activity.jsonl"),
            ..JsonlConfig::default()
        }
    }

    #[test]
    fn events_flow_through_to_jsonl() {
        let tmp = TempDir::new().unwrap();
        let (handle, join) = spawn_logger(config_in(tmp.path())).unwrap();

        handle.send(ActivityEvent::EngineStarted {
            version: "0.3.1".to_string(),
            config_hash: "abc123".to_string(),
        });
        handle.send(ActivityEvent::TierChanged {
            from: "normal".to_string(),
            to: "emergency".to_string(),
            score: 0.92,
        });
        handle.send(ActivityEvent::BackupCompleted {
            files_copied: 12,
            bytes_copied: 4096,
            files_skipped: 1,
            duration_ms: 37,
        });
        handle.shutdown();
        join.join().unwrap();

        let raw = fs::read_to_string(tmp.path().join("activity.jsonl")).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("engine_start"));
        assert!(lines[1].contains("emergency"));
        assert!(lines[2].contains("backup_complete"));
    }

    #[test]
    fn handle_is_nonblocking_after_shutdown() {
        let tmp = TempDir::new().unwrap();
        let (handle, join) = spawn_logger(config_in(tmp.path())).unwrap();
        handle.shutdown();
        join.join().unwrap();

        // Sends after shutdown are quietly ignored.
        handle.send(ActivityEvent::Error {
            code: "RSN-3900".to_string(),
            message: "late".to_string(),
        });
    }

    #[test]
    fn tier_change_to_emergency_is_critical() {
        let entry = entry_for(&ActivityEvent::TierChanged {
            from: "guarded".to_string(),
            to: "emergency".to_string(),
            score: 0.8,
        });
        assert_eq!(entry.severity, Severity::Critical);

        let entry = entry_for(&ActivityEvent::TierChanged {
            from: "normal".to_string(),
            to: "guarded".to_string(),
            score: 0.5,
        });
        assert_eq!(entry.severity, Severity::Warning);
    }
}
