//! JSONL activity log: append-only line-delimited JSON.
//!
//! Each line is a self-contained JSON object. Lines are assembled in memory
//! and written atomically via `write_all` to prevent interleaved partial
//! lines when the file is being tailed by another process.
//!
//! Three-level fallback chain:
//! 1. Primary file path
//! 2. stderr with `[RSN-JSONL]` prefix
//! 3. Silent discard (the engine must never crash for logging failures)

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions, rename};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::core::errors::{DefenseError, Result};

/// Severity level for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Log event types matching the defense activity model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    EngineStart,
    EngineStop,
    TierChange,
    BackupComplete,
    BackupFail,
    IsolationActivate,
    ReconcileComplete,
    ScorerDegraded,
    Error,
}

/// A single JSONL log entry — all fields optional except `ts`, `event`,
/// `severity`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// ISO 8601 UTC timestamp.
    pub ts: String,
    pub event: EventType,
    pub severity: Severity,
    /// Response tier at the time of the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    /// Threat score driving the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Files involved (copied, applied, …).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<u64>,
    /// Bytes involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    /// Operations rejected during reconciliation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected: Option<u64>,
    /// Duration of the action in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Whether the action succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    /// RSN error code if the action failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Freeform details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    /// Create a new entry stamped with the current UTC time.
    pub fn new(event: EventType, severity: Severity) -> Self {
        Self {
            ts: format_utc_now(),
            event,
            severity,
            tier: None,
            score: None,
            files: None,
            bytes: None,
            rejected: None,
            duration_ms: None,
            ok: None,
            error_code: None,
            error_message: None,
            details: None,
        }
    }
}

/// Degradation state of the JSONL writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Normal,
    Stderr,
    Discard,
}

/// Configuration for the JSONL writer.
#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    /// Maximum file size before rotation (bytes).
    pub max_size_bytes: u64,
    /// Number of rotated files to keep.
    pub max_rotated_files: u32,
    /// Seconds between forced fsync calls.
    pub fsync_interval_secs: u64,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/rsn/activity.jsonl"),
            max_size_bytes: 50 * 1024 * 1024,
            max_rotated_files: 5,
            fsync_interval_secs: 30,
        }
    }
}

/// Append-only JSONL log writer with rotation and degradation.
pub struct JsonlWriter {
    config: JsonlConfig,
    writer: Option<BufWriter<File>>,
    state: WriterState,
    bytes_written: u64,
    last_fsync: SystemTime,
}

impl JsonlWriter {
    /// Open the JSONL log file. Falls through the degradation chain on failure.
    pub fn open(config: JsonlConfig) -> Self {
        let mut w = Self {
            config,
            writer: None,
            state: WriterState::Discard,
            bytes_written: 0,
            last_fsync: SystemTime::now(),
        };
        w.try_open_primary();
        w
    }

    /// Write a single log entry as one atomic JSONL line.
    pub fn write_entry(&mut self, entry: &LogEntry) {
        let line = match serde_json::to_string(entry) {
            Ok(json) => format!("{json}\n"),
            Err(e) => {
                let _ = writeln!(io::stderr(), "[RSN-JSONL] serialize error: {e}");
                return;
            }
        };
        self.write_line(&line);
    }

    /// Flush buffers.
    pub fn flush(&mut self) {
        if let Some(w) = self.writer.as_mut() {
            let _ = w.flush();
        }
    }

    /// Force an fsync on the underlying file.
    pub fn fsync(&mut self) {
        if let Some(w) = self.writer.as_mut() {
            let _ = w.flush();
            let _ = w.get_ref().sync_data();
            self.last_fsync = SystemTime::now();
        }
    }

    /// Current degradation state.
    pub fn state(&self) -> &str {
        match self.state {
            WriterState::Normal => "normal",
            WriterState::Stderr => "stderr",
            WriterState::Discard => "discard",
        }
    }

    /// Number of bytes written to the current file.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Attempt recovery: try reopening the primary path.
    pub fn try_recover(&mut self) {
        if self.state == WriterState::Normal {
            return;
        }
        if let Ok((file, size)) = open_append(&self.config.path) {
            self.writer = Some(BufWriter::with_capacity(64 * 1024, file));
            self.state = WriterState::Normal;
            self.bytes_written = size;
        }
    }

    // ──────────────────────── internals ────────────────────────

    fn write_line(&mut self, line: &str) {
        if self.bytes_written + line.len() as u64 > self.config.max_size_bytes
            && self.state == WriterState::Normal
        {
            self.rotate();
        }

        match self.state {
            WriterState::Normal => {
                if let Some(w) = self.writer.as_mut() {
                    if w.write_all(line.as_bytes()).is_err() {
                        self.degrade();
                        self.write_line(line); // retry at next level
                        return;
                    }
                    self.bytes_written += line.len() as u64;
                    self.maybe_fsync();
                } else {
                    self.degrade();
                    self.write_line(line);
                }
            }
            WriterState::Stderr => {
                let _ = write!(io::stderr(), "[RSN-JSONL] {line}");
            }
            WriterState::Discard => {}
        }
    }

    fn maybe_fsync(&mut self) {
        let elapsed = SystemTime::now()
            .duration_since(self.last_fsync)
            .unwrap_or(Duration::ZERO);
        if elapsed.as_secs() >= self.config.fsync_interval_secs {
            self.fsync();
        }
    }

    fn try_open_primary(&mut self) {
        match open_append(&self.config.path) {
            Ok((file, size)) => {
                self.writer = Some(BufWriter::with_capacity(64 * 1024, file));
                self.state = WriterState::Normal;
                self.bytes_written = size;
            }
            Err(_) => {
                self.state = WriterState::Stderr;
                let _ = writeln!(
                    io::stderr(),
                    "[RSN-JSONL] log path failed, using stderr: {}",
                    self.config.path.display()
                );
            }
        }
    }

    fn degrade(&mut self) {
        self.writer = None;
        match self.state {
            WriterState::Normal => {
                self.state = WriterState::Stderr;
                let _ = writeln!(io::stderr(), "[RSN-JSONL] write failed, using stderr");
            }
            WriterState::Stderr => {
                self.state = WriterState::Discard;
            }
            WriterState::Discard => {}
        }
    }

    fn rotate(&mut self) {
        if let Some(w) = self.writer.as_mut() {
            let _ = w.flush();
        }
        self.writer = None;

        let base = self.config.path.clone();

        // Shift existing rotations: .5→delete, .4→.5, …, .1→.2, current→.1
        for i in (1..self.config.max_rotated_files).rev() {
            let from = rotated_name(&base, i);
            let to = rotated_name(&base, i + 1);
            let _ = rename(&from, &to);
        }
        let oldest = rotated_name(&base, self.config.max_rotated_files);
        let _ = fs::remove_file(&oldest);
        let _ = rename(&base, &rotated_name(&base, 1));

        match open_append(&base) {
            Ok((file, _)) => {
                self.writer = Some(BufWriter::with_capacity(64 * 1024, file));
                self.bytes_written = 0;
            }
            Err(_) => {
                self.degrade();
            }
        }
    }
}

// ──────────────────────── helpers ────────────────────────

/// Open or create a file for appending. Returns `(File, current_size)`.
fn open_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| DefenseError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| DefenseError::io(path, source))?;
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    Ok((file, size))
}

/// Build a rotated filename: `foo.jsonl` → `foo.jsonl.3`.
fn rotated_name(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

/// Format current UTC time as ISO 8601.
pub(crate) fn format_utc_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &Path) -> JsonlConfig {
        JsonlConfig {
            path: dir.join("activity.jsonl"),
            max_size_bytes: 4096,
            max_rotated_files: 2,
            fsync_interval_secs: 3600,
        }
    }

    #[test]
    fn writes_one_json_object_per_line() {
        let tmp = TempDir::new().unwrap();
        let mut writer = JsonlWriter::open(config_in(tmp.path()));

        let mut entry = LogEntry::new(EventType::TierChange, Severity::Warning);
        entry.tier = Some("guarded".to_string());
        entry.score = Some(0.55);
        writer.write_entry(&entry);
        writer.flush();

        let raw = fs::read_to_string(tmp.path().join("activity.jsonl")).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 1);
        let parsed: LogEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.event, EventType::TierChange);
        assert_eq!(parsed.tier.as_deref(), Some("guarded"));
    }

    #[test]
    fn none_fields_are_omitted_from_json() {
        let tmp = TempDir::new().unwrap();
        let mut writer = JsonlWriter::open(config_in(tmp.path()));
        writer.write_entry(&LogEntry::new(EventType::EngineStart, Severity::Info));
        writer.flush();

        let raw = fs::read_to_string(tmp.path().join("activity.jsonl")).unwrap();
        assert!(!raw.contains("error_code"));
        assert!(!raw.contains("score"));
    }

    #[test]
    fn rotates_at_size_limit() {
        let tmp = TempDir::new().unwrap();
        let mut writer = JsonlWriter::open(config_in(tmp.path()));

        let mut entry = LogEntry::new(EventType::BackupComplete, Severity::Info);
        entry.details = Some("x".repeat(256));
        for _ in 0..64 {
            writer.write_entry(&entry);
        }
        writer.flush();

        assert!(tmp.path().join("activity.jsonl").exists());
        assert!(tmp.path().join("activity.jsonl.1").exists());
        assert!(!tmp.path().join("activity.jsonl.3").exists());
    }

    #[test]
    fn append_resumes_existing_file() {
        let tmp = TempDir::new().unwrap();
        {
            let mut writer = JsonlWriter::open(config_in(tmp.path()));
            writer.write_entry(&LogEntry::new(EventType::EngineStart, Severity::Info));
            writer.flush();
        }
        {
            let mut writer = JsonlWriter::open(config_in(tmp.path()));
            writer.write_entry(&LogEntry::new(EventType::EngineStop, Severity::Info));
            writer.flush();
        }

        let raw = fs::read_to_string(tmp.path().join("activity.jsonl")).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }

    #[test]
    fn unwritable_path_degrades_without_panic() {
        let mut config = JsonlConfig::default();
        config.path = PathBuf::from("/proc/definitely/not/writable/x.jsonl");
        let mut writer = JsonlWriter::open(config);
        writer.write_entry(&LogEntry::new(EventType::Error, Severity::Critical));
        assert_ne!(writer.state(), "normal");
    }
}
