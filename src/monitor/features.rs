//! Feature vector crossing the scorer boundary, and the suspicious-extension
//! registry that feeds its flag fields.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::errors::{DefenseError, Result};

/// Number of numeric fields in the scorer contract.
pub const FEATURE_COUNT: usize = 8;

/// Fixed-shape numeric summary of recent file-system activity.
///
/// The field set and order are the model contract; reordering or resizing
/// breaks any externally trained scorer. Flags are encoded 0.0/1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub files_modified_per_sec: f64,
    pub bytes_written_per_sec: f64,
    pub mean_entropy: f64,
    pub cpu_utilization: f64,
    pub suspicious_extension: f64,
    pub rapid_change: f64,
    pub unauthorized_access: f64,
    pub network_anomaly: f64,
}

impl FeatureVector {
    /// A quiet baseline vector (all zeros).
    #[must_use]
    pub fn idle() -> Self {
        Self {
            files_modified_per_sec: 0.0,
            bytes_written_per_sec: 0.0,
            mean_entropy: 0.0,
            cpu_utilization: 0.0,
            suspicious_extension: 0.0,
            rapid_change: 0.0,
            unauthorized_access: 0.0,
            network_anomaly: 0.0,
        }
    }

    /// Fields in contract order, for scorers that want a flat slice.
    #[must_use]
    pub fn as_array(&self) -> [f64; FEATURE_COUNT] {
        [
            self.files_modified_per_sec,
            self.bytes_written_per_sec,
            self.mean_entropy,
            self.cpu_utilization,
            self.suspicious_extension,
            self.rapid_change,
            self.unauthorized_access,
            self.network_anomaly,
        ]
    }
}

/// Aggregates drained from the observer window for one tick.
#[derive(Debug, Clone, Default)]
pub struct WindowSummary {
    /// Distinct files counted as modified this window (renames count once).
    pub files_modified: usize,
    /// Bytes attributed to created/modified files this window.
    pub bytes_written: u64,
    /// Recently touched files, most recent first (entropy/hash candidates).
    pub touched: Vec<PathBuf>,
    /// A suspicious extension appeared on a touched path.
    pub suspicious_seen: bool,
    /// A watched path could not be inspected due to permissions.
    pub permission_failure_seen: bool,
}

/// Compiled registry of ransomware extension markers.
///
/// Patterns are plain suffixes from config, compiled into one alternation so
/// the per-event check is a single regex match on the file name.
#[derive(Debug, Clone)]
pub struct ExtensionRegistry {
    matcher: Regex,
}

impl ExtensionRegistry {
    /// Compile suffix patterns (e.g. `locked`, `crypt`) into a registry.
    pub fn new(suffixes: &[String]) -> Result<Self> {
        if suffixes.is_empty() {
            // Match nothing rather than everything.
            return Ok(Self {
                matcher: Regex::new("$^").expect("static regex"),
            });
        }
        let alternation = suffixes
            .iter()
            .map(|s| regex::escape(s))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = format!(r"(?i)\.({alternation})$");
        let matcher = Regex::new(&pattern).map_err(|e| DefenseError::InvalidConfig {
            details: format!("bad suspicious_extensions pattern: {e}"),
        })?;
        Ok(Self { matcher })
    }

    /// Whether the path carries a suspicious extension.
    #[must_use]
    pub fn is_suspicious(&self, path: &Path) -> bool {
        path.file_name()
            .map(|name| self.matcher.is_match(&name.to_string_lossy()))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ExtensionRegistry {
        ExtensionRegistry::new(&[
            "locked".to_string(),
            "encrypted".to_string(),
            "crypt".to_string(),
        ])
        .unwrap()
    }

    #[test]
    fn vector_has_eight_fields() {
        assert_eq!(FeatureVector::idle().as_array().len(), FEATURE_COUNT);
    }

    #[test]
    fn vector_serializes_in_contract_order() {
        let json = serde_json::to_string(&FeatureVector::idle()).unwrap();
        let files_pos = json.find("files_modified_per_sec").unwrap();
        let network_pos = json.find("network_anomaly").unwrap();
        assert!(files_pos < network_pos);
    }

    #[test]
    fn detects_suspicious_extensions_case_insensitively() {
        let reg = registry();
        assert!(reg.is_suspicious(Path::new("/srv/records/scan.dcm.LOCKED")));
        assert!(reg.is_suspicious(Path::new("report.encrypted")));
        assert!(reg.is_suspicious(Path::new("x.crypt")));
    }

    #[test]
    fn ignores_benign_extensions() {
        let reg = registry();
        assert!(!reg.is_suspicious(Path::new("notes.txt")));
        assert!(!reg.is_suspicious(Path::new("crypt"))); // no dot — a directory name
        assert!(!reg.is_suspicious(Path::new("cryptography.rs")));
    }

    #[test]
    fn suffix_must_terminate_the_name() {
        let reg = registry();
        assert!(!reg.is_suspicious(Path::new("file.locked.bak")));
    }

    #[test]
    fn empty_registry_matches_nothing() {
        let reg = ExtensionRegistry::new(&[]).unwrap();
        assert!(!reg.is_suspicious(Path::new("anything.locked")));
    }

    #[test]
    fn pattern_metacharacters_are_escaped() {
        let reg = ExtensionRegistry::new(&["a.b".to_string()]).unwrap();
        assert!(reg.is_suspicious(Path::new("x.a.b")));
        assert!(!reg.is_suspicious(Path::new("x.aXb")));
    }
}
