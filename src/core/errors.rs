//! RSN-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, DefenseError>;

/// Top-level error type for the defense engine.
///
/// Per-file and per-operation failures (`FileCopy`, `ReconcileConflict`) are
/// recorded into pass/reconciliation reports and never abort the surrounding
/// operation; only structural failures propagate to the caller.
#[derive(Debug, Error)]
pub enum DefenseError {
    #[error("[RSN-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[RSN-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[RSN-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[RSN-2001] cannot watch {path}: {details}")]
    WatchInit { path: PathBuf, details: String },

    #[error("[RSN-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[RSN-3001] copy failure for {path}: {details}")]
    FileCopy { path: PathBuf, details: String },

    #[error("[RSN-3002] backup pass failure at {backup_root}: {details}")]
    BackupPass {
        backup_root: PathBuf,
        details: String,
    },

    #[error("[RSN-3003] staging area unavailable at {path}: {details}")]
    StagingUnavailable { path: PathBuf, details: String },

    #[error("[RSN-3004] reconciliation conflict for {path}: {reason}")]
    ReconcileConflict { path: PathBuf, reason: String },

    #[error("[RSN-3005] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[RSN-3101] threat scorer exceeded its latency budget ({budget_ms} ms)")]
    ScorerTimeout { budget_ms: u64 },

    #[error("[RSN-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl DefenseError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "RSN-1001",
            Self::MissingConfig { .. } => "RSN-1002",
            Self::ConfigParse { .. } => "RSN-1003",
            Self::WatchInit { .. } => "RSN-2001",
            Self::Serialization { .. } => "RSN-2101",
            Self::FileCopy { .. } => "RSN-3001",
            Self::BackupPass { .. } => "RSN-3002",
            Self::StagingUnavailable { .. } => "RSN-3003",
            Self::ReconcileConflict { .. } => "RSN-3004",
            Self::Io { .. } => "RSN-3005",
            Self::ScorerTimeout { .. } => "RSN-3101",
            Self::Runtime { .. } => "RSN-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    ///
    /// Watch-init and configuration failures are deliberate non-retryables:
    /// they surface to the caller once, at startup.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::FileCopy { .. }
                | Self::BackupPass { .. }
                | Self::ScorerTimeout { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for DefenseError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for DefenseError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

impl From<notify::Error> for DefenseError {
    fn from(value: notify::Error) -> Self {
        Self::Runtime {
            details: format!("watcher backend: {value}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<DefenseError> {
        vec![
            DefenseError::InvalidConfig {
                details: String::new(),
            },
            DefenseError::MissingConfig {
                path: PathBuf::new(),
            },
            DefenseError::ConfigParse {
                context: "",
                details: String::new(),
            },
            DefenseError::WatchInit {
                path: PathBuf::new(),
                details: String::new(),
            },
            DefenseError::Serialization {
                context: "",
                details: String::new(),
            },
            DefenseError::FileCopy {
                path: PathBuf::new(),
                details: String::new(),
            },
            DefenseError::BackupPass {
                backup_root: PathBuf::new(),
                details: String::new(),
            },
            DefenseError::StagingUnavailable {
                path: PathBuf::new(),
                details: String::new(),
            },
            DefenseError::ReconcileConflict {
                path: PathBuf::new(),
                reason: String::new(),
            },
            DefenseError::Io {
                path: PathBuf::new(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "test"),
            },
            DefenseError::ScorerTimeout { budget_ms: 5 },
            DefenseError::Runtime {
                details: String::new(),
            },
        ]
    }

    #[test]
    fn error_codes_are_unique() {
        let errors = all_variants();
        let codes: Vec<&str> = errors.iter().map(|e| e.code()).collect();
        let unique: std::collections::HashSet<&&str> = codes.iter().collect();
        assert_eq!(
            codes.len(),
            unique.len(),
            "error codes must be unique: {codes:?}"
        );
    }

    #[test]
    fn error_codes_have_rsn_prefix() {
        for err in &all_variants() {
            assert!(
                err.code().starts_with("RSN-"),
                "code {} must start with RSN-",
                err.code()
            );
        }
    }

    #[test]
    fn error_display_includes_code() {
        let err = DefenseError::WatchInit {
            path: PathBuf::from("/does/not/exist"),
            details: "no such directory".to_string(),
        };
        let msg = err.to_string();
        assert!(
            msg.contains("RSN-2001"),
            "display should contain error code: {msg}"
        );
        assert!(
            msg.contains("/does/not/exist"),
            "display should contain path: {msg}"
        );
    }

    #[test]
    fn retryable_errors_are_correct() {
        assert!(
            DefenseError::Io {
                path: PathBuf::new(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "test"),
            }
            .is_retryable()
        );
        assert!(
            DefenseError::BackupPass {
                backup_root: PathBuf::new(),
                details: String::new(),
            }
            .is_retryable()
        );
        assert!(DefenseError::ScorerTimeout { budget_ms: 5 }.is_retryable());

        assert!(
            !DefenseError::WatchInit {
                path: PathBuf::new(),
                details: String::new(),
            }
            .is_retryable()
        );
        assert!(
            !DefenseError::InvalidConfig {
                details: String::new()
            }
            .is_retryable()
        );
        assert!(
            !DefenseError::ReconcileConflict {
                path: PathBuf::new(),
                reason: String::new(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn io_convenience_constructor() {
        let err = DefenseError::io(
            "/tmp/protected/report.txt",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.code(), "RSN-3005");
        assert!(err.to_string().contains("/tmp/protected/report.txt"));
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: DefenseError = json_err.into();
        assert_eq!(err.code(), "RSN-2101");
    }

    #[test]
    fn from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        let err: DefenseError = toml_err.into();
        assert_eq!(err.code(), "RSN-1003");
    }
}
