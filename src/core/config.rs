//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{DefenseError, Result};

/// Full engine configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    pub engine: EngineConfig,
    pub watch: WatchConfig,
    pub backup: BackupConfig,
    pub isolation: IsolationConfig,
    pub telemetry: TelemetryConfig,
    pub paths: PathsConfig,
}

/// Tier thresholds and evaluation cadence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Scores strictly above this enter `Guarded`.
    pub guarded_threshold: f64,
    /// Scores strictly above this enter `Emergency`.
    pub emergency_threshold: f64,
    /// Feature-vector sampling interval in milliseconds.
    pub sampling_interval_ms: u64,
    /// Latency budget for one scorer call; past it the last known score is reused.
    pub scorer_budget_ms: u64,
    /// Files-per-second rate above which the rapid-change flag is raised.
    pub rapid_change_threshold: f64,
}

/// Watched tree behavior and per-tick work budgets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WatchConfig {
    pub roots: Vec<PathBuf>,
    /// Extension patterns treated as ransomware markers (anchored regex fragments).
    pub suspicious_extensions: Vec<String>,
    /// Maximum files content-hashed per sampling tick (rename matching).
    pub hash_budget_per_tick: usize,
    /// Maximum files entropy-sampled per sampling tick.
    pub entropy_budget_per_tick: usize,
    /// Bytes read from the head of each file for entropy estimation.
    pub entropy_sample_bytes: usize,
}

/// Incremental backup engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackupConfig {
    pub backup_root: PathBuf,
    /// Copy worker pool size. Defaults to available CPU cores.
    pub workers: usize,
    /// Previous manifest generations retained on disk.
    pub manifest_history_depth: usize,
}

/// Isolated write capture settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IsolationConfig {
    /// Clean staging area receiving captured writes.
    pub staging_root: PathBuf,
}

/// Rate-estimator tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    pub ewma_base_alpha: f64,
    pub ewma_min_alpha: f64,
    pub ewma_max_alpha: f64,
    pub ewma_min_samples: u64,
}

/// Filesystem paths used by the engine itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub activity_log: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            guarded_threshold: 0.4,
            emergency_threshold: 0.7,
            sampling_interval_ms: 250,
            scorer_budget_ms: 25,
            rapid_change_threshold: 50.0,
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            roots: vec![PathBuf::from("/data/protected")],
            suspicious_extensions: default_suspicious_extensions(),
            hash_budget_per_tick: 32,
            entropy_budget_per_tick: 16,
            entropy_sample_bytes: 8192,
        }
    }
}

/// Extensions commonly appended by encrypting ransomware.
fn default_suspicious_extensions() -> Vec<String> {
    [
        "locked", "encrypted", "enc", "crypt", "crypted", "crypto", "locky", "wcry", "wncry",
        "cerber", "zepto", "odin",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_root: default_data_dir().join("backup"),
            workers: std::thread::available_parallelism().map_or(2, std::num::NonZeroUsize::get),
            manifest_history_depth: 3,
        }
    }
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            staging_root: default_data_dir().join("staging"),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            ewma_base_alpha: 0.30,
            ewma_min_alpha: 0.10,
            ewma_max_alpha: 0.75,
            ewma_min_samples: 3,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home = env::var_os("HOME").map_or_else(
            || {
                eprintln!("[RSN-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths");
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home.join(".config").join("rsn").join("config.toml");
        Self {
            config_file: cfg,
            activity_log: default_data_dir().join("activity.jsonl"),
        }
    }
}

fn default_data_dir() -> PathBuf {
    let home = env::var_os("HOME").map_or_else(|| PathBuf::from("/tmp"), PathBuf::from);
    home.join(".local").join("share").join("rsn")
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path;
    /// defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| DefenseError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(DefenseError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides()?;
        cfg.normalize_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for the startup log line.
    ///
    /// FNV-1a over the canonical JSON form, stable across processes and Rust
    /// releases (unlike `DefaultHasher`).
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        // engine
        set_env_f64(
            "RSN_ENGINE_GUARDED_THRESHOLD",
            &mut self.engine.guarded_threshold,
        )?;
        set_env_f64(
            "RSN_ENGINE_EMERGENCY_THRESHOLD",
            &mut self.engine.emergency_threshold,
        )?;
        set_env_u64(
            "RSN_ENGINE_SAMPLING_INTERVAL_MS",
            &mut self.engine.sampling_interval_ms,
        )?;
        set_env_u64("RSN_ENGINE_SCORER_BUDGET_MS", &mut self.engine.scorer_budget_ms)?;
        set_env_f64(
            "RSN_ENGINE_RAPID_CHANGE_THRESHOLD",
            &mut self.engine.rapid_change_threshold,
        )?;

        // watch
        if let Ok(raw) = env::var("RSN_WATCH_ROOTS") {
            self.watch.roots = raw.split(':').filter(|s| !s.is_empty()).map(PathBuf::from).collect();
        }
        set_env_usize(
            "RSN_WATCH_HASH_BUDGET_PER_TICK",
            &mut self.watch.hash_budget_per_tick,
        )?;
        set_env_usize(
            "RSN_WATCH_ENTROPY_BUDGET_PER_TICK",
            &mut self.watch.entropy_budget_per_tick,
        )?;

        // backup
        if let Ok(raw) = env::var("RSN_BACKUP_ROOT") {
            self.backup.backup_root = PathBuf::from(raw);
        }
        set_env_usize("RSN_BACKUP_WORKERS", &mut self.backup.workers)?;
        set_env_usize(
            "RSN_BACKUP_MANIFEST_HISTORY_DEPTH",
            &mut self.backup.manifest_history_depth,
        )?;

        // isolation
        if let Ok(raw) = env::var("RSN_STAGING_ROOT") {
            self.isolation.staging_root = PathBuf::from(raw);
        }

        // telemetry
        set_env_f64("RSN_TELEMETRY_EWMA_BASE_ALPHA", &mut self.telemetry.ewma_base_alpha)?;
        set_env_f64("RSN_TELEMETRY_EWMA_MIN_ALPHA", &mut self.telemetry.ewma_min_alpha)?;
        set_env_f64("RSN_TELEMETRY_EWMA_MAX_ALPHA", &mut self.telemetry.ewma_max_alpha)?;
        set_env_u64(
            "RSN_TELEMETRY_EWMA_MIN_SAMPLES",
            &mut self.telemetry.ewma_min_samples,
        )?;

        Ok(())
    }

    /// Strip trailing slashes so path comparisons behave.
    fn normalize_paths(&mut self) {
        for path in self
            .watch
            .roots
            .iter_mut()
            .chain(std::iter::once(&mut self.backup.backup_root))
            .chain(std::iter::once(&mut self.isolation.staging_root))
        {
            let s = path.to_string_lossy();
            if s.len() > 1
                && let Some(stripped) = s.strip_suffix('/')
            {
                *path = PathBuf::from(stripped);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        for (name, val) in [
            ("guarded_threshold", self.engine.guarded_threshold),
            ("emergency_threshold", self.engine.emergency_threshold),
        ] {
            if !(0.0..=1.0).contains(&val) {
                return Err(DefenseError::InvalidConfig {
                    details: format!("engine.{name} must be in [0, 1], got {val}"),
                });
            }
        }

        if self.engine.guarded_threshold >= self.engine.emergency_threshold {
            return Err(DefenseError::InvalidConfig {
                details: "engine.guarded_threshold must be < engine.emergency_threshold"
                    .to_string(),
            });
        }

        if self.engine.sampling_interval_ms == 0 {
            return Err(DefenseError::InvalidConfig {
                details: "engine.sampling_interval_ms must be > 0".to_string(),
            });
        }

        if self.watch.roots.is_empty() {
            return Err(DefenseError::InvalidConfig {
                details: "watch.roots must name at least one directory".to_string(),
            });
        }

        if self.backup.workers == 0 {
            return Err(DefenseError::InvalidConfig {
                details: "backup.workers must be >= 1".to_string(),
            });
        }

        if self.backup.backup_root == self.isolation.staging_root {
            return Err(DefenseError::InvalidConfig {
                details: "backup.backup_root and isolation.staging_root must differ".to_string(),
            });
        }

        // Backup/staging under a watched root would feed the engine its own
        // writes and re-trigger itself on every pass.
        for root in &self.watch.roots {
            for (name, target) in [
                ("backup.backup_root", &self.backup.backup_root),
                ("isolation.staging_root", &self.isolation.staging_root),
            ] {
                if target.starts_with(root) {
                    return Err(DefenseError::InvalidConfig {
                        details: format!("{name} must not live under watched root {}", root.display()),
                    });
                }
            }
        }

        if !(0.0..=1.0).contains(&self.telemetry.ewma_base_alpha)
            || self.telemetry.ewma_min_alpha > self.telemetry.ewma_max_alpha
        {
            return Err(DefenseError::InvalidConfig {
                details: "telemetry EWMA alphas must satisfy 0 <= min <= base <= max <= 1"
                    .to_string(),
            });
        }

        Ok(())
    }
}

// ──────────────────── env parsing helpers ────────────────────

fn set_env_f64(key: &str, target: &mut f64) -> Result<()> {
    if let Ok(raw) = env::var(key) {
        *target = raw.parse().map_err(|_| DefenseError::InvalidConfig {
            details: format!("{key} must be a number, got {raw:?}"),
        })?;
    }
    Ok(())
}

fn set_env_u64(key: &str, target: &mut u64) -> Result<()> {
    if let Ok(raw) = env::var(key) {
        *target = raw.parse().map_err(|_| DefenseError::InvalidConfig {
            details: format!("{key} must be a non-negative integer, got {raw:?}"),
        })?;
    }
    Ok(())
}

fn set_env_usize(key: &str, target: &mut usize) -> Result<()> {
    if let Ok(raw) = env::var(key) {
        *target = raw.parse().map_err(|_| DefenseError::InvalidConfig {
            details: format!("{key} must be a non-negative integer, got {raw:?}"),
        })?;
    }
    Ok(())
}
