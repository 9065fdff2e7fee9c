//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use ransom_sentinel::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{DefenseError, Result};

// Monitor
pub use crate::monitor::features::{FeatureVector, WindowSummary};
pub use crate::monitor::observer::{ChangeEvent, ChangeKind, FileTreeObserver};
pub use crate::monitor::rates::{ActivityRateEstimator, ActivityRates};

// Backup
pub use crate::backup::engine::{BackupEngine, BackupReport};
pub use crate::backup::manifest::{BackupManifest, ManifestEntry};

// Isolation
pub use crate::isolation::gate::{IsolationGate, IsolationView};
pub use crate::isolation::manager::{
    IsolatedWriteManager, ReconciliationReport, WriteOperation, WriteStatus,
};

// Daemon
pub use crate::daemon::orchestrator::{DefenseOrchestrator, DefenseOutcome};
pub use crate::daemon::policy::{DecisionPolicy, ResponseTier, ThreatAssessment};
pub use crate::daemon::scorer::{HeuristicScorer, ScorerBridge, ThreatScorer};
