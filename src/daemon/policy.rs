//! Decision policy: score → response tier, plus the assessment audit ring.
//!
//! The mapping is deterministic and stateless; hysteresis and sequencing
//! live in the orchestrator, never here. The boundary behavior is part of
//! the measurable response-time contract and must not drift: both
//! thresholds are inclusive at the lower bound (a score of exactly 0.4 is
//! `Normal`, exactly 0.7 is `Guarded`).

#![allow(missing_docs)]

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::config::EngineConfig;

/// Response level of the defense engine.
///
/// Ordered so escalation comparisons read naturally:
/// `Normal < Guarded < Emergency`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseTier {
    Normal,
    Guarded,
    Emergency,
}

impl fmt::Display for ResponseTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Guarded => write!(f, "guarded"),
            Self::Emergency => write!(f, "emergency"),
        }
    }
}

/// One scored evaluation, immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatAssessment {
    pub score: f64,
    pub at: DateTime<Utc>,
    pub tier: ResponseTier,
}

/// Pure score → tier mapping with configured thresholds.
#[derive(Debug, Clone)]
pub struct DecisionPolicy {
    guarded_threshold: f64,
    emergency_threshold: f64,
}

impl DecisionPolicy {
    #[must_use]
    pub fn new(guarded_threshold: f64, emergency_threshold: f64) -> Self {
        Self {
            guarded_threshold,
            emergency_threshold,
        }
    }

    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.guarded_threshold, config.emergency_threshold)
    }

    /// Map a score to its tier. Scores outside [0, 1] are clamped; NaN is
    /// treated as no signal.
    #[must_use]
    pub fn classify(&self, score: f64) -> ResponseTier {
        let score = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
        if score > self.emergency_threshold {
            ResponseTier::Emergency
        } else if score > self.guarded_threshold {
            ResponseTier::Guarded
        } else {
            ResponseTier::Normal
        }
    }
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Bounded in-memory ring of recent assessments for auditing.
#[derive(Debug)]
pub struct AssessmentRing {
    capacity: usize,
    entries: VecDeque<ThreatAssessment>,
}

impl AssessmentRing {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, assessment: ThreatAssessment) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(assessment);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn latest(&self) -> Option<&ThreatAssessment> {
        self.entries.back()
    }

    /// Oldest-first iteration over retained assessments.
    pub fn iter(&self) -> impl Iterator<Item = &ThreatAssessment> {
        self.entries.iter()
    }
}
