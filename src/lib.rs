#![forbid(unsafe_code)]

//! Ransom Sentinel (rsn) — preemptive ransomware defense engine.
//!
//! Three-stage defense:
//! 1. **Change observer** — watches the protected roots and distills activity
//!    into a fixed-shape feature vector every tick
//! 2. **Tiered response** — an external threat score drives a
//!    Normal/Guarded/Emergency state machine with measurable boundaries
//! 3. **Damage control** — incremental parallel backup on escalation, plus
//!    isolated write capture with replay once the threat passes
//!
//! # Library usage
//!
//! Use the [`prelude`] for convenient access to the most common types:
//!
//! ```rust,no_run
//! use ransom_sentinel::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use ransom_sentinel::core::config::Config;
//! use ransom_sentinel::daemon::orchestrator::DefenseOrchestrator;
//! ```

pub mod prelude;

pub mod backup;
pub mod core;
pub mod daemon;
pub mod isolation;
pub mod logger;
pub mod monitor;
