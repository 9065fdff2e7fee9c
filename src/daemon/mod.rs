//! Daemon subsystem: decision policy, orchestration, scoring boundary,
//! monitoring loop, and signal handling.

#[cfg(feature = "daemon")]
pub mod loop_main;
pub mod orchestrator;
pub mod policy;
pub mod scorer;
#[cfg(feature = "daemon")]
pub mod signals;
