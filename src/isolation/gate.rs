//! The isolation flag: one atomic owned by the orchestrator.
//!
//! The write-interception path used to be gated by an ad hoc shared boolean;
//! here it is a single atomic behind a narrow API. The orchestrator holds the
//! flippable [`IsolationGate`]; everything else gets a read-only
//! [`IsolationView`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Flippable isolation state. Created and owned by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct IsolationGate {
    flag: Arc<AtomicBool>,
}

impl IsolationGate {
    /// An inactive gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin capturing writes.
    pub fn activate(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Stop capturing writes.
    pub fn deactivate(&self) {
        self.flag.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Read-only handle for writer-side checks.
    #[must_use]
    pub fn view(&self) -> IsolationView {
        IsolationView {
            flag: Arc::clone(&self.flag),
        }
    }
}

/// Read-only view of the isolation state.
#[derive(Debug, Clone)]
pub struct IsolationView {
    flag: Arc<AtomicBool>,
}

impl IsolationView {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
