//! Defense orchestrator: the tier state machine that sequences backup and
//! isolation.
//!
//! `evaluate(score)` is the single entry point consumed by whatever drives
//! the evaluation loop. Transition actions:
//!
//! - escalation into `Guarded` runs one synchronous backup pass;
//! - escalation into `Emergency` spawns the backup pass on a worker thread
//!   and activates isolation immediately, so capture and copy run
//!   concurrently — a failed pass can never block isolation;
//! - re-entering `Emergency` is a no-op;
//! - leaving `Emergency` deactivates isolation and reconciles staged writes.
//!
//! Backup passes are serialized here: a new pass never starts while a
//! previous one may still be writing its manifest. Passes only ever run
//! concurrently with write interception, not with each other.

#![allow(missing_docs)]

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::Utc;

use crate::backup::engine::{BackupEngine, BackupReport};
use crate::core::config::Config;
use crate::core::errors::{DefenseError, Result};
use crate::core::paths::sanitize_for_flat_name;
use crate::daemon::policy::{AssessmentRing, DecisionPolicy, ResponseTier, ThreatAssessment};
use crate::isolation::gate::{IsolationGate, IsolationView};
use crate::isolation::manager::{IsolatedWriteManager, ReconciliationReport};

/// Retained assessment history (audit ring capacity).
const ASSESSMENT_HISTORY: usize = 512;

// ──────────────────── outcome ────────────────────

/// Result of one evaluation, reported upward every tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefenseOutcome {
    pub tier: ResponseTier,
    pub backup_triggered: bool,
    pub isolation_active: bool,
    /// Files copied by the most recently completed pass.
    pub files_copied: usize,
    /// Bytes copied by the most recently completed pass.
    pub bytes_copied: u64,
}

/// Aggregated result of running a pass over every protected root.
#[derive(Debug, Clone, Default)]
pub struct BackupTotals {
    pub files_copied: usize,
    pub bytes_copied: u64,
    pub files_skipped: usize,
}

impl BackupTotals {
    fn absorb(&mut self, report: &BackupReport) {
        self.files_copied += report.files_copied;
        self.bytes_copied += report.bytes_copied;
        self.files_skipped += report.skipped.len();
    }
}

/// Record of a tier transition, for diagnostics.
#[derive(Debug, Clone)]
pub struct TransitionEntry {
    pub from: ResponseTier,
    pub to: ResponseTier,
    pub at_evaluation: u64,
    pub score: f64,
}

/// Completion record of a backup pass, drained by the monitoring loop for
/// logging. Emergency passes finish asynchronously, so their completion is
/// only visible through this queue.
#[derive(Debug, Clone)]
pub enum PassEvent {
    Completed(BackupTotals),
    Failed(String),
}

// ──────────────────── orchestrator ────────────────────

type PassHandle = JoinHandle<Result<BackupTotals>>;

/// Owns the tier state machine and sequences the defense components.
pub struct DefenseOrchestrator {
    policy: DecisionPolicy,
    tier: ResponseTier,
    gate: IsolationGate,
    write_manager: Arc<IsolatedWriteManager>,
    engines: Arc<Vec<BackupEngine>>,
    ring: AssessmentRing,
    in_flight: Option<PassHandle>,
    last_totals: BackupTotals,
    last_pass_error: Option<String>,
    last_reconciliation: Option<ReconciliationReport>,
    transition_log: Vec<TransitionEntry>,
    pending_pass_events: Vec<PassEvent>,
    evaluations: u64,
}

impl DefenseOrchestrator {
    /// Build the orchestrator from configuration.
    ///
    /// If a non-empty pending-write journal survives from a previous run,
    /// the orchestrator resumes in `Emergency` with isolation active until
    /// an explicit reconcile.
    pub fn new(config: &Config) -> Result<Self> {
        let gate = IsolationGate::new();
        let protected_root = config
            .watch
            .roots
            .first()
            .cloned()
            .ok_or_else(|| DefenseError::InvalidConfig {
                details: "watch.roots must name at least one directory".to_string(),
            })?;

        let write_manager = Arc::new(IsolatedWriteManager::new(
            protected_root,
            config.isolation.staging_root.clone(),
            gate.clone(),
        )?);

        // One engine per protected root, each with its own manifest under a
        // per-root subdirectory of the backup store.
        let engines: Vec<BackupEngine> = config
            .watch
            .roots
            .iter()
            .map(|root| {
                let mut backup_config = config.backup.clone();
                if config.watch.roots.len() > 1 {
                    backup_config.backup_root = config
                        .backup
                        .backup_root
                        .join(sanitize_for_flat_name(root));
                }
                BackupEngine::new(root.clone(), &backup_config)
            })
            .collect();

        let mut tier = ResponseTier::Normal;
        if write_manager.pending_count() > 0 {
            tier = ResponseTier::Emergency;
            gate.activate();
        }

        Ok(Self {
            policy: DecisionPolicy::from_config(&config.engine),
            tier,
            gate,
            write_manager,
            engines: Arc::new(engines),
            ring: AssessmentRing::new(ASSESSMENT_HISTORY),
            in_flight: None,
            last_totals: BackupTotals::default(),
            last_pass_error: None,
            last_reconciliation: None,
            transition_log: Vec::new(),
            pending_pass_events: Vec::new(),
            evaluations: 0,
        })
    }

    // ──────────── accessors ────────────

    #[must_use]
    pub fn tier(&self) -> ResponseTier {
        self.tier
    }

    #[must_use]
    pub fn isolation_view(&self) -> IsolationView {
        self.gate.view()
    }

    /// The write manager, for wiring into writer-side interception.
    #[must_use]
    pub fn write_manager(&self) -> Arc<IsolatedWriteManager> {
        Arc::clone(&self.write_manager)
    }

    #[must_use]
    pub fn latest_assessment(&self) -> Option<&ThreatAssessment> {
        self.ring.latest()
    }

    /// Oldest-first audit trail of recent assessments.
    pub fn assessments(&self) -> impl Iterator<Item = &ThreatAssessment> {
        self.ring.iter()
    }

    #[must_use]
    pub fn transition_log(&self) -> &[TransitionEntry] {
        &self.transition_log
    }

    #[must_use]
    pub fn last_pass_error(&self) -> Option<&str> {
        self.last_pass_error.as_deref()
    }

    #[must_use]
    pub fn last_reconciliation(&self) -> Option<&ReconciliationReport> {
        self.last_reconciliation.as_ref()
    }

    /// Drain completion records of passes finished since the last drain.
    pub fn drain_pass_events(&mut self) -> Vec<PassEvent> {
        self.harvest_finished_pass();
        std::mem::take(&mut self.pending_pass_events)
    }

    // ──────────── evaluation ────────────

    /// Evaluate one threat score and perform any tier-transition actions.
    pub fn evaluate(&mut self, score: f64) -> DefenseOutcome {
        self.evaluations += 1;
        self.harvest_finished_pass();

        let next = self.policy.classify(score);
        let previous = self.tier;
        self.ring.push(ThreatAssessment {
            score,
            at: Utc::now(),
            tier: next,
        });
        if next != previous {
            self.transition_log.push(TransitionEntry {
                from: previous,
                to: next,
                at_evaluation: self.evaluations,
                score,
            });
        }

        let mut backup_triggered = false;
        match (previous, next) {
            // Escalation into Guarded: one synchronous pass.
            (ResponseTier::Normal, ResponseTier::Guarded) => {
                backup_triggered = true;
                self.run_pass_blocking();
            }
            // Escalation into Emergency: pass runs concurrently with write
            // capture. Isolation activates without waiting on the copy.
            (ResponseTier::Normal | ResponseTier::Guarded, ResponseTier::Emergency) => {
                backup_triggered = true;
                self.spawn_pass();
                self.gate.activate();
            }
            // Leaving Emergency: replay captured writes.
            (ResponseTier::Emergency, ResponseTier::Guarded | ResponseTier::Normal) => {
                let _ = self.reconcile();
            }
            // Emergency re-entry is a strict no-op; everything else is
            // continued monitoring.
            _ => {}
        }

        self.tier = next;
        DefenseOutcome {
            tier: next,
            backup_triggered,
            isolation_active: self.gate.is_active(),
            files_copied: self.last_totals.files_copied,
            bytes_copied: self.last_totals.bytes_copied,
        }
    }

    /// Run one backup pass immediately (manual trigger path).
    pub fn force_backup(&mut self) -> Result<BackupTotals> {
        self.await_in_flight();
        let totals = run_engines(&self.engines)?;
        self.last_totals = totals.clone();
        self.last_pass_error = None;
        self.pending_pass_events.push(PassEvent::Completed(totals.clone()));
        Ok(totals)
    }

    /// Explicitly reconcile pending writes (CLI path and de-escalation).
    pub fn reconcile(&mut self) -> Option<ReconciliationReport> {
        match self.write_manager.deactivate_and_reconcile() {
            Ok(report) => {
                self.last_reconciliation = Some(report.clone());
                Some(report)
            }
            Err(err) => {
                // Structural staging failure: isolation is already off; the
                // journal still holds the pending set for a retry.
                self.last_pass_error = Some(err.to_string());
                None
            }
        }
    }

    /// Block until any in-flight pass has completed (shutdown path).
    pub fn await_in_flight(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            self.absorb_pass_result(handle.join());
        }
    }

    // ──────────── pass management ────────────

    fn run_pass_blocking(&mut self) {
        // Serialize with any still-running Emergency pass.
        self.await_in_flight();
        match run_engines(&self.engines) {
            Ok(totals) => {
                self.last_totals = totals.clone();
                self.last_pass_error = None;
                self.pending_pass_events.push(PassEvent::Completed(totals));
            }
            Err(err) => {
                let details = err.to_string();
                self.last_pass_error = Some(details.clone());
                self.pending_pass_events.push(PassEvent::Failed(details));
            }
        }
    }

    fn spawn_pass(&mut self) {
        if self.in_flight.is_some() {
            // Prior pass not known complete; passes never stack.
            return;
        }
        let engines = Arc::clone(&self.engines);
        self.in_flight = Some(thread::spawn(move || run_engines(&engines)));
    }

    fn harvest_finished_pass(&mut self) {
        if let Some(handle) = self.in_flight.take_if(|handle| handle.is_finished()) {
            self.absorb_pass_result(handle.join());
        }
    }

    fn absorb_pass_result(
        &mut self,
        joined: std::thread::Result<Result<BackupTotals>>,
    ) {
        match joined {
            Ok(Ok(totals)) => {
                self.last_totals = totals.clone();
                self.last_pass_error = None;
                self.pending_pass_events.push(PassEvent::Completed(totals));
            }
            Ok(Err(err)) => {
                let details = err.to_string();
                self.last_pass_error = Some(details.clone());
                self.pending_pass_events.push(PassEvent::Failed(details));
            }
            Err(_) => {
                let details = "backup pass thread panicked".to_string();
                self.last_pass_error = Some(details.clone());
                self.pending_pass_events.push(PassEvent::Failed(details));
            }
        }
    }
}

/// Run a pass over every engine, aggregating totals.
///
/// Per-file failures are already folded into each report; a structural
/// failure of any root store fails the combined pass (manifests of roots
/// that finished earlier have already been atomically advanced).
fn run_engines(engines: &[BackupEngine]) -> Result<BackupTotals> {
    let mut totals = BackupTotals::default();
    let mut first_error: Option<DefenseError> = None;

    for engine in engines {
        match engine.run_pass() {
            Ok(report) => totals.absorb(&report),
            Err(err) if first_error.is_none() => first_error = Some(err),
            Err(_) => {}
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(totals),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    struct Sandbox {
        _dirs: Vec<TempDir>,
        config: Config,
    }

    impl Sandbox {
        fn new() -> Self {
            let protected = TempDir::new().unwrap();
            let store = TempDir::new().unwrap();
            fs::write(protected.path().join("seed.txt"), b"seed data").unwrap();

            let mut config = Config::default();
            config.watch.roots = vec![protected.path().to_path_buf()];
            config.backup.backup_root = store.path().join("backup");
            config.backup.workers = 2;
            config.isolation.staging_root = store.path().join("staging");

            Self {
                _dirs: vec![protected, store],
                config,
            }
        }

        fn protected_root(&self) -> &Path {
            &self.config.watch.roots[0]
        }
    }

    #[test]
    fn starts_normal_with_clean_journal() {
        let sandbox = Sandbox::new();
        let orchestrator = DefenseOrchestrator::new(&sandbox.config).unwrap();
        assert_eq!(orchestrator.tier(), ResponseTier::Normal);
        assert!(!orchestrator.isolation_view().is_active());
    }

    #[test]
    fn normal_to_normal_takes_no_action() {
        let sandbox = Sandbox::new();
        let mut orchestrator = DefenseOrchestrator::new(&sandbox.config).unwrap();
        let outcome = orchestrator.evaluate(0.1);
        assert_eq!(outcome.tier, ResponseTier::Normal);
        assert!(!outcome.backup_triggered);
        assert!(!outcome.isolation_active);
        assert_eq!(outcome.files_copied, 0);
    }

    #[test]
    fn escalation_to_guarded_runs_backup() {
        let sandbox = Sandbox::new();
        let mut orchestrator = DefenseOrchestrator::new(&sandbox.config).unwrap();
        let outcome = orchestrator.evaluate(0.5);
        assert_eq!(outcome.tier, ResponseTier::Guarded);
        assert!(outcome.backup_triggered);
        assert!(!outcome.isolation_active);
        assert_eq!(outcome.files_copied, 1);
        assert!(sandbox.config.backup.backup_root.join("seed.txt").exists());
    }

    #[test]
    fn escalation_to_emergency_activates_isolation_immediately() {
        let sandbox = Sandbox::new();
        let mut orchestrator = DefenseOrchestrator::new(&sandbox.config).unwrap();
        let outcome = orchestrator.evaluate(0.9);
        assert_eq!(outcome.tier, ResponseTier::Emergency);
        assert!(outcome.backup_triggered);
        assert!(outcome.isolation_active, "isolation must not wait for the pass");

        orchestrator.await_in_flight();
        assert!(sandbox.config.backup.backup_root.join("seed.txt").exists());
    }

    #[test]
    fn emergency_reentry_is_a_noop() {
        let sandbox = Sandbox::new();
        let mut orchestrator = DefenseOrchestrator::new(&sandbox.config).unwrap();
        orchestrator.evaluate(0.9);
        orchestrator.await_in_flight();

        let again = orchestrator.evaluate(0.95);
        assert_eq!(again.tier, ResponseTier::Emergency);
        assert!(!again.backup_triggered);
        assert!(again.isolation_active);
    }

    #[test]
    fn leaving_emergency_reconciles() {
        let sandbox = Sandbox::new();
        let mut orchestrator = DefenseOrchestrator::new(&sandbox.config).unwrap();
        orchestrator.evaluate(0.9);

        let manager = orchestrator.write_manager();
        let target = sandbox.protected_root().join("captured.txt");
        manager.intercept(&target, b"held back").unwrap();
        assert!(!target.exists());

        let outcome = orchestrator.evaluate(0.2);
        assert_eq!(outcome.tier, ResponseTier::Normal);
        assert!(!outcome.isolation_active);
        assert_eq!(fs::read(&target).unwrap(), b"held back");
        let report = orchestrator.last_reconciliation().unwrap();
        assert_eq!(report.applied, 1);
    }

    #[test]
    fn backup_failure_does_not_block_isolation() {
        let sandbox = Sandbox::new();
        let config = sandbox.config.clone();
        // Occupy the backup root with a file so the pass pre-flight fails.
        fs::write(&config.backup.backup_root, b"blocked").unwrap();

        let mut orchestrator = DefenseOrchestrator::new(&config).unwrap();
        let outcome = orchestrator.evaluate(0.9);
        assert!(outcome.isolation_active);

        orchestrator.await_in_flight();
        assert!(orchestrator.last_pass_error().is_some());
        assert!(orchestrator.isolation_view().is_active());
    }

    #[test]
    fn restart_with_pending_journal_resumes_emergency() {
        let sandbox = Sandbox::new();
        {
            let mut orchestrator = DefenseOrchestrator::new(&sandbox.config).unwrap();
            orchestrator.evaluate(0.9);
            orchestrator
                .write_manager()
                .intercept(&sandbox.protected_root().join("pending.txt"), b"unflushed")
                .unwrap();
            orchestrator.await_in_flight();
        }

        let mut reborn = DefenseOrchestrator::new(&sandbox.config).unwrap();
        assert_eq!(reborn.tier(), ResponseTier::Emergency);
        assert!(reborn.isolation_view().is_active());

        // Explicit reconcile releases the resumed Emergency.
        let report = reborn.reconcile().unwrap();
        assert_eq!(report.applied, 1);
        assert!(sandbox.protected_root().join("pending.txt").exists());
    }

    #[test]
    fn transition_log_records_escalations() {
        let sandbox = Sandbox::new();
        let mut orchestrator = DefenseOrchestrator::new(&sandbox.config).unwrap();
        orchestrator.evaluate(0.5);
        orchestrator.evaluate(0.9);
        orchestrator.evaluate(0.1);

        let log = orchestrator.transition_log();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].from, ResponseTier::Normal);
        assert_eq!(log[0].to, ResponseTier::Guarded);
        assert_eq!(log[1].to, ResponseTier::Emergency);
        assert_eq!(log[2].to, ResponseTier::Normal);
    }

}
