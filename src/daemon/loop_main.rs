//! Main monitoring loop: fixed-cadence sampling, scoring, evaluation.
//!
//! Architecture: a single lightweight loop ticks at the sampling interval
//! and never blocks past it — the observer drains with bounded work, the
//! scorer is awaited only up to its latency budget, and logging goes over a
//! non-blocking channel to a dedicated logger thread. Backup worker pools
//! are spawned by the orchestrator only on tier transitions; the loop never
//! owns long-running work.

#![allow(missing_docs)]

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::tick;

use crate::core::config::Config;
use crate::core::errors::Result;
use crate::daemon::orchestrator::{DefenseOrchestrator, PassEvent};
use crate::daemon::policy::ResponseTier;
use crate::daemon::scorer::{ScorerBridge, ThreatScorer};
use crate::daemon::signals::SignalHandler;
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle, spawn_logger};
use crate::logger::jsonl::JsonlConfig;
use crate::monitor::observer::FileTreeObserver;

/// Consecutive stale scores before the degradation is logged.
const STALE_SCORE_ALERT_THRESHOLD: u64 = 3;

/// The monitoring daemon: wires observer → scorer → orchestrator.
pub struct SentinelDaemon {
    config: Config,
    observer: FileTreeObserver,
    scorer: ScorerBridge,
    orchestrator: DefenseOrchestrator,
    logger_handle: ActivityLoggerHandle,
    logger_join: Option<thread::JoinHandle<()>>,
    signal_handler: SignalHandler,
    start_time: Instant,
    consecutive_stale: u64,
}

impl SentinelDaemon {
    /// Build and initialize the daemon from configuration and a scorer.
    pub fn init(config: Config, scorer: Box<dyn ThreatScorer>) -> Result<Self> {
        let (logger_handle, logger_join) = spawn_logger(JsonlConfig {
            path: config.paths.activity_log.clone(),
            ..JsonlConfig::default()
        })?;

        let signal_handler = SignalHandler::new();
        let observer = FileTreeObserver::start(&config)?;
        let orchestrator = DefenseOrchestrator::new(&config)?;
        let scorer = ScorerBridge::spawn(
            scorer,
            Duration::from_millis(config.engine.scorer_budget_ms),
        );

        Ok(Self {
            config,
            observer,
            scorer,
            orchestrator,
            logger_handle,
            logger_join: Some(logger_join),
            signal_handler,
            start_time: Instant::now(),
            consecutive_stale: 0,
        })
    }

    /// Signal handle for external shutdown requests.
    #[must_use]
    pub fn signal_handler(&self) -> SignalHandler {
        self.signal_handler.clone()
    }

    /// Run the monitoring loop until shutdown is requested.
    pub fn run(&mut self) -> Result<()> {
        let config_hash = self.config.stable_hash().unwrap_or_default();
        self.logger_handle.send(ActivityEvent::EngineStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash,
        });
        if self.orchestrator.tier() == ResponseTier::Emergency {
            // Resumed from a non-empty pending-write journal.
            self.logger_handle
                .send(ActivityEvent::IsolationActivated { score: 1.0 });
        }

        let ticker = tick(Duration::from_millis(self.config.engine.sampling_interval_ms));

        loop {
            if self.signal_handler.should_shutdown() {
                break;
            }
            if self.signal_handler.should_backup() {
                self.manual_backup();
            }

            // Bounded wait so shutdown is observed within one interval even
            // if the ticker falls behind.
            if ticker
                .recv_timeout(Duration::from_millis(
                    self.config.engine.sampling_interval_ms,
                ))
                .is_ok()
            {
                self.tick();
            }
        }

        self.shutdown();
        Ok(())
    }

    /// One evaluation tick: sample → score → evaluate → log.
    fn tick(&mut self) {
        let features = self.observer.sample();
        let reading = self.scorer.score(&features);

        if reading.stale {
            self.consecutive_stale += 1;
            if self.consecutive_stale == STALE_SCORE_ALERT_THRESHOLD {
                self.logger_handle.send(ActivityEvent::ScorerDegraded {
                    consecutive_timeouts: self.consecutive_stale,
                });
            }
        } else {
            self.consecutive_stale = 0;
        }

        let before = self.orchestrator.tier();
        let outcome = self.orchestrator.evaluate(reading.score);

        if outcome.tier != before {
            self.logger_handle.send(ActivityEvent::TierChanged {
                from: before.to_string(),
                to: outcome.tier.to_string(),
                score: reading.score,
            });
            if outcome.tier == ResponseTier::Emergency {
                self.logger_handle
                    .send(ActivityEvent::IsolationActivated { score: reading.score });
            }
            if before == ResponseTier::Emergency
                && let Some(report) = self.orchestrator.last_reconciliation()
            {
                self.logger_handle.send(ActivityEvent::ReconciliationCompleted {
                    applied: report.applied as u64,
                    rejected: report.rejected as u64,
                    duration_ms: 0,
                });
            }
        }

        self.flush_pass_events();
    }

    fn manual_backup(&mut self) {
        match self.orchestrator.force_backup() {
            Ok(_) => self.flush_pass_events(),
            Err(err) => self.logger_handle.send(ActivityEvent::BackupFailed {
                error_code: err.code().to_string(),
                error_message: err.to_string(),
            }),
        }
    }

    fn flush_pass_events(&mut self) {
        for event in self.orchestrator.drain_pass_events() {
            match event {
                PassEvent::Completed(totals) => {
                    self.logger_handle.send(ActivityEvent::BackupCompleted {
                        files_copied: totals.files_copied as u64,
                        bytes_copied: totals.bytes_copied,
                        files_skipped: totals.files_skipped as u64,
                        duration_ms: 0,
                    });
                }
                PassEvent::Failed(details) => {
                    self.logger_handle.send(ActivityEvent::BackupFailed {
                        error_code: "RSN-3002".to_string(),
                        error_message: details,
                    });
                }
            }
        }
    }

    fn shutdown(&mut self) {
        // Abandon nothing silently: wait for an in-flight pass (its manifest
        // write is atomic either way), then stop logging.
        self.orchestrator.await_in_flight();
        self.flush_pass_events();

        self.logger_handle.send(ActivityEvent::EngineStopped {
            reason: "signal".to_string(),
            uptime_secs: self.start_time.elapsed().as_secs(),
        });
        self.logger_handle.shutdown();
        if let Some(join) = self.logger_join.take() {
            let _ = join.join();
        }
    }
}
