//! The scoring boundary: an abstract synchronous scorer with an explicit
//! latency contract, and the bridge that enforces it.
//!
//! The feature-to-score mapping is external to this engine (in-process
//! model, local RPC, or pipe — the bridge does not care). The one guarantee
//! the monitoring loop needs is bounded latency: a scorer that misses its
//! budget degrades the tick to the last known score, it never blocks the
//! loop.

#![allow(missing_docs)]

use std::thread;
use std::time::Duration;

use crossbeam_channel as channel;

use crate::monitor::features::FeatureVector;

/// A synchronous threat scorer: feature vector → score in [0, 1].
///
/// Implementations should answer within a few milliseconds and must have no
/// side effects. Out-of-range outputs are clamped by the bridge.
pub trait ThreatScorer: Send {
    fn score(&mut self, features: &FeatureVector) -> f64;
}

impl<F> ThreatScorer for F
where
    F: FnMut(&FeatureVector) -> f64 + Send,
{
    fn score(&mut self, features: &FeatureVector) -> f64 {
        self(features)
    }
}

/// Outcome of one bridged scoring call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreReading {
    pub score: f64,
    /// True when the budget was missed and `score` is the last known value.
    pub stale: bool,
}

/// Runs the scorer on a dedicated thread and enforces the latency budget.
///
/// Each call sends a generation-tagged request and waits at most the budget
/// for the matching reply. Replies to older generations are absorbed
/// (recorded as late, never applied retroactively). If the scorer thread is
/// still chewing on an old request, the new one is dropped rather than
/// queued behind it — bounded staleness is acceptable, an unbounded queue
/// is not.
pub struct ScorerBridge {
    request_tx: channel::Sender<(u64, FeatureVector)>,
    reply_rx: channel::Receiver<(u64, f64)>,
    budget: Duration,
    generation: u64,
    last_score: f64,
    timeouts: u64,
}

impl ScorerBridge {
    /// Spawn the scorer thread. The thread exits when the bridge is dropped.
    #[must_use]
    pub fn spawn(mut scorer: Box<dyn ThreatScorer>, budget: Duration) -> Self {
        let (request_tx, request_rx) = channel::bounded::<(u64, FeatureVector)>(1);
        let (reply_tx, reply_rx) = channel::unbounded::<(u64, f64)>();

        thread::Builder::new()
            .name("rsn-scorer".to_string())
            .spawn(move || {
                while let Ok((generation, features)) = request_rx.recv() {
                    let score = scorer.score(&features);
                    if reply_tx.send((generation, score)).is_err() {
                        return;
                    }
                }
            })
            .expect("spawn scorer thread");

        Self {
            request_tx,
            reply_rx,
            budget,
            generation: 0,
            last_score: 0.0,
            timeouts: 0,
        }
    }

    /// Score one vector within the budget, or fall back to the last known
    /// score.
    pub fn score(&mut self, features: &FeatureVector) -> ScoreReading {
        self.generation += 1;
        let generation = self.generation;

        if self
            .request_tx
            .try_send((generation, features.clone()))
            .is_err()
        {
            // Scorer still busy with an earlier request.
            self.timeouts += 1;
            return ScoreReading {
                score: self.last_score,
                stale: true,
            };
        }

        let deadline = channel::after(self.budget);
        loop {
            channel::select! {
                recv(self.reply_rx) -> reply => match reply {
                    Ok((r#gen, score)) if r#gen == generation => {
                        self.last_score = clamp_score(score);
                        return ScoreReading {
                            score: self.last_score,
                            stale: false,
                        };
                    }
                    // A late answer to an earlier tick: absorb and keep waiting.
                    Ok(_) => {}
                    Err(_) => {
                        self.timeouts += 1;
                        return ScoreReading {
                            score: self.last_score,
                            stale: true,
                        };
                    }
                },
                recv(deadline) -> _ => {
                    self.timeouts += 1;
                    return ScoreReading {
                        score: self.last_score,
                        stale: true,
                    };
                }
            }
        }
    }

    /// Number of calls that fell back to the last known score.
    #[must_use]
    pub fn timeouts(&self) -> u64 {
        self.timeouts
    }

    /// Latency budget enforced per call.
    #[must_use]
    pub fn budget(&self) -> Duration {
        self.budget
    }
}

fn clamp_score(score: f64) -> f64 {
    if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) }
}

// ──────────────────── stand-in scorer ────────────────────

/// Step-function scorer keyed on the modification rate, with a bump when
/// the marker flags agree.
///
/// This is a stand-in for an external model, not a model: it exists so the
/// binary and tests have something to run against.
#[derive(Debug, Clone, Default)]
pub struct HeuristicScorer;

impl ThreatScorer for HeuristicScorer {
    fn score(&mut self, features: &FeatureVector) -> f64 {
        let base = if features.files_modified_per_sec > 100.0 {
            0.9
        } else if features.files_modified_per_sec > 50.0 {
            0.7
        } else if features.files_modified_per_sec > 10.0 {
            0.5
        } else {
            0.1
        };

        let flags = features.suspicious_extension
            + features.rapid_change
            + features.unauthorized_access
            + features.network_anomaly;
        let entropy_bump = if features.mean_entropy > 7.0 { 0.05 } else { 0.0 };

        (base + 0.02 * flags + entropy_bump).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_vector() -> FeatureVector {
        FeatureVector::idle()
    }

    #[test]
    fn fast_scorer_is_not_stale() {
        let mut bridge = ScorerBridge::spawn(
            Box::new(|_: &FeatureVector| 0.42),
            Duration::from_millis(250),
        );
        let reading = bridge.score(&idle_vector());
        assert!(!reading.stale);
        assert!((reading.score - 0.42).abs() < f64::EPSILON);
        assert_eq!(bridge.timeouts(), 0);
    }

    #[test]
    fn slow_scorer_degrades_to_last_known_score() {
        let mut bridge = ScorerBridge::spawn(
            Box::new(|fv: &FeatureVector| {
                if fv.network_anomaly > 0.5 {
                    thread::sleep(Duration::from_millis(400));
                }
                0.8
            }),
            Duration::from_millis(50),
        );

        // Warm up last_score with a fast call.
        let fast = bridge.score(&idle_vector());
        assert!(!fast.stale);
        assert!((fast.score - 0.8).abs() < f64::EPSILON);

        let mut slow_vector = idle_vector();
        slow_vector.network_anomaly = 1.0;
        let reading = bridge.score(&slow_vector);
        assert!(reading.stale);
        assert!((reading.score - 0.8).abs() < f64::EPSILON, "last known score is reused");
        assert_eq!(bridge.timeouts(), 1);
    }

    #[test]
    fn late_replies_are_absorbed_not_applied() {
        let mut bridge = ScorerBridge::spawn(
            Box::new(|fv: &FeatureVector| {
                if fv.network_anomaly > 0.5 {
                    thread::sleep(Duration::from_millis(150));
                    0.99
                } else {
                    0.2
                }
            }),
            Duration::from_millis(40),
        );

        let mut slow_vector = idle_vector();
        slow_vector.network_anomaly = 1.0;
        let timed_out = bridge.score(&slow_vector);
        assert!(timed_out.stale);

        // Wait for the late 0.99 reply to be sitting in the channel.
        thread::sleep(Duration::from_millis(200));

        // The next fast call must return its own answer, not the stale 0.99.
        let fresh = bridge.score(&idle_vector());
        assert!(!fresh.stale);
        assert!((fresh.score - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn out_of_range_scores_are_clamped() {
        let mut bridge = ScorerBridge::spawn(
            Box::new(|_: &FeatureVector| 7.5),
            Duration::from_millis(250),
        );
        assert!((bridge.score(&idle_vector()).score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn heuristic_scorer_matches_rate_steps() {
        let mut scorer = HeuristicScorer;
        let mut fv = idle_vector();

        fv.files_modified_per_sec = 5.0;
        assert!(scorer.score(&fv) < 0.4);

        fv.files_modified_per_sec = 60.0;
        let guarded = scorer.score(&fv);
        assert!(guarded > 0.4 && guarded <= 0.7 + 0.15);

        fv.files_modified_per_sec = 250.0;
        fv.suspicious_extension = 1.0;
        fv.rapid_change = 1.0;
        fv.mean_entropy = 7.8;
        assert!(scorer.score(&fv) > 0.7);
    }

    #[test]
    fn heuristic_scorer_stays_in_unit_interval() {
        let mut scorer = HeuristicScorer;
        let mut fv = idle_vector();
        fv.files_modified_per_sec = 1e9;
        fv.suspicious_extension = 1.0;
        fv.rapid_change = 1.0;
        fv.unauthorized_access = 1.0;
        fv.network_anomaly = 1.0;
        fv.mean_entropy = 8.0;
        let score = scorer.score(&fv);
        assert!((0.0..=1.0).contains(&score));
    }
}
