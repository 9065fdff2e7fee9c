//! EWMA activity-rate estimator: files/sec and bytes/sec over the watch window.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use std::time::Instant;

/// Trend classification for write-activity dynamics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Steady,
    Accelerating,
    Decelerating,
}

/// Output of the activity estimator for one sampling tick.
#[derive(Debug, Clone)]
pub struct ActivityRates {
    pub files_per_sec: f64,
    pub bytes_per_sec: f64,
    pub files_accel: f64,
    pub confidence: f64,
    pub trend: Trend,
    pub alpha_used: f64,
    pub fallback_active: bool,
}

#[derive(Debug, Clone, Copy)]
struct SampleState {
    at: Instant,
    inst_files_rate: f64,
}

/// Online EWMA estimator with adaptive alpha and warm-up fallback.
///
/// Encryption sweeps are bursty: a fixed alpha either lags the onset or
/// flaps on ordinary save storms. Alpha widens with observed burstiness so
/// the estimate tracks a sweep within a tick or two while staying calm on
/// background noise.
#[derive(Debug, Clone)]
pub struct ActivityRateEstimator {
    base_alpha: f64,
    min_alpha: f64,
    max_alpha: f64,
    ewma_files: f64,
    ewma_bytes: f64,
    ewma_accel: f64,
    residual_ewma: f64,
    min_samples: u64,
    samples: u64,
    last: Option<SampleState>,
}

impl ActivityRateEstimator {
    #[must_use]
    pub fn new(base_alpha: f64, min_alpha: f64, max_alpha: f64, min_samples: u64) -> Self {
        Self {
            base_alpha,
            min_alpha,
            max_alpha,
            ewma_files: 0.0,
            ewma_bytes: 0.0,
            ewma_accel: 0.0,
            residual_ewma: 0.0,
            min_samples,
            samples: 0,
            last: None,
        }
    }

    /// Update estimator state with the counts drained in one window.
    pub fn update(&mut self, files_in_window: usize, bytes_in_window: u64, observed_at: Instant) -> ActivityRates {
        let Some(previous) = self.last else {
            self.last = Some(SampleState {
                at: observed_at,
                inst_files_rate: 0.0,
            });
            return self.fallback_estimate();
        };

        let dt = observed_at.duration_since(previous.at).as_secs_f64();
        if dt <= f64::EPSILON {
            return self.fallback_estimate();
        }

        let inst_files = files_in_window as f64 / dt;
        let inst_bytes = bytes_in_window as f64 / dt;
        let burstiness = (inst_files - self.ewma_files).abs() / (self.ewma_files.abs() + 1.0);
        let alpha = (self.base_alpha + 0.20 * burstiness).clamp(self.min_alpha, self.max_alpha);

        self.ewma_files = ewma(alpha, self.ewma_files, inst_files);
        self.ewma_bytes = ewma(alpha, self.ewma_bytes, inst_bytes);
        let inst_accel = (inst_files - previous.inst_files_rate) / dt;
        self.ewma_accel = ewma(alpha, self.ewma_accel, inst_accel);
        self.residual_ewma = ewma(alpha, self.residual_ewma, (inst_files - self.ewma_files).abs());

        self.samples = self.samples.saturating_add(1);
        self.last = Some(SampleState {
            at: observed_at,
            inst_files_rate: inst_files,
        });

        let confidence = self.compute_confidence();
        let fallback_active = self.samples < self.min_samples || confidence < 0.2;

        ActivityRates {
            files_per_sec: self.ewma_files,
            bytes_per_sec: self.ewma_bytes,
            files_accel: self.ewma_accel,
            confidence,
            trend: classify_trend(self.ewma_accel),
            alpha_used: alpha,
            fallback_active,
        }
    }

    #[must_use]
    pub fn sample_count(&self) -> u64 {
        self.samples
    }

    fn compute_confidence(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        let sample_term = (self.samples as f64 / self.min_samples.max(1) as f64).min(1.0);
        let residual_term = 1.0 / (1.0 + self.residual_ewma / (self.ewma_files.abs() + 1.0));
        (0.7 * sample_term + 0.3 * residual_term).clamp(0.0, 1.0)
    }

    fn fallback_estimate(&self) -> ActivityRates {
        ActivityRates {
            files_per_sec: self.ewma_files,
            bytes_per_sec: self.ewma_bytes,
            files_accel: self.ewma_accel,
            confidence: self.compute_confidence(),
            trend: classify_trend(self.ewma_accel),
            alpha_used: self.base_alpha,
            fallback_active: true,
        }
    }
}

#[inline]
fn ewma(alpha: f64, prev: f64, current: f64) -> f64 {
    alpha * current + (1.0 - alpha) * prev
}

fn classify_trend(accel: f64) -> Trend {
    if accel > 4.0 {
        Trend::Accelerating
    } else if accel < -4.0 {
        Trend::Decelerating
    } else {
        Trend::Steady
    }
}
