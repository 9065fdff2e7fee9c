//! CPU utilization sampling via `/proc/stat` deltas.

#![allow(clippy::cast_precision_loss)]

/// Aggregate CPU counters from the `cpu ` summary line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

/// System CPU utilization sampler.
///
/// Utilization is the busy fraction between two consecutive samples, so the
/// first call after construction reports 0.0. On non-Linux targets (or when
/// `/proc/stat` is unreadable) every sample reports 0.0 — the feature
/// degrades, the vector shape does not change.
#[derive(Debug, Default)]
pub struct CpuSampler {
    last: Option<CpuTimes>,
}

impl CpuSampler {
    /// A sampler with no baseline yet.
    #[must_use]
    pub fn new() -> Self {
        Self { last: None }
    }

    /// Sample utilization in percent (0.0..=100.0) since the previous call.
    pub fn sample(&mut self) -> f64 {
        let Some(current) = read_cpu_times() else {
            return 0.0;
        };

        let utilization = match self.last {
            Some(previous) if current.total > previous.total => {
                let busy_delta = current.busy.saturating_sub(previous.busy) as f64;
                let total_delta = (current.total - previous.total) as f64;
                (busy_delta / total_delta * 100.0).clamp(0.0, 100.0)
            }
            _ => 0.0,
        };

        self.last = Some(current);
        utilization
    }
}

#[cfg(target_os = "linux")]
fn read_cpu_times() -> Option<CpuTimes> {
    let raw = std::fs::read_to_string("/proc/stat").ok()?;
    parse_cpu_line(&raw)
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_times() -> Option<CpuTimes> {
    None
}

/// Parse the aggregate `cpu ` line: user nice system idle iowait irq softirq steal.
fn parse_cpu_line(raw: &str) -> Option<CpuTimes> {
    let line = raw.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }

    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total: u64 = fields.iter().sum();
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}
