//! Timing samples and the summaries derived from them.
//!
//! All durations are kept as fractional milliseconds. Empty inputs summarize
//! to zero rather than being undefined, so a scenario that never completed a
//! round still has a (degenerate) row in every report.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One measured change-to-completion interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CycleSample {
    /// 0-based round number within the run.
    pub ordinal: u32,
    pub duration_ms: f64,
}

impl CycleSample {
    pub fn new(ordinal: u32, duration: Duration) -> Self {
        Self {
            ordinal,
            duration_ms: millis(duration),
        }
    }
}

/// How far a scenario run got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every round completed.
    Completed,
    /// The initial check completed, then a round failed. Earlier samples are kept.
    Partial,
    /// Nothing usable was measured; every field is zero.
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Partial => write!(f, "partial"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Summary of one scenario run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub status: RunStatus,
    /// Spawn to last round, excluding teardown.
    pub total_ms: f64,
    /// Spawn to first completed check.
    pub initial_ms: f64,
    pub samples: Vec<CycleSample>,
    pub average_ms: f64,
    pub median_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    /// Error count reported by the tool's last completed check, when known.
    pub diagnostics: Option<u64>,
}

impl RunStatistics {
    pub fn from_samples(
        status: RunStatus,
        total: Duration,
        initial: Duration,
        samples: Vec<CycleSample>,
        diagnostics: Option<u64>,
    ) -> Self {
        let durations: Vec<f64> = samples.iter().map(|s| s.duration_ms).collect();
        Self {
            status,
            total_ms: millis(total),
            initial_ms: millis(initial),
            average_ms: mean(&durations),
            median_ms: median(&durations),
            min_ms: min(&durations),
            max_ms: max(&durations),
            samples,
            diagnostics,
        }
    }

    /// The all-zero record for a run that measured nothing.
    pub fn failed() -> Self {
        Self {
            status: RunStatus::Failed,
            total_ms: 0.0,
            initial_ms: 0.0,
            samples: Vec::new(),
            average_ms: 0.0,
            median_ms: 0.0,
            min_ms: 0.0,
            max_ms: 0.0,
            diagnostics: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == RunStatus::Failed
    }
}

/// Aggregate over every run recorded for one label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub runs: usize,
    pub failed: usize,
    pub samples: usize,
    pub mean_total_ms: f64,
    pub mean_initial_ms: f64,
    pub mean_average_ms: f64,
    /// Median of the per-run medians.
    pub median_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub diagnostics: Option<u64>,
}

impl Summary {
    /// Aggregate `runs`, using only the ones that measured something.
    pub fn from_runs(runs: &[RunStatistics]) -> Self {
        let ok: Vec<&RunStatistics> = runs.iter().filter(|r| !r.is_failed()).collect();
        let failed = runs.len() - ok.len();
        if ok.is_empty() {
            return Self {
                runs: runs.len(),
                failed,
                ..Self::default()
            };
        }

        // Per-sample fields only mean something for runs that have samples.
        let sampled: Vec<&RunStatistics> =
            ok.iter().copied().filter(|r| !r.samples.is_empty()).collect();
        Self {
            runs: runs.len(),
            failed,
            samples: sampled.iter().map(|r| r.samples.len()).sum(),
            mean_total_ms: mean(&field(&ok, |r| r.total_ms)),
            mean_initial_ms: mean(&field(&ok, |r| r.initial_ms)),
            mean_average_ms: mean(&field(&sampled, |r| r.average_ms)),
            median_ms: median(&field(&sampled, |r| r.median_ms)),
            min_ms: min(&field(&sampled, |r| r.min_ms)),
            max_ms: max(&field(&sampled, |r| r.max_ms)),
            diagnostics: ok.iter().rev().find_map(|r| r.diagnostics),
        }
    }
}

fn field(runs: &[&RunStatistics], f: impl Fn(&RunStatistics) -> f64) -> Vec<f64> {
    runs.iter().map(|&r| f(r)).collect()
}

pub fn millis(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

/// Arithmetic mean; 0 for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Median; 0 for an empty slice, mean of the two middle values for even lengths.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

pub fn min(values: &[f64]) -> f64 {
    values.iter().copied().reduce(f64::min).unwrap_or(0.0)
}

pub fn max(values: &[f64]) -> f64 {
    values.iter().copied().reduce(f64::max).unwrap_or(0.0)
}
