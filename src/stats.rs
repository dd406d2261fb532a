//! Timing and latency statistics shared by every probe.
//!
//! Elapsed time is always taken from the monotonic clock. Sample statistics
//! are pure functions over a burst of optional round-trip times, where `None`
//! marks a probe that never got a reply.

use std::time::{Duration, Instant};

use serde::Serialize;
use tdigests::TDigest;

/// Monotonic stopwatch started at probe entry.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    started: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn started_at(&self) -> Instant {
        self.started
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn elapsed_ms(&self) -> f64 {
        duration_ms(self.elapsed())
    }
}

/// Convert a duration to fractional milliseconds.
pub fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Aggregate statistics over one burst of latency samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub sent: u32,
    pub received: u32,
    pub loss_percent: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    /// Population standard deviation of successful samples.
    pub stddev_ms: f64,
    /// Mean absolute difference between consecutive successful samples.
    pub jitter_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
}

impl LatencyStats {
    pub fn lost(&self) -> u32 {
        self.sent - self.received
    }
}

/// Compute latency statistics for a burst of `expected_count` probes.
///
/// Samples past `expected_count` are ignored and missing samples count as
/// lost. An `expected_count` of zero yields all-zero stats.
pub fn compute_stats(samples: &[Option<Duration>], expected_count: usize) -> LatencyStats {
    if expected_count == 0 {
        return LatencyStats::default();
    }

    let rtts: Vec<f64> = samples
        .iter()
        .take(expected_count)
        .flatten()
        .map(|d| duration_ms(*d))
        .collect();

    let sent = expected_count as u32;
    let received = rtts.len() as u32;
    let loss_percent = f64::from(sent - received) / f64::from(sent) * 100.0;

    if rtts.is_empty() {
        return LatencyStats {
            sent,
            received,
            loss_percent,
            ..LatencyStats::default()
        };
    }

    let n = rtts.len() as f64;
    let mut min = f64::MAX;
    let mut max = f64::MIN;
    let mut sum = 0.0;
    for &rtt in &rtts {
        min = min.min(rtt);
        max = max.max(rtt);
        sum += rtt;
    }
    let avg = sum / n;

    let variance = rtts.iter().map(|rtt| (rtt - avg).powi(2)).sum::<f64>() / n;

    let (median, p95) = quantiles(&rtts);

    LatencyStats {
        sent,
        received,
        loss_percent,
        min_ms: min,
        max_ms: max,
        avg_ms: avg,
        stddev_ms: variance.sqrt(),
        jitter_ms: jitter(&rtts),
        median_ms: median,
        p95_ms: p95,
    }
}

/// Mean absolute difference between consecutive values; zero for fewer than two.
pub fn jitter(rtts: &[f64]) -> f64 {
    if rtts.len() < 2 {
        return 0.0;
    }
    let total: f64 = rtts.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
    total / (rtts.len() - 1) as f64
}

fn quantiles(rtts: &[f64]) -> (f64, f64) {
    if rtts.len() == 1 {
        return (rtts[0], rtts[0]);
    }
    let mut td = TDigest::from_values(rtts.to_vec());
    td.compress(100);
    (td.estimate_quantile(0.5), td.estimate_quantile(0.95))
}
