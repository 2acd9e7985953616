//! Bounded latency history and percentile/mean math.
//!
//! Kept as its own crate (mirroring the layering the rest of the workspace
//! uses for narrow, dependency-light concerns) so both the health checker
//! and the load balancer can track timing series without depending on the
//! rest of `gateway-core`.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// How many samples a single [`LatencyHistory`] retains before dropping the
/// oldest one FIFO.
pub const MAX_SAMPLES: usize = 200;

/// A bounded, append-only-with-eviction series of latency samples in
/// milliseconds, plus the percentile/mean math over them.
///
/// Thread-safe: all mutation goes through an internal mutex so a history can
/// be shared behind an `Arc` across probe tasks.
#[derive(Debug, Default)]
pub struct LatencyHistory {
    samples: Mutex<VecDeque<u64>>,
}

impl LatencyHistory {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(MAX_SAMPLES)),
        }
    }

    /// Record one latency sample, evicting the oldest if at capacity.
    pub fn record(&self, latency_ms: u64) {
        let mut samples = self.samples.lock();
        if samples.len() == MAX_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(latency_ms);
    }

    /// Number of samples currently retained.
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    /// Snapshot of the most recent `n` samples, oldest first.
    pub fn recent(&self, n: usize) -> Vec<u64> {
        let samples = self.samples.lock();
        let start = samples.len().saturating_sub(n);
        samples.iter().skip(start).copied().collect()
    }

    /// Arithmetic mean over all retained samples. `0` if empty.
    pub fn mean(&self) -> f64 {
        let samples = self.samples.lock();
        mean(samples.iter().copied())
    }

    /// p95 over all retained samples.
    pub fn p95(&self) -> u64 {
        self.percentile(0.95)
    }

    /// p99 over all retained samples.
    pub fn p99(&self) -> u64 {
        self.percentile(0.99)
    }

    pub fn percentile(&self, p: f64) -> u64 {
        let mut sorted: Vec<u64> = self.samples.lock().iter().copied().collect();
        sorted.sort_unstable();
        percentile_of_sorted(&sorted, p)
    }
}

/// Percentile over an already-sorted slice, using the nearest-rank rule:
/// index = max(0, floor(p * n) - 1). Empty input returns 0.
pub fn percentile_of_sorted(sorted: &[u64], p: f64) -> u64 {
    let n = sorted.len();
    if n == 0 {
        return 0;
    }
    let idx = ((p * n as f64).floor() as isize - 1).max(0) as usize;
    sorted[idx.min(n - 1)]
}

/// Arithmetic mean of an iterator of samples. `0.0` if empty.
pub fn mean(samples: impl Iterator<Item = u64>) -> f64 {
    let mut count = 0u64;
    let mut total = 0u128;
    for s in samples {
        count += 1;
        total += s as u128;
    }
    if count == 0 {
        0.0
    } else {
        total as f64 / count as f64
    }
}

/// Incrementally-maintained running mean: `avg' = (avg*(n-1) + new) / n`.
///
/// Used for `LoadBalancerMetrics::avgResponseTime`, which is defined by
/// spec as a simple running mean rather than an exponentially-weighted one.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunningMean {
    pub count: u64,
    pub value: f64,
}

impl RunningMean {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one new sample, returning the updated mean.
    pub fn update(&mut self, sample: f64) -> f64 {
        self.count += 1;
        self.value = (self.value * (self.count - 1) as f64 + sample) / self.count as f64;
        self.value
    }
}

/// Aggregate counts + percentiles over every monitored service at once,
/// used for `getHealthAggregates().global`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalLatencyStats {
    pub mean_ms: f64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

/// Compute global stats over every per-service history's recent samples in
/// one pass. `histories` need not be sorted; this sorts internally.
pub fn global_stats<'a>(histories: impl IntoIterator<Item = &'a LatencyHistory>) -> GlobalLatencyStats {
    let mut all: Vec<u64> = Vec::new();
    for h in histories {
        all.extend(h.recent(MAX_SAMPLES));
    }
    all.sort_unstable();
    GlobalLatencyStats {
        mean_ms: mean(all.iter().copied()),
        p95_ms: percentile_of_sorted(&all, 0.95),
        p99_ms: percentile_of_sorted(&all, 0.99),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_percentile_is_zero() {
        let h = LatencyHistory::new();
        assert_eq!(h.p95(), 0);
        assert_eq!(h.p99(), 0);
        assert_eq!(h.mean(), 0.0);
    }

    #[test]
    fn percentile_matches_nearest_rank_rule() {
        let sorted: Vec<u64> = (1..=100).collect();
        // p95 over 100 samples -> index floor(0.95*100)-1 = 94 -> value 95
        assert_eq!(percentile_of_sorted(&sorted, 0.95), 95);
        assert_eq!(percentile_of_sorted(&sorted, 0.99), 99);
    }

    #[test]
    fn percentile_is_idempotent() {
        let h = LatencyHistory::new();
        for i in 1..=50u64 {
            h.record(i);
        }
        let first = h.p95();
        let second = h.p95();
        assert_eq!(first, second);
    }

    #[test]
    fn history_evicts_fifo_past_capacity() {
        let h = LatencyHistory::new();
        for i in 0..(MAX_SAMPLES as u64 + 10) {
            h.record(i);
        }
        assert_eq!(h.len(), MAX_SAMPLES);
        // oldest 10 (0..10) should have been evicted
        let recent = h.recent(MAX_SAMPLES);
        assert_eq!(recent[0], 10);
    }

    #[test]
    fn running_mean_matches_simple_average() {
        let mut rm = RunningMean::new();
        let samples = [10.0, 20.0, 30.0];
        for s in samples {
            rm.update(s);
        }
        assert!((rm.value - 20.0).abs() < 1e-9);
    }
}
