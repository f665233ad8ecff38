//! Bucketed latency histogram for destination writes.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Bucket upper bounds in milliseconds.
pub const WRITE_LATENCY_BUCKETS_MS: &[u64] = &[1, 5, 10, 25, 50, 100, 250, 500, 1_000, 5_000];

/// Histogram of durations, counted in microseconds.
#[derive(Debug)]
pub struct LatencyHistogram {
    name: &'static str,
    bounds_ms: &'static [u64],
    // One slot per bound plus an overflow slot.
    buckets: Vec<AtomicU64>,
    sum_us: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    /// Create a histogram over `bounds_ms`, which must be ascending.
    pub fn new(name: &'static str, bounds_ms: &'static [u64]) -> Self {
        Self {
            name,
            bounds_ms,
            buckets: (0..=bounds_ms.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_us: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Record one duration.
    pub fn observe(&self, duration: Duration) {
        let us = duration.as_micros().min(u64::MAX as u128) as u64;
        let slot = self
            .bounds_ms
            .iter()
            .position(|&bound| us <= bound * 1_000)
            .unwrap_or(self.bounds_ms.len());
        self.buckets[slot].fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> LatencySummary {
        let count = self.count();
        let sum_us = self.sum_us.load(Ordering::Relaxed);
        let counts: Vec<u64> = self
            .buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();
        LatencySummary {
            count,
            mean_ms: if count == 0 {
                0.0
            } else {
                sum_us as f64 / count as f64 / 1_000.0
            },
            p99_ms: self.bound_for_rank(&counts, count, 0.99),
        }
    }

    // Upper bound of the bucket holding the given quantile, overflow reports the last bound.
    fn bound_for_rank(&self, counts: &[u64], total: u64, quantile: f64) -> u64 {
        if total == 0 {
            return 0;
        }
        let rank = (total as f64 * quantile).ceil() as u64;
        let mut seen = 0;
        for (i, c) in counts.iter().enumerate() {
            seen += c;
            if seen >= rank {
                return self
                    .bounds_ms
                    .get(i)
                    .or(self.bounds_ms.last())
                    .copied()
                    .unwrap_or(0);
            }
        }
        self.bounds_ms.last().copied().unwrap_or(0)
    }

    pub(crate) fn reset(&self) {
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
        self.sum_us.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time view of a latency histogram.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: u64,
    pub mean_ms: f64,
    pub p99_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_and_summary() {
        let hist = LatencyHistogram::new("write_latency", WRITE_LATENCY_BUCKETS_MS);
        assert_eq!(hist.summary(), LatencySummary::default());

        for _ in 0..99 {
            hist.observe(Duration::from_millis(2));
        }
        hist.observe(Duration::from_millis(400));

        let summary = hist.summary();
        assert_eq!(summary.count, 100);
        assert_eq!(summary.p99_ms, 5);
        assert!(summary.mean_ms > 2.0 && summary.mean_ms < 10.0);

        hist.reset();
        assert_eq!(hist.count(), 0);
    }

    #[test]
    fn test_overflow_bucket() {
        let hist = LatencyHistogram::new("write_latency", &[1, 10]);
        hist.observe(Duration::from_secs(3));
        assert_eq!(hist.summary().p99_ms, 10);
    }
}
