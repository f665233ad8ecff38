//! Process-wide counters for a copy run.
//!
//! `WorkerMetrics` is the registry external supervisors poll, either in
//! process through [`WorkerMetrics::wait_for`] or over the stats endpoint.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        WorkerMetrics                          │
//! │  state ─────────────── initializing .. done / error          │
//! │  attempted_resolves ── cache misses that asked for a master   │
//! │  actual_resolves ───── topology queries that returned         │
//! │  retry_count ───────── category -> retries                    │
//! │  per shard ─────────── resolves, retries, rows copied         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Counters never decrease within a run. They are reset only by
//! [`WorkerMetrics::reset_run`], which a run calls before doing anything else.

mod counters;
mod latency;

pub use counters::{Counter, LabeledCounter};
pub use latency::{LatencyHistogram, LatencySummary, WRITE_LATENCY_BUCKETS_MS};

use crate::error::{Error, ErrorCategory, Result};
use crate::types::ShardTarget;
use crate::worker::WorkerState;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use uuid::Uuid;

/// How often `wait_for` re-checks when nothing notifies it.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug)]
struct RunInfo {
    run_id: Uuid,
    started_at_ms: u64,
    last_error: Option<(ErrorCategory, String)>,
}

/// Registry of counters and state for one worker process.
#[derive(Debug)]
pub struct WorkerMetrics {
    // Held for read while snapshotting, for write while resetting.
    run: RwLock<RunInfo>,
    state: AtomicU8,

    /// Resolves that missed the cache, including forced re-resolves.
    pub attempted_resolves: Counter,
    /// Topology queries that returned, successful or not.
    pub actual_resolves: Counter,
    /// Retries by error category.
    pub retry_count: LabeledCounter<1>,

    pub shard_attempted_resolves: LabeledCounter<1>,
    pub shard_actual_resolves: LabeledCounter<1>,
    pub shard_retries: LabeledCounter<2>,
    pub shard_rows_copied: LabeledCounter<1>,

    /// Batches acknowledged by destination masters.
    pub batches_written: Counter,
    /// Rows acknowledged by destination masters.
    pub rows_copied: Counter,
    /// Time from first attempt to acknowledgement per batch.
    pub write_latency: LatencyHistogram,

    changed: Notify,
}

impl WorkerMetrics {
    /// Create a registry for a fresh run.
    pub fn new() -> Self {
        Self {
            run: RwLock::new(RunInfo {
                run_id: Uuid::new_v4(),
                started_at_ms: now_ms(),
                last_error: None,
            }),
            state: AtomicU8::new(WorkerState::Initializing.to_u8()),
            attempted_resolves: Counter::new("attempted_resolves"),
            actual_resolves: Counter::new("actual_resolves"),
            retry_count: LabeledCounter::new("retry_count", ["category"]),
            shard_attempted_resolves: LabeledCounter::new("shard_attempted_resolves", ["shard"]),
            shard_actual_resolves: LabeledCounter::new("shard_actual_resolves", ["shard"]),
            shard_retries: LabeledCounter::new("shard_retries", ["shard", "category"]),
            shard_rows_copied: LabeledCounter::new("shard_rows_copied", ["shard"]),
            batches_written: Counter::new("batches_written"),
            rows_copied: Counter::new("rows_copied"),
            write_latency: LatencyHistogram::new("write_latency", WRITE_LATENCY_BUCKETS_MS),
            changed: Notify::new(),
        }
    }

    /// Start a new run: zero every counter, go back to `initializing`.
    ///
    /// Returns the new run id.
    pub fn reset_run(&self) -> Uuid {
        let mut run = self.run.write();
        run.run_id = Uuid::new_v4();
        run.started_at_ms = now_ms();
        run.last_error = None;

        self.state
            .store(WorkerState::Initializing.to_u8(), Ordering::Release);
        self.attempted_resolves.reset();
        self.actual_resolves.reset();
        self.retry_count.reset();
        self.shard_attempted_resolves.reset();
        self.shard_actual_resolves.reset();
        self.shard_retries.reset();
        self.shard_rows_copied.reset();
        self.batches_written.reset();
        self.rows_copied.reset();
        self.write_latency.reset();

        let run_id = run.run_id;
        drop(run);
        self.changed.notify_waiters();
        tracing::info!(run_id = %run_id, "Worker metrics reset for new run");
        run_id
    }

    /// Identifier of the current run.
    pub fn run_id(&self) -> Uuid {
        self.run.read().run_id
    }

    /// Current worker state.
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn set_state(&self, next: WorkerState) -> Result<()> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = WorkerState::from_u8(current);
            from.check_transition(next)?;
            match self.state.compare_exchange(
                current,
                next.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if from != next {
                        tracing::info!(from = %from, to = %next, "Worker state changed");
                    }
                    self.changed.notify_waiters();
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Record a fatal error and move to `error`.
    ///
    /// Returns false if the run was already terminal.
    pub fn record_fatal(&self, error: &Error) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        {
            let mut run = self.run.write();
            if run.last_error.is_none() {
                run.last_error = Some((error.triggering_category(), error.to_string()));
            }
        }
        match self.set_state(WorkerState::Error) {
            Ok(()) => {
                tracing::error!(category = %error.triggering_category(), error = %error, "Worker run failed");
                true
            }
            Err(_) => false,
        }
    }

    /// A resolve missed the cache and is about to ask for the master.
    pub fn record_resolve_attempt(&self, target: &ShardTarget) {
        let label = target.label();
        self.attempted_resolves.inc();
        self.shard_attempted_resolves.inc([label.as_str()]);
        self.changed.notify_waiters();
    }

    /// A topology query returned.
    pub fn record_resolve_returned(&self, target: &ShardTarget) {
        let label = target.label();
        self.actual_resolves.inc();
        self.shard_actual_resolves.inc([label.as_str()]);
        self.changed.notify_waiters();
    }

    /// A write is being retried because of `category`.
    pub fn record_retry(&self, target: &ShardTarget, category: ErrorCategory) {
        let label = target.label();
        self.retry_count.inc([category.as_str()]);
        self.shard_retries.inc([label.as_str(), category.as_str()]);
        self.changed.notify_waiters();
    }

    /// A batch was acknowledged.
    pub fn record_batch_written(&self, target: &ShardTarget, rows: usize, latency: Duration) {
        self.batches_written.inc();
        self.rows_copied.inc_by(rows as u64);
        let label = target.label();
        self.shard_rows_copied.inc_by([label.as_str()], rows as u64);
        self.write_latency.observe(latency);
        self.changed.notify_waiters();
    }

    /// Consistent view of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        let run = self.run.read();

        // A query is always counted as attempted before it is counted as
        // returned, so reading returns first keeps attempted >= actual.
        let actual_resolves = self.actual_resolves.get();
        let shard_actual = self.shard_actual_resolves.get_all();
        let attempted_resolves = self.attempted_resolves.get();
        let shard_attempted = self.shard_attempted_resolves.get_all();

        let mut shards: BTreeMap<String, ShardStats> = BTreeMap::new();
        for ([shard], n) in shard_attempted {
            shards.entry(shard).or_default().attempted_resolves = n;
        }
        for ([shard], n) in shard_actual {
            shards.entry(shard).or_default().actual_resolves = n;
        }
        for ([shard, category], n) in self.shard_retries.get_all() {
            shards.entry(shard).or_default().retries.insert(category, n);
        }
        for ([shard], n) in self.shard_rows_copied.get_all() {
            shards.entry(shard).or_default().rows_copied = n;
        }

        StatsSnapshot {
            run_id: run.run_id,
            started_at_ms: run.started_at_ms,
            state: self.state(),
            attempted_resolves,
            actual_resolves,
            retry_count: self.retry_count.to_map(),
            batches_written: self.batches_written.get(),
            rows_copied: self.rows_copied.get(),
            write_latency: self.write_latency.summary(),
            shards,
            last_error_category: run.last_error.as_ref().map(|(c, _)| *c),
            last_error: run.last_error.as_ref().map(|(_, m)| m.clone()),
        }
    }

    /// Wait until `predicate` holds for a snapshot, or fail after `timeout`.
    pub async fn wait_for<P>(&self, predicate: P, timeout: Duration) -> Result<StatsSnapshot>
    where
        P: Fn(&StatsSnapshot) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            // Register before checking so a change between the two is not lost.
            let notified = self.changed.notified();
            let snapshot = self.snapshot();
            if predicate(&snapshot) {
                return Ok(snapshot);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(format!(
                    "stats predicate not satisfied after {:?} (state {})",
                    timeout, snapshot.state
                )));
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining.min(WAIT_POLL_INTERVAL)) => {}
            }
        }
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Per-shard counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardStats {
    pub attempted_resolves: u64,
    pub actual_resolves: u64,
    pub retries: BTreeMap<String, u64>,
    pub rows_copied: u64,
}

/// Snapshot of the registry, as served by the stats endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub run_id: Uuid,
    pub started_at_ms: u64,
    pub state: WorkerState,
    pub attempted_resolves: u64,
    pub actual_resolves: u64,
    /// Empty means no retries happened.
    pub retry_count: BTreeMap<String, u64>,
    pub batches_written: u64,
    pub rows_copied: u64,
    pub write_latency: LatencySummary,
    pub shards: BTreeMap<String, ShardStats>,
    pub last_error_category: Option<ErrorCategory>,
    pub last_error: Option<String>,
}

impl StatsSnapshot {
    /// Retries recorded for a category.
    pub fn retries(&self, category: ErrorCategory) -> u64 {
        self.retry_count.get(category.as_str()).copied().unwrap_or(0)
    }

    /// Counters for one shard, if it saw any activity.
    pub fn shard(&self, target: &ShardTarget) -> Option<&ShardStats> {
        self.shards.get(&target.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn target() -> ShardTarget {
        ShardTarget::parse("test_keyspace", "-80").unwrap()
    }

    #[test]
    fn test_snapshot_collects_counters() {
        let metrics = WorkerMetrics::new();
        let t = target();

        metrics.record_resolve_attempt(&t);
        metrics.record_resolve_returned(&t);
        metrics.record_retry(&t, ErrorCategory::StaleMaster);
        metrics.record_batch_written(&t, 10, Duration::from_millis(3));

        let snap = metrics.snapshot();
        assert_eq!(snap.state, WorkerState::Initializing);
        assert_eq!(snap.attempted_resolves, 1);
        assert_eq!(snap.actual_resolves, 1);
        assert_eq!(snap.retries(ErrorCategory::StaleMaster), 1);
        assert_eq!(snap.rows_copied, 10);

        let shard = snap.shard(&t).unwrap();
        assert_eq!(shard.rows_copied, 10);
        assert_eq!(shard.retries.get("stale_master"), Some(&1));
    }

    #[test]
    fn test_snapshot_never_shows_more_returns_than_attempts() {
        let metrics = Arc::new(WorkerMetrics::new());
        let t = target();

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                let t = t.clone();
                std::thread::spawn(move || {
                    for _ in 0..2000 {
                        metrics.record_resolve_attempt(&t);
                        metrics.record_resolve_returned(&t);
                    }
                })
            })
            .collect();

        while writers.iter().any(|w| !w.is_finished()) {
            let snap = metrics.snapshot();
            assert!(snap.attempted_resolves >= snap.actual_resolves, "{snap:?}");
            if let Some(shard) = snap.shard(&t) {
                assert!(shard.attempted_resolves >= shard.actual_resolves, "{shard:?}");
            }
        }
        for w in writers {
            w.join().unwrap();
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.attempted_resolves, 8000);
        assert_eq!(snap.actual_resolves, 8000);
    }

    #[test]
    fn test_reset_run_clears_counters_and_state() {
        let metrics = WorkerMetrics::new();
        let first = metrics.run_id();
        metrics.record_retry(&target(), ErrorCategory::TopologyUnavailable);
        metrics.set_state(WorkerState::FindingTargets).unwrap();

        let second = metrics.reset_run();
        assert_ne!(first, second);

        let snap = metrics.snapshot();
        assert!(snap.retry_count.is_empty());
        assert!(snap.shards.is_empty());
        assert_eq!(snap.state, WorkerState::Initializing);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let metrics = WorkerMetrics::new();
        assert!(metrics.set_state(WorkerState::Done).is_err());
        assert_eq!(metrics.state(), WorkerState::Initializing);
    }

    #[test]
    fn test_record_fatal_keeps_first_error() {
        let metrics = WorkerMetrics::new();
        assert!(metrics.record_fatal(&Error::Cancelled));
        assert!(!metrics.record_fatal(&Error::Internal("later".to_string())));

        let snap = metrics.snapshot();
        assert_eq!(snap.state, WorkerState::Error);
        assert_eq!(snap.last_error_category, Some(ErrorCategory::Cancelled));
    }

    #[test]
    fn test_snapshot_json_uses_labels() {
        let metrics = WorkerMetrics::new();
        metrics.set_state(WorkerState::FindingTargets).unwrap();
        metrics.set_state(WorkerState::Copying).unwrap();
        metrics.set_state(WorkerState::CleaningUp).unwrap();

        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["state"], "cleaning_up");
        assert_eq!(json["retry_count"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_wait_for_returns_when_predicate_holds() {
        let metrics = Arc::new(WorkerMetrics::new());
        let m = Arc::clone(&metrics);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            m.record_resolve_attempt(&target());
            m.record_resolve_returned(&target());
        });

        let snap = metrics
            .wait_for(|s| s.actual_resolves >= 1, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(snap.attempted_resolves >= snap.actual_resolves);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let metrics = WorkerMetrics::new();
        let err = metrics
            .wait_for(|s| s.state == WorkerState::Done, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
