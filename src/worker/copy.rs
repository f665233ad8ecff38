//! Split clone: copy one source shard into several destination shards.
//!
//! The reader runs in the worker's task and splits every source batch by key
//! range. Each destination has one writer task draining a bounded queue, so
//! batches reach a destination in the order the source produced them.
//!
//! ```text
//!                         ┌──────────────┐    ┌────────────────┐
//!                    ┌───►│ queue -80    ├───►│ writer -80     │──► master -80
//! ┌────────────┐     │    └──────────────┘    └────────────────┘
//! │ RowSource  ├─split┤
//! └────────────┘     │    ┌──────────────┐    ┌────────────────┐
//!                    └───►│ queue 80-    ├───►│ writer 80-     │──► master 80-
//!                         └──────────────┘    └────────────────┘
//! ```
//!
//! The first writer to fail cancels the run token, which stops the reader and
//! every sibling writer.

use super::{Collaborators, RowSource, ShardLifecycle, WorkerState};
use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::metrics::WorkerMetrics;
use crate::topology::TopologyResolver;
use crate::types::{RowBatch, ShardTarget, TabletAlias};
use crate::writer::{Backoff, RetryingWriter};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Outcome of a successful copy run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySummary {
    pub run_id: Uuid,
    /// Source batches read.
    pub batches_read: u64,
    /// Rows acknowledged, keyed by destination label.
    pub rows_copied: BTreeMap<String, u64>,
    /// Master each destination was last written through.
    pub masters: BTreeMap<String, TabletAlias>,
}

impl CopySummary {
    /// Rows acknowledged across all destinations.
    pub fn total_rows(&self) -> u64 {
        self.rows_copied.values().sum()
    }
}

/// The copy state machine.
#[derive(Debug)]
pub struct SplitCloneWorker {
    config: WorkerConfig,
    source: ShardTarget,
    destinations: Vec<ShardTarget>,
    metrics: Arc<WorkerMetrics>,
    resolver: Arc<TopologyResolver>,
    writer: RetryingWriter,
    rows: Arc<dyn RowSource>,
    lifecycle: Arc<dyn ShardLifecycle>,
    /// Caller's token: an external stop.
    cancel: CancellationToken,
    /// Child of `cancel`, also fired by the first failing writer.
    run_token: CancellationToken,
}

impl SplitCloneWorker {
    /// Create a worker copying `source` into `destinations`.
    ///
    /// Every destination must lie inside the source key range and no two
    /// destinations may overlap.
    pub fn new(
        config: WorkerConfig,
        source: ShardTarget,
        destinations: Vec<ShardTarget>,
        collaborators: Collaborators,
        metrics: Arc<WorkerMetrics>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        validate_destinations(&source, &destinations)?;

        let run_token = cancel.child_token();
        let resolver = Arc::new(TopologyResolver::new(
            collaborators.topology,
            Arc::clone(&metrics),
            run_token.clone(),
        ));
        let writer = RetryingWriter::new(
            Arc::clone(&resolver),
            collaborators.tablets,
            Arc::clone(&metrics),
            config.retry.clone(),
            run_token.clone(),
        );

        Ok(Self {
            config,
            source,
            destinations,
            metrics,
            resolver,
            writer,
            rows: collaborators.rows,
            lifecycle: collaborators.lifecycle,
            cancel,
            run_token,
        })
    }

    /// The resolver shared by this run's writers.
    pub fn resolver(&self) -> &Arc<TopologyResolver> {
        &self.resolver
    }

    /// Run the copy to completion.
    ///
    /// Resets the registry first. Any failure leaves the registry in `error`
    /// with the triggering category recorded.
    #[tracing::instrument(skip(self), fields(source = %self.source, destinations = self.destinations.len()))]
    pub async fn run(self) -> Result<CopySummary> {
        let run_id = self.metrics.reset_run();
        tracing::info!(run_id = %run_id, strategy = ?self.config.strategy, "Starting split clone");

        match self.run_phases(run_id).await {
            Ok(summary) => {
                tracing::info!(
                    run_id = %run_id,
                    rows = summary.total_rows(),
                    batches = summary.batches_read,
                    "Split clone finished"
                );
                Ok(summary)
            }
            Err(e) => {
                // An external stop surfaces as whatever the interrupted call returned.
                let e = if self.cancel.is_cancelled() {
                    Error::Cancelled
                } else {
                    e
                };
                self.run_token.cancel();
                self.metrics.record_fatal(&e);
                Err(e)
            }
        }
    }

    async fn run_phases(&self, run_id: Uuid) -> Result<CopySummary> {
        self.cancellable(
            self.lifecycle
                .wait_for_destinations_ready(&self.destinations),
        )
        .await?;
        self.metrics.set_state(WorkerState::FindingTargets)?;

        self.find_targets().await?;
        self.metrics.set_state(WorkerState::Copying)?;

        let (batches_read, rows_copied) = self.copy().await?;
        self.metrics.set_state(WorkerState::CleaningUp)?;

        self.clean_up().await?;

        // Read before `done` so a supervisor that sees `done` finds the final masters.
        let masters = self
            .destinations
            .iter()
            .filter_map(|d| {
                self.resolver
                    .cached(d)
                    .map(|entry| (d.label(), entry.endpoint.alias.clone()))
            })
            .collect();
        self.metrics.set_state(WorkerState::Done)?;

        Ok(CopySummary {
            run_id,
            batches_read,
            rows_copied,
            masters,
        })
    }

    /// Resolve every destination master and check schemas.
    async fn find_targets(&self) -> Result<()> {
        let timeout = self.config.startup_timeout;
        let resolve_all = async {
            for destination in &self.destinations {
                self.resolve_at_startup(destination).await?;
            }
            Ok::<_, Error>(())
        };
        match tokio::time::timeout(timeout, resolve_all).await {
            Ok(result) => result?,
            Err(_) => {
                let unresolved = self
                    .destinations
                    .iter()
                    .find(|d| self.resolver.cached(d).is_none())
                    .unwrap_or(&self.source);
                return Err(Error::topology_unavailable(
                    unresolved,
                    format!("no reachable master within {:?}", timeout),
                ));
            }
        }

        if self.config.strategy.skip_schema_check {
            tracing::info!("Skipping schema check");
            return Ok(());
        }
        let expected = self
            .cancellable(self.lifecycle.schema_fingerprint(&self.source))
            .await?;
        for destination in &self.destinations {
            let actual = self
                .cancellable(self.lifecycle.schema_fingerprint(destination))
                .await?;
            if actual != expected {
                return Err(Error::SchemaMismatch {
                    source_target: self.source.clone(),
                    destination: destination.clone(),
                    reason: format!("fingerprint {} != {}", actual, expected),
                });
            }
        }
        Ok(())
    }

    /// Resolve one destination, retrying topology outages until the startup timeout.
    async fn resolve_at_startup(&self, destination: &ShardTarget) -> Result<()> {
        // Bounded by the startup timeout, not by a retry ceiling.
        let mut backoff = Backoff::new(&self.config.retry);
        loop {
            match self.resolver.resolve(destination).await {
                Ok(endpoint) => {
                    tracing::info!(
                        shard = %destination,
                        alias = %endpoint.alias,
                        "Destination reachable"
                    );
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    self.metrics.record_retry(destination, e.category());
                    tracing::warn!(shard = %destination, error = %e, "Destination not resolvable yet");
                    backoff.wait(&self.run_token).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stream all source rows to the destinations.
    ///
    /// Returns the number of batches read and rows acknowledged per destination.
    async fn copy(&self) -> Result<(u64, BTreeMap<String, u64>)> {
        let mut senders = Vec::with_capacity(self.destinations.len());
        let mut writers: Vec<JoinHandle<Result<u64>>> = Vec::with_capacity(self.destinations.len());
        for destination in &self.destinations {
            let (tx, rx) = mpsc::channel::<RowBatch>(self.config.channel_buffer);
            senders.push(tx);
            writers.push(tokio::spawn(drain_queue(
                self.writer.clone(),
                destination.clone(),
                rx,
                self.run_token.clone(),
            )));
        }

        let read_result = self.read_source(&senders).await;
        // Closing the queues lets writers finish what they have.
        drop(senders);
        if read_result.is_err() {
            self.run_token.cancel();
        }

        let mut rows_copied = BTreeMap::new();
        let mut first_error: Option<Error> = None;
        for (destination, handle) in self.destinations.iter().zip(writers) {
            let outcome = handle
                .await
                .unwrap_or_else(|e| Err(Error::Internal(format!("writer task failed: {}", e))));
            match outcome {
                Ok(rows) => {
                    rows_copied.insert(destination.label(), rows);
                }
                Err(e) => keep_most_specific(&mut first_error, e),
            }
        }

        match read_result {
            Err(e) => keep_most_specific(&mut first_error, e),
            Ok(_) if first_error.is_some() => {}
            Ok(batches) => return Ok((batches, rows_copied)),
        }
        Err(first_error.unwrap_or(Error::Cancelled))
    }

    async fn read_source(&self, senders: &[mpsc::Sender<RowBatch>]) -> Result<u64> {
        let mut batches = 0u64;
        loop {
            let Some(batch) = self.cancellable(self.rows.next_batch()).await? else {
                return Ok(batches);
            };
            batches += 1;
            tracing::debug!(sequence = batch.sequence, rows = batch.len(), "Read source batch");

            for (index, part) in batch.split_by(&self.destinations)? {
                let send = senders[index].send(part);
                let sent = tokio::select! {
                    sent = send => sent,
                    _ = self.run_token.cancelled() => return Err(Error::Cancelled),
                };
                // A closed queue means its writer failed; the writer reports why.
                if sent.is_err() {
                    return Err(Error::Cancelled);
                }
            }
        }
    }

    async fn clean_up(&self) -> Result<()> {
        let strategy = &self.config.strategy;
        for destination in &self.destinations {
            if strategy.populate_blp_checkpoint {
                self.cancellable(
                    self.lifecycle
                        .populate_blp_checkpoint(&self.source, destination),
                )
                .await?;
                tracing::info!(shard = %destination, "Populated replication checkpoint");
            }
            if !strategy.skip_set_source_shards {
                self.cancellable(self.lifecycle.set_source_shard(&self.source, destination))
                    .await?;
                tracing::info!(shard = %destination, source = %self.source, "Recorded source shard");
            }
        }
        self.cancellable(
            self.lifecycle
                .restore_serving_roles(&self.source, &self.config.cell),
        )
        .await?;
        tracing::info!(cell = %self.config.cell, "Restored serving roles");
        Ok(())
    }

    async fn cancellable<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            result = fut => result,
            _ = self.run_token.cancelled() => Err(Error::Cancelled),
        }
    }
}

/// Write every queued batch for one destination, in order.
async fn drain_queue(
    writer: RetryingWriter,
    destination: ShardTarget,
    mut queue: mpsc::Receiver<RowBatch>,
    run_token: CancellationToken,
) -> Result<u64> {
    let mut rows = 0u64;
    while let Some(batch) = queue.recv().await {
        match writer.write(&destination, &batch).await {
            Ok(ack) => rows += ack.rows_applied as u64,
            Err(e) => {
                tracing::error!(shard = %destination, error = %e, "Destination writer failed");
                run_token.cancel();
                return Err(e);
            }
        }
    }
    Ok(rows)
}

/// Keep the first error that is not a cancellation caused by a sibling.
fn keep_most_specific(slot: &mut Option<Error>, e: Error) {
    let replace = match slot.as_ref() {
        None => true,
        Some(Error::Cancelled) => !matches!(e, Error::Cancelled),
        Some(_) => false,
    };
    if replace {
        *slot = Some(e);
    }
}

fn validate_destinations(source: &ShardTarget, destinations: &[ShardTarget]) -> Result<()> {
    if destinations.is_empty() {
        return Err(Error::Config("at least one destination shard is required".to_string()));
    }
    for (i, d) in destinations.iter().enumerate() {
        if !source.key_range.covers(&d.key_range) {
            return Err(Error::Config(format!(
                "destination {} ({}) is outside source {} ({})",
                d, d.key_range, source, source.key_range
            )));
        }
        for other in &destinations[i + 1..] {
            if other == d || ranges_overlap(d, other) {
                return Err(Error::Config(format!(
                    "destinations {} and {} overlap",
                    d, other
                )));
            }
        }
    }
    Ok(())
}

fn ranges_overlap(a: &ShardTarget, b: &ShardTarget) -> bool {
    let (a, b) = (&a.key_range, &b.key_range);
    let a_before_b = !a.end.is_empty() && a.end <= b.start;
    let b_before_a = !b.end.is_empty() && b.end <= a.start;
    !(a_before_b || b_before_a)
}
