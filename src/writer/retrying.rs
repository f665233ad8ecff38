//! Write a batch to a shard master, following reparents.
//!
//! ```text
//!          ┌────────────┐  cache hit / query   ┌──────────────┐
//!   ──────►│  resolve   ├─────────────────────►│ apply_batch  │──► Ack
//!          └─────▲──────┘                      └──────┬───────┘
//!                │ invalidate + backoff               │
//!                └─────── stale_master ───────────────┤
//!                └─────── topology_unavailable ───────┘
//! ```
//!
//! Each category has its own ceiling. Exceeding one ends the shard with
//! `RetriesExhausted`; any non-retryable error is returned as is.

use super::{Backoff, TabletClient};
use crate::config::RetryConfig;
use crate::error::{Error, ErrorCategory, Result};
use crate::metrics::WorkerMetrics;
use crate::topology::TopologyResolver;
use crate::types::{Ack, RowBatch, ShardTarget};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Applies row batches to destination masters, retrying through reparents.
#[derive(Debug, Clone)]
pub struct RetryingWriter {
    resolver: Arc<TopologyResolver>,
    client: Arc<dyn TabletClient>,
    metrics: Arc<WorkerMetrics>,
    config: RetryConfig,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct RetryBudget {
    target: ShardTarget,
    category: ErrorCategory,
    max: u32,
    used: u32,
    backoff: Backoff,
}

impl RetryBudget {
    fn new(target: &ShardTarget, category: ErrorCategory, max: u32, config: &RetryConfig) -> Self {
        Self {
            target: target.clone(),
            category,
            max,
            used: 0,
            backoff: Backoff::new(config),
        }
    }

    /// Charge one retry for `error`, or fail once the ceiling is passed.
    fn charge(&mut self, error: &Error) -> Result<()> {
        self.used += 1;
        if self.used > self.max {
            return Err(Error::RetriesExhausted {
                target: self.target.clone(),
                category: self.category,
                attempts: self.used,
                last: error.to_string(),
            });
        }
        Ok(())
    }
}

impl RetryingWriter {
    /// Create a writer.
    pub fn new(
        resolver: Arc<TopologyResolver>,
        client: Arc<dyn TabletClient>,
        metrics: Arc<WorkerMetrics>,
        config: RetryConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            resolver,
            client,
            metrics,
            config,
            cancel,
        }
    }

    /// The resolver this writer consults.
    pub fn resolver(&self) -> &Arc<TopologyResolver> {
        &self.resolver
    }

    /// Apply `batch` to the current master of `target`.
    #[tracing::instrument(skip_all, fields(shard = %target, sequence = batch.sequence, rows = batch.len()))]
    pub async fn write(&self, target: &ShardTarget, batch: &RowBatch) -> Result<Ack> {
        let started = Instant::now();
        let mut stale = RetryBudget::new(
            target,
            ErrorCategory::StaleMaster,
            self.config.max_stale_master_retries,
            &self.config,
        );
        let mut unavailable = RetryBudget::new(
            target,
            ErrorCategory::TopologyUnavailable,
            self.config.max_topology_retries,
            &self.config,
        );

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let endpoint = match self.resolver.resolve(target).await {
                Ok(endpoint) => endpoint,
                Err(e) if e.category() == ErrorCategory::TopologyUnavailable => {
                    self.retry_after(&mut unavailable, &e).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let applied = tokio::select! {
                result = self.client.apply_batch(&endpoint, target, batch) => result,
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            };

            match applied {
                Ok(ack) => {
                    self.metrics
                        .record_batch_written(target, ack.rows_applied, started.elapsed());
                    tracing::debug!(
                        alias = %ack.alias,
                        generation = ack.topology_generation,
                        "Batch acknowledged"
                    );
                    return Ok(ack);
                }
                Err(e) => match e.category() {
                    ErrorCategory::StaleMaster => {
                        let seen = match &e {
                            Error::StaleMaster { generation, .. } => *generation,
                            _ => endpoint.topology_generation,
                        };
                        self.resolver.invalidate_stale(target, seen);
                        self.retry_after(&mut stale, &e).await?;
                        // A fresh master resets the transport budget.
                        unavailable.used = 0;
                        unavailable.backoff.reset();
                    }
                    ErrorCategory::TopologyUnavailable => {
                        self.resolver
                            .invalidate_stale(target, endpoint.topology_generation);
                        self.retry_after(&mut unavailable, &e).await?;
                    }
                    _ => return Err(e),
                },
            }
        }
    }

    async fn retry_after(&self, budget: &mut RetryBudget, error: &Error) -> Result<()> {
        if let Err(exhausted) = budget.charge(error) {
            tracing::error!(
                category = %budget.category,
                attempts = budget.used,
                error = %error,
                "Retry ceiling exceeded"
            );
            return Err(exhausted);
        }
        self.metrics.record_retry(&budget.target, budget.category);
        tracing::warn!(
            category = %budget.category,
            attempt = budget.used,
            max = budget.max,
            error = %error,
            "Retrying destination write"
        );
        budget.backoff.wait(&self.cancel).await
    }
}
