//! Command surface: start a copy or a diff in the background.
//!
//! Each command binds its own stats endpoint and returns a handle carrying
//! the task, the bound address, and a cancellation token.
//!
//! ```rust,ignore
//! let copy = start_copy(
//!     "test_keyspace/0",
//!     &["test_keyspace/-80", "test_keyspace/80-"],
//!     "-populate_blp_checkpoint",
//!     WorkerConfig::default(),
//!     collaborators,
//! )
//! .await?;
//! poll_for_stats(copy.stats_addr(), |s| s.state == WorkerState::CleaningUp, timeout, interval).await?;
//! copy.wait().await?;
//! ```

use crate::config::{StrategyFlags, WorkerConfig};
use crate::diff::{Diff, DiffVerifier, RowReader, ServingRotation};
use crate::error::{Error, Result};
use crate::metrics::WorkerMetrics;
use crate::stats::{StatsHandle, StatsServer};
use crate::types::ShardTarget;
use crate::worker::{Collaborators, CopySummary, SplitCloneWorker, WorkerState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A background command and its stats endpoint.
#[derive(Debug)]
pub struct CommandHandle<T> {
    metrics: Arc<WorkerMetrics>,
    cancel: CancellationToken,
    stats: StatsHandle,
    task: JoinHandle<Result<T>>,
}

impl<T> CommandHandle<T> {
    /// Address of the stats endpoint.
    pub fn stats_addr(&self) -> SocketAddr {
        self.stats.addr()
    }

    /// Registry the command reports into.
    pub fn metrics(&self) -> &Arc<WorkerMetrics> {
        &self.metrics
    }

    /// Token that stops the command.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Ask the command to stop. Use [`wait`](Self::wait) to observe the outcome.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the command, then close its stats endpoint.
    pub async fn wait(self) -> Result<T> {
        let outcome = self
            .task
            .await
            .unwrap_or_else(|e| Err(Error::Internal(format!("command task failed: {}", e))));
        if let Err(e) = self.stats.shutdown().await {
            tracing::warn!(error = %e, "Stats endpoint did not shut down cleanly");
        }
        outcome
    }
}

/// Start copying `source` into `destinations`.
///
/// Shards are given as `keyspace/shard`. A non-empty `strategy` replaces the
/// strategy in `config`.
pub async fn start_copy(
    source: &str,
    destinations: &[&str],
    strategy: &str,
    mut config: WorkerConfig,
    collaborators: Collaborators,
) -> Result<CommandHandle<CopySummary>> {
    let source = ShardTarget::parse_path(source)?;
    let destinations = destinations
        .iter()
        .map(|d| ShardTarget::parse_path(d))
        .collect::<Result<Vec<_>>>()?;
    if !strategy.trim().is_empty() {
        config.strategy = StrategyFlags::parse(strategy)?;
    }

    let metrics = Arc::new(WorkerMetrics::new());
    let cancel = CancellationToken::new();
    let stats = StatsServer::bind(config.stats_addr, Arc::clone(&metrics))
        .await?
        .spawn()?;
    let worker = SplitCloneWorker::new(
        config,
        source.clone(),
        destinations,
        collaborators,
        Arc::clone(&metrics),
        cancel.clone(),
    );
    let worker = match worker {
        Ok(worker) => worker,
        Err(e) => {
            let _ = stats.shutdown().await;
            return Err(e);
        }
    };

    tracing::info!(source = %source, stats = %stats.addr(), "Started copy");
    Ok(CommandHandle {
        metrics,
        cancel,
        stats,
        task: tokio::spawn(worker.run()),
    })
}

/// Start diffing `destination` against `source`.
///
/// `copy_metrics` is the registry of the finished copy run; the diff is
/// rejected unless it reports `done`. The returned endpoint serves that
/// registry.
pub async fn start_diff(
    source: &str,
    destination: &str,
    config: &WorkerConfig,
    copy_metrics: Arc<WorkerMetrics>,
    reader: Arc<dyn RowReader>,
    rotation: Arc<dyn ServingRotation>,
) -> Result<CommandHandle<Diff>> {
    let source = ShardTarget::parse_path(source)?;
    let destination = ShardTarget::parse_path(destination)?;

    let verifier = DiffVerifier::new(Arc::clone(&copy_metrics), reader, rotation);
    // Rejected before anything is spawned.
    let state = copy_metrics.state();
    if state != WorkerState::Done {
        return Err(Error::PrematureDiff {
            state: state.as_str().to_string(),
        });
    }

    let cancel = CancellationToken::new();
    let stats = StatsServer::bind(config.stats_addr, Arc::clone(&copy_metrics))
        .await?
        .spawn()?;
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        tokio::select! {
            diff = verifier.compare(&source, &destination) => diff,
            _ = token.cancelled() => Err(Error::Cancelled),
        }
    });

    Ok(CommandHandle {
        metrics: copy_metrics,
        cancel,
        stats,
        task,
    })
}
