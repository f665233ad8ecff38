//! Live resharding copy worker.
//!
//! Copies the rows of one source shard into several destination shards while
//! the destinations keep serving and may fail over. Writes that land on a
//! tablet which lost mastership are detected, the master is re-resolved, and
//! the same batch is applied again. Rows are upserted by primary key, so a
//! retried batch never duplicates data.
//!
//! # Example
//!
//! ```rust,ignore
//! use reshard::command::{start_copy, start_diff};
//! use reshard::stats::poll_for_stats;
//! use reshard::{WorkerConfig, WorkerState};
//! use std::time::Duration;
//!
//! let copy = start_copy(
//!     "test_keyspace/0",
//!     &["test_keyspace/-80", "test_keyspace/80-"],
//!     "-populate_blp_checkpoint",
//!     WorkerConfig::new("test_nj"),
//!     collaborators,
//! )
//! .await?;
//!
//! // Inject topology changes while the copy runs.
//! poll_for_stats(
//!     copy.stats_addr(),
//!     |s| s.state == WorkerState::Copying,
//!     Duration::from_secs(30),
//!     Duration::from_millis(100),
//! )
//! .await?;
//!
//! let metrics = copy.metrics().clone();
//! let summary = copy.wait().await?;
//! let diff = start_diff("test_keyspace/0", "test_keyspace/-80", &config, metrics, reader, rotation)
//!     .await?
//!     .wait()
//!     .await?;
//! assert!(diff.is_empty());
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  batches   ┌─────────────────┐   resolve   ┌──────────────────┐
//! │  RowSource   ├───────────►│ SplitCloneWorker├────────────►│ TopologyResolver │
//! └──────────────┘            │ (state machine) │             │  (per-shard cache)│
//!                             └───────┬─────────┘             └────────▲─────────┘
//!                                     │ one queue per destination      │ invalidate
//!                                     ▼                                │
//!                             ┌─────────────────┐  apply_batch  ┌──────┴───────┐
//!                             │ RetryingWriter  ├──────────────►│ TabletClient │
//!                             └───────┬─────────┘               └──────────────┘
//!                                     │ counters
//!                                     ▼
//!                             ┌─────────────────┐   JSON   ┌──────────────┐
//!                             │  WorkerMetrics  ├─────────►│ StatsServer  │
//!                             └─────────────────┘          └──────────────┘
//! ```
//!
//! After the run reports `done`, [`diff::DiffVerifier`] compares each
//! destination with the source rows in its key range.

pub mod command;
pub mod config;
pub mod diff;
pub mod error;
pub mod metrics;
pub mod stats;
pub mod testing;
pub mod topology;
pub mod types;
pub mod worker;
pub mod writer;

pub use config::{RetryConfig, StrategyFlags, WorkerConfig};
pub use error::{Error, ErrorCategory, Result};
pub use types::{
    Ack, KeyRange, KeyspaceId, Row, RowBatch, ShardTarget, TabletAlias, TabletEndpoint,
    TabletRole,
};

pub use diff::{Diff, DiffVerifier, RowReader, ServingRotation};
pub use metrics::{StatsSnapshot, WorkerMetrics};
pub use topology::{ResolutionCacheEntry, TopologyResolver, TopologyServer};
pub use worker::{
    Collaborators, CopySummary, RowSource, ShardLifecycle, SplitCloneWorker, WorkerState,
};
pub use writer::{RetryingWriter, TabletClient};
