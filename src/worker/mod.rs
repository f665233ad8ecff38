//! The copy state machine and the collaborators it drives.
//!
//! ```text
//! initializing ─► finding_targets ─► copying ─► cleaning_up ─► done
//!       │                │             │  ▲          │
//!       │                │             └──┘          │
//!       └────────────────┴──────► error ◄────────────┘
//! ```

mod copy;
mod state;

pub use copy::{CopySummary, SplitCloneWorker};
pub use state::WorkerState;

use crate::error::Result;
use crate::topology::TopologyServer;
use crate::types::{RowBatch, ShardTarget};
use crate::writer::TabletClient;
use std::sync::Arc;

/// Ordered stream of row batches read from the source shard.
#[async_trait::async_trait]
pub trait RowSource: Send + Sync + std::fmt::Debug {
    /// The next batch, or `None` once the source is exhausted.
    async fn next_batch(&self) -> Result<Option<RowBatch>>;
}

/// Tablet lifecycle operations owned by the surrounding system.
#[async_trait::async_trait]
pub trait ShardLifecycle: Send + Sync + std::fmt::Debug {
    /// Resolve once every destination keyspace/shard is created and serving.
    async fn wait_for_destinations_ready(&self, destinations: &[ShardTarget]) -> Result<()>;

    /// Fingerprint of the schema on `target`. Equal fingerprints mean equal schemas.
    async fn schema_fingerprint(&self, target: &ShardTarget) -> Result<String>;

    /// Record where filtered replication from `source` should start on `destination`.
    async fn populate_blp_checkpoint(
        &self,
        source: &ShardTarget,
        destination: &ShardTarget,
    ) -> Result<()>;

    /// Record `source` as the origin shard of `destination`.
    async fn set_source_shard(&self, source: &ShardTarget, destination: &ShardTarget)
        -> Result<()>;

    /// Put the rdonly tablets of `source` in `cell` that were taken out of
    /// serving for the copy back into rotation.
    async fn restore_serving_roles(&self, source: &ShardTarget, cell: &str) -> Result<()>;
}

/// Everything a copy run talks to.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub topology: Arc<dyn TopologyServer>,
    pub tablets: Arc<dyn TabletClient>,
    pub rows: Arc<dyn RowSource>,
    pub lifecycle: Arc<dyn ShardLifecycle>,
}
