//! Topology lookups for destination shards.
//!
//! The topology service is an external collaborator reached through
//! [`TopologyServer`]. [`TopologyResolver`] sits in front of it and keeps one
//! [`ResolutionCacheEntry`] per shard so the write path only pays for a
//! lookup when a master changes.

mod resolver;

pub use resolver::{ResolutionCacheEntry, TopologyResolver};

use crate::error::Result;
use crate::types::{ShardTarget, TabletEndpoint};

/// The external topology service.
#[async_trait::async_trait]
pub trait TopologyServer: Send + Sync + std::fmt::Debug {
    /// Current master of `target`, with the generation of its role assignment.
    ///
    /// Fails with `TopologyUnavailable` when the service cannot answer.
    async fn get_shard_master(&self, target: &ShardTarget) -> Result<TabletEndpoint>;
}
