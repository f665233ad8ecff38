//! Destination writes.
//!
//! [`TabletClient`] is the transport to a destination tablet.
//! [`RetryingWriter`] drives it, re-resolving the master through the
//! [`TopologyResolver`](crate::topology::TopologyResolver) when a write lands
//! on a tablet that lost mastership.

mod backoff;
mod retrying;

pub use backoff::Backoff;
pub use retrying::RetryingWriter;

use crate::error::Result;
use crate::types::{Ack, RowBatch, ShardTarget, TabletEndpoint};

/// Transport to destination tablets.
#[async_trait::async_trait]
pub trait TabletClient: Send + Sync + std::fmt::Debug {
    /// Apply `batch` on `endpoint` as one transaction.
    ///
    /// Rows are upserted by primary key, so re-applying a batch is safe.
    /// Fails with `StaleMaster` if the tablet is not the master at
    /// `endpoint.topology_generation`, and with `TopologyUnavailable` if the
    /// tablet cannot be reached.
    async fn apply_batch(
        &self,
        endpoint: &TabletEndpoint,
        target: &ShardTarget,
        batch: &RowBatch,
    ) -> Result<Ack>;
}
