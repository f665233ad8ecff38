//! Post-copy verification of destination rows against the source.
//!
//! A diff reads the source rows that belong to one destination's key range,
//! reads the destination, and compares both by primary key. Both shards are
//! taken out of serving rotation while they are read and put back on every
//! exit path.

mod rotation;

pub use rotation::RotationGuard;

use crate::error::{Error, Result};
use crate::metrics::WorkerMetrics;
use crate::types::{KeyRange, Row, ShardTarget};
use crate::worker::WorkerState;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Reads rows from a shard for comparison.
#[async_trait::async_trait]
pub trait RowReader: Send + Sync + std::fmt::Debug {
    /// Rows of `target` whose keyspace id falls in `key_range`, in any order.
    async fn read_rows(&self, target: &ShardTarget, key_range: &KeyRange) -> Result<Vec<Row>>;
}

/// Moves shards in and out of serving-read rotation.
#[async_trait::async_trait]
pub trait ServingRotation: Send + Sync + std::fmt::Debug {
    async fn remove_from_rotation(&self, target: &ShardTarget) -> Result<()>;
    async fn restore_to_rotation(&self, target: &ShardTarget) -> Result<()>;
}

/// A row present on both sides with different contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowMismatch {
    pub source: Row,
    pub destination: Row,
}

/// Result of comparing one destination against the source.
///
/// Rows are listed in primary key order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff {
    pub source: ShardTarget,
    pub destination: ShardTarget,
    /// Rows compared on the source side.
    pub source_rows: usize,
    /// On the source, not on the destination.
    pub missing: Vec<Row>,
    /// On the destination, not on the source.
    pub extra: Vec<Row>,
    pub mismatched: Vec<RowMismatch>,
}

impl Diff {
    /// True when the destination has converged.
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty() && self.mismatched.is_empty()
    }

    /// Number of differing rows.
    pub fn len(&self) -> usize {
        self.missing.len() + self.extra.len() + self.mismatched.len()
    }

    /// `DataMismatch` unless the diff is empty.
    pub fn into_result(self) -> Result<Self> {
        if self.is_empty() {
            return Ok(self);
        }
        Err(Error::DataMismatch {
            destination: self.destination.clone(),
            missing: self.missing.len(),
            extra: self.extra.len(),
            mismatched: self.mismatched.len(),
        })
    }
}

/// Compares source and destination rows once a copy run is `done`.
#[derive(Debug, Clone)]
pub struct DiffVerifier {
    metrics: Arc<WorkerMetrics>,
    reader: Arc<dyn RowReader>,
    rotation: Arc<dyn ServingRotation>,
}

impl DiffVerifier {
    /// `metrics` is the registry of the copy run being verified.
    pub fn new(
        metrics: Arc<WorkerMetrics>,
        reader: Arc<dyn RowReader>,
        rotation: Arc<dyn ServingRotation>,
    ) -> Self {
        Self {
            metrics,
            reader,
            rotation,
        }
    }

    /// Compare the rows of `destination` with the matching rows of `source`.
    ///
    /// Fails with `PrematureDiff` unless the copy run is `done`.
    #[tracing::instrument(skip_all, fields(source = %source, destination = %destination))]
    pub async fn compare(&self, source: &ShardTarget, destination: &ShardTarget) -> Result<Diff> {
        let state = self.metrics.state();
        if state != WorkerState::Done {
            return Err(Error::PrematureDiff {
                state: state.as_str().to_string(),
            });
        }

        let mut guard = RotationGuard::new(Arc::clone(&self.rotation));
        let compared = async {
            guard.remove(source).await?;
            guard.remove(destination).await?;
            self.read_and_compare(source, destination).await
        }
        .await;
        let restored = guard.restore().await;

        let diff = compared?;
        restored?;

        if diff.is_empty() {
            tracing::info!(rows = diff.source_rows, "Diff found no differences");
        } else {
            tracing::warn!(
                missing = diff.missing.len(),
                extra = diff.extra.len(),
                mismatched = diff.mismatched.len(),
                "Diff found differences"
            );
        }
        Ok(diff)
    }

    async fn read_and_compare(&self, source: &ShardTarget, destination: &ShardTarget) -> Result<Diff> {
        let range = &destination.key_range;
        let source_rows = self.reader.read_rows(source, range).await?;
        let destination_rows = self.reader.read_rows(destination, range).await?;
        Ok(compare_rows(source, destination, source_rows, destination_rows))
    }
}

/// Merge two row sets by primary key.
fn compare_rows(
    source: &ShardTarget,
    destination: &ShardTarget,
    source_rows: Vec<Row>,
    destination_rows: Vec<Row>,
) -> Diff {
    let source_count = source_rows.len();
    let mut remaining: BTreeMap<u64, Row> =
        destination_rows.into_iter().map(|r| (r.id, r)).collect();
    let mut ordered: Vec<Row> = source_rows;
    ordered.sort_by_key(|r| r.id);

    let mut missing = Vec::new();
    let mut mismatched = Vec::new();
    for row in ordered {
        match remaining.remove(&row.id) {
            None => missing.push(row),
            Some(other) if other != row => mismatched.push(RowMismatch {
                source: row,
                destination: other,
            }),
            Some(_) => {}
        }
    }

    Diff {
        source: source.clone(),
        destination: destination.clone(),
        source_rows: source_count,
        missing,
        extra: remaining.into_values().collect(),
        mismatched,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KeyspaceId;
    use bytes::Bytes;

    fn row(id: u64, value: &'static str) -> Row {
        Row::new(id, KeyspaceId(id << 56), vec![Bytes::from_static(value.as_bytes())])
    }

    fn shards() -> (ShardTarget, ShardTarget) {
        (
            ShardTarget::parse("test_keyspace", "0").unwrap(),
            ShardTarget::parse("test_keyspace", "-80").unwrap(),
        )
    }

    #[test]
    fn test_compare_rows_classifies_differences() {
        let (src, dst) = shards();
        let diff = compare_rows(
            &src,
            &dst,
            vec![row(3, "c"), row(1, "a"), row(2, "b")],
            vec![row(1, "a"), row(2, "B"), row(4, "d")],
        );
        assert_eq!(diff.source_rows, 3);
        assert_eq!(diff.missing, vec![row(3, "c")]);
        assert_eq!(diff.extra, vec![row(4, "d")]);
        assert_eq!(diff.mismatched.len(), 1);
        assert_eq!(diff.mismatched[0].destination, row(2, "B"));
        assert_eq!(diff.len(), 3);

        match diff.into_result() {
            Err(Error::DataMismatch { missing, extra, mismatched, .. }) => {
                assert_eq!((missing, extra, mismatched), (1, 1, 1));
            }
            other => panic!("expected DataMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_identical_rows_give_empty_diff() {
        let (src, dst) = shards();
        let rows = vec![row(1, "a"), row(2, "b")];
        let diff = compare_rows(&src, &dst, rows.clone(), rows);
        assert!(diff.is_empty());
        assert!(diff.into_result().is_ok());
    }
}
