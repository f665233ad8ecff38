//! Core types used throughout the worker.

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Sharding key of a row. Ranges compare its big-endian bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyspaceId(pub u64);

impl KeyspaceId {
    /// Big-endian byte form, the representation key ranges are expressed in.
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for KeyspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Half-open range `[start, end)` of keyspace ids.
///
/// An empty `start` means "from the beginning", an empty `end` means "to the end".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    /// The range covering every keyspace id.
    pub fn full() -> Self {
        Self::default()
    }

    /// Parse a shard name such as `-80`, `80-`, `40-80`, `0` or `-`.
    pub fn parse_shard_name(name: &str) -> Result<Self> {
        // Unsharded keyspaces name their single shard "0".
        if name.is_empty() || name == "0" || name == "-" {
            return Ok(Self::full());
        }
        let (start, end) = name
            .split_once('-')
            .ok_or_else(|| Error::Config(format!("invalid shard name {:?}", name)))?;
        let range = Self {
            start: decode_hex(start)?,
            end: decode_hex(end)?,
        };
        if !range.end.is_empty() && range.start >= range.end {
            return Err(Error::Config(format!("empty key range in shard name {:?}", name)));
        }
        Ok(range)
    }

    /// Whether this range covers every keyspace id.
    pub fn is_full(&self) -> bool {
        self.start.is_empty() && self.end.is_empty()
    }

    /// Whether the keyspace id falls inside this range.
    pub fn contains(&self, id: KeyspaceId) -> bool {
        let key = id.to_bytes();
        self.start.as_slice() <= key.as_slice()
            && (self.end.is_empty() || key.as_slice() < self.end.as_slice())
    }

    /// Whether `other` lies completely inside this range.
    pub fn covers(&self, other: &KeyRange) -> bool {
        let start_ok = self.start <= other.start;
        let end_ok = self.end.is_empty() || (!other.end.is_empty() && other.end <= self.end);
        start_ok && end_ok
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_full() {
            return f.write_str("-");
        }
        write!(f, "{}-{}", hex::encode(&self.start), hex::encode(&self.end))
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    hex::decode(s).map_err(|e| Error::Config(format!("invalid hex key {:?}: {}", s, e)))
}

/// Identifies a logical shard. Immutable for the lifetime of a copy run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardTarget {
    pub keyspace: String,
    pub shard_name: String,
    pub key_range: KeyRange,
}

impl ShardTarget {
    /// Build a target, deriving the key range from the shard name.
    pub fn parse(keyspace: impl Into<String>, shard_name: impl Into<String>) -> Result<Self> {
        let shard_name = shard_name.into();
        let key_range = KeyRange::parse_shard_name(&shard_name)?;
        Ok(Self {
            keyspace: keyspace.into(),
            shard_name,
            key_range,
        })
    }

    /// Parse `keyspace/shard`.
    pub fn parse_path(path: &str) -> Result<Self> {
        let (keyspace, shard) = path
            .split_once('/')
            .ok_or_else(|| Error::Config(format!("expected keyspace/shard, got {:?}", path)))?;
        Self::parse(keyspace, shard)
    }

    /// Label used for per-shard counters.
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ShardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.keyspace, self.shard_name)
    }
}

/// Tablet alias, `cell-uid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabletAlias {
    pub cell: String,
    pub uid: u32,
}

impl TabletAlias {
    pub fn new(cell: impl Into<String>, uid: u32) -> Self {
        Self {
            cell: cell.into(),
            uid,
        }
    }
}

impl fmt::Display for TabletAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:010}", self.cell, self.uid)
    }
}

/// Serving role of a tablet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabletRole {
    Master,
    Replica,
    Rdonly,
}

/// One addressable database process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletEndpoint {
    pub alias: TabletAlias,
    pub address: SocketAddr,
    pub role: TabletRole,
    /// Bumped by the topology service each time role assignment changes.
    pub topology_generation: u64,
}

/// A source row. `id` is the natural primary key used for upserts and diffs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub id: u64,
    pub keyspace_id: KeyspaceId,
    pub columns: Vec<Bytes>,
}

impl Row {
    pub fn new(id: u64, keyspace_id: KeyspaceId, columns: Vec<Bytes>) -> Self {
        Self {
            id,
            keyspace_id,
            columns,
        }
    }
}

/// Ordered rows belonging to one key range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowBatch {
    /// Position of this batch in the stream it was produced by.
    pub sequence: u64,
    pub key_range: KeyRange,
    pub rows: Vec<Row>,
}

impl RowBatch {
    pub fn new(sequence: u64, key_range: KeyRange, rows: Vec<Row>) -> Self {
        Self {
            sequence,
            key_range,
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Split into one batch per destination, preserving row order.
    ///
    /// Returns `(destination index, batch)` pairs for destinations that got rows.
    /// A row no destination covers is an error.
    pub fn split_by(self, destinations: &[ShardTarget]) -> Result<Vec<(usize, RowBatch)>> {
        let mut parts: Vec<Vec<Row>> = vec![Vec::new(); destinations.len()];
        for row in self.rows {
            let index = destinations
                .iter()
                .position(|d| d.key_range.contains(row.keyspace_id))
                .ok_or_else(|| {
                    Error::Config(format!(
                        "row {} with keyspace id {} is not covered by any destination",
                        row.id, row.keyspace_id
                    ))
                })?;
            parts[index].push(row);
        }
        Ok(parts
            .into_iter()
            .enumerate()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(i, rows)| {
                (
                    i,
                    RowBatch::new(self.sequence, destinations[i].key_range.clone(), rows),
                )
            })
            .collect())
    }
}

/// Acknowledgement of a batch applied on a destination master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub target: ShardTarget,
    pub alias: TabletAlias,
    pub topology_generation: u64,
    pub sequence: u64,
    pub rows_applied: usize,
}
