//! In-memory stand-ins for the systems a copy run talks to.
//!
//! All of them share one [`MemoryCluster`] so a test can reparent a shard and
//! have the topology answer, the tablets' view of mastership, and the stored
//! rows stay consistent with each other.

use crate::diff::{RowReader, ServingRotation};
use crate::error::{Error, Result};
use crate::topology::TopologyServer;
use crate::types::{
    Ack, KeyRange, Row, RowBatch, ShardTarget, TabletAlias, TabletEndpoint, TabletRole,
};
use crate::worker::{Collaborators, RowSource, ShardLifecycle};
use crate::writer::TabletClient;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug)]
struct ShardState {
    /// uid -> role
    tablets: BTreeMap<u32, TabletRole>,
    generation: u64,
    /// Rows replicated to every tablet of the shard, keyed by primary key.
    rows: BTreeMap<u64, Row>,
}

impl ShardState {
    fn master(&self) -> Option<u32> {
        self.tablets
            .iter()
            .find(|(_, role)| **role == TabletRole::Master)
            .map(|(uid, _)| *uid)
    }
}

#[derive(Debug, Default)]
struct ClusterInner {
    shards: RwLock<HashMap<ShardTarget, ShardState>>,
}

/// Topology service backed by the cluster's shard table.
#[derive(Debug)]
pub struct MemoryTopology {
    cell: String,
    inner: Arc<ClusterInner>,
    failures: Mutex<HashMap<ShardTarget, u32>>,
    queries: AtomicU64,
}

impl MemoryTopology {
    /// Fail the next `n` lookups for `target` with `TopologyUnavailable`.
    pub fn fail_next(&self, target: &ShardTarget, n: u32) {
        self.failures.lock().insert(target.clone(), n);
    }

    /// Lookups served so far, failed or not.
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    fn endpoint(&self, uid: u32, role: TabletRole, generation: u64) -> TabletEndpoint {
        TabletEndpoint {
            alias: TabletAlias::new(self.cell.clone(), uid),
            address: tablet_address(uid),
            role,
            topology_generation: generation,
        }
    }
}

#[async_trait::async_trait]
impl TopologyServer for MemoryTopology {
    async fn get_shard_master(&self, target: &ShardTarget) -> Result<TabletEndpoint> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.failures.lock();
            if let Some(left) = failures.get_mut(target) {
                if *left > 0 {
                    *left -= 1;
                    return Err(Error::topology_unavailable(target, "injected topology failure"));
                }
            }
        }

        let shards = self.inner.shards.read();
        let shard = shards
            .get(target)
            .ok_or_else(|| Error::topology_unavailable(target, "unknown shard"))?;
        let uid = shard
            .master()
            .ok_or_else(|| Error::topology_unavailable(target, "shard has no master"))?;
        Ok(self.endpoint(uid, TabletRole::Master, shard.generation))
    }
}

/// Destination tablets sharing the cluster's row store.
///
/// A write is applied only if the addressed tablet is still the master of the
/// shard; otherwise it fails with `StaleMaster`.
#[derive(Debug)]
pub struct MemoryTabletFleet {
    inner: Arc<ClusterInner>,
    unreachable: Mutex<HashMap<ShardTarget, u32>>,
    applied: Mutex<HashMap<TabletAlias, u64>>,
    stale_rejections: AtomicU64,
}

impl MemoryTabletFleet {
    /// Fail the next `n` writes to `target` as if the tablet could not be reached.
    pub fn unreachable_next(&self, target: &ShardTarget, n: u32) {
        self.unreachable.lock().insert(target.clone(), n);
    }

    /// Batches applied by a tablet.
    pub fn applied_by(&self, alias: &TabletAlias) -> u64 {
        self.applied.lock().get(alias).copied().unwrap_or(0)
    }

    /// Writes rejected because the tablet was no longer master.
    pub fn stale_rejections(&self) -> u64 {
        self.stale_rejections.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl TabletClient for MemoryTabletFleet {
    async fn apply_batch(
        &self,
        endpoint: &TabletEndpoint,
        target: &ShardTarget,
        batch: &RowBatch,
    ) -> Result<Ack> {
        {
            let mut unreachable = self.unreachable.lock();
            if let Some(left) = unreachable.get_mut(target) {
                if *left > 0 {
                    *left -= 1;
                    return Err(Error::topology_unavailable(
                        target,
                        format!("connection to {} refused", endpoint.address),
                    ));
                }
            }
        }

        let mut shards = self.inner.shards.write();
        let shard = shards
            .get_mut(target)
            .ok_or_else(|| Error::topology_unavailable(target, "unknown shard"))?;
        if shard.master() != Some(endpoint.alias.uid) {
            self.stale_rejections.fetch_add(1, Ordering::SeqCst);
            return Err(Error::StaleMaster {
                target: target.clone(),
                alias: endpoint.alias.to_string(),
                generation: endpoint.topology_generation,
                current_generation: Some(shard.generation),
            });
        }
        for row in &batch.rows {
            shard.rows.insert(row.id, row.clone());
        }
        drop(shards);

        *self.applied.lock().entry(endpoint.alias.clone()).or_insert(0) += 1;
        Ok(Ack {
            target: target.clone(),
            alias: endpoint.alias.clone(),
            topology_generation: endpoint.topology_generation,
            sequence: batch.sequence,
            rows_applied: batch.len(),
        })
    }
}

#[async_trait::async_trait]
impl RowReader for MemoryTabletFleet {
    async fn read_rows(&self, target: &ShardTarget, key_range: &KeyRange) -> Result<Vec<Row>> {
        let shards = self.inner.shards.read();
        let shard = shards
            .get(target)
            .ok_or_else(|| Error::topology_unavailable(target, "unknown shard"))?;
        Ok(shard
            .rows
            .values()
            .filter(|r| key_range.contains(r.keyspace_id))
            .cloned()
            .collect())
    }
}

#[derive(Debug)]
struct Hold {
    after: u64,
    release: Arc<Notify>,
}

/// Source row stream that can pause after a given number of batches.
#[derive(Debug, Default)]
pub struct MemoryRowSource {
    batches: Mutex<VecDeque<RowBatch>>,
    produced: AtomicU64,
    hold: Mutex<Option<Hold>>,
}

impl MemoryRowSource {
    /// Cut `rows` into batches of `batch_size`.
    pub fn from_rows(key_range: KeyRange, rows: Vec<Row>, batch_size: usize) -> Self {
        let source = Self::default();
        source.load(key_range, rows, batch_size);
        source
    }

    fn load(&self, key_range: KeyRange, rows: Vec<Row>, batch_size: usize) {
        let mut batches = self.batches.lock();
        let start = batches.len() as u64;
        for (i, chunk) in rows.chunks(batch_size.max(1)).enumerate() {
            batches.push_back(RowBatch::new(start + i as u64, key_range.clone(), chunk.to_vec()));
        }
    }

    /// Block the stream after `batches` batches until the returned handle is notified.
    pub fn hold_after(&self, batches: u64) -> Arc<Notify> {
        let release = Arc::new(Notify::new());
        *self.hold.lock() = Some(Hold {
            after: batches,
            release: Arc::clone(&release),
        });
        release
    }

    /// Batches handed out so far.
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl RowSource for MemoryRowSource {
    async fn next_batch(&self) -> Result<Option<RowBatch>> {
        let held = {
            let mut hold = self.hold.lock();
            let due = matches!(hold.as_ref(), Some(h) if h.after == self.produced());
            if due {
                hold.take()
            } else {
                None
            }
        };
        if let Some(hold) = held {
            tracing::debug!(after = hold.after, "Source stream held");
            hold.release.notified().await;
        }

        let next = self.batches.lock().pop_front();
        if next.is_some() {
            self.produced.fetch_add(1, Ordering::SeqCst);
        }
        Ok(next)
    }
}

/// Observable lifecycle calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    DestinationsReady(Vec<ShardTarget>),
    BlpCheckpoint {
        source: ShardTarget,
        destination: ShardTarget,
    },
    SetSourceShard {
        source: ShardTarget,
        destination: ShardTarget,
    },
    RestoreServingRoles {
        source: ShardTarget,
        cell: String,
    },
    RemovedFromRotation(ShardTarget),
    RestoredToRotation(ShardTarget),
}

/// Records lifecycle and rotation calls; schemas default to `v1`.
#[derive(Debug, Default)]
pub struct MemoryLifecycle {
    events: Mutex<Vec<LifecycleEvent>>,
    schemas: Mutex<HashMap<ShardTarget, String>>,
    fail_restore: Mutex<bool>,
}

impl MemoryLifecycle {
    pub fn set_schema(&self, target: &ShardTarget, fingerprint: &str) {
        self.schemas
            .lock()
            .insert(target.clone(), fingerprint.to_string());
    }

    /// Make `restore_to_rotation` fail.
    pub fn fail_rotation_restore(&self, fail: bool) {
        *self.fail_restore.lock() = fail;
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    /// Shards removed from rotation and not yet restored.
    pub fn out_of_rotation(&self) -> Vec<ShardTarget> {
        let mut out: Vec<ShardTarget> = Vec::new();
        for event in self.events.lock().iter() {
            match event {
                LifecycleEvent::RemovedFromRotation(t) => out.push(t.clone()),
                LifecycleEvent::RestoredToRotation(t) => out.retain(|o| o != t),
                _ => {}
            }
        }
        out
    }

    fn record(&self, event: LifecycleEvent) {
        self.events.lock().push(event);
    }
}

#[async_trait::async_trait]
impl ShardLifecycle for MemoryLifecycle {
    async fn wait_for_destinations_ready(&self, destinations: &[ShardTarget]) -> Result<()> {
        self.record(LifecycleEvent::DestinationsReady(destinations.to_vec()));
        Ok(())
    }

    async fn schema_fingerprint(&self, target: &ShardTarget) -> Result<String> {
        Ok(self
            .schemas
            .lock()
            .get(target)
            .cloned()
            .unwrap_or_else(|| "v1".to_string()))
    }

    async fn populate_blp_checkpoint(
        &self,
        source: &ShardTarget,
        destination: &ShardTarget,
    ) -> Result<()> {
        self.record(LifecycleEvent::BlpCheckpoint {
            source: source.clone(),
            destination: destination.clone(),
        });
        Ok(())
    }

    async fn set_source_shard(&self, source: &ShardTarget, destination: &ShardTarget) -> Result<()> {
        self.record(LifecycleEvent::SetSourceShard {
            source: source.clone(),
            destination: destination.clone(),
        });
        Ok(())
    }

    async fn restore_serving_roles(&self, source: &ShardTarget, cell: &str) -> Result<()> {
        self.record(LifecycleEvent::RestoreServingRoles {
            source: source.clone(),
            cell: cell.to_string(),
        });
        Ok(())
    }
}

#[async_trait::async_trait]
impl ServingRotation for MemoryLifecycle {
    async fn remove_from_rotation(&self, target: &ShardTarget) -> Result<()> {
        self.record(LifecycleEvent::RemovedFromRotation(target.clone()));
        Ok(())
    }

    async fn restore_to_rotation(&self, target: &ShardTarget) -> Result<()> {
        if *self.fail_restore.lock() {
            return Err(Error::Internal(format!("cannot restore {}", target)));
        }
        self.record(LifecycleEvent::RestoredToRotation(target.clone()));
        Ok(())
    }
}

/// A whole in-memory deployment: topology, tablets, source stream, lifecycle.
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    inner: Arc<ClusterInner>,
    topology: Arc<MemoryTopology>,
    fleet: Arc<MemoryTabletFleet>,
    rows: Arc<MemoryRowSource>,
    lifecycle: Arc<MemoryLifecycle>,
}

impl MemoryCluster {
    pub fn new(cell: impl Into<String>) -> Self {
        let inner = Arc::new(ClusterInner::default());
        Self {
            topology: Arc::new(MemoryTopology {
                cell: cell.into(),
                inner: Arc::clone(&inner),
                failures: Mutex::new(HashMap::new()),
                queries: AtomicU64::new(0),
            }),
            fleet: Arc::new(MemoryTabletFleet {
                inner: Arc::clone(&inner),
                unreachable: Mutex::new(HashMap::new()),
                applied: Mutex::new(HashMap::new()),
                stale_rejections: AtomicU64::new(0),
            }),
            rows: Arc::new(MemoryRowSource::default()),
            lifecycle: Arc::new(MemoryLifecycle::default()),
            inner,
        }
    }

    /// Create a shard with a master at `master_uid`, a replica at `+1` and an
    /// rdonly at `+2`.
    pub fn add_shard(&self, target: &ShardTarget, master_uid: u32) {
        let tablets = BTreeMap::from([
            (master_uid, TabletRole::Master),
            (master_uid + 1, TabletRole::Replica),
            (master_uid + 2, TabletRole::Rdonly),
        ]);
        self.inner.shards.write().insert(
            target.clone(),
            ShardState {
                tablets,
                generation: 1,
                rows: BTreeMap::new(),
            },
        );
    }

    /// Promote `new_master` and demote the old master to replica.
    ///
    /// Returns the new topology generation.
    pub fn reparent(&self, target: &ShardTarget, new_master: u32) -> Result<u64> {
        let mut shards = self.inner.shards.write();
        let shard = shards
            .get_mut(target)
            .ok_or_else(|| Error::Config(format!("unknown shard {}", target)))?;
        if !shard.tablets.contains_key(&new_master) {
            return Err(Error::Config(format!("tablet {} is not in {}", new_master, target)));
        }
        for role in shard.tablets.values_mut() {
            if *role == TabletRole::Master {
                *role = TabletRole::Replica;
            }
        }
        shard.tablets.insert(new_master, TabletRole::Master);
        shard.generation += 1;
        tracing::info!(
            shard = %target,
            master = new_master,
            generation = shard.generation,
            "Reparented shard"
        );
        Ok(shard.generation)
    }

    /// Write `rows` to `source` and queue them on the source stream.
    pub fn load_source(&self, source: &ShardTarget, rows: Vec<Row>, batch_size: usize) {
        if let Some(shard) = self.inner.shards.write().get_mut(source) {
            for row in &rows {
                shard.rows.insert(row.id, row.clone());
            }
        }
        self.rows.load(source.key_range.clone(), rows, batch_size);
    }

    /// Insert a row straight into a shard, bypassing the copy.
    pub fn insert_row(&self, target: &ShardTarget, row: Row) {
        if let Some(shard) = self.inner.shards.write().get_mut(target) {
            shard.rows.insert(row.id, row);
        }
    }

    /// Rows stored on a shard, in primary key order.
    pub fn shard_rows(&self, target: &ShardTarget) -> Vec<Row> {
        self.inner
            .shards
            .read()
            .get(target)
            .map(|s| s.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Current master uid of a shard.
    pub fn master(&self, target: &ShardTarget) -> Option<u32> {
        self.inner.shards.read().get(target).and_then(|s| s.master())
    }

    pub fn hold_source_after(&self, batches: u64) -> Arc<Notify> {
        self.rows.hold_after(batches)
    }

    pub fn set_schema(&self, target: &ShardTarget, fingerprint: &str) {
        self.lifecycle.set_schema(target, fingerprint);
    }

    pub fn lifecycle_events(&self) -> Vec<LifecycleEvent> {
        self.lifecycle.events()
    }

    pub fn topology(&self) -> &Arc<MemoryTopology> {
        &self.topology
    }

    pub fn fleet(&self) -> &Arc<MemoryTabletFleet> {
        &self.fleet
    }

    pub fn lifecycle(&self) -> &Arc<MemoryLifecycle> {
        &self.lifecycle
    }

    /// Collaborators for a copy run against this cluster.
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            topology: self.topology.clone(),
            tablets: self.fleet.clone(),
            rows: self.rows.clone(),
            lifecycle: self.lifecycle.clone(),
        }
    }
}

fn tablet_address(uid: u32) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 15000u16.wrapping_add(uid as u16)))
}
