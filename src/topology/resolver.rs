//! Cached master resolution with explicit invalidation.
//!
//! # Locking
//!
//! Each shard owns a slot with two locks:
//!
//! 1. `query` (async): serializes topology queries for the shard, so writers
//!    that miss at the same time coalesce behind one lookup.
//! 2. `state` (sync): guards the cached entry and the invalidation epoch.
//!    Never held across an await.
//!
//! `invalidate` bumps the epoch under `state`. A query that started before the
//! bump finds a different epoch when it returns and throws its answer away, so
//! an invalidation is never overwritten by an in-flight lookup.

use super::TopologyServer;
use crate::error::{Error, Result};
use crate::metrics::WorkerMetrics;
use crate::types::{ShardTarget, TabletEndpoint, TabletRole};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// The resolved master of one shard.
///
/// Entries are replaced on re-resolution, never mutated.
#[derive(Debug, Clone)]
pub struct ResolutionCacheEntry {
    pub target: ShardTarget,
    pub endpoint: TabletEndpoint,
    pub resolved_at_generation: u64,
    pub resolved_at: Instant,
}

#[derive(Debug, Default)]
struct SlotState {
    entry: Option<Arc<ResolutionCacheEntry>>,
    epoch: u64,
}

#[derive(Debug, Default)]
struct ShardSlot {
    state: Mutex<SlotState>,
    query: tokio::sync::Mutex<()>,
}

/// Resolves and caches the current master of destination shards.
#[derive(Debug)]
pub struct TopologyResolver {
    topology: Arc<dyn TopologyServer>,
    metrics: Arc<WorkerMetrics>,
    slots: DashMap<ShardTarget, Arc<ShardSlot>>,
    cancel: CancellationToken,
}

impl TopologyResolver {
    /// Create a resolver. Outstanding queries abort when `cancel` fires.
    pub fn new(
        topology: Arc<dyn TopologyServer>,
        metrics: Arc<WorkerMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            topology,
            metrics,
            slots: DashMap::new(),
            cancel,
        }
    }

    fn slot(&self, target: &ShardTarget) -> Arc<ShardSlot> {
        if let Some(slot) = self.slots.get(target) {
            return Arc::clone(slot.value());
        }
        Arc::clone(
            self.slots
                .entry(target.clone())
                .or_insert_with(|| Arc::new(ShardSlot::default()))
                .value(),
        )
    }

    /// The live cache entry for `target`, if any.
    pub fn cached(&self, target: &ShardTarget) -> Option<Arc<ResolutionCacheEntry>> {
        self.slots
            .get(target)
            .and_then(|slot| slot.state.lock().entry.clone())
    }

    /// Current master endpoint of `target`.
    ///
    /// Served from the cache unless the entry was invalidated.
    pub async fn resolve(&self, target: &ShardTarget) -> Result<TabletEndpoint> {
        Ok(self.resolve_entry(target).await?.endpoint.clone())
    }

    /// Like [`resolve`](Self::resolve), returning the whole cache entry.
    pub async fn resolve_entry(&self, target: &ShardTarget) -> Result<Arc<ResolutionCacheEntry>> {
        let slot = self.slot(target);
        let cached = slot.state.lock().entry.clone();
        if let Some(entry) = cached {
            return Ok(entry);
        }

        self.metrics.record_resolve_attempt(target);

        loop {
            let _query = tokio::select! {
                guard = slot.query.lock() => guard,
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            };

            let epoch = {
                let state = slot.state.lock();
                if let Some(entry) = &state.entry {
                    tracing::debug!(
                        shard = %target,
                        generation = entry.resolved_at_generation,
                        "Reusing master resolved by a concurrent writer"
                    );
                    return Ok(Arc::clone(entry));
                }
                state.epoch
            };

            let result = tokio::select! {
                result = self.topology.get_shard_master(target) => result,
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            };
            self.metrics.record_resolve_returned(target);

            let endpoint = result?;
            if endpoint.role != TabletRole::Master {
                return Err(Error::topology_unavailable(
                    target,
                    format!("topology returned {} with role {:?}", endpoint.alias, endpoint.role),
                ));
            }

            let mut state = slot.state.lock();
            if state.epoch != epoch {
                tracing::debug!(
                    shard = %target,
                    alias = %endpoint.alias,
                    "Shard invalidated during lookup, resolving again"
                );
                self.metrics.record_resolve_attempt(target);
                continue;
            }

            let entry = Arc::new(ResolutionCacheEntry {
                target: target.clone(),
                resolved_at_generation: endpoint.topology_generation,
                endpoint,
                resolved_at: Instant::now(),
            });
            state.entry = Some(Arc::clone(&entry));

            tracing::info!(
                shard = %target,
                alias = %entry.endpoint.alias,
                addr = %entry.endpoint.address,
                generation = entry.resolved_at_generation,
                "Resolved destination master"
            );
            return Ok(entry);
        }
    }

    /// Drop the cached entry so the next resolve queries the topology.
    pub fn invalidate(&self, target: &ShardTarget) {
        let slot = self.slot(target);
        let mut state = slot.state.lock();
        state.epoch += 1;
        if let Some(old) = state.entry.take() {
            tracing::info!(
                shard = %target,
                alias = %old.endpoint.alias,
                generation = old.resolved_at_generation,
                "Invalidated destination master"
            );
        }
    }

    /// Invalidate only if the cache still holds a master at or below `generation`.
    ///
    /// A writer that failed against an old master must not throw away a newer
    /// entry another writer already resolved. Returns true if it invalidated.
    pub fn invalidate_stale(&self, target: &ShardTarget, generation: u64) -> bool {
        let slot = self.slot(target);
        let mut state = slot.state.lock();
        let newer = matches!(
            &state.entry,
            Some(entry) if entry.resolved_at_generation > generation
        );
        if newer {
            return false;
        }
        state.epoch += 1;
        if let Some(old) = state.entry.take() {
            tracing::info!(
                shard = %target,
                alias = %old.endpoint.alias,
                generation = old.resolved_at_generation,
                "Invalidated stale destination master"
            );
        }
        true
    }

    /// Number of shards with a live entry.
    pub fn cached_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.value().state.lock().entry.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TabletAlias;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Topology answering from a scripted queue, optionally blocking until released.
    #[derive(Debug, Default)]
    struct ScriptedTopology {
        answers: Mutex<VecDeque<Result<TabletEndpoint>>>,
        calls: AtomicU64,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedTopology {
        fn push(&self, answer: Result<TabletEndpoint>) {
            self.answers.lock().push_back(answer);
        }
    }

    #[async_trait::async_trait]
    impl TopologyServer for ScriptedTopology {
        async fn get_shard_master(&self, target: &ShardTarget) -> Result<TabletEndpoint> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.answers
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(Error::topology_unavailable(target, "no answer scripted")))
        }
    }

    fn endpoint(uid: u32, generation: u64) -> TabletEndpoint {
        TabletEndpoint {
            alias: TabletAlias::new("test_nj", uid),
            address: format!("127.0.0.1:{}", 15000 + uid).parse().unwrap(),
            role: TabletRole::Master,
            topology_generation: generation,
        }
    }

    fn target() -> ShardTarget {
        ShardTarget::parse("test_keyspace", "-80").unwrap()
    }

    fn resolver(topology: Arc<ScriptedTopology>) -> (TopologyResolver, Arc<WorkerMetrics>) {
        let metrics = Arc::new(WorkerMetrics::new());
        let r = TopologyResolver::new(topology, Arc::clone(&metrics), CancellationToken::new());
        (r, metrics)
    }

    #[tokio::test]
    async fn test_resolve_caches_until_invalidated() {
        let topo = Arc::new(ScriptedTopology::default());
        topo.push(Ok(endpoint(1, 1)));
        topo.push(Ok(endpoint(2, 2)));
        let (resolver, metrics) = resolver(Arc::clone(&topo));
        let t = target();

        assert_eq!(resolver.resolve(&t).await.unwrap().alias.uid, 1);
        assert_eq!(resolver.resolve(&t).await.unwrap().alias.uid, 1);
        assert_eq!(topo.calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.attempted_resolves.get(), 1);
        assert_eq!(metrics.actual_resolves.get(), 1);

        resolver.invalidate(&t);
        assert!(resolver.cached(&t).is_none());

        let entry = resolver.resolve_entry(&t).await.unwrap();
        assert_eq!(entry.endpoint.alias.uid, 2);
        assert_eq!(entry.resolved_at_generation, 2);
        assert_eq!(metrics.attempted_resolves.get(), 2);
        assert_eq!(metrics.actual_resolves.get(), 2);
    }

    #[tokio::test]
    async fn test_failed_lookup_counts_as_returned() {
        let topo = Arc::new(ScriptedTopology::default());
        topo.push(Err(Error::topology_unavailable(&target(), "down")));
        let (resolver, metrics) = resolver(Arc::clone(&topo));

        let err = resolver.resolve(&target()).await.unwrap_err();
        assert!(matches!(err, Error::TopologyUnavailable { .. }));
        assert_eq!(metrics.actual_resolves.get(), 1);
        assert!(resolver.cached(&target()).is_none());
    }

    #[tokio::test]
    async fn test_non_master_answer_rejected() {
        let topo = Arc::new(ScriptedTopology::default());
        let mut replica = endpoint(3, 1);
        replica.role = TabletRole::Replica;
        topo.push(Ok(replica));
        let (resolver, _) = resolver(topo);

        assert!(resolver.resolve(&target()).await.is_err());
    }

    #[tokio::test]
    async fn test_invalidate_stale_keeps_newer_entry() {
        let topo = Arc::new(ScriptedTopology::default());
        topo.push(Ok(endpoint(2, 5)));
        let (resolver, _) = resolver(topo);
        let t = target();
        resolver.resolve(&t).await.unwrap();

        assert!(!resolver.invalidate_stale(&t, 4));
        assert_eq!(resolver.cached_count(), 1);

        assert!(resolver.invalidate_stale(&t, 5));
        assert_eq!(resolver.cached_count(), 0);
    }

    #[tokio::test]
    async fn test_invalidation_wins_over_inflight_lookup() {
        let gate = Arc::new(Notify::new());
        let topo = Arc::new(ScriptedTopology {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        topo.push(Ok(endpoint(1, 1)));
        topo.push(Ok(endpoint(2, 2)));
        let (resolver, metrics) = resolver(Arc::clone(&topo));
        let resolver = Arc::new(resolver);
        let t = target();

        let r = Arc::clone(&resolver);
        let t2 = t.clone();
        let lookup = tokio::spawn(async move { r.resolve(&t2).await });

        // Wait until the first query is in flight, then invalidate under it.
        while topo.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        resolver.invalidate(&t);

        // Release the stale answer, then the second query.
        gate.notify_one();
        while topo.calls.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        gate.notify_one();

        let resolved = lookup.await.unwrap().unwrap();
        assert_eq!(resolved.alias.uid, 2);
        // The forced re-resolve is an attempt of its own.
        assert_eq!(metrics.attempted_resolves.get(), 2);
        assert_eq!(metrics.actual_resolves.get(), 2);
        assert!(metrics.attempted_resolves.get() >= metrics.actual_resolves.get());
    }

    #[tokio::test]
    async fn test_concurrent_misses_coalesce() {
        let gate = Arc::new(Notify::new());
        let topo = Arc::new(ScriptedTopology {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        topo.push(Ok(endpoint(1, 1)));
        let (resolver, metrics) = resolver(Arc::clone(&topo));
        let resolver = Arc::new(resolver);

        let mut handles = Vec::new();
        for _ in 0..3 {
            let r = Arc::clone(&resolver);
            handles.push(tokio::spawn(async move { r.resolve(&target()).await }));
        }
        while metrics.attempted_resolves.get() < 3 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        gate.notify_one();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().alias.uid, 1);
        }
        assert_eq!(topo.calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.attempted_resolves.get(), 3);
        assert_eq!(metrics.actual_resolves.get(), 1);
    }

    #[tokio::test]
    async fn test_cancel_aborts_lookup() {
        let gate = Arc::new(Notify::new());
        let topo = Arc::new(ScriptedTopology {
            gate: Some(gate),
            ..Default::default()
        });
        let metrics = Arc::new(WorkerMetrics::new());
        let cancel = CancellationToken::new();
        let resolver = TopologyResolver::new(topo, metrics, cancel.clone());

        cancel.cancel();
        let err = resolver.resolve(&target()).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
