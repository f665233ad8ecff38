//! Testing utilities for the resharding worker.
//!
//! [`MemoryCluster`] wires an in-memory topology, tablet fleet, source row
//! stream and lifecycle together, so scenarios can inject reparents, topology
//! outages and schema drift while a real copy run is in progress.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       MemoryCluster                          │
//! │                                                              │
//! │   MemoryTopology ──┐                                         │
//! │                    ├── shard table: tablets, generation, rows│
//! │   MemoryTabletFleet┘                                         │
//! │                                                              │
//! │   MemoryRowSource ─── batches, optional hold                 │
//! │   MemoryLifecycle ─── schema fingerprints, recorded events   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let cluster = MemoryCluster::new("test_nj");
//! cluster.add_shard(&source, 100);
//! cluster.add_shard(&left, 200);
//! cluster.add_shard(&right, 300);
//! cluster.load_source(&source, seed_rows(3000), 100);
//!
//! let release = cluster.hold_source_after(3);
//! // start the copy, then
//! cluster.reparent(&left, 201)?;
//! release.notify_one();
//! ```

mod memory;
mod utils;

mod copy_e2e_tests;

pub use memory::{
    LifecycleEvent, MemoryCluster, MemoryLifecycle, MemoryRowSource, MemoryTabletFleet,
    MemoryTopology,
};
#[cfg(test)]
pub use utils::init_tracing;
pub use utils::seed_rows;
