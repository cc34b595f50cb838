//! In-Memory Node Allocator
//!
//! Tracks storage nodes with their capacity and derives the per-tier
//! capacity snapshots the mappers weigh.
//!
//! ```text
//! nodes (capacity, used) ──refresh_tiering_alloc──▶ TieringStatus snapshot
//!                        ──allocate_node──────────▶ roomiest eligible node
//! ```
//!
//! Snapshots are only recomputed on refresh, so a caller sees the capacity
//! as of its last refresh even while blocks are being written.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::domain::ids::{HostId, NodeId, PoolId, TieringId};
use crate::domain::ports::NodeAllocator;
use crate::domain::system::{
    MirrorStorage, NodeInfo, NodeType, Pool, PoolStatus, TierStatus, Tiering, TieringStatus,
};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct NodeState {
    info: NodeInfo,
    capacity: u64,
    used: u64,
}

impl NodeState {
    fn free(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }

    fn can_allocate(&self) -> bool {
        self.info.writable && self.free() > 0
    }
}

#[derive(Debug, Clone)]
struct Snapshot {
    revision: u64,
    taken_at: Instant,
    status: TieringStatus,
}

#[derive(Debug, Default)]
pub struct InMemoryNodeAllocator {
    nodes: RwLock<HashMap<NodeId, NodeState>>,
    snapshots: RwLock<HashMap<TieringId, Snapshot>>,
    /// Non-forced refreshes within this window reuse the last snapshot
    refresh_window: Duration,
    refreshes: AtomicU64,
}

impl InMemoryNodeAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_refresh_window(mut self, window: Duration) -> Self {
        self.refresh_window = window;
        self
    }

    /// Register a node of `pool` with `capacity` bytes and return its info.
    pub fn add_node(
        &self,
        name: impl Into<String>,
        pool: &Pool,
        host_id: HostId,
        node_type: NodeType,
        capacity: u64,
    ) -> NodeInfo {
        let name = name.into();
        let info = NodeInfo {
            id: NodeId::new(),
            address: format!("mem://{}", name),
            name,
            host_id,
            pool_id: pool.id,
            node_type,
            readable: true,
            writable: true,
        };
        self.nodes.write().insert(
            info.id,
            NodeState {
                info: info.clone(),
                capacity,
                used: 0,
            },
        );
        info
    }

    /// Node goes offline: neither readable nor writable.
    pub fn fail_node(&self, id: &NodeId) {
        self.set_flags(id, false, false);
    }

    pub fn set_flags(&self, id: &NodeId, readable: bool, writable: bool) {
        if let Some(node) = self.nodes.write().get_mut(id) {
            node.info.readable = readable;
            node.info.writable = writable;
        }
    }

    /// Forget a node entirely; its blocks become orphans.
    pub fn remove_node(&self, id: &NodeId) {
        self.nodes.write().remove(id);
    }

    /// Move a node to another pool, misplacing the blocks it holds.
    pub fn move_node(&self, id: &NodeId, pool: &Pool) {
        if let Some(node) = self.nodes.write().get_mut(id) {
            node.info.pool_id = pool.id;
        }
    }

    pub fn set_capacity(&self, id: &NodeId, capacity: u64) {
        if let Some(node) = self.nodes.write().get_mut(id) {
            node.capacity = capacity;
        }
    }

    /// Account `size` bytes written to a node. Fails when it does not fit.
    pub fn consume(&self, id: &NodeId, size: u64) -> Result<()> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| Error::Internal(format!("node {} not found", id)))?;
        if node.free() < size {
            return Err(Error::Internal(format!("node {} is full", node.info.name)));
        }
        node.used += size;
        Ok(())
    }

    pub fn release(&self, id: &NodeId, size: u64) {
        if let Some(node) = self.nodes.write().get_mut(id) {
            node.used = node.used.saturating_sub(size);
        }
    }

    pub fn node(&self, id: &NodeId) -> Option<NodeInfo> {
        self.nodes.read().get(id).map(|n| n.info.clone())
    }

    pub fn used(&self, id: &NodeId) -> u64 {
        self.nodes.read().get(id).map(|n| n.used).unwrap_or(0)
    }

    pub fn free(&self, id: &NodeId) -> u64 {
        self.nodes.read().get(id).map(|n| n.free()).unwrap_or(0)
    }

    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    fn compute_status(&self, tiering: &Tiering) -> TieringStatus {
        let nodes = self.nodes.read();
        let free_in_pool = |pool: &Pool| -> u64 {
            nodes
                .values()
                .filter(|n| n.info.pool_id == pool.id && n.info.writable)
                .map(NodeState::free)
                .sum()
        };

        tiering
            .tiers
            .iter()
            .map(|order| {
                let tier = &order.tier;
                let pools = tier
                    .pools()
                    .map(|pool| {
                        let valid = nodes
                            .values()
                            .any(|n| n.info.pool_id == pool.id && n.can_allocate());
                        (
                            pool.id,
                            PoolStatus {
                                valid_for_allocation: valid,
                            },
                        )
                    })
                    .collect();

                let mirrors_storage = tier
                    .mirrors
                    .iter()
                    .map(|mirror| {
                        let mut storage = MirrorStorage::default();
                        for pool in &mirror.pools {
                            let free = free_in_pool(pool);
                            if pool.has_redundancy() {
                                storage.redundant_free += free;
                            } else {
                                storage.regular_free += free;
                            }
                        }
                        storage.free = storage.regular_free + storage.redundant_free;
                        storage
                    })
                    .collect();

                (
                    tier.id,
                    TierStatus {
                        pools,
                        mirrors_storage,
                    },
                )
            })
            .collect()
    }

    fn pick(
        &self,
        pools: &[PoolId],
        avoid_nodes: &HashSet<NodeId>,
        avoid_hosts: Option<&HashSet<HostId>>,
    ) -> Option<NodeInfo> {
        self.nodes
            .read()
            .values()
            .filter(|n| pools.contains(&n.info.pool_id) && n.can_allocate())
            .filter(|n| !avoid_nodes.contains(&n.info.id))
            .filter(|n| avoid_hosts.map_or(true, |hosts| !hosts.contains(&n.info.host_id)))
            .max_by(|a, b| a.free().cmp(&b.free()).then_with(|| b.info.id.cmp(&a.info.id)))
            .map(|n| n.info.clone())
    }
}

#[async_trait]
impl NodeAllocator for InMemoryNodeAllocator {
    async fn refresh_tiering_alloc(&self, tiering: &Tiering, force: bool) -> Result<()> {
        if !force {
            let fresh = self.snapshots.read().get(&tiering.id).is_some_and(|s| {
                s.revision == tiering.revision && s.taken_at.elapsed() < self.refresh_window
            });
            if fresh {
                trace!(tiering = %tiering.name, "Allocation snapshot still fresh");
                return Ok(());
            }
        }

        let status = self.compute_status(tiering);
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        debug!(tiering = %tiering.name, force, tiers = status.len(), "Refreshed tiering allocation");
        self.snapshots.write().insert(
            tiering.id,
            Snapshot {
                revision: tiering.revision,
                taken_at: Instant::now(),
                status,
            },
        );
        Ok(())
    }

    fn tiering_status(&self, tiering: &Tiering) -> TieringStatus {
        self.snapshots
            .read()
            .get(&tiering.id)
            .map(|s| s.status.clone())
            .unwrap_or_default()
    }

    /// Roomiest writable node outside the avoid lists. Host anti-affinity is
    /// dropped when it leaves no candidate; node anti-affinity never is.
    fn allocate_node(
        &self,
        pools: &[PoolId],
        avoid_nodes: &HashSet<NodeId>,
        avoid_hosts: &HashSet<HostId>,
    ) -> Option<NodeInfo> {
        self.pick(pools, avoid_nodes, Some(avoid_hosts)).or_else(|| {
            let node = self.pick(pools, avoid_nodes, None)?;
            debug!(node = %node.name, "Allocated on an avoided host");
            Some(node)
        })
    }

    async fn nodes_by_ids(&self, ids: &[NodeId]) -> Result<HashMap<NodeId, NodeInfo>> {
        let nodes = self.nodes.read();
        Ok(ids
            .iter()
            .filter_map(|id| nodes.get(id).map(|n| (*id, n.info.clone())))
            .collect())
    }
}
