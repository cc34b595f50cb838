//! System Configuration View
//!
//! Pools, mirrors, tiers and tiering policies as loaded from the system store,
//! plus the capacity snapshots the node allocator reports for them.
//!
//! ```text
//! Bucket ──▶ Tiering ──▶ [TierOrder] ──▶ Tier ──▶ [Mirror] ──▶ [Pool]
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{BucketId, HostId, MirrorId, NodeId, PoolId, TierId, TieringId};
use super::model::ChunkCoderConfig;

// =============================================================================
// Pools
// =============================================================================

/// Backing resource type of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// Plain pool of filesystem-backed storage nodes
    Hosts,
    /// Cloud-backed pool, inherently multi-copy
    Cloud,
    /// Internal database-backed pool, inherently multi-copy
    Mongo,
}

/// A uniform storage resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    pub name: String,
    pub kind: PoolKind,
    pub region: Option<String>,
}

impl Pool {
    pub fn new(name: impl Into<String>, kind: PoolKind) -> Self {
        Self {
            id: PoolId::new(),
            name: name.into(),
            kind,
            region: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// One block on a redundant pool satisfies any replica policy.
    pub fn has_redundancy(&self) -> bool {
        matches!(self.kind, PoolKind::Cloud | PoolKind::Mongo)
    }

    pub fn is_mongo(&self) -> bool {
        self.kind == PoolKind::Mongo
    }
}

// =============================================================================
// Tiers and Tiering Policies
// =============================================================================

/// A replica-set of pools inside a tier.
#[derive(Debug, Clone)]
pub struct Mirror {
    pub id: MirrorId,
    pub pools: Vec<Arc<Pool>>,
}

impl Mirror {
    pub fn new(pools: Vec<Arc<Pool>>) -> Self {
        Self {
            id: MirrorId::new(),
            pools,
        }
    }
}

/// An ordered storage class with its own coding policy.
#[derive(Debug, Clone)]
pub struct Tier {
    pub id: TierId,
    pub name: String,
    pub coder: ChunkCoderConfig,
    pub mirrors: Vec<Mirror>,
}

impl Tier {
    pub fn new(name: impl Into<String>, coder: ChunkCoderConfig, mirrors: Vec<Mirror>) -> Self {
        Self {
            id: TierId::new(),
            name: name.into(),
            coder,
            mirrors,
        }
    }

    /// All pools of all mirrors.
    pub fn pools(&self) -> impl Iterator<Item = &Arc<Pool>> {
        self.mirrors.iter().flat_map(|m| m.pools.iter())
    }
}

/// Position of a tier inside a tiering policy.
#[derive(Debug, Clone)]
pub struct TierOrder {
    pub tier: Arc<Tier>,
    pub order: u32,
    pub spillover: bool,
    pub disabled: bool,
}

impl TierOrder {
    pub fn new(tier: Arc<Tier>, order: u32) -> Self {
        Self {
            tier,
            order,
            spillover: false,
            disabled: false,
        }
    }
}

/// A bucket's ordered list of tiers.
///
/// `revision` is bumped by the system store on every policy change and is
/// what the mapper cache compares to decide whether to rebuild.
#[derive(Debug, Clone)]
pub struct Tiering {
    pub id: TieringId,
    pub name: String,
    pub revision: u64,
    pub tiers: Vec<TierOrder>,
}

impl Tiering {
    pub fn new(name: impl Into<String>, tiers: Vec<TierOrder>) -> Self {
        Self {
            id: TieringId::new(),
            name: name.into(),
            revision: 1,
            tiers,
        }
    }

    pub fn tier_order(&self, tier_id: &TierId) -> Option<&TierOrder> {
        self.tiers.iter().find(|t| &t.tier.id == tier_id)
    }
}

/// A bucket and the tiering policy its chunks follow.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub id: BucketId,
    pub name: String,
    pub tiering: Arc<Tiering>,
    pub deleted: bool,
    /// Last time the storage stats aggregator touched this bucket
    pub stats_last_update: Option<DateTime<Utc>>,
}

impl Bucket {
    pub fn new(name: impl Into<String>, tiering: Arc<Tiering>) -> Self {
        Self {
            id: BucketId::new(),
            name: name.into(),
            tiering,
            deleted: false,
            stats_last_update: None,
        }
    }
}

// =============================================================================
// Nodes
// =============================================================================

/// Agent type of a storage node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    BlockStoreFs,
    BlockStoreCloud,
    BlockStoreMongo,
}

impl NodeType {
    /// Filesystem nodes have a hard local capacity and take part in
    /// anti-affinity and preallocation.
    pub fn is_capacity_limited(&self) -> bool {
        matches!(self, NodeType::BlockStoreFs)
    }
}

/// Storage node as seen by the node allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub name: String,
    pub host_id: HostId,
    pub pool_id: PoolId,
    pub address: String,
    pub node_type: NodeType,
    pub readable: bool,
    pub writable: bool,
}

// =============================================================================
// Capacity Snapshots
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub valid_for_allocation: bool,
}

/// Free space of one mirror, split by pool redundancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorStorage {
    pub free: u64,
    pub regular_free: u64,
    pub redundant_free: u64,
}

/// Capacity snapshot of one tier; `mirrors_storage` is indexed like `Tier::mirrors`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierStatus {
    pub pools: HashMap<PoolId, PoolStatus>,
    pub mirrors_storage: Vec<MirrorStorage>,
}

impl TierStatus {
    /// Largest free space of any mirror.
    pub fn max_mirror_free(&self) -> u64 {
        self.mirrors_storage
            .iter()
            .map(|s| s.free)
            .max()
            .unwrap_or(0)
    }
}

pub type TieringStatus = HashMap<TierId, TierStatus>;

/// Placement hint of the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationInfo {
    pub node_id: Option<NodeId>,
    pub host_id: Option<HostId>,
    pub pool_id: Option<PoolId>,
    pub region: Option<String>,
}

impl LocationInfo {
    /// True when the pool is in the caller's region or is the caller's pool.
    pub fn is_local_pool(&self, pool: &Pool) -> bool {
        let same_region = matches!(
            (&self.region, &pool.region),
            (Some(mine), Some(theirs)) if mine == theirs
        );
        same_region || self.pool_id == Some(pool.id)
    }
}
