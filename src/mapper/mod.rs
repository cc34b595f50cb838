//! Mapping Engine
//!
//! Pure placement decisions: given a chunk, a tiering policy and a capacity
//! snapshot, work out which blocks to keep, which to create and which to drop.
//!
//! # Architecture
//!
//! ```text
//! TieringMapperCache ──▶ TieringMapper ──▶ [TierMapper] ──▶ [MirrorMapper]
//!                         select tier       write mirror      per-frag decision
//!                                           deletion guard
//! ```
//!
//! - **MirrorMapper** (`mirror.rs`): replica accounting per fragment
//! - **TierMapper** (`tier.rs`): mirror aggregation and safe deletions
//! - **TieringMapper** (`tiering.rs`): tier policy walk and write tier selection
//! - **TieringMapperCache** (`cache.rs`): mapper trees keyed by policy
//!
//! Nothing in here performs I/O. The orchestrator in [`crate::mapping`]
//! feeds fresh capacity snapshots in and commits the proposals.

pub mod cache;
pub mod mirror;
pub mod tier;
pub mod tiering;

#[cfg(test)]
mod proptest;

use std::sync::Arc;

pub use cache::{CacheStats, TieringMapperCache};
pub use mirror::{mirror_weight, MirrorMapper, MirrorStatus};
pub use tier::{DeletionRefusal, TierMapper, TierMapperStatus};
pub use tiering::{TieringMapper, TieringMapperStatus};

use crate::domain::ids::TierId;
use crate::domain::model::Chunk;
use crate::domain::system::{LocationInfo, Tier, Tiering, TieringStatus};
use crate::error::Result;

/// Map a chunk onto `tier_id` of the tiering policy.
///
/// Proposals from a previous pass must have been cleared by the caller.
pub fn map_chunk(
    cache: &TieringMapperCache,
    chunk: &mut Chunk,
    tier_id: &TierId,
    tiering: &Tiering,
    status: &TieringStatus,
    location: Option<&LocationInfo>,
) -> Result<Option<DeletionRefusal>> {
    let mapper = cache.get(tiering);
    let mapper_status = mapper.update_status(status, location, cache.config());
    mapper.map_tiering(&mapper_status, chunk, tier_id)
}

/// Tier new data should be written to, starting at `start_order`.
pub fn select_tier_for_write(
    cache: &TieringMapperCache,
    tiering: &Tiering,
    status: &TieringStatus,
    start_order: Option<u32>,
) -> Option<Arc<Tier>> {
    let mapper = cache.get(tiering);
    let mapper_status = mapper.update_status(status, None, cache.config());
    mapper
        .select_tier_for_write(&mapper_status, start_order)
        .map(|t| t.tier().clone())
}

/// A mapped chunk may serve as a dedup target only when it sits in a live
/// tier, is readable and needs no new blocks.
pub fn is_chunk_good_for_dedup(chunk: &Chunk) -> bool {
    chunk.tier_id.is_some() && chunk.is_accessible() && !chunk.has_allocations()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapperConfig;
    use crate::domain::ids::{BucketId, ChunkId, HostId, NodeId};
    use crate::domain::model::{Block, ChunkCoderConfig};
    use crate::domain::system::{
        Mirror, MirrorStorage, NodeInfo, NodeType, Pool, PoolKind, PoolStatus, TierOrder,
        TierStatus,
    };

    const GIB: u64 = 1024 * 1024 * 1024;

    struct Fixture {
        tiering: Tiering,
        tier: Arc<Tier>,
        pools: Vec<Arc<Pool>>,
        status: TieringStatus,
    }

    fn fixture(coder: ChunkCoderConfig, pools: usize) -> Fixture {
        let pools: Vec<Arc<Pool>> = (0..pools)
            .map(|i| Arc::new(Pool::new(format!("pool-{}", i), PoolKind::Hosts)))
            .collect();
        let tier = Arc::new(Tier::new("hot", coder, vec![Mirror::new(pools.clone())]));
        let tiering = Tiering::new("policy", vec![TierOrder::new(tier.clone(), 0)]);
        let mut status = TieringStatus::new();
        status.insert(
            tier.id,
            TierStatus {
                pools: pools
                    .iter()
                    .map(|p| {
                        (
                            p.id,
                            PoolStatus {
                                valid_for_allocation: true,
                            },
                        )
                    })
                    .collect(),
                mirrors_storage: vec![MirrorStorage {
                    free: GIB,
                    regular_free: GIB,
                    redundant_free: 0,
                }],
            },
        );
        Fixture {
            tiering,
            tier,
            pools,
            status,
        }
    }

    fn block(pool: &Pool, age_secs: i64) -> Block {
        let node = NodeInfo {
            id: NodeId::new(),
            name: "n".to_string(),
            host_id: HostId::new(),
            pool_id: pool.id,
            address: "addr".to_string(),
            node_type: NodeType::BlockStoreFs,
            readable: true,
            writable: true,
        };
        let mut block = Block::allocate(&node, 10);
        block.created_at = chrono::Utc::now() - chrono::Duration::seconds(age_secs);
        block.is_accessible = true;
        block
    }

    #[test]
    fn test_new_erasure_chunk_one_allocation_per_frag() {
        let coder = ChunkCoderConfig::erasure(2, 1, 1);
        let f = fixture(coder, 2);
        let cache = TieringMapperCache::new(MapperConfig::default());

        let mut chunk = Chunk::new(BucketId::new(), coder, 20, 10);
        let refusal =
            map_chunk(&cache, &mut chunk, &f.tier.id, &f.tiering, &f.status, None).unwrap();
        assert!(refusal.is_none());
        assert_eq!(chunk.frags.len(), 3);
        for frag in &chunk.frags {
            assert_eq!(frag.allocations.len(), 1);
            assert!(frag.deletions.is_empty());
        }
    }

    #[test]
    fn test_surplus_replica_older_block_deleted() {
        let coder = ChunkCoderConfig::replicated(1);
        let f = fixture(coder, 2);
        let cache = TieringMapperCache::new(MapperConfig::default());

        let older = block(&f.pools[0], 600);
        let newer = block(&f.pools[1], 5);
        let mut chunk = Chunk::new(BucketId::new(), coder, 10, 10);
        chunk.id = Some(ChunkId::new());
        chunk.tier_id = Some(f.tier.id);
        chunk.frags[0].blocks = vec![older.clone(), newer];

        map_chunk(&cache, &mut chunk, &f.tier.id, &f.tiering, &f.status, None).unwrap();
        assert_eq!(chunk.num_allocations(), 0);
        assert_eq!(chunk.frags[0].deletions.len(), 1);
        assert_eq!(chunk.frags[0].deletions[0].id, older.id);
        assert!(is_chunk_good_for_dedup(&chunk));
    }

    #[test]
    fn test_select_tier_for_write_returns_tier() {
        let f = fixture(ChunkCoderConfig::default(), 1);
        let cache = TieringMapperCache::new(MapperConfig::default());
        let tier = select_tier_for_write(&cache, &f.tiering, &f.status, None).unwrap();
        assert_eq!(tier.id, f.tier.id);
        assert!(select_tier_for_write(&cache, &f.tiering, &f.status, Some(1)).is_none());
    }

    #[test]
    fn test_not_good_for_dedup_without_tier_or_with_allocations() {
        let coder = ChunkCoderConfig::replicated(1);
        let f = fixture(coder, 1);
        let cache = TieringMapperCache::new(MapperConfig::default());

        let mut chunk = Chunk::new(BucketId::new(), coder, 10, 10);
        chunk.id = Some(ChunkId::new());
        chunk.frags[0].blocks.push(block(&f.pools[0], 1));
        assert!(!is_chunk_good_for_dedup(&chunk));

        chunk.tier_id = Some(f.tier.id);
        assert!(is_chunk_good_for_dedup(&chunk));

        let mut degraded = Chunk::new(BucketId::new(), coder, 10, 10);
        degraded.id = Some(ChunkId::new());
        degraded.tier_id = Some(f.tier.id);
        map_chunk(&cache, &mut degraded, &f.tier.id, &f.tiering, &f.status, None).unwrap();
        assert!(degraded.has_allocations());
        assert!(!is_chunk_good_for_dedup(&degraded));
    }
}
