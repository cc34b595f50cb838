//! Property-Based Tests for the Mapping Engine
//!
//! # Test Properties
//!
//! 1. **Frag completeness**: every data/parity frag ends up with R replicas,
//!    counting pending allocations
//! 2. **No-op stability**: a fully replicated chunk maps to nothing, twice
//! 3. **Deletion safety**: deletions never empty a frag and never leave
//!    fewer than `data_frags` blocks

#![cfg(test)]

use std::sync::Arc;

use proptest::prelude::*;

use super::{map_chunk, TieringMapperCache};
use crate::config::MapperConfig;
use crate::domain::ids::{BucketId, ChunkId, HostId, NodeId};
use crate::domain::model::{Block, Chunk, ChunkCoderConfig, FragIndex};
use crate::domain::system::{
    Mirror, MirrorStorage, NodeInfo, NodeType, Pool, PoolKind, PoolStatus, Tier, TierOrder,
    TierStatus, Tiering, TieringStatus,
};

const GIB: u64 = 1024 * 1024 * 1024;

// =============================================================================
// Fixtures
// =============================================================================

struct Cluster {
    tiering: Tiering,
    tier: Arc<Tier>,
    pools: Vec<Arc<Pool>>,
    status: TieringStatus,
}

fn cluster(coder: ChunkCoderConfig, num_pools: usize) -> Cluster {
    let pools: Vec<Arc<Pool>> = (0..num_pools)
        .map(|i| Arc::new(Pool::new(format!("pool-{}", i), PoolKind::Hosts)))
        .collect();
    let tier = Arc::new(Tier::new("tier", coder, vec![Mirror::new(pools.clone())]));
    let tiering = Tiering::new("policy", vec![TierOrder::new(tier.clone(), 0)]);
    let status = [(
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
    )]
    .into_iter()
    .collect();
    Cluster {
        tiering,
        tier,
        pools,
        status,
    }
}

fn block_on(pool: &Pool, accessible: bool, age_secs: i64) -> Block {
    let node = NodeInfo {
        id: NodeId::new(),
        name: "node".to_string(),
        host_id: HostId::new(),
        pool_id: pool.id,
        address: "addr".to_string(),
        node_type: NodeType::BlockStoreFs,
        readable: accessible,
        writable: true,
    };
    let mut block = Block::allocate(&node, 1);
    block.created_at = chrono::Utc::now() - chrono::Duration::seconds(age_secs);
    block.is_accessible = accessible;
    block
}

// =============================================================================
// Property Strategies
// =============================================================================

/// (data_frags, parity_frags, replicas)
fn coder_strategy() -> impl Strategy<Value = ChunkCoderConfig> {
    (1u32..=4, 0u32..=2, 1u32..=3).prop_map(|(d, p, r)| ChunkCoderConfig::erasure(d, p, r))
}

/// Per frag: a list of (pool index, accessible, age) block specs.
fn blocks_strategy() -> impl Strategy<Value = Vec<Vec<(usize, bool, i64)>>> {
    prop::collection::vec(
        prop::collection::vec((0usize..3, any::<bool>(), 0i64..10_000), 0..5),
        6,
    )
}

fn existing_chunk(c: &Cluster, coder: ChunkCoderConfig, specs: &[Vec<(usize, bool, i64)>]) -> Chunk {
    let mut chunk = Chunk::new(BucketId::new(), coder, 100, 10);
    chunk.id = Some(ChunkId::new());
    chunk.tier_id = Some(c.tier.id);
    for (frag, frag_specs) in chunk.frags.iter_mut().zip(specs) {
        for &(pool, accessible, age) in frag_specs {
            frag.blocks
                .push(block_on(&c.pools[pool % c.pools.len()], accessible, age));
        }
    }
    chunk
}

// =============================================================================
// Mapping Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: kept replicas plus pending allocations reach R for every frag.
    #[test]
    fn prop_frag_completeness(
        coder in coder_strategy(),
        num_pools in 1usize..=3,
        specs in blocks_strategy(),
    ) {
        let c = cluster(coder, num_pools);
        let cache = TieringMapperCache::new(MapperConfig::default());
        let mut chunk = existing_chunk(&c, coder, &specs);

        map_chunk(&cache, &mut chunk, &c.tier.id, &c.tiering, &c.status, None)?;

        for frag in &chunk.frags {
            if !matches!(frag.index, FragIndex::Data(_) | FragIndex::Parity(_)) {
                continue;
            }
            let accessible = frag.blocks.iter().filter(|b| b.is_accessible).count() as u32;
            if accessible >= coder.replicas {
                prop_assert!(frag.allocations.is_empty());
            } else {
                prop_assert_eq!(frag.allocations.len() as u32, coder.replicas - accessible);
            }
        }
    }

    /// Property: a chunk holding exactly R accessible replicas per frag is left alone.
    #[test]
    fn prop_noop_stability(
        coder in coder_strategy(),
        num_pools in 1usize..=3,
    ) {
        let c = cluster(coder, num_pools);
        let cache = TieringMapperCache::new(MapperConfig::default());
        let specs: Vec<Vec<(usize, bool, i64)>> = (0..coder.total_frags())
            .map(|_| (0..coder.replicas as usize).map(|i| (i, true, 10)).collect())
            .collect();
        let mut chunk = existing_chunk(&c, coder, &specs);

        for _ in 0..2 {
            chunk.reset_mapping();
            map_chunk(&cache, &mut chunk, &c.tier.id, &c.tiering, &c.status, None)?;
            prop_assert_eq!(chunk.num_allocations(), 0);
            prop_assert_eq!(chunk.num_deletions(), 0);
            prop_assert!(!chunk.has_future_deletions());
        }
    }

    /// Property: deletions never empty a frag and keep at least data_frags blocks.
    #[test]
    fn prop_deletion_safety(
        coder in coder_strategy(),
        num_pools in 1usize..=3,
        specs in blocks_strategy(),
    ) {
        let c = cluster(coder, num_pools);
        let cache = TieringMapperCache::new(MapperConfig::default());
        let mut chunk = existing_chunk(&c, coder, &specs);

        map_chunk(&cache, &mut chunk, &c.tier.id, &c.tiering, &c.status, None)?;

        let total: usize = chunk.frags.iter().map(|f| f.blocks.len()).sum();
        let deleted = chunk.num_deletions();
        if deleted > 0 {
            prop_assert!(total - deleted >= coder.data_frags as usize);
            for frag in &chunk.frags {
                if !frag.blocks.is_empty() {
                    prop_assert!(frag.deletions.len() < frag.blocks.len());
                }
            }
        }
    }
}
