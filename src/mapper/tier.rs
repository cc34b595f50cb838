//! Tier Mapper
//!
//! Maps a chunk onto all mirrors of one tier and turns the blocks no mirror
//! kept into deletions, guarded so a chunk never loses readability.

use std::collections::HashSet;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::{error, trace};

use super::mirror::{MirrorMapper, MirrorStatus};
use crate::config::MapperConfig;
use crate::domain::ids::{BlockId, TierId};
use crate::domain::model::{Chunk, FragIndex};
use crate::domain::system::{LocationInfo, Tier, TierOrder, TierStatus};
use crate::error::{Error, Result};

/// Capacity-derived state of a tier for one mapping pass.
#[derive(Debug, Clone, Default)]
pub struct TierMapperStatus {
    pub mirrors: Vec<MirrorStatus>,
    /// Mirror that receives new chunks, by index
    pub write_mirror: Option<usize>,
    /// Every mirror has at least one pool valid for allocation
    pub online: bool,
    pub valid_for_allocation: bool,
    /// Free space of the roomiest mirror
    pub max_free: u64,
}

/// Unused blocks the deletion guard refused to drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionRefusal {
    pub tier: TierId,
    pub total_blocks: usize,
    pub used_blocks: usize,
    pub unused_blocks: usize,
    pub min_blocks: u32,
}

#[derive(Debug, Clone)]
pub struct TierMapper {
    tier: Arc<Tier>,
    order: u32,
    spillover: bool,
    mirror_mappers: Vec<MirrorMapper>,
}

impl TierMapper {
    pub fn new(tier_order: &TierOrder) -> Self {
        let tier = tier_order.tier.clone();
        let mirror_mappers = tier
            .mirrors
            .iter()
            .enumerate()
            .map(|(i, mirror)| MirrorMapper::new(mirror, tier.coder, i))
            .collect();
        Self {
            tier,
            order: tier_order.order,
            spillover: tier_order.spillover,
            mirror_mappers,
        }
    }

    pub fn tier(&self) -> &Arc<Tier> {
        &self.tier
    }

    pub fn tier_id(&self) -> TierId {
        self.tier.id
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    pub fn is_spillover(&self) -> bool {
        self.spillover
    }

    /// Weigh all mirrors and pick the write mirror.
    ///
    /// A tier without a capacity snapshot is treated as empty and offline.
    pub fn update_status(
        &self,
        tier_status: Option<&TierStatus>,
        location: Option<&LocationInfo>,
        config: &MapperConfig,
    ) -> TierMapperStatus {
        let empty = TierStatus::default();
        let tier_status = tier_status.unwrap_or(&empty);

        let mirrors: Vec<MirrorStatus> = self
            .mirror_mappers
            .iter()
            .map(|m| m.update_status(tier_status, location, config))
            .collect();

        let online = !mirrors.is_empty() && mirrors.iter().all(|m| m.has_online_pool);

        let write_mirror = mirrors.iter().map(|m| m.weight).max().and_then(|best| {
            let candidates: Vec<usize> = mirrors
                .iter()
                .enumerate()
                .filter(|(_, m)| m.weight == best)
                .map(|(i, _)| i)
                .collect();
            candidates.choose(&mut rand::thread_rng()).copied()
        });

        let max_free = tier_status.max_mirror_free();
        let valid_for_allocation = max_free > config.min_tier_free_threshold
            && max_free > config.max_tier_free_threshold;

        trace!(
            tier = %self.tier.name,
            online,
            valid_for_allocation,
            max_free,
            "TierMapper status updated"
        );

        TierMapperStatus {
            mirrors,
            write_mirror,
            online,
            valid_for_allocation,
            max_free,
        }
    }

    /// Map the chunk onto this tier.
    ///
    /// New chunks go to the write mirror only, existing chunks are mapped by
    /// every mirror. Returns the refusal when unused blocks were kept because
    /// dropping them would be unsafe.
    pub fn map_tier(
        &self,
        status: &TierMapperStatus,
        chunk: &mut Chunk,
    ) -> Result<Option<DeletionRefusal>> {
        let accessible = chunk.is_accessible();
        let mut in_use: HashSet<BlockId> = HashSet::new();

        if chunk.is_new() {
            let index = status.write_mirror.ok_or_else(|| {
                Error::Config(format!("tier {} has no mirrors", self.tier.name))
            })?;
            self.mirror_mappers[index].map_mirror(&status.mirrors[index], chunk, &mut in_use)?;
        } else {
            for (mapper, mirror_status) in self.mirror_mappers.iter().zip(&status.mirrors) {
                mapper.map_mirror(mirror_status, chunk, &mut in_use)?;
            }
        }

        let total_blocks: usize = chunk.frags.iter().map(|f| f.blocks.len()).sum();
        let unused_blocks = chunk
            .frags
            .iter()
            .flat_map(|f| f.blocks.iter())
            .filter(|b| !in_use.contains(&b.id))
            .count();
        if unused_blocks == 0 {
            return Ok(None);
        }

        if accessible && !chunk.has_allocations() {
            let min_blocks = self.tier.coder.data_frags.max(1);
            let used_blocks = total_blocks - unused_blocks;
            let frag_wiped = chunk.frags.iter().any(|f| {
                matches!(f.index, FragIndex::Data(_) | FragIndex::Parity(_))
                    && !f.blocks.is_empty()
                    && f.blocks.iter().all(|b| !in_use.contains(&b.id))
            });

            if is_unsafe_deletion(total_blocks, unused_blocks, min_blocks, frag_wiped) {
                error!(
                    chunk = %chunk.label(),
                    tier = %self.tier.name,
                    total_blocks,
                    used_blocks,
                    unused_blocks,
                    min_blocks,
                    frag_wiped,
                    "Refusing to delete unused blocks, chunk would become unreadable"
                );
                return Ok(Some(DeletionRefusal {
                    tier: self.tier.id,
                    total_blocks,
                    used_blocks,
                    unused_blocks,
                    min_blocks,
                }));
            }

            for frag in &mut chunk.frags {
                frag.deletions = frag
                    .blocks
                    .iter()
                    .filter(|b| !in_use.contains(&b.id))
                    .cloned()
                    .collect();
            }
        } else {
            // replacements are not written yet, drop the surplus afterwards
            for frag in &mut chunk.frags {
                frag.future_deletions = frag
                    .blocks
                    .iter()
                    .filter(|b| !in_use.contains(&b.id))
                    .cloned()
                    .collect();
            }
        }
        Ok(None)
    }
}

/// Whether dropping `unused` of `total` blocks could leave the chunk unreadable.
fn is_unsafe_deletion(total: usize, unused: usize, min_blocks: u32, frag_wiped: bool) -> bool {
    let min_blocks = min_blocks as usize;
    unused >= total || unused + min_blocks > total || total - unused < min_blocks || frag_wiped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::{BucketId, ChunkId, HostId, NodeId};
    use crate::domain::model::{Block, ChunkCoderConfig};
    use crate::domain::system::{Mirror, MirrorStorage, NodeInfo, NodeType, Pool, PoolKind, PoolStatus};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn tier_with_pools(coder: ChunkCoderConfig, mirrors: usize) -> (Arc<Tier>, Vec<Arc<Pool>>) {
        let pools: Vec<Arc<Pool>> = (0..mirrors)
            .map(|i| Arc::new(Pool::new(format!("pool-{}", i), PoolKind::Hosts)))
            .collect();
        let tier = Tier::new(
            "tier",
            coder,
            pools.iter().map(|p| Mirror::new(vec![p.clone()])).collect(),
        );
        (Arc::new(tier), pools)
    }

    fn healthy(pools: &[Arc<Pool>]) -> TierStatus {
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
            mirrors_storage: pools
                .iter()
                .map(|_| MirrorStorage {
                    free: GIB,
                    regular_free: GIB,
                    redundant_free: 0,
                })
                .collect(),
        }
    }

    fn readable_block(pool: &Pool) -> Block {
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
        block.is_accessible = true;
        block
    }

    #[test]
    fn test_status_online_and_valid() {
        let (tier, pools) = tier_with_pools(ChunkCoderConfig::default(), 2);
        let mapper = TierMapper::new(&TierOrder::new(tier, 0));
        let status = mapper.update_status(Some(&healthy(&pools)), None, &MapperConfig::default());
        assert!(status.online);
        assert!(status.valid_for_allocation);
        assert!(status.write_mirror.is_some());

        let missing = mapper.update_status(None, None, &MapperConfig::default());
        assert!(!missing.online);
        assert!(!missing.valid_for_allocation);
        assert_eq!(missing.max_free, 0);
    }

    #[test]
    fn test_new_chunk_mapped_to_single_mirror() {
        let (tier, pools) = tier_with_pools(ChunkCoderConfig::replicated(1), 2);
        let mapper = TierMapper::new(&TierOrder::new(tier, 0));
        let status = mapper.update_status(Some(&healthy(&pools)), None, &MapperConfig::default());

        let mut chunk = Chunk::new(BucketId::new(), ChunkCoderConfig::replicated(1), 10, 10);
        assert!(mapper.map_tier(&status, &mut chunk).unwrap().is_none());
        assert_eq!(chunk.num_allocations(), 1);
    }

    #[test]
    fn test_existing_chunk_mapped_by_every_mirror() {
        let (tier, pools) = tier_with_pools(ChunkCoderConfig::replicated(1), 2);
        let mapper = TierMapper::new(&TierOrder::new(tier, 0));
        let status = mapper.update_status(Some(&healthy(&pools)), None, &MapperConfig::default());

        let mut chunk = Chunk::new(BucketId::new(), ChunkCoderConfig::replicated(1), 10, 10);
        chunk.id = Some(ChunkId::new());
        chunk.frags[0].blocks.push(readable_block(&pools[0]));

        mapper.map_tier(&status, &mut chunk).unwrap();
        let allocs = &chunk.frags[0].allocations;
        assert_eq!(allocs.len(), 1);
        assert_eq!(allocs[0].pools, vec![pools[1].id]);
        assert!(chunk.frags[0].future_deletions.is_empty());
    }

    #[test]
    fn test_foreign_blocks_become_deletions_when_safe() {
        let (tier, pools) = tier_with_pools(ChunkCoderConfig::replicated(1), 1);
        let mapper = TierMapper::new(&TierOrder::new(tier, 0));
        let status = mapper.update_status(Some(&healthy(&pools)), None, &MapperConfig::default());

        let foreign = Pool::new("elsewhere", PoolKind::Hosts);
        let mut chunk = Chunk::new(BucketId::new(), ChunkCoderConfig::replicated(1), 10, 10);
        chunk.id = Some(ChunkId::new());
        chunk.frags[0].blocks.push(readable_block(&pools[0]));
        chunk.frags[0].blocks.push(readable_block(&foreign));

        assert!(mapper.map_tier(&status, &mut chunk).unwrap().is_none());
        assert_eq!(chunk.num_deletions(), 1);
        assert_eq!(chunk.frags[0].deletions[0].pool_id, foreign.id);
    }

    #[test]
    fn test_unused_become_future_deletions_while_allocating() {
        let (tier, pools) = tier_with_pools(ChunkCoderConfig::replicated(1), 1);
        let mapper = TierMapper::new(&TierOrder::new(tier, 0));
        let status = mapper.update_status(Some(&healthy(&pools)), None, &MapperConfig::default());

        let foreign = Pool::new("elsewhere", PoolKind::Hosts);
        let mut chunk = Chunk::new(BucketId::new(), ChunkCoderConfig::replicated(1), 10, 10);
        chunk.id = Some(ChunkId::new());
        chunk.frags[0].blocks.push(readable_block(&foreign));

        assert!(mapper.map_tier(&status, &mut chunk).unwrap().is_none());
        assert!(chunk.has_allocations());
        assert!(chunk.has_future_deletions());
        assert_eq!(chunk.num_deletions(), 0);
    }

    #[test]
    fn test_misplaced_blocks_dropped_once_replaced() {
        let coder = ChunkCoderConfig::erasure(2, 1, 1);
        let (tier, pools) = tier_with_pools(coder, 1);
        let mapper = TierMapper::new(&TierOrder::new(tier, 0));
        let status = mapper.update_status(Some(&healthy(&pools)), None, &MapperConfig::default());

        let mut chunk = Chunk::new(BucketId::new(), coder, 20, 10);
        chunk.id = Some(ChunkId::new());
        for frag in &mut chunk.frags {
            let mut block = readable_block(&pools[0]);
            block.is_misplaced = true;
            frag.blocks.push(block);
        }

        // nothing counted yet: replacements first, deletions deferred
        let mut pending = chunk.clone();
        assert!(mapper.map_tier(&status, &mut pending).unwrap().is_none());
        assert_eq!(pending.num_allocations(), 3);
        assert_eq!(pending.num_deletions(), 0);
        assert!(pending.has_future_deletions());

        for frag in &mut chunk.frags {
            frag.blocks.push(readable_block(&pools[0]));
        }
        assert!(mapper.map_tier(&status, &mut chunk).unwrap().is_none());
        assert_eq!(chunk.num_allocations(), 0);
        assert_eq!(chunk.num_deletions(), 3);
    }

    #[test]
    fn test_unsafe_deletion_rules() {
        // drop everything
        assert!(is_unsafe_deletion(3, 3, 1, false));
        // fewer than min blocks would remain
        assert!(is_unsafe_deletion(4, 3, 2, false));
        // a frag would lose its last block
        assert!(is_unsafe_deletion(6, 1, 2, true));
        assert!(!is_unsafe_deletion(6, 3, 2, false));
        assert!(!is_unsafe_deletion(2, 1, 1, false));
    }
}
