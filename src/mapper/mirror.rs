//! Mirror Mapper
//!
//! Per-mirror placement: decides for every fragment which accessible blocks
//! of this mirror are kept, how many new blocks are missing, and which pools
//! the missing blocks should go to.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::Rng;
use tracing::trace;

use crate::config::MapperConfig;
use crate::domain::ids::{BlockId, MirrorId, PoolId};
use crate::domain::model::{Allocation, Block, Chunk, ChunkCoderConfig, Frag, FragIndex};
use crate::domain::system::{LocationInfo, Mirror, Pool, TierStatus};
use crate::error::{Error, Result};

/// Capacity-derived state of a mirror for one mapping pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorStatus {
    /// Preference for new writes, higher wins
    pub weight: u8,
    pub regular_pools_valid: bool,
    pub redundant_pools_valid: bool,
    pub has_online_pool: bool,
    pub is_local_mirror: bool,
}

/// Write preference of a mirror.
///
/// Local mirrors with space win, then redundant pools (cloud before mongo),
/// then plain pools.
pub fn mirror_weight(
    is_local: bool,
    regular_valid: bool,
    redundant_valid: bool,
    redundant_has_mongo: bool,
) -> u8 {
    if is_local && (regular_valid || redundant_valid) {
        4
    } else if redundant_valid {
        if redundant_has_mongo {
            1
        } else {
            2
        }
    } else if regular_valid {
        3
    } else {
        0
    }
}

#[derive(Debug, Clone)]
pub struct MirrorMapper {
    mirror_id: MirrorId,
    mirror_index: usize,
    coder: ChunkCoderConfig,
    spread_pools: Vec<Arc<Pool>>,
    pools_by_id: HashMap<PoolId, Arc<Pool>>,
    redundant_pools: Vec<PoolId>,
    regular_pools: Vec<PoolId>,
    redundant_has_mongo: bool,
}

/// Snapshot of a used block for replica accounting.
struct UsedBlock {
    id: BlockId,
    redundant: bool,
}

impl MirrorMapper {
    pub fn new(mirror: &Mirror, coder: ChunkCoderConfig, mirror_index: usize) -> Self {
        let spread_pools = mirror.pools.clone();
        if spread_pools.is_empty() {
            trace!(mirror = %mirror.id, "MirrorMapper: no pools in mirror");
        }
        let (redundant, regular): (Vec<_>, Vec<_>) =
            spread_pools.iter().partition(|p| p.has_redundancy());

        Self {
            mirror_id: mirror.id,
            mirror_index,
            coder,
            pools_by_id: spread_pools.iter().map(|p| (p.id, p.clone())).collect(),
            redundant_has_mongo: redundant.iter().any(|p| p.is_mongo()),
            redundant_pools: redundant.iter().map(|p| p.id).collect(),
            regular_pools: regular.iter().map(|p| p.id).collect(),
            spread_pools,
        }
    }

    pub fn mirror_id(&self) -> MirrorId {
        self.mirror_id
    }

    pub fn contains_pool(&self, pool: &PoolId) -> bool {
        self.pools_by_id.contains_key(pool)
    }

    /// Weigh this mirror against the tier capacity snapshot.
    pub fn update_status(
        &self,
        tier_status: &TierStatus,
        location: Option<&LocationInfo>,
        config: &MapperConfig,
    ) -> MirrorStatus {
        let has_online_pool = self.spread_pools.iter().any(|pool| {
            tier_status
                .pools
                .get(&pool.id)
                .map(|s| s.valid_for_allocation)
                .unwrap_or(false)
        });

        let storage = tier_status
            .mirrors_storage
            .get(self.mirror_index)
            .copied()
            .unwrap_or_default();
        let regular_pools_valid = storage.regular_free > config.min_tier_free_threshold;
        let redundant_pools_valid = storage.redundant_free > config.min_tier_free_threshold;

        let is_local_mirror = location
            .map(|loc| self.spread_pools.iter().any(|p| loc.is_local_pool(p)))
            .unwrap_or(false);

        MirrorStatus {
            weight: mirror_weight(
                is_local_mirror,
                regular_pools_valid,
                redundant_pools_valid,
                self.redundant_has_mongo,
            ),
            regular_pools_valid,
            redundant_pools_valid,
            has_online_pool,
            is_local_mirror,
        }
    }

    /// Map every data and parity frag of the chunk onto this mirror.
    ///
    /// Blocks this mirror keeps are added to `in_use`.
    pub fn map_mirror(
        &self,
        status: &MirrorStatus,
        chunk: &mut Chunk,
        in_use: &mut HashSet<BlockId>,
    ) -> Result<()> {
        if !chunk.coder.same_layout(&self.coder) {
            return Err(Error::RecodingUnsupported {
                chunk: chunk.label(),
                chunk_data_frags: chunk.coder.data_frags,
                chunk_parity_frags: chunk.coder.parity_frags,
                tier_data_frags: self.coder.data_frags,
                tier_parity_frags: self.coder.parity_frags,
            });
        }

        let replicas = self.coder.replicas.max(1);
        let indexes = (0..self.coder.data_frags)
            .map(FragIndex::Data)
            .chain((0..self.coder.parity_frags).map(FragIndex::Parity));

        let mut missing_frag = false;
        for index in indexes {
            let label = chunk.label();
            let frag = chunk.frag_mut(index).ok_or_else(|| Error::InvalidChunk {
                chunk: label,
                reason: format!("missing frag {}", index),
            })?;
            if !self.map_frag(status, frag, replicas, in_use) {
                missing_frag = true;
            }
        }

        // an existing chunk with an unreadable frag must be rebuilt from the others
        if missing_frag && !chunk.is_new() {
            chunk.is_building_frags = true;
        }
        Ok(())
    }

    /// Returns whether the frag has any accessible block.
    fn map_frag(
        &self,
        status: &MirrorStatus,
        frag: &mut Frag,
        replicas: u32,
        in_use: &mut HashSet<BlockId>,
    ) -> bool {
        let sources: Vec<BlockId> = frag.accessible_blocks().map(|b| b.id).collect();
        let is_accessible_frag = !sources.is_empty();

        let mut used: Vec<&Block> = Vec::new();
        let mut used_replicas = 0u32;
        let mut used_redundant_blocks = false;
        for block in frag.accessible_blocks() {
            // misplaced or foreign-pool blocks stay readable but are not counted
            if block.is_misplaced {
                continue;
            }
            let Some(pool) = self.pools_by_id.get(&block.pool_id) else {
                continue;
            };
            used.push(block);
            if pool.has_redundancy() {
                used_redundant_blocks = true;
                used_replicas += replicas;
            } else {
                used_replicas += 1;
            }
        }

        if used_replicas >= replicas {
            if used_replicas > replicas {
                // keep the newest blocks, older mapping decisions go first
                used.sort_by(|a, b| Block::newer_first(a, b));
            }
            let mut keep_replicas = 0u32;
            for block in used {
                if keep_replicas >= replicas {
                    break;
                }
                keep_replicas += if self.is_redundant_pool(&block.pool_id) {
                    replicas
                } else {
                    1
                };
                in_use.insert(block.id);
            }
            return is_accessible_frag;
        }

        in_use.extend(used.iter().map(|b| b.id));

        let pools = if used_replicas > 0 && !used_redundant_blocks && status.regular_pools_valid {
            self.regular_pools.clone()
        } else {
            self.pick_pools(status).to_vec()
        };

        // one block on a redundant pool satisfies the whole replica policy
        let is_redundant = !pools.is_empty() && pools.iter().all(|p| self.is_redundant_pool(p));
        let num_missing = if is_redundant {
            1
        } else {
            replicas - used_replicas
        };

        for _ in 0..num_missing {
            frag.allocations
                .push(Allocation::new(self.mirror_id, pools.clone(), sources.clone()));
        }
        is_accessible_frag
    }

    /// Choose between the redundant and the plain pools of this mirror.
    fn pick_pools(&self, status: &MirrorStatus) -> &[PoolId] {
        match (status.regular_pools_valid, status.redundant_pools_valid) {
            (true, false) => return &self.regular_pools,
            (false, true) => return &self.redundant_pools,
            _ => {}
        }
        if self.spread_pools.is_empty() {
            return &self.regular_pools;
        }
        let picked = rand::thread_rng().gen_range(0..self.spread_pools.len());
        if self.spread_pools[picked].has_redundancy() {
            &self.redundant_pools
        } else {
            &self.regular_pools
        }
    }

    fn is_redundant_pool(&self, pool: &PoolId) -> bool {
        self.pools_by_id
            .get(pool)
            .map(|p| p.has_redundancy())
            .unwrap_or(false)
    }
}
