//! GetMapping
//!
//! Resolves dedup and computes a satisfiable mapping for a batch of chunks.
//!
//! ```text
//! chunks ──▶ group by bucket ──▶ find_dups ──▶ prepare ──▶ allocate ──▶ done
//!                                                ▲            │ no node
//!                                                └─ ensure room ◀┘
//! ```

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use crate::context::PlacementContext;
use crate::domain::events::PlacementEvent;
use crate::domain::ids::{BlockId, BucketId, NodeId, TierId};
use crate::domain::model::{Block, Chunk};
use crate::domain::system::{Bucket, LocationInfo, NodeInfo, TieringStatus};
use crate::error::{Error, Result};
use crate::mapper::{is_chunk_good_for_dedup, map_chunk, select_tier_for_write, DeletionRefusal};

pub struct GetMapping<'a> {
    ctx: &'a PlacementContext,
    check_dups: bool,
    move_to_tier: Option<TierId>,
    location_info: Option<LocationInfo>,
}

impl<'a> GetMapping<'a> {
    pub fn new(ctx: &'a PlacementContext) -> Self {
        Self {
            ctx,
            check_dups: false,
            move_to_tier: None,
            location_info: None,
        }
    }

    pub fn check_dups(mut self, check_dups: bool) -> Self {
        self.check_dups = check_dups;
        self
    }

    /// Map every chunk into this tier instead of selecting one.
    pub fn move_to_tier(mut self, tier: Option<TierId>) -> Self {
        self.move_to_tier = tier;
        self
    }

    pub fn location_info(mut self, location_info: Option<LocationInfo>) -> Self {
        self.location_info = location_info;
        self
    }

    /// Attach dedup targets, allocations and deletions to the chunks.
    ///
    /// On success every non-duplicate chunk has a mapped tier and every
    /// allocation has a node assigned.
    #[instrument(skip_all, fields(chunks = chunks.len()))]
    pub async fn run(&self, chunks: &mut [Chunk]) -> Result<()> {
        let start = Instant::now();
        let mut buckets: Vec<BucketId> = Vec::new();
        for chunk in chunks.iter() {
            if !buckets.contains(&chunk.bucket_id) {
                buckets.push(chunk.bucket_id);
            }
        }
        if self.move_to_tier.is_some() && buckets.len() > 1 {
            return Err(Error::InvalidRequest(format!(
                "move_to_tier requires chunks of a single bucket, got {}",
                buckets.len()
            )));
        }

        for bucket_id in buckets {
            let bucket = self
                .ctx
                .system_store
                .bucket(&bucket_id)
                .ok_or_else(|| Error::BucketNotFound(bucket_id.to_string()))?;
            let mut group: Vec<&mut Chunk> = chunks
                .iter_mut()
                .filter(|c| c.bucket_id == bucket_id)
                .collect();

            if self.check_dups && self.ctx.config.mapping.dedup_enabled {
                self.find_dups(&bucket, &mut group).await?;
            }
            self.do_allocations(&bucket, &mut group).await?;
        }

        debug!(
            chunks = chunks.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "GetMapping done"
        );
        Ok(())
    }

    // =========================================================================
    // Dedup
    // =========================================================================

    async fn find_dups(&self, bucket: &Bucket, group: &mut [&mut Chunk]) -> Result<()> {
        let mut digests: Vec<String> = Vec::new();
        for chunk in group.iter().filter(|c| c.is_new()) {
            if let Some(digest) = &chunk.digest {
                if !digests.contains(digest) {
                    digests.push(digest.clone());
                }
            }
        }
        if digests.is_empty() {
            return Ok(());
        }

        let records = self
            .ctx
            .md_store
            .find_chunks_by_dedup_key(&bucket.id, &digests)
            .await?;
        // a candidate whose tier left the policy can never be a target
        let records: Vec<_> = records
            .into_iter()
            .filter(|r| bucket.tiering.tier_order(&r.tier_id).is_some())
            .collect();
        if records.is_empty() {
            return Ok(());
        }

        let ids: Vec<_> = records.iter().map(|r| r.id).collect();
        let blocks = self.ctx.md_store.load_blocks_for_chunks(&ids).await?;
        let mut candidates: Vec<Chunk> = records.iter().map(|r| r.to_chunk(&blocks)).collect();
        {
            let mut refs: Vec<&mut Chunk> = candidates.iter_mut().collect();
            self.prepare_chunks(bucket, &mut refs, None).await?;
        }

        for candidate in candidates.iter().filter(|c| is_chunk_good_for_dedup(c)) {
            for chunk in group.iter_mut() {
                if chunk.is_new()
                    && chunk.dup_chunk_id.is_none()
                    && chunk.size == candidate.size
                    && chunk.digest == candidate.digest
                {
                    chunk.dup_chunk_id = candidate.id;
                    // matched on size and digest only, bytes are not compared
                    info!(
                        chunk = %chunk.label(),
                        dup = ?candidate.id,
                        size = chunk.size,
                        "Dedup hit on size and digest"
                    );
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    async fn do_allocations(&self, bucket: &Bucket, group: &mut [&mut Chunk]) -> Result<()> {
        let mut pending: Vec<&mut Chunk> = group
            .iter_mut()
            .filter(|c| c.dup_chunk_id.is_none())
            .map(|c| &mut **c)
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let max_attempts = self.ctx.config.mapping.max_allocation_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            for chunk in pending.iter_mut() {
                chunk.reset_mapping();
            }
            self.prepare_chunks(bucket, &mut pending, self.move_to_tier)
                .await?;
            if self.allocate_chunks(bucket, &mut pending).await? {
                return Ok(());
            }
            if attempt >= max_attempts {
                return Err(Error::AllocationExhausted {
                    bucket: bucket.name.clone(),
                    attempts: attempt,
                });
            }

            let mut tiers: Vec<TierId> = Vec::new();
            for tier in pending.iter().filter_map(|c| c.mapped_tier_id) {
                if !tiers.contains(&tier) {
                    tiers.push(tier);
                }
            }
            let repairs = tiers
                .iter()
                .map(|tier| self.ctx.room.ensure_room_in_tier(self.ctx, tier, &bucket.id));
            for (tier, result) in tiers.iter().zip(futures::future::join_all(repairs).await) {
                if let Err(e) = result {
                    warn!(tier = %tier, error = %e, attempt, "Capacity repair failed, retrying allocation");
                }
            }
        }
    }

    /// Refresh capacity, resolve block nodes, select tiers and map.
    async fn prepare_chunks(
        &self,
        bucket: &Bucket,
        chunks: &mut [&mut Chunk],
        move_to_tier: Option<TierId>,
    ) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let tiering = &bucket.tiering;
        self.ctx
            .allocator
            .refresh_tiering_alloc(tiering, false)
            .await?;
        let status = self.ctx.allocator.tiering_status(tiering);
        self.populate_chunks(chunks).await?;

        for chunk in chunks.iter_mut() {
            let tier_id = self.select_tier(bucket, chunk, &status, move_to_tier)?;
            chunk.mapped_tier_id = Some(tier_id);
            let refusal = map_chunk(
                &self.ctx.mapper_cache,
                chunk,
                &tier_id,
                tiering,
                &status,
                self.location_info.as_ref(),
            )?;
            if let Some(refusal) = refusal {
                self.report_refusal(bucket, chunk, refusal).await;
            }
        }
        Ok(())
    }

    fn select_tier(
        &self,
        bucket: &Bucket,
        chunk: &Chunk,
        status: &TieringStatus,
        move_to_tier: Option<TierId>,
    ) -> Result<TierId> {
        if let Some(tier) = move_to_tier {
            return Ok(tier);
        }
        let tiering = &bucket.tiering;
        let start_order = chunk
            .tier_id
            .and_then(|t| tiering.tier_order(&t))
            .map(|t| t.order);
        select_tier_for_write(&self.ctx.mapper_cache, tiering, status, start_order)
            .map(|t| t.id)
            .ok_or_else(|| Error::NoTierForWrite {
                chunk: chunk.label(),
                tiering: tiering.name.clone(),
            })
    }

    /// Resolve block nodes: unknown nodes make orphans, unreadable nodes
    /// make inaccessible blocks, a pool change makes misplaced blocks.
    async fn populate_chunks(&self, chunks: &mut [&mut Chunk]) -> Result<()> {
        let mut node_ids: Vec<NodeId> = chunks
            .iter()
            .flat_map(|c| c.frags.iter())
            .flat_map(|f| f.blocks.iter())
            .map(|b| b.node_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if node_ids.is_empty() {
            return Ok(());
        }
        node_ids.sort();
        let nodes = self.ctx.allocator.nodes_by_ids(&node_ids).await?;

        let mut orphans = Vec::new();
        for chunk in chunks.iter_mut() {
            for frag in chunk.frags.iter_mut() {
                for block in frag.blocks.iter_mut() {
                    populate_block(block, &nodes, &mut orphans);
                }
            }
        }

        if !orphans.is_empty() {
            warn!(count = orphans.len(), blocks = ?orphans, "Orphan blocks, treating as inaccessible");
            self.ctx
                .publish(PlacementEvent::OrphanBlocks {
                    block_ids: orphans,
                    timestamp: chrono::Utc::now(),
                })
                .await;
        }
        Ok(())
    }

    async fn allocate_chunks(&self, bucket: &Bucket, chunks: &mut [&mut Chunk]) -> Result<bool> {
        let start = Instant::now();
        let total_size: u64 = chunks.iter().map(|c| c.size).sum();
        let mut done = true;
        for chunk in chunks.iter_mut() {
            if !self.allocate_chunk(chunk).await? {
                done = false;
                break;
            }
        }
        self.ctx.reporter.add_event(
            &format!("allocate_chunks({})", bucket.name),
            total_size,
            start.elapsed(),
        );
        Ok(done)
    }

    /// Assign a node to every allocation of the chunk.
    ///
    /// Returns false when a node could not be found or a reservation failed.
    async fn allocate_chunk(&self, chunk: &mut Chunk) -> Result<bool> {
        let Some(tier_id) = chunk.mapped_tier_id else {
            return Err(Error::InvalidChunk {
                chunk: chunk.label(),
                reason: "allocating an unmapped chunk".to_string(),
            });
        };
        if !chunk.has_allocations() {
            return Ok(true);
        }
        let has_room = self
            .ctx
            .room
            .enough_room_in_tier(self.ctx, &tier_id, &chunk.bucket_id)?;

        let mut avoid_nodes = HashSet::new();
        let mut avoid_hosts = HashSet::new();
        for node in chunk
            .frags
            .iter()
            .flat_map(|f| f.blocks.iter())
            .filter_map(|b| b.node.as_ref())
            .filter(|n| n.node_type.is_capacity_limited())
        {
            avoid_nodes.insert(node.id);
            avoid_hosts.insert(node.host_id);
        }

        let label = chunk.label();
        let frag_size = chunk.frag_size;
        let mut preallocate = Vec::new();
        for (fi, frag) in chunk.frags.iter_mut().enumerate() {
            for (ai, alloc) in frag.allocations.iter_mut().enumerate() {
                let Some(node) =
                    self.ctx
                        .allocator
                        .allocate_node(&alloc.pools, &avoid_nodes, &avoid_hosts)
                else {
                    warn!(
                        chunk = %label,
                        frag = %frag.index,
                        pools = alloc.pools.len(),
                        avoid_nodes = avoid_nodes.len(),
                        "No node available for allocation"
                    );
                    return Ok(false);
                };
                if node.node_type.is_capacity_limited() {
                    avoid_nodes.insert(node.id);
                    avoid_hosts.insert(node.host_id);
                    if !has_room {
                        preallocate.push((fi, ai));
                    }
                }
                alloc.block = Some(Block::allocate(&node, frag_size));
            }
        }

        if preallocate.is_empty() {
            return Ok(true);
        }

        let mut mds = Vec::with_capacity(preallocate.len());
        for &(fi, ai) in &preallocate {
            let block = chunk.frags[fi].allocations[ai]
                .block
                .as_ref()
                .ok_or_else(|| Error::MissingBlockNode(label.clone()))?;
            mds.push(block.block_md()?);
        }
        let results = futures::future::join_all(
            mds.iter().map(|md| self.ctx.block_store.preallocate_block(md)),
        )
        .await;

        let mut ok = true;
        for ((fi, ai), result) in preallocate.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    if let Some(block) = chunk.frags[fi].allocations[ai].block.as_mut() {
                        block.is_preallocated = true;
                    }
                }
                Err(e) => {
                    warn!(chunk = %label, error = %e, "Preallocation failed, will retry");
                    ok = false;
                }
            }
        }
        Ok(ok)
    }

    async fn report_refusal(&self, bucket: &Bucket, chunk: &Chunk, refusal: DeletionRefusal) {
        let tier = bucket
            .tiering
            .tier_order(&refusal.tier)
            .map(|t| t.tier.name.clone())
            .unwrap_or_else(|| refusal.tier.to_string());
        self.ctx
            .publish(PlacementEvent::DeletionRefused {
                chunk: chunk.label(),
                tier,
                blocks: refusal.total_blocks,
                used_blocks: refusal.used_blocks,
                unused_blocks: refusal.unused_blocks,
                min_blocks: refusal.min_blocks,
                timestamp: chrono::Utc::now(),
            })
            .await;
    }
}

fn populate_block(
    block: &mut Block,
    nodes: &HashMap<NodeId, NodeInfo>,
    orphans: &mut Vec<BlockId>,
) {
    match nodes.get(&block.node_id) {
        Some(node) => {
            block.is_accessible = node.readable;
            block.is_misplaced = node.pool_id != block.pool_id;
            block.node = Some(node.clone());
        }
        None => {
            block.is_accessible = false;
            block.node = None;
            orphans.push(block.id);
        }
    }
}
