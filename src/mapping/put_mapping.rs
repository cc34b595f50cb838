//! PutMapping
//!
//! Turns the outcome of a mapping and write pass into a single metadata
//! commit: new chunks, new blocks, new parts, block deletions and the
//! optional tier move.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, instrument};

use crate::context::PlacementContext;
use crate::domain::events::PlacementEvent;
use crate::domain::ids::{BucketId, ChunkId, FragId, TierId};
use crate::domain::model::{Allocation, AllocationStatus, Block, Chunk, Frag};
use crate::domain::records::{BlockRecord, ChunkRecord, MappingCommit, PartRecord};
use crate::domain::system::Bucket;
use crate::error::{Error, Result};

pub struct PutMapping<'a> {
    ctx: &'a PlacementContext,
    move_to_tier: Option<TierId>,
}

impl<'a> PutMapping<'a> {
    pub fn new(ctx: &'a PlacementContext) -> Self {
        Self {
            ctx,
            move_to_tier: None,
        }
    }

    /// Record every committed chunk as moved into `tier`.
    pub fn move_to_tier(mut self, tier: Option<TierId>) -> Self {
        self.move_to_tier = tier;
        self
    }

    /// Commit the mapping outcome.
    ///
    /// New chunks get their id and tier assigned in place. A new chunk that
    /// had errors is left out entirely.
    #[instrument(skip_all, fields(chunks = chunks.len()))]
    pub async fn run(&self, chunks: &mut [Chunk]) -> Result<()> {
        let start = Instant::now();
        let (commit, drift) = self.build_commit(chunks)?;

        let (blocks, new_chunks, parts, deletions) = (
            commit.new_blocks.len(),
            commit.new_chunks.len(),
            commit.new_parts.len(),
            commit.delete_blocks.len(),
        );
        if !commit.is_empty() {
            self.ctx.md_store.commit(commit).await?;
        }
        for event in drift {
            self.ctx.publish(event).await;
        }

        debug!(
            new_blocks = blocks,
            new_chunks,
            new_parts = parts,
            delete_blocks = deletions,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "PutMapping done"
        );
        Ok(())
    }

    /// The commit unit for `chunks` and the drift events to publish once it
    /// is applied.
    fn build_commit(&self, chunks: &mut [Chunk]) -> Result<(MappingCommit, Vec<PlacementEvent>)> {
        let mut commit = MappingCommit::default();
        let mut drift = Vec::new();
        let mut update_chunk_ids = Vec::new();

        for chunk in chunks.iter_mut() {
            let bucket = self
                .ctx
                .system_store
                .bucket_include_deleted(&chunk.bucket_id)
                .ok_or_else(|| Error::BucketNotFound(chunk.bucket_id.to_string()))?;

            if let Some(dup) = chunk.dup_chunk_id {
                add_new_parts(&mut commit, chunk, dup);
            } else if let Some(id) = chunk.id {
                update_chunk_ids.push(id);
                self.add_existing_chunk(&mut commit, &mut drift, &bucket, chunk, id)?;
            } else if chunk.had_errors {
                debug!(chunk = %chunk.label(), "Skipping failed new chunk");
            } else {
                self.add_new_chunk(&mut commit, &mut drift, &bucket, chunk)?;
            }
        }

        if let Some(tier) = self.move_to_tier {
            commit.tier_update = Some((update_chunk_ids, tier));
        }
        Ok((commit, drift))
    }

    fn add_new_chunk(
        &self,
        commit: &mut MappingCommit,
        drift: &mut Vec<PlacementEvent>,
        bucket: &Bucket,
        chunk: &mut Chunk,
    ) -> Result<()> {
        let tier_id = chunk.mapped_tier_id.ok_or_else(|| Error::InvalidChunk {
            chunk: chunk.label(),
            reason: "new chunk committed without a mapped tier".to_string(),
        })?;
        let id = ChunkId::new();
        add_new_parts(commit, chunk, id);
        for frag in &chunk.frags {
            for block in committable_blocks(&frag.allocations, false) {
                let record = self.block_record(drift, bucket, block, id, frag.id)?;
                commit.new_blocks.push(record);
            }
            self.add_pending_blocks(commit, drift, bucket, frag, id, true)?;
        }
        commit.new_chunks.push(ChunkRecord::from_chunk(chunk, id, tier_id));
        chunk.id = Some(id);
        chunk.tier_id = Some(tier_id);
        Ok(())
    }

    fn add_existing_chunk(
        &self,
        commit: &mut MappingCommit,
        drift: &mut Vec<PlacementEvent>,
        bucket: &Bucket,
        chunk: &Chunk,
        id: ChunkId,
    ) -> Result<()> {
        // deleting while the replacements are uncertain could lose data
        let apply_deletions = !chunk.had_errors;
        for frag in &chunk.frags {
            for block in committable_blocks(&frag.allocations, chunk.had_errors) {
                let record = self.block_record(drift, bucket, block, id, frag.id)?;
                commit.new_blocks.push(record);
            }
            self.add_pending_blocks(commit, drift, bucket, frag, id, apply_deletions)?;
            if apply_deletions {
                commit.delete_blocks.extend(
                    frag.deletions
                        .iter()
                        .filter(|b| !is_pending(frag, b))
                        .map(|b| b.id),
                );
            }
        }
        Ok(())
    }

    /// Blocks written by an earlier attempt of this run. One the mapper has
    /// since dropped is recorded already deleted, so the same id never lands
    /// in both the inserts and the deletions of a commit.
    fn add_pending_blocks(
        &self,
        commit: &mut MappingCommit,
        drift: &mut Vec<PlacementEvent>,
        bucket: &Bucket,
        frag: &Frag,
        chunk_id: ChunkId,
        apply_deletions: bool,
    ) -> Result<()> {
        for block in frag.blocks.iter().filter(|b| b.pending_commit) {
            let mut record = self.block_record(drift, bucket, block, chunk_id, frag.id)?;
            record.deleted = apply_deletions && frag.deletions.iter().any(|d| d.id == block.id);
            commit.new_blocks.push(record);
        }
        Ok(())
    }

    fn block_record(
        &self,
        drift: &mut Vec<PlacementEvent>,
        bucket: &Bucket,
        block: &Block,
        chunk_id: ChunkId,
        frag_id: FragId,
    ) -> Result<BlockRecord> {
        let config = &self.ctx.config.mapping;
        drift.extend(check_drift(
            block,
            bucket,
            Utc::now(),
            config.md_grace,
            config.md_aggregator_interval,
        ));
        if block.node.is_none() {
            error!(block = %block.id, bucket = %bucket.name, "Missing node/pool for block");
            return Err(Error::MissingBlockNode(block.id.to_string()));
        }
        Ok(BlockRecord::from_block(block, chunk_id, frag_id, bucket.id))
    }
}

fn is_pending(frag: &Frag, block: &Block) -> bool {
    frag.blocks
        .iter()
        .any(|b| b.id == block.id && b.pending_commit)
}

fn add_new_parts(commit: &mut MappingCommit, chunk: &Chunk, chunk_id: ChunkId) {
    let bucket_id: BucketId = chunk.bucket_id;
    commit.new_parts.extend(
        chunk
            .parts
            .iter()
            .map(|p| PartRecord::uncommitted(p, chunk_id, bucket_id)),
    );
}

/// Written allocations always commit; pending ones only when the chunk
/// finished without errors.
fn committable_blocks(allocations: &[Allocation], had_errors: bool) -> impl Iterator<Item = &Block> {
    allocations
        .iter()
        .filter(move |a| match a.status {
            AllocationStatus::Written => true,
            AllocationStatus::Pending => !had_errors,
            AllocationStatus::Failed => false,
        })
        .filter_map(|a| a.block.as_ref())
}

/// Report blocks whose creation time is implausibly old, either against the
/// clock or against the last stats aggregation of the bucket.
fn check_drift(
    block: &Block,
    bucket: &Bucket,
    now: DateTime<Utc>,
    md_grace: Duration,
    aggregator_interval: Duration,
) -> Vec<PlacementEvent> {
    let mut events = Vec::new();
    let interval = chrono::Duration::from_std(aggregator_interval).unwrap_or_default();
    let grace = chrono::Duration::from_std(md_grace).unwrap_or_default();

    if block.created_at < now - (grace - interval) {
        error!(
            block = %block.id,
            bucket = %bucket.name,
            created_at = %block.created_at,
            %now,
            "Big gap between block creation and commit"
        );
        events.push(PlacementEvent::metadata_drift(
            block.id,
            bucket.name.clone(),
            "block created long before commit",
        ));
    }
    if let Some(last_update) = bucket.stats_last_update {
        if block.created_at < last_update + interval {
            error!(
                block = %block.id,
                bucket = %bucket.name,
                created_at = %block.created_at,
                %last_update,
                "Big gap between block creation and bucket stats update"
            );
            events.push(PlacementEvent::metadata_drift(
                block.id,
                bucket.name.clone(),
                "block created before the last stats aggregation",
            ));
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::TestContext;
    use crate::domain::ids::{HostId, MirrorId, NodeId, PoolId};
    use crate::domain::model::ChunkCoderConfig;
    use crate::domain::system::{NodeInfo, NodeType, Tiering};
    use std::sync::Arc;

    fn node() -> NodeInfo {
        NodeInfo {
            id: NodeId::new(),
            name: "n".to_string(),
            host_id: HostId::new(),
            pool_id: PoolId::new(),
            address: "addr".to_string(),
            node_type: NodeType::BlockStoreFs,
            readable: true,
            writable: true,
        }
    }

    fn bucket() -> Bucket {
        Bucket::new("b1", Arc::new(Tiering::new("t", vec![])))
    }

    // =========================================================================
    // Allocation filtering
    // =========================================================================

    #[test]
    fn test_committable_blocks_by_status() {
        let n = node();
        let mut allocs = Vec::new();
        for status in [
            AllocationStatus::Written,
            AllocationStatus::Pending,
            AllocationStatus::Failed,
        ] {
            let mut alloc = Allocation::new(MirrorId::new(), vec![n.pool_id], vec![]);
            alloc.block = Some(Block::allocate(&n, 1));
            alloc.status = status;
            allocs.push(alloc);
        }
        assert_eq!(committable_blocks(&allocs, false).count(), 2);
        assert_eq!(committable_blocks(&allocs, true).count(), 1);
    }

    // =========================================================================
    // Commit assembly
    // =========================================================================

    #[test]
    fn test_dropped_pending_block_is_not_deleted_twice() {
        let tc = TestContext::new();
        let bucket = tc.system.add_bucket(bucket());
        let n = node();
        let mut chunk = Chunk::new(bucket.id, ChunkCoderConfig::replicated(2), 10, 10);
        chunk.id = Some(ChunkId::new());

        let mut pending = Block::allocate(&n, 10);
        pending.pending_commit = true;
        let kept = {
            let mut b = Block::allocate(&n, 10);
            b.pending_commit = true;
            b
        };
        let old = Block::allocate(&n, 10);
        let frag = &mut chunk.frags[0];
        frag.blocks = vec![pending.clone(), kept.clone(), old.clone()];
        frag.deletions = vec![pending.clone(), old.clone()];

        let mut chunks = vec![chunk];
        let (commit, _) = PutMapping::new(&tc.ctx).build_commit(&mut chunks).unwrap();

        assert_eq!(commit.delete_blocks, vec![old.id]);
        assert_eq!(commit.new_blocks.len(), 2);
        let dropped = commit.new_blocks.iter().find(|r| r.id == pending.id).unwrap();
        assert!(dropped.deleted);
        let live = commit.new_blocks.iter().find(|r| r.id == kept.id).unwrap();
        assert!(!live.deleted);
    }

    #[test]
    fn test_failed_chunk_keeps_its_pending_blocks() {
        let tc = TestContext::new();
        let bucket = tc.system.add_bucket(bucket());
        let n = node();
        let mut chunk = Chunk::new(bucket.id, ChunkCoderConfig::replicated(1), 10, 10);
        chunk.id = Some(ChunkId::new());
        chunk.had_errors = true;

        let mut pending = Block::allocate(&n, 10);
        pending.pending_commit = true;
        let frag = &mut chunk.frags[0];
        frag.blocks = vec![pending.clone()];
        frag.deletions = vec![pending.clone()];

        let mut chunks = vec![chunk];
        let (commit, _) = PutMapping::new(&tc.ctx).build_commit(&mut chunks).unwrap();

        assert!(commit.delete_blocks.is_empty());
        assert_eq!(commit.new_blocks.len(), 1);
        assert!(!commit.new_blocks[0].deleted);
    }

    // =========================================================================
    // Drift
    // =========================================================================

    #[test]
    fn test_fresh_block_has_no_drift() {
        let block = Block::allocate(&node(), 1);
        let events = check_drift(
            &block,
            &bucket(),
            Utc::now(),
            Duration::from_secs(600),
            Duration::from_secs(30),
        );
        assert!(events.is_empty());
    }

    #[test]
    fn test_old_block_drifts_against_clock() {
        let mut block = Block::allocate(&node(), 1);
        block.created_at = Utc::now() - chrono::Duration::minutes(20);
        let events = check_drift(
            &block,
            &bucket(),
            Utc::now(),
            Duration::from_secs(600),
            Duration::from_secs(30),
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "MetadataDrift");
    }

    #[test]
    fn test_block_older_than_stats_update_drifts() {
        let block = Block::allocate(&node(), 1);
        let mut b = bucket();
        b.stats_last_update = Some(Utc::now());
        let events = check_drift(
            &block,
            &b,
            Utc::now(),
            Duration::from_secs(600),
            Duration::from_secs(30),
        );
        assert_eq!(events.len(), 1);
    }
}
