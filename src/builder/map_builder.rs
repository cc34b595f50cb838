//! MapBuilder
//!
//! Repairs a batch of chunks under the builder lock.
//!
//! ```text
//! run(ids) ──▶ lock(ids) ──▶ pass 1: load ▶ fix ▶ map + write ▶ commit
//!                               │
//!                               └─▶ pass 2 on chunks with allocations or
//!                                   pending deletions: deletions land now
//! ```
//!
//! Each pass commits on its own so a failed batch keeps its progress.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};

use crate::client::MapClient;
use crate::context::PlacementContext;
use crate::domain::events::PlacementEvent;
use crate::domain::ids::{BlockId, BucketId, ChunkId, ObjectId, TierId};
use crate::domain::model::{Chunk, Part};
use crate::domain::records::{ChunkRecord, MappingCommit, ObjectRecord, PartRecord};
use crate::error::{Error, Result};
use crate::mapper::select_tier_for_write;

/// What one pass over the batch decided and did.
#[derive(Debug, Default)]
struct BuildPass {
    chunks: Vec<Chunk>,
    delete_blocks: Vec<BlockId>,
    chunks_to_delete: Vec<ChunkId>,
    objects_to_delete: Vec<ObjectId>,
    /// Chunks of deleted buckets, neither built nor failed
    abandoned: HashSet<ChunkId>,
}

/// Outcome of preparing one live chunk.
enum Prepared {
    Build,
    /// Nothing live points to the chunk any more
    Delete(&'static str),
    Abandon(Vec<ObjectId>),
}

pub struct MapBuilder<'a> {
    ctx: &'a PlacementContext,
    move_to_tier: Option<TierId>,
}

impl<'a> MapBuilder<'a> {
    pub fn new(ctx: &'a PlacementContext) -> Self {
        Self {
            ctx,
            move_to_tier: None,
        }
    }

    /// Rebuild chunks into `tier` instead of their own tier.
    pub fn move_to_tier(mut self, tier: Option<TierId>) -> Self {
        self.move_to_tier = tier;
        self
    }

    /// Build the chunks twice under exclusive ownership of their ids.
    ///
    /// Returns [`Error::BuildIncomplete`] when any chunk failed in either
    /// pass, after committing everything that succeeded.
    #[instrument(skip_all, fields(chunks = chunk_ids.len(), move_to_tier = ?self.move_to_tier))]
    pub async fn run(&self, chunk_ids: &[ChunkId]) -> Result<()> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let _guard = self.ctx.builder_lock.lock(chunk_ids.iter().copied()).await;

        let mut failed = Vec::new();
        let touched = self.run_build(chunk_ids, &mut failed).await?;
        if !touched.is_empty() {
            debug!(chunks = touched.len(), "Second pass for pending deletions");
            self.run_build(&touched, &mut failed).await?;
        }

        info!(
            chunks = chunk_ids.len(),
            second_pass = touched.len(),
            failed = failed.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "MapBuilder done"
        );
        if !failed.is_empty() {
            failed.sort();
            failed.dedup();
            return Err(Error::BuildIncomplete { failed });
        }
        Ok(())
    }

    /// One load, fix, build and commit pass. Returns the ids that need a
    /// second pass.
    async fn run_build(&self, chunk_ids: &[ChunkId], failed: &mut Vec<String>) -> Result<Vec<ChunkId>> {
        let records = self.ctx.md_store.find_chunks_by_ids(chunk_ids).await?;
        self.ctx.system_store.refresh().await?;
        let ids: Vec<ChunkId> = records.iter().map(|r| r.id).collect();
        let (blocks, (parts, objects)) = futures::try_join!(
            self.ctx.md_store.load_blocks_for_chunks(&ids),
            self.ctx.md_store.load_parts_objects_for_chunks(&ids),
        )?;

        let mut pass = BuildPass::default();
        let (deleted, live): (Vec<ChunkRecord>, Vec<ChunkRecord>) =
            records.into_iter().partition(|r| r.deleted);

        for record in &deleted {
            let live_blocks: Vec<BlockId> = blocks
                .iter()
                .filter(|b| b.chunk_id == record.id && !b.deleted)
                .map(|b| b.id)
                .collect();
            if !live_blocks.is_empty() {
                info!(chunk = %record.id, blocks = live_blocks.len(), "Undeleted blocks of a deleted chunk");
                pass.delete_blocks.extend(live_blocks);
            }
        }

        let objects_by_id: HashMap<ObjectId, &ObjectRecord> =
            objects.iter().map(|o| (o.id, o)).collect();
        for record in &live {
            let mut chunk = record.to_chunk(&blocks);
            let chunk_parts: Vec<&PartRecord> =
                parts.iter().filter(|p| p.chunk_id == record.id).collect();
            chunk.parts = chunk_parts.iter().map(|p| Part::from(*p)).collect();
            let mut chunk_objects: Vec<&ObjectRecord> = Vec::new();
            for part in &chunk_parts {
                if let Some(obj) = objects_by_id.get(&part.obj_id) {
                    if !chunk_objects.iter().any(|o| o.id == obj.id) {
                        chunk_objects.push(obj);
                    }
                }
            }

            match self.prepare_chunk(&mut chunk, &chunk_objects).await {
                Ok(Prepared::Build) => {}
                Ok(Prepared::Delete(reason)) => {
                    warn!(chunk = %chunk.label(), reason, "Deleting unreferenced chunk");
                    pass.chunks_to_delete.push(record.id);
                    continue;
                }
                Ok(Prepared::Abandon(objects)) => {
                    pass.objects_to_delete.extend(objects);
                    pass.abandoned.insert(record.id);
                    continue;
                }
                Err(e) => {
                    error!(chunk = %chunk.label(), error = %e, "Failed to prepare chunk for builder");
                    self.ctx
                        .publish(PlacementEvent::chunk_build_failed(chunk.label(), e.to_string()))
                        .await;
                    chunk.had_errors = true;
                }
            }
            pass.chunks.push(chunk);
        }

        self.build_chunks(&mut pass.chunks).await;
        self.update_db(&pass).await?;

        failed.extend(pass.chunks.iter().filter(|c| c.had_errors).map(|c| c.label()));
        Ok(pass
            .chunks
            .iter()
            .filter(|c| !c.had_errors && (c.has_allocations() || c.has_future_deletions()))
            .filter_map(|c| c.id)
            .collect())
    }

    /// Attach the owning bucket and a live tier, or decide the chunk should
    /// not be built at all.
    async fn prepare_chunk(&self, chunk: &mut Chunk, objects: &[&ObjectRecord]) -> Result<Prepared> {
        // an empty part list counts as all deleted
        if chunk.parts.iter().all(|p| p.deleted) {
            return Ok(Prepared::Delete("no live parts point to the chunk"));
        }
        if objects.is_empty() {
            return Ok(Prepared::Delete("no live objects hold the chunk"));
        }

        if let Some(abandoned) = self.fix_chunk_bucket(chunk, objects).await? {
            return Ok(Prepared::Abandon(abandoned));
        }

        let bucket = self
            .ctx
            .system_store
            .bucket(&chunk.bucket_id)
            .ok_or_else(|| Error::BucketNotFound(chunk.bucket_id.to_string()))?;
        let tier_alive = chunk
            .tier_id
            .map(|t| {
                self.ctx.system_store.tier(&t).is_some() && bucket.tiering.tier_order(&t).is_some()
            })
            .unwrap_or(false);
        if !tier_alive {
            self.ctx
                .allocator
                .refresh_tiering_alloc(&bucket.tiering, false)
                .await?;
            let status = self.ctx.allocator.tiering_status(&bucket.tiering);
            let tier = select_tier_for_write(&self.ctx.mapper_cache, &bucket.tiering, &status, None)
                .ok_or_else(|| Error::NoTierForWrite {
                    chunk: chunk.label(),
                    tiering: bucket.tiering.name.clone(),
                })?;
            warn!(chunk = %chunk.label(), tier = %tier.name, "Chunk tier is gone, selected a new one");
            chunk.tier_id = Some(tier.id);
        }
        Ok(Prepared::Build)
    }

    /// Make the chunk bucket agree with the buckets of its objects.
    ///
    /// Returns the objects to delete when the chunk belongs to a deleted
    /// bucket.
    async fn fix_chunk_bucket(
        &self,
        chunk: &mut Chunk,
        objects: &[&ObjectRecord],
    ) -> Result<Option<Vec<ObjectId>>> {
        let mut object_buckets: Vec<BucketId> = Vec::new();
        for obj in objects {
            if !object_buckets.contains(&obj.bucket_id) {
                object_buckets.push(obj.bucket_id);
            }
        }
        let valid: Vec<BucketId> = object_buckets
            .iter()
            .copied()
            .filter(|b| self.ctx.system_store.bucket(b).is_some())
            .collect();

        if valid.is_empty() {
            let deleted = self
                .ctx
                .system_store
                .bucket_include_deleted(&chunk.bucket_id)
                .filter(|b| b.deleted);
            let Some(deleted) = deleted else {
                error!(
                    chunk = %chunk.label(),
                    objects = objects.len(),
                    "Chunk held by objects without a valid bucket"
                );
                return Err(Error::InvalidChunk {
                    chunk: chunk.label(),
                    reason: "held by invalid objects".to_string(),
                });
            };
            warn!(chunk = %chunk.label(), bucket = %deleted.name, "Chunk held by a deleted bucket, deleting its objects");
            return Ok(Some(
                objects
                    .iter()
                    .filter(|o| o.bucket_id == deleted.id)
                    .map(|o| o.id)
                    .collect(),
            ));
        }

        if valid.len() > 1 {
            error!(chunk = %chunk.label(), buckets = valid.len(), "Chunk held by objects of different buckets");
            self.ctx
                .publish(PlacementEvent::bucket_anomaly(
                    chunk.label(),
                    format!("held by objects of {} buckets", valid.len()),
                ))
                .await;
        }

        let own_valid = self.ctx.system_store.bucket(&chunk.bucket_id).is_some()
            && object_buckets.contains(&chunk.bucket_id);
        if !own_valid {
            let fixed = valid[0];
            error!(chunk = %chunk.label(), bucket = %chunk.bucket_id, fixed = %fixed, "Chunk holds an invalid bucket, fixing");
            self.ctx
                .publish(PlacementEvent::bucket_anomaly(
                    chunk.label(),
                    format!("bucket {} replaced by {}", chunk.bucket_id, fixed),
                ))
                .await;
            if let Some(id) = chunk.id {
                self.ctx.md_store.update_chunk_bucket(&id, &fixed).await?;
            }
            chunk.bucket_id = fixed;
        }
        Ok(None)
    }

    /// Run the map client per bucket. Failures stay on the chunks.
    async fn build_chunks(&self, chunks: &mut Vec<Chunk>) {
        let (mut ready, blocked): (Vec<Chunk>, Vec<Chunk>) =
            chunks.drain(..).partition(|c| !c.had_errors);
        ready.sort_by_key(|c| c.bucket_id);

        for group in ready.chunk_by_mut(|a, b| a.bucket_id == b.bucket_id) {
            let result = MapClient::new(self.ctx)
                .desc("builder")
                .move_to_tier(self.move_to_tier)
                .run(group)
                .await;
            match result {
                Ok(()) | Err(Error::BuildIncomplete { .. }) => {}
                Err(e) => {
                    error!(chunks = group.len(), error = %e, "Builder batch failed");
                    for chunk in group.iter_mut() {
                        chunk.had_errors = true;
                    }
                }
            }
        }
        chunks.extend(ready);
        chunks.extend(blocked);
    }

    async fn update_db(&self, pass: &BuildPass) -> Result<()> {
        debug!(
            chunks = pass.chunks.len(),
            failed = pass.chunks.iter().filter(|c| c.had_errors).count(),
            abandoned = pass.abandoned.len(),
            delete_blocks = pass.delete_blocks.len(),
            chunks_to_delete = pass.chunks_to_delete.len(),
            objects_to_delete = pass.objects_to_delete.len(),
            "Builder update"
        );
        if !pass.delete_blocks.is_empty() {
            self.ctx
                .md_store
                .commit(MappingCommit {
                    delete_blocks: pass.delete_blocks.clone(),
                    ..Default::default()
                })
                .await?;
        }
        if !pass.chunks_to_delete.is_empty() {
            self.ctx.md_store.delete_chunks(&pass.chunks_to_delete).await?;
        }
        let mut seen = HashSet::new();
        for obj in pass.objects_to_delete.iter().filter(|o| seen.insert(**o)) {
            if let Err(e) = self.ctx.md_store.delete_object(obj).await {
                error!(object = %obj, error = %e, "Failed to delete object");
            }
        }
        Ok(())
    }
}
