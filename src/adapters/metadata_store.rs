//! In-Memory Metadata Store
//!
//! Implements the `MetadataStore` port over plain maps behind one lock, so a
//! `MappingCommit` is applied as a single unit.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;

use crate::domain::ids::{BlockId, BucketId, ChunkId, ObjectId, TierId};
use crate::domain::ports::MetadataStore;
use crate::domain::records::{BlockRecord, ChunkRecord, MappingCommit, ObjectRecord, PartRecord};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Tables {
    chunks: HashMap<ChunkId, ChunkRecord>,
    blocks: HashMap<BlockId, BlockRecord>,
    parts: Vec<PartRecord>,
    objects: HashMap<ObjectId, ObjectRecord>,
    commits: usize,
}

#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    tables: RwLock<Tables>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_object(&self, object: ObjectRecord) {
        self.tables.write().objects.insert(object.id, object);
    }

    pub fn chunk(&self, id: &ChunkId) -> Option<ChunkRecord> {
        self.tables.read().chunks.get(id).cloned()
    }

    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        let mut ids: Vec<ChunkId> = self.tables.read().chunks.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Live blocks of a chunk.
    pub fn live_blocks(&self, chunk: &ChunkId) -> Vec<BlockRecord> {
        self.tables
            .read()
            .blocks
            .values()
            .filter(|b| &b.chunk_id == chunk && !b.deleted)
            .cloned()
            .collect()
    }

    pub fn block(&self, id: &BlockId) -> Option<BlockRecord> {
        self.tables.read().blocks.get(id).cloned()
    }

    /// Ids of every block marked deleted.
    pub fn deleted_block_ids(&self) -> Vec<BlockId> {
        self.tables
            .read()
            .blocks
            .values()
            .filter(|b| b.deleted)
            .map(|b| b.id)
            .collect()
    }

    pub fn parts_of_chunk(&self, chunk: &ChunkId) -> Vec<PartRecord> {
        self.tables
            .read()
            .parts
            .iter()
            .filter(|p| &p.chunk_id == chunk)
            .cloned()
            .collect()
    }

    pub fn object(&self, id: &ObjectId) -> Option<ObjectRecord> {
        self.tables.read().objects.get(id).cloned()
    }

    /// Mark every part of an object deleted, as an object delete would.
    pub fn delete_object_parts(&self, id: &ObjectId) {
        for part in self.tables.write().parts.iter_mut() {
            if &part.obj_id == id {
                part.deleted = true;
            }
        }
    }

    /// Drop every part row of a chunk, leaving it referenced by nothing.
    pub fn detach_parts(&self, chunk: &ChunkId) -> usize {
        let mut tables = self.tables.write();
        let before = tables.parts.len();
        tables.parts.retain(|p| &p.chunk_id != chunk);
        before - tables.parts.len()
    }

    /// Number of non-empty commits applied.
    pub fn commit_count(&self) -> usize {
        self.tables.read().commits
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn find_chunks_by_ids(&self, ids: &[ChunkId]) -> Result<Vec<ChunkRecord>> {
        let tables = self.tables.read();
        Ok(ids
            .iter()
            .filter_map(|id| tables.chunks.get(id).cloned())
            .collect())
    }

    async fn find_chunks_by_dedup_key(
        &self,
        bucket: &BucketId,
        digests: &[String],
    ) -> Result<Vec<ChunkRecord>> {
        let tables = self.tables.read();
        let mut found: Vec<ChunkRecord> = tables
            .chunks
            .values()
            .filter(|c| !c.deleted && &c.bucket_id == bucket)
            .filter(|c| c.digest.as_ref().is_some_and(|d| digests.contains(d)))
            .cloned()
            .collect();
        found.sort_by_key(|c| c.id);
        Ok(found)
    }

    async fn load_blocks_for_chunks(&self, ids: &[ChunkId]) -> Result<Vec<BlockRecord>> {
        let tables = self.tables.read();
        Ok(tables
            .blocks
            .values()
            .filter(|b| ids.contains(&b.chunk_id))
            .cloned()
            .collect())
    }

    async fn load_parts_objects_for_chunks(
        &self,
        ids: &[ChunkId],
    ) -> Result<(Vec<PartRecord>, Vec<ObjectRecord>)> {
        let tables = self.tables.read();
        let parts: Vec<PartRecord> = tables
            .parts
            .iter()
            .filter(|p| ids.contains(&p.chunk_id))
            .cloned()
            .collect();
        let mut objects: Vec<ObjectRecord> = Vec::new();
        for part in &parts {
            if let Some(obj) = tables.objects.get(&part.obj_id) {
                if !obj.deleted && !objects.iter().any(|o| o.id == obj.id) {
                    objects.push(obj.clone());
                }
            }
        }
        Ok((parts, objects))
    }

    async fn find_oldest_tier_chunk_ids(&self, tier: &TierId, limit: usize) -> Result<Vec<ChunkId>> {
        let tables = self.tables.read();
        let mut chunks: Vec<&ChunkRecord> = tables
            .chunks
            .values()
            .filter(|c| !c.deleted && &c.tier_id == tier)
            .collect();
        chunks.sort_by_key(|c| (c.tier_lru, c.id));
        Ok(chunks.into_iter().take(limit).map(|c| c.id).collect())
    }

    async fn update_chunk_bucket(&self, chunk: &ChunkId, bucket: &BucketId) -> Result<()> {
        let mut tables = self.tables.write();
        let record = tables
            .chunks
            .get_mut(chunk)
            .ok_or_else(|| Error::Metadata(format!("chunk {} not found", chunk)))?;
        record.bucket_id = *bucket;
        Ok(())
    }

    async fn commit(&self, commit: MappingCommit) -> Result<()> {
        let mut tables = self.tables.write();
        if let Some((ids, _)) = &commit.tier_update {
            if let Some(missing) = ids.iter().find(|id| !tables.chunks.contains_key(id)) {
                return Err(Error::Metadata(format!("chunk {} not found", missing)));
            }
        }

        debug!(
            new_chunks = commit.new_chunks.len(),
            new_blocks = commit.new_blocks.len(),
            new_parts = commit.new_parts.len(),
            delete_blocks = commit.delete_blocks.len(),
            "Applying mapping commit"
        );
        for chunk in commit.new_chunks {
            tables.chunks.insert(chunk.id, chunk);
        }
        for block in commit.new_blocks {
            tables.blocks.insert(block.id, block);
        }
        tables.parts.extend(commit.new_parts);
        for id in &commit.delete_blocks {
            if let Some(block) = tables.blocks.get_mut(id) {
                block.deleted = true;
            }
        }
        if let Some((ids, tier)) = commit.tier_update {
            let now = Utc::now();
            for id in ids {
                if let Some(chunk) = tables.chunks.get_mut(&id) {
                    chunk.tier_id = tier;
                    chunk.tier_lru = now;
                }
            }
        }
        tables.commits += 1;
        Ok(())
    }

    async fn delete_chunks(&self, ids: &[ChunkId]) -> Result<()> {
        let mut tables = self.tables.write();
        for id in ids {
            if let Some(chunk) = tables.chunks.get_mut(id) {
                chunk.deleted = true;
            }
        }
        for block in tables.blocks.values_mut() {
            if ids.contains(&block.chunk_id) {
                block.deleted = true;
            }
        }
        Ok(())
    }

    async fn delete_object(&self, id: &ObjectId) -> Result<()> {
        let mut tables = self.tables.write();
        let object = tables
            .objects
            .get_mut(id)
            .ok_or_else(|| Error::Metadata(format!("object {} not found", id)))?;
        object.deleted = true;
        for part in tables.parts.iter_mut().filter(|p| &p.obj_id == id) {
            part.deleted = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::{NodeId, PoolId};
    use crate::domain::model::{Chunk, ChunkCoderConfig};

    fn chunk_record(bucket: BucketId, tier: TierId, digest: &str) -> ChunkRecord {
        let mut chunk = Chunk::new(bucket, ChunkCoderConfig::default(), 10, 10);
        chunk.digest = Some(digest.to_string());
        ChunkRecord::from_chunk(&chunk, ChunkId::new(), tier)
    }

    fn block_record(chunk: &ChunkRecord) -> BlockRecord {
        BlockRecord {
            id: BlockId::new(),
            chunk_id: chunk.id,
            frag_id: chunk.frags.first().map(|f| f.id).unwrap_or_default(),
            bucket_id: chunk.bucket_id,
            node_id: NodeId::new(),
            pool_id: PoolId::new(),
            size: 10,
            created_at: Utc::now(),
            deleted: false,
        }
    }

    #[tokio::test]
    async fn test_commit_applies_everything() {
        let store = InMemoryMetadataStore::new();
        let (bucket, tier) = (BucketId::new(), TierId::new());
        let chunk = chunk_record(bucket, tier, "d1");
        let block = block_record(&chunk);

        store
            .commit(MappingCommit {
                new_chunks: vec![chunk.clone()],
                new_blocks: vec![block.clone()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(store.live_blocks(&chunk.id).len(), 1);

        let next = TierId::new();
        store
            .commit(MappingCommit {
                delete_blocks: vec![block.id],
                tier_update: Some((vec![chunk.id], next)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(store.live_blocks(&chunk.id).is_empty());
        assert_eq!(store.chunk(&chunk.id).unwrap().tier_id, next);
        assert_eq!(store.commit_count(), 2);
    }

    #[tokio::test]
    async fn test_commit_rejects_unknown_tier_update() {
        let store = InMemoryMetadataStore::new();
        let result = store
            .commit(MappingCommit {
                new_blocks: vec![],
                tier_update: Some((vec![ChunkId::new()], TierId::new())),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(Error::Metadata(_))));
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_dedup_lookup_scoped_to_bucket() {
        let store = InMemoryMetadataStore::new();
        let tier = TierId::new();
        let (b1, b2) = (BucketId::new(), BucketId::new());
        let c1 = chunk_record(b1, tier, "same");
        let c2 = chunk_record(b2, tier, "same");
        store
            .commit(MappingCommit {
                new_chunks: vec![c1.clone(), c2],
                ..Default::default()
            })
            .await
            .unwrap();

        let found = store
            .find_chunks_by_dedup_key(&b1, &["same".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, c1.id);
    }

    #[tokio::test]
    async fn test_oldest_tier_chunks_first() {
        let store = InMemoryMetadataStore::new();
        let (bucket, tier) = (BucketId::new(), TierId::new());
        let mut old = chunk_record(bucket, tier, "a");
        old.tier_lru = Utc::now() - chrono::Duration::hours(1);
        let new = chunk_record(bucket, tier, "b");
        store
            .commit(MappingCommit {
                new_chunks: vec![new, old.clone()],
                ..Default::default()
            })
            .await
            .unwrap();

        let ids = store.find_oldest_tier_chunk_ids(&tier, 1).await.unwrap();
        assert_eq!(ids, vec![old.id]);
    }

    #[tokio::test]
    async fn test_delete_chunks_deletes_blocks() {
        let store = InMemoryMetadataStore::new();
        let chunk = chunk_record(BucketId::new(), TierId::new(), "x");
        let block = block_record(&chunk);
        store
            .commit(MappingCommit {
                new_chunks: vec![chunk.clone()],
                new_blocks: vec![block.clone()],
                ..Default::default()
            })
            .await
            .unwrap();

        store.delete_chunks(&[chunk.id]).await.unwrap();
        assert!(store.chunk(&chunk.id).unwrap().deleted);
        assert!(store.block(&block.id).unwrap().deleted);
        assert_eq!(store.deleted_block_ids(), vec![block.id]);
    }
}
