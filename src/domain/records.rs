//! Storage View
//!
//! Rows as the metadata store persists them, and the pure conversions
//! between these rows and the mapping view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{BlockId, BucketId, ChunkId, FragId, MultipartId, NodeId, ObjectId, PartId, PoolId, TierId};
use super::model::{Block, Chunk, ChunkCoderConfig, CipherMeta, Frag, FragIndex, Part};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragRecord {
    pub id: FragId,
    pub index: FragIndex,
    pub digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: ChunkId,
    pub bucket_id: BucketId,
    pub tier_id: TierId,
    pub coder: ChunkCoderConfig,
    pub size: u64,
    pub compress_size: Option<u64>,
    pub frag_size: u64,
    pub digest: Option<String>,
    pub cipher: Option<CipherMeta>,
    pub frags: Vec<FragRecord>,
    /// Last time the chunk was placed in its tier
    pub tier_lru: DateTime<Utc>,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub id: BlockId,
    pub chunk_id: ChunkId,
    pub frag_id: FragId,
    pub bucket_id: BucketId,
    pub node_id: NodeId,
    pub pool_id: PoolId,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRecord {
    pub id: PartId,
    pub obj_id: ObjectId,
    pub bucket_id: BucketId,
    pub chunk_id: ChunkId,
    pub start: u64,
    pub end: u64,
    pub seq: u32,
    pub multipart_id: Option<MultipartId>,
    pub uncommitted: bool,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub id: ObjectId,
    pub bucket_id: BucketId,
    pub key: String,
    pub deleted: bool,
}

/// Everything one put-mapping call writes, applied as a single unit.
#[derive(Debug, Clone, Default)]
pub struct MappingCommit {
    pub new_blocks: Vec<BlockRecord>,
    pub new_chunks: Vec<ChunkRecord>,
    pub new_parts: Vec<PartRecord>,
    pub delete_blocks: Vec<BlockId>,
    /// Chunks moved to another tier in the same unit
    pub tier_update: Option<(Vec<ChunkId>, TierId)>,
}

impl MappingCommit {
    pub fn is_empty(&self) -> bool {
        self.new_blocks.is_empty()
            && self.new_chunks.is_empty()
            && self.new_parts.is_empty()
            && self.delete_blocks.is_empty()
            && self.tier_update.is_none()
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl ChunkRecord {
    pub fn from_chunk(chunk: &Chunk, id: ChunkId, tier_id: TierId) -> Self {
        Self {
            id,
            bucket_id: chunk.bucket_id,
            tier_id,
            coder: chunk.coder,
            size: chunk.size,
            compress_size: chunk.compress_size,
            frag_size: chunk.frag_size,
            digest: chunk.digest.clone(),
            cipher: chunk.cipher.clone(),
            frags: chunk
                .frags
                .iter()
                .map(|f| FragRecord {
                    id: f.id,
                    index: f.index,
                    digest: f.digest.clone(),
                })
                .collect(),
            tier_lru: Utc::now(),
            deleted: false,
        }
    }

    /// Mapping view of this row with its live blocks attached.
    ///
    /// Blocks start inaccessible; block population decides reachability.
    pub fn to_chunk(&self, blocks: &[BlockRecord]) -> Chunk {
        let frags = self
            .frags
            .iter()
            .map(|fr| {
                let mut frag = Frag::new(fr.index);
                frag.id = fr.id;
                frag.digest = fr.digest.clone();
                frag.blocks = blocks
                    .iter()
                    .filter(|b| b.frag_id == fr.id && b.chunk_id == self.id && !b.deleted)
                    .map(Block::from_record)
                    .collect();
                frag
            })
            .collect();

        Chunk {
            id: Some(self.id),
            bucket_id: self.bucket_id,
            tier_id: Some(self.tier_id),
            mapped_tier_id: None,
            coder: self.coder,
            size: self.size,
            compress_size: self.compress_size,
            frag_size: self.frag_size,
            digest: self.digest.clone(),
            cipher: self.cipher.clone(),
            frags,
            parts: Vec::new(),
            dup_chunk_id: None,
            had_errors: false,
            is_building_blocks: false,
            is_building_frags: false,
            data: None,
        }
    }
}

impl Block {
    pub fn from_record(record: &BlockRecord) -> Self {
        Self {
            id: record.id,
            node_id: record.node_id,
            pool_id: record.pool_id,
            size: record.size,
            created_at: record.created_at,
            is_accessible: false,
            is_misplaced: false,
            is_preallocated: false,
            pending_commit: false,
            node: None,
        }
    }
}

impl BlockRecord {
    pub fn from_block(block: &Block, chunk_id: ChunkId, frag_id: FragId, bucket_id: BucketId) -> Self {
        Self {
            id: block.id,
            chunk_id,
            frag_id,
            bucket_id,
            node_id: block.node_id,
            pool_id: block.pool_id,
            size: block.size,
            created_at: block.created_at,
            deleted: false,
        }
    }
}

impl PartRecord {
    /// New part row pointing at `chunk_id`, not yet committed by its upload.
    pub fn uncommitted(part: &Part, chunk_id: ChunkId, bucket_id: BucketId) -> Self {
        Self {
            id: PartId::new(),
            obj_id: part.obj_id,
            bucket_id,
            chunk_id,
            start: part.start,
            end: part.end,
            seq: part.seq,
            multipart_id: part.multipart_id,
            uncommitted: true,
            deleted: false,
        }
    }
}

impl From<&PartRecord> for Part {
    fn from(record: &PartRecord) -> Self {
        Self {
            id: Some(record.id),
            obj_id: record.obj_id,
            start: record.start,
            end: record.end,
            seq: record.seq,
            multipart_id: record.multipart_id,
            deleted: record.deleted,
        }
    }
}
