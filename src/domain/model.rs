//! Mapping View
//!
//! The in-memory shape of a chunk while it travels through the mapping
//! pipeline: its fragments, their existing blocks and the allocation /
//! deletion proposals the mapper attaches to them.
//!
//! ```text
//! Chunk ──▶ [Frag] ──┬──▶ blocks            (existing replicas)
//!                    ├──▶ allocations       (blocks to create)
//!                    ├──▶ deletions         (blocks to remove now)
//!                    └──▶ future_deletions  (blocks to remove later)
//! ```

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{BlockId, BucketId, ChunkId, FragId, MirrorId, MultipartId, NodeId, ObjectId, PartId, PoolId, TierId};
use super::system::NodeInfo;
use crate::error::{Error, Result};

// =============================================================================
// Coding
// =============================================================================

/// Replication and erasure coding policy of a chunk or tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkCoderConfig {
    pub replicas: u32,
    pub data_frags: u32,
    pub parity_frags: u32,
    pub lrc_frags: u32,
}

impl Default for ChunkCoderConfig {
    fn default() -> Self {
        Self {
            replicas: 1,
            data_frags: 1,
            parity_frags: 0,
            lrc_frags: 0,
        }
    }
}

impl ChunkCoderConfig {
    /// Plain replication without erasure coding.
    pub fn replicated(replicas: u32) -> Self {
        Self {
            replicas,
            ..Default::default()
        }
    }

    /// Reed-Solomon k+m coding with the given replica count per fragment.
    pub fn erasure(data_frags: u32, parity_frags: u32, replicas: u32) -> Self {
        Self {
            replicas,
            data_frags,
            parity_frags,
            lrc_frags: 0,
        }
    }

    pub fn total_frags(&self) -> u32 {
        self.data_frags + self.parity_frags + self.lrc_frags
    }

    /// Fragment indexes in mapping order: data, parity, lrc.
    pub fn frag_indexes(&self) -> Vec<FragIndex> {
        (0..self.data_frags)
            .map(FragIndex::Data)
            .chain((0..self.parity_frags).map(FragIndex::Parity))
            .chain((0..self.lrc_frags).map(FragIndex::Lrc))
            .collect()
    }

    /// Same fragment layout, replicas aside.
    pub fn same_layout(&self, other: &ChunkCoderConfig) -> bool {
        self.data_frags == other.data_frags
            && self.parity_frags == other.parity_frags
            && self.lrc_frags == other.lrc_frags
    }
}

/// Typed position of a fragment inside its chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FragIndex {
    Data(u32),
    Parity(u32),
    Lrc(u32),
}

impl FragIndex {
    /// Position in a Reed-Solomon shard vector (data then parity).
    pub fn shard_position(&self, coder: &ChunkCoderConfig) -> Option<usize> {
        match *self {
            FragIndex::Data(i) if i < coder.data_frags => Some(i as usize),
            FragIndex::Parity(i) if i < coder.parity_frags => {
                Some((coder.data_frags + i) as usize)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for FragIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FragIndex::Data(i) => write!(f, "D{}", i),
            FragIndex::Parity(i) => write!(f, "P{}", i),
            FragIndex::Lrc(i) => write!(f, "L{}", i),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherMeta {
    pub cipher_type: String,
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
    pub auth_tag: Option<Vec<u8>>,
}

// =============================================================================
// Blocks
// =============================================================================

/// Address of a block as sent to a storage node agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMd {
    pub id: BlockId,
    pub node_id: NodeId,
    pub pool_id: PoolId,
    pub address: String,
    pub size: u64,
}

/// One physical replica of a fragment.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub node_id: NodeId,
    pub pool_id: PoolId,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub is_accessible: bool,
    /// Pool no longer belongs to the node or mirror
    pub is_misplaced: bool,
    pub is_preallocated: bool,
    /// Written during this run but not yet recorded in metadata
    pub pending_commit: bool,
    /// Resolved by block population, absent for orphans
    pub node: Option<NodeInfo>,
}

impl Block {
    /// New block placed on `node`, not yet written.
    pub fn allocate(node: &NodeInfo, size: u64) -> Self {
        Self {
            id: BlockId::new(),
            node_id: node.id,
            pool_id: node.pool_id,
            size,
            created_at: Utc::now(),
            is_accessible: false,
            is_misplaced: false,
            is_preallocated: false,
            pending_commit: false,
            node: Some(node.clone()),
        }
    }

    pub fn block_md(&self) -> Result<BlockMd> {
        let node = self
            .node
            .as_ref()
            .ok_or_else(|| Error::MissingBlockNode(self.id.to_string()))?;
        Ok(BlockMd {
            id: self.id,
            node_id: self.node_id,
            pool_id: self.pool_id,
            address: node.address.clone(),
            size: self.size,
        })
    }

    /// Newest first, ties broken by id for a stable order.
    pub fn newer_first(a: &Block, b: &Block) -> std::cmp::Ordering {
        b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id))
    }
}

// =============================================================================
// Allocations
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationStatus {
    Pending,
    Written,
    Failed,
}

/// A proposal to create one new block for a fragment.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub mirror_id: MirrorId,
    /// Candidate pools for node selection
    pub pools: Vec<PoolId>,
    /// Accessible blocks of the fragment usable as replication sources
    pub sources: Vec<BlockId>,
    /// Assigned by node allocation
    pub block: Option<Block>,
    pub status: AllocationStatus,
}

impl Allocation {
    pub fn new(mirror_id: MirrorId, pools: Vec<PoolId>, sources: Vec<BlockId>) -> Self {
        Self {
            mirror_id,
            pools,
            sources,
            block: None,
            status: AllocationStatus::Pending,
        }
    }
}

// =============================================================================
// Frags
// =============================================================================

#[derive(Debug, Clone)]
pub struct Frag {
    pub id: FragId,
    pub index: FragIndex,
    pub digest: Option<String>,
    pub blocks: Vec<Block>,
    pub allocations: Vec<Allocation>,
    pub deletions: Vec<Block>,
    pub future_deletions: Vec<Block>,
    /// Fresh bytes from an upload or a rebuild
    pub data: Option<Bytes>,
}

impl Frag {
    pub fn new(index: FragIndex) -> Self {
        Self {
            id: FragId::new(),
            index,
            digest: None,
            blocks: Vec::new(),
            allocations: Vec::new(),
            deletions: Vec::new(),
            future_deletions: Vec::new(),
            data: None,
        }
    }

    pub fn accessible_blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| b.is_accessible)
    }

    pub fn is_accessible(&self) -> bool {
        self.blocks.iter().any(|b| b.is_accessible)
    }
}

// =============================================================================
// Parts
// =============================================================================

/// Byte range of an object that references a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub id: Option<PartId>,
    pub obj_id: ObjectId,
    pub start: u64,
    pub end: u64,
    pub seq: u32,
    pub multipart_id: Option<MultipartId>,
    pub deleted: bool,
}

impl Part {
    pub fn new(obj_id: ObjectId, start: u64, end: u64, seq: u32) -> Self {
        Self {
            id: None,
            obj_id,
            start,
            end,
            seq,
            multipart_id: None,
            deleted: false,
        }
    }
}

// =============================================================================
// Chunks
// =============================================================================

#[derive(Debug, Clone)]
pub struct Chunk {
    /// Absent until the chunk is first committed
    pub id: Option<ChunkId>,
    pub bucket_id: BucketId,
    /// Tier recorded in metadata
    pub tier_id: Option<TierId>,
    /// Tier selected by the latest mapping pass
    pub mapped_tier_id: Option<TierId>,
    pub coder: ChunkCoderConfig,
    pub size: u64,
    pub compress_size: Option<u64>,
    pub frag_size: u64,
    pub digest: Option<String>,
    pub cipher: Option<CipherMeta>,
    pub frags: Vec<Frag>,
    pub parts: Vec<Part>,
    pub dup_chunk_id: Option<ChunkId>,
    pub had_errors: bool,
    pub is_building_blocks: bool,
    pub is_building_frags: bool,
    /// Whole chunk buffer, present while rebuilding missing frags
    pub data: Option<Bytes>,
}

impl Chunk {
    /// Fresh chunk with one empty frag per coded index.
    pub fn new(bucket_id: BucketId, coder: ChunkCoderConfig, size: u64, frag_size: u64) -> Self {
        Self {
            id: None,
            bucket_id,
            tier_id: None,
            mapped_tier_id: None,
            coder,
            size,
            compress_size: None,
            frag_size,
            digest: None,
            cipher: None,
            frags: coder.frag_indexes().into_iter().map(Frag::new).collect(),
            parts: Vec::new(),
            dup_chunk_id: None,
            had_errors: false,
            is_building_blocks: false,
            is_building_frags: false,
            data: None,
        }
    }

    pub fn is_new(&self) -> bool {
        self.id.is_none()
    }

    /// Stable identity for logs and errors.
    pub fn label(&self) -> String {
        match (&self.id, &self.digest) {
            (Some(id), _) => id.to_string(),
            (None, Some(digest)) => format!("new:{}", digest),
            (None, None) => "new:<no-digest>".to_string(),
        }
    }

    pub fn frag(&self, index: FragIndex) -> Option<&Frag> {
        self.frags.iter().find(|f| f.index == index)
    }

    pub fn frag_mut(&mut self, index: FragIndex) -> Option<&mut Frag> {
        self.frags.iter_mut().find(|f| f.index == index)
    }

    /// Readable when at least `data_frags` data or parity frags have an
    /// accessible block.
    pub fn is_accessible(&self) -> bool {
        let readable = self
            .frags
            .iter()
            .filter(|f| matches!(f.index, FragIndex::Data(_) | FragIndex::Parity(_)))
            .filter(|f| f.is_accessible())
            .count();
        readable >= self.coder.data_frags.max(1) as usize
    }

    pub fn has_allocations(&self) -> bool {
        self.frags.iter().any(|f| !f.allocations.is_empty())
    }

    pub fn has_future_deletions(&self) -> bool {
        self.frags.iter().any(|f| !f.future_deletions.is_empty())
    }

    pub fn num_allocations(&self) -> usize {
        self.frags.iter().map(|f| f.allocations.len()).sum()
    }

    pub fn num_deletions(&self) -> usize {
        self.frags.iter().map(|f| f.deletions.len()).sum()
    }

    /// Drop every proposal of a previous mapping pass.
    pub fn reset_mapping(&mut self) {
        for frag in &mut self.frags {
            frag.allocations.clear();
            frag.deletions.clear();
            frag.future_deletions.clear();
        }
        self.dup_chunk_id = None;
        self.mapped_tier_id = None;
        self.is_building_blocks = false;
        self.is_building_frags = false;
    }

    /// Move blocks already written by this run into the frag blocks so a
    /// re-map counts them instead of allocating them again.
    pub fn absorb_written_allocations(&mut self) -> usize {
        let mut absorbed = 0;
        for frag in &mut self.frags {
            for alloc in frag.allocations.drain(..) {
                if alloc.status != AllocationStatus::Written {
                    continue;
                }
                if let Some(mut block) = alloc.block {
                    block.pending_commit = true;
                    block.is_accessible = true;
                    frag.blocks.push(block);
                    absorbed += 1;
                }
            }
        }
        absorbed
    }
}
