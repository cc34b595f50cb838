//! Domain Ports
//!
//! The collaborators the placement core talks to. Infrastructure adapters
//! implement these traits; the in-memory ones in [`crate::adapters`] back the
//! simulator and the tests.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Placement Core                            │
//! │  GetMapping │ PutMapping │ MapBuilder │ MapClient │ Room     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Ports                                 │
//! │  MetadataStore │ SystemStore │ NodeAllocator │ ChunkCodec    │
//! │  BlockStoreClient │ ScrubberClient │ EventPublisher          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::events::PlacementEvent;
use super::ids::{BucketId, ChunkId, HostId, NodeId, ObjectId, PoolId, TierId};
use super::model::{BlockMd, Chunk, ChunkCoderConfig, FragIndex};
use super::records::{BlockRecord, ChunkRecord, MappingCommit, ObjectRecord, PartRecord};
use super::system::{Bucket, NodeInfo, Tier, Tiering, TieringStatus};
use crate::error::{BlockIoError, Result};

// =============================================================================
// Metadata Store Port
// =============================================================================

/// Persistence of chunks, blocks, parts and objects.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Load chunks by id, deleted ones included.
    async fn find_chunks_by_ids(&self, ids: &[ChunkId]) -> Result<Vec<ChunkRecord>>;

    /// Live chunks of a bucket carrying any of the given digests.
    async fn find_chunks_by_dedup_key(
        &self,
        bucket: &BucketId,
        digests: &[String],
    ) -> Result<Vec<ChunkRecord>>;

    /// All block rows of the given chunks, deleted ones included.
    async fn load_blocks_for_chunks(&self, ids: &[ChunkId]) -> Result<Vec<BlockRecord>>;

    /// Parts referencing the given chunks and the objects owning them.
    async fn load_parts_objects_for_chunks(
        &self,
        ids: &[ChunkId],
    ) -> Result<(Vec<PartRecord>, Vec<ObjectRecord>)>;

    /// Live chunks of a tier, least recently placed first.
    async fn find_oldest_tier_chunk_ids(&self, tier: &TierId, limit: usize) -> Result<Vec<ChunkId>>;

    async fn update_chunk_bucket(&self, chunk: &ChunkId, bucket: &BucketId) -> Result<()>;

    /// Apply every insert, delete and tier update of a mapping as one unit.
    async fn commit(&self, commit: MappingCommit) -> Result<()>;

    /// Mark chunks and their blocks deleted.
    async fn delete_chunks(&self, ids: &[ChunkId]) -> Result<()>;

    /// Remove an object and its part mappings.
    async fn delete_object(&self, id: &ObjectId) -> Result<()>;
}

// =============================================================================
// System Store Port
// =============================================================================

/// Buckets, tiers and pools configuration.
#[async_trait]
pub trait SystemStore: Send + Sync {
    async fn refresh(&self) -> Result<()>;

    /// Live bucket by id.
    fn bucket(&self, id: &BucketId) -> Option<Arc<Bucket>>;

    /// Bucket by id even when it was deleted.
    fn bucket_include_deleted(&self, id: &BucketId) -> Option<Arc<Bucket>>;

    fn tier(&self, id: &TierId) -> Option<Arc<Tier>>;
}

// =============================================================================
// Node Allocator Port
// =============================================================================

/// Live node capacity and node selection.
#[async_trait]
pub trait NodeAllocator: Send + Sync {
    /// Reload the capacity view of a tiering; `force` bypasses any freshness window.
    async fn refresh_tiering_alloc(&self, tiering: &Tiering, force: bool) -> Result<()>;

    /// Last refreshed capacity snapshot of every tier in the policy.
    fn tiering_status(&self, tiering: &Tiering) -> TieringStatus;

    /// Pick a writable node in one of `pools` outside the avoid lists.
    fn allocate_node(
        &self,
        pools: &[PoolId],
        avoid_nodes: &HashSet<NodeId>,
        avoid_hosts: &HashSet<HostId>,
    ) -> Option<NodeInfo>;

    /// Resolve nodes for block population. Unknown ids are absent.
    async fn nodes_by_ids(&self, ids: &[NodeId]) -> Result<HashMap<NodeId, NodeInfo>>;
}

// =============================================================================
// Codec Port
// =============================================================================

/// One coded fragment with its digest.
#[derive(Debug, Clone)]
pub struct EncodedFrag {
    pub index: FragIndex,
    pub data: Bytes,
    pub digest: String,
}

/// Output of encoding or rebuilding a chunk.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub data: Bytes,
    pub digest: String,
    pub frag_size: u64,
    pub frags: Vec<EncodedFrag>,
}

impl EncodedChunk {
    /// New, unmapped chunk carrying this encoding's bytes and digests.
    pub fn to_new_chunk(&self, bucket_id: BucketId, coder: ChunkCoderConfig) -> Chunk {
        let mut chunk = Chunk::new(bucket_id, coder, self.data.len() as u64, self.frag_size);
        chunk.digest = Some(self.digest.clone());
        for encoded in &self.frags {
            if let Some(frag) = chunk.frag_mut(encoded.index) {
                frag.digest = Some(encoded.digest.clone());
                frag.data = Some(encoded.data.clone());
            }
        }
        chunk
    }
}

/// Erasure coding of whole chunks.
pub trait ChunkCodec: Send + Sync {
    /// Split and code fresh bytes into every fragment of `coder`.
    fn encode(&self, coder: &ChunkCoderConfig, data: &[u8]) -> Result<EncodedChunk>;

    /// Rebuild the chunk and all of its fragments from the available ones.
    fn reconstruct(
        &self,
        coder: &ChunkCoderConfig,
        size: u64,
        available: Vec<(FragIndex, Bytes)>,
    ) -> Result<EncodedChunk>;
}

// =============================================================================
// Storage Node RPC Port
// =============================================================================

/// Block operations served by storage node agents.
#[async_trait]
pub trait BlockStoreClient: Send + Sync {
    async fn write_block(&self, block: &BlockMd, data: Bytes) -> std::result::Result<(), BlockIoError>;

    /// Copy `source` into `target`, executed by the target's agent.
    async fn replicate_block(
        &self,
        target: &BlockMd,
        source: &BlockMd,
    ) -> std::result::Result<(), BlockIoError>;

    /// Reserve space for a block before it is written.
    async fn preallocate_block(&self, block: &BlockMd) -> std::result::Result<(), BlockIoError>;

    async fn read_block(&self, block: &BlockMd) -> std::result::Result<Bytes, BlockIoError>;
}

// =============================================================================
// Capacity Repair RPC Port
// =============================================================================

/// Remote scrubber calls used by capacity repair.
#[async_trait]
pub trait ScrubberClient: Send + Sync {
    /// Rebuild chunks, optionally moving them into `tier`.
    async fn build_chunks(&self, chunk_ids: Vec<ChunkId>, tier: Option<TierId>) -> Result<()>;

    async fn make_room_in_tier(&self, tier: TierId, bucket: BucketId) -> Result<()>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: PlacementEvent) -> Result<()>;

    async fn publish_all(&self, events: Vec<PlacementEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}
