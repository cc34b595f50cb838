//! Domain Layer
//!
//! Data model and collaborator ports of the placement core.
//!
//! # Architecture
//!
//! - **Ids** (`ids.rs`) - Typed identifiers
//! - **Model** (`model.rs`) - Mapping view of chunks, frags, blocks and allocations
//! - **Records** (`records.rs`) - Storage view rows and conversions
//! - **System** (`system.rs`) - Pools, tiers, tiering policies, capacity snapshots
//! - **Ports** (`ports.rs`) - Trait abstractions for external collaborators
//! - **Events** (`events.rs`) - Failure and anomaly events
//!
//! # Usage
//!
//! ```ignore
//! use chunkmap::domain::model::{Chunk, ChunkCoderConfig};
//!
//! let chunk = Chunk::new(bucket.id, ChunkCoderConfig::erasure(4, 2, 1), size, frag_size);
//! assert_eq!(chunk.frags.len(), 6);
//! ```

pub mod events;
pub mod ids;
pub mod model;
pub mod ports;
pub mod records;
pub mod system;

pub use events::PlacementEvent;
pub use ids::{
    BlockId, BucketId, ChunkId, FragId, HostId, MirrorId, MultipartId, NodeId, ObjectId, PartId,
    PoolId, TierId, TieringId,
};
pub use model::{
    Allocation, AllocationStatus, Block, BlockMd, Chunk, ChunkCoderConfig, CipherMeta, Frag,
    FragIndex, Part,
};
pub use ports::{
    BlockStoreClient, ChunkCodec, EncodedChunk, EncodedFrag, EventPublisher, MetadataStore,
    NodeAllocator, ScrubberClient, SystemStore,
};
pub use records::{BlockRecord, ChunkRecord, FragRecord, MappingCommit, ObjectRecord, PartRecord};
pub use system::{
    Bucket, LocationInfo, Mirror, MirrorStorage, NodeInfo, NodeType, Pool, PoolKind, PoolStatus,
    Tier, TierOrder, TierStatus, Tiering, TieringStatus,
};
