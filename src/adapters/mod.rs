//! Infrastructure Adapters
//!
//! Implementations of the domain ports. The in-memory ones back the
//! simulator binary and the integration tests.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  MetadataStore │ SystemStore │ NodeAllocator │ ChunkCodec  │ │
//! │  │  BlockStoreClient │ ScrubberClient │ EventPublisher        │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InMemoryMetadataStore │ InMemorySystemStore               │ │
//! │  │ InMemoryNodeAllocator │ InMemoryBlockStore                │ │
//! │  │ ReedSolomonChunkCodec │ LocalScrubber │ Event publishers  │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use chunkmap::adapters::{InMemoryNodeAllocator, ReedSolomonChunkCodec};
//! use chunkmap::domain::ports::ChunkCodec;
//!
//! let codec = ReedSolomonChunkCodec::new();
//! let encoded = codec.encode(&tier.coder, &data)?;
//! ```

mod block_store;
mod event_publisher;
mod metadata_store;
mod node_allocator;
mod reed_solomon;
mod scrubber;
mod system_store;

pub use block_store::InMemoryBlockStore;
pub use event_publisher::{CompositeEventPublisher, InMemoryEventCollector, LoggingEventPublisher};
pub use metadata_store::InMemoryMetadataStore;
pub use node_allocator::InMemoryNodeAllocator;
pub use reed_solomon::{digest, ReedSolomonChunkCodec};
pub use scrubber::LocalScrubber;
pub use system_store::InMemorySystemStore;
