//! Placement Context
//!
//! Everything the orchestrator, builder and client share: collaborators,
//! configuration, the mapper cache, I/O limits, the builder lock and the
//! capacity repair state. Built once per process and passed by reference.

use std::sync::Arc;

use tracing::warn;

use crate::client::IoLimits;
use crate::config::PlacementConfig;
use crate::domain::events::PlacementEvent;
use crate::domain::ids::ChunkId;
use crate::domain::ports::{
    BlockStoreClient, ChunkCodec, EventPublisher, MetadataStore, NodeAllocator, ScrubberClient,
    SystemStore,
};
use crate::error::Result;
use crate::mapper::TieringMapperCache;
use crate::mapping::RoomManager;
use crate::metrics::MapReporter;
use crate::sync::KeysLock;

/// External collaborators of the placement core.
#[derive(Clone)]
pub struct PlacementPorts {
    pub md_store: Arc<dyn MetadataStore>,
    pub system_store: Arc<dyn SystemStore>,
    pub allocator: Arc<dyn NodeAllocator>,
    pub codec: Arc<dyn ChunkCodec>,
    pub block_store: Arc<dyn BlockStoreClient>,
    pub scrubber: Arc<dyn ScrubberClient>,
    pub events: Arc<dyn EventPublisher>,
}

pub struct PlacementContext {
    pub config: PlacementConfig,
    pub md_store: Arc<dyn MetadataStore>,
    pub system_store: Arc<dyn SystemStore>,
    pub allocator: Arc<dyn NodeAllocator>,
    pub codec: Arc<dyn ChunkCodec>,
    pub block_store: Arc<dyn BlockStoreClient>,
    pub scrubber: Arc<dyn ScrubberClient>,
    pub events: Arc<dyn EventPublisher>,
    pub mapper_cache: TieringMapperCache,
    pub reporter: MapReporter,
    pub io_limits: IoLimits,
    pub room: RoomManager,
    /// At most one builder per chunk
    pub builder_lock: KeysLock<ChunkId>,
}

impl std::fmt::Debug for PlacementContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlacementContext")
            .field("config", &self.config)
            .field("mapper_cache", &self.mapper_cache.stats())
            .finish_non_exhaustive()
    }
}

impl PlacementContext {
    pub fn new(config: PlacementConfig, ports: PlacementPorts) -> Result<Self> {
        config.validate()?;
        let room = RoomManager::new(
            config.room.clone(),
            ports.scrubber.clone(),
            ports.system_store.clone(),
            ports.allocator.clone(),
        );
        Ok(Self {
            mapper_cache: TieringMapperCache::new(config.mapper.clone()),
            reporter: MapReporter::new()?,
            io_limits: IoLimits::new(&config.io),
            room,
            builder_lock: KeysLock::new(),
            md_store: ports.md_store,
            system_store: ports.system_store,
            allocator: ports.allocator,
            codec: ports.codec,
            block_store: ports.block_store,
            scrubber: ports.scrubber,
            events: ports.events,
            config,
        })
    }

    /// Publish without failing the caller; anomalies are never errors.
    pub async fn publish(&self, event: PlacementEvent) {
        let event_type = event.event_type();
        if let Err(e) = self.events.publish(event).await {
            warn!(event_type, error = %e, "Failed to publish placement event");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::adapters::{
        InMemoryBlockStore, InMemoryEventCollector, InMemoryMetadataStore, InMemoryNodeAllocator,
        InMemorySystemStore, LocalScrubber, ReedSolomonChunkCodec,
    };

    /// Context over fresh in-memory adapters, for unit tests below the
    /// orchestrators.
    pub(crate) struct TestContext {
        pub ctx: PlacementContext,
        pub md: Arc<InMemoryMetadataStore>,
        pub system: Arc<InMemorySystemStore>,
        pub allocator: Arc<InMemoryNodeAllocator>,
        pub events: Arc<InMemoryEventCollector>,
    }

    impl TestContext {
        pub(crate) fn new() -> Self {
            let md = Arc::new(InMemoryMetadataStore::new());
            let system = Arc::new(InMemorySystemStore::new());
            let allocator = Arc::new(InMemoryNodeAllocator::new());
            let events = Arc::new(InMemoryEventCollector::new());
            let ports = PlacementPorts {
                md_store: md.clone(),
                system_store: system.clone(),
                allocator: allocator.clone(),
                codec: Arc::new(ReedSolomonChunkCodec::new()),
                block_store: Arc::new(InMemoryBlockStore::new(allocator.clone())),
                scrubber: Arc::new(LocalScrubber::new()),
                events: events.clone(),
            };
            let ctx = PlacementContext::new(PlacementConfig::default(), ports).unwrap();
            Self {
                ctx,
                md,
                system,
                allocator,
                events,
            }
        }
    }
}
