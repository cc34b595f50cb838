//! Shared in-memory cluster for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use chunkmap::adapters::{
    InMemoryBlockStore, InMemoryEventCollector, InMemoryMetadataStore, InMemoryNodeAllocator,
    InMemorySystemStore, LocalScrubber, ReedSolomonChunkCodec,
};
use chunkmap::domain::{
    BlockRecord, Bucket, BucketId, Chunk, ChunkCodec, ChunkCoderConfig, ChunkId, HostId, Mirror,
    NodeId, NodeInfo, NodeType, ObjectId, ObjectRecord, Part, Pool, PoolKind, ScrubberClient,
    Tier, TierId, TierOrder, Tiering,
};
use chunkmap::{MapClient, PlacementConfig, PlacementContext, PlacementPorts, Result};

pub const MIB: u64 = 1024 * 1024;

/// Small thresholds and fast retries so tests run on tiny clusters.
pub fn test_config() -> PlacementConfig {
    let mut config = PlacementConfig::default();
    config.mapper.min_tier_free_threshold = MIB;
    config.mapper.max_tier_free_threshold = MIB;
    config.room.enough_room_in_tier_threshold = 2 * MIB;
    config.room.barrier_expiry = Duration::from_millis(5);
    config.mapping.max_allocation_attempts = 4;
    config.io.write_retry_delay = Duration::from_millis(1);
    config.io.replicate_retry_delay = Duration::from_millis(1);
    config
}

pub struct Setup {
    pub coder: ChunkCoderConfig,
    pub hot_nodes: usize,
    pub node_capacity: u64,
    /// Add a cloud-backed cold tier after the hot tier
    pub cold_tier: bool,
    pub config: PlacementConfig,
    /// Replaces the in-process scrubber
    pub scrubber: Option<Arc<dyn ScrubberClient>>,
    /// Allocator shared with a replacement scrubber
    pub allocator: Option<Arc<InMemoryNodeAllocator>>,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            coder: ChunkCoderConfig::replicated(1),
            hot_nodes: 4,
            node_capacity: 64 * MIB,
            cold_tier: true,
            config: test_config(),
            scrubber: None,
            allocator: None,
        }
    }
}

pub struct Harness {
    pub ctx: Arc<PlacementContext>,
    pub md: Arc<InMemoryMetadataStore>,
    pub system: Arc<InMemorySystemStore>,
    pub allocator: Arc<InMemoryNodeAllocator>,
    pub blocks: Arc<InMemoryBlockStore>,
    pub events: Arc<InMemoryEventCollector>,
    pub bucket: Arc<Bucket>,
    pub hot: Arc<Tier>,
    pub cold: Option<Arc<Tier>>,
    pub hot_pool: Arc<Pool>,
    pub cold_pool: Arc<Pool>,
    pub hot_nodes: Vec<NodeInfo>,
}

impl Harness {
    pub fn new(setup: Setup) -> Self {
        let hot_pool = Arc::new(Pool::new("hot-pool", PoolKind::Hosts));
        let cold_pool = Arc::new(Pool::new("cold-pool", PoolKind::Cloud));
        let hot = Arc::new(Tier::new(
            "hot",
            setup.coder,
            vec![Mirror::new(vec![hot_pool.clone()])],
        ));
        let mut tiers = vec![TierOrder::new(hot.clone(), 0)];
        let cold = setup.cold_tier.then(|| {
            Arc::new(Tier::new(
                "cold",
                setup.coder,
                vec![Mirror::new(vec![cold_pool.clone()])],
            ))
        });
        if let Some(cold) = &cold {
            tiers.push(TierOrder::new(cold.clone(), 1));
        }

        let system = Arc::new(InMemorySystemStore::new());
        let bucket = system.add_bucket(Bucket::new("bucket", Arc::new(Tiering::new("policy", tiers))));

        let allocator = setup
            .allocator
            .unwrap_or_else(|| Arc::new(InMemoryNodeAllocator::new()));
        let hot_nodes = (0..setup.hot_nodes)
            .map(|i| {
                allocator.add_node(
                    format!("hot-{}", i),
                    &hot_pool,
                    HostId::new(),
                    NodeType::BlockStoreFs,
                    setup.node_capacity,
                )
            })
            .collect();
        if setup.cold_tier {
            allocator.add_node(
                "cold-0",
                &cold_pool,
                HostId::new(),
                NodeType::BlockStoreCloud,
                1024 * MIB,
            );
        }

        let md = Arc::new(InMemoryMetadataStore::new());
        let blocks = Arc::new(InMemoryBlockStore::new(allocator.clone()));
        let events = Arc::new(InMemoryEventCollector::new());
        let local = Arc::new(LocalScrubber::new());
        let scrubber: Arc<dyn ScrubberClient> = match setup.scrubber {
            Some(scrubber) => scrubber,
            None => local.clone(),
        };

        let ports = PlacementPorts {
            md_store: md.clone(),
            system_store: system.clone(),
            allocator: allocator.clone(),
            codec: Arc::new(ReedSolomonChunkCodec::new()),
            block_store: blocks.clone(),
            scrubber,
            events: events.clone(),
        };
        let ctx = Arc::new(PlacementContext::new(setup.config, ports).unwrap());
        local.bind(&ctx);

        Self {
            ctx,
            md,
            system,
            allocator,
            blocks,
            events,
            bucket,
            hot,
            cold,
            hot_pool,
            cold_pool,
            hot_nodes,
        }
    }

    /// New chunk of `payload`, referenced by a fresh object.
    pub fn new_chunk(&self, payload: &[u8]) -> Chunk {
        let encoded = self.ctx.codec.encode(&self.hot.coder, payload).unwrap();
        let mut chunk = encoded.to_new_chunk(self.bucket.id, self.hot.coder);
        let object = ObjectRecord {
            id: ObjectId::new(),
            bucket_id: self.bucket.id,
            key: format!("obj-{}", ObjectId::new()),
            deleted: false,
        };
        chunk.parts.push(Part::new(object.id, 0, payload.len() as u64, 0));
        self.md.insert_object(object);
        chunk
    }

    pub async fn upload(&self, payloads: &[&[u8]]) -> Result<Vec<Chunk>> {
        let mut chunks: Vec<Chunk> = payloads.iter().map(|p| self.new_chunk(p)).collect();
        MapClient::new(&self.ctx)
            .desc("test upload")
            .check_dups(true)
            .run(&mut chunks)
            .await?;
        Ok(chunks)
    }

    /// Upload one chunk and return its id.
    pub async fn upload_one(&self, payload: &[u8]) -> ChunkId {
        let chunks = self.upload(&[payload]).await.unwrap();
        chunks[0].id.unwrap()
    }

    pub fn live_blocks(&self, chunk: &ChunkId) -> Vec<BlockRecord> {
        self.md.live_blocks(chunk)
    }

    pub fn live_nodes(&self, chunk: &ChunkId) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.live_blocks(chunk).iter().map(|b| b.node_id).collect();
        nodes.sort();
        nodes
    }

    pub fn tier_of(&self, chunk: &ChunkId) -> TierId {
        self.md.chunk(chunk).unwrap().tier_id
    }
}

pub fn payload(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
}

/// Scrubber that makes room by growing the capacity of the given nodes.
pub struct GrowingScrubber {
    pub allocator: Arc<InMemoryNodeAllocator>,
    pub nodes: parking_lot::Mutex<Vec<NodeId>>,
    pub capacity: u64,
    pub make_room_calls: AtomicUsize,
}

impl GrowingScrubber {
    pub fn new(allocator: Arc<InMemoryNodeAllocator>, capacity: u64) -> Self {
        Self {
            allocator,
            nodes: parking_lot::Mutex::new(Vec::new()),
            capacity,
            make_room_calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.make_room_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScrubberClient for GrowingScrubber {
    async fn build_chunks(&self, _chunk_ids: Vec<ChunkId>, _tier: Option<TierId>) -> Result<()> {
        Ok(())
    }

    async fn make_room_in_tier(&self, _tier: TierId, _bucket: BucketId) -> Result<()> {
        self.make_room_calls.fetch_add(1, Ordering::SeqCst);
        for node in self.nodes.lock().iter() {
            self.allocator.set_capacity(node, self.capacity);
        }
        Ok(())
    }
}
