//! chunkmap simulator
//!
//! Builds an in-memory cluster, uploads chunks through the map client, fails
//! storage nodes and lets the builder repair what they held.
//!
//! # Flow
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌────────────┐    ┌──────────┐    ┌────────┐
//! │  Build   │───▶│  Upload  │───▶│ Fail nodes │───▶│  Repair  │───▶│ Report │
//! │ cluster  │    │MapClient │    │            │    │MapBuilder│    │        │
//! └──────────┘    └──────────┘    └────────────┘    └──────────┘    └────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rand::Rng;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chunkmap::adapters::{
    CompositeEventPublisher, InMemoryBlockStore, InMemoryEventCollector, InMemoryMetadataStore,
    InMemoryNodeAllocator, InMemorySystemStore, LocalScrubber, LoggingEventPublisher,
    ReedSolomonChunkCodec,
};
use chunkmap::domain::{
    Bucket, Chunk, ChunkCodec, ChunkCoderConfig, ChunkId, HostId, MetadataStore, Mirror, NodeInfo,
    NodeType, ObjectId, ObjectRecord, Part, Pool, PoolKind, Tier, TierOrder, Tiering,
};
use chunkmap::{
    Error, MapBuilder, MapClient, PlacementArgs, PlacementConfig, PlacementContext, PlacementPorts,
};

const MIB: u64 = 1024 * 1024;

// =============================================================================
// CLI Arguments
// =============================================================================

/// chunkmap - simulate chunk placement, node failures and repair
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Storage nodes in the hot tier pool
    #[arg(long, env = "SIM_NODES", default_value_t = 8)]
    nodes: usize,

    /// Capacity of each hot node in MiB
    #[arg(long, env = "SIM_NODE_CAPACITY_MIB", default_value_t = 1024)]
    node_capacity_mib: u64,

    /// Chunks to upload
    #[arg(long, env = "SIM_CHUNKS", default_value_t = 32)]
    chunks: usize,

    /// Size of each chunk in KiB
    #[arg(long, env = "SIM_CHUNK_SIZE_KIB", default_value_t = 256)]
    chunk_size_kib: usize,

    /// Data fragments per chunk
    #[arg(long, env = "SIM_DATA_FRAGS", default_value_t = 4)]
    data_frags: u32,

    /// Parity fragments per chunk
    #[arg(long, env = "SIM_PARITY_FRAGS", default_value_t = 2)]
    parity_frags: u32,

    /// Replicas per fragment
    #[arg(long, env = "SIM_REPLICAS", default_value_t = 1)]
    replicas: u32,

    /// Hot nodes to fail after the upload
    #[arg(long, env = "SIM_FAIL_NODES", default_value_t = 1)]
    fail_nodes: usize,

    #[command(flatten)]
    placement: PlacementArgs,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Simulated Cluster
// =============================================================================

struct Cluster {
    ctx: Arc<PlacementContext>,
    md_store: Arc<InMemoryMetadataStore>,
    allocator: Arc<InMemoryNodeAllocator>,
    block_store: Arc<InMemoryBlockStore>,
    events: Arc<InMemoryEventCollector>,
    bucket: Arc<Bucket>,
    hot_tier: Arc<Tier>,
    hot_nodes: Vec<NodeInfo>,
}

fn build_cluster(args: &Args, config: PlacementConfig) -> anyhow::Result<Cluster> {
    let coder = ChunkCoderConfig::erasure(args.data_frags, args.parity_frags, args.replicas);

    let hot_pool = Arc::new(Pool::new("hot-pool", PoolKind::Hosts));
    let cold_pool = Arc::new(Pool::new("cold-pool", PoolKind::Cloud));
    let hot_tier = Arc::new(Tier::new("hot", coder, vec![Mirror::new(vec![hot_pool.clone()])]));
    let cold_tier = Arc::new(Tier::new("cold", coder, vec![Mirror::new(vec![cold_pool.clone()])]));
    let tiering = Arc::new(Tiering::new(
        "default",
        vec![TierOrder::new(hot_tier.clone(), 0), TierOrder::new(cold_tier, 1)],
    ));

    let system_store = Arc::new(InMemorySystemStore::new());
    let bucket = system_store.add_bucket(Bucket::new("sim", tiering));

    let allocator = Arc::new(InMemoryNodeAllocator::new());
    let hot_nodes: Vec<NodeInfo> = (0..args.nodes)
        .map(|i| {
            allocator.add_node(
                format!("hot-{}", i),
                &hot_pool,
                HostId::new(),
                NodeType::BlockStoreFs,
                args.node_capacity_mib * MIB,
            )
        })
        .collect();
    allocator.add_node(
        "cold-0",
        &cold_pool,
        HostId::new(),
        NodeType::BlockStoreCloud,
        1024 * 1024 * MIB,
    );

    let md_store = Arc::new(InMemoryMetadataStore::new());
    let block_store = Arc::new(InMemoryBlockStore::new(allocator.clone()));
    let events = Arc::new(InMemoryEventCollector::new());
    let scrubber = Arc::new(LocalScrubber::new());

    let ports = PlacementPorts {
        md_store: md_store.clone(),
        system_store,
        allocator: allocator.clone(),
        codec: Arc::new(ReedSolomonChunkCodec::new()),
        block_store: block_store.clone(),
        scrubber: scrubber.clone(),
        events: Arc::new(
            CompositeEventPublisher::new()
                .with_publisher(events.clone())
                .with_publisher(Arc::new(LoggingEventPublisher::new())),
        ),
    };
    let ctx = Arc::new(PlacementContext::new(config, ports).context("invalid placement config")?);
    scrubber.bind(&ctx);

    Ok(Cluster {
        ctx,
        md_store,
        allocator,
        block_store,
        events,
        bucket,
        hot_tier,
        hot_nodes,
    })
}

fn random_payload(size: usize) -> Vec<u8> {
    let mut data = vec![0u8; size];
    rand::thread_rng().fill(&mut data[..]);
    data
}

/// Encode payloads into new chunks, each referenced by its own object.
fn prepare_chunks(cluster: &Cluster, payloads: &[Vec<u8>]) -> anyhow::Result<Vec<Chunk>> {
    payloads
        .iter()
        .enumerate()
        .map(|(i, payload)| {
            let encoded = cluster.ctx.codec.encode(&cluster.hot_tier.coder, payload)?;
            let mut chunk = encoded.to_new_chunk(cluster.bucket.id, cluster.hot_tier.coder);

            let object = ObjectRecord {
                id: ObjectId::new(),
                bucket_id: cluster.bucket.id,
                key: format!("objects/{:04}", i),
                deleted: false,
            };
            chunk.parts.push(Part::new(object.id, 0, payload.len() as u64, 0));
            cluster.md_store.insert_object(object);
            Ok(chunk)
        })
        .collect()
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = PlacementConfig::from(args.placement.clone());
    info!("Starting chunkmap simulation");
    info!("  Hot nodes: {} x {} MiB", args.nodes, args.node_capacity_mib);
    info!(
        "  Coding: {}+{} x{}",
        args.data_frags, args.parity_frags, args.replicas
    );
    info!("  Chunks: {} x {} KiB", args.chunks, args.chunk_size_kib);

    let cluster = build_cluster(&args, config)?;

    let payloads: Vec<Vec<u8>> = (0..args.chunks)
        .map(|_| random_payload(args.chunk_size_kib * 1024))
        .collect();
    let mut chunks = prepare_chunks(&cluster, &payloads)?;
    MapClient::new(&cluster.ctx)
        .desc("upload")
        .check_dups(true)
        .run(&mut chunks)
        .await
        .context("upload failed")?;

    // Same bytes again, served by the stored chunk
    let mut again = prepare_chunks(&cluster, &payloads[..payloads.len().min(1)])?;
    MapClient::new(&cluster.ctx)
        .desc("reupload")
        .check_dups(true)
        .run(&mut again)
        .await
        .context("reupload failed")?;

    let chunk_ids = cluster.md_store.chunk_ids();
    let deduped = again.iter().filter(|c| c.dup_chunk_id.is_some()).count();
    info!(
        chunks = chunk_ids.len(),
        deduped,
        blocks = cluster.block_store.block_count(),
        "Upload complete"
    );
    let before = health(&cluster, &chunk_ids).await?;

    for node in cluster.hot_nodes.iter().take(args.fail_nodes) {
        warn!(node = %node.name, "Failing node");
        cluster.allocator.fail_node(&node.id);
    }
    let degraded = health(&cluster, &chunk_ids).await?;

    match MapBuilder::new(&cluster.ctx).run(&chunk_ids).await {
        Ok(()) => info!("Repair complete"),
        Err(Error::BuildIncomplete { failed }) => {
            warn!(failed = failed.len(), "Repair left chunks behind")
        }
        Err(e) => return Err(e).context("repair failed"),
    }
    let reclaimed = cluster
        .block_store
        .reclaim(&cluster.md_store.deleted_block_ids());
    let after = health(&cluster, &chunk_ids).await?;

    print_report(&cluster, &[("uploaded", before), ("degraded", degraded), ("repaired", after)]);
    println!("reclaimed blocks: {}", reclaimed);
    println!();
    println!("{}", cluster.ctx.reporter.render()?);
    Ok(())
}

// =============================================================================
// Report
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct Health {
    healthy: usize,
    degraded: usize,
    lost: usize,
}

/// Classify chunks by the fragments readable on live nodes.
async fn health(cluster: &Cluster, ids: &[ChunkId]) -> anyhow::Result<Health> {
    let md = &cluster.ctx.md_store;
    let records = md.find_chunks_by_ids(ids).await?;
    let blocks = md.load_blocks_for_chunks(ids).await?;

    let mut health = Health::default();
    for record in records.iter().filter(|r| !r.deleted) {
        let chunk = record.to_chunk(&blocks);
        let mut readable: HashMap<_, usize> = HashMap::new();
        for frag in &chunk.frags {
            let live = frag
                .blocks
                .iter()
                .filter(|b| {
                    cluster.block_store.contains(&b.id)
                        && cluster.allocator.node(&b.node_id).is_some_and(|n| n.readable)
                })
                .count();
            readable.insert(frag.index, live);
        }

        let wanted = chunk.coder.replicas.max(1) as usize;
        let readable_frags = readable.values().filter(|n| **n > 0).count();
        if readable.values().all(|n| *n >= wanted) {
            health.healthy += 1;
        } else if readable_frags >= chunk.coder.data_frags.max(1) as usize {
            health.degraded += 1;
        } else {
            health.lost += 1;
        }
    }
    Ok(health)
}

fn print_report(cluster: &Cluster, phases: &[(&str, Health)]) {
    println!();
    println!("{:<10} {:>8} {:>9} {:>6}", "phase", "healthy", "degraded", "lost");
    for (phase, h) in phases {
        println!("{:<10} {:>8} {:>9} {:>6}", phase, h.healthy, h.degraded, h.lost);
    }
    println!();
    println!("events:");
    let mut by_type: HashMap<&'static str, usize> = HashMap::new();
    for event in cluster.events.events() {
        *by_type.entry(event.event_type()).or_default() += 1;
    }
    let mut by_type: Vec<_> = by_type.into_iter().collect();
    by_type.sort();
    for (event_type, count) in by_type {
        println!("  {:<20} {}", event_type, count);
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
