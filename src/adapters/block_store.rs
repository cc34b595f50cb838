//! In-Memory Block Store
//!
//! Storage node agents simulated in process: block payloads live in a map,
//! space is accounted against the [`InMemoryNodeAllocator`], and failures can
//! be injected per node and operation.
//!
//! ```text
//! write_block ─────┐
//! replicate_block ─┼──▶ faults? ──▶ node reachable? ──▶ consume space ──▶ store
//! preallocate ─────┘
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::node_allocator::InMemoryNodeAllocator;
use crate::domain::ids::{BlockId, NodeId};
use crate::domain::model::BlockMd;
use crate::domain::ports::BlockStoreClient;
use crate::error::{BlockIoError, BlockOp};

type IoResult<T> = std::result::Result<T, BlockIoError>;

#[derive(Debug, Clone)]
struct StoredBlock {
    node_id: NodeId,
    size: u64,
    data: Bytes,
}

#[derive(Debug, Default)]
struct OpCounters {
    read: AtomicU64,
    write: AtomicU64,
    replicate: AtomicU64,
    preallocate: AtomicU64,
}

impl OpCounters {
    fn get(&self, op: BlockOp) -> &AtomicU64 {
        match op {
            BlockOp::Read => &self.read,
            BlockOp::Write => &self.write,
            BlockOp::Replicate => &self.replicate,
            BlockOp::Preallocate => &self.preallocate,
        }
    }
}

pub struct InMemoryBlockStore {
    allocator: Arc<InMemoryNodeAllocator>,
    blocks: DashMap<BlockId, StoredBlock>,
    /// Space reserved by preallocation, consumed by the following write
    reserved: DashMap<BlockId, u64>,
    faults: Mutex<HashMap<(NodeId, BlockOp), VecDeque<BlockIoError>>>,
    delays: Mutex<HashMap<NodeId, Duration>>,
    attempts: OpCounters,
}

impl std::fmt::Debug for InMemoryBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBlockStore")
            .field("blocks", &self.blocks.len())
            .field("reserved", &self.reserved.len())
            .finish()
    }
}

impl InMemoryBlockStore {
    pub fn new(allocator: Arc<InMemoryNodeAllocator>) -> Self {
        Self {
            allocator,
            blocks: DashMap::new(),
            reserved: DashMap::new(),
            faults: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            attempts: OpCounters::default(),
        }
    }

    /// Fail the next `times` calls of `op` on `node` with `error`.
    pub fn inject_failures(&self, node: NodeId, op: BlockOp, times: usize, error: BlockIoError) {
        self.faults
            .lock()
            .entry((node, op))
            .or_default()
            .extend(std::iter::repeat(error).take(times));
    }

    /// Delay every call served by `node`.
    pub fn set_delay(&self, node: NodeId, delay: Duration) {
        self.delays.lock().insert(node, delay);
    }

    /// Calls of `op` received, failed ones included.
    pub fn attempts(&self, op: BlockOp) -> u64 {
        self.attempts.get(op).load(Ordering::Relaxed)
    }

    pub fn block_data(&self, id: &BlockId) -> Option<Bytes> {
        self.blocks.get(id).map(|b| b.data.clone())
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.blocks.contains_key(id)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks_on_node(&self, node: &NodeId) -> Vec<BlockId> {
        self.blocks
            .iter()
            .filter(|b| &b.node_id == node)
            .map(|b| *b.key())
            .collect()
    }

    /// Drop a block payload as a failed disk would, keeping its space used.
    pub fn lose_block(&self, id: &BlockId) -> bool {
        self.blocks.remove(id).is_some()
    }

    /// Remove blocks and give their space back. Returns how many existed.
    pub fn reclaim(&self, ids: &[BlockId]) -> usize {
        let mut reclaimed = 0;
        for id in ids {
            if let Some((_, block)) = self.blocks.remove(id) {
                self.allocator.release(&block.node_id, block.size);
                reclaimed += 1;
            }
        }
        debug!(reclaimed, "Reclaimed deleted blocks");
        reclaimed
    }

    async fn enter(&self, op: BlockOp, node: &NodeId) -> IoResult<()> {
        self.attempts.get(op).fetch_add(1, Ordering::Relaxed);
        let delay = self.delays.lock().get(node).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let injected = self
            .faults
            .lock()
            .get_mut(&(*node, op))
            .and_then(VecDeque::pop_front);
        if let Some(err) = injected {
            trace!(node = %node, %op, error = %err, "Injected block failure");
            return Err(err);
        }
        Ok(())
    }

    fn check_node(&self, node: &NodeId, write: bool) -> IoResult<()> {
        let info = self
            .allocator
            .node(node)
            .ok_or_else(|| BlockIoError::Unreachable(node.to_string()))?;
        let available = if write { info.writable } else { info.readable };
        if available {
            Ok(())
        } else {
            Err(BlockIoError::Unreachable(info.name))
        }
    }

    fn store(&self, block: &BlockMd, data: Bytes) -> IoResult<()> {
        if self.blocks.contains_key(&block.id) {
            return Ok(());
        }
        if self.reserved.remove(&block.id).is_none() {
            self.allocator
                .consume(&block.node_id, block.size)
                .map_err(|_| BlockIoError::NoSpace)?;
        }
        self.blocks.insert(
            block.id,
            StoredBlock {
                node_id: block.node_id,
                size: block.size,
                data,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl BlockStoreClient for InMemoryBlockStore {
    async fn write_block(&self, block: &BlockMd, data: Bytes) -> IoResult<()> {
        self.enter(BlockOp::Write, &block.node_id).await?;
        self.check_node(&block.node_id, true)?;
        self.store(block, data)
    }

    async fn replicate_block(&self, target: &BlockMd, source: &BlockMd) -> IoResult<()> {
        self.enter(BlockOp::Replicate, &target.node_id).await?;
        self.check_node(&target.node_id, true)?;
        self.check_node(&source.node_id, false)?;
        let data = self
            .blocks
            .get(&source.id)
            .map(|b| b.data.clone())
            .ok_or(BlockIoError::NotFound)?;
        self.store(target, data)
    }

    async fn preallocate_block(&self, block: &BlockMd) -> IoResult<()> {
        self.enter(BlockOp::Preallocate, &block.node_id).await?;
        self.check_node(&block.node_id, true)?;
        if self.reserved.contains_key(&block.id) {
            return Ok(());
        }
        self.allocator
            .consume(&block.node_id, block.size)
            .map_err(|_| BlockIoError::NoSpace)?;
        self.reserved.insert(block.id, block.size);
        Ok(())
    }

    async fn read_block(&self, block: &BlockMd) -> IoResult<Bytes> {
        self.enter(BlockOp::Read, &block.node_id).await?;
        self.check_node(&block.node_id, false)?;
        self.blocks
            .get(&block.id)
            .map(|b| b.data.clone())
            .ok_or(BlockIoError::NotFound)
    }
}
