//! MapClient
//!
//! Executes a mapping: writes and replicates the allocated blocks, rebuilds
//! missing fragments and commits whatever succeeded.
//!
//! ```text
//! GetMapping ──▶ per chunk ──▶ per frag ──▶ write / replicate (retry, limits)
//!                   │  frag failed                     │
//!                   └── absorb written ◀── re-map ◀────┘
//!                                                       ▼
//!                                                  PutMapping
//! ```

use std::future::Future;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use rand::Rng;
use tracing::{debug, error, instrument, warn};

use super::retry::{RetryDecision, RetryPolicy};
use crate::context::PlacementContext;
use crate::domain::events::PlacementEvent;
use crate::domain::ids::TierId;
use crate::domain::model::{Allocation, AllocationStatus, BlockMd, Chunk, Frag, FragIndex};
use crate::domain::system::LocationInfo;
use crate::error::{BlockIoError, BlockOp, Error, Result};
use crate::mapping::{GetMapping, PutMapping};

pub struct MapClient<'a> {
    ctx: &'a PlacementContext,
    desc: String,
    check_dups: bool,
    move_to_tier: Option<TierId>,
    location_info: Option<LocationInfo>,
}

impl<'a> MapClient<'a> {
    pub fn new(ctx: &'a PlacementContext) -> Self {
        Self {
            ctx,
            desc: String::new(),
            check_dups: false,
            move_to_tier: None,
            location_info: None,
        }
    }

    /// Caller description shown in logs.
    pub fn desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = desc.into();
        self
    }

    pub fn check_dups(mut self, check_dups: bool) -> Self {
        self.check_dups = check_dups;
        self
    }

    pub fn move_to_tier(mut self, tier: Option<TierId>) -> Self {
        self.move_to_tier = tier;
        self
    }

    pub fn location_info(mut self, location_info: Option<LocationInfo>) -> Self {
        self.location_info = location_info;
        self
    }

    /// Map, write and commit the chunks.
    ///
    /// Chunks that failed are still committed as far as they got and are
    /// reported together in [`Error::BuildIncomplete`].
    #[instrument(skip_all, fields(desc = %self.desc, chunks = chunks.len()))]
    pub async fn run(&self, chunks: &mut [Chunk]) -> Result<()> {
        let start = Instant::now();
        self.get_mapping().run(chunks).await?;
        self.process_chunks(chunks).await;
        PutMapping::new(self.ctx)
            .move_to_tier(self.move_to_tier)
            .run(chunks)
            .await?;

        let failed: Vec<String> = chunks
            .iter()
            .filter(|c| c.had_errors)
            .map(|c| c.label())
            .collect();
        debug!(
            chunks = chunks.len(),
            failed = failed.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "MapClient done"
        );
        if !failed.is_empty() {
            return Err(Error::BuildIncomplete { failed });
        }
        Ok(())
    }

    fn get_mapping(&self) -> GetMapping<'a> {
        GetMapping::new(self.ctx)
            .check_dups(self.check_dups)
            .move_to_tier(self.move_to_tier)
            .location_info(self.location_info.clone())
    }

    async fn process_chunks(&self, chunks: &mut [Chunk]) {
        // collected first so the stream holds futures, not closures over &mut
        let work: Vec<_> = chunks.iter_mut().map(|chunk| self.process_chunk(chunk)).collect();
        stream::iter(work)
            .buffer_unordered(self.ctx.config.io.chunk_concurrency)
            .collect::<Vec<()>>()
            .await;
    }

    /// Write one chunk, re-mapping after a failed frag until the chunk is
    /// written or its time budget runs out. Failures end in `had_errors`.
    async fn process_chunk(&self, chunk: &mut Chunk) {
        let start = Instant::now();
        let budget = self.ctx.config.io.write_part_attempts_exhausted;

        loop {
            if chunk.dup_chunk_id.is_some() {
                return;
            }
            if chunk.is_building_frags {
                if let Err(e) = self.read_entire_chunk(chunk).await {
                    self.fail_chunk(chunk, &e).await;
                    return;
                }
            }

            let Err(e) = self.process_frags(chunk).await else {
                return;
            };
            if chunk.had_errors || start.elapsed() >= budget {
                let err = Error::ChunkWriteExhausted {
                    chunk: chunk.label(),
                    elapsed: start.elapsed(),
                };
                error!(chunk = %chunk.label(), cause = %e, "Giving up on chunk");
                self.fail_chunk(chunk, &err).await;
                return;
            }

            warn!(chunk = %chunk.label(), error = %e, "Frag failed, re-mapping chunk");
            chunk.absorb_written_allocations();
            chunk.reset_mapping();
            if let Err(e) = self
                .get_mapping()
                .run(std::slice::from_mut(chunk))
                .await
            {
                self.fail_chunk(chunk, &e).await;
                return;
            }
        }
    }

    async fn fail_chunk(&self, chunk: &mut Chunk, err: &Error) {
        chunk.had_errors = true;
        error!(chunk = %chunk.label(), error = %err, "Chunk failed");
        self.ctx
            .publish(PlacementEvent::chunk_build_failed(chunk.label(), err.to_string()))
            .await;
    }

    async fn process_frags(&self, chunk: &mut Chunk) -> Result<()> {
        let label = chunk.label();
        let work: Vec<_> = chunk
            .frags
            .iter_mut()
            .filter(|f| !f.allocations.is_empty())
            .map(|frag| self.process_frag(&label, frag))
            .collect();
        let results: Vec<Result<()>> = stream::iter(work)
            .buffer_unordered(self.ctx.config.io.frag_concurrency)
            .collect()
            .await;

        let mut first_err = None;
        for err in results.into_iter().filter_map(|r| r.err()) {
            if matches!(err, Error::NoDataSource { .. }) {
                chunk.had_errors = true;
            }
            first_err.get_or_insert(err);
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn process_frag(&self, chunk: &str, frag: &mut Frag) -> Result<()> {
        if let Some(data) = frag.data.clone() {
            let Some((first, rest)) = frag.allocations.split_first_mut() else {
                return Ok(());
            };
            let source = self.write_allocation(first, data).await?;
            let results = futures::future::join_all(
                rest.iter_mut().map(|a| self.replicate_allocation(a, &source)),
            )
            .await;
            return results.into_iter().collect();
        }

        let sources: Vec<BlockMd> = frag
            .accessible_blocks()
            .filter_map(|b| b.block_md().ok())
            .collect();
        if sources.is_empty() {
            error!(chunk, frag = %frag.index, "No data source for frag");
            return Err(Error::NoDataSource {
                chunk: chunk.to_string(),
                frag: frag.index.to_string(),
            });
        }

        let first = rand::thread_rng().gen_range(0..sources.len());
        let results = futures::future::join_all(
            frag.allocations
                .iter_mut()
                .enumerate()
                .map(|(i, a)| self.replicate_allocation(a, &sources[(first + i) % sources.len()])),
        )
        .await;
        results.into_iter().collect()
    }

    async fn write_allocation(&self, alloc: &mut Allocation, data: Bytes) -> Result<BlockMd> {
        let md = allocation_md(alloc)?;
        let result = self
            .block_op(BlockOp::Write, &md, || {
                self.ctx.block_store.write_block(&md, data.clone())
            })
            .await;
        alloc.status = status_of(&result);
        result.map(|_| md)
    }

    async fn replicate_allocation(&self, alloc: &mut Allocation, source: &BlockMd) -> Result<()> {
        let md = allocation_md(alloc)?;
        let result = self
            .block_op(BlockOp::Replicate, &md, || {
                self.ctx.block_store.replicate_block(&md, source)
            })
            .await;
        alloc.status = status_of(&result);
        result
    }

    // =========================================================================
    // Frag rebuild
    // =========================================================================

    /// Read enough frags to decode the chunk and give every frag that needs
    /// new blocks its rebuilt bytes.
    async fn read_entire_chunk(&self, chunk: &mut Chunk) -> Result<()> {
        let missing_data = chunk
            .frags
            .iter()
            .any(|f| !f.allocations.is_empty() && f.data.is_none());
        if !missing_data {
            return Ok(());
        }

        let coder = chunk.coder;
        let reads = chunk
            .frags
            .iter()
            .filter(|f| f.index.shard_position(&coder).is_some())
            .map(|f| self.read_frag(f));
        let available: Vec<(FragIndex, Bytes)> = futures::future::join_all(reads)
            .await
            .into_iter()
            .flatten()
            .collect();

        let required = coder.data_frags as usize;
        if available.len() < required {
            return Err(Error::InsufficientShards {
                available: available.len(),
                required,
            });
        }

        let encoded = self.ctx.codec.reconstruct(&coder, chunk.size, available)?;
        for frag in chunk.frags.iter_mut().filter(|f| f.data.is_none()) {
            if let Some(rebuilt) = encoded.frags.iter().find(|e| e.index == frag.index) {
                frag.data = Some(rebuilt.data.clone());
            }
        }
        debug!(chunk = %chunk.label(), "Rebuilt chunk frags");
        Ok(())
    }

    /// First accessible block of the frag that reads back.
    async fn read_frag(&self, frag: &Frag) -> Option<(FragIndex, Bytes)> {
        for block in frag.accessible_blocks() {
            let Ok(md) = block.block_md() else {
                continue;
            };
            match self
                .block_op(BlockOp::Read, &md, || self.ctx.block_store.read_block(&md))
                .await
            {
                Ok(data) => return Some((frag.index, data)),
                Err(e) => warn!(frag = %frag.index, block = %md.id, error = %e, "Read failed"),
            }
        }
        None
    }

    // =========================================================================
    // Block operations
    // =========================================================================

    /// Run one block operation under the I/O limits with timeout, error
    /// injection and the retry policy of its class.
    async fn block_op<T, F, Fut>(&self, op: BlockOp, md: &BlockMd, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, BlockIoError>>,
    {
        let io = &self.ctx.config.io;
        let (policy, timeout) = match op {
            BlockOp::Read => (RetryPolicy::new(0, Duration::ZERO), io.read_block_timeout),
            BlockOp::Replicate => (RetryPolicy::for_op(op, io), io.replicate_block_timeout),
            BlockOp::Write | BlockOp::Preallocate => {
                (RetryPolicy::for_op(op, io), io.write_block_timeout)
            }
        };

        let mut failures = 0;
        loop {
            let result = {
                let _permit = self.ctx.io_limits.acquire(op, md.node_id).await?;
                match self.injected_error(op) {
                    Some(err) => Err(err),
                    None => tokio::time::timeout(timeout, call())
                        .await
                        .unwrap_or(Err(BlockIoError::Timeout(timeout))),
                }
            };
            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            failures += 1;
            self.ctx
                .publish(PlacementEvent::block_io_failed(
                    md.id,
                    md.node_id,
                    op,
                    err.to_string(),
                ))
                .await;
            match policy.decide(&err, failures) {
                RetryDecision::Retry(delay) => {
                    warn!(%op, block = %md.id, node = %md.node_id, failures, error = %err, "Block operation failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Fail => {
                    error!(%op, block = %md.id, node = %md.node_id, failures, error = %err, "Block operation failed");
                    return Err(Error::BlockIo {
                        op,
                        block: md.id.to_string(),
                        node: md.node_id.to_string(),
                        source: err,
                    });
                }
            }
        }
    }

    fn injected_error(&self, op: BlockOp) -> Option<BlockIoError> {
        let rate = self.ctx.config.io.error_injection_on_write;
        let applies = matches!(op, BlockOp::Write | BlockOp::Replicate);
        if applies && rate > 0.0 && rand::random::<f64>() < rate {
            return Some(BlockIoError::Rejected("injected error".to_string()));
        }
        None
    }
}

fn allocation_md(alloc: &Allocation) -> Result<BlockMd> {
    alloc
        .block
        .as_ref()
        .ok_or_else(|| Error::Internal("allocation has no assigned block".to_string()))?
        .block_md()
}

fn status_of<T>(result: &Result<T>) -> AllocationStatus {
    if result.is_ok() {
        AllocationStatus::Written
    } else {
        AllocationStatus::Failed
    }
}
