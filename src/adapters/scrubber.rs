//! Local Scrubber
//!
//! In-process `ScrubberClient` that serves capacity repair calls by running
//! the builder and the room manager against the same placement context.
//!
//! The context owns the scrubber, so the scrubber only holds a weak handle
//! bound after the context is built.

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::builder::MapBuilder;
use crate::context::PlacementContext;
use crate::domain::ids::{BucketId, ChunkId, TierId};
use crate::domain::ports::ScrubberClient;
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct LocalScrubber {
    ctx: OnceLock<Weak<PlacementContext>>,
}

impl LocalScrubber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the context the scrubber works on. Only the first bind counts.
    pub fn bind(&self, ctx: &Arc<PlacementContext>) {
        if self.ctx.set(Arc::downgrade(ctx)).is_err() {
            debug!("Scrubber already bound");
        }
    }

    fn context(&self) -> Result<Arc<PlacementContext>> {
        self.ctx
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::Rpc {
                method: "scrubber".to_string(),
                reason: "not bound to a placement context".to_string(),
            })
    }
}

#[async_trait]
impl ScrubberClient for LocalScrubber {
    /// Chunks already held by a running build are skipped; their builder
    /// re-maps them anyway.
    async fn build_chunks(&self, chunk_ids: Vec<ChunkId>, tier: Option<TierId>) -> Result<()> {
        let ctx = self.context()?;
        let (ids, busy): (Vec<ChunkId>, Vec<ChunkId>) = chunk_ids
            .into_iter()
            .partition(|id| !ctx.builder_lock.is_locked(id));
        if !busy.is_empty() {
            info!(skipped = busy.len(), "Skipping chunks under build");
        }
        MapBuilder::new(&ctx).move_to_tier(tier).run(&ids).await
    }

    async fn make_room_in_tier(&self, tier: TierId, bucket: BucketId) -> Result<()> {
        let ctx = self.context()?;
        ctx.room.make_room_in_tier(&ctx, tier, bucket).await
    }
}
