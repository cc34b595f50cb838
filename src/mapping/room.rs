//! Capacity Repair
//!
//! Keeps tiers writable by moving their oldest chunks to the next tier.
//!
//! ```text
//! ensure_room_in_tier ──▶ Barrier (coalesce) ──▶ scrubber.make_room_in_tier
//!                                                    │
//!                            make_room_in_tier ◀─────┘  one at a time per tier
//!                              oldest chunks ──▶ scrubber.build_chunks(next tier)
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tracing::{debug, info, instrument, warn};

use crate::config::RoomConfig;
use crate::context::PlacementContext;
use crate::domain::events::PlacementEvent;
use crate::domain::ids::{BucketId, TierId};
use crate::domain::ports::{NodeAllocator, ScrubberClient, SystemStore};
use crate::domain::system::{Bucket, Tier};
use crate::error::{Error, Result};
use crate::mapper::select_tier_for_write;
use crate::sync::{Barrier, BarrierProcess, KeyedSemaphore};

type RoomRequest = (TierId, BucketId);

pub struct RoomManager {
    config: RoomConfig,
    barrier: Barrier<RoomRequest>,
    make_room_lock: KeyedSemaphore<TierId>,
}

impl std::fmt::Debug for RoomManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomManager")
            .field("config", &self.config)
            .field("barrier", &self.barrier)
            .finish()
    }
}

impl RoomManager {
    pub fn new(
        config: RoomConfig,
        scrubber: Arc<dyn ScrubberClient>,
        system_store: Arc<dyn SystemStore>,
        allocator: Arc<dyn NodeAllocator>,
    ) -> Self {
        let threshold = config.enough_room_in_tier_threshold;
        let process: BarrierProcess<RoomRequest> = Arc::new(move |requests: Vec<RoomRequest>| {
            let scrubber = scrubber.clone();
            let system_store = system_store.clone();
            let allocator = allocator.clone();
            async move {
                process_room_requests(requests, scrubber, system_store, allocator, threshold).await
            }
            .boxed()
        });

        Self {
            barrier: Barrier::new(config.barrier_max_length, config.barrier_expiry, process),
            make_room_lock: KeyedSemaphore::new(1),
            config,
        }
    }

    /// Whether the roomiest mirror of the tier has more than the repair
    /// threshold free.
    pub fn enough_room_in_tier(
        &self,
        ctx: &PlacementContext,
        tier_id: &TierId,
        bucket_id: &BucketId,
    ) -> Result<bool> {
        let (tier, bucket) = resolve(ctx, tier_id, bucket_id)?;
        let free = tier_free(ctx.allocator.as_ref(), &bucket, tier_id);

        let enough = free > self.config.enough_room_in_tier_threshold;
        let event = if enough {
            debug!(tier = %tier.name, free, "Tier has enough room");
            format!("has_enough_room({})", tier.name)
        } else {
            debug!(
                tier = %tier.name,
                free,
                threshold = self.config.enough_room_in_tier_threshold,
                "Tier has not enough room, chunks should move to next tier"
            );
            format!("not_enough_room({})", tier.name)
        };
        ctx.reporter.add_event(&event, free, Default::default());
        Ok(enough)
    }

    /// Make sure the tier has room, waiting for a coalesced repair if not.
    pub async fn ensure_room_in_tier(
        &self,
        ctx: &PlacementContext,
        tier_id: &TierId,
        bucket_id: &BucketId,
    ) -> Result<()> {
        let (tier, bucket) = resolve(ctx, tier_id, bucket_id)?;
        ctx.allocator.refresh_tiering_alloc(&bucket.tiering, false).await?;
        if self.enough_room_in_tier(ctx, tier_id, bucket_id)? {
            return Ok(());
        }

        let start = Instant::now();
        self.barrier.call((*tier_id, *bucket_id)).await?;
        ctx.reporter.add_event(
            &format!("ensure_room_in_tier({})", tier.name),
            0,
            start.elapsed(),
        );
        Ok(())
    }

    /// Move the oldest chunks of a full tier into the next writable tier.
    ///
    /// Serialized per tier; a call that finds room already made returns early.
    #[instrument(skip(self, ctx))]
    pub async fn make_room_in_tier(
        &self,
        ctx: &PlacementContext,
        tier_id: TierId,
        bucket_id: BucketId,
    ) -> Result<()> {
        let _permit = self.make_room_lock.acquire(tier_id).await?;

        let (tier, bucket) = resolve(ctx, &tier_id, &bucket_id)?;
        let tiering = &bucket.tiering;
        let order = tiering
            .tier_order(&tier_id)
            .map(|t| t.order)
            .ok_or_else(|| Error::TierNotInTiering {
                tier: tier.name.clone(),
                tiering: tiering.name.clone(),
            })?;

        ctx.allocator.refresh_tiering_alloc(tiering, false).await?;
        if self.enough_room_in_tier(ctx, &tier_id, &bucket_id)? {
            return Ok(());
        }

        let status = ctx.allocator.tiering_status(tiering);
        let Some(next_tier) =
            select_tier_for_write(&ctx.mapper_cache, tiering, &status, Some(order + 1))
        else {
            warn!(tier = %tier.name, "No next tier to move data to");
            return Ok(());
        };

        let chunk_ids = ctx
            .md_store
            .find_oldest_tier_chunk_ids(&tier_id, self.config.chunk_move_limit)
            .await?;
        if !chunk_ids.is_empty() {
            let moved = chunk_ids.len();
            let start = Instant::now();
            ctx.scrubber
                .build_chunks(chunk_ids, Some(next_tier.id))
                .await?;
            ctx.reporter.add_event(
                &format!("build_chunks({})", tier.name),
                moved as u64,
                start.elapsed(),
            );
            info!(
                tier = %tier.name,
                next_tier = %next_tier.name,
                moved,
                "Moved oldest chunks to next tier"
            );
            ctx.publish(PlacementEvent::RoomMade {
                tier: tier.name.clone(),
                next_tier: next_tier.name.clone(),
                moved_chunks: moved,
                timestamp: chrono::Utc::now(),
            })
            .await;
        }

        ctx.allocator.refresh_tiering_alloc(tiering, true).await?;
        Ok(())
    }
}

fn resolve(
    ctx: &PlacementContext,
    tier_id: &TierId,
    bucket_id: &BucketId,
) -> Result<(Arc<Tier>, Arc<Bucket>)> {
    let tier = ctx
        .system_store
        .tier(tier_id)
        .ok_or_else(|| Error::TierNotFound(tier_id.to_string()))?;
    let bucket = ctx
        .system_store
        .bucket(bucket_id)
        .ok_or_else(|| Error::BucketNotFound(bucket_id.to_string()))?;
    Ok((tier, bucket))
}

/// Free space of the roomiest mirror; a tier without a snapshot has none.
fn tier_free(allocator: &dyn NodeAllocator, bucket: &Bucket, tier_id: &TierId) -> u64 {
    allocator
        .tiering_status(&bucket.tiering)
        .get(tier_id)
        .map(|s| s.max_mirror_free())
        .unwrap_or(0)
}

async fn process_room_requests(
    requests: Vec<RoomRequest>,
    scrubber: Arc<dyn ScrubberClient>,
    system_store: Arc<dyn SystemStore>,
    allocator: Arc<dyn NodeAllocator>,
    threshold: u64,
) -> Result<()> {
    let mut seen = HashSet::new();
    let unique: Vec<RoomRequest> = requests
        .into_iter()
        .filter(|(tier, _)| seen.insert(*tier))
        .collect();
    debug!(tiers = unique.len(), "Processing coalesced room requests");

    let repairs = unique.into_iter().map(|(tier_id, bucket_id)| {
        let scrubber = scrubber.clone();
        let system_store = system_store.clone();
        let allocator = allocator.clone();
        async move {
            scrubber.make_room_in_tier(tier_id, bucket_id).await?;
            let Some(bucket) = system_store.bucket(&bucket_id) else {
                return Ok(());
            };
            allocator.refresh_tiering_alloc(&bucket.tiering, true).await?;
            let free = tier_free(allocator.as_ref(), &bucket, &tier_id);
            info!(
                tier = %tier_id,
                free,
                enough = free > threshold,
                "Room repair finished"
            );
            Ok::<(), Error>(())
        }
    });
    futures::future::try_join_all(repairs).await?;
    Ok(())
}
