//! Placement Events
//!
//! Immutable records of failures and anomalies observed while placing and
//! repairing chunks. They feed the error reporter of the I/O executor and
//! the audit trail of consistency anomalies, which are never raised as errors.
//!
//! # Example
//!
//! ```ignore
//! let event = PlacementEvent::block_io_failed(block_id, node_id, BlockOp::Write, "timeout");
//! events.publish(event).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{BlockId, NodeId};
use crate::error::BlockOp;

/// Something worth recording happened during placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PlacementEvent {
    // =========================================================================
    // Block I/O
    // =========================================================================
    /// One attempt of a block operation failed.
    BlockIoFailed {
        block_id: BlockId,
        node_id: NodeId,
        op: BlockOp,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Consistency Anomalies
    // =========================================================================
    /// The over-deletion guard refused to delete unused blocks.
    DeletionRefused {
        chunk: String,
        tier: String,
        blocks: usize,
        used_blocks: usize,
        unused_blocks: usize,
        min_blocks: u32,
        timestamp: DateTime<Utc>,
    },

    /// A block timestamp is implausibly far from now or from the bucket stats.
    MetadataDrift {
        block_id: BlockId,
        bucket: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Blocks whose node could not be resolved.
    OrphanBlocks {
        block_ids: Vec<BlockId>,
        timestamp: DateTime<Utc>,
    },

    /// A chunk's owning bucket is inconsistent with its objects.
    BucketAnomaly {
        chunk: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Repair
    // =========================================================================
    /// A chunk could not be prepared or built.
    ChunkBuildFailed {
        chunk: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Oldest chunks of a full tier were scheduled into the next tier.
    RoomMade {
        tier: String,
        next_tier: String,
        moved_chunks: usize,
        timestamp: DateTime<Utc>,
    },
}

impl PlacementEvent {
    /// Event type name, as used in the serialized `type` tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            PlacementEvent::BlockIoFailed { .. } => "BlockIoFailed",
            PlacementEvent::DeletionRefused { .. } => "DeletionRefused",
            PlacementEvent::MetadataDrift { .. } => "MetadataDrift",
            PlacementEvent::OrphanBlocks { .. } => "OrphanBlocks",
            PlacementEvent::BucketAnomaly { .. } => "BucketAnomaly",
            PlacementEvent::ChunkBuildFailed { .. } => "ChunkBuildFailed",
            PlacementEvent::RoomMade { .. } => "RoomMade",
        }
    }

    pub fn block_io_failed(
        block_id: BlockId,
        node_id: NodeId,
        op: BlockOp,
        reason: impl Into<String>,
    ) -> Self {
        PlacementEvent::BlockIoFailed {
            block_id,
            node_id,
            op,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn metadata_drift(block_id: BlockId, bucket: impl Into<String>, reason: impl Into<String>) -> Self {
        PlacementEvent::MetadataDrift {
            block_id,
            bucket: bucket.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn bucket_anomaly(chunk: impl Into<String>, reason: impl Into<String>) -> Self {
        PlacementEvent::BucketAnomaly {
            chunk: chunk.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn chunk_build_failed(chunk: impl Into<String>, reason: impl Into<String>) -> Self {
        PlacementEvent::ChunkBuildFailed {
            chunk: chunk.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_anomaly(&self) -> bool {
        matches!(
            self,
            PlacementEvent::DeletionRefused { .. }
                | PlacementEvent::MetadataDrift { .. }
                | PlacementEvent::OrphanBlocks { .. }
                | PlacementEvent::BucketAnomaly { .. }
        )
    }
}
