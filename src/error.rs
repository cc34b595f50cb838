//! Error types for the chunk placement core

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operation class of a physical block I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockOp {
    Read,
    Write,
    Replicate,
    Preallocate,
}

impl std::fmt::Display for BlockOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockOp::Read => write!(f, "read"),
            BlockOp::Write => write!(f, "write"),
            BlockOp::Replicate => write!(f, "replicate"),
            BlockOp::Preallocate => write!(f, "preallocate"),
        }
    }
}

/// Failure reported by a storage node agent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockIoError {
    /// The target node has no space left. Never retried.
    #[error("no block store space")]
    NoSpace,

    /// The operation did not complete in time
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The node could not be reached
    #[error("node unreachable: {0}")]
    Unreachable(String),

    /// The block does not exist on the node
    #[error("block not found")]
    NotFound,

    /// The node rejected the request
    #[error("rejected: {0}")]
    Rejected(String),
}

impl BlockIoError {
    /// True for the explicit out-of-space signal.
    pub fn is_no_space(&self) -> bool {
        matches!(self, BlockIoError::NoSpace)
    }
}

/// Errors that can occur while mapping, building and writing chunks
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// Metadata store failure
    #[error("Metadata store error: {0}")]
    Metadata(String),

    /// Remote call to a peer service failed
    #[error("RPC {method} failed: {reason}")]
    Rpc { method: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // =========================================================================
    // System Configuration Errors
    // =========================================================================
    /// Bucket not found in the system store
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    /// Tier not found in the system store
    #[error("Tier not found: {0}")]
    TierNotFound(String),

    /// Tier exists but is not part of the bucket tiering policy
    #[error("Tier {tier} is not part of tiering {tiering}")]
    TierNotInTiering { tier: String, tiering: String },

    /// No tier could be selected for a chunk
    #[error("No tier available for chunk {chunk} in tiering {tiering}")]
    NoTierForWrite { chunk: String, tiering: String },

    // =========================================================================
    // Mapping Errors
    // =========================================================================
    /// Invalid request to the mapping orchestrator
    #[error("Invalid mapping request: {0}")]
    InvalidRequest(String),

    /// Chunk violates a data model invariant
    #[error("Invalid chunk {chunk}: {reason}")]
    InvalidChunk { chunk: String, reason: String },

    /// Tier coding differs from the chunk coding
    #[error(
        "Chunk {chunk} coded {chunk_data_frags}+{chunk_parity_frags} requires recoding \
         to tier coding {tier_data_frags}+{tier_parity_frags}, which is not supported"
    )]
    RecodingUnsupported {
        chunk: String,
        chunk_data_frags: u32,
        chunk_parity_frags: u32,
        tier_data_frags: u32,
        tier_parity_frags: u32,
    },

    /// Allocation kept failing after capacity repair
    #[error("Allocation exhausted for bucket {bucket} after {attempts} attempts")]
    AllocationExhausted { bucket: String, attempts: u32 },

    /// A block reached commit without an assigned node or pool
    #[error("Missing node/pool for block {0}")]
    MissingBlockNode(String),

    /// Capacity repair failed
    #[error("Capacity repair failed: {0}")]
    CapacityRepair(String),

    // =========================================================================
    // Block I/O Errors
    // =========================================================================
    /// A physical block operation failed permanently
    #[error("Block {op} failed for block {block} on node {node}: {source}")]
    BlockIo {
        op: BlockOp,
        block: String,
        node: String,
        #[source]
        source: BlockIoError,
    },

    /// A fragment has neither fresh data nor an accessible block to copy
    #[error("No data source for frag {frag} of chunk {chunk}")]
    NoDataSource { chunk: String, frag: String },

    /// The chunk wall-clock budget ran out
    #[error("Write attempts exhausted for chunk {chunk} after {elapsed:?}")]
    ChunkWriteExhausted { chunk: String, elapsed: Duration },

    /// Some chunks of a batch failed
    #[error("Build had errors in {} chunks", .failed.len())]
    BuildIncomplete { failed: Vec<String> },

    // =========================================================================
    // Erasure Coding Errors
    // =========================================================================
    /// EC encoding failed
    #[error("EC encoding failed: {0}")]
    EcEncodingFailed(String),

    /// EC reconstruction failed
    #[error("EC reconstruction failed: {0}")]
    EcReconstructionFailed(String),

    /// Insufficient fragments for reconstruction
    #[error("Insufficient shards for reconstruction: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    /// Invalid EC configuration
    #[error("Invalid EC configuration: {0}")]
    InvalidEcConfig(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the failure is the explicit out-of-space signal of a node.
    pub fn is_no_space(&self) -> bool {
        matches!(self, Error::BlockIo { source, .. } if source.is_no_space())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_space_detection() {
        let err = Error::BlockIo {
            op: BlockOp::Write,
            block: "b1".to_string(),
            node: "n1".to_string(),
            source: BlockIoError::NoSpace,
        };
        assert!(err.is_no_space());

        let err = Error::BlockIo {
            op: BlockOp::Replicate,
            block: "b1".to_string(),
            node: "n1".to_string(),
            source: BlockIoError::Timeout(Duration::from_secs(1)),
        };
        assert!(!err.is_no_space());
    }

    #[test]
    fn test_build_incomplete_message() {
        let err = Error::BuildIncomplete {
            failed: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "Build had errors in 2 chunks");
    }
}
