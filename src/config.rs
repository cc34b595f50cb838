//! Placement Configuration
//!
//! Thresholds, retry policies and concurrency limits of the placement core.
//! Every knob has a default and can be overridden from the command line or
//! the environment through [`PlacementArgs`].

use std::time::Duration;

use clap::Args;

use crate::error::{Error, Result};

const MIB: u64 = 1024 * 1024;

// =============================================================================
// Mapper
// =============================================================================

#[derive(Debug, Clone)]
pub struct MapperConfig {
    /// Free space a mirror needs for its pools to count as valid
    pub min_tier_free_threshold: u64,

    /// Free space a tier needs to accept allocations
    pub max_tier_free_threshold: u64,

    /// Log mapper cache statistics every N lookups
    pub cache_stats_interval: u64,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            min_tier_free_threshold: 100 * MIB,
            max_tier_free_threshold: 100 * MIB,
            cache_stats_interval: 10_000,
        }
    }
}

// =============================================================================
// Capacity Repair
// =============================================================================

#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Free space above which a tier needs no repair
    pub enough_room_in_tier_threshold: u64,

    /// Oldest chunks moved to the next tier per repair
    pub chunk_move_limit: usize,

    /// Requests coalesced per barrier batch
    pub barrier_max_length: usize,

    /// Time a barrier batch waits for more requests
    pub barrier_expiry: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            enough_room_in_tier_threshold: 200 * MIB,
            chunk_move_limit: 10,
            barrier_max_length: 10,
            barrier_expiry: Duration::from_millis(100),
        }
    }
}

// =============================================================================
// Mapping Orchestration
// =============================================================================

#[derive(Debug, Clone)]
pub struct MappingConfig {
    pub dedup_enabled: bool,

    /// Failed allocation passes before giving up
    pub max_allocation_attempts: u32,

    /// Age of a block id beyond which its commit is reported as drift
    pub md_grace: Duration,

    /// Interval of the storage stats aggregator
    pub md_aggregator_interval: Duration,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            dedup_enabled: true,
            max_allocation_attempts: 10,
            md_grace: Duration::from_secs(10 * 60),
            md_aggregator_interval: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Block I/O
// =============================================================================

#[derive(Debug, Clone)]
pub struct IoConfig {
    pub write_block_retries: u32,
    pub write_retry_delay: Duration,
    pub replicate_block_retries: u32,
    pub replicate_retry_delay: Duration,

    pub write_block_timeout: Duration,
    pub replicate_block_timeout: Duration,
    pub read_block_timeout: Duration,

    /// Wall-clock budget for writing one chunk, re-mappings included
    pub write_part_attempts_exhausted: Duration,

    pub write_concurrency_global: usize,
    pub write_concurrency_agent: usize,
    pub replicate_concurrency_global: usize,
    pub replicate_concurrency_agent: usize,
    pub read_concurrency_global: usize,
    pub read_concurrency_agent: usize,

    /// Chunks processed concurrently by one map client
    pub chunk_concurrency: usize,

    /// Frags processed concurrently within a chunk
    pub frag_concurrency: usize,

    /// Probability in [0, 1) of failing a write or replicate on purpose
    pub error_injection_on_write: f64,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            write_block_retries: 5,
            write_retry_delay: Duration::from_millis(100),
            replicate_block_retries: 3,
            replicate_retry_delay: Duration::from_millis(100),
            write_block_timeout: Duration::from_secs(20),
            replicate_block_timeout: Duration::from_secs(20),
            read_block_timeout: Duration::from_secs(20),
            write_part_attempts_exhausted: Duration::from_secs(120),
            write_concurrency_global: 256,
            write_concurrency_agent: 16,
            replicate_concurrency_global: 256,
            replicate_concurrency_agent: 16,
            read_concurrency_global: 256,
            read_concurrency_agent: 16,
            chunk_concurrency: 20,
            frag_concurrency: 10,
            error_injection_on_write: 0.0,
        }
    }
}

// =============================================================================
// Aggregate
// =============================================================================

/// Configuration of the whole placement core
#[derive(Debug, Clone, Default)]
pub struct PlacementConfig {
    pub mapper: MapperConfig,
    pub room: RoomConfig,
    pub mapping: MappingConfig,
    pub io: IoConfig,
}

impl PlacementConfig {
    /// Reject values that would stall or never admit any work.
    pub fn validate(&self) -> Result<()> {
        let limits = [
            ("write_concurrency_global", self.io.write_concurrency_global),
            ("write_concurrency_agent", self.io.write_concurrency_agent),
            ("replicate_concurrency_global", self.io.replicate_concurrency_global),
            ("replicate_concurrency_agent", self.io.replicate_concurrency_agent),
            ("read_concurrency_global", self.io.read_concurrency_global),
            ("read_concurrency_agent", self.io.read_concurrency_agent),
            ("chunk_concurrency", self.io.chunk_concurrency),
            ("frag_concurrency", self.io.frag_concurrency),
            ("barrier_max_length", self.room.barrier_max_length),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than 0", name)));
            }
        }
        if self.mapping.max_allocation_attempts == 0 {
            return Err(Error::Config(
                "max_allocation_attempts must be greater than 0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.io.error_injection_on_write) {
            return Err(Error::Config(format!(
                "error_injection_on_write must be in [0, 1), got {}",
                self.io.error_injection_on_write
            )));
        }
        Ok(())
    }
}

// =============================================================================
// CLI / Environment
// =============================================================================

/// Placement knobs as command line flags.
#[derive(Args, Debug, Clone)]
pub struct PlacementArgs {
    /// Mirror free space (bytes) required for its pools to be valid
    #[arg(long, env = "MIN_TIER_FREE_THRESHOLD", default_value_t = 100 * MIB)]
    pub min_tier_free_threshold: u64,

    /// Tier free space (bytes) required to accept allocations
    #[arg(long, env = "MAX_TIER_FREE_THRESHOLD", default_value_t = 100 * MIB)]
    pub max_tier_free_threshold: u64,

    /// Tier free space (bytes) above which no room is made
    #[arg(long, env = "ENOUGH_ROOM_IN_TIER_THRESHOLD", default_value_t = 200 * MIB)]
    pub enough_room_in_tier_threshold: u64,

    /// Chunks moved to the next tier per make-room call
    #[arg(long, env = "CHUNK_MOVE_LIMIT", default_value_t = 10)]
    pub chunk_move_limit: usize,

    /// Disable dedup lookups
    #[arg(long, env = "DEDUP_DISABLED")]
    pub dedup_disabled: bool,

    /// Failed allocation passes before giving up
    #[arg(long, env = "MAX_ALLOCATION_ATTEMPTS", default_value_t = 10)]
    pub max_allocation_attempts: u32,

    /// Write retries per block
    #[arg(long, env = "IO_WRITE_BLOCK_RETRIES", default_value_t = 5)]
    pub write_block_retries: u32,

    /// Delay between write retries in milliseconds
    #[arg(long, env = "IO_WRITE_RETRY_DELAY_MS", default_value_t = 100)]
    pub write_retry_delay_ms: u64,

    /// Replicate retries per block
    #[arg(long, env = "IO_REPLICATE_BLOCK_RETRIES", default_value_t = 3)]
    pub replicate_block_retries: u32,

    /// Delay between replicate retries in milliseconds
    #[arg(long, env = "IO_REPLICATE_RETRY_DELAY_MS", default_value_t = 100)]
    pub replicate_retry_delay_ms: u64,

    /// Block operation timeout in milliseconds
    #[arg(long, env = "IO_BLOCK_TIMEOUT_MS", default_value_t = 20_000)]
    pub block_timeout_ms: u64,

    /// Wall-clock budget for writing one chunk in milliseconds
    #[arg(long, env = "IO_WRITE_PART_ATTEMPTS_EXHAUSTED_MS", default_value_t = 120_000)]
    pub write_part_attempts_exhausted_ms: u64,

    /// Cluster-wide concurrent block operations per class
    #[arg(long, env = "IO_CONCURRENCY_GLOBAL", default_value_t = 256)]
    pub io_concurrency_global: usize,

    /// Concurrent block operations per storage node and class
    #[arg(long, env = "IO_CONCURRENCY_AGENT", default_value_t = 16)]
    pub io_concurrency_agent: usize,

    /// Probability of injected write failures
    #[arg(long, env = "ERROR_INJECTION_ON_WRITE", default_value_t = 0.0)]
    pub error_injection_on_write: f64,
}

impl From<PlacementArgs> for PlacementConfig {
    fn from(args: PlacementArgs) -> Self {
        let defaults = PlacementConfig::default();
        let block_timeout = Duration::from_millis(args.block_timeout_ms);
        Self {
            mapper: MapperConfig {
                min_tier_free_threshold: args.min_tier_free_threshold,
                max_tier_free_threshold: args.max_tier_free_threshold,
                ..defaults.mapper
            },
            room: RoomConfig {
                enough_room_in_tier_threshold: args.enough_room_in_tier_threshold,
                chunk_move_limit: args.chunk_move_limit,
                ..defaults.room
            },
            mapping: MappingConfig {
                dedup_enabled: !args.dedup_disabled,
                max_allocation_attempts: args.max_allocation_attempts,
                ..defaults.mapping
            },
            io: IoConfig {
                write_block_retries: args.write_block_retries,
                write_retry_delay: Duration::from_millis(args.write_retry_delay_ms),
                replicate_block_retries: args.replicate_block_retries,
                replicate_retry_delay: Duration::from_millis(args.replicate_retry_delay_ms),
                write_block_timeout: block_timeout,
                replicate_block_timeout: block_timeout,
                read_block_timeout: block_timeout,
                write_part_attempts_exhausted: Duration::from_millis(
                    args.write_part_attempts_exhausted_ms,
                ),
                write_concurrency_global: args.io_concurrency_global,
                write_concurrency_agent: args.io_concurrency_agent,
                replicate_concurrency_global: args.io_concurrency_global,
                replicate_concurrency_agent: args.io_concurrency_agent,
                read_concurrency_global: args.io_concurrency_global,
                read_concurrency_agent: args.io_concurrency_agent,
                error_injection_on_write: args.error_injection_on_write,
                ..defaults.io
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        placement: PlacementArgs,
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = PlacementConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mapper.min_tier_free_threshold, 100 * MIB);
        assert_eq!(config.room.enough_room_in_tier_threshold, 200 * MIB);
        assert_eq!(config.io.write_block_retries, 5);
        assert_eq!(config.io.replicate_block_retries, 3);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = PlacementConfig::default();
        config.io.frag_concurrency = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_args_override_defaults() {
        let cli = TestCli::parse_from([
            "test",
            "--chunk-move-limit",
            "3",
            "--write-block-retries",
            "2",
            "--dedup-disabled",
        ]);
        let config = PlacementConfig::from(cli.placement);
        assert_eq!(config.room.chunk_move_limit, 3);
        assert_eq!(config.io.write_block_retries, 2);
        assert!(!config.mapping.dedup_enabled);
        assert_eq!(config.io.chunk_concurrency, 20);
    }
}
