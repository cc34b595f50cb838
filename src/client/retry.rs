//! Block operation retry policy
//!
//! ```text
//! attempt fails ──▶ decide(err, retries) ──▶ Retry(delay) ──▶ attempt again
//!                                        └──▶ Fail
//! ```

use std::time::Duration;

use crate::config::IoConfig;
use crate::error::{BlockIoError, BlockOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    Fail,
}

/// Fixed-delay retry bounded by an attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Policy of an operation class.
    pub fn for_op(op: BlockOp, config: &IoConfig) -> Self {
        match op {
            BlockOp::Replicate => {
                Self::new(config.replicate_block_retries, config.replicate_retry_delay)
            }
            _ => Self::new(config.write_block_retries, config.write_retry_delay),
        }
    }

    /// Decide after the `failures`-th failed attempt (counting from 1).
    ///
    /// Out of space is final.
    pub fn decide(&self, err: &BlockIoError, failures: u32) -> RetryDecision {
        if err.is_no_space() || failures > self.max_retries {
            RetryDecision::Fail
        } else {
            RetryDecision::Retry(self.delay)
        }
    }
}
