//! Block I/O execution: admission limits, retries and the map client.

mod limits;
mod map_client;
mod retry;

pub use limits::{IoLimits, IoPermit};
pub use map_client::MapClient;
pub use retry::{RetryDecision, RetryPolicy};
