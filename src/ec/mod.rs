//! Erasure Coding
//!
//! Reed-Solomon coding of chunk buffers into fragments, used by the chunk
//! codec adapter.
//!
//! ```text
//! chunk bytes ──▶ split into k data frags ──▶ + m parity frags
//!                                    ▲                │
//!                                    └── reconstruct ◀┘ (any k of k+m)
//! ```

pub mod encoder;

#[cfg(test)]
mod proptest;

pub use encoder::FragCoder;
