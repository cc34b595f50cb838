//! chunkmap - Chunk Placement Core
//!
//! Decides where the fragments of erasure-coded or replicated chunks live
//! across tiers, mirrors and pools of storage nodes, keeps them repaired as
//! capacity and node health change, and drives the block I/O that makes the
//! decisions real.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!  upload ──────▶ │ MapClient                    │ ──▶ BlockStoreClient
//!                 │   GetMapping ▶ I/O ▶ PutMapping│
//!                 └──────────────────────────────┘
//!                        ▲               │
//!  scrubber ──▶ MapBuilder               ▼
//!                        │        TieringMapper ▶ TierMapper ▶ MirrorMapper
//!                        ▼
//!                 RoomManager (ensure / make room)
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - In-memory port implementations and the Reed-Solomon codec
//! - [`builder`] - Two-pass repair of stored chunks
//! - [`client`] - Block I/O driver with retries and concurrency limits
//! - [`config`] - Placement configuration
//! - [`context`] - Shared collaborators, caches and limits
//! - [`domain`] - Data model, storage rows and ports
//! - [`ec`] - Erasure coding
//! - [`error`] - Error types
//! - [`mapper`] - Pure placement decisions
//! - [`mapping`] - Mapping orchestration and capacity repair
//! - [`metrics`] - Mapping event counters
//! - [`sync`] - Keyed locks, semaphores and barriers

pub mod adapters;
pub mod builder;
pub mod client;
pub mod config;
pub mod context;
pub mod domain;
pub mod ec;
pub mod error;
pub mod mapper;
pub mod mapping;
pub mod metrics;
pub mod sync;

// Re-export commonly used types
pub use builder::MapBuilder;
pub use client::MapClient;
pub use config::{PlacementArgs, PlacementConfig};
pub use context::{PlacementContext, PlacementPorts};
pub use error::{Error, Result};
pub use mapping::{GetMapping, PutMapping, RoomManager};
pub use metrics::MapReporter;
