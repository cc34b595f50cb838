//! Coordination Primitives
//!
//! - **KeysLock** (`keys_lock.rs`): at most one builder per chunk id set
//! - **KeyedSemaphore** (`keyed_semaphore.rs`): per storage node I/O limits
//!   and per tier make-room serialization
//! - **Barrier** (`barrier.rs`): coalescing of ensure-room requests

pub mod barrier;
pub mod keyed_semaphore;
pub mod keys_lock;

pub use barrier::{Barrier, BarrierProcess};
pub use keyed_semaphore::{KeyedPermit, KeyedSemaphore};
pub use keys_lock::{KeysLock, KeysLockGuard};
