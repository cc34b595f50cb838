//! Coalescing barrier
//!
//! Collects calls into a batch and processes the batch once, either when it
//! reaches `max_length` items or when `expiry` passed since its first item.
//! Every caller of the batch receives the batch outcome.
//!
//! ```text
//!  call(a) ─┐
//!  call(b) ─┼──▶ [a, b, c] ──▶ process(batch) ──▶ result to a, b, c
//!  call(c) ─┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};

/// Batch handler shared by every flush.
pub type BarrierProcess<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

type Waiter = oneshot::Sender<std::result::Result<(), String>>;

struct PendingBatch<T> {
    generation: u64,
    items: Vec<T>,
    waiters: Vec<Waiter>,
}

impl<T> PendingBatch<T> {
    fn take(&mut self) -> (Vec<T>, Vec<Waiter>) {
        self.generation += 1;
        (
            std::mem::take(&mut self.items),
            std::mem::take(&mut self.waiters),
        )
    }
}

pub struct Barrier<T> {
    max_length: usize,
    expiry: Duration,
    process: BarrierProcess<T>,
    pending: Arc<Mutex<PendingBatch<T>>>,
}

impl<T> std::fmt::Debug for Barrier<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Barrier")
            .field("max_length", &self.max_length)
            .field("expiry", &self.expiry)
            .finish()
    }
}

impl<T> Barrier<T>
where
    T: Send + 'static,
{
    pub fn new(max_length: usize, expiry: Duration, process: BarrierProcess<T>) -> Self {
        Self {
            max_length: max_length.max(1),
            expiry,
            process,
            pending: Arc::new(Mutex::new(PendingBatch {
                generation: 0,
                items: Vec::new(),
                waiters: Vec::new(),
            })),
        }
    }

    /// Join the current batch and wait for its outcome.
    pub async fn call(&self, item: T) -> Result<()> {
        let (tx, rx) = oneshot::channel();

        let mut full_batch = None;
        let mut start_timer = None;
        {
            let mut pending = self.pending.lock();
            pending.items.push(item);
            pending.waiters.push(tx);
            if pending.items.len() >= self.max_length {
                full_batch = Some(pending.take());
            } else if pending.items.len() == 1 {
                start_timer = Some(pending.generation);
            }
        }

        if let Some((items, waiters)) = full_batch {
            debug!("Barrier full with {} items, flushing", items.len());
            tokio::spawn(run_batch(self.process.clone(), items, waiters));
        }

        if let Some(generation) = start_timer {
            let pending = self.pending.clone();
            let process = self.process.clone();
            let expiry = self.expiry;
            tokio::spawn(async move {
                tokio::time::sleep(expiry).await;
                let batch = {
                    let mut pending = pending.lock();
                    // already flushed by size
                    if pending.generation != generation {
                        return;
                    }
                    pending.take()
                };
                debug!("Barrier expired with {} items, flushing", batch.0.len());
                run_batch(process, batch.0, batch.1).await;
            });
        }

        rx.await
            .map_err(|_| Error::CapacityRepair("barrier batch dropped".to_string()))?
            .map_err(Error::CapacityRepair)
    }
}

async fn run_batch<T>(process: BarrierProcess<T>, items: Vec<T>, waiters: Vec<Waiter>) {
    let outcome = process(items).await.map_err(|e| e.to_string());
    for waiter in waiters {
        let _ = waiter.send(outcome.clone());
    }
}
