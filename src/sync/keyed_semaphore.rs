//! Per-key counting semaphore
//!
//! One `tokio::sync::Semaphore` per key, created on first use and dropped
//! again once nobody holds or waits for it.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct KeyedSemaphore<K>
where
    K: Eq + Hash + Clone,
{
    permits: usize,
    semaphores: DashMap<K, Arc<Semaphore>>,
}

impl<K> KeyedSemaphore<K>
where
    K: Eq + Hash + Clone,
{
    /// Each key admits up to `permits` concurrent holders.
    pub fn new(permits: usize) -> Self {
        Self {
            permits,
            semaphores: DashMap::new(),
        }
    }

    pub async fn acquire(&self, key: K) -> Result<KeyedPermit<'_, K>> {
        let semaphore = self
            .semaphores
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.permits)))
            .clone();

        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|e| Error::Internal(format!("keyed semaphore closed: {}", e)))?;

        Ok(KeyedPermit {
            owner: self,
            key,
            permit: Some(permit),
        })
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.semaphores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.semaphores.is_empty()
    }

    fn cleanup(&self, key: &K) {
        // only the map itself still references an idle semaphore
        self.semaphores
            .remove_if(key, |_, sem| Arc::strong_count(sem) == 1);
    }
}

#[must_use = "the permit is released as soon as it is dropped"]
pub struct KeyedPermit<'a, K>
where
    K: Eq + Hash + Clone,
{
    owner: &'a KeyedSemaphore<K>,
    key: K,
    permit: Option<OwnedSemaphorePermit>,
}

impl<K> Drop for KeyedPermit<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        drop(self.permit.take());
        self.owner.cleanup(&self.key);
    }
}
