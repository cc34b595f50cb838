//! In-Memory System Store
//!
//! Buckets and tiers held as shared snapshots. Policy edits replace the
//! tiering of every bucket that uses it and bump its revision, which is what
//! invalidates the mapper cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::domain::ids::{BucketId, TierId, TieringId};
use crate::domain::ports::SystemStore;
use crate::domain::system::{Bucket, Tier, Tiering};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct InMemorySystemStore {
    buckets: RwLock<HashMap<BucketId, Arc<Bucket>>>,
    tiers: RwLock<HashMap<TierId, Arc<Tier>>>,
    refreshes: AtomicU64,
}

impl InMemorySystemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bucket along with every tier of its policy.
    pub fn add_bucket(&self, bucket: Bucket) -> Arc<Bucket> {
        self.register_tiers(&bucket.tiering);
        let bucket = Arc::new(bucket);
        self.buckets.write().insert(bucket.id, bucket.clone());
        bucket
    }

    /// Mark a bucket deleted; it stays visible to `bucket_include_deleted`.
    pub fn delete_bucket(&self, id: &BucketId) -> Result<()> {
        let mut buckets = self.buckets.write();
        let bucket = buckets
            .get(id)
            .ok_or_else(|| Error::BucketNotFound(id.to_string()))?;
        let mut deleted = Bucket::clone(bucket);
        deleted.deleted = true;
        buckets.insert(*id, Arc::new(deleted));
        Ok(())
    }

    /// Drop a tier from the store, leaving policies that name it dangling.
    pub fn remove_tier(&self, id: &TierId) {
        self.tiers.write().remove(id);
    }

    /// Edit a tiering policy and publish it under the next revision.
    pub fn update_tiering(
        &self,
        tiering_id: &TieringId,
        edit: impl FnOnce(&mut Tiering),
    ) -> Result<Arc<Tiering>> {
        let mut buckets = self.buckets.write();
        let current = buckets
            .values()
            .find(|b| &b.tiering.id == tiering_id)
            .map(|b| b.tiering.clone())
            .ok_or_else(|| Error::Config(format!("tiering {} not found", tiering_id)))?;

        let mut tiering = Tiering::clone(&current);
        edit(&mut tiering);
        tiering.revision = current.revision + 1;
        let tiering = Arc::new(tiering);
        self.register_tiers(&tiering);

        for bucket in buckets.values_mut() {
            if &bucket.tiering.id == tiering_id {
                let mut updated = Bucket::clone(bucket);
                updated.tiering = tiering.clone();
                *bucket = Arc::new(updated);
            }
        }
        debug!(tiering = %tiering.name, revision = tiering.revision, "Tiering updated");
        Ok(tiering)
    }

    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    fn register_tiers(&self, tiering: &Tiering) {
        let mut tiers = self.tiers.write();
        for order in &tiering.tiers {
            tiers.insert(order.tier.id, order.tier.clone());
        }
    }
}

#[async_trait]
impl SystemStore for InMemorySystemStore {
    async fn refresh(&self) -> Result<()> {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn bucket(&self, id: &BucketId) -> Option<Arc<Bucket>> {
        self.buckets.read().get(id).filter(|b| !b.deleted).cloned()
    }

    fn bucket_include_deleted(&self, id: &BucketId) -> Option<Arc<Bucket>> {
        self.buckets.read().get(id).cloned()
    }

    fn tier(&self, id: &TierId) -> Option<Arc<Tier>> {
        self.tiers.read().get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::ChunkCoderConfig;
    use crate::domain::system::TierOrder;

    fn bucket_with_tier() -> (Bucket, Arc<Tier>) {
        let tier = Arc::new(Tier::new("hot", ChunkCoderConfig::replicated(1), vec![]));
        let tiering = Arc::new(Tiering::new("policy", vec![TierOrder::new(tier.clone(), 0)]));
        (Bucket::new("b", tiering), tier)
    }

    #[test]
    fn test_deleted_bucket_visibility() {
        let store = InMemorySystemStore::new();
        let (bucket, tier) = bucket_with_tier();
        let bucket = store.add_bucket(bucket);
        assert!(store.tier(&tier.id).is_some());

        store.delete_bucket(&bucket.id).unwrap();
        assert!(store.bucket(&bucket.id).is_none());
        assert!(store.bucket_include_deleted(&bucket.id).unwrap().deleted);
    }

    #[test]
    fn test_update_tiering_bumps_revision() {
        let store = InMemorySystemStore::new();
        let (bucket, _) = bucket_with_tier();
        let bucket = store.add_bucket(bucket);
        let cold = Arc::new(Tier::new("cold", ChunkCoderConfig::replicated(1), vec![]));

        let updated = store
            .update_tiering(&bucket.tiering.id, |t| {
                t.tiers.push(TierOrder::new(cold.clone(), 1))
            })
            .unwrap();

        assert_eq!(updated.revision, bucket.tiering.revision + 1);
        let reloaded = store.bucket(&bucket.id).unwrap();
        assert_eq!(reloaded.tiering.tiers.len(), 2);
        assert!(store.tier(&cold.id).is_some());
    }

    #[tokio::test]
    async fn test_refresh_counts() {
        let store = InMemorySystemStore::new();
        store.refresh().await.unwrap();
        store.refresh().await.unwrap();
        assert_eq!(store.refresh_count(), 2);
        assert!(store.delete_bucket(&BucketId::new()).is_err());
    }
}
