//! Tiering mapper cache
//!
//! One [`TieringMapper`] per tiering policy, rebuilt whenever the policy
//! revision changes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use super::tiering::TieringMapper;
use crate::config::MapperConfig;
use crate::domain::ids::TieringId;
use crate::domain::system::Tiering;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Debug)]
pub struct TieringMapperCache {
    config: MapperConfig,
    mappers: DashMap<TieringId, Arc<TieringMapper>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TieringMapperCache {
    pub fn new(config: MapperConfig) -> Self {
        Self {
            config,
            mappers: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    /// Mapper for the tiering, built on first use or revision change.
    pub fn get(&self, tiering: &Tiering) -> Arc<TieringMapper> {
        let cached = self
            .mappers
            .get(&tiering.id)
            .filter(|m| m.revision() == tiering.revision)
            .map(|m| m.clone());

        let mapper = match cached {
            Some(mapper) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                mapper
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let mapper = Arc::new(TieringMapper::new(tiering));
                self.mappers.insert(tiering.id, mapper.clone());
                mapper
            }
        };

        let interval = self.config.cache_stats_interval;
        if interval > 0 {
            let stats = self.stats();
            if (stats.hits + stats.misses) % interval == 0 {
                info!(
                    hits = stats.hits,
                    misses = stats.misses,
                    entries = stats.entries,
                    "Tiering mapper cache stats"
                );
            }
        }
        mapper
    }

    pub fn invalidate(&self, tiering_id: &TieringId) {
        self.mappers.remove(tiering_id);
    }

    pub fn clear(&self) {
        self.mappers.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.mappers.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::ChunkCoderConfig;
    use crate::domain::system::{Tier, TierOrder};

    fn tiering() -> Tiering {
        let tier = Arc::new(Tier::new("hot", ChunkCoderConfig::default(), vec![]));
        Tiering::new("policy", vec![TierOrder::new(tier, 0)])
    }

    #[test]
    fn test_hit_until_revision_changes() {
        let cache = TieringMapperCache::new(MapperConfig::default());
        let mut tiering = tiering();

        let first = cache.get(&tiering);
        let second = cache.get(&tiering);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);

        tiering.revision += 1;
        let third = cache.get(&tiering);
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third.revision(), tiering.revision);
        assert_eq!(cache.stats().misses, 2);
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn test_invalidate_forces_rebuild() {
        let cache = TieringMapperCache::new(MapperConfig::default());
        let tiering = tiering();
        let first = cache.get(&tiering);
        cache.invalidate(&tiering.id);
        assert_eq!(cache.stats().entries, 0);
        let second = cache.get(&tiering);
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
