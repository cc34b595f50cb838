//! Tiering Mapper
//!
//! The ordered tier mappers of one tiering policy and the tier selection for
//! new writes.

use tracing::debug;

use super::tier::{DeletionRefusal, TierMapper, TierMapperStatus};
use crate::config::MapperConfig;
use crate::domain::ids::{TierId, TieringId};
use crate::domain::model::Chunk;
use crate::domain::system::{LocationInfo, Tiering, TieringStatus};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct TieringMapper {
    tiering_id: TieringId,
    tiering_name: String,
    revision: u64,
    /// Enabled tiers, ascending order
    tier_mappers: Vec<TierMapper>,
}

/// Per-tier status, indexed like the mapper's tiers.
#[derive(Debug, Clone, Default)]
pub struct TieringMapperStatus {
    pub tiers: Vec<TierMapperStatus>,
}

impl TieringMapper {
    pub fn new(tiering: &Tiering) -> Self {
        let mut tiers: Vec<_> = tiering.tiers.iter().filter(|t| !t.disabled).collect();
        tiers.sort_by_key(|t| t.order);
        Self {
            tiering_id: tiering.id,
            tiering_name: tiering.name.clone(),
            revision: tiering.revision,
            tier_mappers: tiers.into_iter().map(TierMapper::new).collect(),
        }
    }

    pub fn tiering_id(&self) -> TieringId {
        self.tiering_id
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn tier_mappers(&self) -> &[TierMapper] {
        &self.tier_mappers
    }

    pub fn contains_tier(&self, tier_id: &TierId) -> bool {
        self.position(tier_id).is_some()
    }

    fn position(&self, tier_id: &TierId) -> Option<usize> {
        self.tier_mappers.iter().position(|t| &t.tier_id() == tier_id)
    }

    pub fn update_status(
        &self,
        status: &TieringStatus,
        location: Option<&LocationInfo>,
        config: &MapperConfig,
    ) -> TieringMapperStatus {
        TieringMapperStatus {
            tiers: self
                .tier_mappers
                .iter()
                .map(|t| t.update_status(status.get(&t.tier_id()), location, config))
                .collect(),
        }
    }

    /// Map the chunk onto the given tier of this policy.
    pub fn map_tiering(
        &self,
        status: &TieringMapperStatus,
        chunk: &mut Chunk,
        tier_id: &TierId,
    ) -> Result<Option<DeletionRefusal>> {
        let index = self.position(tier_id).ok_or_else(|| Error::TierNotInTiering {
            tier: tier_id.to_string(),
            tiering: self.tiering_name.clone(),
        })?;
        let tier_status = status
            .tiers
            .get(index)
            .ok_or_else(|| Error::Internal(format!("no status for tier {}", tier_id)))?;
        self.tier_mappers[index].map_tier(tier_status, chunk)
    }

    /// First online tier with `order >= start_order`.
    ///
    /// Falls back to the first considered tier when none is online, so data
    /// still lands somewhere while capacity repair catches up.
    pub fn select_tier_for_write(
        &self,
        status: &TieringMapperStatus,
        start_order: Option<u32>,
    ) -> Option<&TierMapper> {
        let start = start_order.unwrap_or(0);
        let mut fallback = None;
        for (mapper, tier_status) in self.tier_mappers.iter().zip(&status.tiers) {
            if mapper.order() < start {
                continue;
            }
            if tier_status.online {
                return Some(mapper);
            }
            fallback.get_or_insert(mapper);
        }
        if let Some(mapper) = fallback {
            debug!(
                tiering = %self.tiering_name,
                tier = %mapper.tier().name,
                "No online tier for write, using first tier considered"
            );
        }
        fallback
    }
}
