//! Position stores.
//!
//! The clustering and path algorithms never scan positions themselves: they
//! ask a [`PositionStore`] for time-ordered tracks, distance-bounded
//! neighbours and the latest fix per animal. Distance filtering happens on the
//! store side, where it can use a spatial index.
//!
//! Implementations:
//! - [`MemoryStore`]: R-tree over all positions, used by tests and demos
//! - `SqliteStore` (feature `sqlite`): rusqlite-backed persistent store

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::StoreError;
use crate::{MercatorPoint, NewPosition, Position, PositionId};

mod memory;
pub use memory::MemoryStore;

#[cfg(feature = "sqlite")]
pub mod sqlite;

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// The positions a clustering run may absorb.
///
/// Built once per run and handed to every range query, so stores can test
/// membership in O(1) or load the ids into an index of their own.
#[derive(Debug, Clone)]
pub struct CandidateScope {
    id: u64,
    ids: HashSet<PositionId>,
}

impl CandidateScope {
    pub fn new(ids: impl IntoIterator<Item = PositionId>) -> Self {
        Self {
            id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
            ids: ids.into_iter().collect(),
        }
    }

    /// Process-unique id of this scope.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn contains(&self, id: PositionId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = PositionId> + '_ {
        self.ids.iter().copied()
    }
}

/// Read-only spatial and temporal queries over stored positions.
pub trait PositionStore: Send + Sync {
    /// Positions of one entity with `start <= timestamp <= end`, ascending by
    /// timestamp. A `None` start leaves the window open at the bottom.
    fn positions_for_entity(
        &self,
        entity_id: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Position>, StoreError>;

    /// Called once before the range queries of a clustering run.
    fn open_scope(&self, _scope: &CandidateScope) -> Result<(), StoreError> {
        Ok(())
    }

    /// Called once after the range queries of a clustering run, also when the
    /// run failed.
    fn close_scope(&self, _scope: &CandidateScope) -> Result<(), StoreError> {
        Ok(())
    }

    /// Positions in `scope`, excluding `exclude`, whose distance to
    /// `reference` is at most `max_distance_m` projected meters.
    fn within_distance(
        &self,
        scope: &CandidateScope,
        reference: MercatorPoint,
        max_distance_m: f64,
        exclude: &HashSet<PositionId>,
    ) -> Result<Vec<Position>, StoreError>;

    /// The most recent position of each entity registered on a farm, ordered by
    /// entity id. Unknown farms yield an empty list.
    fn latest_per_entity(&self, farm_id: &str) -> Result<Vec<Position>, StoreError>;
}

/// Write access used by ingestion.
pub trait PositionSink {
    /// Store a position. Positions are unique by `(entity_id, timestamp)`; a
    /// second insert for the same pair replaces the coordinate and keeps the id.
    fn insert_position(&mut self, position: NewPosition) -> Result<PositionId, StoreError>;

    /// Attach an entity to a farm, moving it if it was registered elsewhere.
    fn register(&mut self, farm_id: &str, entity_id: &str) -> Result<(), StoreError>;
}
