//! In-memory position store backed by an R-tree.

use chrono::{DateTime, Utc};
use rstar::{PointDistance, RTree, RTreeObject, AABB};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;

use super::{CandidateScope, PositionSink, PositionStore};
use crate::error::StoreError;
use crate::{MercatorPoint, NewPosition, Position, PositionId};

/// A stored position's location in the spatial index.
#[derive(Debug, Clone, Copy, PartialEq)]
struct IndexedPoint {
    id: PositionId,
    point: [f64; 2],
}

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.point)
    }
}

impl PointDistance for IndexedPoint {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.point[0] - point[0];
        let dy = self.point[1] - point[1];
        dx * dx + dy * dy
    }
}

/// Position store held entirely in memory.
///
/// # Example
/// ```
/// use chrono::{TimeZone, Utc};
/// use herd_tracks::{MemoryStore, MercatorPoint, NewPosition, PositionStore};
///
/// let mut store = MemoryStore::new();
/// let t = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
/// let id = store.insert(NewPosition::new("860000000000001", MercatorPoint::new(10.0, 20.0), t));
///
/// let track = store.positions_for_entity("860000000000001", None, t).unwrap();
/// assert_eq!(track.len(), 1);
/// assert_eq!(track[0].id, id);
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    positions: HashMap<PositionId, Position>,
    /// entity id -> timestamp -> position id
    tracks: HashMap<String, BTreeMap<DateTime<Utc>, PositionId>>,
    /// farm id -> entity ids
    farms: HashMap<String, BTreeSet<String>>,
    index: RTree<IndexedPoint>,
    next_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored positions.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Attach an entity to a farm, moving it if it was registered elsewhere.
    pub fn register_entity(&mut self, farm_id: &str, entity_id: &str) {
        for entities in self.farms.values_mut() {
            entities.remove(entity_id);
        }
        self.farms
            .entry(farm_id.to_string())
            .or_default()
            .insert(entity_id.to_string());
    }

    /// Store a position, replacing the coordinate of an existing
    /// `(entity_id, timestamp)` pair.
    pub fn insert(&mut self, new: NewPosition) -> PositionId {
        let existing = self
            .tracks
            .get(&new.entity_id)
            .and_then(|track| track.get(&new.timestamp))
            .copied();

        if let Some(id) = existing {
            if let Some(stored) = self.positions.get_mut(&id) {
                self.index.remove(&IndexedPoint {
                    id,
                    point: [stored.coordinate.x, stored.coordinate.y],
                });
                stored.coordinate = new.coordinate;
            }
            self.index.insert(IndexedPoint {
                id,
                point: [new.coordinate.x, new.coordinate.y],
            });
            return id;
        }

        self.next_id += 1;
        let id = PositionId(self.next_id);

        self.index.insert(IndexedPoint {
            id,
            point: [new.coordinate.x, new.coordinate.y],
        });
        self.tracks
            .entry(new.entity_id.clone())
            .or_default()
            .insert(new.timestamp, id);
        self.positions.insert(
            id,
            Position {
                id,
                entity_id: new.entity_id,
                coordinate: new.coordinate,
                timestamp: new.timestamp,
            },
        );

        id
    }

    /// Look up a stored position by id.
    pub fn get(&self, id: PositionId) -> Option<&Position> {
        self.positions.get(&id)
    }
}

impl PositionStore for MemoryStore {
    fn positions_for_entity(
        &self,
        entity_id: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Position>, StoreError> {
        let Some(track) = self.tracks.get(entity_id) else {
            return Ok(vec![]);
        };
        if start.is_some_and(|s| s > end) {
            return Ok(vec![]);
        }

        let lower = start.map_or(Bound::Unbounded, Bound::Included);
        Ok(track
            .range((lower, Bound::Included(end)))
            .filter_map(|(_, id)| self.positions.get(id).cloned())
            .collect())
    }

    fn within_distance(
        &self,
        scope: &CandidateScope,
        reference: MercatorPoint,
        max_distance_m: f64,
        exclude: &HashSet<PositionId>,
    ) -> Result<Vec<Position>, StoreError> {
        let mut found: Vec<Position> = self
            .index
            .locate_within_distance([reference.x, reference.y], max_distance_m * max_distance_m)
            .filter(|entry| scope.contains(entry.id) && !exclude.contains(&entry.id))
            .filter_map(|entry| self.positions.get(&entry.id).cloned())
            .collect();

        // R-tree traversal order is arbitrary
        found.sort_by_key(|p| p.id);
        Ok(found)
    }

    fn latest_per_entity(&self, farm_id: &str) -> Result<Vec<Position>, StoreError> {
        let Some(entities) = self.farms.get(farm_id) else {
            return Ok(vec![]);
        };

        Ok(entities
            .iter()
            .filter_map(|entity_id| self.tracks.get(entity_id))
            .filter_map(|track| track.values().next_back())
            .filter_map(|id| self.positions.get(id).cloned())
            .collect())
    }
}

impl PositionSink for MemoryStore {
    fn insert_position(&mut self, position: NewPosition) -> Result<PositionId, StoreError> {
        Ok(self.insert(position))
    }

    fn register(&mut self, farm_id: &str, entity_id: &str) -> Result<(), StoreError> {
        self.register_entity(farm_id, entity_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn at(entity: &str, x: f64, y: f64, minutes: i64) -> NewPosition {
        NewPosition::new(entity, MercatorPoint::new(x, y), t(minutes))
    }

    #[test]
    fn test_positions_for_entity_ordered_and_bounded() {
        let mut store = MemoryStore::new();
        store.insert(at("a", 2.0, 0.0, 20));
        store.insert(at("a", 0.0, 0.0, 0));
        store.insert(at("a", 1.0, 0.0, 10));
        store.insert(at("a", 3.0, 0.0, 30));
        store.insert(at("b", 9.0, 9.0, 15));

        let track = store.positions_for_entity("a", Some(t(10)), t(20)).unwrap();
        let xs: Vec<f64> = track.iter().map(|p| p.coordinate.x).collect();
        assert_eq!(xs, vec![1.0, 2.0]);

        let open = store.positions_for_entity("a", None, t(25)).unwrap();
        assert_eq!(open.len(), 3);
        assert!(open.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

        assert!(store.positions_for_entity("missing", None, t(100)).unwrap().is_empty());
        assert!(store.positions_for_entity("a", Some(t(30)), t(0)).unwrap().is_empty());
    }

    #[test]
    fn test_insert_replaces_same_timestamp() {
        let mut store = MemoryStore::new();
        let id1 = store.insert(at("a", 0.0, 0.0, 0));
        let id2 = store.insert(at("a", 50.0, 50.0, 0));
        assert_eq!(id1, id2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(id1).unwrap().coordinate, MercatorPoint::new(50.0, 50.0));

        // The index follows the new coordinate
        let scope = CandidateScope::new([id1]);
        let near_old = store
            .within_distance(&scope, MercatorPoint::new(0.0, 0.0), 1.0, &HashSet::new())
            .unwrap();
        assert!(near_old.is_empty());
        let near_new = store
            .within_distance(&scope, MercatorPoint::new(50.0, 50.0), 1.0, &HashSet::new())
            .unwrap();
        assert_eq!(near_new.len(), 1);
    }

    #[test]
    fn test_within_distance_respects_candidates_and_exclusions() {
        let mut store = MemoryStore::new();
        let a = store.insert(at("a", 0.0, 0.0, 0));
        let b = store.insert(at("b", 3.0, 4.0, 0));
        let c = store.insert(at("c", 6.0, 8.0, 0));
        let outside = store.insert(at("d", 1.0, 1.0, 0));

        let scope = CandidateScope::new([a, b, c]);
        let found = store
            .within_distance(&scope, MercatorPoint::new(0.0, 0.0), 5.0, &HashSet::new())
            .unwrap();
        let ids: Vec<PositionId> = found.iter().map(|p| p.id).collect();
        // Boundary is inclusive; `outside` is not a candidate
        assert_eq!(ids, vec![a, b]);
        assert!(!ids.contains(&outside));

        let exclude: HashSet<PositionId> = [a].into_iter().collect();
        let found = store
            .within_distance(&scope, MercatorPoint::new(0.0, 0.0), 10.0, &exclude)
            .unwrap();
        let ids: Vec<PositionId> = found.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![b, c]);
    }

    #[test]
    fn test_latest_per_entity() {
        let mut store = MemoryStore::new();
        store.register_entity("farm", "a");
        store.register_entity("farm", "b");
        store.register_entity("other", "c");
        store.insert(at("a", 0.0, 0.0, 0));
        let latest_a = store.insert(at("a", 1.0, 0.0, 60));
        let latest_b = store.insert(at("b", 5.0, 5.0, 30));
        store.insert(at("c", 9.0, 9.0, 90));

        let latest = store.latest_per_entity("farm").unwrap();
        let ids: Vec<PositionId> = latest.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![latest_a, latest_b]);

        assert!(store.latest_per_entity("nowhere").unwrap().is_empty());
    }

    #[test]
    fn test_register_moves_entity() {
        let mut store = MemoryStore::new();
        store.register_entity("farm-1", "a");
        store.register_entity("farm-2", "a");
        store.insert(at("a", 0.0, 0.0, 0));

        assert!(store.latest_per_entity("farm-1").unwrap().is_empty());
        assert_eq!(store.latest_per_entity("farm-2").unwrap().len(), 1);
    }
}
