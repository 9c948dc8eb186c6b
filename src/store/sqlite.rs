//! SQLite-backed position store.
//!
//! Distance filtering runs in SQL: a bounding-box prefilter on the indexed
//! `(x, y)` columns followed by an exact squared-distance predicate. The ids a
//! clustering run may absorb are loaded once per run into the connection's
//! temporary `candidate_scope` table and checked by primary key per row.

use chrono::{DateTime, Utc};
use log::{debug, info};
use rusqlite::{params, Connection, Row};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{CandidateScope, PositionSink, PositionStore};
use crate::error::StoreError;
use crate::{Bounds, MercatorPoint, NewPosition, Position, PositionId};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS animals (
    imei TEXT PRIMARY KEY,
    farm_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS geolocations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    imei TEXT NOT NULL,
    x REAL NOT NULL,
    y REAL NOT NULL,
    time_ms INTEGER NOT NULL,
    UNIQUE (imei, time_ms)
);

CREATE INDEX IF NOT EXISTS idx_animals_farm ON animals(farm_id);
CREATE INDEX IF NOT EXISTS idx_geolocations_xy ON geolocations(x, y);

CREATE TEMP TABLE IF NOT EXISTS candidate_scope (
    scope_id INTEGER NOT NULL,
    position_id INTEGER NOT NULL,
    PRIMARY KEY (scope_id, position_id)
) WITHOUT ROWID;
"#;

/// Raw column values of one `geolocations` row.
struct GeolocationRow {
    id: i64,
    imei: String,
    x: f64,
    y: f64,
    time_ms: i64,
}

impl GeolocationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            imei: row.get(1)?,
            x: row.get(2)?,
            y: row.get(3)?,
            time_ms: row.get(4)?,
        })
    }

    fn into_position(self) -> Result<Position, StoreError> {
        let timestamp = DateTime::from_timestamp_millis(self.time_ms).ok_or_else(|| {
            StoreError::InvalidRow {
                message: format!("geolocation {} has out-of-range time {}", self.id, self.time_ms),
            }
        })?;
        Ok(Position {
            id: PositionId(self.id),
            entity_id: self.imei,
            coordinate: MercatorPoint::new(self.x, self.y),
            timestamp,
        })
    }
}

/// Position store persisted in an SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create a new in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let store = Self::from_connection(Connection::open(path)?)?;
        info!("Opened position store at {}", path.display());
        Ok(store)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Attach an entity to a farm, moving it if it was registered elsewhere.
    pub fn register_entity(&self, farm_id: &str, entity_id: &str) -> Result<(), StoreError> {
        self.lock()?.execute(
            "INSERT INTO animals (imei, farm_id) VALUES (?1, ?2)
             ON CONFLICT(imei) DO UPDATE SET farm_id = excluded.farm_id",
            params![entity_id, farm_id],
        )?;
        Ok(())
    }

    /// Store a position, replacing the coordinate of an existing
    /// `(entity_id, timestamp)` pair.
    pub fn insert(&self, new: &NewPosition) -> Result<PositionId, StoreError> {
        let id: i64 = self.lock()?.query_row(
            "INSERT INTO geolocations (imei, x, y, time_ms) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(imei, time_ms) DO UPDATE SET x = excluded.x, y = excluded.y
             RETURNING id",
            params![
                new.entity_id,
                new.coordinate.x,
                new.coordinate.y,
                new.timestamp.timestamp_millis()
            ],
            |row| row.get(0),
        )?;
        Ok(PositionId(id))
    }

    /// Number of stored positions.
    pub fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .lock()?
            .query_row("SELECT COUNT(*) FROM geolocations", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }
}

impl PositionStore for SqliteStore {
    fn positions_for_entity(
        &self,
        entity_id: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Position>, StoreError> {
        let start_ms = start.map_or(i64::MIN, |s| s.timestamp_millis());
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, imei, x, y, time_ms FROM geolocations
             WHERE imei = ?1 AND time_ms >= ?2 AND time_ms <= ?3
             ORDER BY time_ms",
        )?;
        let rows = stmt
            .query_map(params![entity_id, start_ms, end.timestamp_millis()], GeolocationRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(GeolocationRow::into_position).collect()
    }

    fn open_scope(&self, scope: &CandidateScope) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO candidate_scope (scope_id, position_id) VALUES (?1, ?2)",
            )?;
            for id in scope.ids() {
                stmt.execute(params![scope.id() as i64, id.0])?;
            }
        }
        tx.commit()?;
        debug!("Loaded {} candidates into scope {}", scope.len(), scope.id());
        Ok(())
    }

    fn close_scope(&self, scope: &CandidateScope) -> Result<(), StoreError> {
        self.lock()?.execute(
            "DELETE FROM candidate_scope WHERE scope_id = ?1",
            params![scope.id() as i64],
        )?;
        Ok(())
    }

    fn within_distance(
        &self,
        scope: &CandidateScope,
        reference: MercatorPoint,
        max_distance_m: f64,
        exclude: &HashSet<PositionId>,
    ) -> Result<Vec<Position>, StoreError> {
        let bbox = Bounds::around(&reference, max_distance_m);

        let conn = self.lock()?;
        // The correlated EXISTS keeps the spatial index on the outer loop
        let mut stmt = conn.prepare_cached(
            "SELECT g.id, g.imei, g.x, g.y, g.time_ms FROM geolocations g
             WHERE g.x BETWEEN ?1 AND ?2 AND g.y BETWEEN ?3 AND ?4
               AND (g.x - ?5) * (g.x - ?5) + (g.y - ?6) * (g.y - ?6) <= ?7
               AND EXISTS (
                   SELECT 1 FROM candidate_scope c
                   WHERE c.scope_id = ?8 AND c.position_id = g.id
               )
             ORDER BY g.id",
        )?;
        let rows = stmt
            .query_map(
                params![
                    bbox.min_x,
                    bbox.max_x,
                    bbox.min_y,
                    bbox.max_y,
                    reference.x,
                    reference.y,
                    max_distance_m * max_distance_m,
                    scope.id() as i64
                ],
                GeolocationRow::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let in_scope = rows.len();
        let found = rows
            .into_iter()
            .filter(|row| !exclude.contains(&PositionId(row.id)))
            .map(GeolocationRow::into_position)
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "within_distance({:.1}, {:.1}, r={:.1}): {} candidates in range, {} unassigned",
            reference.x,
            reference.y,
            max_distance_m,
            in_scope,
            found.len()
        );

        Ok(found)
    }

    fn latest_per_entity(&self, farm_id: &str) -> Result<Vec<Position>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT g.id, g.imei, g.x, g.y, g.time_ms
             FROM geolocations g
             JOIN animals a ON a.imei = g.imei
             WHERE a.farm_id = ?1
               AND g.time_ms = (SELECT MAX(time_ms) FROM geolocations WHERE imei = g.imei)
             ORDER BY g.imei",
        )?;
        let rows = stmt
            .query_map(params![farm_id], GeolocationRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(GeolocationRow::into_position).collect()
    }
}

impl PositionSink for SqliteStore {
    fn insert_position(&mut self, position: NewPosition) -> Result<PositionId, StoreError> {
        self.insert(&position)
    }

    fn register(&mut self, farm_id: &str, entity_id: &str) -> Result<(), StoreError> {
        self.register_entity(farm_id, entity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::cluster_positions;
    use crate::error::ClusterError;
    use chrono::{Duration, TimeZone};

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn at(entity: &str, x: f64, y: f64, minutes: i64) -> NewPosition {
        NewPosition::new(entity, MercatorPoint::new(x, y), t(minutes))
    }

    #[test]
    fn test_insert_and_track_query() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert(&at("a", 2.0, 0.0, 20)).unwrap();
        store.insert(&at("a", 0.0, 0.0, 0)).unwrap();
        store.insert(&at("a", 1.0, 0.0, 10)).unwrap();
        store.insert(&at("b", 7.0, 7.0, 10)).unwrap();

        let track = store.positions_for_entity("a", Some(t(5)), t(20)).unwrap();
        let xs: Vec<f64> = track.iter().map(|p| p.coordinate.x).collect();
        assert_eq!(xs, vec![1.0, 2.0]);
        assert_eq!(track[0].timestamp, t(10));

        let open = store.positions_for_entity("a", None, t(20)).unwrap();
        assert_eq!(open.len(), 3);
    }

    #[test]
    fn test_insert_replaces_same_timestamp() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id1 = store.insert(&at("a", 0.0, 0.0, 0)).unwrap();
        let id2 = store.insert(&at("a", 4.0, 4.0, 0)).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(store.count().unwrap(), 1);

        let track = store.positions_for_entity("a", None, t(0)).unwrap();
        assert_eq!(track[0].coordinate, MercatorPoint::new(4.0, 4.0));
    }

    #[test]
    fn test_within_distance() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.insert(&at("a", 0.0, 0.0, 0)).unwrap();
        let b = store.insert(&at("b", 3.0, 4.0, 0)).unwrap();
        let c = store.insert(&at("c", 6.0, 8.0, 0)).unwrap();
        let outside = store.insert(&at("d", 1.0, 0.0, 0)).unwrap();

        let scope = CandidateScope::new([a, b, c]);
        store.open_scope(&scope).unwrap();

        let found = store
            .within_distance(&scope, MercatorPoint::new(0.0, 0.0), 5.0, &HashSet::new())
            .unwrap();
        let ids: Vec<PositionId> = found.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![a, b]);
        assert!(!ids.contains(&outside));

        let exclude: HashSet<PositionId> = [b].into_iter().collect();
        let found = store
            .within_distance(&scope, MercatorPoint::new(6.0, 8.0), 5.0, &exclude)
            .unwrap();
        let ids: Vec<PositionId> = found.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![c]);

        store.close_scope(&scope).unwrap();
    }

    fn scoped_rows(store: &SqliteStore) -> i64 {
        store
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM candidate_scope", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_scopes_are_isolated_and_released() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.insert(&at("a", 0.0, 0.0, 0)).unwrap();
        let b = store.insert(&at("b", 1.0, 0.0, 0)).unwrap();

        let only_a = CandidateScope::new([a]);
        let only_b = CandidateScope::new([b]);
        store.open_scope(&only_a).unwrap();
        store.open_scope(&only_b).unwrap();
        assert_eq!(scoped_rows(&store), 2);

        let origin = MercatorPoint::new(0.0, 0.0);
        let found = store.within_distance(&only_b, origin, 10.0, &HashSet::new()).unwrap();
        assert_eq!(found.iter().map(|p| p.id).collect::<Vec<_>>(), vec![b]);

        // A scope that was never opened sees nothing
        let unopened = CandidateScope::new([a, b]);
        assert!(store.within_distance(&unopened, origin, 10.0, &HashSet::new()).unwrap().is_empty());

        store.close_scope(&only_a).unwrap();
        store.close_scope(&only_b).unwrap();
        assert_eq!(scoped_rows(&store), 0);
    }

    #[test]
    fn test_history_outside_scope_is_not_absorbed() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.register_entity("farm", "a").unwrap();
        store.register_entity("farm", "b").unwrap();
        // Old fixes of "a" form a bridge between the two latest positions
        for (i, x) in [2.0, 4.0, 6.0, 8.0].iter().enumerate() {
            store.insert(&at("a", *x, 0.0, i as i64)).unwrap();
        }
        store.insert(&at("a", 0.0, 0.0, 60)).unwrap();
        store.insert(&at("b", 10.0, 0.0, 60)).unwrap();

        let positions = store.latest_per_entity("farm").unwrap();
        let clusters = cluster_positions(&store, &positions, 2.5).unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(scoped_rows(&store), 0);
    }

    #[test]
    fn test_invalid_threshold_leaves_no_scope_behind() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert(&at("a", 0.0, 0.0, 0)).unwrap();
        let positions = store.positions_for_entity("a", None, t(0)).unwrap();

        for threshold in [-5.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                cluster_positions(&store, &positions, threshold),
                Err(ClusterError::InvalidThreshold { .. })
            ));
        }
        assert_eq!(scoped_rows(&store), 0);
    }

    #[test]
    fn test_latest_per_entity() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.register_entity("farm", "a").unwrap();
        store.register_entity("farm", "b").unwrap();
        store.register_entity("other", "c").unwrap();
        store.insert(&at("a", 0.0, 0.0, 0)).unwrap();
        let latest_a = store.insert(&at("a", 1.0, 0.0, 60)).unwrap();
        let latest_b = store.insert(&at("b", 5.0, 5.0, 30)).unwrap();
        store.insert(&at("c", 9.0, 9.0, 90)).unwrap();

        let ids: Vec<PositionId> = store
            .latest_per_entity("farm")
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec![latest_a, latest_b]);
        assert!(store.latest_per_entity("nowhere").unwrap().is_empty());

        store.register_entity("other", "a").unwrap();
        assert_eq!(store.latest_per_entity("farm").unwrap().len(), 1);
    }

    #[test]
    fn test_clustering_matches_memory_store() {
        let store = SqliteStore::open_in_memory().unwrap();
        for (i, x) in [0.0, 1.0, 10.0, 11.0].iter().enumerate() {
            store.register_entity("farm", &format!("e{}", i)).unwrap();
            store.insert(&at(&format!("e{}", i), *x, 0.0, 0)).unwrap();
        }

        let positions = store.latest_per_entity("farm").unwrap();
        let clusters = cluster_positions(&store, &positions, 2.0).unwrap();
        assert_eq!(clusters.len(), 2);
        assert!(clusters.iter().all(|c| c.len() == 2));
    }

    #[test]
    fn test_chain_clusters_in_any_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        for (i, x) in [0.0, 3.0, 6.0].iter().enumerate() {
            store.insert(&at(&format!("e{}", i), *x, 0.0, 0)).unwrap();
        }
        let mut positions = Vec::new();
        for i in 0..3 {
            positions.extend(store.positions_for_entity(&format!("e{}", i), None, t(0)).unwrap());
        }

        // Far end first, bridging point last
        let input = vec![positions[0].clone(), positions[2].clone(), positions[1].clone()];
        let clusters = cluster_positions(&store, &input, 4.0).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 3);
    }
}
