//! Animal path reconstruction.
//!
//! A path is the literal polyline through an animal's positions in timestamp
//! order. No smoothing, simplification or interpolation is applied: what the
//! tracker reported is what the map shows.

use chrono::{DateTime, Utc};
use geo::{Coord, LineString};
use serde::{Deserialize, Serialize};

use crate::error::PathError;
use crate::geo_utils;
use crate::{Bounds, MercatorPoint, Position};

/// A reconstructed trajectory for one animal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackPath {
    /// Animal/tracker the path belongs to
    pub entity_id: String,
    /// Vertices in EPSG:3857 meters, in input order
    pub line: LineString<f64>,
    /// Timestamp of the first vertex
    pub started_at: DateTime<Utc>,
    /// Timestamp of the last vertex
    pub ended_at: DateTime<Utc>,
    /// Total projected length in meters
    pub length_m: f64,
}

impl TrackPath {
    /// Number of vertices.
    pub fn vertex_count(&self) -> usize {
        self.line.0.len()
    }

    /// Vertices as projected points.
    pub fn points(&self) -> Vec<MercatorPoint> {
        self.line.0.iter().map(|c| MercatorPoint::from(*c)).collect()
    }

    /// Vertices as WGS84 `(latitude, longitude)` pairs.
    pub fn to_lat_lng(&self) -> Vec<(f64, f64)> {
        self.points().iter().map(MercatorPoint::to_lat_lng).collect()
    }

    /// Distance walked on the ground, in meters.
    pub fn ground_length_m(&self) -> f64 {
        geo_utils::ground_length(&self.points())
    }

    /// Bounding box of the path.
    pub fn bounds(&self) -> Bounds {
        geo_utils::compute_bounds(&self.points())
    }
}

/// Build a path from positions already sorted ascending by timestamp.
///
/// Sorting is the store's job; the vertices follow input order exactly.
/// Fails with [`PathError::NotEnoughData`] for fewer than two positions, since a
/// line needs at least two vertices.
///
/// # Example
/// ```
/// use chrono::{Duration, TimeZone, Utc};
/// use herd_tracks::{build_path, MercatorPoint, Position, PositionId};
///
/// let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
/// let positions: Vec<Position> = [(0.0, 0.0), (1.0, 1.0), (2.0, 2.0)]
///     .iter()
///     .enumerate()
///     .map(|(i, &(x, y))| Position {
///         id: PositionId(i as i64),
///         entity_id: "860000000000001".to_string(),
///         coordinate: MercatorPoint::new(x, y),
///         timestamp: t0 + Duration::minutes(i as i64),
///     })
///     .collect();
///
/// let path = build_path("860000000000001", &positions).unwrap();
/// assert_eq!(path.vertex_count(), 3);
/// assert_eq!(path.points()[1], MercatorPoint::new(1.0, 1.0));
///
/// assert!(build_path("860000000000001", &positions[..1]).is_err());
/// ```
pub fn build_path(entity_id: &str, positions: &[Position]) -> Result<TrackPath, PathError> {
    let (first, last) = match positions {
        [first, .., last] => (first, last),
        _ => {
            return Err(PathError::NotEnoughData {
                found: positions.len(),
            })
        }
    };

    let points: Vec<MercatorPoint> = positions.iter().map(|p| p.coordinate).collect();
    let length_m = geo_utils::polyline_length(&points);
    let line: LineString<f64> = points.into_iter().map(Coord::from).collect();

    Ok(TrackPath {
        entity_id: entity_id.to_string(),
        line,
        started_at: first.timestamp,
        ended_at: last.timestamp,
        length_m,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PositionId;
    use chrono::{Duration, TimeZone};

    fn make_positions(coords: &[(f64, f64)]) -> Vec<Position> {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        coords
            .iter()
            .enumerate()
            .map(|(i, &(x, y))| Position {
                id: PositionId(i as i64 + 1),
                entity_id: "a".to_string(),
                coordinate: MercatorPoint::new(x, y),
                timestamp: t0 + Duration::minutes(i as i64 * 10),
            })
            .collect()
    }

    #[test]
    fn test_path_follows_input_order() {
        let positions = make_positions(&[(0.0, 0.0), (1.0, 1.0), (2.0, 2.0)]);
        let path = build_path("a", &positions).unwrap();

        assert_eq!(
            path.points(),
            vec![
                MercatorPoint::new(0.0, 0.0),
                MercatorPoint::new(1.0, 1.0),
                MercatorPoint::new(2.0, 2.0),
            ]
        );
        assert_eq!(path.started_at, positions[0].timestamp);
        assert_eq!(path.ended_at, positions[2].timestamp);
        assert!((path.length_m - 2.0 * 2f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_path_keeps_backtracking_and_repeats() {
        // No simplification: revisits and stationary fixes stay in
        let positions = make_positions(&[(0.0, 0.0), (5.0, 0.0), (5.0, 0.0), (0.0, 0.0)]);
        let path = build_path("a", &positions).unwrap();
        assert_eq!(path.vertex_count(), 4);
        assert_eq!(path.length_m, 10.0);
    }

    #[test]
    fn test_two_positions_is_enough() {
        let positions = make_positions(&[(0.0, 0.0), (3.0, 4.0)]);
        let path = build_path("a", &positions).unwrap();
        assert_eq!(path.vertex_count(), 2);
        assert_eq!(path.length_m, 5.0);
    }

    #[test]
    fn test_not_enough_data() {
        let single = make_positions(&[(0.0, 0.0)]);
        assert_eq!(
            build_path("a", &single),
            Err(PathError::NotEnoughData { found: 1 })
        );
        assert_eq!(build_path("a", &[]), Err(PathError::NotEnoughData { found: 0 }));
    }

    #[test]
    fn test_lat_lng_and_bounds() {
        let positions = vec![
            Position {
                id: PositionId(1),
                entity_id: "a".to_string(),
                coordinate: MercatorPoint::from_lat_lng(43.0, 76.0),
                timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            },
            Position {
                id: PositionId(2),
                entity_id: "a".to_string(),
                coordinate: MercatorPoint::from_lat_lng(43.01, 76.0),
                timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 0, 10, 0).unwrap(),
            },
        ];
        let path = build_path("a", &positions).unwrap();

        let lat_lngs = path.to_lat_lng();
        assert!((lat_lngs[1].0 - 43.01).abs() < 1e-9);

        // 0.01° of latitude is about 1.11 km on the ground
        assert!((path.ground_length_m() - 1_112.0).abs() < 5.0, "{}", path.ground_length_m());
        assert!(path.length_m > path.ground_length_m());

        let bounds = path.bounds();
        assert_eq!(bounds.min_x, bounds.max_x);
        assert!(bounds.max_y > bounds.min_y);
    }
}
