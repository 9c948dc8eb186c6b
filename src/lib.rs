//! # Herd Tracks
//!
//! Livestock GPS tracking: spatial clustering of a farm's animals and path
//! reconstruction for a single animal.
//!
//! This library provides:
//! - Single-linkage clustering of positions with store-side range queries
//! - Time-ordered path (polyline) reconstruction with a sparse-window fallback
//! - Zoom level to clustering distance configuration
//! - GeoJSON encoding of paths and clusters
//! - Tracker feed downloads with rate limiting
//!
//! ## Features
//!
//! - **`parallel`** - Cluster many farms at once with rayon
//! - **`http`** - Enable HTTP client for tracker feed downloads
//! - **`sqlite`** - Enable the SQLite-backed position store
//! - **`full`** - Enable all features
//!
//! ## Coordinates
//!
//! Positions are stored in Web Mercator (EPSG:3857) meters. Distances and
//! clustering thresholds are plain Euclidean distances in that projection.
//! Use [`MercatorPoint::from_lat_lng`] to project GPS fixes.
//!
//! ## Quick Start
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use herd_tracks::{MemoryStore, MercatorPoint, NewPosition, Tracker, TrackingConfig};
//!
//! let mut store = MemoryStore::new();
//! store.register_entity("farm-1", "860000000000001");
//! store.register_entity("farm-1", "860000000000002");
//!
//! let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
//! store.insert(NewPosition::new("860000000000001", MercatorPoint::new(0.0, 0.0), t));
//! store.insert(NewPosition::new("860000000000002", MercatorPoint::new(500.0, 0.0), t));
//!
//! let tracker = Tracker::new(store, TrackingConfig::default());
//!
//! // Zoomed out: both animals fall into one cluster
//! let clusters = tracker.farm_clusters("farm-1", 5).unwrap();
//! assert_eq!(clusters.len(), 1);
//! assert_eq!(clusters[0].count, 2);
//! ```

use chrono::{DateTime, Utc};
use geo::{Coord, Point};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod geo_utils;

pub mod error;
pub use error::{ClusterError, ConfigError, PathError, RequestError, StoreError, TrackError};

pub mod config;
pub use config::{TrackingConfig, ZoomThreshold, ZoomThresholds};

// Position stores (the spatial query collaborator)
pub mod store;
pub use store::{CandidateScope, MemoryStore, PositionSink, PositionStore};

#[cfg(feature = "sqlite")]
pub use store::sqlite::SqliteStore;

// Path reconstruction
pub mod path;
pub use path::{build_path, TrackPath};

// Single-linkage clustering
pub mod cluster;
pub use cluster::{cluster_positions, verify_partition, Cluster};

// Caller-side orchestration: fallbacks, zoom levels, summaries
pub mod tracker;
pub use tracker::{ClusterSummary, FarmClusters, Tracker};

pub mod request;
pub use request::PathRequest;

// GeoJSON encoding of paths and clusters
pub mod encode;

// HTTP module for tracker feed downloads
#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use error::FeedError;

#[cfg(feature = "http")]
pub use http::{DeviceFeedResult, FeedConfig, TrackerFeedClient};

// ============================================================================
// Core Types
// ============================================================================

/// Identifier of a stored position.
///
/// Stable for the lifetime of the store it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionId(pub i64);

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A point in Web Mercator (EPSG:3857) meters.
///
/// # Example
/// ```
/// use herd_tracks::MercatorPoint;
/// let almaty = MercatorPoint::from_lat_lng(43.2389, 76.8897);
/// let (lat, lng) = almaty.to_lat_lng();
/// assert!((lat - 43.2389).abs() < 1e-9);
/// assert!((lng - 76.8897).abs() < 1e-9);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MercatorPoint {
    pub x: f64,
    pub y: f64,
}

impl MercatorPoint {
    /// Create a new projected point.
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Project a WGS84 latitude/longitude pair.
    pub fn from_lat_lng(latitude: f64, longitude: f64) -> Self {
        geo_utils::lat_lng_to_mercator(latitude, longitude)
    }

    /// Unproject to a WGS84 `(latitude, longitude)` pair.
    pub fn to_lat_lng(&self) -> (f64, f64) {
        geo_utils::mercator_to_lat_lng(self)
    }

    /// Check if both components are finite.
    pub fn is_valid(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Euclidean distance to another point, in projected meters.
    pub fn distance_to(&self, other: &MercatorPoint) -> f64 {
        geo_utils::euclidean_distance(self, other)
    }
}

impl From<MercatorPoint> for Coord {
    fn from(p: MercatorPoint) -> Self {
        Coord { x: p.x, y: p.y }
    }
}

impl From<Coord> for MercatorPoint {
    fn from(c: Coord) -> Self {
        Self { x: c.x, y: c.y }
    }
}

impl From<MercatorPoint> for Point {
    fn from(p: MercatorPoint) -> Self {
        Point::new(p.x, p.y)
    }
}

/// A single tracker observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    /// Owning animal/tracker (tracker IMEI)
    pub entity_id: String,
    pub coordinate: MercatorPoint,
    pub timestamp: DateTime<Utc>,
}

/// A position that has not been stored yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPosition {
    pub entity_id: String,
    pub coordinate: MercatorPoint,
    pub timestamp: DateTime<Utc>,
}

impl NewPosition {
    pub fn new(entity_id: &str, coordinate: MercatorPoint, timestamp: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            coordinate,
            timestamp,
        }
    }
}

/// Axis-aligned bounding box in projected meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl Bounds {
    /// Create bounds from projected points.
    pub fn from_points(points: &[MercatorPoint]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        Some(geo_utils::compute_bounds(points))
    }

    /// Square box of half-width `radius` around a point.
    pub fn around(center: &MercatorPoint, radius: f64) -> Self {
        Self {
            min_x: center.x - radius,
            max_x: center.x + radius,
            min_y: center.y - radius,
            max_y: center.y + radius,
        }
    }

    /// GeoJSON `bbox` order: `[min_x, min_y, max_x, max_y]`.
    pub fn to_bbox(&self) -> Vec<f64> {
        vec![self.min_x, self.min_y, self.max_x, self.max_y]
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mercator_point_validation() {
        assert!(MercatorPoint::new(0.0, 0.0).is_valid());
        assert!(!MercatorPoint::new(f64::NAN, 0.0).is_valid());
        assert!(!MercatorPoint::new(0.0, f64::INFINITY).is_valid());
    }

    #[test]
    fn test_distance_to() {
        let a = MercatorPoint::new(0.0, 0.0);
        let b = MercatorPoint::new(3.0, 4.0);
        assert_eq!(a.distance_to(&b), 5.0);
        assert_eq!(b.distance_to(&a), 5.0);
    }

    #[test]
    fn test_bounds_from_points() {
        let points = vec![
            MercatorPoint::new(10.0, -5.0),
            MercatorPoint::new(-2.0, 8.0),
            MercatorPoint::new(4.0, 1.0),
        ];
        let bounds = Bounds::from_points(&points).unwrap();
        assert_eq!(bounds.min_x, -2.0);
        assert_eq!(bounds.max_x, 10.0);
        assert_eq!(bounds.min_y, -5.0);
        assert_eq!(bounds.max_y, 8.0);
        assert_eq!(bounds.to_bbox(), vec![-2.0, -5.0, 10.0, 8.0]);
        assert!(Bounds::from_points(&[]).is_none());
    }

    #[test]
    fn test_bounds_around() {
        let bounds = Bounds::around(&MercatorPoint::new(100.0, 200.0), 10.0);
        assert_eq!(bounds.to_bbox(), vec![90.0, 190.0, 110.0, 210.0]);
    }

    #[test]
    fn test_coord_conversion() {
        let p = MercatorPoint::new(1.5, -2.5);
        let c: Coord = p.into();
        assert_eq!(c, Coord { x: 1.5, y: -2.5 });
        assert_eq!(MercatorPoint::from(c), p);
    }
}
