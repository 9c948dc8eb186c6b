//! # Geographic Utilities
//!
//! Core geographic computation utilities for projected tracker positions.
//!
//! Positions are kept in Web Mercator (EPSG:3857) meters, the same projection the
//! map tiles use. Everything downstream (clustering thresholds, path lengths,
//! bounding boxes) works on those projected meters.
//!
//! ## Overview
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`lat_lng_to_mercator`] | Project a WGS84 fix to EPSG:3857 meters |
//! | [`mercator_to_lat_lng`] | Unproject EPSG:3857 meters to WGS84 |
//! | [`euclidean_distance`] | Straight-line distance in projected meters |
//! | [`haversine_distance`] | Great-circle distance between two projected points |
//! | [`polyline_length`] | Total projected length of a track |
//! | [`compute_bounds`] | Bounding box of a set of points |
//! | [`compute_center`] | Centroid of a set of points |
//!
//! ## Example
//!
//! ```rust
//! use herd_tracks::{MercatorPoint, geo_utils};
//!
//! let track = vec![
//!     MercatorPoint::from_lat_lng(43.2389, 76.8897),
//!     MercatorPoint::from_lat_lng(43.2400, 76.8910),
//!     MercatorPoint::from_lat_lng(43.2410, 76.8920),
//! ];
//!
//! let projected = geo_utils::polyline_length(&track);
//! let ground = geo_utils::haversine_distance(&track[0], &track[1])
//!     + geo_utils::haversine_distance(&track[1], &track[2]);
//!
//! // Mercator inflates lengths by roughly 1 / cos(latitude)
//! assert!(projected > ground);
//! ```
//!
//! ## Algorithm Notes
//!
//! ### Spherical Mercator
//!
//! EPSG:3857 projects the WGS84 sphere of radius 6,378,137 m onto a plane. Latitudes
//! beyond ±85.0511° are clamped, as the projection diverges at the poles.
//!
//! Reference: [Web Mercator projection (Wikipedia)](https://en.wikipedia.org/wiki/Web_Mercator_projection)

use geo::{Distance, Haversine, Point};
use crate::{Bounds, MercatorPoint};

/// Sphere radius used by EPSG:3857.
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Latitude limit of the Web Mercator projection.
pub const MAX_MERCATOR_LATITUDE: f64 = 85.051_128_779_806_59;

// =============================================================================
// Projection Functions
// =============================================================================

/// Project a WGS84 latitude/longitude (degrees) to Web Mercator meters.
///
/// Latitudes outside ±[`MAX_MERCATOR_LATITUDE`] are clamped.
///
/// # Example
///
/// ```rust
/// use herd_tracks::geo_utils;
///
/// let origin = geo_utils::lat_lng_to_mercator(0.0, 0.0);
/// assert_eq!(origin.x, 0.0);
/// assert!(origin.y.abs() < 1e-9);
///
/// let east = geo_utils::lat_lng_to_mercator(0.0, 180.0);
/// assert!((east.x - 20_037_508.34).abs() < 0.01);
/// ```
pub fn lat_lng_to_mercator(latitude: f64, longitude: f64) -> MercatorPoint {
    let lat = latitude.clamp(-MAX_MERCATOR_LATITUDE, MAX_MERCATOR_LATITUDE);
    let x = EARTH_RADIUS_M * longitude.to_radians();
    let y = EARTH_RADIUS_M * (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln();
    MercatorPoint::new(x, y)
}

/// Unproject Web Mercator meters to a WGS84 `(latitude, longitude)` pair in degrees.
pub fn mercator_to_lat_lng(point: &MercatorPoint) -> (f64, f64) {
    let longitude = (point.x / EARTH_RADIUS_M).to_degrees();
    let latitude = (2.0 * (point.y / EARTH_RADIUS_M).exp().atan() - std::f64::consts::FRAC_PI_2)
        .to_degrees();
    (latitude, longitude)
}

/// Check if a latitude/longitude pair is a usable GPS fix.
///
/// Trackers report `(0, 0)` when they have no fix, so that pair is rejected too.
pub fn is_valid_lat_lng(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude)
        && !(latitude == 0.0 && longitude == 0.0)
}

// =============================================================================
// Distance Functions
// =============================================================================

/// Straight-line distance between two projected points, in projected meters.
///
/// This is the metric the clustering thresholds are expressed in.
#[inline]
pub fn euclidean_distance(p1: &MercatorPoint, p2: &MercatorPoint) -> f64 {
    (p1.x - p2.x).hypot(p1.y - p2.y)
}

/// Great-circle distance between two projected points, in meters on the ground.
///
/// Both points are unprojected first. Use this when a real-world distance is
/// needed (e.g. reporting how far an animal walked).
pub fn haversine_distance(p1: &MercatorPoint, p2: &MercatorPoint) -> f64 {
    let (lat1, lng1) = mercator_to_lat_lng(p1);
    let (lat2, lng2) = mercator_to_lat_lng(p2);
    Haversine::distance(Point::new(lng1, lat1), Point::new(lng2, lat2))
}

/// Calculate the total projected length of a polyline.
///
/// Empty or single-point tracks return 0.0.
pub fn polyline_length(points: &[MercatorPoint]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }

    points
        .windows(2)
        .map(|w| euclidean_distance(&w[0], &w[1]))
        .sum()
}

/// Calculate the total ground length of a polyline in meters.
pub fn ground_length(points: &[MercatorPoint]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }

    points
        .windows(2)
        .map(|w| haversine_distance(&w[0], &w[1]))
        .sum()
}

// =============================================================================
// Bounding Box Functions
// =============================================================================

/// Compute the bounding box of a set of projected points.
///
/// For empty input, returns bounds with MIN/MAX values that contain nothing.
pub fn compute_bounds(points: &[MercatorPoint]) -> Bounds {
    let mut min_x = f64::MAX;
    let mut max_x = f64::MIN;
    let mut min_y = f64::MAX;
    let mut max_y = f64::MIN;

    for p in points {
        min_x = min_x.min(p.x);
        max_x = max_x.max(p.x);
        min_y = min_y.min(p.y);
        max_y = max_y.max(p.y);
    }

    Bounds { min_x, max_x, min_y, max_y }
}

// =============================================================================
// Center/Centroid Functions
// =============================================================================

/// Compute the centroid (arithmetic mean) of a set of projected points.
///
/// Returns `None` for empty input.
pub fn compute_center(points: &[MercatorPoint]) -> Option<MercatorPoint> {
    if points.is_empty() {
        return None;
    }

    let sum_x: f64 = points.iter().map(|p| p.x).sum();
    let sum_y: f64 = points.iter().map(|p| p.y).sum();
    let n = points.len() as f64;

    Some(MercatorPoint::new(sum_x / n, sum_y / n))
}

// =============================================================================
// Unit Tests
// =============================================================================
