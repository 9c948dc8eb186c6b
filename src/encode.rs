//! GeoJSON output for the map client.
//!
//! Coordinates stay in EPSG:3857 meters; the client map is configured for that
//! projection.

use geojson::{feature::Id, Feature, FeatureCollection, GeoJson, Geometry, JsonObject, Value};
use serde_json::Value as JsonValue;

use crate::path::TrackPath;
use crate::tracker::ClusterSummary;
use crate::{Bounds, MercatorPoint};

/// A path as a `LineString` geometry.
pub fn path_geometry(path: &TrackPath) -> Geometry {
    Geometry::new(Value::from(&path.line))
}

/// A path's `LineString` geometry serialized to a JSON string.
///
/// # Example
/// ```
/// use chrono::{TimeZone, Utc};
/// use herd_tracks::{build_path, encode, MercatorPoint, Position, PositionId};
///
/// let t = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
/// let positions: Vec<Position> = [(0.0, 0.0), (10.0, 5.0)]
///     .iter()
///     .enumerate()
///     .map(|(i, &(x, y))| Position {
///         id: PositionId(i as i64),
///         entity_id: "860000000000001".to_string(),
///         coordinate: MercatorPoint::new(x, y),
///         timestamp: t,
///     })
///     .collect();
///
/// let path = build_path("860000000000001", &positions).unwrap();
/// let json = encode::path_geojson_string(&path).unwrap();
/// assert!(json.contains("\"LineString\""));
/// ```
pub fn path_geojson_string(path: &TrackPath) -> Result<String, serde_json::Error> {
    serde_json::to_string(&path_geometry(path))
}

/// A path as a feature carrying its entity, time span and length.
pub fn path_feature(path: &TrackPath) -> Feature {
    let mut properties = JsonObject::new();
    properties.insert("entity".to_string(), JsonValue::from(path.entity_id.clone()));
    properties.insert("started_at".to_string(), JsonValue::from(path.started_at.to_rfc3339()));
    properties.insert("ended_at".to_string(), JsonValue::from(path.ended_at.to_rfc3339()));
    properties.insert("vertices".to_string(), JsonValue::from(path.vertex_count()));
    properties.insert("length_m".to_string(), JsonValue::from(path.length_m));

    Feature {
        bbox: Some(path.bounds().to_bbox()),
        geometry: Some(path_geometry(path)),
        id: Some(Id::String(path.entity_id.clone())),
        properties: Some(properties),
        foreign_members: None,
    }
}

/// Clusters as a collection of centroid points, boxed around all centroids.
pub fn clusters_feature_collection(clusters: &[ClusterSummary]) -> FeatureCollection {
    let features = clusters.iter().map(cluster_feature).collect();
    let centroids: Vec<MercatorPoint> = clusters.iter().map(|c| c.centroid).collect();

    FeatureCollection {
        bbox: Bounds::from_points(&centroids).map(|b| b.to_bbox()),
        features,
        foreign_members: None,
    }
}

/// Clusters as a serialized `FeatureCollection`.
pub fn clusters_geojson_string(clusters: &[ClusterSummary]) -> String {
    GeoJson::FeatureCollection(clusters_feature_collection(clusters)).to_string()
}

fn cluster_feature(cluster: &ClusterSummary) -> Feature {
    let ids: Vec<i64> = cluster.position_ids.iter().map(|id| id.0).collect();

    let mut properties = JsonObject::new();
    properties.insert("count".to_string(), JsonValue::from(cluster.count));
    properties.insert("latest".to_string(), JsonValue::from(cluster.latest.to_rfc3339()));
    properties.insert("entities".to_string(), JsonValue::from(cluster.entity_ids.clone()));
    properties.insert("position_ids".to_string(), JsonValue::from(ids));

    Feature {
        bbox: None,
        geometry: Some(Geometry::new(Value::Point(vec![
            cluster.centroid.x,
            cluster.centroid.y,
        ]))),
        id: Some(Id::Number(cluster.index.into())),
        properties: Some(properties),
        foreign_members: None,
    }
}
