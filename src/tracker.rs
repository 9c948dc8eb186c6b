//! Caller-side orchestration.
//!
//! [`Tracker`] wraps a [`PositionStore`] and a [`TrackingConfig`] and answers
//! the two questions the map asks: where did this animal go, and where is the
//! herd right now at this zoom level.

use chrono::{DateTime, Utc};
use geo::{Centroid, MultiPoint, Point};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::cluster::{cluster_positions, Cluster};
use crate::config::TrackingConfig;
use crate::error::TrackError;
use crate::path::{build_path, TrackPath};
use crate::request::PathRequest;
use crate::store::PositionStore;
use crate::{geo_utils, MercatorPoint, Position, PositionId};

/// A cluster with the figures the map displays for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    /// Index of the underlying [`Cluster`]
    pub index: usize,
    pub position_ids: Vec<PositionId>,
    /// Distinct animals in the cluster, sorted
    pub entity_ids: Vec<String>,
    /// Mean of member coordinates
    pub centroid: MercatorPoint,
    /// Most recent member timestamp
    pub latest: DateTime<Utc>,
    /// Number of member positions
    pub count: usize,
}

/// Result of clustering one farm in a batch.
#[derive(Debug)]
pub struct FarmClusters {
    pub farm_id: String,
    pub result: Result<Vec<ClusterSummary>, TrackError>,
}

/// Tracking service over a position store.
pub struct Tracker<S> {
    store: S,
    config: TrackingConfig,
}

impl<S: PositionStore> Tracker<S> {
    pub fn new(store: S, config: TrackingConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    /// Path of one animal between `start` and `end`.
    ///
    /// When the window holds fewer than two positions and
    /// `relax_start_on_sparse_path` is set, the query is retried without the
    /// start bound so the map still shows the animal's recent track.
    pub fn animal_path(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<TrackPath, TrackError> {
        if start > end {
            return Err(TrackError::InvalidTimeRange);
        }

        let mut positions = self.store.positions_for_entity(entity_id, Some(start), end)?;

        if positions.len() < 2 && self.config.relax_start_on_sparse_path {
            warn!(
                "Only {} position(s) for {} between {} and {}, retrying without start bound",
                positions.len(),
                entity_id,
                start,
                end
            );
            positions = self.store.positions_for_entity(entity_id, None, end)?;
        }

        if positions.len() < 2 {
            return Err(TrackError::NotEnoughData {
                entity_id: entity_id.to_string(),
            });
        }

        let path = build_path(entity_id, &positions)?;
        debug!(
            "Built path for {} with {} vertices ({:.0}m)",
            entity_id,
            path.vertex_count(),
            path.length_m
        );
        Ok(path)
    }

    /// Path for a parsed request, interpreting its times in the farm's offset.
    pub fn path_for_request(&self, request: &PathRequest) -> Result<TrackPath, TrackError> {
        let offset = self.config.utc_offset()?;
        let (start, end) = request.time_range(offset)?;
        self.animal_path(&request.animal_imei, start, end)
    }

    /// Cluster the latest position of each animal on a farm at a zoom level.
    pub fn farm_clusters(&self, farm_id: &str, zoom: u8) -> Result<Vec<ClusterSummary>, TrackError> {
        let start = Instant::now();
        let threshold_m = self.config.zoom_thresholds.distance_m(zoom);
        let positions = self.store.latest_per_entity(farm_id)?;

        let summaries = self.clusters_at_threshold(&positions, threshold_m)?;

        info!(
            "Farm {} at zoom {}: {} animals in {} clusters ({:?})",
            farm_id,
            zoom,
            positions.len(),
            summaries.len(),
            start.elapsed()
        );
        Ok(summaries)
    }

    /// Cluster an arbitrary position set with an explicit threshold in
    /// projected meters.
    pub fn clusters_at_threshold(
        &self,
        positions: &[Position],
        threshold_m: f64,
    ) -> Result<Vec<ClusterSummary>, TrackError> {
        let clusters = cluster_positions(&self.store, positions, threshold_m)?;
        Ok(summarize(&clusters, positions))
    }

    /// Cluster many farms at the same zoom level.
    ///
    /// Each farm gets its own result; one failing farm does not abort the
    /// rest. Runs in parallel with the `parallel` feature.
    #[cfg(feature = "parallel")]
    pub fn farm_clusters_batch(&self, farm_ids: &[String], zoom: u8) -> Vec<FarmClusters> {
        let start = Instant::now();
        let results: Vec<FarmClusters> = farm_ids
            .par_iter()
            .map(|farm_id| FarmClusters {
                farm_id: farm_id.clone(),
                result: self.farm_clusters(farm_id, zoom),
            })
            .collect();
        log_batch(&results, zoom, start);
        results
    }

    /// Cluster many farms at the same zoom level.
    ///
    /// Each farm gets its own result; one failing farm does not abort the
    /// rest. Runs in parallel with the `parallel` feature.
    #[cfg(not(feature = "parallel"))]
    pub fn farm_clusters_batch(&self, farm_ids: &[String], zoom: u8) -> Vec<FarmClusters> {
        let start = Instant::now();
        let results: Vec<FarmClusters> = farm_ids
            .iter()
            .map(|farm_id| FarmClusters {
                farm_id: farm_id.clone(),
                result: self.farm_clusters(farm_id, zoom),
            })
            .collect();
        log_batch(&results, zoom, start);
        results
    }
}

fn log_batch(results: &[FarmClusters], zoom: u8, start: Instant) {
    let failed = results.iter().filter(|r| r.result.is_err()).count();
    if failed > 0 {
        warn!("{} of {} farms failed to cluster", failed, results.len());
    }
    info!(
        "Clustered {} farms at zoom {} in {:?}",
        results.len(),
        zoom,
        start.elapsed()
    );
}

/// Build summaries for clusters over `positions`.
fn summarize(clusters: &[Cluster], positions: &[Position]) -> Vec<ClusterSummary> {
    let by_id: HashMap<PositionId, &Position> = positions.iter().map(|p| (p.id, p)).collect();

    clusters
        .iter()
        .filter_map(|cluster| {
            let members: Vec<&Position> = cluster
                .members
                .iter()
                .filter_map(|id| by_id.get(id).copied())
                .collect();
            let latest = members.iter().map(|p| p.timestamp).max()?;

            let entity_ids: BTreeSet<String> =
                members.iter().map(|p| p.entity_id.clone()).collect();

            Some(ClusterSummary {
                index: cluster.index,
                position_ids: cluster.members.clone(),
                entity_ids: entity_ids.into_iter().collect(),
                centroid: centroid(&members),
                latest,
                count: members.len(),
            })
        })
        .collect()
}

fn centroid(members: &[&Position]) -> MercatorPoint {
    let points: MultiPoint<f64> = members
        .iter()
        .map(|p| Point::from(p.coordinate))
        .collect();
    match points.centroid() {
        Some(c) => MercatorPoint::new(c.x(), c.y()),
        None => {
            let coords: Vec<MercatorPoint> = members.iter().map(|p| p.coordinate).collect();
            geo_utils::compute_center(&coords).unwrap_or(MercatorPoint::new(0.0, 0.0))
        }
    }
}
