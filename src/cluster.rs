//! Single-linkage clustering of positions.
//!
//! Two positions share a cluster when a chain of positions links them with
//! every hop at most `distance_threshold_m` long. The distance work is pushed
//! down to the [`PositionStore`]: each position is used once as a seed for a
//! range query that returns the not-yet-clustered candidates around it.
//!
//! ## Algorithm
//! 1. Visit positions in input order; an unclustered position opens a new
//!    cluster and becomes its first seed.
//! 2. For each seed, ask the store for every candidate within the threshold
//!    that is not yet assigned. Those join the seed's cluster and are queued as
//!    seeds themselves.
//! 3. Drain the queue before moving on, so a cluster is a complete connected
//!    component by the time the next one opens.
//!
//! Every position seeds exactly once, so a run issues one range query per input
//! position. Assigned positions are passed to the store as exclusions and are
//! never reassigned.
//!
//! Cluster indices depend on input order; the grouping does not.

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use crate::error::ClusterError;
use crate::store::{CandidateScope, PositionStore};
use crate::{MercatorPoint, Position, PositionId};

/// A group of positions connected by hops within the clustering threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Order in which the cluster was opened
    pub index: usize,
    /// Member ids; the position that opened the cluster comes first
    pub members: Vec<PositionId>,
}

impl Cluster {
    /// Number of members (always at least one).
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: PositionId) -> bool {
        self.members.contains(&id)
    }
}

/// Partition positions into single-linkage clusters.
///
/// `distance_threshold_m` is in projected meters, the unit of the coordinates,
/// and must be finite and non-negative. The range queries are restricted to the
/// ids in `positions`. Empty input yields no clusters.
///
/// # Example
/// ```
/// use chrono::{TimeZone, Utc};
/// use herd_tracks::{cluster_positions, MemoryStore, MercatorPoint, NewPosition, PositionStore};
///
/// let mut store = MemoryStore::new();
/// let t = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
/// for (i, x) in [0.0, 3.0, 6.0].iter().enumerate() {
///     let imei = format!("86000000000000{}", i);
///     store.register_entity("farm", &imei);
///     store.insert(NewPosition::new(&imei, MercatorPoint::new(*x, 0.0), t));
/// }
///
/// let positions = store.latest_per_entity("farm").unwrap();
///
/// // 0 and 6 are too far apart, but 3 links them
/// let clusters = cluster_positions(&store, &positions, 4.0).unwrap();
/// assert_eq!(clusters.len(), 1);
/// assert_eq!(clusters[0].len(), 3);
///
/// assert!(cluster_positions(&store, &positions, -1.0).is_err());
/// ```
pub fn cluster_positions<S>(
    store: &S,
    positions: &[Position],
    distance_threshold_m: f64,
) -> Result<Vec<Cluster>, ClusterError>
where
    S: PositionStore + ?Sized,
{
    if !distance_threshold_m.is_finite() || distance_threshold_m < 0.0 {
        return Err(ClusterError::InvalidThreshold {
            threshold: distance_threshold_m,
        });
    }

    if positions.is_empty() {
        return Ok(vec![]);
    }

    let start = Instant::now();

    let mut candidates: Vec<PositionId> = Vec::with_capacity(positions.len());
    let mut seen: HashSet<PositionId> = HashSet::with_capacity(positions.len());
    for p in positions {
        if seen.insert(p.id) {
            candidates.push(p.id);
        } else {
            warn!("Position {} appears more than once in clustering input", p.id);
        }
    }
    let scope = CandidateScope::new(seen);

    store.open_scope(&scope)?;
    let outcome = flood_fill(store, positions, &scope, distance_threshold_m);
    if let Err(e) = store.close_scope(&scope) {
        warn!("Failed to release candidate scope {}: {}", scope.id(), e);
    }
    let (clusters, queries) = outcome?;

    if let Err(e) = verify_partition(&candidates, &clusters) {
        error!("Clustering produced an invalid partition: {}", e);
        return Err(e);
    }

    info!(
        "Clustered {} positions into {} clusters (threshold {:.0}m, {} range queries) in {:?}",
        candidates.len(),
        clusters.len(),
        distance_threshold_m,
        queries,
        start.elapsed()
    );

    Ok(clusters)
}

/// Grow every cluster from its opening position. Returns the clusters and the
/// number of range queries issued.
fn flood_fill<S>(
    store: &S,
    positions: &[Position],
    scope: &CandidateScope,
    distance_threshold_m: f64,
) -> Result<(Vec<Cluster>, usize), ClusterError>
where
    S: PositionStore + ?Sized,
{
    // position id -> cluster index
    let mut assignment: HashMap<PositionId, usize> = HashMap::with_capacity(scope.len());
    let mut assigned: HashSet<PositionId> = HashSet::with_capacity(scope.len());
    let mut clusters: Vec<Vec<PositionId>> = Vec::new();
    let mut queries = 0usize;

    for origin in positions {
        if assignment.contains_key(&origin.id) {
            // Absorbed by an earlier cluster, and already used as a seed there
            continue;
        }

        let index = clusters.len();
        clusters.push(vec![origin.id]);
        assignment.insert(origin.id, index);
        assigned.insert(origin.id);

        let mut seeds: VecDeque<(PositionId, MercatorPoint)> =
            VecDeque::from([(origin.id, origin.coordinate)]);

        while let Some((seed, coordinate)) = seeds.pop_front() {
            let neighbours =
                store.within_distance(scope, coordinate, distance_threshold_m, &assigned)?;
            queries += 1;

            let mut absorbed = 0usize;
            for neighbour in neighbours {
                if !scope.contains(neighbour.id) || !assigned.insert(neighbour.id) {
                    continue;
                }
                assignment.insert(neighbour.id, index);
                clusters[index].push(neighbour.id);
                seeds.push_back((neighbour.id, neighbour.coordinate));
                absorbed += 1;
            }

            if absorbed > 0 {
                debug!("Seed {} absorbed {} position(s) into cluster {}", seed, absorbed, index);
            }
        }
    }

    let clusters = clusters
        .into_iter()
        .enumerate()
        .map(|(index, members)| Cluster { index, members })
        .collect();

    Ok((clusters, queries))
}

/// Check that `clusters` is a strict partition of `input`: every input id in
/// exactly one cluster, nothing else clustered, no cluster empty.
pub fn verify_partition(input: &[PositionId], clusters: &[Cluster]) -> Result<(), ClusterError> {
    let expected: HashSet<PositionId> = input.iter().copied().collect();

    let mut seen: HashMap<PositionId, usize> = HashMap::with_capacity(expected.len());
    let mut clustered = 0usize;
    for cluster in clusters {
        for &id in &cluster.members {
            *seen.entry(id).or_insert(0) += 1;
            clustered += 1;
        }
    }

    let mut duplicated: Vec<PositionId> = seen
        .iter()
        .filter(|(_, &count)| count > 1)
        .map(|(&id, _)| id)
        .collect();
    duplicated.sort();

    let mut missing: Vec<PositionId> = expected
        .iter()
        .filter(|id| !seen.contains_key(id))
        .copied()
        .collect();
    missing.sort();

    let empty: Vec<usize> = clusters
        .iter()
        .filter(|c| c.is_empty())
        .map(|c| c.index)
        .collect();

    if clustered != expected.len()
        || !duplicated.is_empty()
        || !missing.is_empty()
        || !empty.is_empty()
    {
        return Err(ClusterError::PartitionInvariantViolation {
            expected: expected.len(),
            clustered,
            duplicated,
            missing,
            empty,
        });
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
