//! Example of clustering many farms at once.
//!
//! Run with: RUST_LOG=info cargo run --example batch_clustering --features parallel

use chrono::{TimeZone, Utc};
use herd_tracks::{MemoryStore, MercatorPoint, NewPosition, Tracker, TrackingConfig};
use std::time::Instant;

const FARMS: usize = 200;
const ANIMALS_PER_FARM: usize = 150;

fn main() {
    pretty_env_logger::init();

    println!("Batch Farm Clustering Example\n");

    let mut store = MemoryStore::new();
    let t = Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap();
    let mut farm_ids = Vec::with_capacity(FARMS);

    for f in 0..FARMS {
        let farm_id = format!("farm-{}", f);
        // Farms are laid out on a grid roughly 50 km apart
        let origin = MercatorPoint::new((f % 20) as f64 * 50_000.0, (f / 20) as f64 * 50_000.0);

        for a in 0..ANIMALS_PER_FARM {
            let imei = format!("{:015}", 860_000_000_000_000u64 + (f * ANIMALS_PER_FARM + a) as u64);
            store.register_entity(&farm_id, &imei);

            // Herds of 25 animals, herds 3 km apart
            let herd = a / 25;
            let jitter = scatter(f * ANIMALS_PER_FARM + a);
            let point = MercatorPoint::new(
                origin.x + herd as f64 * 3_000.0 + jitter.0 * 400.0,
                origin.y + jitter.1 * 400.0,
            );
            store.insert(NewPosition::new(&imei, point, t));
        }
        farm_ids.push(farm_id);
    }

    println!("Created {} farms with {} positions\n", FARMS, store.len());

    let tracker = Tracker::new(store, TrackingConfig::default());

    for zoom in [8, 11, 14] {
        let start = Instant::now();
        let results = tracker.farm_clusters_batch(&farm_ids, zoom);
        let elapsed = start.elapsed();

        let ok: Vec<_> = results.iter().filter_map(|r| r.result.as_ref().ok()).collect();
        let clusters: usize = ok.iter().map(|c| c.len()).sum();
        let largest = ok
            .iter()
            .flat_map(|c| c.iter().map(|s| s.count))
            .max()
            .unwrap_or(0);

        println!("Zoom {}:", zoom);
        println!("  Farms clustered: {}/{}", ok.len(), results.len());
        println!("  Total clusters: {}", clusters);
        println!("  Largest cluster: {} animals", largest);
        println!("  Time: {:?}\n", elapsed);
    }
}

/// Deterministic jitter in [-0.5, 0.5) for each animal
fn scatter(seed: usize) -> (f64, f64) {
    let mut state = seed as u64 ^ 0x9E37_79B9_7F4A_7C15;
    let mut next = || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (state >> 11) as f64 / (1u64 << 53) as f64 - 0.5
    };
    (next(), next())
}
