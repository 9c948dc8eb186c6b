//! Download the latest tracker fixes for a farm and cluster them.
//!
//! Run with:
//! FEED_API_KEY=... FEED_BASE_URL=... FEED_IMEIS=860000000000001,860000000000002 \
//!     RUST_LOG=info cargo run --example feed_download --features http

use chrono::{Duration, Utc};
use herd_tracks::http::{download_farm_positions_sync, ingest_feed_results, ProgressCallback};
use herd_tracks::{FeedConfig, MemoryStore, Tracker, TrackingConfig};
use std::sync::Arc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();

    let api_key = std::env::var("FEED_API_KEY")?;
    let imeis: Vec<String> = std::env::var("FEED_IMEIS")?
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let mut config = FeedConfig::default();
    if let Ok(base_url) = std::env::var("FEED_BASE_URL") {
        config.base_url = base_url;
    }

    println!("Tracker Feed Download");
    println!("=====================");
    println!("Devices: {}", imeis.len());
    println!(
        "Dispatch interval: {}ms ({:.1} req/s)\n",
        config.dispatch_interval_ms,
        1000.0 / config.dispatch_interval_ms.max(1) as f64
    );

    let progress: ProgressCallback = Arc::new(|done, total| {
        println!("  {}/{}", done, total);
    });

    let since = Utc::now() - Duration::hours(24);
    let results = download_farm_positions_sync(&api_key, imeis, since, config, Some(progress))?;

    for r in &results {
        match &r.error {
            None => println!("{}: {} fixes", r.imei, r.positions.len()),
            Some(e) => println!("{}: FAILED ({})", r.imei, e),
        }
    }

    let mut store = MemoryStore::new();
    let written = ingest_feed_results(&mut store, "farm", &results)?;
    println!("\nStored {} positions", written);

    let tracker = Tracker::new(store, TrackingConfig::default());
    for zoom in [5, 11, 15] {
        let clusters = tracker.farm_clusters("farm", zoom)?;
        println!("Zoom {}: {} clusters", zoom, clusters.len());
    }

    Ok(())
}
