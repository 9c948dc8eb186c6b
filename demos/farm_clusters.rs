//! Example of clustering a farm's herd at several zoom levels and drawing one
//! animal's path.
//!
//! Run with: RUST_LOG=info cargo run --example farm_clusters

use chrono::{Duration, TimeZone, Utc};
use herd_tracks::{encode, MemoryStore, MercatorPoint, NewPosition, PathRequest, Tracker, TrackingConfig};

fn main() {
    pretty_env_logger::init();

    println!("Farm Clustering Example\n");

    // Three groups of animals grazing around Almaty
    let pastures = [
        ("north", 43.32, 76.90, 6),
        ("river", 43.25, 76.95, 4),
        ("hills", 43.10, 77.20, 3),
    ];

    let mut store = MemoryStore::new();
    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap();
    let mut imei_counter = 0u64;
    let mut first_imei = None;

    for (name, lat, lng, animals) in pastures {
        for a in 0..animals {
            imei_counter += 1;
            let imei = format!("{:015}", 860_000_000_000_000u64 + imei_counter);
            store.register_entity("farm-1", &imei);

            // A day of fixes every 30 minutes, drifting slowly
            for step in 0..48 {
                let drift = step as f64 * 0.0002;
                let spread = a as f64 * 0.001;
                let point = MercatorPoint::from_lat_lng(lat + spread + drift, lng + spread - drift);
                store.insert(NewPosition::new(&imei, point, t0 + Duration::minutes(30 * step)));
            }

            if first_imei.is_none() {
                first_imei = Some(imei.clone());
            }
        }
        println!("  Pasture '{}': {} animals", name, animals);
    }

    println!("\nStored {} positions\n", store.len());

    let tracker = Tracker::new(store, TrackingConfig::default());

    for zoom in [5, 9, 11, 13, 16] {
        let threshold_km = tracker.config().zoom_thresholds.distance_km(zoom);
        match tracker.farm_clusters("farm-1", zoom) {
            Ok(clusters) => {
                println!("Zoom {:>2} ({:>4} km): {} clusters", zoom, threshold_km, clusters.len());
                for c in &clusters {
                    let (lat, lng) = c.centroid.to_lat_lng();
                    println!("    #{} {} animals at ({:.4}, {:.4})", c.index, c.count, lat, lng);
                }
            }
            Err(e) => println!("Zoom {}: error {}", zoom, e),
        }
    }

    if let Ok(clusters) = tracker.farm_clusters("farm-1", 11) {
        println!("\nGeoJSON at zoom 11:\n{}", encode::clusters_geojson_string(&clusters));
    }

    let Some(imei) = first_imei else {
        return;
    };

    // Local Almaty times; 08:00 local is 03:00 UTC
    let body = format!(
        r#"{{"animal_imei":"{}","start_time":"2024-05-01 08:00:00","end_time":"2024-05-01 12:00:00"}}"#,
        imei
    );
    let path = PathRequest::from_json(&body)
        .map_err(herd_tracks::TrackError::from)
        .and_then(|request| tracker.path_for_request(&request));

    match path {
        Ok(path) => {
            println!("\nPath for {}:", imei);
            println!("  Vertices: {}", path.vertex_count());
            println!("  Projected length: {:.0} m", path.length_m);
            println!("  Ground length: {:.0} m", path.ground_length_m());
            if let Ok(json) = encode::path_geojson_string(&path) {
                println!("  GeoJSON: {}", json);
            }
        }
        Err(e) => println!("\nNo path for {}: {}", imei, e),
    }
}
