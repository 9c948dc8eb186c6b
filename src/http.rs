//! HTTP client for the tracker vendor's position feed.
//!
//! Each farm has its own API key. For every tracker on the farm the client
//! downloads the fixes reported since the last run, with:
//! - Connection pooling
//! - One dispatch queue per farm key: request starts are spaced out and a
//!   429 pauses the whole farm, honouring `Retry-After`
//! - Parallel fetching with configurable concurrency
//! - Retry with exponential backoff on 429 and transport errors
//!
//! Endpoint: `GET {base_url}/devices/{imei}/positions?since={unix seconds}`
//! with HTTP Basic auth `API_KEY:{key}`. Response body:
//!
//! ```json
//! {"positions": [{"time": 1714550400, "lat": 43.25, "lng": 76.95}]}
//! ```

use base64::Engine;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::error::{FeedError, StoreError};
use crate::geo_utils;
use crate::store::PositionSink;
use crate::{MercatorPoint, NewPosition};

/// Feed client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Vendor API root, without a trailing slash
    pub base_url: String,
    /// Minimum spacing between request starts.
    /// Default: 80ms (12.5 req/s)
    pub dispatch_interval_ms: u64,
    /// Requests in flight at once.
    /// Default: 16
    pub max_concurrency: usize,
    /// Retries per device on 429 or transport errors.
    /// Default: 3
    pub max_retries: u32,
    /// First pause after a 429 without `Retry-After`; doubles per consecutive 429.
    /// Default: 1000ms
    pub backoff_base_ms: u64,
    /// Longest pause, also caps `Retry-After`.
    /// Default: 8000ms
    pub max_backoff_ms: u64,
    /// Per-request timeout.
    /// Default: 30s
    pub timeout_secs: u64,
    /// Worker threads of the runtime used by the blocking wrapper.
    /// Default: 4
    pub worker_threads: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.tracker-vendor.example/v1".to_string(),
            dispatch_interval_ms: 80,
            max_concurrency: 16,
            max_retries: 3,
            backoff_base_ms: 1_000,
            max_backoff_ms: 8_000,
            timeout_secs: 30,
            worker_threads: 4,
        }
    }
}

/// Positions downloaded for one tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceFeedResult {
    pub imei: String,
    /// Valid fixes, projected and ready to insert
    pub positions: Vec<NewPosition>,
    pub success: bool,
    pub error: Option<String>,
}

impl DeviceFeedResult {
    fn failed(imei: &str, error: String) -> Self {
        Self {
            imei: imei.to_string(),
            positions: Vec::new(),
            success: false,
            error: Some(error),
        }
    }
}

/// Feed response body.
#[derive(Debug, Deserialize)]
struct FeedResponse {
    #[serde(default)]
    positions: Vec<FeedFix>,
}

#[derive(Debug, Deserialize)]
struct FeedFix {
    time: i64,
    lat: Option<f64>,
    lng: Option<f64>,
}

/// Progress callback type: `(completed, total)`
pub type ProgressCallback = Arc<dyn Fn(u32, u32) + Send + Sync>;

/// Request pacing for one farm's API key.
///
/// The vendor rate-limits per key, so every request of a farm shares one
/// dispatch queue. Request starts are spaced `interval` apart; a 429 pushes
/// the whole queue back, not only the request that was throttled.
struct FarmThrottle {
    interval: Duration,
    backoff_base: Duration,
    max_backoff: Duration,
    next_slot: Mutex<Instant>,
    slots_issued: AtomicU32,
    throttled_streak: AtomicU32,
    throttled_total: AtomicU32,
}

impl FarmThrottle {
    fn from_config(config: &FeedConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.dispatch_interval_ms),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            next_slot: Mutex::new(Instant::now()),
            slots_issued: AtomicU32::new(0),
            throttled_streak: AtomicU32::new(0),
            throttled_total: AtomicU32::new(0),
        }
    }

    /// Wait for the next dispatch slot. Returns the slot number.
    async fn acquire(&self) -> u32 {
        let (wait, slot) = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot_at = (*next).max(now);
            *next = slot_at + self.interval;
            (
                slot_at.saturating_duration_since(now),
                self.slots_issued.fetch_add(1, Ordering::Relaxed) + 1,
            )
        };

        if wait > Duration::from_millis(5) {
            debug!("[Slot #{}] Waiting {:?}", slot, wait);
            tokio::time::sleep(wait).await;
        }
        slot
    }

    fn on_success(&self) {
        self.throttled_streak.store(0, Ordering::Relaxed);
    }

    /// Record a 429 and hold back the farm's queue. The pause is the vendor's
    /// `Retry-After` when given, else exponential in the current streak.
    async fn on_throttled(&self, retry_after: Option<Duration>) -> Duration {
        let streak = self.throttled_streak.fetch_add(1, Ordering::Relaxed) + 1;
        self.throttled_total.fetch_add(1, Ordering::Relaxed);

        let pause = retry_after
            .unwrap_or_else(|| self.backoff_base.saturating_mul(1 << (streak - 1).min(16)))
            .min(self.max_backoff);

        let resume_at = Instant::now() + pause;
        let mut next = self.next_slot.lock().await;
        if *next < resume_at {
            *next = resume_at;
        }

        warn!("[FarmThrottle] 429 #{} in a row, pausing dispatch for {:?}", streak, pause);
        pause
    }

    fn throttled_total(&self) -> u32 {
        self.throttled_total.load(Ordering::Relaxed)
    }
}

/// Parse a `Retry-After` header given in seconds. HTTP dates are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Client for one farm's tracker feed.
pub struct TrackerFeedClient {
    client: Client,
    auth_header: String,
    config: FeedConfig,
    throttle: FarmThrottle,
}

impl TrackerFeedClient {
    /// Create a client authenticating with a farm's API key.
    pub fn new(api_key: &str, config: FeedConfig) -> Result<Self, FeedError> {
        let auth = base64::engine::general_purpose::STANDARD.encode(format!("API_KEY:{}", api_key));

        let client = Client::builder()
            .pool_max_idle_per_host(config.max_concurrency.max(1) * 2)
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            auth_header: format!("Basic {}", auth),
            throttle: FarmThrottle::from_config(&config),
            config,
        })
    }

    fn positions_url(&self, imei: &str, since: DateTime<Utc>) -> String {
        format!(
            "{}/devices/{}/positions?since={}",
            self.config.base_url.trim_end_matches('/'),
            imei,
            since.timestamp()
        )
    }

    /// Download the fixes of every tracker reported after `since`.
    ///
    /// Returns one result per IMEI, in completion order. A failing device never
    /// fails the batch.
    pub async fn fetch_latest_positions(
        &self,
        imeis: Vec<String>,
        since: DateTime<Utc>,
        on_progress: Option<ProgressCallback>,
    ) -> Vec<DeviceFeedResult> {
        let total = imeis.len() as u32;
        let completed = Arc::new(AtomicU32::new(0));

        info!(
            "[TrackerFeed] Fetching {} devices since {} (dispatch interval: {}ms, max concurrent: {})",
            total, since, self.config.dispatch_interval_ms, self.config.max_concurrency
        );

        let start = Instant::now();

        let results: Vec<DeviceFeedResult> = stream::iter(imeis)
            .map(|imei| {
                let completed = Arc::clone(&completed);
                let callback = on_progress.clone();

                async move {
                    let dispatch_num = self.throttle.acquire().await;
                    let result = self.fetch_device(&imei, since).await;

                    let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(
                        "[Progress] {}/{} | dispatch #{} | {} -> {} fixes",
                        done,
                        total,
                        dispatch_num,
                        imei,
                        result.positions.len()
                    );

                    if let Some(ref cb) = callback {
                        cb(done, total);
                    }

                    result
                }
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        let success_count = results.iter().filter(|r| r.success).count();
        let fix_count: usize = results.iter().map(|r| r.positions.len()).sum();

        info!(
            "[TrackerFeed] DONE: {}/{} devices ok, {} fixes, {} throttled responses in {:.2}s",
            success_count,
            total,
            fix_count,
            self.throttle.throttled_total(),
            start.elapsed().as_secs_f64()
        );

        results
    }

    async fn fetch_device(&self, imei: &str, since: DateTime<Utc>) -> DeviceFeedResult {
        let url = self.positions_url(imei, since);
        let mut retries = 0;

        loop {
            let response = self
                .client
                .get(&url)
                .header("Authorization", &self.auth_header)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();

                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        retries += 1;
                        if retries > self.config.max_retries {
                            return DeviceFeedResult::failed(imei, "Max retries exceeded (429)".to_string());
                        }
                        let retry_after = resp
                            .headers()
                            .get(reqwest::header::RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(parse_retry_after);
                        let pause = self.throttle.on_throttled(retry_after).await;
                        debug!("[Fetch {}] 429, retry {} after {:?}", imei, retries, pause);
                        // Re-enter the queue behind the pause
                        self.throttle.acquire().await;
                        continue;
                    }

                    self.throttle.on_success();

                    if !status.is_success() {
                        return DeviceFeedResult::failed(imei, format!("HTTP {}", status));
                    }

                    let bytes = match resp.bytes().await {
                        Ok(b) => b,
                        Err(e) => {
                            return DeviceFeedResult::failed(imei, format!("Body download error: {}", e))
                        }
                    };

                    return match parse_feed_body(imei, &bytes) {
                        Ok(positions) => DeviceFeedResult {
                            imei: imei.to_string(),
                            positions,
                            success: true,
                            error: None,
                        },
                        Err(e) => DeviceFeedResult::failed(imei, format!("JSON parse error: {}", e)),
                    };
                }
                Err(e) => {
                    retries += 1;
                    if retries > self.config.max_retries {
                        return DeviceFeedResult::failed(imei, format!("Request error: {}", e));
                    }

                    let wait = self
                        .throttle
                        .backoff_base
                        .saturating_mul(1 << (retries - 1).min(5))
                        .min(self.throttle.max_backoff);
                    warn!("[Fetch {}] Error: {}, retry {} after {:?}", imei, e, retries, wait);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

/// Parse a feed body into projected positions, dropping unusable fixes.
pub fn parse_feed_body(imei: &str, body: &[u8]) -> Result<Vec<NewPosition>, serde_json::Error> {
    let response: FeedResponse = serde_json::from_slice(body)?;
    Ok(positions_from_fixes(imei, response.positions))
}

fn positions_from_fixes(imei: &str, fixes: Vec<FeedFix>) -> Vec<NewPosition> {
    let total = fixes.len();
    let positions: Vec<NewPosition> = fixes
        .into_iter()
        .filter_map(|fix| {
            let (lat, lng) = (fix.lat?, fix.lng?);
            if !geo_utils::is_valid_lat_lng(lat, lng) {
                return None;
            }
            let timestamp = DateTime::from_timestamp(fix.time, 0)?;
            let point = MercatorPoint::from_lat_lng(lat, lng);
            point
                .is_valid()
                .then(|| NewPosition::new(imei, point, timestamp))
        })
        .collect();

    if positions.len() < total {
        debug!("[Fetch {}] Dropped {} invalid fixes", imei, total - positions.len());
    }
    positions
}

/// Blocking wrapper: runs the download on a private multi-thread runtime.
pub fn download_farm_positions_sync(
    api_key: &str,
    imeis: Vec<String>,
    since: DateTime<Utc>,
    config: FeedConfig,
    on_progress: Option<ProgressCallback>,
) -> Result<Vec<DeviceFeedResult>, FeedError> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads.max(1))
        .enable_all()
        .build()
        .map_err(FeedError::Runtime)?;

    let client = TrackerFeedClient::new(api_key, config)?;
    Ok(rt.block_on(client.fetch_latest_positions(imeis, since, on_progress)))
}

/// Register every successfully fetched tracker on `farm_id` and store its
/// positions. Returns the number of positions written.
pub fn ingest_feed_results<S>(
    sink: &mut S,
    farm_id: &str,
    results: &[DeviceFeedResult],
) -> Result<usize, StoreError>
where
    S: PositionSink + ?Sized,
{
    let mut written = 0;
    for result in results.iter().filter(|r| r.success) {
        sink.register(farm_id, &result.imei)?;
        for position in &result.positions {
            sink.insert_position(position.clone())?;
            written += 1;
        }
    }

    let failed = results.iter().filter(|r| !r.success).count();
    if failed > 0 {
        warn!("[TrackerFeed] {} device(s) on farm {} failed and were skipped", failed, farm_id);
    }
    info!("[TrackerFeed] Stored {} positions for farm {}", written, farm_id);
    Ok(written)
}
