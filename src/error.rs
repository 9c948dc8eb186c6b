//! Error types.
//!
//! Each layer has its own enum; the [`Tracker`](crate::Tracker) folds them
//! into [`TrackError`].

use crate::PositionId;
use thiserror::Error;

/// Errors raised by a [`PositionStore`](crate::PositionStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite operation failed.
    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A lock guarding the backend was poisoned by a panicking thread.
    #[error("store lock poisoned")]
    Poisoned,

    /// A stored row could not be converted into a position.
    #[error("invalid stored row: {message}")]
    InvalidRow {
        /// Description of what went wrong.
        message: String,
    },
}

/// Errors raised while building a path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    /// A polyline needs at least two vertices.
    #[error("not enough data to build a path: {found} position(s), at least 2 required")]
    NotEnoughData {
        /// Number of positions supplied.
        found: usize,
    },
}

/// Errors raised while clustering.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// A range query against the store failed.
    #[error("store error during clustering: {0}")]
    Store(#[from] StoreError),

    /// The distance threshold is negative, infinite or NaN.
    #[error("invalid clustering threshold {threshold}: must be finite and non-negative")]
    InvalidThreshold { threshold: f64 },

    /// The clusters are not a strict partition of the input. This is a bug in
    /// the clusterer or the store, never a data condition.
    #[error(
        "partition invariant violated: {clustered} clustered of {expected} input ids \
         ({} duplicated, {} missing, {} empty clusters)",
        .duplicated.len(),
        .missing.len(),
        .empty.len()
    )]
    PartitionInvariantViolation {
        expected: usize,
        clustered: usize,
        duplicated: Vec<PositionId>,
        missing: Vec<PositionId>,
        /// Indices of clusters without members
        empty: Vec<usize>,
    },
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// The configuration parsed but is not usable.
    #[error("invalid configuration: {message}")]
    Invalid {
        /// Description of what went wrong.
        message: String,
    },
}

/// Errors raised while parsing an inbound path request.
#[derive(Debug, Error)]
pub enum RequestError {
    /// JSON parsing failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A time field did not match `YYYY-MM-DD HH:MM:SS`.
    #[error("invalid {field}: {value:?}")]
    InvalidTime {
        field: &'static str,
        value: String,
    },

    /// The tracker IMEI is not 15 digits.
    #[error("invalid IMEI {0:?}: expected 15 digits")]
    InvalidImei(String),
}

/// Errors surfaced by the [`Tracker`](crate::Tracker) service.
#[derive(Debug, Error)]
pub enum TrackError {
    /// Fewer than two positions exist, even after relaxing the time filter.
    #[error("not enough data to build a path for {entity_id}")]
    NotEnoughData { entity_id: String },

    /// Start time is after end time.
    #[error("invalid time range: start is after end")]
    InvalidTimeRange,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors raised while setting up a tracker feed download.
#[cfg(feature = "http")]
#[derive(Debug, Error)]
pub enum FeedError {
    /// The HTTP client could not be built.
    #[error("failed to create HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    /// The async runtime could not be started.
    #[error("failed to create async runtime: {0}")]
    Runtime(std::io::Error),
}
