//! Tracking configuration.
//!
//! All settings have defaults matching the production farm setup; a TOML file
//! only needs to list what it overrides:
//!
//! ```toml
//! utc_offset_minutes = 360
//! relax_start_on_sparse_path = false
//!
//! [[zoom_thresholds]]
//! zoom = 0
//! distance_km = 50.0
//!
//! [[zoom_thresholds]]
//! zoom = 12
//! distance_km = 0.0
//! ```

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Clustering distance for one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoomThreshold {
    /// Map zoom level this entry starts at.
    pub zoom: u8,
    /// Clustering distance in kilometers (projected).
    pub distance_km: f64,
}

/// Zoom level to clustering distance table.
///
/// Entries are sorted by ascending zoom. A zoom level uses the last entry whose
/// `zoom` is not greater than it; levels below the first entry use the first.
///
/// # Example
/// ```
/// use herd_tracks::ZoomThresholds;
///
/// let table = ZoomThresholds::default();
/// assert_eq!(table.distance_km(0), 30.0);
/// assert_eq!(table.distance_km(22), 0.0);
/// assert_eq!(table.distance_m(10), 2_000.0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoomThresholds {
    pub levels: Vec<ZoomThreshold>,
}

impl ZoomThresholds {
    pub fn new(levels: Vec<ZoomThreshold>) -> Result<Self, ConfigError> {
        let table = Self { levels };
        table.validate()?;
        Ok(table)
    }

    /// Clustering distance in kilometers for a zoom level.
    pub fn distance_km(&self, zoom: u8) -> f64 {
        let Some(first) = self.levels.first() else {
            return 0.0;
        };
        self.levels
            .iter()
            .take_while(|level| level.zoom <= zoom)
            .last()
            .unwrap_or(first)
            .distance_km
    }

    /// Clustering distance in projected meters for a zoom level.
    pub fn distance_m(&self, zoom: u8) -> f64 {
        self.distance_km(zoom) * 1000.0
    }

    /// Check the table is non-empty, strictly ascending in zoom, and never
    /// grows coarser as zoom increases.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.levels.is_empty() {
            return Err(invalid("zoom threshold table is empty"));
        }

        for level in &self.levels {
            if !level.distance_km.is_finite() || level.distance_km < 0.0 {
                return Err(invalid(format!(
                    "zoom {} has invalid distance {}",
                    level.zoom, level.distance_km
                )));
            }
        }

        for pair in self.levels.windows(2) {
            if pair[1].zoom <= pair[0].zoom {
                return Err(invalid(format!(
                    "zoom levels must be strictly ascending ({} after {})",
                    pair[1].zoom, pair[0].zoom
                )));
            }
            if pair[1].distance_km > pair[0].distance_km {
                return Err(invalid(format!(
                    "zoom {} clusters coarser than zoom {}",
                    pair[1].zoom, pair[0].zoom
                )));
            }
        }

        Ok(())
    }
}

impl Default for ZoomThresholds {
    fn default() -> Self {
        let table = [
            (0, 30.0),
            (7, 15.0),
            (8, 8.0),
            (9, 4.0),
            (10, 2.0),
            (11, 1.0),
            (12, 0.5),
            (13, 0.2),
            (14, 0.1),
            (15, 0.0),
        ];
        Self {
            levels: table
                .iter()
                .map(|&(zoom, distance_km)| ZoomThreshold { zoom, distance_km })
                .collect(),
        }
    }
}

/// Configuration for the [`Tracker`](crate::Tracker) service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Offset of the farms' local time from UTC, in minutes. Path requests carry
    /// local wall-clock times.
    /// Default: 300 (UTC+05:00, Asia/Almaty)
    pub utc_offset_minutes: i32,

    /// Retry a path query without its start bound when the requested window
    /// holds fewer than two positions.
    /// Default: true
    pub relax_start_on_sparse_path: bool,

    /// Zoom level to clustering distance table.
    pub zoom_thresholds: ZoomThresholds,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 300,
            relax_start_on_sparse_path: true,
            zoom_thresholds: ZoomThresholds::default(),
        }
    }
}

impl TrackingConfig {
    /// Parse and validate a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.utc_offset()?;
        self.zoom_thresholds.validate()
    }

    /// The farms' local UTC offset.
    pub fn utc_offset(&self) -> Result<FixedOffset, ConfigError> {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                invalid(format!("UTC offset of {} minutes is out of range", self.utc_offset_minutes))
            })
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        message: message.into(),
    }
}
