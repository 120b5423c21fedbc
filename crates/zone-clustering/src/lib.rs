//! Wagon Telemetry Zone Clustering
//!
//! Clusters GNSS fixes from railway wagons into geographic zones, joins
//! per-zone signal quality statistics back onto the clusters, and resolves
//! zones and records to countries by polygon containment.
//!
//! # Pipeline
//!
//! ```text
//! CSV ──► PointDataset ──► ClusterEngine::fit ──► ZoneAggregator ──► ZoneSummary[]
//!                                                        │
//!                                    CountryResolver ◄───┘ (optional)
//! ```
//!
//! | Stage     | Module        | Output                              |
//! |-----------|---------------|-------------------------------------|
//! | ingest    | [`dataset`]   | validated, ordered `PointDataset`   |
//! | cluster   | [`cluster`]   | `ClusterAssignment` + centers       |
//! | aggregate | [`aggregate`] | one `ZoneSummary` per realized id   |
//! | resolve   | [`country`]   | country name or `"unknown"`         |
//!
//! # Clustering Modes
//!
//! - **Exact**: Lloyd's iteration over the full coordinate set.
//! - **Streaming**: mini-batch passes with bounded working memory
//!   (O(k + batch_size)), converging to the exact result when a single batch
//!   covers the input.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use thiserror::Error;

pub mod aggregate;
pub mod cluster;
pub mod country;
pub mod dataset;
pub mod export;
pub mod pipeline;
pub mod quality;

pub use aggregate::{ZoneAggregator, ZoneSummary};
pub use cluster::{ClusterAssignment, ClusterCenter, ClusterConfig, ClusterEngine, ClusterFit, ClusterMode};
pub use country::{CountryPolygon, CountryResolver, UNKNOWN_COUNTRY};
pub use dataset::{Column, ColumnKind, Ingested, PointDataset, Record, RecordRef};
pub use pipeline::{EnrichedRecord, Pipeline, PipelineConfig, ZoneReport};

/// Default upper bound on Lloyd iterations / streaming epochs
pub const DEFAULT_MAX_ITER: usize = 300;

/// Default share of malformed records tolerated before ingestion aborts
pub const DEFAULT_MAX_DROPPED_FRACTION: f64 = 0.5;

/// Mean Earth radius in km
pub const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Error, Debug)]
pub enum ZoneError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("GeoJSON error: {0}")]
    GeoJson(#[from] geojson::Error),
    #[error("Schema error: {0}")]
    Schema(String),
    #[error("Record {row}: {field} value {value:?} is out of range")]
    ValueRange {
        row: usize,
        field: &'static str,
        value: String,
    },
    #[error("Input contains no records")]
    EmptyInput,
    #[error("Unknown column: {0}")]
    UnknownColumn(String),
    #[error("Insufficient data: k={k} clusters requested but only {points} points")]
    InsufficientData { k: usize, points: usize },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Country polygon set is empty")]
    EmptyPolygonSet,
    #[error("Assignment mismatch: {0}")]
    AssignmentMismatch(String),
    #[error("Dropped {dropped} of {total} records (limit {max_fraction:.2} of input)")]
    DroppedFractionExceeded {
        dropped: usize,
        total: usize,
        max_fraction: f64,
    },
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<ZoneError>,
    },
}

impl ZoneError {
    /// Tag an error with the pipeline stage that produced it
    pub fn at(self, stage: Stage) -> Self {
        match self {
            // Already tagged by an inner stage
            err @ ZoneError::Stage { .. } => err,
            err => ZoneError::Stage {
                stage,
                source: Box::new(err),
            },
        }
    }

    /// The underlying error, with any stage tag removed
    pub fn root(&self) -> &ZoneError {
        match self {
            ZoneError::Stage { source, .. } => source.root(),
            err => err,
        }
    }
}

pub type Result<T> = std::result::Result<T, ZoneError>;

/// Pipeline stages, used to label structural failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Ingest,
    Cluster,
    Aggregate,
    Resolve,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Ingest => "ingest",
            Stage::Cluster => "cluster",
            Stage::Aggregate => "aggregate",
            Stage::Resolve => "resolve",
        };
        f.write_str(name)
    }
}

/// A geographic coordinate in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Both components finite and inside the WGS84 ranges
    pub fn is_valid(&self) -> bool {
        is_valid_latitude(self.lat) && is_valid_longitude(self.lon)
    }

    /// Squared Euclidean distance in (lat, lon) degree space
    #[inline]
    pub fn distance_sq(&self, other: &LatLon) -> f64 {
        let dlat = self.lat - other.lat;
        let dlon = self.lon - other.lon;
        dlat * dlat + dlon * dlon
    }
}

impl From<(f64, f64)> for LatLon {
    fn from((lat, lon): (f64, f64)) -> Self {
        Self { lat, lon }
    }
}

/// Validate latitude is in valid range
pub fn is_valid_latitude(lat: f64) -> bool {
    (-90.0..=90.0).contains(&lat) && lat.is_finite()
}

/// Validate longitude is in valid range
pub fn is_valid_longitude(lon: f64) -> bool {
    (-180.0..=180.0).contains(&lon) && lon.is_finite()
}

/// Haversine distance between two points in km
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1 * PI / 180.0;
    let lat2_rad = lat2 * PI / 180.0;
    let dlat = (lat2 - lat1) * PI / 180.0;
    let dlon = (lon2 - lon1) * PI / 180.0;

    let a = (dlat / 2.0).sin().powi(2) + lat1_rad.cos() * lat2_rad.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}
