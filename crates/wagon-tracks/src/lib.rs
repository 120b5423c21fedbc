//! Wagon Tracks
//!
//! Per-wagon summaries over a GNSS fix table: distance travelled between
//! consecutive fixes, mean and median position, and the country each of
//! those positions falls in.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::io::Write;
use thiserror::Error;
use tracing::{debug, info, warn};
use zone_clustering::{haversine_km, Column, CountryResolver, LatLon, PointDataset, ZoneError};

/// Wagon identifier column in the raw exports
pub const WAGON_ID: &str = "wagon_ID";

/// Fix timestamp column in the raw exports
pub const TIMESTAMP_COLUMN: &str = "timestamp_measure_position";

#[derive(Error, Debug)]
pub enum TrackError {
    #[error("Unknown column: {0}")]
    UnknownColumn(String),
    #[error("Id column {0} was typed numeric; ingest it as a text column")]
    NumericIdColumn(String),
    #[error("Dataset error: {0}")]
    Dataset(#[from] ZoneError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TrackError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackConfig {
    /// Groups fixes into tracks
    pub id_column: String,
    /// Orders fixes within a track; input order when absent
    #[serde(default)]
    pub order_column: Option<String>,
    /// Splits a track so fixes in different segments are never joined
    /// into a distance leg (e.g. loading state)
    #[serde(default)]
    pub segment_column: Option<String>,
}

impl TrackConfig {
    pub fn new(id_column: impl Into<String>) -> Self {
        Self {
            id_column: id_column.into(),
            order_column: None,
            segment_column: None,
        }
    }

    pub fn ordered_by(mut self, column: impl Into<String>) -> Self {
        self.order_column = Some(column.into());
        self
    }

    pub fn segmented_by(mut self, column: impl Into<String>) -> Self {
        self.segment_column = Some(column.into());
        self
    }
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self::new(WAGON_ID).ordered_by(TIMESTAMP_COLUMN)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSummary {
    pub wagon_id: String,
    pub fixes: usize,
    pub distance_km: f64,
    pub mean_position: LatLon,
    pub median_position: LatLon,
    /// Set only when a resolver was supplied
    pub mean_country: Option<String>,
    pub median_country: Option<String>,
}

fn lookup<'a>(dataset: &'a PointDataset, name: &str) -> Result<&'a Column> {
    dataset
        .column(name)
        .ok_or_else(|| TrackError::UnknownColumn(name.to_string()))
}

/// Cell as a segment key; numbers in their shortest form ("1", not "1.0")
fn key_at(column: &Column, row: usize) -> Option<String> {
    match column {
        Column::Numeric(v) => v[row].map(|x| x.to_string()),
        Column::Categorical(v) => v[row].clone(),
    }
}

/// Missing values sort after present ones
fn compare_rows(column: &Column, a: usize, b: usize) -> Ordering {
    match column {
        Column::Numeric(v) => match (v[a], v[b]) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (x, y) => y.is_some().cmp(&x.is_some()),
        },
        Column::Categorical(v) => match (&v[a], &v[b]) {
            (Some(x), Some(y)) => x.cmp(y),
            (x, y) => y.is_some().cmp(&x.is_some()),
        },
    }
}

fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

fn track_distance_km(coords: &[LatLon], rows: &[usize], segments: Option<&Column>) -> f64 {
    let mut previous: HashMap<Option<String>, usize> = HashMap::new();
    let mut total = 0.0;
    for &row in rows {
        let segment = segments.and_then(|c| key_at(c, row));
        if let Some(prev) = previous.insert(segment, row) {
            let (a, b) = (coords[prev], coords[row]);
            total += haversine_km(a.lat, a.lon, b.lat, b.lon);
        }
    }
    total
}

/// One summary per wagon, in order of first appearance.
///
/// Wagons are grouped on the raw id text, so the id column must be
/// categorical (see [`PointDataset::ingest_with_text_columns`]). Rows with an
/// empty id cell are left out.
pub fn summarize_tracks(
    dataset: &PointDataset,
    config: &TrackConfig,
    resolver: Option<&CountryResolver>,
) -> Result<Vec<TrackSummary>> {
    let ids = lookup(dataset, &config.id_column)?
        .as_categorical()
        .ok_or_else(|| TrackError::NumericIdColumn(config.id_column.clone()))?;
    let order = config.order_column.as_deref().map(|c| lookup(dataset, c)).transpose()?;
    let segments = config.segment_column.as_deref().map(|c| lookup(dataset, c)).transpose()?;

    let mut tracks: Vec<(String, Vec<usize>)> = Vec::new();
    let mut slots: HashMap<&str, usize> = HashMap::new();
    let mut unlabeled = 0;

    for (row, id) in ids.iter().enumerate() {
        let Some(id) = id.as_deref() else {
            unlabeled += 1;
            continue;
        };
        let slot = *slots.entry(id).or_insert_with(|| {
            tracks.push((id.to_string(), Vec::new()));
            tracks.len() - 1
        });
        tracks[slot].1.push(row);
    }

    if unlabeled > 0 {
        warn!("{} fixes without {} skipped", unlabeled, config.id_column);
    }

    let coords = dataset.coordinates();
    let summaries: Vec<TrackSummary> = tracks
        .into_iter()
        .map(|(wagon_id, mut rows)| {
            if let Some(order) = order {
                rows.sort_by(|&a, &b| compare_rows(order, a, b));
            }

            let n = rows.len() as f64;
            let mean_position = LatLon::new(
                rows.iter().map(|&r| coords[r].lat).sum::<f64>() / n,
                rows.iter().map(|&r| coords[r].lon).sum::<f64>() / n,
            );
            let median_position = LatLon::new(
                median(rows.iter().map(|&r| coords[r].lat).collect()),
                median(rows.iter().map(|&r| coords[r].lon).collect()),
            );
            let distance_km = track_distance_km(coords, &rows, segments);

            let country = |p: LatLon| resolver.map(|r| r.resolve(p.lat, p.lon).to_string());

            debug!("Wagon {}: {} fixes, {:.1} km", wagon_id, rows.len(), distance_km);

            TrackSummary {
                fixes: rows.len(),
                distance_km,
                mean_country: country(mean_position),
                median_country: country(median_position),
                mean_position,
                median_position,
                wagon_id,
            }
        })
        .collect();

    info!("Summarized {} wagon tracks from {} fixes", summaries.len(), dataset.len());
    Ok(summaries)
}

/// Track table: `wagon_id, fixes, distance_km, mean_lat, mean_lon, median_lat, median_lon, mean_country, median_country`
pub fn write_tracks_csv<W: Write>(writer: W, tracks: &[TrackSummary]) -> Result<()> {
    let mut out = csv::Writer::from_writer(writer);
    out.write_record([
        "wagon_id",
        "fixes",
        "distance_km",
        "mean_lat",
        "mean_lon",
        "median_lat",
        "median_lon",
        "mean_country",
        "median_country",
    ])?;

    for t in tracks {
        out.write_record([
            t.wagon_id.clone(),
            t.fixes.to_string(),
            t.distance_km.to_string(),
            t.mean_position.lat.to_string(),
            t.mean_position.lon.to_string(),
            t.median_position.lat.to_string(),
            t.median_position.lon.to_string(),
            t.mean_country.clone().unwrap_or_default(),
            t.median_country.clone().unwrap_or_default(),
        ])?;
    }

    out.flush()?;
    Ok(())
}
