//! Signal quality derived from the raw wagon exports
//!
//! Two derivations, each writing the `quality` column (higher is better):
//!
//! - **HDOP** (GNSS fixes): fixes with `hdop > max_hdop` are discarded and
//!   the rest get `quality = max_hdop - hdop`, on a 0 to `max_hdop` scale.
//! - **Latency** (cellular fixes): fixes transferred more than 30 s after
//!   measurement, or on another day, are discarded; the rest get
//!   `quality = (1 - receive_delay / 30 s) * 256`.
//!
//! [`filter_position_source`] selects GNSS or cellular fixes beforehand.

use crate::dataset::{PointDataset, RecordRef, QUALITY};
use crate::{Result, ZoneError};
use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use tracing::info;

/// HDOP column name in the raw wagon exports
pub const HDOP_COLUMN: &str = "signal_quality_hdop";

/// Largest HDOP still treated as a usable fix
pub const DEFAULT_MAX_HDOP: f64 = 35.0;

/// Positioning method column in the raw wagon exports
pub const DETERMINATION_COLUMN: &str = "determination_position";

pub const MEASURE_COLUMN: &str = "timestamp_measure_position";
pub const TRANSFER_COLUMN: &str = "timestamp_transfer";
pub const RECEIVE_COLUMN: &str = "timestamp_index";

/// Longest measure-to-transfer delay of a usable cellular fix, in seconds
pub const MAX_TRANSFER_DELAY_SECS: f64 = 30.0;

/// Quality of a fix received with no delay
pub const LATENCY_QUALITY_SCALE: f64 = 256.0;

const SECS_PER_DAY: f64 = 86_400.0;

/// How a fix was positioned, as coded in the determination column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSource {
    Gnss,
    Cellular,
}

impl PositionSource {
    pub fn code(self) -> f64 {
        match self {
            PositionSource::Gnss => 1.0,
            PositionSource::Cellular => 4.0,
        }
    }
}

/// Keep only fixes positioned by `source`
pub fn filter_position_source(dataset: &PointDataset, column: &str, source: PositionSource) -> Result<PointDataset> {
    dataset.numeric_column(column)?;

    let kept = dataset.filter(|r| r.numeric(column) == Some(source.code()));
    info!("Kept {} of {} fixes positioned by {:?}", kept.len(), dataset.len(), source);
    Ok(kept)
}

/// Timestamp columns read by [`derive_latency_quality`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyColumns {
    pub measure: String,
    pub transfer: String,
    pub receive: String,
}

impl Default for LatencyColumns {
    fn default() -> Self {
        Self {
            measure: MEASURE_COLUMN.to_string(),
            transfer: TRANSFER_COLUMN.to_string(),
            receive: RECEIVE_COLUMN.to_string(),
        }
    }
}

/// A `"<d> days HH:MM:SS[.f]"` offset split into day and seconds of day
#[derive(Debug, Clone, Copy, PartialEq)]
struct DayTime {
    day: i64,
    seconds: f64,
}

impl DayTime {
    fn parse(raw: &str) -> Option<Self> {
        let (day, time) = raw.trim().split_once(" day")?;
        let time = time.trim_start_matches('s').trim();
        let time = NaiveTime::parse_from_str(time, "%H:%M:%S%.f").ok()?;
        Some(Self {
            day: day.trim().parse().ok()?,
            seconds: time.num_seconds_from_midnight() as f64 + time.nanosecond() as f64 / 1e9,
        })
    }

    fn total_seconds(self) -> f64 {
        self.day as f64 * SECS_PER_DAY + self.seconds
    }
}

fn latency_quality(record: &RecordRef<'_>, columns: &LatencyColumns) -> Option<f64> {
    let measure = DayTime::parse(record.text(&columns.measure)?)?;
    let transfer = DayTime::parse(record.text(&columns.transfer)?)?;
    let receive = DayTime::parse(record.text(&columns.receive)?)?;

    let transfer_delay = transfer.seconds - measure.seconds;
    if transfer.day != measure.day || !(0.0..=MAX_TRANSFER_DELAY_SECS).contains(&transfer_delay) {
        return None;
    }

    let receive_delay = receive.total_seconds() - transfer.total_seconds();
    Some((1.0 - receive_delay / MAX_TRANSFER_DELAY_SECS) * LATENCY_QUALITY_SCALE)
}

/// Keep fixes transferred within 30 s of measurement on the same day and
/// append `quality` from the transfer-to-receive delay.
///
/// Fixes with a missing or unparseable timestamp are discarded.
pub fn derive_latency_quality(dataset: &PointDataset, columns: &LatencyColumns) -> Result<PointDataset> {
    for name in [&columns.measure, &columns.transfer, &columns.receive] {
        if !dataset.has_column(name) {
            return Err(ZoneError::UnknownColumn(name.clone()));
        }
    }

    let qualities: Vec<Option<f64>> = dataset.records().map(|r| latency_quality(&r, columns)).collect();
    let kept = dataset.filter(|r| qualities[r.index()].is_some());
    let quality: Vec<Option<f64>> = qualities.into_iter().filter(Option::is_some).collect();

    info!(
        "Kept {} of {} fixes transferred within {}s",
        kept.len(),
        dataset.len(),
        MAX_TRANSFER_DELAY_SECS
    );

    kept.with_numeric_column(QUALITY, quality)
}

/// Keep fixes with `hdop <= max_hdop` and append the `quality` column
pub fn derive_signal_quality(dataset: &PointDataset, hdop_column: &str, max_hdop: f64) -> Result<PointDataset> {
    if !(max_hdop.is_finite() && max_hdop >= 0.0) {
        return Err(ZoneError::InvalidConfig(format!(
            "max_hdop must be a non-negative number, got {max_hdop}"
        )));
    }
    // Surface unknown / non-numeric columns before filtering
    dataset.numeric_column(hdop_column)?;

    let kept = dataset.filter(|r| r.numeric(hdop_column).is_some_and(|h| h <= max_hdop));
    let quality: Vec<Option<f64>> = kept
        .numeric_column(hdop_column)?
        .iter()
        .map(|h| h.map(|h| max_hdop - h))
        .collect();

    info!(
        "Kept {} of {} fixes with {} <= {}",
        kept.len(),
        dataset.len(),
        hdop_column,
        max_hdop
    );

    kept.with_numeric_column(QUALITY, quality)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_signal_quality() {
        let csv = "latitude,longitude,signal_quality_hdop\n50,8,5\n50,8,35\n50,8,36\n50,8,\n";
        let ds = PointDataset::load(csv.as_bytes()).unwrap();
        let good = derive_signal_quality(&ds, HDOP_COLUMN, DEFAULT_MAX_HDOP).unwrap();

        assert_eq!(good.len(), 2);
        assert_eq!(good.numeric_column(QUALITY).unwrap(), &[Some(30.0), Some(0.0)]);
        assert_eq!(ds.len(), 4);
    }

    #[test]
    fn test_missing_hdop_column() {
        let ds = PointDataset::from_coordinates([(1.0, 1.0)]).unwrap();
        assert!(matches!(
            derive_signal_quality(&ds, HDOP_COLUMN, DEFAULT_MAX_HDOP),
            Err(ZoneError::UnknownColumn(_))
        ));
    }

    #[test]
    fn test_filter_position_source() {
        let csv = "latitude,longitude,determination_position\n50,8,1\n51,8,4\n52,8,1\n53,8,\n";
        let ds = PointDataset::load(csv.as_bytes()).unwrap();

        let gnss = filter_position_source(&ds, DETERMINATION_COLUMN, PositionSource::Gnss).unwrap();
        assert_eq!(gnss.len(), 2);
        assert_eq!(gnss.coordinates()[1].lat, 52.0);

        let cellular = filter_position_source(&ds, DETERMINATION_COLUMN, PositionSource::Cellular).unwrap();
        assert_eq!(cellular.len(), 1);

        let missing = filter_position_source(&ds, "provider", PositionSource::Gnss);
        assert!(matches!(missing, Err(ZoneError::UnknownColumn(_))));
    }

    #[test]
    fn test_day_time_parsing() {
        let t = DayTime::parse("2 days 08:00:30.5").unwrap();
        assert_eq!(t.day, 2);
        assert_eq!(t.seconds, 8.0 * 3600.0 + 30.5);
        assert_eq!(DayTime::parse("1 day 00:00:01").unwrap().total_seconds(), 86_401.0);
        assert!(DayTime::parse("08:00:00").is_none());
        assert!(DayTime::parse("x days 08:00:00").is_none());
    }

    #[test]
    fn test_derive_latency_quality() {
        let csv = "\
latitude,longitude,timestamp_measure_position,timestamp_transfer,timestamp_index
50,8,0 days 08:00:00,0 days 08:00:10,0 days 08:00:10
51,8,0 days 08:00:00,0 days 08:00:20,0 days 08:00:35
52,8,0 days 08:00:00,0 days 08:00:31,0 days 08:00:31
53,8,0 days 23:59:50,1 days 00:00:05,1 days 00:00:05
54,8,0 days 08:00:00,0 days 07:59:59,0 days 08:00:00
55,8,0 days 08:00:00,,0 days 08:00:00
";
        let ds = PointDataset::load(csv.as_bytes()).unwrap();
        let good = derive_latency_quality(&ds, &LatencyColumns::default()).unwrap();

        assert_eq!(good.len(), 2);
        assert_eq!(good.coordinates()[1].lat, 51.0);
        assert_eq!(good.numeric_column(QUALITY).unwrap(), &[Some(256.0), Some(128.0)]);
    }

    #[test]
    fn test_latency_columns_required() {
        let ds = PointDataset::from_coordinates([(1.0, 1.0)]).unwrap();
        assert!(matches!(
            derive_latency_quality(&ds, &LatencyColumns::default()),
            Err(ZoneError::UnknownColumn(c)) if c == MEASURE_COLUMN
        ));
    }

    #[test]
    fn test_invalid_threshold() {
        let ds = PointDataset::from_coordinates([(1.0, 1.0)]).unwrap();
        assert!(matches!(
            derive_signal_quality(&ds, HDOP_COLUMN, -1.0),
            Err(ZoneError::InvalidConfig(_))
        ));
    }
}
