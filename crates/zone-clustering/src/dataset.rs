//! Point dataset: typed, ordered table of geo-tagged records

use crate::{LatLon, Result, ZoneError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{info, warn};

pub const LATITUDE: &str = "latitude";
pub const LONGITUDE: &str = "longitude";
pub const QUALITY: &str = "quality";
pub const TIMESTAMP: &str = "timestamp";

const LATITUDE_HEADERS: [&str; 2] = ["latitude", "lat"];
const LONGITUDE_HEADERS: [&str; 3] = ["longitude", "lon", "lng"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Numeric,
    Categorical,
}

/// A non-coordinate column. Missing cells are `None`.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Numeric(Vec<Option<f64>>),
    Categorical(Vec<Option<String>>),
}

impl Column {
    pub fn kind(&self) -> ColumnKind {
        match self {
            Column::Numeric(_) => ColumnKind::Numeric,
            Column::Categorical(_) => ColumnKind::Categorical,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Column::Numeric(v) => v.len(),
            Column::Categorical(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_numeric(&self) -> Option<&[Option<f64>]> {
        match self {
            Column::Numeric(v) => Some(v),
            Column::Categorical(_) => None,
        }
    }

    pub fn as_categorical(&self) -> Option<&[Option<String>]> {
        match self {
            Column::Categorical(v) => Some(v),
            Column::Numeric(_) => None,
        }
    }

    fn take(&self, indices: &[usize]) -> Column {
        match self {
            Column::Numeric(v) => Column::Numeric(indices.iter().map(|&i| v[i]).collect()),
            Column::Categorical(v) => Column::Categorical(indices.iter().map(|&i| v[i].clone()).collect()),
        }
    }

    fn extend(&mut self, other: Column) {
        match (self, other) {
            (Column::Numeric(a), Column::Numeric(b)) => a.extend(b),
            (Column::Categorical(a), Column::Categorical(b)) => a.extend(b),
            // Mixed kinds widen to categorical
            (this, other) => {
                let mut cells = std::mem::replace(this, Column::Categorical(Vec::new())).into_text();
                cells.extend(other.into_text());
                *this = Column::Categorical(cells);
            }
        }
    }

    /// Cells as text; numbers in their shortest form
    fn into_text(self) -> Vec<Option<String>> {
        match self {
            Column::Numeric(v) => v.into_iter().map(|x| x.map(|x| x.to_string())).collect(),
            Column::Categorical(v) => v,
        }
    }

    /// Keep raw cells as text, whatever they look like
    fn from_text_cells(cells: Vec<String>) -> Column {
        Column::Categorical(
            cells
                .into_iter()
                .map(|c| if is_missing(&c) { None } else { Some(c) })
                .collect(),
        )
    }

    /// Type raw cells: numeric when every present cell parses as f64
    fn from_cells(cells: Vec<String>) -> Column {
        let numeric = cells
            .iter()
            .filter(|c| !is_missing(c))
            .all(|c| c.parse::<f64>().is_ok());

        if numeric {
            Column::Numeric(cells.iter().map(|c| parse_number(c)).collect())
        } else {
            Column::from_text_cells(cells)
        }
    }
}

fn is_missing(cell: &str) -> bool {
    cell.is_empty() || cell.eq_ignore_ascii_case("nan") || cell.eq_ignore_ascii_case("na")
}

fn parse_number(cell: &str) -> Option<f64> {
    if is_missing(cell) {
        return None;
    }
    cell.parse::<f64>().ok().filter(|v| !v.is_nan())
}

/// Owned copy of one row's well-known fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Borrowed view of one row
#[derive(Debug, Clone, Copy)]
pub struct RecordRef<'a> {
    dataset: &'a PointDataset,
    index: usize,
}

impl<'a> RecordRef<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn coordinate(&self) -> LatLon {
        self.dataset.coordinates[self.index]
    }

    pub fn latitude(&self) -> f64 {
        self.coordinate().lat
    }

    pub fn longitude(&self) -> f64 {
        self.coordinate().lon
    }

    /// Value of a numeric column, `None` if missing or the column is absent
    pub fn numeric(&self, name: &str) -> Option<f64> {
        self.dataset
            .column(name)
            .and_then(Column::as_numeric)
            .and_then(|v| v[self.index])
    }

    /// Value of a categorical column, `None` if missing or the column is absent
    pub fn text(&self, name: &str) -> Option<&'a str> {
        self.dataset
            .column(name)
            .and_then(Column::as_categorical)
            .and_then(|v| v[self.index].as_deref())
    }

    pub fn quality(&self) -> Option<f64> {
        self.numeric(QUALITY)
    }

    /// Raw timestamp cell; numeric timestamps are rendered back to text
    pub fn timestamp(&self) -> Option<String> {
        match self.dataset.column(TIMESTAMP)? {
            Column::Categorical(v) => v[self.index].clone(),
            Column::Numeric(v) => v[self.index].map(|t| t.to_string()),
        }
    }

    pub fn to_record(&self) -> Record {
        let c = self.coordinate();
        Record {
            latitude: c.lat,
            longitude: c.lon,
            quality: self.quality(),
            timestamp: self.timestamp(),
        }
    }
}

/// Result of lenient ingestion
#[derive(Debug, Clone)]
pub struct Ingested {
    pub dataset: PointDataset,
    /// Records rejected for malformed or out-of-range coordinates
    pub dropped: usize,
    /// Records read, including dropped ones
    pub total: usize,
}

impl Ingested {
    pub fn dropped_fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.dropped as f64 / self.total as f64
        }
    }
}

/// Ordered table of geo-tagged records with a uniform schema.
///
/// Row count and row order are fixed at construction; every transformation
/// returns a new dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct PointDataset {
    coordinates: Vec<LatLon>,
    columns: Vec<(String, Column)>,
}

impl PointDataset {
    /// Parse CSV input, failing on the first invalid coordinate
    pub fn load<R: Read>(source: R) -> Result<Self> {
        let ingested = read_table(source, true, &[])?;
        if ingested.total == 0 {
            return Err(ZoneError::EmptyInput);
        }
        Ok(ingested.dataset)
    }

    /// Parse CSV input, dropping malformed records and records with
    /// invalid coordinates.
    ///
    /// Fails with `DroppedFractionExceeded` when more than
    /// `max_dropped_fraction` of the records had to be dropped.
    pub fn ingest<R: Read>(source: R, max_dropped_fraction: f64) -> Result<Ingested> {
        Self::ingest_with_text_columns(source, max_dropped_fraction, &[])
    }

    /// [`PointDataset::ingest`], keeping `text_columns` categorical even when
    /// every cell looks numeric (identifiers such as `007`)
    pub fn ingest_with_text_columns<R: Read>(
        source: R,
        max_dropped_fraction: f64,
        text_columns: &[&str],
    ) -> Result<Ingested> {
        if !(0.0..=1.0).contains(&max_dropped_fraction) {
            return Err(ZoneError::InvalidConfig(format!(
                "max_dropped_fraction must be within [0, 1], got {max_dropped_fraction}"
            )));
        }

        let ingested = read_table(source, false, text_columns)?;
        if ingested.total == 0 {
            return Err(ZoneError::EmptyInput);
        }
        if ingested.dropped_fraction() > max_dropped_fraction {
            return Err(ZoneError::DroppedFractionExceeded {
                dropped: ingested.dropped,
                total: ingested.total,
                max_fraction: max_dropped_fraction,
            });
        }
        if ingested.dataset.is_empty() {
            return Err(ZoneError::EmptyInput);
        }
        if ingested.dropped > 0 {
            warn!(
                "Dropped {} of {} malformed records or records with invalid coordinates",
                ingested.dropped, ingested.total
            );
        }
        Ok(ingested)
    }

    /// Build a coordinate-only dataset
    pub fn from_coordinates<I, P>(points: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<LatLon>,
    {
        let mut coordinates = Vec::new();
        for (row, p) in points.into_iter().enumerate() {
            let p = p.into();
            check_coordinate(row, p)?;
            coordinates.push(p);
        }
        if coordinates.is_empty() {
            return Err(ZoneError::EmptyInput);
        }
        Ok(Self {
            coordinates,
            columns: Vec::new(),
        })
    }

    /// Return a dataset with `name` set to `values`, replacing any column of that name
    pub fn with_numeric_column(self, name: impl Into<String>, values: Vec<Option<f64>>) -> Result<Self> {
        self.with_column(name, Column::Numeric(values))
    }

    pub fn with_categorical_column(self, name: impl Into<String>, values: Vec<Option<String>>) -> Result<Self> {
        self.with_column(name, Column::Categorical(values))
    }

    fn with_column(mut self, name: impl Into<String>, column: Column) -> Result<Self> {
        let name = name.into();
        if is_coordinate_name(&name) {
            return Err(ZoneError::Schema(format!("{name} is a coordinate column")));
        }
        if column.len() != self.len() {
            return Err(ZoneError::Schema(format!(
                "column {name} has {} values for {} records",
                column.len(),
                self.len()
            )));
        }
        match self.columns.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = column,
            None => self.columns.push((name, column)),
        }
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.coordinates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinates.is_empty()
    }

    pub fn coordinates(&self) -> &[LatLon] {
        &self.coordinates
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    /// Names of all numeric columns, in schema order
    pub fn numeric_column_names(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|(_, c)| c.kind() == ColumnKind::Numeric)
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Values of a numeric column
    pub fn numeric_column(&self, name: &str) -> Result<&[Option<f64>]> {
        let column = self
            .column(name)
            .ok_or_else(|| ZoneError::UnknownColumn(name.to_string()))?;
        column
            .as_numeric()
            .ok_or_else(|| ZoneError::Schema(format!("column {name} is not numeric")))
    }

    pub fn record(&self, index: usize) -> Option<RecordRef<'_>> {
        (index < self.len()).then_some(RecordRef { dataset: self, index })
    }

    pub fn records(&self) -> impl Iterator<Item = RecordRef<'_>> {
        (0..self.len()).map(move |index| RecordRef { dataset: self, index })
    }

    /// Projection onto `names`; coordinates are always kept
    pub fn select_columns(&self, names: &[&str]) -> Result<Self> {
        let mut columns = Vec::with_capacity(names.len());
        for &name in names {
            if is_coordinate_name(name) {
                continue;
            }
            let column = self
                .column(name)
                .ok_or_else(|| ZoneError::UnknownColumn(name.to_string()))?;
            if !columns.iter().any(|(n, _): &(String, Column)| n == name) {
                columns.push((name.to_string(), column.clone()));
            }
        }
        Ok(Self {
            coordinates: self.coordinates.clone(),
            columns,
        })
    }

    /// Rows matching `predicate`, in their original order
    pub fn filter<F>(&self, predicate: F) -> Self
    where
        F: Fn(&RecordRef<'_>) -> bool,
    {
        let indices: Vec<usize> = self
            .records()
            .filter(|r| predicate(r))
            .map(|r| r.index)
            .collect();
        self.take(&indices)
    }

    /// Rows at `indices`, in the given order
    pub(crate) fn take(&self, indices: &[usize]) -> Self {
        Self {
            coordinates: indices.iter().map(|&i| self.coordinates[i]).collect(),
            columns: self
                .columns
                .iter()
                .map(|(n, c)| (n.clone(), c.take(indices)))
                .collect(),
        }
    }

    /// Append datasets sharing column names, preserving order.
    ///
    /// A column typed numeric in one part and categorical in another is
    /// widened to categorical.
    pub fn concat(parts: Vec<PointDataset>) -> Result<Self> {
        let mut parts = parts.into_iter();
        let mut merged = parts.next().ok_or(ZoneError::EmptyInput)?;

        for (i, part) in parts.enumerate() {
            if !merged.same_column_names(&part) {
                return Err(ZoneError::Schema(format!(
                    "dataset {} has columns {:?}, expected {:?}",
                    i + 1,
                    part.column_names().collect::<Vec<_>>(),
                    merged.column_names().collect::<Vec<_>>()
                )));
            }
            merged.coordinates.extend(part.coordinates);
            for ((name, dst), (_, src)) in merged.columns.iter_mut().zip(part.columns) {
                if dst.kind() != src.kind() {
                    warn!("Column {} is numeric in some inputs only; merged as text", name);
                }
                dst.extend(src);
            }
        }
        Ok(merged)
    }

    fn same_column_names(&self, other: &PointDataset) -> bool {
        self.columns.len() == other.columns.len()
            && self
                .columns
                .iter()
                .zip(&other.columns)
                .all(|((a, _), (b, _))| a == b)
    }
}

fn is_coordinate_name(name: &str) -> bool {
    LATITUDE_HEADERS
        .iter()
        .chain(LONGITUDE_HEADERS.iter())
        .any(|h| h.eq_ignore_ascii_case(name))
}

fn check_coordinate(row: usize, p: LatLon) -> Result<()> {
    if !crate::is_valid_latitude(p.lat) {
        return Err(ZoneError::ValueRange {
            row,
            field: LATITUDE,
            value: p.lat.to_string(),
        });
    }
    if !crate::is_valid_longitude(p.lon) {
        return Err(ZoneError::ValueRange {
            row,
            field: LONGITUDE,
            value: p.lon.to_string(),
        });
    }
    Ok(())
}

fn find_header(headers: &csv::StringRecord, accepted: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|h| accepted.iter().any(|a| a.eq_ignore_ascii_case(h)))
}

fn parse_coordinate(row: usize, field: &'static str, cell: &str, valid: fn(f64) -> bool) -> Result<f64> {
    match cell.parse::<f64>() {
        Ok(v) if valid(v) => Ok(v),
        _ => Err(ZoneError::ValueRange {
            row,
            field,
            value: cell.to_string(),
        }),
    }
}

fn read_table<R: Read>(source: R, strict: bool, text_columns: &[&str]) -> Result<Ingested> {
    // Lenient reads count ragged rows as dropped instead of failing
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(!strict)
        .trim(csv::Trim::All)
        .from_reader(source);

    let headers = reader.headers()?.clone();
    let lat_idx = find_header(&headers, &LATITUDE_HEADERS)
        .ok_or_else(|| ZoneError::Schema(format!("missing required column {LATITUDE}")))?;
    let lon_idx = find_header(&headers, &LONGITUDE_HEADERS)
        .ok_or_else(|| ZoneError::Schema(format!("missing required column {LONGITUDE}")))?;

    let extra: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != lat_idx && *i != lon_idx)
        .map(|(i, h)| (i, h.to_string()))
        .collect();

    let mut coordinates = Vec::new();
    let mut cells: Vec<Vec<String>> = vec![Vec::new(); extra.len()];
    let mut dropped = 0;
    let mut total = 0;

    for (row, record) in reader.records().enumerate() {
        let record = record?;
        total += 1;

        if record.len() != headers.len() {
            dropped += 1;
            continue;
        }

        let lat = parse_coordinate(row, LATITUDE, &record[lat_idx], crate::is_valid_latitude);
        let lon = parse_coordinate(row, LONGITUDE, &record[lon_idx], crate::is_valid_longitude);
        let (lat, lon) = match (lat, lon) {
            (Ok(lat), Ok(lon)) => (lat, lon),
            (Err(e), _) | (_, Err(e)) => {
                if strict {
                    return Err(e);
                }
                dropped += 1;
                continue;
            }
        };

        coordinates.push(LatLon::new(lat, lon));
        for (slot, (i, _)) in cells.iter_mut().zip(&extra) {
            slot.push(record[*i].to_string());
        }
    }

    let columns = extra
        .into_iter()
        .zip(cells)
        .map(|((_, name), raw)| {
            let column = if text_columns.contains(&name.as_str()) {
                Column::from_text_cells(raw)
            } else {
                Column::from_cells(raw)
            };
            (name, column)
        })
        .collect();

    Ok(Ingested {
        dataset: PointDataset { coordinates, columns },
        dropped,
        total,
    })
}

/// Load a CSV file, failing on the first invalid coordinate
pub fn load_csv(path: impl AsRef<Path>) -> Result<PointDataset> {
    let path = path.as_ref();
    info!("Loading records from {:?}", path);

    let reader = BufReader::new(File::open(path)?);
    let dataset = PointDataset::load(reader)?;

    info!("Loaded {} records", dataset.len());
    Ok(dataset)
}

/// Load a CSV file, dropping and counting invalid records
pub fn ingest_csv(path: impl AsRef<Path>, max_dropped_fraction: f64) -> Result<Ingested> {
    ingest_csv_with_text_columns(path, max_dropped_fraction, &[])
}

/// [`ingest_csv`] with identifier columns kept as text
pub fn ingest_csv_with_text_columns(
    path: impl AsRef<Path>,
    max_dropped_fraction: f64,
    text_columns: &[&str],
) -> Result<Ingested> {
    let path = path.as_ref();
    info!("Ingesting records from {:?}", path);

    let reader = BufReader::new(File::open(path)?);
    let ingested = PointDataset::ingest_with_text_columns(reader, max_dropped_fraction, text_columns)?;

    info!(
        "Loaded {} records ({} dropped as malformed or out of range)",
        ingested.dataset.len(),
        ingested.dropped
    );
    Ok(ingested)
}
