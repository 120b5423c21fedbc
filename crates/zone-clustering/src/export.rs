//! Output formats: zone CSV, enriched record CSV, GeoJSON, run metadata

use crate::aggregate::ZoneSummary;
use crate::cluster::ClusterMode;
use crate::pipeline::{EnrichedRecord, PipelineConfig, ZoneReport};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

fn cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Zone table: `cluster_id, centroid_lat, centroid_lon, member_count, mean_<col>...[, country]`
pub fn write_summaries_csv<W: Write>(writer: W, summaries: &[ZoneSummary]) -> Result<()> {
    let mut out = csv::Writer::from_writer(writer);

    let mean_columns: Vec<&str> = summaries
        .first()
        .map(|s| s.means.iter().map(|m| m.column.as_str()).collect())
        .unwrap_or_default();
    let with_country = summaries.iter().any(|s| s.country.is_some());

    let mut header: Vec<String> = ["cluster_id", "centroid_lat", "centroid_lon", "member_count"]
        .iter()
        .map(|h| h.to_string())
        .collect();
    header.extend(mean_columns.iter().map(|c| format!("mean_{c}")));
    if with_country {
        header.push("country".to_string());
    }
    out.write_record(&header)?;

    for s in summaries {
        let mut row = vec![
            s.cluster_id.to_string(),
            s.centroid_lat.to_string(),
            s.centroid_lon.to_string(),
            s.member_count.to_string(),
        ];
        row.extend(mean_columns.iter().map(|c| cell(s.mean(c))));
        if with_country {
            row.push(s.country.clone().unwrap_or_default());
        }
        out.write_record(&row)?;
    }

    out.flush()?;
    Ok(())
}

pub fn write_summaries_file(path: impl AsRef<Path>, summaries: &[ZoneSummary]) -> Result<()> {
    let path = path.as_ref();
    info!("Writing {} zones to {:?}", summaries.len(), path);
    write_summaries_csv(BufWriter::new(File::create(path)?), summaries)
}

/// Record table: `latitude, longitude, quality, timestamp, cluster_id, country`
pub fn write_enriched_csv<W: Write>(writer: W, records: &[EnrichedRecord]) -> Result<()> {
    let mut out = csv::Writer::from_writer(writer);
    out.write_record(["latitude", "longitude", "quality", "timestamp", "cluster_id", "country"])?;

    for r in records {
        out.write_record([
            r.record.latitude.to_string(),
            r.record.longitude.to_string(),
            cell(r.record.quality),
            r.record.timestamp.clone().unwrap_or_default(),
            r.cluster_id.to_string(),
            r.country.clone(),
        ])?;
    }

    out.flush()?;
    Ok(())
}

pub fn write_enriched_file(path: impl AsRef<Path>, records: &[EnrichedRecord]) -> Result<()> {
    let path = path.as_ref();
    info!("Writing {} enriched records to {:?}", records.len(), path);
    write_enriched_csv(BufWriter::new(File::create(path)?), records)
}

/// Run description stored next to the zone tables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub input: String,
    pub k: usize,
    pub mode: ClusterMode,
    pub seed: u64,
    pub total_records: usize,
    pub dropped_records: usize,
    pub zones: usize,
    pub iterations: usize,
    pub converged: bool,
    pub inertia: f64,
    pub generated_at: String,
}

impl RunMetadata {
    pub fn new(input: impl Into<String>, config: &PipelineConfig, report: &ZoneReport) -> Self {
        Self {
            input: input.into(),
            k: config.cluster.k,
            mode: config.cluster.mode,
            seed: config.cluster.seed,
            total_records: report.total_records,
            dropped_records: report.dropped_records,
            zones: report.summaries.len(),
            iterations: report.iterations,
            converged: report.converged,
            inertia: report.inertia,
            generated_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Export zones as a GeoJSON FeatureCollection of centroid points
pub fn zones_to_geojson(summaries: &[ZoneSummary], metadata: &RunMetadata) -> serde_json::Value {
    let features: Vec<serde_json::Value> = summaries
        .iter()
        .map(|s| {
            let mut properties = serde_json::json!({
                "cluster_id": s.cluster_id,
                "member_count": s.member_count,
                "country": s.country,
            });
            for m in &s.means {
                properties[format!("mean_{}", m.column)] = serde_json::json!(m.mean);
            }
            serde_json::json!({
                "type": "Feature",
                "geometry": {
                    "type": "Point",
                    "coordinates": [s.centroid_lon, s.centroid_lat]
                },
                "properties": properties
            })
        })
        .collect();

    serde_json::json!({
        "type": "FeatureCollection",
        "features": features,
        "metadata": metadata
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::ColumnMean;
    use crate::dataset::Record;
    use tempfile::NamedTempFile;

    fn zone(cluster_id: usize, quality: Option<f64>, country: Option<&str>) -> ZoneSummary {
        ZoneSummary {
            cluster_id,
            centroid_lat: 52.05,
            centroid_lon: 9.05,
            member_count: 2,
            means: vec![ColumnMean {
                column: "quality".to_string(),
                mean: quality,
            }],
            country: country.map(str::to_string),
        }
    }

    #[test]
    fn test_summaries_csv() {
        let mut buf = Vec::new();
        write_summaries_csv(&mut buf, &[zone(0, Some(15.0), None), zone(1, None, None)]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "cluster_id,centroid_lat,centroid_lon,member_count,mean_quality");
        assert_eq!(lines[1], "0,52.05,9.05,2,15");
        assert_eq!(lines[2], "1,52.05,9.05,2,");
    }

    #[test]
    fn test_summaries_csv_with_country() {
        let mut buf = Vec::new();
        write_summaries_csv(&mut buf, &[zone(0, Some(15.0), Some("Germany"))]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("cluster_id,centroid_lat,centroid_lon,member_count,mean_quality,country\n"));
        assert!(text.contains(",Germany"));
    }

    #[test]
    fn test_enriched_csv_file() {
        let records = vec![EnrichedRecord {
            index: 0,
            record: Record {
                latitude: 52.0,
                longitude: 9.0,
                quality: Some(10.0),
                timestamp: None,
            },
            cluster_id: 0,
            country: "Germany".to_string(),
        }];
        let file = NamedTempFile::new().unwrap();
        write_enriched_file(file.path(), &records).unwrap();

        let text = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(text, "latitude,longitude,quality,timestamp,cluster_id,country\n52,9,10,,0,Germany\n");
    }

    #[test]
    fn test_geojson_export() {
        let metadata = RunMetadata {
            input: "wagons.csv".to_string(),
            k: 2,
            mode: ClusterMode::Exact,
            seed: 0,
            total_records: 3,
            dropped_records: 0,
            zones: 1,
            iterations: 2,
            converged: true,
            inertia: 0.01,
            generated_at: "2024-01-01T00:00:00Z".to_string(),
        };
        let geojson = zones_to_geojson(&[zone(0, Some(15.0), Some("Germany"))], &metadata);

        assert_eq!(geojson["type"], "FeatureCollection");
        let feature = &geojson["features"][0];
        assert_eq!(feature["geometry"]["coordinates"][0], 9.05);
        assert_eq!(feature["properties"]["mean_quality"], 15.0);
        assert_eq!(feature["properties"]["country"], "Germany");
        assert_eq!(geojson["metadata"]["input"], "wagons.csv");
    }
}
