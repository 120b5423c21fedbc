//! Per-zone statistics: joins cluster assignments back onto records

use crate::cluster::{ClusterAssignment, ClusterCenter};
use crate::dataset::PointDataset;
use crate::{LatLon, Result, ZoneError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Mean of one numeric column over a zone's members
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMean {
    pub column: String,
    /// `None` when every member's value is missing
    pub mean: Option<f64>,
}

/// Summary row for one realized cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneSummary {
    pub cluster_id: usize,
    pub centroid_lat: f64,
    pub centroid_lon: f64,
    pub member_count: usize,
    pub means: Vec<ColumnMean>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl ZoneSummary {
    pub fn centroid(&self) -> LatLon {
        LatLon::new(self.centroid_lat, self.centroid_lon)
    }

    /// Mean of `column`; `None` if undefined or not aggregated
    pub fn mean(&self, column: &str) -> Option<f64> {
        self.means
            .iter()
            .find(|m| m.column == column)
            .and_then(|m| m.mean)
    }
}

struct ZoneTotals {
    count: usize,
    sums: Vec<f64>,
    present: Vec<usize>,
}

/// Computes [`ZoneSummary`] rows for a fixed set of numeric columns
#[derive(Debug, Clone)]
pub struct ZoneAggregator {
    numeric_columns: Vec<String>,
}

impl ZoneAggregator {
    pub fn new<I, S>(numeric_columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            numeric_columns: numeric_columns.into_iter().map(Into::into).collect(),
        }
    }

    /// Aggregate every numeric column of `dataset`
    pub fn for_dataset(dataset: &PointDataset) -> Self {
        Self::new(dataset.numeric_column_names())
    }

    pub fn numeric_columns(&self) -> &[String] {
        &self.numeric_columns
    }

    /// One summary per cluster id present in `assignment`, ascending by id
    pub fn aggregate(
        &self,
        dataset: &PointDataset,
        assignment: &ClusterAssignment,
        centers: &[ClusterCenter],
    ) -> Result<Vec<ZoneSummary>> {
        if assignment.len() != dataset.len() {
            return Err(ZoneError::AssignmentMismatch(format!(
                "assignment covers {} records, dataset has {}",
                assignment.len(),
                dataset.len()
            )));
        }

        let centers_by_id: BTreeMap<usize, &ClusterCenter> =
            centers.iter().map(|c| (c.cluster_id, c)).collect();

        let columns = self
            .numeric_columns
            .iter()
            .map(|name| dataset.numeric_column(name))
            .collect::<Result<Vec<_>>>()?;

        let mut totals: BTreeMap<usize, ZoneTotals> = BTreeMap::new();
        for (row, &cluster_id) in assignment.labels().iter().enumerate() {
            if !centers_by_id.contains_key(&cluster_id) {
                return Err(ZoneError::AssignmentMismatch(format!(
                    "record {row} assigned to cluster {cluster_id}, which has no center"
                )));
            }

            let t = totals.entry(cluster_id).or_insert_with(|| ZoneTotals {
                count: 0,
                sums: vec![0.0; columns.len()],
                present: vec![0; columns.len()],
            });
            t.count += 1;
            for (c, values) in columns.iter().enumerate() {
                if let Some(v) = values[row] {
                    t.sums[c] += v;
                    t.present[c] += 1;
                }
            }
        }

        let summaries: Vec<ZoneSummary> = totals
            .into_iter()
            .map(|(cluster_id, t)| {
                let center = centers_by_id[&cluster_id];
                let means = self
                    .numeric_columns
                    .iter()
                    .enumerate()
                    .map(|(c, name)| ColumnMean {
                        column: name.clone(),
                        mean: (t.present[c] > 0).then(|| t.sums[c] / t.present[c] as f64),
                    })
                    .collect();
                ZoneSummary {
                    cluster_id,
                    centroid_lat: center.centroid.lat,
                    centroid_lon: center.centroid.lon,
                    member_count: t.count,
                    means,
                    country: None,
                }
            })
            .collect();

        info!(
            "Aggregated {} records into {} zones over {} numeric columns",
            dataset.len(),
            summaries.len(),
            self.numeric_columns.len()
        );

        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn center(cluster_id: usize, lat: f64, lon: f64, member_count: usize) -> ClusterCenter {
        ClusterCenter {
            cluster_id,
            centroid: LatLon::new(lat, lon),
            member_count,
        }
    }

    fn dataset() -> PointDataset {
        PointDataset::from_coordinates([(52.0, 9.0), (52.1, 9.1), (10.0, 10.0), (10.1, 10.1)])
            .unwrap()
            .with_numeric_column("quality", vec![Some(10.0), Some(20.0), Some(30.0), None])
            .unwrap()
            .with_numeric_column("hdop", vec![Some(1.0), Some(2.0), None, None])
            .unwrap()
    }

    #[test]
    fn test_aggregate_means_and_counts() {
        let ds = dataset();
        let assignment = ClusterAssignment::from_labels(vec![0, 0, 1, 1]);
        let centers = vec![center(0, 52.05, 9.05, 2), center(1, 10.05, 10.05, 2)];

        let zones = ZoneAggregator::for_dataset(&ds)
            .aggregate(&ds, &assignment, &centers)
            .unwrap();

        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].member_count, 2);
        assert_eq!(zones[0].mean("quality"), Some(15.0));
        assert_eq!(zones[0].mean("hdop"), Some(1.5));
        assert_eq!(zones[1].mean("quality"), Some(30.0));
        // All hdop values missing in zone 1: undefined, not zero
        assert_eq!(zones[1].mean("hdop"), None);
        assert_eq!(zones[1].centroid(), LatLon::new(10.05, 10.05));
    }

    #[test]
    fn test_one_zone_per_point_reports_raw_values() {
        use crate::cluster::{ClusterConfig, ClusterEngine};

        let ds = dataset();
        let fit = ClusterEngine::new(ClusterConfig::exact(ds.len(), 7))
            .unwrap()
            .fit(ds.coordinates())
            .unwrap();
        let zones = ZoneAggregator::for_dataset(&ds)
            .aggregate(&ds, &fit.assignment, &fit.centers)
            .unwrap();

        assert_eq!(zones.len(), ds.len());
        for zone in &zones {
            assert_eq!(zone.member_count, 1);
            let row = fit.assignment.labels().iter().position(|&l| l == zone.cluster_id).unwrap();
            let record = ds.record(row).unwrap();
            assert_eq!(zone.centroid(), record.coordinate());
            assert_eq!(zone.mean("quality"), record.quality());
            assert_eq!(zone.mean("hdop"), record.numeric("hdop"));
        }
    }

    #[test]
    fn test_output_ascending_by_cluster_id() {
        let ds = dataset();
        let assignment = ClusterAssignment::from_labels(vec![3, 1, 3, 0]);
        let centers = vec![center(3, 0.0, 0.0, 2), center(0, 0.0, 0.0, 1), center(1, 0.0, 0.0, 1)];

        let zones = ZoneAggregator::new(["quality"])
            .aggregate(&ds, &assignment, &centers)
            .unwrap();
        let ids: Vec<usize> = zones.iter().map(|z| z.cluster_id).collect();
        assert_eq!(ids, vec![0, 1, 3]);
    }

    #[test]
    fn test_unrealized_centers_are_skipped() {
        let ds = dataset();
        let assignment = ClusterAssignment::from_labels(vec![0, 0, 0, 0]);
        let centers = vec![center(0, 1.0, 1.0, 4), center(1, 2.0, 2.0, 0)];

        let zones = ZoneAggregator::new(Vec::<String>::new())
            .aggregate(&ds, &assignment, &centers)
            .unwrap();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].member_count, 4);
        assert!(zones[0].means.is_empty());
    }

    #[test]
    fn test_mismatch_errors() {
        let ds = dataset();
        let centers = vec![center(0, 0.0, 0.0, 4)];

        let too_long = ClusterAssignment::from_labels(vec![0; 5]);
        assert!(matches!(
            ZoneAggregator::new(["quality"]).aggregate(&ds, &too_long, &centers),
            Err(ZoneError::AssignmentMismatch(_))
        ));

        let unknown_id = ClusterAssignment::from_labels(vec![0, 0, 7, 0]);
        assert!(matches!(
            ZoneAggregator::new(["quality"]).aggregate(&ds, &unknown_id, &centers),
            Err(ZoneError::AssignmentMismatch(_))
        ));
    }

    #[test]
    fn test_unknown_column() {
        let ds = dataset();
        let assignment = ClusterAssignment::from_labels(vec![0; 4]);
        let centers = vec![center(0, 0.0, 0.0, 4)];
        assert!(matches!(
            ZoneAggregator::new(["speed"]).aggregate(&ds, &assignment, &centers),
            Err(ZoneError::UnknownColumn(name)) if name == "speed"
        ));
    }

    #[test]
    fn test_aggregate_is_idempotent() {
        let ds = dataset();
        let assignment = ClusterAssignment::from_labels(vec![1, 0, 1, 0]);
        let centers = vec![center(0, 1.0, 1.0, 2), center(1, 2.0, 2.0, 2)];
        let agg = ZoneAggregator::for_dataset(&ds);

        let a = agg.aggregate(&ds, &assignment, &centers).unwrap();
        let b = agg.aggregate(&ds, &assignment, &centers).unwrap();
        assert_eq!(a, b);
    }
}
