//! Zone pipeline: ingest → cluster → aggregate → (resolve countries)

use crate::aggregate::{ZoneAggregator, ZoneSummary};
use crate::cluster::{ClusterConfig, ClusterEngine, ClusterMode};
use crate::country::{CountryResolver, UNKNOWN_COUNTRY};
use crate::dataset::{Ingested, PointDataset, Record};
use crate::{LatLon, Result, Stage, ZoneError, DEFAULT_MAX_DROPPED_FRACTION};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

fn default_max_dropped_fraction() -> f64 {
    DEFAULT_MAX_DROPPED_FRACTION
}

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub cluster: ClusterConfig,
    /// Resolve zone centroids and records to countries
    #[serde(default)]
    pub with_country: bool,
    /// Abort ingestion when more than this share of records is malformed
    #[serde(default = "default_max_dropped_fraction")]
    pub max_dropped_fraction: f64,
    /// Columns to average per zone; all numeric columns when `None`
    #[serde(default)]
    pub numeric_columns: Option<Vec<String>>,
    /// Leave records resolving to "unknown" out of the enriched output
    #[serde(default)]
    pub drop_unknown_country: bool,
}

impl PipelineConfig {
    pub fn new(k: usize, mode: ClusterMode, seed: u64) -> Self {
        Self {
            cluster: ClusterConfig {
                k,
                mode,
                seed,
                max_iter: crate::DEFAULT_MAX_ITER,
            },
            with_country: false,
            max_dropped_fraction: DEFAULT_MAX_DROPPED_FRACTION,
            numeric_columns: None,
            drop_unknown_country: false,
        }
    }

    pub fn with_country(mut self, with_country: bool) -> Self {
        self.with_country = with_country;
        self
    }

    pub fn max_dropped_fraction(mut self, fraction: f64) -> Self {
        self.max_dropped_fraction = fraction;
        self
    }

    pub fn numeric_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.numeric_columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn drop_unknown_country(mut self, drop: bool) -> Self {
        self.drop_unknown_country = drop;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.cluster.validate()?;
        if !(0.0..=1.0).contains(&self.max_dropped_fraction) {
            return Err(ZoneError::InvalidConfig(format!(
                "max_dropped_fraction must be within [0, 1], got {}",
                self.max_dropped_fraction
            )));
        }
        Ok(())
    }

    /// Read a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }
}

/// A record with its zone and country
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    /// Row index in the clustered dataset
    pub index: usize,
    #[serde(flatten)]
    pub record: Record,
    pub cluster_id: usize,
    pub country: String,
}

/// Result of one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneReport {
    /// Ascending by cluster id
    pub summaries: Vec<ZoneSummary>,
    /// Present when the run resolved countries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enriched: Option<Vec<EnrichedRecord>>,
    pub dropped_records: usize,
    pub total_records: usize,
    pub iterations: usize,
    pub converged: bool,
    pub inertia: f64,
}

/// Orchestrates clustering, aggregation and country resolution
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    engine: ClusterEngine,
    resolver: Option<Arc<CountryResolver>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let engine = ClusterEngine::new(config.cluster.clone())?;
        Ok(Self {
            config,
            engine,
            resolver: None,
        })
    }

    /// Share a loaded polygon set with this pipeline
    pub fn with_resolver(mut self, resolver: Arc<CountryResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Ingest CSV leniently, then run
    pub fn run_source<R: Read>(&self, source: R) -> Result<ZoneReport> {
        let ingested =
            PointDataset::ingest(source, self.config.max_dropped_fraction).map_err(|e| e.at(Stage::Ingest))?;
        self.run_ingested(ingested)
    }

    /// Run on a dataset that was already validated
    pub fn run(&self, dataset: PointDataset) -> Result<ZoneReport> {
        let total = dataset.len();
        self.execute(dataset, 0, total)
    }

    pub fn run_ingested(&self, ingested: Ingested) -> Result<ZoneReport> {
        self.execute(ingested.dataset, ingested.dropped, ingested.total)
    }

    fn execute(&self, dataset: PointDataset, dropped: usize, total: usize) -> Result<ZoneReport> {
        let resolver = match (self.config.with_country, &self.resolver) {
            (true, Some(r)) => Some(r.as_ref()),
            (true, None) => {
                return Err(ZoneError::InvalidConfig(
                    "with_country requires country polygons".to_string(),
                )
                .at(Stage::Resolve))
            }
            (false, _) => None,
        };
        if dataset.is_empty() {
            return Err(ZoneError::EmptyInput.at(Stage::Ingest));
        }

        let fit = self
            .engine
            .fit(dataset.coordinates())
            .map_err(|e| e.at(Stage::Cluster))?;

        let aggregator = match &self.config.numeric_columns {
            Some(columns) => ZoneAggregator::new(columns.iter().cloned()),
            None => ZoneAggregator::for_dataset(&dataset),
        };
        let mut summaries = aggregator
            .aggregate(&dataset, &fit.assignment, &fit.centers)
            .map_err(|e| e.at(Stage::Aggregate))?;

        let enriched = resolver.map(|resolver| {
            let centroids: Vec<LatLon> = summaries.iter().map(ZoneSummary::centroid).collect();
            for (summary, country) in summaries.iter_mut().zip(resolver.resolve_many(&centroids)) {
                summary.country = Some(country.to_string());
            }

            let countries = resolver.resolve_many(dataset.coordinates());
            let mut records: Vec<EnrichedRecord> = dataset
                .records()
                .zip(fit.assignment.labels())
                .zip(countries)
                .map(|((r, &cluster_id), country)| EnrichedRecord {
                    index: r.index(),
                    record: r.to_record(),
                    cluster_id,
                    country: country.to_string(),
                })
                .collect();

            if self.config.drop_unknown_country {
                let before = records.len();
                records.retain(|r| r.country != UNKNOWN_COUNTRY);
                info!("Dropped {} records outside every country", before - records.len());
            }
            records
        });

        info!(
            "Pipeline produced {} zones from {} records ({} dropped at ingest)",
            summaries.len(),
            dataset.len(),
            dropped
        );

        Ok(ZoneReport {
            summaries,
            enriched,
            dropped_records: dropped,
            total_records: total,
            iterations: fit.iterations,
            converged: fit.converged,
            inertia: fit.inertia(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::country::CountryPolygon;

    const SCENARIO: &str = "latitude,longitude,quality\n52.0,9.0,10\n52.1,9.1,20\n10.0,10.0,30\n";

    fn resolver() -> Arc<CountryResolver> {
        let germany = CountryPolygon::from_exterior(
            "Germany",
            &[
                LatLon::new(47.3, 5.9),
                LatLon::new(47.3, 15.0),
                LatLon::new(55.1, 15.0),
                LatLon::new(55.1, 5.9),
            ],
        );
        Arc::new(CountryResolver::build(vec![germany]).unwrap())
    }

    #[test]
    fn test_scenario_exact() {
        let pipeline = Pipeline::new(PipelineConfig::new(2, ClusterMode::Exact, 0)).unwrap();
        let report = pipeline.run_source(SCENARIO.as_bytes()).unwrap();

        assert_eq!(report.summaries.len(), 2);
        assert_eq!(report.summaries[0].member_count, 2);
        assert_eq!(report.summaries[0].mean("quality"), Some(15.0));
        assert_eq!(report.summaries[1].member_count, 1);
        assert_eq!(report.summaries[1].mean("quality"), Some(30.0));
        assert_eq!(report.dropped_records, 0);
        assert!(report.enriched.is_none());
    }

    #[test]
    fn test_dropped_records_are_counted() {
        let csv = "latitude,longitude,quality\n52.0,9.0,10\n152.1,9.1,20\n10.0,10.0,30\n";
        let pipeline = Pipeline::new(PipelineConfig::new(2, ClusterMode::Exact, 0)).unwrap();
        let report = pipeline.run_source(csv.as_bytes()).unwrap();
        assert_eq!(report.dropped_records, 1);
        assert_eq!(report.total_records, 3);
        assert_eq!(report.summaries.iter().map(|s| s.member_count).sum::<usize>(), 2);
    }

    #[test]
    fn test_dropped_fraction_abort() {
        let csv = "latitude,longitude\n91,0\n92,0\n93,0\n94,0\n95,0\n96,0\n1,1\n2,2\n3,3\n4,4\n";
        let pipeline = Pipeline::new(PipelineConfig::new(1, ClusterMode::Exact, 0)).unwrap();
        let err = pipeline.run_source(csv.as_bytes()).unwrap_err();

        assert!(matches!(err, ZoneError::Stage { stage: Stage::Ingest, .. }));
        assert!(matches!(
            err.root(),
            ZoneError::DroppedFractionExceeded { dropped: 6, total: 10, .. }
        ));
    }

    #[test]
    fn test_with_country_enriches_summaries_and_records() {
        let config = PipelineConfig::new(2, ClusterMode::Exact, 0).with_country(true);
        let pipeline = Pipeline::new(config).unwrap().with_resolver(resolver());
        let report = pipeline.run_source(SCENARIO.as_bytes()).unwrap();

        assert_eq!(report.summaries[0].country.as_deref(), Some("Germany"));
        assert_eq!(report.summaries[1].country.as_deref(), Some(UNKNOWN_COUNTRY));

        let enriched = report.enriched.unwrap();
        assert_eq!(enriched.len(), 3);
        assert_eq!(enriched[0].country, "Germany");
        assert_eq!(enriched[2].country, UNKNOWN_COUNTRY);
        assert_eq!(enriched[2].cluster_id, 1);
        assert_eq!(enriched[1].record.quality, Some(20.0));
    }

    #[test]
    fn test_drop_unknown_country() {
        let config = PipelineConfig::new(2, ClusterMode::Exact, 0)
            .with_country(true)
            .drop_unknown_country(true);
        let pipeline = Pipeline::new(config).unwrap().with_resolver(resolver());
        let enriched = pipeline.run_source(SCENARIO.as_bytes()).unwrap().enriched.unwrap();
        assert_eq!(enriched.len(), 2);
        assert!(enriched.iter().all(|r| r.country == "Germany"));
    }

    #[test]
    fn test_with_country_requires_resolver() {
        let config = PipelineConfig::new(2, ClusterMode::Exact, 0).with_country(true);
        let err = Pipeline::new(config).unwrap().run_source(SCENARIO.as_bytes()).unwrap_err();
        assert!(matches!(err, ZoneError::Stage { stage: Stage::Resolve, .. }));
    }

    #[test]
    fn test_cluster_stage_error_is_tagged() {
        let pipeline = Pipeline::new(PipelineConfig::new(5, ClusterMode::Exact, 0)).unwrap();
        let err = pipeline.run_source(SCENARIO.as_bytes()).unwrap_err();
        assert!(matches!(err, ZoneError::Stage { stage: Stage::Cluster, .. }));
        assert!(matches!(err.root(), ZoneError::InsufficientData { k: 5, points: 3 }));
    }

    #[test]
    fn test_selected_numeric_columns() {
        let csv = "latitude,longitude,quality,hdop\n52.0,9.0,10,1\n52.1,9.1,20,3\n";
        let config = PipelineConfig::new(1, ClusterMode::Streaming { batch_size: 1 }, 3).numeric_columns(["hdop"]);
        let report = Pipeline::new(config).unwrap().run_source(csv.as_bytes()).unwrap();
        assert_eq!(report.summaries[0].means.len(), 1);
        assert_eq!(report.summaries[0].mean("hdop"), Some(2.0));
    }

    #[test]
    fn test_config_json_defaults() {
        let json = r#"{"cluster": {"k": 2000, "mode": {"mode": "exact"}, "seed": 42}}"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config, PipelineConfig::new(2000, ClusterMode::Exact, 42));
        assert_eq!(config.max_dropped_fraction, 0.5);
    }

    #[test]
    fn test_invalid_fraction() {
        let config = PipelineConfig::new(2, ClusterMode::Exact, 0).max_dropped_fraction(1.5);
        assert!(matches!(Pipeline::new(config).unwrap_err(), ZoneError::InvalidConfig(_)));
    }
}
