//! Wagon Zone Clustering CLI
//!
//! Clusters each input CSV into zones and writes one zone table per input.
//!
//! Usage:
//!   cluster-zones --input data/GNSSPreProcessed_17.csv --input data/GNSSPreProcessed_18.csv \
//!                 -k 3000 --mode streaming --batch-size 32768 --seed 42 \
//!                 --countries data/countries.geojson --output-dir data/zones

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use zone_clustering::dataset::{self, Ingested, PointDataset};
use zone_clustering::export::{self, RunMetadata};
use zone_clustering::quality::{self, LatencyColumns, PositionSource, DEFAULT_MAX_HDOP, DETERMINATION_COLUMN};
use zone_clustering::{
    country, ClusterMode, CountryResolver, Pipeline, PipelineConfig, Stage, DEFAULT_MAX_DROPPED_FRACTION,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Exact,
    Streaming,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Source {
    Gnss,
    Cellular,
}

impl From<Source> for PositionSource {
    fn from(source: Source) -> Self {
        match source {
            Source::Gnss => PositionSource::Gnss,
            Source::Cellular => PositionSource::Cellular,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "cluster-zones",
    about = "Cluster wagon GNSS fixes into zones with per-zone quality statistics"
)]
struct Args {
    /// Input CSV files (header row with latitude, longitude)
    #[arg(short, long, required = true, num_args = 1..)]
    input: Vec<PathBuf>,

    /// Directory for zone tables and reports
    #[arg(short, long, default_value = "zones")]
    output_dir: PathBuf,

    /// Pipeline configuration JSON; replaces the clustering flags below
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of clusters
    #[arg(short)]
    k: Option<usize>,

    /// Clustering mode
    #[arg(long, value_enum, default_value_t = Mode::Exact)]
    mode: Mode,

    /// Batch size (streaming mode)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Seed for centroid initialization
    #[arg(long)]
    seed: Option<u64>,

    /// Abort an input when more than this share of records is malformed
    #[arg(long, default_value_t = DEFAULT_MAX_DROPPED_FRACTION)]
    max_dropped_fraction: f64,

    /// Country polygons (GeoJSON FeatureCollection); enables country resolution
    #[arg(long)]
    countries: Option<PathBuf>,

    /// Leave records outside every country out of the record table
    #[arg(long)]
    drop_unknown: bool,

    /// Keep only fixes positioned this way
    #[arg(long, value_enum)]
    position_source: Option<Source>,

    /// Column holding the positioning method code
    #[arg(long, default_value = DETERMINATION_COLUMN)]
    determination_column: String,

    /// Derive the quality column from this HDOP column before clustering
    #[arg(long, conflicts_with = "latency_quality")]
    hdop_column: Option<String>,

    /// Largest HDOP kept when deriving quality
    #[arg(long, default_value_t = DEFAULT_MAX_HDOP)]
    max_hdop: f64,

    /// Derive the quality column from measure/transfer/receive timestamps
    #[arg(long)]
    latency_quality: bool,

    /// Cluster all inputs together instead of one run per file
    #[arg(long)]
    merge: bool,

    /// Also write the per-record table (requires --countries)
    #[arg(long)]
    records: bool,

    /// Also write GeoJSON zones
    #[arg(long)]
    geojson: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_json_file(path)
                .with_context(|| format!("reading pipeline config {:?}", path))?,
            None => {
                let Some(k) = self.k else {
                    bail!("-k is required without --config");
                };
                let Some(seed) = self.seed else {
                    bail!("--seed is required without --config");
                };
                let mode = match (self.mode, self.batch_size) {
                    (Mode::Exact, _) => ClusterMode::Exact,
                    (Mode::Streaming, Some(batch_size)) => ClusterMode::Streaming { batch_size },
                    (Mode::Streaming, None) => bail!("--batch-size is required in streaming mode"),
                };
                PipelineConfig::new(k, mode, seed).max_dropped_fraction(self.max_dropped_fraction)
            }
        };
        if self.countries.is_some() {
            config.with_country = true;
        }
        if self.drop_unknown {
            config.drop_unknown_country = true;
        }
        config.validate()?;
        Ok(config)
    }

    fn ingest(&self, path: &Path, max_dropped_fraction: f64) -> Result<Ingested> {
        let mut ingested = dataset::ingest_csv(path, max_dropped_fraction)
            .map_err(|e| e.at(Stage::Ingest))
            .with_context(|| format!("ingesting {:?}", path))?;

        if let Some(source) = self.position_source {
            ingested.dataset =
                quality::filter_position_source(&ingested.dataset, &self.determination_column, source.into())
                    .map_err(|e| e.at(Stage::Ingest))?;
        }
        if let Some(column) = &self.hdop_column {
            ingested.dataset = quality::derive_signal_quality(&ingested.dataset, column, self.max_hdop)
                .map_err(|e| e.at(Stage::Ingest))?;
        }
        if self.latency_quality {
            ingested.dataset = quality::derive_latency_quality(&ingested.dataset, &LatencyColumns::default())
                .map_err(|e| e.at(Stage::Ingest))?;
        }
        Ok(ingested)
    }
}

fn write_outputs(
    args: &Args,
    name: &str,
    config: &PipelineConfig,
    report: &zone_clustering::ZoneReport,
) -> Result<()> {
    let output = |suffix: &str| args.output_dir.join(format!("{name}_{suffix}"));

    export::write_summaries_file(output("zones.csv"), &report.summaries)?;

    if args.records {
        match &report.enriched {
            Some(records) => export::write_enriched_file(output("records.csv"), records)?,
            None => bail!("--records requires --countries"),
        }
    }

    let metadata = RunMetadata::new(name, config, report);

    if args.geojson {
        let path = output("zones.geojson");
        info!("Writing GeoJSON to {:?}", path);
        let geojson = export::zones_to_geojson(&report.summaries, &metadata);
        serde_json::to_writer_pretty(BufWriter::new(File::create(&path)?), &geojson)?;
    }

    let path = output("report.json");
    serde_json::to_writer_pretty(BufWriter::new(File::create(&path)?), &metadata)?;

    info!(
        "{}: {} zones, {} of {} records dropped",
        name,
        report.summaries.len(),
        report.dropped_records,
        report.total_records
    );
    Ok(())
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string())
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    info!("{}", "=".repeat(60));
    info!("Wagon Zone Clustering");
    info!("{}", "=".repeat(60));

    let config = args.pipeline_config()?;
    let mut pipeline = Pipeline::new(config.clone())?;

    if let Some(path) = &args.countries {
        let polygons = country::load_geojson_file(path).with_context(|| format!("loading {:?}", path))?;
        pipeline = pipeline.with_resolver(Arc::new(CountryResolver::build(polygons)?));
    }

    fs::create_dir_all(&args.output_dir)?;

    if args.merge {
        let mut datasets = Vec::with_capacity(args.input.len());
        let (mut dropped, mut total) = (0, 0);
        for path in &args.input {
            let ingested = args.ingest(path, config.max_dropped_fraction)?;
            dropped += ingested.dropped;
            total += ingested.total;
            datasets.push(ingested.dataset);
        }
        let merged = Ingested {
            dataset: PointDataset::concat(datasets)?,
            dropped,
            total,
        };
        info!("Merged {} inputs into {} records", args.input.len(), merged.dataset.len());

        let report = pipeline.run_ingested(merged)?;
        write_outputs(&args, "merged", &config, &report)?;
    } else {
        for path in &args.input {
            let ingested = args.ingest(path, config.max_dropped_fraction)?;
            let report = pipeline
                .run_ingested(ingested)
                .with_context(|| format!("clustering {:?}", path))?;
            write_outputs(&args, &file_stem(path), &config, &report)?;
        }
    }

    info!("{}", "=".repeat(60));
    info!("Done: outputs in {:?}", args.output_dir);

    Ok(())
}
