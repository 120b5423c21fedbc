//! Wagon Track Summary CLI
//!
//! Usage:
//!   wagon-tracks --input data/02_211203_TUDA_data.csv --countries data/countries.geojson \
//!                --segment-column loading_state --output data/tracks.csv

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wagon_tracks::{summarize_tracks, write_tracks_csv, TrackConfig, TIMESTAMP_COLUMN, WAGON_ID};
use zone_clustering::{country, dataset, CountryResolver, DEFAULT_MAX_DROPPED_FRACTION};

#[derive(Parser, Debug)]
#[command(name = "wagon-tracks", about = "Per-wagon travelled distance and typical position")]
struct Args {
    /// Input CSV (latitude, longitude, wagon id)
    #[arg(short, long)]
    input: PathBuf,

    /// Output CSV
    #[arg(short, long, default_value = "tracks.csv")]
    output: PathBuf,

    /// Column identifying the wagon
    #[arg(long, default_value = WAGON_ID)]
    id_column: String,

    /// Column ordering fixes in time
    #[arg(long, default_value = TIMESTAMP_COLUMN)]
    order_column: String,

    /// Keep input order instead of sorting by --order-column
    #[arg(long)]
    unordered: bool,

    /// Column whose changes break a track into separate legs
    #[arg(long)]
    segment_column: Option<String>,

    /// Country polygons (GeoJSON FeatureCollection)
    #[arg(long)]
    countries: Option<PathBuf>,

    /// Abort when more than this share of records is malformed
    #[arg(long, default_value_t = DEFAULT_MAX_DROPPED_FRACTION)]
    max_dropped_fraction: f64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    let mut config = TrackConfig::new(&args.id_column);
    if !args.unordered {
        config = config.ordered_by(&args.order_column);
    }
    if let Some(segment) = &args.segment_column {
        config = config.segmented_by(segment);
    }

    let resolver = match &args.countries {
        Some(path) => {
            let polygons = country::load_geojson_file(path).with_context(|| format!("loading {:?}", path))?;
            Some(CountryResolver::build(polygons)?)
        }
        None => None,
    };

    let mut text_columns = vec![args.id_column.as_str()];
    text_columns.extend(args.segment_column.as_deref());
    let ingested = dataset::ingest_csv_with_text_columns(&args.input, args.max_dropped_fraction, &text_columns)
        .with_context(|| format!("ingesting {:?}", args.input))?;
    let tracks = summarize_tracks(&ingested.dataset, &config, resolver.as_ref())?;

    write_tracks_csv(BufWriter::new(File::create(&args.output)?), &tracks)?;
    info!("Wrote {} tracks to {:?}", tracks.len(), args.output);

    Ok(())
}
