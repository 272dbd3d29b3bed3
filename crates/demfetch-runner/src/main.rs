//! demfetch CLI
//!
//! Fetches elevation tiles for a GeoJSON polygon and writes a clipped GeoTIFF.

use clap::{Parser, Subcommand};
use demfetch_dem::Polygon;
use demfetch_runner::{JobOrchestrator, JobState, OrchestratorConfig, PipelineConfig};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "demfetch")]
#[command(about = "Fetch, cache and clip elevation rasters", long_about = None)]
struct Cli {
    /// Pipeline configuration (YAML); built-in sources when omitted
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG overrides
    #[arg(long, short, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one job and print the resulting artifact as JSON
    Run {
        /// Source name, e.g. srtm
        #[arg(long, short)]
        source: String,

        /// GeoJSON Polygon, Feature or FeatureCollection in EPSG:4326
        #[arg(long, short)]
        polygon: PathBuf,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "1800")]
        timeout_secs: u64,
    },

    /// Print the tiles a polygon needs, without downloading
    Locate {
        #[arg(long, short)]
        source: String,

        #[arg(long, short)]
        polygon: PathBuf,
    },

    /// List configured sources
    Sources,

    /// Shrink the tile cache below a size bound
    CacheEvict {
        #[arg(long)]
        max_bytes: u64,
    },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // stdout is reserved for JSON output
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn read_polygon(path: &Path) -> Result<Polygon, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    Ok(Polygon::from_geojson_str(&text)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    let config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    if let Command::Sources = cli.command {
        let listing: Vec<_> = config
            .sources
            .iter()
            .map(|(name, source)| {
                serde_json::json!({
                    "name": name,
                    "description": source.description,
                    "access": source.access,
                    "policy": source.policy,
                })
            })
            .collect();
        print_json(&listing)?;
        return Ok(0);
    }

    demfetch_metrics::describe_metrics();
    let sources = config.build_sources()?;
    let orchestrator = JobOrchestrator::start(OrchestratorConfig::from(&config), sources)?;

    match cli.command {
        Command::Run {
            source,
            polygon,
            timeout_secs,
        } => {
            let polygon = read_polygon(&polygon)?;
            let id = orchestrator.submit(polygon, &source)?;
            let status = orchestrator.wait(id, Duration::from_secs(timeout_secs))?;
            print_json(&status)?;
            Ok(match status.state {
                JobState::Complete => 0,
                JobState::Failed => 1,
                _ => {
                    error!("Job {} still {} after {}s", id, status.state, timeout_secs);
                    orchestrator.cancel(id)?;
                    2
                }
            })
        }
        Command::Locate { source, polygon } => {
            let polygon = read_polygon(&polygon)?;
            print_json(&orchestrator.locate(&polygon, &source)?)?;
            Ok(0)
        }
        Command::CacheEvict { max_bytes } => {
            print_json(&orchestrator.cache().evict_to(max_bytes)?)?;
            Ok(0)
        }
        Command::Sources => Ok(0),
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}
