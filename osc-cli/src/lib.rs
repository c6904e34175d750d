//! Command-line interface wiring the osmChange → adiff → transition-CSV
//! pipeline together (spec.md §4.9, SPEC_FULL.md §4.9–4.10).
#![forbid(unsafe_code)]

mod error;
mod init;

pub use error::CliError;

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::LevelFilter;
use osc_api::HttpOsmApiClient;
use osc_core::{RegionLocator, TagKindMatcher};
use osc_pipeline::{AdiffBuilder, TransitionExtractor};
use osc_store::WatchedObjectStore;

const DEFAULT_DB_PATH: &str = "watched_objects.sqlite3";
const DEFAULT_API_BASE: &str = "https://api.openstreetmap.org/api/0.6";

/// Runs the `osc` CLI against the current process arguments and
/// environment, returning the process exit code.
pub fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("{err}");
            return CliError::ArgumentParsing(err).exit_code();
        }
    };
    init_logging(cli.verbose);

    match execute(cli.command) {
        Ok(()) => 0,
        Err(err) => {
            log::error!("{err}");
            eprintln!("osc: {err}");
            err.exit_code()
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init()
        .ok();
}

#[derive(Debug, Parser)]
#[command(name = "osc", about = "osmChange -> augmented-diff -> transition CSV pipeline", version)]
struct Cli {
    /// Increase logging verbosity; repeatable (0=warn, 1=info, 2+=debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Seed the Watched-Object Store from an initial `.osm.pbf` snapshot.
    Init(StoreArgs),
    /// Build an augmented diff from an osmChange stream.
    Build(BuildArgs),
    /// Extract tag-kind transition rows from an augmented diff.
    Extract(ExtractArgs),
}

/// Arguments shared by every subcommand that opens the Watched-Object
/// Store, Tag-Kind Matcher, and Region Locator.
#[derive(Debug, Parser)]
struct StoreArgs {
    /// Source `.osm.pbf` snapshot.
    input: PathBuf,

    /// Tag-rule file (spec.md §6.4).
    #[arg(short = 't', long)]
    tags: Option<PathBuf>,

    /// Region CSV file (spec.md §6.5).
    #[arg(short = 'r', long)]
    regions: Option<PathBuf>,

    /// Watched-Object Store SQLite path.
    #[arg(short = 'd', long, default_value = DEFAULT_DB_PATH)]
    database: PathBuf,
}

#[derive(Debug, Parser)]
struct BuildArgs {
    /// Source osmChange file (optionally gzip-compressed).
    input: PathBuf,

    /// Destination augmented-diff file.
    #[arg(short = 'a', long)]
    adiff: PathBuf,

    /// Tag-rule file (spec.md §6.4).
    #[arg(short = 't', long)]
    tags: Option<PathBuf>,

    /// Region CSV file (spec.md §6.5).
    #[arg(short = 'r', long)]
    regions: Option<PathBuf>,

    /// Watched-Object Store SQLite path.
    #[arg(short = 'd', long, default_value = DEFAULT_DB_PATH)]
    database: PathBuf,

    /// OSM API base URL.
    #[arg(long, default_value = DEFAULT_API_BASE)]
    api_base: String,
}

#[derive(Debug, Parser)]
struct ExtractArgs {
    /// Source augmented-diff file.
    adiff: PathBuf,

    /// Destination CSV file; defaults to stdout.
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Tag-rule file (spec.md §6.4).
    #[arg(short = 't', long)]
    tags: Option<PathBuf>,

    /// Region CSV file (spec.md §6.5).
    #[arg(short = 'r', long)]
    regions: Option<PathBuf>,
}

fn execute(command: Command) -> Result<(), CliError> {
    match command {
        Command::Init(args) => run_init(&args),
        Command::Build(args) => run_build(&args),
        Command::Extract(args) => run_extract(&args),
    }
}

fn load_matcher(path: Option<&PathBuf>) -> Result<TagKindMatcher, CliError> {
    let Some(path) = path else {
        return Ok(TagKindMatcher::default());
    };
    let file = open_reader(path)?;
    TagKindMatcher::load(file).map_err(|source| CliError::LoadMatcher {
        path: path.clone(),
        source,
    })
}

fn load_regions(path: Option<&PathBuf>) -> Result<RegionLocator, CliError> {
    let Some(path) = path else {
        return Ok(RegionLocator::empty());
    };
    let file = open_reader(path)?;
    let mut reader = csv::ReaderBuilder::new().has_headers(false).from_reader(file);
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|source| CliError::ReadRegionCsv {
            path: path.clone(),
            source,
        })?;
        rows.push(record.iter().map(ToOwned::to_owned).collect::<Vec<String>>());
    }
    RegionLocator::load(rows).map_err(|source| CliError::LoadRegions {
        path: path.clone(),
        source,
    })
}

fn open_reader(path: &PathBuf) -> Result<BufReader<File>, CliError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| CliError::OpenInput {
            path: path.clone(),
            source,
        })
}

fn create_writer(path: &PathBuf) -> Result<BufWriter<File>, CliError> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|source| CliError::CreateOutput {
            path: path.clone(),
            source,
        })
}

fn run_init(args: &StoreArgs) -> Result<(), CliError> {
    let matcher = load_matcher(args.tags.as_ref())?;
    let regions = load_regions(args.regions.as_ref())?;
    let store = WatchedObjectStore::open(&args.database)?;
    let summary = init::seed_from_pbf(&args.input, &matcher, &regions, &store)?;
    log::info!(
        "seeded {} objects ({} nodes, {} ways) from {:?}",
        summary.nodes + summary.ways,
        summary.nodes,
        summary.ways,
        args.input
    );
    Ok(())
}

fn run_build(args: &BuildArgs) -> Result<(), CliError> {
    let matcher = load_matcher(args.tags.as_ref())?;
    let regions = load_regions(args.regions.as_ref())?;
    let store = WatchedObjectStore::open(&args.database)?;
    let api = HttpOsmApiClient::new(args.api_base.clone())?;
    let builder = AdiffBuilder::new(&matcher, &regions, &store, &api);

    let input = open_reader(&args.input)?;
    let output = create_writer(&args.adiff)?;
    builder.process_osc(input, output)?;
    Ok(())
}

fn run_extract(args: &ExtractArgs) -> Result<(), CliError> {
    let matcher = load_matcher(args.tags.as_ref())?;
    let regions = load_regions(args.regions.as_ref())?;
    let adiff_xml = std::fs::read_to_string(&args.adiff).map_err(|source| CliError::OpenInput {
        path: args.adiff.clone(),
        source,
    })?;

    let extractor = TransitionExtractor::new(&matcher, &regions);
    let rows = extractor.extract(&adiff_xml)?;

    let mut writer = match &args.output {
        Some(path) => csv::Writer::from_writer(Box::new(create_writer(path)?) as Box<dyn std::io::Write>),
        None => csv::Writer::from_writer(Box::new(std::io::stdout()) as Box<dyn std::io::Write>),
    };
    writer.write_record([
        "ts", "action", "obj_action", "kind", "changeset", "uid", "username", "osm_id", "version",
        "prev_id", "region", "lat", "lon", "length",
    ])?;
    for row in rows {
        writer.write_record([
            row.ts,
            row.action,
            row.obj_action,
            row.kind,
            row.changeset.to_string(),
            row.uid.to_string(),
            row.username,
            row.osm_id,
            row.version.to_string(),
            row.prev_id.map_or_else(String::new, |v| v.to_string()),
            row.region.unwrap_or_default(),
            row.lat.to_string(),
            row.lon.to_string(),
            row.length.map_or_else(String::new, |v| v.to_string()),
        ])?;
    }
    writer.flush().map_err(|source| CliError::CreateOutput {
        path: args.output.clone().unwrap_or_default(),
        source,
    })?;
    Ok(())
}
