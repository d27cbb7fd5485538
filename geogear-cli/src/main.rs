use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use geogear::prov::dot::Direction;
use geogear::tools::Statistic;
use geogear::{
    BaseDocument, Dispatcher, Document, ExportFormat, Exporter, Geoprocessing, HttpLayerSource,
    LayerSpec, Recorder, SagaGdal, StageConfig, StageKind, Workspace,
};
use rayon::ThreadPoolBuilder;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the stages of a configuration file and export their provenance
    Run(RunArgs),
    /// Build the analysis grid and grid index from a mask layer
    Grid(GridArgs),
    /// Summarise the stage output grids with SAGA grid statistics
    Stats(StatsArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Workspace root holding input/, analysis/ and output/
    #[arg(short, long, value_name = "DIR")]
    workspace: PathBuf,

    /// Stage configuration (JSON)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// PROV-JSON document of an earlier run to extend
    #[arg(long, value_name = "PROV_JSON")]
    base: Option<PathBuf>,

    /// Export format (PNG, PDF, JSON, XML, RDF); replaces the configured list
    #[arg(short = 'f', long = "format", value_name = "FORMAT", value_parser = parse_format)]
    formats: Vec<ExportFormat>,

    /// Graph layout direction for PNG/PDF exports
    #[arg(long, default_value = "BT", value_parser = parse_direction)]
    direction: Direction,

    /// Worker threads for table conversion (default: CPU cores)
    #[arg(short, long)]
    threads: Option<usize>,
}

#[derive(Args, Debug)]
struct GridArgs {
    #[arg(short, long, value_name = "DIR")]
    workspace: PathBuf,

    /// Mask layer: a file name in input/ or a path to copy from
    #[arg(short, long, value_name = "FILE")]
    mask: PathBuf,

    /// Grid cell size in mask CRS units
    #[arg(short, long)]
    cell_size: f64,

    /// Source URL of the mask layer
    #[arg(long)]
    url: Option<String>,

    #[arg(short = 'f', long = "format", value_name = "FORMAT", value_parser = parse_format)]
    formats: Vec<ExportFormat>,

    #[arg(long, default_value = "BT", value_parser = parse_direction)]
    direction: Direction,
}

#[derive(Args, Debug)]
struct StatsArgs {
    #[arg(short, long, value_name = "DIR")]
    workspace: PathBuf,

    /// Statistics table to write
    #[arg(short, long, value_name = "FILE")]
    output: PathBuf,

    /// Statistic to compute (mean, min, max, stddev, ...); all when omitted
    #[arg(short, long = "measure", value_name = "NAME", value_parser = parse_statistic)]
    measures: Vec<Statistic>,
}

fn parse_format(s: &str) -> Result<ExportFormat, String> {
    s.parse::<ExportFormat>().map_err(|e| e.to_string())
}

fn parse_direction(s: &str) -> Result<Direction, String> {
    s.parse::<Direction>().map_err(|e| e.to_string())
}

fn parse_statistic(s: &str) -> Result<Statistic, String> {
    Statistic::from_name(s).ok_or_else(|| format!("unknown statistic '{s}'"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let start_time = Instant::now();

    match cli.command {
        Command::Run(args) => run(args)?,
        Command::Grid(args) => grid(args)?,
        Command::Stats(args) => stats(args)?,
    }

    let elapsed = start_time.elapsed();
    info!("Total processing time: {:?}", elapsed);

    Ok(())
}

fn run(args: RunArgs) -> Result<()> {
    if let Some(threads) = args.threads {
        ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("Failed to build thread pool")?;
    }

    let config = StageConfig::from_path(&args.config)
        .with_context(|| format!("Failed to load configuration {:?}", args.config))?;
    let formats: BTreeSet<ExportFormat> = if args.formats.is_empty() {
        config.export.clone()
    } else {
        args.formats.into_iter().collect()
    };

    let workspace = Workspace::new(&args.workspace);
    let tools = SagaGdal::from_env();
    let source = HttpLayerSource::new()?;
    let exporter = Exporter::from_env().with_direction(args.direction);
    let base = match args.base {
        Some(path) => BaseDocument::File(path),
        None => BaseDocument::Fresh,
    };

    info!("Processing workspace: {:?}", workspace.root());
    let report = Dispatcher::new(&tools, &source, exporter).run(&config, &workspace, base, &formats)?;

    for stage in &report.stages {
        info!(
            "{}: {:?} ({} skipped)",
            stage.stage,
            stage.table,
            stage.skipped.len()
        );
    }
    for path in &report.exported {
        info!("Written: {:?}", path);
    }

    if report.is_complete() {
        return Ok(());
    }
    for failed in &report.failed {
        error!("Failed to record {}: {}", failed.stage, failed.error);
    }
    for failed in &report.export_failures {
        error!("Failed to export {}: {}", failed.format, failed.error);
    }
    anyhow::bail!(
        "{} stages failed, {} formats not exported",
        report.failed.len(),
        report.export_failures.len()
    )
}

fn grid(args: GridArgs) -> Result<()> {
    if !(args.cell_size.is_finite() && args.cell_size > 0.0) {
        anyhow::bail!("Cell size must be positive");
    }

    let workspace = Workspace::new(&args.workspace);
    let filename = args
        .mask
        .file_name()
        .and_then(|s| s.to_str())
        .context("Mask must name a file")?
        .to_string();
    let url = match args.url {
        Some(url) => url,
        None if args.mask.exists() && !same_file(&args.mask, &workspace.input_dir().join(&filename)) => {
            args.mask.to_string_lossy().into_owned()
        }
        None => String::new(),
    };

    let tools = SagaGdal::from_env();
    let source = HttpLayerSource::new()?;
    let recorder = Recorder::new(&tools, &source, &workspace, "", args.cell_size);
    let recorded = recorder.record_stage(StageKind::Grid, &[LayerSpec::new(filename, url)])?;
    info!("Written grid index: {:?}", recorded.table);

    if !args.formats.is_empty() {
        let document = geogear::merge(Document::with_geo_namespaces(), [recorded.document]);
        let formats: BTreeSet<ExportFormat> = args.formats.into_iter().collect();
        let exporter = Exporter::from_env().with_direction(args.direction);
        let exported = exporter.export(&document, &workspace, &formats);
        for path in &exported.written {
            info!("Written: {:?}", path);
        }
        if !exported.is_complete() {
            for failed in &exported.failed {
                error!("Failed to export {}: {}", failed.format, failed.error);
            }
            anyhow::bail!("{} formats not exported", exported.failed.len());
        }
    }

    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn stats(args: StatsArgs) -> Result<()> {
    let workspace = Workspace::new(&args.workspace);

    let mut grids = Vec::new();
    for stage in StageKind::ALL {
        let dir = workspace.stage_dir(stage);
        if !dir.is_dir() {
            continue;
        }
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("tif") {
                grids.push(path);
            }
        }
    }
    grids.sort();

    if grids.is_empty() {
        warn!("No grids under {:?}", workspace.output_dir());
        anyhow::bail!("Nothing to summarise");
    }
    info!("Found {} grids", grids.len());

    let measures = if args.measures.is_empty() {
        Statistic::ALL.to_vec()
    } else {
        args.measures
    };

    let tools = SagaGdal::from_env();
    let table = tools.grid_statistics(&grids, &args.output, &measures)?;
    info!("Written: {:?}", table);

    Ok(())
}
