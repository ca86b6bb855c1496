//! laserfarm CLI
//!
//! Run a single point-cloud pipeline from a JSON input file, or a batch of
//! pipelines described by a YAML configuration.

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use laserfarm::io::fs::get_args_from_configfile;
use laserfarm::pipeline::serve_worker;
use laserfarm::{
    build_task, init_rayon, BatchTask, MacroConfig, PipelineKind, TaskOutcome, SAMPLE_CONFIG,
};

#[derive(Parser)]
#[command(name = "laserfarm")]
#[command(about = "Retile, process and rasterize point-cloud data", long_about = None)]
struct Cli {
    /// Rayon thread pool size for CPU work
    #[arg(long, global = true)]
    rayon_threads: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split a LAS/LAZ file into the tiles of a grid
    #[command(name = "retiling")]
    Retiling(PipelineArgs),

    /// Extract features on the target mesh of a tile
    #[command(name = "data_processing", alias = "data-processing")]
    DataProcessing(PipelineArgs),

    /// Rasterize target tiles into GeoTIFFs
    #[command(name = "geotiff_writer", alias = "geotiff-writer")]
    GeotiffWriter(PipelineArgs),

    /// Classify points with polygon files
    #[command(name = "classification")]
    Classification(PipelineArgs),

    /// Run a batch of pipelines
    Macro {
        /// Path to the batch configuration file
        #[arg(short, long, default_value = "laserfarm.yaml")]
        config: PathBuf,
    },

    /// Run one task descriptor read from stdin and reply on stdout
    Worker,

    /// Validate a batch configuration
    Validate {
        #[arg(short, long, default_value = "laserfarm.yaml")]
        config: PathBuf,
    },

    /// Generate a sample batch configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "laserfarm.yaml")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct PipelineArgs {
    /// JSON file mapping task names to their arguments
    #[arg(short, long)]
    config: PathBuf,

    /// Input file or directory, relative to the input folder
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Label of the run, used for the log file
    #[arg(short, long)]
    label: Option<String>,

    /// Tile processed (data_processing only)
    #[arg(long, num_args = 2, value_names = ["IX", "IY"])]
    tile_index: Option<Vec<u64>>,

    /// Bands to rasterize (geotiff_writer only)
    #[arg(long, num_args = 1..)]
    bands: Vec<String>,
}

fn main() -> Result<()> {
    // stdout is reserved for outcome tables and worker replies
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Retiling(args) => {
            pipeline_command(PipelineKind::Retiling, args, cli.rayon_threads)
        }
        Commands::DataProcessing(args) => {
            pipeline_command(PipelineKind::DataProcessing, args, cli.rayon_threads)
        }
        Commands::GeotiffWriter(args) => {
            pipeline_command(PipelineKind::GeotiffWriter, args, cli.rayon_threads)
        }
        Commands::Classification(args) => {
            pipeline_command(PipelineKind::Classification, args, cli.rayon_threads)
        }
        Commands::Macro { config } => macro_command(config, cli.rayon_threads),
        Commands::Worker => worker_command(cli.rayon_threads),
        Commands::Validate { config } => validate_command(config),
        Commands::GenerateConfig { output } => generate_config_command(output),
    }
}

/// Constructor arguments from the command-line options.
fn constructor_args(kind: PipelineKind, args: &PipelineArgs) -> Result<Map<String, Value>> {
    let mut ctor = Map::new();
    if let Some(input) = &args.input {
        ctor.insert(
            kind.input_arg().to_string(),
            Value::String(input.to_string_lossy().into_owned()),
        );
    }
    if let Some(tile_index) = &args.tile_index {
        if kind != PipelineKind::DataProcessing {
            bail!("--tile-index is only accepted by data_processing");
        }
        ctor.insert("tile_index".to_string(), Value::from(tile_index.clone()));
    }
    if !args.bands.is_empty() {
        if kind != PipelineKind::GeotiffWriter {
            bail!("--bands is only accepted by geotiff_writer");
        }
        ctor.insert("bands".to_string(), Value::from(args.bands.clone()));
    }
    Ok(ctor)
}

fn pipeline_command(kind: PipelineKind, args: PipelineArgs, rayon_threads: Option<usize>) -> Result<()> {
    init_rayon(rayon_threads)?;

    let ctor = constructor_args(kind, &args)?;
    let input = get_args_from_configfile(&args.config)?;
    let mut task = kind.build_with_input(args.label.clone(), ctor, input)?;

    tracing::info!("Running {} pipeline {}", kind, task.task_label());
    match task.run_task() {
        TaskOutcome::Completed => {
            tracing::info!("Pipeline {} completed", task.task_label());
            Ok(())
        }
        failed => bail!("Pipeline {} failed: {}", task.task_label(), failed.describe()),
    }
}

fn macro_command(config_path: PathBuf, rayon_threads: Option<usize>) -> Result<()> {
    let config = MacroConfig::from_file(&config_path)?;
    config.validate()?;
    init_rayon(config.rayon_threads.or(rayon_threads))?;

    let mut batch = config.build_pipeline()?;
    batch.setup_cluster(&config.cluster)?;
    let stats = batch.run();
    let shutdown = batch.shutdown();
    let stats = stats?;
    shutdown?;

    batch.print_outcome(config.outcome_file.as_deref())?;
    if let Some(path) = &config.outcome_file {
        println!("Outcome written to: {}", path.display());
    }
    if stats.failed > 0 {
        bail!("{} of {} tasks failed", stats.failed, stats.total);
    }
    Ok(())
}

fn worker_command(rayon_threads: Option<usize>) -> Result<()> {
    init_rayon(rayon_threads)?;
    let stdin = std::io::stdin().lock();
    let stdout = std::io::stdout().lock();
    let outcome = serve_worker(stdin, stdout, build_task)?;
    tracing::debug!("Worker outcome: {}", outcome.describe());
    Ok(())
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = MacroConfig::from_file(&config_path)?;
    config.validate()?;
    println!(
        "Configuration is valid: {} {} task(s) on the {} cluster",
        config.tasks.len(),
        config.kind,
        config.cluster.mode()
    );
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    std::fs::write(&output, SAMPLE_CONFIG)?;
    println!("Generated sample configuration at: {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_pipeline() {
        let cli = Cli::try_parse_from([
            "laserfarm",
            "data_processing",
            "-c",
            "input.json",
            "--input",
            "tile_1_2",
            "--tile-index",
            "1",
            "2",
        ])
        .unwrap();
        let Commands::DataProcessing(args) = cli.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(args.tile_index, Some(vec![1, 2]));
        let ctor = constructor_args(PipelineKind::DataProcessing, &args).unwrap();
        assert_eq!(ctor["input"], Value::from("tile_1_2"));
        assert!(constructor_args(PipelineKind::Retiling, &args).is_err());
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["laserfarm"]).is_err());
        assert!(Cli::try_parse_from(["laserfarm", "retiling"]).is_err());
    }

    #[test]
    fn test_cli_parse_macro_and_worker() {
        assert!(Cli::try_parse_from(["laserfarm", "macro", "-c", "batch.yaml"]).is_ok());
        assert!(Cli::try_parse_from(["laserfarm", "worker"]).is_ok());
        assert!(Cli::try_parse_from(["laserfarm", "validate", "-c", "batch.json"]).is_ok());
        assert!(Cli::try_parse_from(["laserfarm", "generate-config"]).is_ok());
    }
}
