#![forbid(unsafe_code)]

//! `dets` command surface: configuration, logging and the subcommands that drive the
//! loader, job runner, archival manager and exporter.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use dets_domain::{
    format_rfc3339, DateTimeUtc, ExternalConnection, ExternalConnections, JobId, JobRecord,
    PipelineRecord, StepDefRecord,
};
use dets_pipeline::load_definition_from_path;
use dets_runner::{
    export_step_records, ArchivalManager, ExportRequest, JobOptions, JobRunner, PipelineLoader,
};
use dets_steps::{Catalog, OutputFormat};
use dets_store_core::PipelineStore;
use dets_store_sqlite::SqlitePipelineStore;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dets")]
#[command(about = "Data extract, transform and score pipeline runner")]
pub struct Cli {
    #[arg(long, global = true, default_value = "./config.json")]
    pub config: PathBuf,

    /// Log filter directive; overrides RUST_LOG.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create or upgrade the database schema.
    InitSchema,
    ListPipelines,
    ListPipelineSteps(PipelineArgs),
    /// Register a pipeline from a JSON or YAML definition file.
    LoadPipeline(LoadPipelineArgs),
    RunPipeline(RunPipelineArgs),
    ArchivePipeline(ArchivePipelineArgs),
    /// Write one step's records to `{pipeline}__{step}__{job}.json`.
    Export(ExportArgs),
    ListJobs,
}

#[derive(Debug, Args)]
pub struct PipelineArgs {
    #[arg(long)]
    pub pipeline: String,
}

#[derive(Debug, Args)]
pub struct LoadPipelineArgs {
    #[arg(long)]
    pub pipeline: String,
    #[arg(long)]
    pub definition: PathBuf,
    /// Replace an existing pipeline, keeping the old one under a timestamped name.
    #[arg(long)]
    pub update: bool,
}

#[derive(Debug, Args)]
pub struct RunPipelineArgs {
    /// Repeat to run several pipelines as one job.
    #[arg(long, required = true)]
    pub pipeline: Vec<String>,
    #[arg(long)]
    pub job_name: Option<String>,
    /// Commit partial state when a step fails.
    #[arg(long)]
    pub debug: bool,
}

#[derive(Debug, Args)]
pub struct ArchivePipelineArgs {
    #[arg(long)]
    pub pipeline: String,
    /// Restrict archival to these step numbers; repeatable.
    #[arg(long = "step-number")]
    pub step_numbers: Vec<i64>,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    #[arg(long)]
    pub pipeline: String,
    #[arg(long)]
    pub job_id: Option<i64>,
    #[arg(long)]
    pub step_number: Option<i64>,
    #[arg(long, default_value = ".")]
    pub directory: PathBuf,
    /// One JSON object per line instead of a pretty array.
    #[arg(long)]
    pub json_lines: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    database_path: PathBuf,
    #[serde(default)]
    data_directory: Option<PathBuf>,
    #[serde(default)]
    external_connections: ExternalConnections,
}

/// Resolved runtime configuration. Relative paths are anchored at the config file's
/// directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_path: PathBuf,
    pub data_directory: PathBuf,
    pub external_connections: ExternalConnections,
}

impl Config {
    /// # Errors
    /// Returns an error when the file is missing, is not valid JSON, or carries
    /// unknown keys.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let file: ConfigFile = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;

        let base = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let resolve = |candidate: &Path| -> PathBuf {
            if candidate.is_absolute() {
                candidate.to_path_buf()
            } else {
                base.join(candidate)
            }
        };

        let external_connections = file
            .external_connections
            .into_iter()
            .map(|(name, connection)| {
                let ExternalConnection::Sqlite { path } = connection;
                (
                    name,
                    ExternalConnection::Sqlite {
                        path: resolve(&path),
                    },
                )
            })
            .collect();
        Ok(Self {
            database_path: resolve(&file.database_path),
            data_directory: file
                .data_directory
                .as_deref()
                .map_or_else(|| base.to_path_buf(), &resolve),
            external_connections,
        })
    }
}

/// Install the stderr log subscriber. `level` wins over `RUST_LOG`; the default is `info`.
pub fn init_logging(level: Option<&str>) {
    let builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());
    let filter = match level {
        Some(directives) => builder.parse_lossy(directives),
        None => builder.from_env_lossy(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Load the configuration, open and migrate the store, and run the parsed command.
///
/// # Errors
/// Returns an error when configuration, persistence, or the command itself fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)?;
    let store = SqlitePipelineStore::open(&config.database_path)?;
    store.migrate()?;
    let catalog = Catalog::with_builtins();
    run_command(cli.command, &config, &store, &catalog)
}

/// Run one command against an already migrated store.
///
/// # Errors
/// Returns an error when the command fails.
pub fn run_command(
    command: Command,
    config: &Config,
    store: &dyn PipelineStore,
    catalog: &Catalog,
) -> Result<()> {
    match command {
        Command::InitSchema => {
            tracing::info!(database = %config.database_path.display(), "schema ready");
            print_line(&json!({"database_path": config.database_path, "status": "ready"}))
        }
        Command::ListPipelines => {
            for pipeline in store.list_pipelines()? {
                print_line(&pipeline_json(&pipeline)?)?;
            }
            Ok(())
        }
        Command::ListPipelineSteps(args) => {
            let pipeline = store
                .find_pipeline(&args.pipeline)?
                .ok_or_else(|| anyhow!("unknown pipeline '{}'", args.pipeline))?;
            for step in store.list_step_defs(pipeline.id)? {
                print_line(&step_json(&step))?;
            }
            Ok(())
        }
        Command::LoadPipeline(args) => {
            let definition = load_definition_from_path(&args.definition)?;
            let loader = PipelineLoader::new(store, catalog);
            let loaded = if args.update {
                loader.update_pipeline(&args.pipeline, &definition)?
            } else {
                loader.load_pipeline(&args.pipeline, &definition)?
            };
            print_pretty(&json!({
                "pipeline": pipeline_json(&loaded.pipeline)?,
                "steps": loaded.step_count,
                "source_format": definition.source_format.as_str(),
                "retired_as": loaded.retired_as,
            }))
        }
        Command::RunPipeline(args) => {
            let options = JobOptions {
                job_name: args.job_name,
                working_directory: config.data_directory.clone(),
                external_connections: config.external_connections.clone(),
                debug: args.debug,
            };
            let report = JobRunner::new(store, catalog).run_job(&args.pipeline, &options)?;
            print_pretty(&serde_json::to_value(&report)?)
        }
        Command::ArchivePipeline(args) => {
            let step_numbers: BTreeSet<i64> = args.step_numbers.into_iter().collect();
            let filter = (!step_numbers.is_empty()).then_some(&step_numbers);
            let report = ArchivalManager::new(store).archive_steps(&args.pipeline, filter)?;
            print_pretty(&serde_json::to_value(&report)?)
        }
        Command::Export(args) => {
            let request = ExportRequest {
                pipeline_name: args.pipeline,
                job_id: args.job_id.map(JobId),
                step_number: args.step_number,
                directory: args.directory,
                format: if args.json_lines {
                    OutputFormat::JsonLines
                } else {
                    OutputFormat::JsonArray
                },
            };
            let report = export_step_records(store, &request)?;
            print_pretty(&serde_json::to_value(&report)?)
        }
        Command::ListJobs => {
            for job in store.list_jobs()? {
                print_line(&job_json(&job)?)?;
            }
            Ok(())
        }
    }
}

fn print_line(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn print_pretty(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn timestamp(value: Option<DateTimeUtc>) -> Result<Value> {
    Ok(match value {
        Some(value) => Value::String(format_rfc3339(value)?),
        None => Value::Null,
    })
}

fn pipeline_json(pipeline: &PipelineRecord) -> Result<Value> {
    Ok(json!({
        "id": pipeline.id,
        "name": pipeline.name,
        "definition_hash": pipeline.definition_hash,
        "created_at": format_rfc3339(pipeline.created_at)?,
    }))
}

fn step_json(step: &StepDefRecord) -> Value {
    json!({
        "id": step.id,
        "step_number": step.step_number,
        "name": step.name,
        "data_transformation_class": step.class_name,
        "parameters": step.parameters,
        "description": step.description,
    })
}

fn job_json(job: &JobRecord) -> Result<Value> {
    Ok(json!({
        "id": job.id,
        "name": job.name,
        "status": job.status.as_str(),
        "started_at": timestamp(job.started_at)?,
        "ended_at": timestamp(job.ended_at)?,
        "is_active": job.is_active,
        "is_latest": job.is_latest,
    }))
}
