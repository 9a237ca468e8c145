//! Subcommand implementations.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use geoflow::errors::GeoflowError;
use geoflow::exit_codes;
use geoflow::fetch::HttpSource;
use geoflow::orchestrator::{Orchestrator, RunOptions};
use geoflow::pipeline::{Force, LoadedPipeline, PipelineDefinition};
use geoflow::stages::{ProcessRunner, Satisfaction};

/// Flags of the `run` subcommand.
pub struct RunArgs {
    pub force: bool,
    pub force_stage: Vec<String>,
    pub timeout: Option<u64>,
    pub json: bool,
}

fn load(pipeline: &Path, data_dir: Option<&Path>) -> Result<LoadedPipeline, GeoflowError> {
    PipelineDefinition::load(pipeline)?.into_pipeline(data_dir)
}

fn orchestrator(loaded: LoadedPipeline) -> Result<Orchestrator> {
    let source = HttpSource::new(loaded.settings.fetch.connect_timeout())
        .context("Failed to create HTTP client")?;
    Ok(Orchestrator::new(
        loaded,
        Arc::new(source),
        Arc::new(ProcessRunner::new()),
    ))
}

/// Execute the `run` command. Returns the process exit code.
pub async fn run(pipeline: &Path, data_dir: Option<&Path>, args: RunArgs) -> Result<u8> {
    let loaded = load(pipeline, data_dir)?;
    loaded
        .pipeline
        .check_stage_names(&args.force_stage)
        .map_err(GeoflowError::from)?;

    tracing::info!(
        pipeline = loaded.pipeline.name(),
        stages = loaded.pipeline.stages().len(),
        services = loaded.pipeline.services().len(),
        data_dir = %loaded.data_dir.root().display(),
        "Pipeline validated"
    );

    let orchestrator = orchestrator(loaded)?;
    let cancel = Arc::clone(orchestrator.cancellation());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping the current step");
            cancel.cancel("interrupted");
        }
    });

    let options = RunOptions {
        force: Force::from_flags(args.force, &args.force_stage),
        readiness_timeout: args.timeout.map(Duration::from_secs),
    };
    let report = orchestrator.run(&options).await?;

    if args.json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report.render_summary());
    }
    Ok(report.exit_code())
}

/// Execute the `plan` command.
pub async fn plan(pipeline: &Path, data_dir: Option<&Path>) -> Result<u8> {
    let loaded = load(pipeline, data_dir)?;
    let name = loaded.pipeline.name().to_string();
    let orchestrator = orchestrator(loaded)?;

    println!("Plan for '{name}':");
    for (stage, satisfaction) in orchestrator.plan(Force::None).await? {
        match satisfaction {
            Satisfaction::Satisfied => println!("  skip  {stage}"),
            Satisfaction::Unsatisfied { reason } => println!("  run   {stage}  ({reason})"),
        }
    }
    Ok(exit_codes::SUCCESS)
}

/// Execute the `invalidate` command.
pub async fn invalidate(pipeline: &Path, cache: &str, data_dir: Option<&Path>) -> Result<u8> {
    let orchestrator = orchestrator(load(pipeline, data_dir)?)?;
    let record = orchestrator.invalidate(cache).await?;
    println!("Cleared cache domain '{}'.", record.domain);
    Ok(exit_codes::SUCCESS)
}
