//! The `geoflow` command.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use geoflow::errors::GeoflowError;
use geoflow::exit_codes;
use geoflow::observability::{init_tracing, LogFormat};

#[derive(Parser)]
#[command(
    name = "geoflow",
    version,
    about = "Build geodata artifacts and bring up the services that use them"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log format (text or json)
    #[arg(long, default_value = "text", global = true)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, build, reconcile caches and bring services up
    Run {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Re-run every stage even if satisfied
        #[arg(long)]
        force: bool,
        /// Re-run the named stage even if satisfied (repeatable)
        #[arg(long = "force-stage", value_name = "NAME")]
        force_stage: Vec<String>,
        /// Readiness timeout in seconds for every service
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
        /// Data directory, overriding the definition
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show which stages would run
    Plan {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Data directory, overriding the definition
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Clear a cache domain unconditionally
    Invalidate {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Cache domain name
        cache: String,
        /// Data directory, overriding the definition
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_tracing(&cli.log_level, cli.log_format);

    let result = match cli.command {
        Commands::Run {
            pipeline,
            force,
            force_stage,
            timeout,
            data_dir,
            json,
        } => {
            let args = commands::RunArgs {
                force,
                force_stage,
                timeout,
                json,
            };
            commands::run(&pipeline, data_dir.as_deref(), args).await
        }
        Commands::Plan { pipeline, data_dir } => {
            commands::plan(&pipeline, data_dir.as_deref()).await
        }
        Commands::Invalidate {
            pipeline,
            cache,
            data_dir,
        } => commands::invalidate(&pipeline, &cache, data_dir.as_deref()).await,
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            let geoflow_err = err.downcast_ref::<GeoflowError>();
            if let Some(GeoflowError::Validation(validation)) = geoflow_err {
                if let Some(hint) = validation.error_info.as_ref().and_then(|i| i.fix_hint.as_ref()) {
                    eprintln!("hint: {hint}");
                }
            }
            ExitCode::from(geoflow_err.map_or(exit_codes::GENERAL, GeoflowError::exit_code))
        }
    }
}
