//! `buildflow` command line.

use anyhow::{Context, Result};
use buildflow::errors::ValidationError;
use buildflow::events::LoggingProgressSink;
use buildflow::observability::{init_tracing, LogFormat};
use buildflow::pipeline::{Orchestrator, PipelineConfig, PipelineOptions, PipelineResult};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "buildflow")]
#[command(author, version, about = "Clone, build and verify multi-repository projects")]
struct Cli {
    /// Log output format (pretty or json)
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pipeline configuration file
    Validate {
        /// Path to the JSON configuration
        config: PathBuf,
    },
    /// Print the resolved build order without running anything
    Plan {
        /// Path to the JSON configuration
        config: PathBuf,

        /// Restrict to these components
        #[arg(long = "component")]
        components: Vec<String>,
    },
    /// Run the pipeline
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Path to the JSON configuration
    config: PathBuf,

    /// Restrict to these components
    #[arg(long = "component")]
    components: Vec<String>,

    /// Do not clone repositories
    #[arg(long)]
    skip_clone: bool,

    /// Do not run build steps
    #[arg(long)]
    skip_build: bool,

    /// Do not build container images
    #[arg(long)]
    skip_image_build: bool,

    /// Do not verify build artifacts
    #[arg(long)]
    skip_verify: bool,

    /// Remove and re-clone existing checkouts
    #[arg(long)]
    force: bool,

    /// Override the clone directory from the configuration
    #[arg(long)]
    working_directory: Option<PathBuf>,

    /// Write the JSON result to this path
    #[arg(long)]
    report: Option<PathBuf>,
}

impl RunArgs {
    fn options(&self) -> PipelineOptions {
        let mut options = PipelineOptions::new();
        for component in &self.components {
            options = options.with_component(component.clone());
        }
        if self.skip_clone {
            options = options.skip_clone();
        }
        if self.skip_build {
            options = options.skip_build();
        }
        if self.skip_image_build {
            options = options.skip_image_build();
        }
        if self.skip_verify {
            options = options.skip_verify();
        }
        if self.force {
            options = options.force();
        }
        if let Some(dir) = &self.working_directory {
            options = options.with_working_directory(dir.clone());
        }
        options
    }
}

fn load(path: &Path) -> Result<PipelineConfig> {
    PipelineConfig::load(path).with_context(|| format!("failed to load {}", path.display()))
}

fn report_invalid(err: &ValidationError) -> ExitCode {
    eprintln!("error: {err}");
    for item in &err.items {
        eprintln!("  - {item}");
    }
    ExitCode::from(2)
}

fn exit_code(result: &PipelineResult) -> ExitCode {
    if result.success {
        ExitCode::SUCCESS
    } else if result.is_invalid_configuration() {
        ExitCode::from(2)
    } else if result.phase == buildflow::core::PipelinePhase::Cancelled {
        ExitCode::from(130)
    } else {
        ExitCode::FAILURE
    }
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let config = load(&args.config)?;
    let orchestrator = Orchestrator::new(config, args.options())
        .with_sink(Arc::new(LoggingProgressSink::default()));

    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            token.cancel("cancelled by user");
        }
    });

    let result = orchestrator.run().await;
    let json = result.to_json().context("failed to serialize result")?;
    match &args.report {
        Some(path) => {
            std::fs::write(path, &json)
                .with_context(|| format!("failed to write report to {}", path.display()))?;
            info!(path = %path.display(), "Wrote report");
        }
        None => println!("{json}"),
    }
    eprintln!("{}", result.summary());
    Ok(exit_code(&result))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format, &cli.log_level).context("failed to initialize logging")?;

    match cli.command {
        Commands::Validate { config } => {
            let config = load(&config)?;
            match config.validate() {
                Ok(()) => {
                    println!("Configuration is valid ({} repositories)", config.repositories.len());
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => Ok(report_invalid(&e)),
            }
        }
        Commands::Plan { config, components } => {
            let config = load(&config)?;
            let mut options = PipelineOptions::new();
            for component in components {
                options = options.with_component(component);
            }
            let plan = Orchestrator::new(config, options)
                .plan()
                .and_then(|graph| graph.levels().map_err(ValidationError::from));
            match plan {
                Ok(levels) => {
                    for (depth, level) in levels.iter().enumerate() {
                        println!("{}: {}", depth + 1, level.join(", "));
                    }
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => Ok(report_invalid(&e)),
            }
        }
        Commands::Run(args) => run(args).await,
    }
}
