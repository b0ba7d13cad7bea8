//! Command-line entry point: `hiveforge <config.yaml>`.

use anyhow::Context;
use clap::Parser;
use hiveforge::config::{BuildConfig, ConfigOverrides, ProcessEnv};
use hiveforge::events::LoggingEventSink;
use hiveforge::image::SystemImageBuilder;
use hiveforge::observability::{init_logging, LoggingConfig};
use hiveforge::pipeline::{BuildOrchestrator, BuildOutcome};
use hiveforge::validation::FilesystemValidator;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "hiveforge", version, about = "Build a hive device image")]
struct Args {
    /// Build configuration (YAML, or JSON by extension).
    config: PathBuf,

    /// Override `hive.id`.
    #[arg(long)]
    hive_id: Option<String>,

    /// Override `hive.version`.
    #[arg(long)]
    image_version: Option<String>,

    /// Skip the validation stage.
    #[arg(long)]
    skip_validation: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&LoggingConfig::from_env(&ProcessEnv)) {
        eprintln!("failed to initialise logging: {e}");
    }

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %format!("{e:#}"), "Build could not start");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<u8> {
    let overrides = ConfigOverrides {
        hive_id: args.hive_id,
        version: args.image_version,
        skip_validation: args.skip_validation.then_some(true),
        ..ConfigOverrides::default()
    };
    let config = BuildConfig::resolve(Some(args.config.as_path()), &ProcessEnv, overrides)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let builder = Arc::new(SystemImageBuilder::new(&config));
    let validator = Arc::new(FilesystemValidator::new(&config));
    let orchestrator = BuildOrchestrator::new(builder, validator)
        .with_event_sink(Arc::new(LoggingEventSink::debug()));

    let token = orchestrator.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping before the next stage");
            token.cancel("interrupted by Ctrl-C");
        }
    });

    let outcome = orchestrator
        .run(Arc::new(config))
        .await
        .context("starting build")?;
    report(&outcome);

    Ok(u8::try_from(outcome.exit_code()).unwrap_or(1))
}

fn report(outcome: &BuildOutcome) {
    info!(
        status = ?outcome.status,
        completed = ?outcome.completed_stages(),
        duration_secs = outcome.duration.as_secs_f64(),
        "Build finished"
    );
    if let Some(url) = outcome.state.download_url.as_deref() {
        println!("{url}");
    }
}
