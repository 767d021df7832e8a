//! Binary entry point for the simferry CLI.

use std::env;
use std::future::pending;
use std::io::{self, Write};
use std::process;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use simferry::{
    Backend, BackendKind, BackendOptions, ConfigError, JobSpec, LocalBackend, LocalConfig,
    OptionInfo, Orchestrator, OrchestratorError, Phase, RemoteBackend, RemoteConfig,
    UnknownBackend,
};

mod cli;

use cli::{Cli, Command, ExecuteCommand};

const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Backend(#[from] UnknownBackend),
    #[error(transparent)]
    Job(#[from] OrchestratorError),
    #[error("failed to write output: {0}")]
    Output(String),
}

impl CliError {
    const fn exit_code(&self) -> i32 {
        match self {
            Self::Job(err) => err.exit_code(),
            Self::Config(_) | Self::Backend(_) | Self::Output(_) => {
                Phase::Configuration.exit_code()
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbosity.as_deref());
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            err.exit_code()
        }
    };

    process::exit(exit_code);
}

fn log_filter(verbosity: Option<&str>) -> EnvFilter {
    verbosity
        .map(str::to_owned)
        .or_else(|| env::var("RUST_LOG").ok())
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

fn init_logging(verbosity: Option<&str>) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbosity))
        .with_writer(io::stderr)
        .with_target(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        writeln!(io::stderr(), "logging was already initialised").ok();
    }
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let kind: BackendKind = cli.backend.parse()?;
    match cli.command {
        Command::Options => {
            write_options(io::stdout(), kind).map_err(|err| CliError::Output(err.to_string()))?;
            Ok(0)
        }
        Command::Execute(command) => execute(kind, &command).await,
    }
}

fn backend_options(
    spec: &JobSpec,
    kind: BackendKind,
    overrides: &[String],
) -> Result<BackendOptions, ConfigError> {
    let mut options = spec.backend_options(kind);
    options.merge(&BackendOptions::from_assignments(overrides)?);
    Ok(options)
}

async fn execute(kind: BackendKind, command: &ExecuteCommand) -> Result<i32, CliError> {
    let spec = JobSpec::load(&Utf8PathBuf::from(&command.specfile))?;
    let options = backend_options(&spec, kind, &command.overrides)?;

    match kind {
        BackendKind::Local => {
            let mut config = LocalConfig::load_without_cli_args()?;
            config.apply_options(&options);
            config.validate()?;
            run_job(LocalBackend::new(config, spec.workdir.clone()), &spec).await
        }
        BackendKind::Remote => {
            let mut config = RemoteConfig::load_without_cli_args()?;
            config.apply_options(&options)?;
            config.validate()?;
            run_job(RemoteBackend::from_config(config), &spec).await
        }
    }
}

async fn run_job<B: Backend>(backend: B, spec: &JobSpec) -> Result<i32, CliError> {
    let mut orchestrator = Orchestrator::new(backend);
    let outcome = orchestrator.execute_until(spec, shutdown_signal()).await?;
    if let Some(failure) = &outcome.download_failure {
        error!(error = %failure, "results were not retrieved");
    }
    Ok(outcome.exit_code)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for Ctrl-C; cancellation disabled");
        pending::<()>().await;
    }
}

const fn options_for(kind: BackendKind) -> &'static [OptionInfo] {
    match kind {
        BackendKind::Local => &LocalConfig::OPTIONS,
        BackendKind::Remote => &RemoteConfig::OPTIONS,
    }
}

fn write_options(mut target: impl Write, kind: BackendKind) -> io::Result<()> {
    writeln!(target, "Options for the {kind} backend:")?;
    for info in options_for(kind) {
        writeln!(
            target,
            "  {:<22} {:<28} default: {:<10} {}",
            info.key,
            info.env_var,
            info.default.unwrap_or("-"),
            info.description
        )?;
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "simferry: {err}").ok();
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
