//! Command-line interface definitions for the `simferry` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Parser, Subcommand};

/// Top-level CLI for the `simferry` binary.
#[derive(Debug, Parser)]
#[command(
    name = "simferry",
    version,
    about = "Run simulation jobs from a specfile on a cloud instance or locally",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Log filter, such as `info`, `debug` or `simferry=trace`. Falls back to
    /// `RUST_LOG`, then `info`.
    #[arg(short = 'v', long, value_name = "LEVEL", global = true)]
    pub(crate) verbosity: Option<String>,
    /// Backend the job runs on.
    #[arg(
        short = 'b',
        long,
        value_name = "BACKEND",
        default_value = "remote",
        value_parser = ["local", "remote", "aws"],
        global = true
    )]
    pub(crate) backend: String,
    /// Action to perform.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of the `simferry` binary.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Run the job described by a specfile.
    #[command(name = "execute", about = "Run the job described by a specfile")]
    Execute(ExecuteCommand),
    /// List the options the selected backend understands.
    #[command(name = "options", about = "List the options the selected backend understands")]
    Options,
}

/// Arguments for the `simferry execute` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ExecuteCommand {
    /// Specfile describing the job.
    #[arg(value_name = "SPECFILE", default_value = "simferry.yml")]
    pub(crate) specfile: String,
    /// Backend option override, applied after the specfile's options.
    ///
    /// May be repeated, for example `--set instance_type=c5.xlarge`.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub(crate) overrides: Vec<String>,
}
