//! Core library for the simferry job runner.
//!
//! A job is described by a specfile ([`JobSpec`]): which files to upload,
//! which steps to run and which results to bring back. The [`Orchestrator`]
//! drives one job through a [`Backend`], either [`LocalBackend`] on the
//! invoking machine or [`RemoteBackend`] on a cloud instance that is created
//! (or reused) for the run and released afterwards.

pub mod backend;
pub mod config;
pub mod fileset;
pub mod image;
pub mod local;
pub mod orchestrator;
pub mod poll;
pub mod remote;
pub mod runner;
pub mod spec;
pub mod test_support;

pub use backend::{
    Backend, BackendKind, CleanupError, ExecutionResult, ProvisioningError, RemoteExecutionError,
    RemoteTarget, TargetOrigin, TargetState, TransferError, UnknownBackend,
};
pub use config::{BackendOptions, ConfigError, LocalConfig, OptionInfo, RemoteConfig};
pub use fileset::{FileSet, FileSetError, Pattern, PatternMode};
pub use image::{ImageCandidate, ImageError, Version};
pub use local::LocalBackend;
pub use orchestrator::{EXIT_CANCELLED, Orchestrator, OrchestratorError, Outcome, Phase};
pub use poll::{Poll, PollError, PollPolicy};
pub use remote::{AwsCli, CloudApi, CloudError, RemoteBackend};
pub use runner::{
    CommandOutput, CommandRunner, ProcessCommandRunner, RunnerError, StreamingCommandRunner,
};
pub use spec::{DEFAULT_SPECFILE, JobSpec};
