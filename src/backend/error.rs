//! Error types for each backend phase.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::fileset::FileSetError;
use crate::image::ImageError;

use super::TargetState;

/// Errors raised while acquiring or validating the execution target.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProvisioningError {
    /// Raised when a setting required to create a target is absent.
    #[error("missing {field}: set {env_var} or add {field} to the backend options")]
    MissingSetting {
        /// Option key that was not provided.
        field: String,
        /// Environment variable that supplies the option.
        env_var: String,
    },
    /// Raised when no catalogue image satisfies the configured version.
    #[error(transparent)]
    Image(#[from] ImageError),
    /// Raised when the target does not become ready in time.
    #[error("target {target} was not ready after {attempts} status checks")]
    ProvisioningTimeout {
        /// Provider identifier of the target.
        target: String,
        /// Number of status checks performed.
        attempts: u32,
    },
    /// Raised when the target lifecycle is driven through an illegal step.
    #[error("target {target} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Provider identifier of the target.
        target: String,
        /// State the target was in.
        from: TargetState,
        /// State that was requested.
        to: TargetState,
    },
    /// Raised when a caller-supplied target cannot be used.
    #[error("target {target} is unavailable (state: {state})")]
    TargetUnavailable {
        /// Identifier or name the caller supplied.
        target: String,
        /// State the provider reported.
        state: String,
    },
    /// Raised when the provider rejects a provisioning call.
    #[error("{action} failed: {message}")]
    Provider {
        /// Provider call that failed.
        action: String,
        /// Provider error message.
        message: String,
    },
    /// Raised when the first-boot bootstrap exits unsuccessfully.
    #[error("bootstrap on {target} exited with status {status}: {stderr}")]
    Bootstrap {
        /// Provider identifier of the target.
        target: String,
        /// Exit status reported by the command channel.
        status: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Raised when the local working directory does not exist.
    #[error("working directory {path} does not exist")]
    MissingWorkdir {
        /// Directory that was expected.
        path: Utf8PathBuf,
    },
}

/// Errors raised while moving files between the caller and the target.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransferError {
    /// Raised when the requested patterns cannot be resolved.
    #[error(transparent)]
    FileSet(#[from] FileSetError),
    /// Raised when files cannot be staged on the local side.
    #[error("failed to stage {path}: {message}")]
    Staging {
        /// Local path involved.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when the object store or command channel rejects a call.
    #[error("{action} failed: {message}")]
    Provider {
        /// Provider call that failed.
        action: String,
        /// Provider error message.
        message: String,
    },
    /// Raised when a transfer command on the target exits unsuccessfully.
    #[error("{action} on the target exited with status {status}: {stderr}")]
    RemoteCommand {
        /// Transfer step that failed.
        action: String,
        /// Exit status reported by the command channel.
        status: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Raised when a transfer is attempted before `prepare` succeeded.
    #[error("no target has been prepared")]
    NotPrepared,
}

/// Errors raised while running steps on the target.
///
/// A step that exits non-zero is reported through
/// [`ExecutionResult`](super::ExecutionResult), not through this type.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteExecutionError {
    /// Raised when a step script cannot be written or uploaded.
    #[error("failed to stage step {step}: {message}")]
    Staging {
        /// One-based step number.
        step: usize,
        /// Underlying error message.
        message: String,
    },
    /// Raised when the command channel fails to deliver or report a step.
    #[error("command channel failed for step {step}: {message}")]
    Channel {
        /// One-based step number.
        step: usize,
        /// Underlying error message.
        message: String,
    },
    /// Raised when a step does not finish within the polling budget.
    #[error("step {step} did not finish after {attempts} status checks")]
    Timeout {
        /// One-based step number.
        step: usize,
        /// Number of status checks performed.
        attempts: u32,
    },
    /// Raised when the step interpreter cannot be launched.
    #[error("failed to launch step {step}: {message}")]
    Launch {
        /// One-based step number.
        step: usize,
        /// Underlying error message.
        message: String,
    },
    /// Raised when a step ends without reporting an exit status.
    #[error("step {step} terminated without an exit status")]
    MissingExitCode {
        /// One-based step number.
        step: usize,
    },
    /// Raised when steps are run before `prepare` succeeded.
    #[error("no target has been prepared")]
    NotPrepared,
}

/// Errors raised while releasing the target.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CleanupError {
    /// Raised when the provider rejects a teardown call.
    #[error("{action} of {target} failed: {message}")]
    Provider {
        /// Provider identifier of the target.
        target: String,
        /// Teardown call that failed.
        action: String,
        /// Provider error message.
        message: String,
    },
    /// Raised when the target does not reach its final state in time.
    #[error("target {target} did not reach {state} after {attempts} status checks")]
    Timeout {
        /// Provider identifier of the target.
        target: String,
        /// State that was awaited.
        state: TargetState,
        /// Number of status checks performed.
        attempts: u32,
    },
}
