//! Provider operations the remote backend depends on.
//!
//! [`CloudApi`] covers exactly the compute, object-store and managed-command
//! calls the backend makes, so tests can replace the provider with an
//! in-memory double.

use std::fmt;

use camino::Utf8Path;
use thiserror::Error;

use crate::poll::Transient;
use crate::runner::RunnerError;

/// Provider error fragments that indicate a retry may succeed.
const TRANSIENT_MARKERS: [&str; 10] = [
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "ServiceUnavailable",
    "InternalError",
    "SlowDown",
    "InvocationDoesNotExist",
    "Could not connect to the endpoint URL",
    "Connection was closed",
    "Read timeout",
];

/// Errors raised by provider calls.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CloudError {
    /// Raised when the provider client cannot be launched.
    #[error(transparent)]
    Runner(#[from] RunnerError),
    /// Raised when the provider rejects a call.
    #[error("{action} exited with status {status}: {stderr}")]
    CommandFailure {
        /// Provider call that failed.
        action: String,
        /// Exit status of the provider client.
        status: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Raised when provider output cannot be interpreted.
    #[error("failed to parse {action} output: {message}")]
    Parse {
        /// Provider call whose output was malformed.
        action: String,
        /// Parser error message.
        message: String,
    },
    /// Raised when a resource the call expects does not exist.
    #[error("{action}: {resource} not found")]
    NotFound {
        /// Provider call that was made.
        action: String,
        /// Resource that was missing.
        resource: String,
    },
}

impl Transient for CloudError {
    fn is_transient(&self) -> bool {
        match self {
            Self::CommandFailure { stderr, .. } => TRANSIENT_MARKERS
                .iter()
                .any(|marker| stderr.contains(marker)),
            Self::Runner(_) | Self::Parse { .. } | Self::NotFound { .. } => false,
        }
    }
}

/// Provider-reported lifecycle state of an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InstanceState {
    /// Booting or starting.
    Pending,
    /// Accepting work.
    Running,
    /// Shutting down before termination.
    ShuttingDown,
    /// Gone.
    Terminated,
    /// Stopping.
    Stopping,
    /// Stopped and retained.
    Stopped,
    /// A state this crate does not know.
    Other(String),
}

impl InstanceState {
    /// Interprets the provider's state name.
    #[must_use]
    pub fn from_provider(name: &str) -> Self {
        match name {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Other(other) => other,
        };
        f.write_str(name)
    }
}

/// Instance identifier and state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceInfo {
    /// Provider identifier.
    pub id: String,
    /// Current state.
    pub state: InstanceState,
}

/// Catalogue image identifier and name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageInfo {
    /// Provider identifier used to launch the image.
    pub id: String,
    /// Catalogue name carrying the version.
    pub name: String,
}

/// Parameters for launching one instance.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LaunchRequest {
    /// Image to boot.
    pub image_id: String,
    /// Instance type.
    pub instance_type: String,
    /// Instance profile granting object store and command channel access.
    pub iam_profile: String,
    /// Security group for the primary interface.
    pub security_group_id: String,
    /// Subnet for the primary interface.
    pub subnet_id: String,
    /// Optional key pair.
    pub key_name: Option<String>,
    /// Value of the `Name` tag.
    pub name: String,
    /// Value of the run marker tag.
    pub run_token: String,
    /// Idempotency token; repeated launches with the same token start at
    /// most one instance.
    pub client_token: String,
    /// Optional cloud-init user data.
    pub user_data: Option<String>,
}

/// Shell commands sent through the managed command channel.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ShellCommand {
    /// Instance that runs the commands.
    pub instance_id: String,
    /// Command lines, run in order as one script.
    pub commands: Vec<String>,
    /// Directory the script starts in.
    pub working_dir: String,
    /// Bucket receiving the command output.
    pub output_bucket: String,
    /// Key prefix for the command output.
    pub output_prefix: String,
    /// Seconds before the provider cancels the command.
    pub timeout_secs: u64,
}

/// Managed command state as reported by the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommandState {
    /// Queued or running.
    InProgress,
    /// Finished with exit code zero.
    Success,
    /// Finished with a non-zero exit code.
    Failed,
    /// Exceeded its execution timeout.
    TimedOut,
    /// Cancelled before it finished.
    Cancelled,
    /// A terminal state this crate does not know.
    Other(String),
}

impl CommandState {
    /// Interprets the provider's status name.
    #[must_use]
    pub fn from_provider(name: &str) -> Self {
        match name {
            "Pending" | "InProgress" | "Delayed" | "Cancelling" => Self::InProgress,
            "Success" => Self::Success,
            "Failed" => Self::Failed,
            "TimedOut" | "ExecutionTimedOut" | "DeliveryTimedOut" => Self::TimedOut,
            "Cancelled" => Self::Cancelled,
            other => Self::Other(other.to_owned()),
        }
    }

    /// Returns `true` once the command will not change state again.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InProgress => "InProgress",
            Self::Success => "Success",
            Self::Failed => "Failed",
            Self::TimedOut => "TimedOut",
            Self::Cancelled => "Cancelled",
            Self::Other(other) => other,
        };
        f.write_str(name)
    }
}

/// Status of one managed command invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandStatus {
    /// Invocation state.
    pub state: CommandState,
    /// Exit code of the script, once finished.
    pub response_code: Option<i32>,
    /// Inline standard output; the provider truncates long output.
    pub stdout: String,
    /// Inline standard error; the provider truncates long output.
    pub stderr: String,
}

impl CommandStatus {
    /// Status of a command that finished with `code`.
    #[must_use]
    pub fn finished(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            state: if code == 0 {
                CommandState::Success
            } else {
                CommandState::Failed
            },
            response_code: Some(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Status of a command that has not finished yet.
    #[must_use]
    pub const fn in_progress() -> Self {
        Self {
            state: CommandState::InProgress,
            response_code: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// Provider calls made by [`RemoteBackend`](super::RemoteBackend).
///
/// Calls are blocking; the backend drives them from its async phases and
/// retries transient failures.
pub trait CloudApi: Send + Sync {
    /// Lists catalogue images whose name matches `name_pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError`] when the provider call fails.
    fn describe_images(&self, name_pattern: &str) -> Result<Vec<ImageInfo>, CloudError>;

    /// Lists running or stopped instances whose `Name` tag equals `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError`] when the provider call fails.
    fn find_instances(&self, name: &str) -> Result<Vec<InstanceInfo>, CloudError>;

    /// Reports the current state of instance `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::NotFound`] for unknown instances.
    fn describe_instance(&self, id: &str) -> Result<InstanceInfo, CloudError>;

    /// Launches one instance and returns its identifier.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError`] when the provider rejects the launch.
    fn launch_instance(&self, request: &LaunchRequest) -> Result<String, CloudError>;

    /// Starts a stopped instance.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError`] when the provider call fails.
    fn start_instance(&self, id: &str) -> Result<(), CloudError>;

    /// Stops a running instance.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError`] when the provider call fails.
    fn stop_instance(&self, id: &str) -> Result<(), CloudError>;

    /// Terminates an instance.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError`] when the provider call fails.
    fn terminate_instance(&self, id: &str) -> Result<(), CloudError>;

    /// Copies one local file to `bucket/key`.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError`] when the transfer fails.
    fn upload_file(&self, local: &Utf8Path, bucket: &str, key: &str) -> Result<(), CloudError>;

    /// Copies a local directory tree to `bucket/prefix/`.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError`] when the transfer fails.
    fn upload_dir(&self, local: &Utf8Path, bucket: &str, prefix: &str) -> Result<(), CloudError>;

    /// Copies every object under `bucket/prefix/` into `local`, keeping
    /// relative paths.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError`] when the transfer fails.
    fn download_dir(&self, bucket: &str, prefix: &str, local: &Utf8Path)
    -> Result<(), CloudError>;

    /// Reads an object as text; `None` when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError`] when the read fails for another reason.
    fn read_object(&self, bucket: &str, key: &str) -> Result<Option<String>, CloudError>;

    /// Deletes one object.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError`] when the provider call fails.
    fn delete_object(&self, bucket: &str, key: &str) -> Result<(), CloudError>;

    /// Deletes every object under `prefix/`.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError`] when the provider call fails.
    fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<(), CloudError>;

    /// Sends shell commands through the managed channel and returns the
    /// command identifier.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError`] when the provider rejects the command.
    fn send_command(&self, command: &ShellCommand) -> Result<String, CloudError>;

    /// Reports the status of `command_id` on `instance_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError`] when the provider call fails; an invocation
    /// that is not registered yet is reported as a transient failure.
    fn command_status(
        &self,
        command_id: &str,
        instance_id: &str,
    ) -> Result<CommandStatus, CloudError>;
}
