//! Backend abstraction over the places a job can execute.
//!
//! A backend acquires a target, moves files to and from it, runs the job's
//! steps there and releases it again. The orchestrator drives the phases in
//! order; each phase reports its own error type so failures map onto distinct
//! exit codes.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::fileset::FileSet;

mod error;
mod target;

pub use error::{CleanupError, ProvisioningError, RemoteExecutionError, TransferError};
pub use target::{RemoteTarget, TargetOrigin, TargetState};

/// Future returned by backend operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Where a job executes; chosen once at startup.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum BackendKind {
    /// Steps run on the invoking machine.
    Local,
    /// Steps run on a provisioned cloud instance.
    #[default]
    Remote,
}

impl BackendKind {
    /// Every supported backend, in display order.
    pub const ALL: [Self; 2] = [Self::Local, Self::Remote];

    /// Canonical name used on the command line and in specfiles.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Raised when a backend name is not recognised.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown backend '{0}' (expected local or remote)")]
pub struct UnknownBackend(pub String);

impl FromStr for BackendKind {
    type Err = UnknownBackend;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" | "aws" => Ok(Self::Remote),
            _ => Err(UnknownBackend(raw.to_owned())),
        }
    }
}

/// Outcome of running a job's steps.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExecutionResult {
    /// Exit code of the last step that ran.
    pub exit_code: i32,
    /// Standard output accumulated across steps.
    pub stdout: String,
    /// Standard error accumulated across steps.
    pub stderr: String,
}

impl ExecutionResult {
    /// Returns `true` when every step exited with zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Appends the output of one step.
    pub fn absorb(&mut self, exit_code: i32, stdout: &str, stderr: &str) {
        self.exit_code = exit_code;
        self.stdout.push_str(stdout);
        self.stderr.push_str(stderr);
    }
}

/// Header prepended to every step script.
pub const STEP_SCRIPT_HEADER: &str = "#!/bin/bash\nset +x\n";

/// Renders a step body as a standalone script.
#[must_use]
pub fn render_step_script(body: &str) -> String {
    let mut script = String::with_capacity(STEP_SCRIPT_HEADER.len() + body.len() + 1);
    script.push_str(STEP_SCRIPT_HEADER);
    script.push_str(body);
    if !body.ends_with('\n') {
        script.push('\n');
    }
    script
}

/// Interface implemented by every execution backend.
///
/// Methods take `&mut self` because backends track the target they hold.
pub trait Backend: Send {
    /// Which variant this backend is.
    fn kind(&self) -> BackendKind;

    /// Acquires or validates the execution target. Calling it again on a
    /// prepared backend does nothing.
    fn prepare(&mut self) -> BackendFuture<'_, (), ProvisioningError>;

    /// Copies `files`, relative to `root`, into the target's workspace.
    fn upload<'a>(
        &'a mut self,
        root: &'a Utf8Path,
        files: &'a FileSet,
    ) -> BackendFuture<'a, (), TransferError>;

    /// Runs each step in order inside the workspace, stopping at the first
    /// non-zero exit. A non-zero exit is reported in the result, not as an
    /// error.
    fn run<'a>(
        &'a mut self,
        steps: &'a [String],
    ) -> BackendFuture<'a, ExecutionResult, RemoteExecutionError>;

    /// Lists every regular file in the workspace, relative to it. `root` is
    /// the caller's working directory; backends executing elsewhere list
    /// their own workspace instead.
    fn workspace_listing<'a>(
        &'a mut self,
        root: &'a Utf8Path,
    ) -> BackendFuture<'a, Vec<Utf8PathBuf>, TransferError>;

    /// Copies `files` from the workspace back under `root`.
    fn download<'a>(
        &'a mut self,
        root: &'a Utf8Path,
        files: &'a FileSet,
    ) -> BackendFuture<'a, (), TransferError>;

    /// Releases the target. Safe to call when `prepare` never completed.
    fn cleanup(&mut self) -> BackendFuture<'_, (), CleanupError>;
}
