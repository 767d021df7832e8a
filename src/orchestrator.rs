//! Drives one job through the backend phases.
//!
//! The orchestrator runs `prepare`, `upload`, `run` and `download` in order
//! and then releases the target. Cleanup runs exactly once whichever way the
//! phases end: success, a phase failure, or cancellation through the shutdown
//! future. The job's exit code is the run's exit code whenever the steps
//! executed; otherwise each phase maps to a reserved code.

use std::fmt;
use std::future::{Future, pending};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::backend::{
    Backend, ExecutionResult, ProvisioningError, RemoteExecutionError, TransferError,
};
use crate::fileset::{self, FileSet};
use crate::spec::JobSpec;

/// Exit code reported when the job is cancelled before its steps complete.
pub const EXIT_CANCELLED: i32 = 130;

/// Phase of a job, in execution order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Loading the specfile and backend settings.
    Configuration,
    /// Acquiring the target.
    Prepare,
    /// Resolving and transferring the upload set.
    Upload,
    /// Executing the steps.
    Run,
    /// Resolving and retrieving the download set.
    Download,
    /// Releasing the target.
    Cleanup,
}

impl Phase {
    /// Reserved exit code reported when this phase fails.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Configuration => 64,
            Self::Prepare => 65,
            Self::Upload => 66,
            Self::Run => 67,
            Self::Download => 68,
            Self::Cleanup => 69,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Configuration => "configuration",
            Self::Prepare => "prepare",
            Self::Upload => "upload",
            Self::Run => "run",
            Self::Download => "download",
            Self::Cleanup => "cleanup",
        };
        f.write_str(label)
    }
}

/// Errors that end a job before or around its steps.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum OrchestratorError {
    /// Raised when the target cannot be acquired.
    #[error("prepare failed: {0}")]
    Prepare(#[source] ProvisioningError),
    /// Raised when the upload set cannot be resolved or transferred.
    #[error("upload failed: {0}")]
    Upload(#[source] TransferError),
    /// Raised when the steps cannot be delivered or observed.
    #[error("run failed: {0}")]
    Run(#[source] RemoteExecutionError),
    /// Raised when results cannot be retrieved.
    #[error("download failed: {0}")]
    Download(#[source] TransferError),
    /// Raised when the shutdown future fires.
    #[error("cancelled during {phase}")]
    Cancelled {
        /// Phase in progress when the job was cancelled.
        phase: Phase,
    },
}

impl OrchestratorError {
    /// Phase the error belongs to.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        match self {
            Self::Prepare(_) => Phase::Prepare,
            Self::Upload(_) => Phase::Upload,
            Self::Run(_) => Phase::Run,
            Self::Download(_) => Phase::Download,
            Self::Cancelled { phase } => *phase,
        }
    }

    /// Process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Cancelled { .. } => EXIT_CANCELLED,
            other => other.phase().exit_code(),
        }
    }
}

/// Result of a job whose steps executed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Outcome {
    /// Exit code the process should report.
    pub exit_code: i32,
    /// Output and exit code of the steps.
    pub execution: ExecutionResult,
    /// Download failure or cancellation that happened after the steps ran.
    pub download_failure: Option<OrchestratorError>,
}

impl Outcome {
    fn new(execution: ExecutionResult, download_failure: Option<OrchestratorError>) -> Self {
        let exit_code = if execution.is_success() {
            download_failure
                .as_ref()
                .map_or(0, OrchestratorError::exit_code)
        } else {
            execution.exit_code
        };
        Self {
            exit_code,
            execution,
            download_failure,
        }
    }
}

/// Runs jobs on one backend.
#[derive(Debug)]
pub struct Orchestrator<B: Backend> {
    backend: B,
    phase: Phase,
    execution: Option<ExecutionResult>,
}

impl<B: Backend> Orchestrator<B> {
    /// Creates an orchestrator driving `backend`.
    #[must_use]
    pub const fn new(backend: B) -> Self {
        Self {
            backend,
            phase: Phase::Configuration,
            execution: None,
        }
    }

    /// The backend being driven.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Consumes the orchestrator and returns its backend.
    #[must_use]
    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Runs `spec` to completion.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] when a phase before or during the run
    /// fails. Failures after the steps ran are reported through
    /// [`Outcome::download_failure`].
    pub async fn execute(&mut self, spec: &JobSpec) -> Result<Outcome, OrchestratorError> {
        self.execute_until(spec, pending::<()>()).await
    }

    /// Runs `spec` until it completes or `shutdown` resolves, whichever comes
    /// first. Cleanup runs in both cases.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] when a phase fails or the job is
    /// cancelled before its steps completed.
    pub async fn execute_until<F>(
        &mut self,
        spec: &JobSpec,
        shutdown: F,
    ) -> Result<Outcome, OrchestratorError>
    where
        F: Future<Output = ()>,
    {
        self.phase = Phase::Configuration;
        self.execution = None;
        info!(job = spec.label(), backend = %self.backend.kind(), "starting job");

        let result = tokio::select! {
            finished = self.run_phases(spec) => finished,
            () = shutdown => {
                let phase = self.phase;
                warn!(%phase, "cancellation requested");
                self.execution.take().map_or_else(
                    || Err(OrchestratorError::Cancelled { phase }),
                    |execution| {
                        Ok(Outcome::new(execution, Some(OrchestratorError::Cancelled { phase })))
                    },
                )
            }
        };

        self.cleanup().await;
        match &result {
            Ok(outcome) => info!(exit_code = outcome.exit_code, "job finished"),
            Err(err) => error!(error = %err, exit_code = err.exit_code(), "job failed"),
        }
        result
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        info!(%phase, "starting phase");
    }

    async fn run_phases(&mut self, spec: &JobSpec) -> Result<Outcome, OrchestratorError> {
        self.enter(Phase::Prepare);
        self.backend
            .prepare()
            .await
            .map_err(OrchestratorError::Prepare)?;

        self.enter(Phase::Upload);
        let uploads = fileset::resolve(&spec.workdir, &spec.upload)
            .map_err(|err| OrchestratorError::Upload(err.into()))?;
        warn_if_empty(Phase::Upload, &uploads);
        self.backend
            .upload(&spec.workdir, &uploads)
            .await
            .map_err(OrchestratorError::Upload)?;

        self.enter(Phase::Run);
        let execution = self
            .backend
            .run(&spec.steps)
            .await
            .map_err(OrchestratorError::Run)?;
        info!(exit_code = execution.exit_code, "steps finished");
        self.execution = Some(execution.clone());

        self.enter(Phase::Download);
        let download_failure = self.download(spec).await.err();
        if let Some(err) = &download_failure {
            error!(error = %err, "download failed");
        }
        self.execution = None;
        Ok(Outcome::new(execution, download_failure))
    }

    async fn download(&mut self, spec: &JobSpec) -> Result<(), OrchestratorError> {
        let listing = self
            .backend
            .workspace_listing(&spec.workdir)
            .await
            .map_err(OrchestratorError::Download)?;
        let downloads = fileset::resolve_listing(&listing, &spec.download);
        warn_if_empty(Phase::Download, &downloads);
        self.backend
            .download(&spec.workdir, &downloads)
            .await
            .map_err(OrchestratorError::Download)
    }

    async fn cleanup(&mut self) {
        self.enter(Phase::Cleanup);
        if let Err(err) = self.backend.cleanup().await {
            error!(error = %err, "cleanup failed; the target may need manual removal");
        }
    }
}

fn warn_if_empty(phase: Phase, files: &FileSet) {
    if files.is_empty() {
        warn!(%phase, "patterns matched no files");
    } else {
        info!(%phase, count = files.len(), "resolved files");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalConfig;
    use crate::local::LocalBackend;
    use crate::runner::ProcessCommandRunner;
    use camino::{Utf8Path, Utf8PathBuf};
    use rstest::rstest;

    #[rstest]
    #[case(Phase::Configuration, 64)]
    #[case(Phase::Prepare, 65)]
    #[case(Phase::Upload, 66)]
    #[case(Phase::Run, 67)]
    #[case(Phase::Download, 68)]
    fn phases_map_to_reserved_codes(#[case] phase: Phase, #[case] code: i32) {
        assert_eq!(phase.exit_code(), code);
    }

    #[rstest]
    fn cancellation_uses_its_own_code() {
        let err = OrchestratorError::Cancelled { phase: Phase::Run };
        assert_eq!(err.exit_code(), EXIT_CANCELLED);
        assert_eq!(err.to_string(), "cancelled during run");
    }

    #[rstest]
    #[case(0, false, 0)]
    #[case(0, true, 68)]
    #[case(3, true, 3)]
    #[case(3, false, 3)]
    fn run_code_wins_over_download_failure(
        #[case] run_code: i32,
        #[case] download_failed: bool,
        #[case] expected: i32,
    ) {
        let execution = ExecutionResult {
            exit_code: run_code,
            ..ExecutionResult::default()
        };
        let failure =
            download_failed.then_some(OrchestratorError::Download(TransferError::NotPrepared));
        assert_eq!(Outcome::new(execution, failure).exit_code, expected);
    }

    fn job(dir: &Utf8Path, yaml: &str) -> JobSpec {
        JobSpec::from_yaml("test", yaml, dir).expect("valid job")
    }

    #[rstest]
    #[tokio::test]
    async fn local_job_reports_step_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("utf8");
        let spec = job(&root, "steps:\n  - run: echo hi > out.txt\n  - run: exit 3\n");
        let config = LocalConfig {
            shell: String::from("sh"),
        };
        let backend = LocalBackend::with_runner(config, spec.workdir.clone(), ProcessCommandRunner);
        let mut orchestrator = Orchestrator::new(backend);

        let outcome = orchestrator.execute(&spec).await.expect("job ran");
        assert_eq!(outcome.exit_code, 3);
        assert!(outcome.download_failure.is_none());
        assert!(root.join("out.txt").is_file());
    }

    #[rstest]
    #[tokio::test]
    async fn missing_workdir_fails_prepare() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("utf8");
        let spec = job(&root, "workdir: missing\nsteps:\n  - run: true\n");
        let backend = LocalBackend::with_runner(
            LocalConfig::default(),
            spec.workdir.clone(),
            ProcessCommandRunner,
        );
        let mut orchestrator = Orchestrator::new(backend);

        let err = orchestrator.execute(&spec).await.expect_err("no workdir");
        assert_eq!(err.phase(), Phase::Prepare);
        assert_eq!(err.exit_code(), 65);
    }
}
