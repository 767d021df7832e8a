//! Shared fixtures for orchestrator BDD scenarios.

use std::sync::Arc;

use camino::Utf8PathBuf;
use rstest::fixture;
use simferry::JobSpec;
use tempfile::TempDir;
use thiserror::Error;

use super::test_doubles::ScriptedBackend;

pub const JOB_SPEC: &str = concat!(
    "name: blinky\n",
    "steps:\n",
    "  - run: make\n",
    "  - run: make test\n",
    "download:\n",
    "  - \"out/**\"\n",
);

#[derive(Clone, Debug)]
pub struct JobContext {
    pub backend: ScriptedBackend,
    pub spec: JobSpec,
    pub outcome: Option<JobResult>,
    pub(crate) workdir_tmp: Arc<TempDir>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobResult {
    pub exit_code: i32,
    pub failed: bool,
    pub message: String,
}

#[derive(Clone, Debug, Error)]
pub enum JobTestError {
    #[error("failed to create workspace: {0}")]
    Workspace(String),
    #[error("invalid job fixture: {0}")]
    Spec(String),
}

pub type JobContextResult = Result<JobContext, JobTestError>;

#[fixture]
pub fn job_context_result() -> JobContextResult {
    build_job_context()
}

#[fixture]
pub fn job_context(job_context_result: JobContextResult) -> JobContext {
    job_context_result.unwrap_or_else(|err| panic!("job context fixture should initialise: {err}"))
}

pub fn build_job_context() -> JobContextResult {
    let tmp_dir =
        TempDir::new().map_err(|err| JobTestError::Workspace(format!("tempdir: {err}")))?;
    let workdir = Utf8PathBuf::from_path_buf(tmp_dir.path().to_path_buf()).map_err(|path| {
        JobTestError::Workspace(format!("non-utf8 tempdir path: {}", path.display()))
    })?;
    let spec = JobSpec::from_yaml("simferry.yml", JOB_SPEC, &workdir)
        .map_err(|err| JobTestError::Spec(err.to_string()))?;

    Ok(JobContext {
        backend: ScriptedBackend::new(),
        spec,
        outcome: None,
        workdir_tmp: Arc::new(tmp_dir),
    })
}
