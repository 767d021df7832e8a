//! BDD step definitions for the orchestrator.

use std::time::Duration;

use camino::Utf8PathBuf;
use rstest_bdd_macros::{given, then, when};
use simferry::Orchestrator;
use tokio::runtime::Runtime;
use tokio::time::sleep;

use super::test_helpers::{JobContext, JobResult};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn assertion(message: impl Into<String>) -> StepError {
    StepError::Assertion(message.into())
}

#[given("a job with two steps")]
fn job_with_two_steps(job_context: JobContext) -> JobContext {
    job_context
}

#[given("the steps exit with code \"{code}\"")]
fn steps_exit_with(job_context: JobContext, code: i32) -> JobContext {
    job_context.backend.exit_with(code);
    job_context
}

#[given("the \"{phase}\" phase fails")]
fn phase_fails(job_context: JobContext, phase: String) -> JobContext {
    job_context.backend.fail_at(&phase);
    job_context
}

#[given("the \"{phase}\" phase never finishes")]
fn phase_stalls(job_context: JobContext, phase: String) -> JobContext {
    job_context.backend.stall_at(&phase);
    job_context
}

#[given("the workspace contains \"{first}\" and \"{second}\"")]
fn workspace_contains(job_context: JobContext, first: String, second: String) -> JobContext {
    job_context.backend.list(&[&first, &second]);
    job_context
}

fn execute(job_context: JobContext, cancel_after: Option<Duration>) -> Result<JobContext, StepError> {
    let runtime = Runtime::new().map_err(|err| assertion(err.to_string()))?;
    let JobContext {
        backend,
        spec,
        workdir_tmp,
        ..
    } = job_context;

    let mut orchestrator = Orchestrator::new(backend.clone());
    let result = runtime.block_on(async {
        match cancel_after {
            Some(delay) => orchestrator.execute_until(&spec, sleep(delay)).await,
            None => orchestrator.execute(&spec).await,
        }
    });
    let outcome = match result {
        Ok(outcome) => JobResult {
            exit_code: outcome.exit_code,
            failed: outcome.download_failure.is_some(),
            message: outcome
                .download_failure
                .map(|err| err.to_string())
                .unwrap_or_default(),
        },
        Err(err) => JobResult {
            exit_code: err.exit_code(),
            failed: true,
            message: err.to_string(),
        },
    };

    Ok(JobContext {
        backend,
        spec,
        outcome: Some(outcome),
        workdir_tmp,
    })
}

#[when("I execute the job")]
fn execute_job(job_context: JobContext) -> Result<JobContext, StepError> {
    execute(job_context, None)
}

#[when("I execute the job and cancel it")]
fn execute_and_cancel(job_context: JobContext) -> Result<JobContext, StepError> {
    execute(job_context, Some(Duration::from_millis(20)))
}

fn result(job_context: &JobContext) -> Result<&JobResult, StepError> {
    job_context
        .outcome
        .as_ref()
        .ok_or_else(|| assertion("missing outcome"))
}

#[then("the job exits with code \"{code}\"")]
fn job_exit_code(job_context: &JobContext, code: i32) -> Result<(), StepError> {
    let outcome = result(job_context)?;
    if outcome.exit_code == code {
        Ok(())
    } else {
        Err(assertion(format!(
            "expected exit code {code}, got {} ({})",
            outcome.exit_code, outcome.message
        )))
    }
}

#[then("the job reports a failure mentioning \"{text}\"")]
fn job_failure_mentions(job_context: &JobContext, text: String) -> Result<(), StepError> {
    let outcome = result(job_context)?;
    if outcome.failed && outcome.message.contains(&text) {
        Ok(())
    } else {
        Err(assertion(format!(
            "expected a failure mentioning {text:?}, got {outcome:?}"
        )))
    }
}

#[then("cleanup ran exactly once")]
fn cleanup_once(job_context: &JobContext) -> Result<(), StepError> {
    let count = job_context.backend.call_count("cleanup");
    if count == 1 {
        Ok(())
    } else {
        Err(assertion(format!(
            "expected one cleanup call, got {count}: {:?}",
            job_context.backend.calls()
        )))
    }
}

#[then("the phases ran in order \"{phases}\"")]
fn phases_in_order(job_context: &JobContext, phases: String) -> Result<(), StepError> {
    let expected: Vec<String> = phases.split(", ").map(str::to_owned).collect();
    let calls = job_context.backend.calls();
    if calls == expected {
        Ok(())
    } else {
        Err(assertion(format!("expected phases {expected:?}, got {calls:?}")))
    }
}

#[then("only \"{path}\" is downloaded")]
fn only_path_downloaded(job_context: &JobContext, path: String) -> Result<(), StepError> {
    let downloaded = job_context.backend.downloaded();
    if downloaded == [Utf8PathBuf::from(&path)] {
        Ok(())
    } else {
        Err(assertion(format!("expected only {path}, got {downloaded:?}")))
    }
}
