//! BDD scenarios for the job orchestrator.

use rstest_bdd_macros::scenario;

use super::test_helpers::{JobContext, job_context};

#[scenario(
    path = "tests/features/orchestrator.feature",
    name = "Successful job runs every phase and releases the target"
)]
fn scenario_successful_job(job_context: JobContext) {
    drop(job_context);
}

#[scenario(
    path = "tests/features/orchestrator.feature",
    name = "Step exit code becomes the job exit code"
)]
fn scenario_step_exit_code(job_context: JobContext) {
    drop(job_context);
}

#[scenario(
    path = "tests/features/orchestrator.feature",
    name = "Prepare failure skips the remaining phases"
)]
fn scenario_prepare_failure(job_context: JobContext) {
    drop(job_context);
}

#[scenario(
    path = "tests/features/orchestrator.feature",
    name = "Upload failure is reported with its own code"
)]
fn scenario_upload_failure(job_context: JobContext) {
    drop(job_context);
}

#[scenario(
    path = "tests/features/orchestrator.feature",
    name = "Command channel failure is reported with its own code"
)]
fn scenario_channel_failure(job_context: JobContext) {
    drop(job_context);
}

#[scenario(
    path = "tests/features/orchestrator.feature",
    name = "Download failure after a successful run"
)]
fn scenario_download_failure(job_context: JobContext) {
    drop(job_context);
}

#[scenario(
    path = "tests/features/orchestrator.feature",
    name = "Download failure does not mask a failing step"
)]
fn scenario_download_failure_after_failed_step(job_context: JobContext) {
    drop(job_context);
}

#[scenario(
    path = "tests/features/orchestrator.feature",
    name = "Cleanup failure does not change the exit code"
)]
fn scenario_cleanup_failure(job_context: JobContext) {
    drop(job_context);
}

#[scenario(
    path = "tests/features/orchestrator.feature",
    name = "Cancellation during the run still releases the target"
)]
fn scenario_cancel_during_run(job_context: JobContext) {
    drop(job_context);
}

#[scenario(
    path = "tests/features/orchestrator.feature",
    name = "Cancellation while provisioning still releases the target"
)]
fn scenario_cancel_during_prepare(job_context: JobContext) {
    drop(job_context);
}
