//! File transfer and step execution through the staging bucket.

use std::io::Write as _;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use tempfile::{Builder, NamedTempFile, TempDir};
use tracing::{debug, info, warn};

use super::script;
use super::{CloudApi, CommandState, RemoteBackend};
use crate::backend::{
    ExecutionResult, RemoteExecutionError, TargetState, TransferError, render_step_script,
};
use crate::fileset::FileSet;
use crate::poll::{PollError, retry_transient};

fn staging(path: impl Into<String>) -> impl Fn(std::io::Error) -> TransferError {
    let path = path.into();
    move |err| TransferError::Staging {
        path: path.clone(),
        message: err.to_string(),
    }
}

fn provider<E: std::fmt::Display>(action: &str) -> impl Fn(E) -> TransferError + '_ {
    move |err| TransferError::Provider {
        action: action.to_owned(),
        message: err.to_string(),
    }
}

fn utf8_temp_path(path: &std::path::Path) -> Result<Utf8PathBuf, TransferError> {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).map_err(|raw| TransferError::Staging {
        path: raw.display().to_string(),
        message: String::from("temporary path is not valid UTF-8"),
    })
}

/// Copies `files` from `root` into a fresh scratch directory, preserving
/// their relative layout.
fn stage_files(root: &Utf8Path, files: &FileSet) -> Result<TempDir, TransferError> {
    let scratch = Builder::new()
        .prefix("simferry-upload-")
        .tempdir()
        .map_err(staging("upload stage"))?;
    let scratch_path = utf8_temp_path(scratch.path())?;
    let source = Dir::open_ambient_dir(root, ambient_authority()).map_err(staging(root.as_str()))?;
    let stage =
        Dir::open_ambient_dir(&scratch_path, ambient_authority()).map_err(staging(scratch_path.as_str()))?;

    for file in files {
        if let Some(parent) = file.parent().filter(|parent| !parent.as_str().is_empty()) {
            stage
                .create_dir_all(parent)
                .map_err(staging(parent.as_str()))?;
        }
        source
            .copy(file, &stage, file)
            .map_err(staging(file.as_str()))?;
    }
    Ok(scratch)
}

fn write_temp(prefix: &str, suffix: &str, contents: &str) -> std::io::Result<NamedTempFile> {
    let mut file = Builder::new().prefix(prefix).suffix(suffix).tempfile()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

fn parse_listing(stdout: &str) -> Vec<Utf8PathBuf> {
    stdout
        .lines()
        .map(str::trim)
        .map(|line| line.strip_prefix("./").unwrap_or(line))
        .filter(|line| !line.is_empty())
        .map(Utf8PathBuf::from)
        .collect()
}

fn log_lines(step: usize, stream: &str, text: &str) {
    for line in text.lines() {
        info!(step, stream, "{line}");
    }
}

impl<A: CloudApi> RemoteBackend<A> {
    pub(super) async fn upload_files(
        &self,
        root: &Utf8Path,
        files: &FileSet,
    ) -> Result<(), TransferError> {
        if files.is_empty() {
            debug!("nothing to upload");
            return Ok(());
        }
        let id = self.prepared_target_id().ok_or(TransferError::NotPrepared)?;
        let scratch = stage_files(root, files)?;
        let scratch_path = utf8_temp_path(scratch.path())?;
        let bucket = self.config.bucket();
        let prefix = self.staging_key("upload");
        info!(count = files.len(), instance = %id, "uploading files");

        let policy = self.command_policy();
        retry_transient(&policy, "upload files", || {
            self.api.upload_dir(&scratch_path, bucket, &prefix)
        })
        .await
        .map_err(provider("s3 upload"))?;

        let outcome = self
            .dispatch(
                &id,
                script::fetch_upload(bucket, &prefix, &self.config.default_region),
                "fetch upload",
            )
            .await;
        self.discard_prefix(&prefix).await;

        let report = outcome.map_err(provider("fetch upload"))?;
        if report.is_success() {
            return Ok(());
        }
        Err(TransferError::RemoteCommand {
            action: String::from("upload"),
            status: report.status_text(),
            stderr: report.stderr.trim().to_owned(),
        })
    }

    pub(super) async fn list_workspace(&self) -> Result<Vec<Utf8PathBuf>, TransferError> {
        let id = self.prepared_target_id().ok_or(TransferError::NotPrepared)?;
        let report = self
            .dispatch(&id, script::list_workspace(), "list workspace")
            .await
            .map_err(provider("list workspace"))?;
        if !report.is_success() {
            return Err(TransferError::RemoteCommand {
                action: String::from("list workspace"),
                status: report.status_text(),
                stderr: report.stderr.trim().to_owned(),
            });
        }
        Ok(parse_listing(&report.stdout))
    }

    pub(super) async fn download_files(
        &self,
        root: &Utf8Path,
        files: &FileSet,
    ) -> Result<(), TransferError> {
        if files.is_empty() {
            debug!("nothing to download");
            return Ok(());
        }
        let id = self.prepared_target_id().ok_or(TransferError::NotPrepared)?;
        let bucket = self.config.bucket();
        let manifest_key = self.staging_key("download.manifest");
        let stage_prefix = self.staging_key("download");
        info!(count = files.len(), instance = %id, "downloading files");

        let mut manifest = files
            .iter()
            .map(|path| path.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        manifest.push('\n');
        let manifest_file = write_temp("simferry-manifest-", ".txt", &manifest)
            .map_err(staging("download manifest"))?;
        let manifest_path = utf8_temp_path(manifest_file.path())?;

        let policy = self.command_policy();
        retry_transient(&policy, "upload manifest", || {
            self.api.upload_file(&manifest_path, bucket, &manifest_key)
        })
        .await
        .map_err(provider("s3 upload"))?;

        let result = self
            .collect_download(&id, root, &manifest_key, &stage_prefix)
            .await;
        self.discard_object(&manifest_key).await;
        self.discard_prefix(&stage_prefix).await;
        result
    }

    async fn collect_download(
        &self,
        id: &str,
        root: &Utf8Path,
        manifest_key: &str,
        stage_prefix: &str,
    ) -> Result<(), TransferError> {
        let bucket = self.config.bucket();
        let report = self
            .dispatch(
                id,
                script::push_download(
                    bucket,
                    manifest_key,
                    stage_prefix,
                    &self.config.default_region,
                ),
                "push download",
            )
            .await
            .map_err(provider("push download"))?;
        if !report.is_success() {
            return Err(TransferError::RemoteCommand {
                action: String::from("download"),
                status: report.status_text(),
                stderr: report.stderr.trim().to_owned(),
            });
        }

        let policy = self.command_policy();
        retry_transient(&policy, "download files", || {
            self.api.download_dir(bucket, stage_prefix, root)
        })
        .await
        .map_err(provider("s3 download"))
    }

    pub(super) async fn run_steps(
        &mut self,
        steps: &[String],
    ) -> Result<ExecutionResult, RemoteExecutionError> {
        let id = self
            .prepared_target_id()
            .ok_or(RemoteExecutionError::NotPrepared)?;
        let mut result = ExecutionResult::default();

        for (index, body) in steps.iter().enumerate() {
            let step = index + 1;
            info!(step, total = steps.len(), "running step");
            self.advance(TargetState::Busy);
            let outcome = self.run_step(&id, step, body).await;
            self.advance(TargetState::Ready);

            let (code, stdout, stderr) = outcome?;
            log_lines(step, "stdout", &stdout);
            log_lines(step, "stderr", &stderr);
            result.absorb(code, &stdout, &stderr);
            if code != 0 {
                warn!(step, code, "step failed; skipping remaining steps");
                break;
            }
        }
        Ok(result)
    }

    async fn run_step(
        &self,
        id: &str,
        step: usize,
        body: &str,
    ) -> Result<(i32, String, String), RemoteExecutionError> {
        let stage_error = |message: String| RemoteExecutionError::Staging { step, message };
        let bucket = self.config.bucket();
        let key = self.staging_key(&format!("step-{step}.sh"));

        let script_file = write_temp("simferry-step-", ".sh", &render_step_script(body))
            .map_err(|err| stage_error(err.to_string()))?;
        let script_path = Utf8PathBuf::from_path_buf(script_file.path().to_path_buf())
            .map_err(|raw| stage_error(format!("non UTF-8 path {}", raw.display())))?;
        let policy = self.command_policy();
        retry_transient(&policy, "upload step", || {
            self.api.upload_file(&script_path, bucket, &key)
        })
        .await
        .map_err(|err| stage_error(err.to_string()))?;

        let fetched = self
            .dispatch(
                id,
                script::fetch_step(bucket, &key, step, &self.config.default_region),
                "fetch step",
            )
            .await;
        self.discard_object(&key).await;
        let fetched = fetched.map_err(|err| stage_error(err.to_string()))?;
        if !fetched.is_success() {
            return Err(stage_error(format!(
                "fetching the script exited with status {}: {}",
                fetched.status_text(),
                fetched.stderr.trim()
            )));
        }

        let report = self
            .dispatch(id, script::run_step(step), "run step")
            .await
            .map_err(|err| match err {
                PollError::TimedOut { attempts, .. } => {
                    RemoteExecutionError::Timeout { step, attempts }
                }
                other => RemoteExecutionError::Channel {
                    step,
                    message: other.to_string(),
                },
            })?;
        if !matches!(report.state, CommandState::Success | CommandState::Failed) {
            return Err(RemoteExecutionError::Channel {
                step,
                message: format!("command ended with status {}", report.state),
            });
        }
        let code = report
            .exit_code
            .ok_or(RemoteExecutionError::MissingExitCode { step })?;
        Ok((code, report.stdout, report.stderr))
    }

    async fn discard_object(&self, key: &str) {
        let policy = self.command_policy();
        let bucket = self.config.bucket();
        if let Err(err) = retry_transient(&policy, "delete staged object", || {
            self.api.delete_object(bucket, key)
        })
        .await
        {
            warn!(key, error = %err, "failed to delete staged object");
        }
    }

    async fn discard_prefix(&self, prefix: &str) {
        let policy = self.command_policy();
        let bucket = self.config.bucket();
        if let Err(err) = retry_transient(&policy, "delete staged prefix", || {
            self.api.delete_prefix(bucket, prefix)
        })
        .await
        {
            warn!(prefix, error = %err, "failed to delete staged files");
        }
    }
}
