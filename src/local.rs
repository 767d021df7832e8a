//! Backend that runs steps on the invoking machine.
//!
//! The working directory doubles as the workspace, so uploads and downloads
//! have nothing to move.

use std::ffi::OsString;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use crate::backend::{
    Backend, BackendFuture, BackendKind, CleanupError, ExecutionResult, ProvisioningError,
    RemoteExecutionError, TransferError, render_step_script,
};
use crate::config::LocalConfig;
use crate::fileset::{self, FileSet};
use crate::runner::{CommandRunner, StreamingCommandRunner};

/// Runs each step with the configured shell inside the working directory.
#[derive(Clone, Debug)]
pub struct LocalBackend<R: CommandRunner = StreamingCommandRunner> {
    config: LocalConfig,
    workdir: Utf8PathBuf,
    runner: R,
    prepared: bool,
}

impl LocalBackend {
    /// Creates a backend that streams step output to the terminal.
    #[must_use]
    pub const fn new(config: LocalConfig, workdir: Utf8PathBuf) -> Self {
        Self::with_runner(config, workdir, StreamingCommandRunner)
    }
}

impl<R: CommandRunner> LocalBackend<R> {
    /// Creates a backend that launches steps through `runner`.
    #[must_use]
    pub const fn with_runner(config: LocalConfig, workdir: Utf8PathBuf, runner: R) -> Self {
        Self {
            config,
            workdir,
            runner,
            prepared: false,
        }
    }

    /// Directory the steps run in.
    #[must_use]
    pub fn workdir(&self) -> &Utf8Path {
        &self.workdir
    }

    fn run_step(&self, step: usize, body: &str) -> Result<(i32, String, String), RemoteExecutionError> {
        let staging = |err: std::io::Error| RemoteExecutionError::Staging {
            step,
            message: err.to_string(),
        };
        let mut script = tempfile::Builder::new()
            .prefix("simferry-step-")
            .suffix(".sh")
            .tempfile()
            .map_err(staging)?;
        script
            .write_all(render_step_script(body).as_bytes())
            .and_then(|()| script.flush())
            .map_err(staging)?;

        let args = [OsString::from(script.path())];
        let output = self
            .runner
            .run_in(Some(&self.workdir), &self.config.shell, &args)
            .map_err(|err| RemoteExecutionError::Launch {
                step,
                message: err.to_string(),
            })?;
        let code = output
            .code
            .ok_or(RemoteExecutionError::MissingExitCode { step })?;
        Ok((code, output.stdout, output.stderr))
    }
}

impl<R: CommandRunner> Backend for LocalBackend<R> {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn prepare(&mut self) -> BackendFuture<'_, (), ProvisioningError> {
        Box::pin(async move {
            if self.prepared {
                return Ok(());
            }
            if !self.workdir.is_dir() {
                return Err(ProvisioningError::MissingWorkdir {
                    path: self.workdir.clone(),
                });
            }
            info!(workdir = %self.workdir, "using local working directory");
            self.prepared = true;
            Ok(())
        })
    }

    fn upload<'a>(
        &'a mut self,
        root: &'a Utf8Path,
        files: &'a FileSet,
    ) -> BackendFuture<'a, (), TransferError> {
        Box::pin(async move {
            debug!(%root, files = files.len(), "files are used in place");
            Ok(())
        })
    }

    fn run<'a>(
        &'a mut self,
        steps: &'a [String],
    ) -> BackendFuture<'a, ExecutionResult, RemoteExecutionError> {
        Box::pin(async move {
            let mut result = ExecutionResult::default();
            for (index, body) in steps.iter().enumerate() {
                let step = index + 1;
                info!(step, shell = %self.config.shell, "running step");
                let (code, stdout, stderr) = self.run_step(step, body)?;
                result.absorb(code, &stdout, &stderr);
                if code != 0 {
                    info!(step, exit_code = code, "step failed; skipping remaining steps");
                    break;
                }
            }
            Ok(result)
        })
    }

    fn workspace_listing<'a>(
        &'a mut self,
        root: &'a Utf8Path,
    ) -> BackendFuture<'a, Vec<Utf8PathBuf>, TransferError> {
        Box::pin(async move { Ok(fileset::list_files(root)?) })
    }

    fn download<'a>(
        &'a mut self,
        root: &'a Utf8Path,
        files: &'a FileSet,
    ) -> BackendFuture<'a, (), TransferError> {
        Box::pin(async move {
            debug!(%root, files = files.len(), "files are already in place");
            Ok(())
        })
    }

    fn cleanup(&mut self) -> BackendFuture<'_, (), CleanupError> {
        Box::pin(async move {
            self.prepared = false;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ProcessCommandRunner;
    use crate::test_support::ScriptedRunner;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    struct Workspace {
        _temp: TempDir,
        root: Utf8PathBuf,
    }

    #[fixture]
    fn workspace() -> Workspace {
        let temp = TempDir::new().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("utf8 path");
        Workspace { _temp: temp, root }
    }

    fn sh_config() -> LocalConfig {
        LocalConfig {
            shell: String::from("sh"),
        }
    }

    fn backend(root: &Utf8Path) -> LocalBackend<ProcessCommandRunner> {
        LocalBackend::with_runner(sh_config(), root.to_owned(), ProcessCommandRunner)
    }

    #[rstest]
    #[tokio::test]
    async fn prepare_rejects_missing_workdir(workspace: Workspace) {
        let missing = workspace.root.join("absent");
        let mut local = backend(&missing);
        let err = local.prepare().await.expect_err("missing workdir");
        assert_eq!(err, ProvisioningError::MissingWorkdir { path: missing });
    }

    #[rstest]
    #[tokio::test]
    async fn steps_run_in_workdir_and_stop_at_first_failure(workspace: Workspace) {
        let mut local = backend(&workspace.root);
        local.prepare().await.expect("prepare");
        let steps = [
            String::from("echo one > marker.txt\necho first"),
            String::from("echo second; exit 3"),
            String::from("echo never"),
        ];

        let result = local.run(&steps).await.expect("run");

        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout, "first\nsecond\n");
        assert!(workspace.root.join("marker.txt").is_file());
    }

    #[rstest]
    #[tokio::test]
    async fn missing_exit_code_is_an_error(workspace: Workspace) {
        let runner = ScriptedRunner::new();
        runner.push_missing_exit_code();
        let mut local = LocalBackend::with_runner(sh_config(), workspace.root.clone(), runner);

        let err = local
            .run(&[String::from("kill -9 $$")])
            .await
            .expect_err("killed step");

        assert_eq!(err, RemoteExecutionError::MissingExitCode { step: 1 });
    }

    #[rstest]
    #[tokio::test]
    async fn step_script_is_passed_to_configured_shell(workspace: Workspace) {
        let runner = ScriptedRunner::new();
        runner.push_success();
        let mut local =
            LocalBackend::with_runner(sh_config(), workspace.root.clone(), runner.clone());

        local.run(&[String::from("true")]).await.expect("run");

        let invocations = runner.invocations();
        let invocation = invocations.first().expect("one invocation");
        assert_eq!(invocation.program, "sh");
        assert_eq!(invocation.args.len(), 1);
        let script = invocation.args.first().expect("script argument");
        assert!(
            script.to_string_lossy().ends_with(".sh"),
            "unexpected script path: {script:?}"
        );
    }

    #[rstest]
    #[tokio::test]
    async fn listing_and_cleanup_work_without_prepare(workspace: Workspace) {
        std::fs::write(workspace.root.join("a.txt"), "a").expect("write file");
        let mut local = backend(&workspace.root);

        let listing = local.workspace_listing(&workspace.root).await.expect("listing");
        local.cleanup().await.expect("cleanup");

        assert_eq!(listing, [Utf8PathBuf::from("a.txt")]);
    }
}
