//! Process execution seam shared by the local backend and the cloud CLI
//! adapter.
//!
//! Everything that launches an external program goes through
//! [`CommandRunner`], so tests can substitute scripted outputs without
//! spawning processes.

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::process::{Command, Stdio};
use std::thread;

use camino::Utf8Path;
use thiserror::Error;

/// Result of running an external command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Renders the exit status for error messages.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Errors raised while launching external programs.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RunnerError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the output pipes of a running command fail.
    #[error("failed to collect output of {program}: {message}")]
    Output {
        /// Command whose output could not be read.
        program: String,
        /// Operating system error string.
        message: String,
    },
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with the given arguments in the current directory,
    /// capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RunnerError> {
        self.run_in(None, program, args)
    }

    /// Runs `program` with the given arguments, optionally inside `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] if the command cannot be started or its output
    /// cannot be collected.
    fn run_in(
        &self,
        dir: Option<&Utf8Path>,
        program: &str,
        args: &[OsString],
    ) -> Result<CommandOutput, RunnerError>;
}

fn command(dir: Option<&Utf8Path>, program: &str, args: &[OsString]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(path) = dir {
        cmd.current_dir(path);
    }
    cmd
}

/// Real command runner that shells out to the host operating system and
/// buffers output until the process exits.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run_in(
        &self,
        dir: Option<&Utf8Path>,
        program: &str,
        args: &[OsString],
    ) -> Result<CommandOutput, RunnerError> {
        let output = command(dir, program, args)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| RunnerError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Command runner that forwards output to the terminal as it is produced
/// while still capturing it for the caller.
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamingCommandRunner;

impl CommandRunner for StreamingCommandRunner {
    fn run_in(
        &self,
        dir: Option<&Utf8Path>,
        program: &str,
        args: &[OsString],
    ) -> Result<CommandOutput, RunnerError> {
        let output_error = |err: io::Error| RunnerError::Output {
            program: program.to_owned(),
            message: err.to_string(),
        };

        let mut child = command(dir, program, args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| RunnerError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        let child_stdout = child.stdout.take();
        let child_stderr = child.stderr.take();

        let (stdout, stderr) = thread::scope(|scope| {
            let out = scope.spawn(move || tee(child_stdout, io::stdout()));
            let err = scope.spawn(move || tee(child_stderr, io::stderr()));
            (join_tee(out), join_tee(err))
        });

        let status = child.wait().map_err(output_error)?;

        Ok(CommandOutput {
            code: status.code(),
            stdout: String::from_utf8_lossy(&stdout.map_err(output_error)?).into_owned(),
            stderr: String::from_utf8_lossy(&stderr.map_err(output_error)?).into_owned(),
        })
    }
}

fn join_tee(handle: thread::ScopedJoinHandle<'_, io::Result<Vec<u8>>>) -> io::Result<Vec<u8>> {
    handle
        .join()
        .unwrap_or_else(|_| Err(io::Error::other("output forwarding thread panicked")))
}

fn tee(source: Option<impl Read>, mut sink: impl Write) -> io::Result<Vec<u8>> {
    let mut captured = Vec::new();
    let Some(mut reader) = source else {
        return Ok(captured);
    };

    let mut buffer = [0_u8; 8192];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        let chunk = buffer.get(..read).unwrap_or_default();
        sink.write_all(chunk)?;
        sink.flush()?;
        captured.extend_from_slice(chunk);
    }
    Ok(captured)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::fmt::Write as _;

    fn sh(script: &str) -> Vec<OsString> {
        vec![OsString::from("-c"), OsString::from(script)]
    }

    #[rstest]
    #[case::success("printf out && printf err 1>&2", Some(0), "out", "err")]
    #[case::failure("printf out && printf err 1>&2; exit 42", Some(42), "out", "err")]
    #[case::silent("", Some(0), "", "")]
    fn streaming_runner_captures_output(
        #[case] script: &str,
        #[case] expected_code: Option<i32>,
        #[case] expected_stdout: &str,
        #[case] expected_stderr: &str,
    ) {
        let output = StreamingCommandRunner
            .run("sh", &sh(script))
            .expect("command should execute");

        assert_eq!(output.code, expected_code);
        assert_eq!(output.stdout, expected_stdout);
        assert_eq!(output.stderr, expected_stderr);
    }

    #[rstest]
    fn streaming_runner_captures_large_interleaved_output() {
        let output = StreamingCommandRunner
            .run(
                "sh",
                &sh("for i in $(seq 1 50); do printf \"out-%03d\\n\" $i; printf \"err-%03d\\n\" $i 1>&2; done"),
            )
            .expect("command should execute");

        let mut expected_out = String::new();
        let mut expected_err = String::new();
        for i in 1..=50 {
            writeln!(&mut expected_out, "out-{i:03}").expect("write expected_out");
            writeln!(&mut expected_err, "err-{i:03}").expect("write expected_err");
        }

        assert_eq!(output.code, Some(0));
        assert_eq!(output.stdout, expected_out);
        assert_eq!(output.stderr, expected_err);
    }

    #[rstest]
    fn runners_honour_working_directory() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let dir = Utf8Path::from_path(tmp.path()).expect("utf8 tempdir");

        let buffered = ProcessCommandRunner
            .run_in(Some(dir), "sh", &sh("pwd"))
            .expect("pwd should run");
        let streamed = StreamingCommandRunner
            .run_in(Some(dir), "sh", &sh("pwd"))
            .expect("pwd should run");

        let canonical = std::fs::canonicalize(tmp.path()).expect("canonical tempdir");
        let expected = canonical.to_string_lossy();
        assert_eq!(buffered.stdout.trim(), expected);
        assert_eq!(streamed.stdout.trim(), expected);
    }

    #[rstest]
    #[case::buffered(&ProcessCommandRunner as &dyn CommandRunner)]
    #[case::streaming(&StreamingCommandRunner as &dyn CommandRunner)]
    fn failed_spawn_returns_spawn_error(#[case] runner: &dyn CommandRunner) {
        let result = runner.run("definitely-not-a-real-binary-xyz", &[]);

        assert!(
            matches!(result, Err(RunnerError::Spawn { .. })),
            "expected RunnerError::Spawn, got {result:?}"
        );
    }

    #[rstest]
    fn status_text_reports_unknown_without_code() {
        let output = CommandOutput::default();
        assert_eq!(output.status_text(), "unknown");
        assert!(!output.is_success());
    }
}
