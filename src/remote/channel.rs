//! Managed command dispatch and output collection.

use tracing::{debug, warn};

use super::script::HOME_DIR;
use super::{CloudApi, CloudError, CommandState, RemoteBackend, ShellCommand};
use crate::poll::{Poll, PollError, PollPolicy, poll_until, retry_transient};

/// Outcome of one managed command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct CommandReport {
    pub(super) state: CommandState,
    pub(super) exit_code: Option<i32>,
    pub(super) stdout: String,
    pub(super) stderr: String,
}

impl CommandReport {
    pub(super) fn is_success(&self) -> bool {
        self.state == CommandState::Success && matches!(self.exit_code, Some(0) | None)
    }

    pub(super) fn status_text(&self) -> String {
        self.exit_code.map_or_else(
            || self.state.to_string(),
            |code| format!("{code} ({})", self.state),
        )
    }
}

impl<A: CloudApi> RemoteBackend<A> {
    /// Sends `commands` to instance `id` and waits for them to finish.
    pub(super) async fn dispatch(
        &self,
        id: &str,
        commands: Vec<String>,
        label: &str,
    ) -> Result<CommandReport, PollError<CloudError>> {
        let request = ShellCommand {
            instance_id: id.to_owned(),
            commands,
            working_dir: String::from(HOME_DIR),
            output_bucket: self.config.bucket().to_owned(),
            output_prefix: self.config.s3_keyprefix.clone(),
            timeout_secs: self.config.command_timeout_secs,
        };
        debug!(label, commands = ?request.commands, "sending command");

        let policy = self.command_policy();
        let command_id =
            retry_transient(&policy, label, || self.api.send_command(&request)).await?;
        let status = poll_until(&policy, label, || {
            self.api.command_status(&command_id, id).map(|status| {
                if status.state.is_finished() {
                    Poll::Ready(status)
                } else {
                    Poll::Pending
                }
            })
        })
        .await?;
        debug!(label, command_id, state = %status.state, "command finished");

        let stdout = self
            .command_output(&policy, &command_id, id, "stdout", status.stdout)
            .await;
        let stderr = if status.state == CommandState::Success {
            status.stderr
        } else {
            self.command_output(&policy, &command_id, id, "stderr", status.stderr)
                .await
        };

        Ok(CommandReport {
            state: status.state,
            exit_code: status.response_code,
            stdout,
            stderr,
        })
    }

    /// Reads the full output stream from the bucket, falling back to the
    /// truncated inline copy when the object is absent or unreadable.
    async fn command_output(
        &self,
        policy: &PollPolicy,
        command_id: &str,
        id: &str,
        stream: &str,
        inline: String,
    ) -> String {
        let key = format!(
            "{}/{command_id}/{id}/awsrunShellScript/0.awsrunShellScript/{stream}",
            self.config.s3_keyprefix.trim_end_matches('/')
        );
        let bucket = self.config.bucket();
        match retry_transient(policy, "read command output", || {
            self.api.read_object(bucket, &key)
        })
        .await
        {
            Ok(Some(text)) => text,
            Ok(None) => inline,
            Err(err) => {
                warn!(error = %err, stream, "using inline command output");
                inline
            }
        }
    }
}
