//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::fs;
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::fileset;
use crate::remote::{
    CloudApi, CloudError, CommandStatus, ImageInfo, InstanceInfo, InstanceState, LaunchRequest,
    ShellCommand,
};
use crate::runner::{CommandOutput, CommandRunner, RunnerError};

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
/// Clones share the same queue and invocation log.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Directory the command was asked to run in.
    pub dir: Option<Utf8PathBuf>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        locked(&self.invocations).clone()
    }

    fn push(&self, output: CommandOutput) {
        locked(&self.responses).push_back(output);
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes a response with no exit code to simulate abnormal termination.
    pub fn push_missing_exit_code(&self) {
        self.push_output(None, "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.push(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run_in(
        &self,
        dir: Option<&Utf8Path>,
        program: &str,
        args: &[OsString],
    ) -> Result<CommandOutput, RunnerError> {
        locked(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            dir: dir.map(Utf8Path::to_path_buf),
        });
        locked(&self.responses)
            .pop_front()
            .ok_or_else(|| RunnerError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }

    /// Removes variables while holding the global mutex, restoring them on
    /// drop.
    pub async fn unset_vars(keys: &[&str]) -> Self {
        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(keys.len());
        for key in keys {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::remove_var(key) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

#[derive(Debug)]
struct FakeInstance {
    name: String,
    states: VecDeque<InstanceState>,
}

impl FakeInstance {
    fn current(&mut self) -> InstanceState {
        if self.states.len() > 1 {
            self.states.pop_front().unwrap_or(InstanceState::Terminated)
        } else {
            self.states
                .front()
                .cloned()
                .unwrap_or(InstanceState::Terminated)
        }
    }
}

#[derive(Debug, Default)]
struct CloudState {
    images: Vec<ImageInfo>,
    instances: BTreeMap<String, FakeInstance>,
    launch_states: Option<Vec<InstanceState>>,
    launches: Vec<LaunchRequest>,
    launched: BTreeMap<String, String>,
    calls: Vec<String>,
    failures: BTreeMap<String, VecDeque<CloudError>>,
    rules: Vec<(String, CommandStatus)>,
    one_shot: Vec<(String, CommandStatus)>,
    commands: Vec<ShellCommand>,
    statuses: BTreeMap<String, CommandStatus>,
    objects: BTreeMap<String, String>,
    uploads: Vec<(String, Vec<Utf8PathBuf>)>,
    payload: BTreeMap<Utf8PathBuf, String>,
}

impl CloudState {
    fn check(&mut self, operation: &str) -> Result<(), CloudError> {
        self.failures
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
            .map_or(Ok(()), Err)
    }

    fn instance(&mut self, action: &str, id: &str) -> Result<&mut FakeInstance, CloudError> {
        self.instances
            .get_mut(id)
            .ok_or_else(|| CloudError::NotFound {
                action: action.to_owned(),
                resource: id.to_owned(),
            })
    }

    fn set_states(&mut self, action: &str, id: &str, states: &[InstanceState]) -> Result<(), CloudError> {
        self.calls.push(format!("{action} {id}"));
        let instance = self.instance(action, id)?;
        instance.states = states.iter().cloned().collect();
        Ok(())
    }
}

fn object_key(bucket: &str, key: &str) -> String {
    format!("{bucket}/{key}")
}

/// In-memory provider used to exercise the remote backend.
///
/// Instances move through scripted state sequences; each describe call
/// consumes one state and the last one persists. Commands finish with exit
/// code zero unless a rule registered with [`FakeCloud::respond_to`] matches.
#[derive(Clone, Debug, Default)]
pub struct FakeCloud {
    state: Arc<Mutex<CloudState>>,
}

impl FakeCloud {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, apply: impl FnOnce(&mut CloudState) -> T) -> T {
        apply(&mut locked(&self.state))
    }

    /// Adds a catalogue image.
    pub fn add_image(&self, id: &str, name: &str) {
        self.with_state(|state| {
            state.images.push(ImageInfo {
                id: id.to_owned(),
                name: name.to_owned(),
            });
        });
    }

    /// Adds an existing instance in `instance_state`.
    pub fn add_instance(&self, id: &str, name: &str, instance_state: InstanceState) {
        self.with_state(|state| {
            state.instances.insert(
                id.to_owned(),
                FakeInstance {
                    name: name.to_owned(),
                    states: VecDeque::from([instance_state]),
                },
            );
        });
    }

    /// Replaces the states launched instances report, in order.
    pub fn set_launch_states(&self, states: &[InstanceState]) {
        self.with_state(|state| state.launch_states = Some(states.to_vec()));
    }

    /// Fails the next call of `operation` with `error`.
    ///
    /// Operation names match the [`CloudApi`] method names, with `launch`,
    /// `start`, `stop` and `terminate` for the instance calls.
    /// `launch_response` fails a launch after the instance was created, as
    /// when the provider's reply is lost. Launches repeating a client token
    /// return the instance the first one created.
    pub fn fail_next(&self, operation: &str, error: CloudError) {
        self.with_state(|state| {
            state
                .failures
                .entry(operation.to_owned())
                .or_default()
                .push_back(error);
        });
    }

    /// Reports `status` for every command whose text contains `fragment`.
    pub fn respond_to(&self, fragment: &str, status: CommandStatus) {
        self.with_state(|state| state.rules.push((fragment.to_owned(), status)));
    }

    /// Reports `status` for the next command whose text contains `fragment`,
    /// ahead of any rule from [`FakeCloud::respond_to`].
    pub fn respond_once(&self, fragment: &str, status: CommandStatus) {
        self.with_state(|state| state.one_shot.push((fragment.to_owned(), status)));
    }

    /// Files written into the local directory by `download_dir`.
    pub fn set_download_payload(&self, files: &[(&str, &str)]) {
        self.with_state(|state| {
            state.payload = files
                .iter()
                .map(|(path, content)| (Utf8PathBuf::from(*path), (*content).to_owned()))
                .collect();
        });
    }

    /// Lifecycle calls made so far, such as `launch i-0001` or
    /// `terminate i-0001`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.with_state(|state| state.calls.clone())
    }

    /// Launch requests received so far.
    #[must_use]
    pub fn launches(&self) -> Vec<LaunchRequest> {
        self.with_state(|state| state.launches.clone())
    }

    /// Commands sent through the managed channel so far.
    #[must_use]
    pub fn commands(&self) -> Vec<ShellCommand> {
        self.with_state(|state| state.commands.clone())
    }

    /// Directory uploads so far: the prefix and the files it contained.
    #[must_use]
    pub fn uploads(&self) -> Vec<(String, Vec<Utf8PathBuf>)> {
        self.with_state(|state| state.uploads.clone())
    }

    /// Keys of the objects currently stored, as `bucket/key`.
    #[must_use]
    pub fn object_keys(&self) -> Vec<String> {
        self.with_state(|state| state.objects.keys().cloned().collect())
    }

    /// Stores an object directly.
    pub fn put_object(&self, bucket: &str, key: &str, content: &str) {
        self.with_state(|state| {
            state
                .objects
                .insert(object_key(bucket, key), content.to_owned());
        });
    }
}

impl CloudApi for FakeCloud {
    fn describe_images(&self, name_pattern: &str) -> Result<Vec<ImageInfo>, CloudError> {
        let family = name_pattern.trim_end_matches('*');
        self.with_state(|state| {
            state.check("describe_images")?;
            Ok(state
                .images
                .iter()
                .filter(|image| image.name.starts_with(family))
                .cloned()
                .collect())
        })
    }

    fn find_instances(&self, name: &str) -> Result<Vec<InstanceInfo>, CloudError> {
        self.with_state(|state| {
            state.check("find_instances")?;
            Ok(state
                .instances
                .iter_mut()
                .filter(|(_, instance)| instance.name == name)
                .map(|(id, instance)| InstanceInfo {
                    id: id.clone(),
                    state: instance.current(),
                })
                .filter(|info| info.state != InstanceState::Terminated)
                .collect())
        })
    }

    fn describe_instance(&self, id: &str) -> Result<InstanceInfo, CloudError> {
        self.with_state(|state| {
            state.check("describe_instance")?;
            let instance = state.instance("describe-instances", id)?;
            Ok(InstanceInfo {
                id: id.to_owned(),
                state: instance.current(),
            })
        })
    }

    fn launch_instance(&self, request: &LaunchRequest) -> Result<String, CloudError> {
        self.with_state(|state| {
            state.check("launch")?;
            state.launches.push(request.clone());
            if let Some(id) = state.launched.get(&request.client_token) {
                return Ok(id.clone());
            }
            let id = format!("i-{:04}", state.launched.len() + 1);
            state
                .launched
                .insert(request.client_token.clone(), id.clone());
            state.calls.push(format!("launch {id}"));
            let states = state
                .launch_states
                .clone()
                .unwrap_or_else(|| vec![InstanceState::Pending, InstanceState::Running]);
            state.instances.insert(
                id.clone(),
                FakeInstance {
                    name: request.name.clone(),
                    states: states.into(),
                },
            );
            state.check("launch_response")?;
            Ok(id)
        })
    }

    fn start_instance(&self, id: &str) -> Result<(), CloudError> {
        self.with_state(|state| {
            state.check("start")?;
            state.set_states(
                "start",
                id,
                &[InstanceState::Pending, InstanceState::Running],
            )
        })
    }

    fn stop_instance(&self, id: &str) -> Result<(), CloudError> {
        self.with_state(|state| {
            state.check("stop")?;
            state.set_states("stop", id, &[InstanceState::Stopping, InstanceState::Stopped])
        })
    }

    fn terminate_instance(&self, id: &str) -> Result<(), CloudError> {
        self.with_state(|state| {
            state.check("terminate")?;
            state.set_states(
                "terminate",
                id,
                &[InstanceState::ShuttingDown, InstanceState::Terminated],
            )
        })
    }

    fn upload_file(&self, local: &Utf8Path, bucket: &str, key: &str) -> Result<(), CloudError> {
        let content = fs::read_to_string(local).map_err(|err| CloudError::NotFound {
            action: String::from("s3 cp"),
            resource: format!("{local}: {err}"),
        })?;
        self.with_state(|state| {
            state.check("upload_file")?;
            state.objects.insert(object_key(bucket, key), content);
            Ok(())
        })
    }

    fn upload_dir(&self, local: &Utf8Path, _bucket: &str, prefix: &str) -> Result<(), CloudError> {
        let files = fileset::list_files(local).map_err(|err| CloudError::NotFound {
            action: String::from("s3 cp"),
            resource: err.to_string(),
        })?;
        self.with_state(|state| {
            state.check("upload_dir")?;
            state.uploads.push((prefix.to_owned(), files));
            Ok(())
        })
    }

    fn download_dir(&self, _bucket: &str, _prefix: &str, local: &Utf8Path) -> Result<(), CloudError> {
        let payload = self.with_state(|state| {
            state.check("download_dir")?;
            Ok::<_, CloudError>(state.payload.clone())
        })?;
        for (path, content) in payload {
            let destination = local.join(&path);
            let written = destination
                .parent()
                .map_or(Ok(()), fs::create_dir_all)
                .and_then(|()| fs::write(&destination, content));
            written.map_err(|err| CloudError::CommandFailure {
                action: String::from("s3 cp"),
                status: String::from("1"),
                stderr: err.to_string(),
            })?;
        }
        Ok(())
    }

    fn read_object(&self, bucket: &str, key: &str) -> Result<Option<String>, CloudError> {
        self.with_state(|state| {
            state.check("read_object")?;
            Ok(state.objects.get(&object_key(bucket, key)).cloned())
        })
    }

    fn delete_object(&self, bucket: &str, key: &str) -> Result<(), CloudError> {
        self.with_state(|state| {
            state.check("delete_object")?;
            state.objects.remove(&object_key(bucket, key));
            Ok(())
        })
    }

    fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<(), CloudError> {
        let scope = object_key(bucket, &format!("{prefix}/"));
        self.with_state(|state| {
            state.check("delete_prefix")?;
            state.objects.retain(|key, _| !key.starts_with(&scope));
            Ok(())
        })
    }

    fn send_command(&self, command: &ShellCommand) -> Result<String, CloudError> {
        self.with_state(|state| {
            state.check("send_command")?;
            let text = command.commands.join("\n");
            let one_shot = state
                .one_shot
                .iter()
                .position(|(fragment, _)| text.contains(fragment.as_str()))
                .map(|index| state.one_shot.remove(index).1);
            let status = one_shot.unwrap_or_else(|| {
                state
                    .rules
                    .iter()
                    .find(|(fragment, _)| text.contains(fragment.as_str()))
                    .map_or_else(|| CommandStatus::finished(0, "", ""), |(_, status)| status.clone())
            });
            let id = format!("cmd-{}", state.commands.len() + 1);
            state.commands.push(command.clone());
            state.statuses.insert(id.clone(), status);
            Ok(id)
        })
    }

    fn command_status(
        &self,
        command_id: &str,
        _instance_id: &str,
    ) -> Result<CommandStatus, CloudError> {
        self.with_state(|state| {
            state.check("command_status")?;
            state
                .statuses
                .get(command_id)
                .cloned()
                .ok_or_else(|| CloudError::NotFound {
                    action: String::from("get-command-invocation"),
                    resource: command_id.to_owned(),
                })
        })
    }
}
