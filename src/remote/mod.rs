//! Backend that runs jobs on a cloud instance.
//!
//! The instance is created for the run (or an existing one is reused),
//! files travel through a staging bucket, and commands run through the
//! provider's managed command channel. Everything the backend stages lives
//! under `<key_prefix>/<run_token>/` so concurrent runs never collide.

use std::env;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use uuid::Uuid;

use crate::backend::{
    Backend, BackendFuture, BackendKind, CleanupError, ExecutionResult, ProvisioningError,
    RemoteExecutionError, RemoteTarget, TargetState, TransferError,
};
use crate::config::RemoteConfig;
use crate::fileset::FileSet;
use crate::poll::PollPolicy;

mod channel;
mod lifecycle;
mod transfer;

pub mod api;
pub mod aws;
pub mod script;
pub mod user_data;

pub use api::{
    CloudApi, CloudError, CommandState, CommandStatus, ImageInfo, InstanceInfo, InstanceState,
    LaunchRequest, ShellCommand,
};
pub use aws::AwsCli;

/// Catalogue name pattern of the simulation images.
pub const IMAGE_FAMILY: &str = "ArmVirtualHardware-*";

/// Runs jobs on a cloud instance reached through `A`.
#[derive(Debug)]
pub struct RemoteBackend<A: CloudApi> {
    config: RemoteConfig,
    api: A,
    run_token: String,
    fallback_name: String,
    backoff: (Duration, Duration),
    target: Option<RemoteTarget>,
    bootstrap_pending: bool,
    prepared: bool,
}

impl RemoteBackend<AwsCli> {
    /// Creates a backend that drives the provider through its command-line
    /// client.
    #[must_use]
    pub fn from_config(config: RemoteConfig) -> Self {
        let api = AwsCli::new(config.cli_bin.clone(), config.default_region.clone());
        Self::new(config, api)
    }
}

impl<A: CloudApi> RemoteBackend<A> {
    /// Creates a backend with a fresh run token.
    #[must_use]
    pub fn new(config: RemoteConfig, api: A) -> Self {
        Self {
            config,
            api,
            run_token: Uuid::new_v4().to_string(),
            fallback_name: default_instance_name(),
            backoff: (Duration::from_secs(1), Duration::from_secs(30)),
            target: None,
            bootstrap_pending: false,
            prepared: false,
        }
    }

    /// Replaces the run token naming this run's staging namespace.
    #[must_use]
    pub fn with_run_token(mut self, token: impl Into<String>) -> Self {
        self.run_token = token.into();
        self
    }

    /// Replaces the instance name used when none is configured.
    #[must_use]
    pub fn with_fallback_name(mut self, name: impl Into<String>) -> Self {
        self.fallback_name = name.into();
        self
    }

    /// Replaces the backoff schedule for transient provider failures.
    #[must_use]
    pub const fn with_retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff = (initial, max);
        self
    }

    /// Token naming this run's staging namespace.
    #[must_use]
    pub fn run_token(&self) -> &str {
        &self.run_token
    }

    /// The instance currently held, if any.
    #[must_use]
    pub const fn target(&self) -> Option<&RemoteTarget> {
        self.target.as_ref()
    }

    /// Settings the backend runs with.
    #[must_use]
    pub const fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn staging_key(&self, leaf: &str) -> String {
        format!(
            "{}/{}/{leaf}",
            self.config.s3_keyprefix.trim_end_matches('/'),
            self.run_token
        )
    }

    const fn ready_policy(&self) -> PollPolicy {
        let (initial, max) = self.backoff;
        self.config.ready_policy().with_backoff(initial, max)
    }

    const fn command_policy(&self) -> PollPolicy {
        let (initial, max) = self.backoff;
        self.config.command_policy().with_backoff(initial, max)
    }

    fn prepared_target_id(&self) -> Option<String> {
        self.target
            .as_ref()
            .filter(|_| self.prepared)
            .map(|target| target.id().to_owned())
    }

    fn advance(&mut self, next: TargetState) {
        if let Some(target) = self.target.as_mut() {
            advance(target, next);
        }
    }
}

fn advance(target: &mut RemoteTarget, next: TargetState) {
    if let Err(err) = target.transition(next) {
        tracing::warn!(error = %err, "ignoring lifecycle transition");
    }
}

/// Name given to created instances when none is configured: `user@host`,
/// falling back to `unknown` for either part.
///
/// The host comes from `HOSTNAME` when exported, else from `/etc/hostname`.
#[must_use]
pub fn default_instance_name() -> String {
    let user = env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .unwrap_or_else(|_| String::from("unknown"));
    let host = env::var("HOSTNAME")
        .ok()
        .and_then(|name| non_blank(&name))
        .or_else(|| host_file_name(Utf8Path::new(HOST_FILE_DIR)))
        .unwrap_or_else(|| String::from("unknown"));
    format!("{user}@{host}")
}

const HOST_FILE_DIR: &str = "/etc";

fn host_file_name(dir: &Utf8Path) -> Option<String> {
    Dir::open_ambient_dir(dir, ambient_authority())
        .and_then(|etc| etc.read_to_string("hostname"))
        .ok()
        .and_then(|text| non_blank(&text))
}

fn non_blank(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

impl<A: CloudApi> Backend for RemoteBackend<A> {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn prepare(&mut self) -> BackendFuture<'_, (), ProvisioningError> {
        Box::pin(self.prepare_target())
    }

    fn upload<'a>(
        &'a mut self,
        root: &'a Utf8Path,
        files: &'a FileSet,
    ) -> BackendFuture<'a, (), TransferError> {
        Box::pin(self.upload_files(root, files))
    }

    fn run<'a>(
        &'a mut self,
        steps: &'a [String],
    ) -> BackendFuture<'a, ExecutionResult, RemoteExecutionError> {
        Box::pin(self.run_steps(steps))
    }

    fn workspace_listing<'a>(
        &'a mut self,
        _root: &'a Utf8Path,
    ) -> BackendFuture<'a, Vec<Utf8PathBuf>, TransferError> {
        Box::pin(self.list_workspace())
    }

    fn download<'a>(
        &'a mut self,
        root: &'a Utf8Path,
        files: &'a FileSet,
    ) -> BackendFuture<'a, (), TransferError> {
        Box::pin(self.download_files(root, files))
    }

    fn cleanup(&mut self) -> BackendFuture<'_, (), CleanupError> {
        Box::pin(self.release_target())
    }
}
