//! Test doubles for the orchestrator.
//!
//! Provides a scripted backend that records every phase call and allows a
//! failure or a stall to be injected at any phase.

use std::future::pending;
use std::sync::{Arc, Mutex, MutexGuard};

use camino::{Utf8Path, Utf8PathBuf};
use simferry::backend::BackendFuture;
use simferry::{
    Backend, BackendKind, CleanupError, ExecutionResult, FileSet, ProvisioningError,
    RemoteExecutionError, TransferError,
};

#[derive(Clone, Debug)]
pub struct ScriptedBackend {
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<String>,
    fail_at: Option<String>,
    stall_at: Option<String>,
    exit_code: i32,
    listing: Vec<Utf8PathBuf>,
    downloaded: Vec<Utf8PathBuf>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|err| panic!("scripted backend lock poisoned: {err}"))
    }

    pub fn fail_at(&self, phase: &str) {
        self.state().fail_at = Some(phase.to_owned());
    }

    pub fn stall_at(&self, phase: &str) {
        self.state().stall_at = Some(phase.to_owned());
    }

    pub fn exit_with(&self, code: i32) {
        self.state().exit_code = code;
    }

    pub fn list(&self, paths: &[&str]) {
        self.state().listing = paths.iter().map(Utf8PathBuf::from).collect();
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, phase: &str) -> usize {
        self.state().calls.iter().filter(|call| *call == phase).count()
    }

    pub fn downloaded(&self) -> Vec<Utf8PathBuf> {
        self.state().downloaded.clone()
    }

    /// Records `phase` and reports whether it should fail or stall.
    fn enter(&self, phase: &str) -> (bool, bool) {
        let mut state = self.state();
        state.calls.push(phase.to_owned());
        (
            state.fail_at.as_deref() == Some(phase),
            state.stall_at.as_deref() == Some(phase),
        )
    }
}

async fn settle<T, E>(stall: bool, failure: Option<E>, value: T) -> Result<T, E> {
    if stall {
        pending::<()>().await;
    }
    failure.map_or(Ok(value), Err)
}

fn transfer_error(phase: &str) -> TransferError {
    TransferError::Provider {
        action: phase.to_owned(),
        message: String::from("scripted failure"),
    }
}

impl Backend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn prepare(&mut self) -> BackendFuture<'_, (), ProvisioningError> {
        let (fail, stall) = self.enter("prepare");
        let failure = fail.then(|| ProvisioningError::Provider {
            action: String::from("prepare"),
            message: String::from("scripted failure"),
        });
        Box::pin(settle(stall, failure, ()))
    }

    fn upload<'a>(
        &'a mut self,
        _root: &'a Utf8Path,
        _files: &'a FileSet,
    ) -> BackendFuture<'a, (), TransferError> {
        let (fail, stall) = self.enter("upload");
        Box::pin(settle(stall, fail.then(|| transfer_error("upload")), ()))
    }

    fn run<'a>(
        &'a mut self,
        steps: &'a [String],
    ) -> BackendFuture<'a, ExecutionResult, RemoteExecutionError> {
        let (fail, stall) = self.enter("run");
        let result = ExecutionResult {
            exit_code: self.state().exit_code,
            stdout: steps.join("\n"),
            stderr: String::new(),
        };
        let failure = fail.then(|| RemoteExecutionError::Channel {
            step: 1,
            message: String::from("scripted failure"),
        });
        Box::pin(settle(stall, failure, result))
    }

    fn workspace_listing<'a>(
        &'a mut self,
        _root: &'a Utf8Path,
    ) -> BackendFuture<'a, Vec<Utf8PathBuf>, TransferError> {
        let (fail, stall) = self.enter("listing");
        let listing = self.state().listing.clone();
        Box::pin(settle(stall, fail.then(|| transfer_error("listing")), listing))
    }

    fn download<'a>(
        &'a mut self,
        _root: &'a Utf8Path,
        files: &'a FileSet,
    ) -> BackendFuture<'a, (), TransferError> {
        let (fail, stall) = self.enter("download");
        self.state().downloaded = files.paths().to_vec();
        Box::pin(settle(stall, fail.then(|| transfer_error("download")), ()))
    }

    fn cleanup(&mut self) -> BackendFuture<'_, (), CleanupError> {
        let (fail, stall) = self.enter("cleanup");
        let failure = fail.then(|| CleanupError::Provider {
            target: String::from("scripted"),
            action: String::from("cleanup"),
            message: String::from("scripted failure"),
        });
        Box::pin(settle(stall, failure, ()))
    }
}
