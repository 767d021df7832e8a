//! Behavioural tests for `simferry execute` using the local backend.

use assert_cmd::cargo::cargo_bin_cmd;
use camino::{Utf8Path, Utf8PathBuf};
use predicates::prelude::*;
use predicates::str::contains;
use rstest::{fixture, rstest};
use tempfile::TempDir;

struct Workspace {
    _tmp: TempDir,
    root: Utf8PathBuf,
}

impl Workspace {
    fn write(&self, name: &str, contents: &str) -> Utf8PathBuf {
        let path = self.root.join(name);
        std::fs::write(&path, contents).expect("write workspace file");
        path
    }

    fn path(&self) -> &Utf8Path {
        &self.root
    }
}

#[fixture]
fn workspace() -> Workspace {
    let tmp = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 tempdir");
    Workspace { _tmp: tmp, root }
}

fn local_execute(workspace: &Workspace, specfile: &str) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("simferry");
    cmd.current_dir(workspace.path())
        .env_remove("SIMFERRY_LOCAL_SHELL")
        .env_remove("SIMFERRY_CONFIG_PATH")
        .args(["--backend", "local", "execute", specfile, "--set", "shell=sh"]);
    cmd
}

#[rstest]
fn step_exit_code_becomes_process_exit_code(workspace: Workspace) {
    workspace.write(
        "job.yml",
        concat!(
            "name: exit-three\n",
            "steps:\n",
            "  - run: echo first-step\n",
            "  - run: exit 3\n",
            "  - run: echo never-printed\n",
        ),
    );

    local_execute(&workspace, "job.yml")
        .assert()
        .code(3)
        .stdout(contains("first-step"))
        .stdout(contains("never-printed").not());
}

#[rstest]
fn successful_job_runs_in_the_working_directory(workspace: Workspace) {
    workspace.write("input.txt", "payload\n");
    workspace.write(
        "job.yml",
        concat!(
            "steps:\n",
            "  - run: cat input.txt > output.txt\n",
            "download:\n",
            "  - \"output.txt\"\n",
        ),
    );

    local_execute(&workspace, "job.yml").assert().success();

    let produced =
        std::fs::read_to_string(workspace.path().join("output.txt")).expect("output written");
    assert_eq!(produced, "payload\n");
}

#[rstest]
fn missing_specfile_is_a_configuration_error(workspace: Workspace) {
    local_execute(&workspace, "absent.yml")
        .assert()
        .code(64)
        .stderr(contains("absent.yml"));
}

#[rstest]
fn specfile_without_steps_is_rejected(workspace: Workspace) {
    workspace.write("job.yml", "name: empty\nsteps: []\n");

    local_execute(&workspace, "job.yml")
        .assert()
        .code(64)
        .stderr(contains("at least one step is required"));
}

#[rstest]
fn malformed_override_is_rejected(workspace: Workspace) {
    workspace.write("job.yml", "steps:\n  - run: \"true\"\n");

    let mut cmd = cargo_bin_cmd!("simferry");
    cmd.current_dir(workspace.path())
        .args(["--backend", "local", "execute", "job.yml", "--set", "shell"]);
    cmd.assert().code(64).stderr(contains("KEY=VALUE"));
}
