//! Integration tests for loading specfiles and resolving their file sets.

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use rstest::{fixture, rstest};
use simferry::{BackendKind, JobSpec, fileset};
use tempfile::TempDir;

struct Project {
    _tmp: TempDir,
    root: Utf8PathBuf,
}

#[fixture]
fn project() -> Project {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp dir should be utf8: {}", path.display()));
    let dir = Dir::open_ambient_dir(&root, ambient_authority())
        .unwrap_or_else(|err| panic!("open temp dir: {err}"));
    for (path, contents) in [
        ("sim/Makefile", "all:\n"),
        ("sim/src/main.c", "int main(void) { return 0; }\n"),
        ("sim/src/main.o", "obj"),
        ("sim/.cache/state", "hidden"),
        ("sim/README.md", "readme"),
    ] {
        if let Some(parent) = camino::Utf8Path::new(path).parent() {
            dir.create_dir_all(parent)
                .unwrap_or_else(|err| panic!("create {parent}: {err}"));
        }
        dir.write(path, contents)
            .unwrap_or_else(|err| panic!("write {path}: {err}"));
    }
    dir.write(
        "job.yml",
        concat!(
            "name: blinky\n",
            "workdir: sim\n",
            "upload:\n",
            "  - \"**/*\"\n",
            "  - \"-:**/*.o\"\n",
            "  - \"-:README.md\"\n",
            "steps:\n",
            "  - run: make\n",
            "download:\n",
            "  - \"out/**\"\n",
            "backend:\n",
            "  aws:\n",
            "    instance_type: c5.xlarge\n",
            "    keep_ec2_instances: true\n",
            "  local:\n",
            "    shell: sh\n",
        ),
    )
    .unwrap_or_else(|err| panic!("write specfile: {err}"));
    Project { _tmp: tmp, root }
}

#[rstest]
fn workdir_resolves_relative_to_the_specfile(project: Project) {
    let spec = JobSpec::load(&project.root.join("job.yml"))
        .unwrap_or_else(|err| panic!("spec should load: {err}"));

    assert_eq!(spec.label(), "blinky");
    assert!(spec.workdir.ends_with("sim"), "workdir: {}", spec.workdir);
    assert!(spec.workdir.is_dir());
}

#[rstest]
fn upload_patterns_select_sources_only(project: Project) {
    let spec = JobSpec::load(&project.root.join("job.yml"))
        .unwrap_or_else(|err| panic!("spec should load: {err}"));

    let files = fileset::resolve(&spec.workdir, &spec.upload)
        .unwrap_or_else(|err| panic!("upload set should resolve: {err}"));
    let mut rendered: Vec<&str> = files.iter().map(|path| path.as_str()).collect();
    rendered.sort_unstable();

    assert_eq!(rendered, ["Makefile", "src/main.c"]);
}

#[rstest]
fn backend_sections_are_selected_by_kind(project: Project) {
    let spec = JobSpec::load(&project.root.join("job.yml"))
        .unwrap_or_else(|err| panic!("spec should load: {err}"));

    let remote = spec.backend_options(BackendKind::Remote);
    assert_eq!(remote.get("instance_type"), Some("c5.xlarge"));
    assert_eq!(remote.get("keep_ec2_instances"), Some("true"));
    assert_eq!(remote.get("shell"), None);

    let local = spec.backend_options(BackendKind::Local);
    assert_eq!(local.get("shell"), Some("sh"));
    assert!(local.get("instance_type").is_none());
}
