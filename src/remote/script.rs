//! Shell command lines sent to the target through the managed channel.
//!
//! Workload commands run as the image's login user via `runuser`, so the
//! user's profile and captured environment apply.

use std::borrow::Cow;

use shell_escape::unix::escape;

/// Home directory of the login user on the image.
pub const HOME_DIR: &str = "/home/ubuntu";

/// Directory steps run in.
pub const WORKSPACE_DIR: &str = "/home/ubuntu/workspace";

/// Captured login environment sourced before every step.
pub const VARS_FILE: &str = "/home/ubuntu/vars";

/// Scratch directory used to collect download results.
pub const DOWNLOAD_STAGE_DIR: &str = "/home/ubuntu/download";

/// Local copy of the download manifest on the target.
pub const MANIFEST_FILE: &str = "/home/ubuntu/download.manifest";

const LOGIN_USER: &str = "ubuntu";

const PACK_INDEX_URL: &str = "https://www.keil.com/pack/index.pidx";

fn quote(value: &str) -> Cow<'_, str> {
    escape(Cow::Borrowed(value))
}

/// Wraps `inner` so it runs in a login shell of the image user.
#[must_use]
pub fn as_login_user(inner: &str) -> String {
    format!("runuser -l {LOGIN_USER} -c {}", quote(inner))
}

fn s3_url(bucket: &str, key: &str) -> String {
    format!("s3://{bucket}/{key}")
}

/// First-boot preparation for newly created targets: captures the login
/// environment, primes the pack index and installs the provider client.
#[must_use]
pub fn bootstrap() -> Vec<String> {
    vec![
        as_login_user(&format!("cat ~/.bashrc | grep export > {VARS_FILE}")),
        as_login_user(&format!("mkdir -p {HOME_DIR}/packs/.Web")),
        as_login_user(&format!(
            "wget -N {PACK_INDEX_URL} -O {HOME_DIR}/packs/.Web/index.pidx"
        )),
        String::from("apt update"),
        String::from("apt install awscli -y"),
    ]
}

/// Recreates an empty workspace directory.
#[must_use]
pub fn reset_workspace() -> Vec<String> {
    vec![
        as_login_user(&format!("rm -rf {WORKSPACE_DIR}")),
        as_login_user(&format!("mkdir -p {WORKSPACE_DIR}")),
    ]
}

/// Copies the staged upload prefix into the workspace.
#[must_use]
pub fn fetch_upload(bucket: &str, prefix: &str, region: &str) -> Vec<String> {
    let source = s3_url(bucket, &format!("{prefix}/"));
    vec![as_login_user(&format!(
        "aws s3 cp {} {WORKSPACE_DIR}/ --recursive --region {}",
        quote(&source),
        quote(region)
    ))]
}

/// Lists every regular file in the workspace, one relative path per line.
#[must_use]
pub fn list_workspace() -> Vec<String> {
    vec![as_login_user(&format!("cd {WORKSPACE_DIR} && find . -type f"))]
}

/// Copies the files named in the manifest object into a stage and pushes
/// the stage to `bucket/stage_prefix/`. Files missing from the workspace are
/// skipped; the stage is removed whatever the outcome.
#[must_use]
pub fn push_download(
    bucket: &str,
    manifest_key: &str,
    stage_prefix: &str,
    region: &str,
) -> Vec<String> {
    let region = quote(region);
    let manifest = quote_owned(s3_url(bucket, manifest_key));
    let target = quote_owned(s3_url(bucket, &format!("{stage_prefix}/")));
    let collect = format!(
        "aws s3 cp {manifest} {MANIFEST_FILE} --region {region} \
         && rm -rf {DOWNLOAD_STAGE_DIR} && mkdir -p {DOWNLOAD_STAGE_DIR} \
         && cd {WORKSPACE_DIR} \
         && while IFS= read -r path; do \
         if [ -f \"$path\" ]; then cp --parents \"$path\" {DOWNLOAD_STAGE_DIR}/ || exit 1; fi; \
         done < {MANIFEST_FILE} \
         && aws s3 cp {DOWNLOAD_STAGE_DIR}/ {target} --recursive --region {region}"
    );
    vec![as_login_user(&format!(
        "{collect}; status=$?; rm -rf {DOWNLOAD_STAGE_DIR} {MANIFEST_FILE}; exit $status"
    ))]
}

fn quote_owned(value: String) -> String {
    escape(Cow::Owned(value)).into_owned()
}

/// Target-side path of step script `step`.
#[must_use]
pub fn step_script_path(step: usize) -> String {
    format!("{HOME_DIR}/step-{step}.sh")
}

/// Fetches step script `key` and marks it executable.
#[must_use]
pub fn fetch_step(bucket: &str, key: &str, step: usize, region: &str) -> Vec<String> {
    let path = step_script_path(step);
    vec![as_login_user(&format!(
        "aws s3 cp {} {path} --region {} && chmod +x {path}",
        quote_owned(s3_url(bucket, key)),
        quote(region)
    ))]
}

/// Runs step script `step` inside the workspace with the captured
/// environment, then removes it.
#[must_use]
pub fn run_step(step: usize) -> Vec<String> {
    let path = step_script_path(step);
    vec![as_login_user(&format!(
        "source {VARS_FILE} && pushd {WORKSPACE_DIR} > /dev/null && {path}; \
         status=$?; rm -f {path}; exit $status"
    ))]
}
