//! Configuration loading via `ortho-config`.
//!
//! Each backend has its own configuration struct. Values merge defaults,
//! `simferry.toml`, and environment variables when loaded; specfile options
//! and `--set` overrides are applied on top with [`RemoteConfig::apply_options`]
//! and [`LocalConfig::apply_options`].

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::poll::PollPolicy;

/// Configuration file consulted by every backend.
pub const CONFIG_FILE_NAME: &str = "simferry.toml";

/// Describes one backend option for error messages and `simferry options`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OptionInfo {
    /// Key used in specfiles, `--set` and the configuration file.
    pub key: &'static str,
    /// Environment variable supplying the option.
    pub env_var: &'static str,
    /// Default applied when no source sets the option.
    pub default: Option<&'static str>,
    /// Short human-readable description.
    pub description: &'static str,
}

impl OptionInfo {
    const fn new(
        key: &'static str,
        env_var: &'static str,
        default: Option<&'static str>,
        description: &'static str,
    ) -> Self {
        Self {
            key,
            env_var,
            default,
            description,
        }
    }

    /// Builds an actionable error for a missing required value.
    #[must_use]
    pub fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to {CONFIG_FILE_NAME} or the specfile backend options",
            self.description, self.env_var, self.key
        ))
    }
}

/// Backend-specific key/value options from the specfile and `--set` flags.
///
/// Keys are normalised by replacing `-` with `_`, so `instance-type` and
/// `instance_type` address the same option.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BackendOptions(BTreeMap<String, String>);

impl BackendOptions {
    /// Creates an empty option set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an option, replacing any earlier value for the same key.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(normalise_key(key), value.into());
    }

    /// Returns the value for `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&normalise_key(key)).map(String::as_str)
    }

    /// Returns `true` when no options are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the options in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Overlays `other` on top of `self`; values in `other` win.
    pub fn merge(&mut self, other: &Self) {
        for (key, value) in other.iter() {
            self.0.insert(key.to_owned(), value.to_owned());
        }
    }

    /// Parses `KEY=VALUE` assignments as given to `--set`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] when an assignment lacks `=` or
    /// has an empty key.
    pub fn from_assignments<S: AsRef<str>>(assignments: &[S]) -> Result<Self, ConfigError> {
        let mut options = Self::new();
        for raw in assignments {
            let text = raw.as_ref();
            let Some((key, value)) = text.split_once('=') else {
                return Err(ConfigError::InvalidOption {
                    key: text.to_owned(),
                    value: String::new(),
                    reason: String::from("expected KEY=VALUE"),
                });
            };
            if key.trim().is_empty() {
                return Err(ConfigError::InvalidOption {
                    key: String::new(),
                    value: value.to_owned(),
                    reason: String::from("option key must not be empty"),
                });
            }
            options.insert(key.trim(), value.trim());
        }
        Ok(options)
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for BackendOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut options = Self::new();
        for (key, value) in iter {
            options.insert(key.as_ref(), value);
        }
        options
    }
}

fn normalise_key(key: &str) -> String {
    key.trim().replace('-', "_").to_ascii_lowercase()
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" | "" => Ok(false),
        _ => Err(ConfigError::InvalidOption {
            key: key.to_owned(),
            value: value.to_owned(),
            reason: String::from("expected true or false"),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidOption {
            key: key.to_owned(),
            value: value.to_owned(),
            reason: String::from("expected a non-negative integer"),
        })
}

/// Settings for the remote backend derived from defaults, configuration
/// files, environment variables (`AWS_` prefix), specfile options and CLI
/// overrides.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "AWS",
    discovery(
        app_name = "simferry",
        env_var = "SIMFERRY_CONFIG_PATH",
        config_file_name = "simferry.toml",
        dotfile_name = ".simferry.toml",
        project_file_name = "simferry.toml"
    )
)]
pub struct RemoteConfig {
    /// Explicit image identifier; skips catalogue resolution when set.
    pub ami_id: Option<String>,
    /// Version constraint applied to catalogue images.
    #[ortho_config(default = "==*".to_owned())]
    pub ami_version: String,
    /// Provider region for every call.
    #[ortho_config(default = "eu-west-1".to_owned())]
    pub default_region: String,
    /// Shared file system mounted on new targets for the packs directory.
    pub efs_dns_name: Option<String>,
    /// Directory on the shared file system holding packs.
    #[ortho_config(default = "packs".to_owned())]
    pub efs_packs_dir: String,
    /// Instance profile attached to new targets.
    pub iam_profile: Option<String>,
    /// Name tag for new targets; an existing target with this name is reused.
    pub instance_name: Option<String>,
    /// Existing target to reuse instead of creating one.
    pub instance_id: Option<String>,
    /// Instance type for new targets.
    #[ortho_config(default = "c5.large".to_owned())]
    pub instance_type: String,
    /// Key pair installed on new targets.
    pub key_name: Option<String>,
    /// Object store bucket used for staging and command output.
    pub s3_bucket_name: Option<String>,
    /// Key prefix under which staging and command output are written.
    #[ortho_config(default = "ssm".to_owned())]
    pub s3_keyprefix: String,
    /// Security group attached to new targets.
    pub security_group_id: Option<String>,
    /// Subnet new targets are launched into.
    pub subnet_id: Option<String>,
    /// Stop created targets instead of terminating them.
    #[ortho_config(default = false)]
    pub keep_ec2_instances: bool,
    /// Provider CLI executable.
    #[ortho_config(default = "aws".to_owned())]
    pub cli_bin: String,
    /// Seconds between status checks.
    #[ortho_config(default = 5)]
    pub poll_interval_secs: u64,
    /// Status checks allowed while waiting for a target to become ready.
    #[ortho_config(default = 120)]
    pub ready_max_attempts: u32,
    /// Status checks allowed while waiting for a command to finish.
    #[ortho_config(default = 120)]
    pub command_max_attempts: u32,
    /// Seconds a command may run on the target before it is cancelled.
    #[ortho_config(default = 600)]
    pub command_timeout_secs: u64,
}

impl RemoteConfig {
    /// Every option the remote backend understands.
    pub const OPTIONS: [OptionInfo; 20] = [
        OptionInfo::new("ami_id", "AWS_AMI_ID", None, "image identifier"),
        OptionInfo::new("ami_version", "AWS_AMI_VERSION", Some("==*"), "image version constraint"),
        OptionInfo::new("default_region", "AWS_DEFAULT_REGION", Some("eu-west-1"), "provider region"),
        OptionInfo::new("efs_dns_name", "AWS_EFS_DNS_NAME", None, "shared packs file system"),
        OptionInfo::new("efs_packs_dir", "AWS_EFS_PACKS_DIR", Some("packs"), "shared packs directory"),
        OptionInfo::new("iam_profile", "AWS_IAM_PROFILE", None, "instance profile"),
        OptionInfo::new("instance_name", "AWS_INSTANCE_NAME", None, "instance name tag"),
        OptionInfo::new("instance_id", "AWS_INSTANCE_ID", None, "instance to reuse"),
        OptionInfo::new("instance_type", "AWS_INSTANCE_TYPE", Some("c5.large"), "instance type"),
        OptionInfo::new("key_name", "AWS_KEY_NAME", None, "key pair name"),
        OptionInfo::new("s3_bucket_name", "AWS_S3_BUCKET_NAME", None, "staging bucket"),
        OptionInfo::new("s3_keyprefix", "AWS_S3_KEYPREFIX", Some("ssm"), "staging key prefix"),
        OptionInfo::new("security_group_id", "AWS_SECURITY_GROUP_ID", None, "security group"),
        OptionInfo::new("subnet_id", "AWS_SUBNET_ID", None, "subnet"),
        OptionInfo::new("keep_ec2_instances", "AWS_KEEP_EC2_INSTANCES", Some("false"), "keep created instances"),
        OptionInfo::new("cli_bin", "AWS_CLI_BIN", Some("aws"), "provider CLI executable"),
        OptionInfo::new("poll_interval_secs", "AWS_POLL_INTERVAL_SECS", Some("5"), "seconds between status checks"),
        OptionInfo::new("ready_max_attempts", "AWS_READY_MAX_ATTEMPTS", Some("120"), "readiness status checks"),
        OptionInfo::new("command_max_attempts", "AWS_COMMAND_MAX_ATTEMPTS", Some("120"), "command status checks"),
        OptionInfo::new("command_timeout_secs", "AWS_COMMAND_TIMEOUT_SECS", Some("600"), "command timeout in seconds"),
    ];

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("simferry")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Looks up the metadata for `key`.
    #[must_use]
    pub fn option(key: &str) -> Option<&'static OptionInfo> {
        Self::OPTIONS.iter().find(|info| info.key == key)
    }

    /// Applies specfile or CLI options on top of the loaded values. Unknown
    /// keys are logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] when a boolean or numeric option
    /// cannot be parsed.
    pub fn apply_options(&mut self, options: &BackendOptions) -> Result<(), ConfigError> {
        for (key, value) in options.iter() {
            match key {
                "ami_id" => self.ami_id = non_empty(value),
                "ami_version" => value.trim().clone_into(&mut self.ami_version),
                "default_region" => value.trim().clone_into(&mut self.default_region),
                "efs_dns_name" => self.efs_dns_name = non_empty(value),
                "efs_packs_dir" => value.trim().clone_into(&mut self.efs_packs_dir),
                "iam_profile" => self.iam_profile = non_empty(value),
                "instance_name" => self.instance_name = non_empty(value),
                "instance_id" => self.instance_id = non_empty(value),
                "instance_type" => value.trim().clone_into(&mut self.instance_type),
                "key_name" => self.key_name = non_empty(value),
                "s3_bucket_name" => self.s3_bucket_name = non_empty(value),
                "s3_keyprefix" => value.trim().clone_into(&mut self.s3_keyprefix),
                "security_group_id" => self.security_group_id = non_empty(value),
                "subnet_id" => self.subnet_id = non_empty(value),
                "keep_ec2_instances" | "keep_ec2_instance" => {
                    self.keep_ec2_instances = parse_bool(key, value)?;
                }
                "cli_bin" => value.trim().clone_into(&mut self.cli_bin),
                "poll_interval_secs" => self.poll_interval_secs = parse_number(key, value)?,
                "ready_max_attempts" => self.ready_max_attempts = parse_number(key, value)?,
                "command_max_attempts" => self.command_max_attempts = parse_number(key, value)?,
                "command_timeout_secs" => self.command_timeout_secs = parse_number(key, value)?,
                _ => warn!(backend = "remote", option = key, "ignoring unknown backend option"),
            }
        }
        Ok(())
    }

    /// Checks the settings every remote run needs. Settings only needed to
    /// create a target are checked when one is created.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] with guidance on how to supply
    /// the value, or [`ConfigError::InvalidOption`] when a polling budget
    /// allows no status checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require(self.s3_bucket_name.as_deref().unwrap_or_default(), "s3_bucket_name")?;
        Self::require(&self.default_region, "default_region")?;
        Self::require(&self.cli_bin, "cli_bin")?;
        Self::require(&self.s3_keyprefix, "s3_keyprefix")?;
        Self::require(&self.instance_type, "instance_type")?;
        Self::require_attempts(self.ready_max_attempts, "ready_max_attempts")?;
        Self::require_attempts(self.command_max_attempts, "command_max_attempts")?;
        Ok(())
    }

    fn require_attempts(attempts: u32, key: &str) -> Result<(), ConfigError> {
        if attempts > 0 {
            return Ok(());
        }
        Err(ConfigError::InvalidOption {
            key: key.to_owned(),
            value: attempts.to_string(),
            reason: String::from("at least one status check is required"),
        })
    }

    fn require(value: &str, key: &str) -> Result<(), ConfigError> {
        if !value.trim().is_empty() {
            return Ok(());
        }
        Err(Self::option(key).map_or_else(
            || ConfigError::MissingField(key.to_owned()),
            OptionInfo::missing,
        ))
    }

    /// Returns the staging bucket, or an empty string when unset.
    #[must_use]
    pub fn bucket(&self) -> &str {
        self.s3_bucket_name.as_deref().unwrap_or_default()
    }

    /// Polling policy for target readiness and teardown.
    #[must_use]
    pub const fn ready_policy(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(self.poll_interval_secs),
            self.ready_max_attempts,
        )
    }

    /// Polling policy for command completion.
    #[must_use]
    pub const fn command_policy(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(self.poll_interval_secs),
            self.command_max_attempts,
        )
    }
}

/// Settings for the local backend.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SIMFERRY_LOCAL",
    discovery(
        app_name = "simferry",
        env_var = "SIMFERRY_CONFIG_PATH",
        config_file_name = "simferry.toml",
        dotfile_name = ".simferry.toml",
        project_file_name = "simferry.toml"
    )
)]
pub struct LocalConfig {
    /// Interpreter used to run step scripts.
    #[ortho_config(default = "bash".to_owned())]
    pub shell: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            shell: String::from("bash"),
        }
    }
}

impl LocalConfig {
    /// Every option the local backend understands.
    pub const OPTIONS: [OptionInfo; 1] = [OptionInfo::new(
        "shell",
        "SIMFERRY_LOCAL_SHELL",
        Some("bash"),
        "step interpreter",
    )];

    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("simferry")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Applies specfile or CLI options on top of the loaded values.
    pub fn apply_options(&mut self, options: &BackendOptions) {
        for (key, value) in options.iter() {
            match key {
                "shell" => value.trim().clone_into(&mut self.shell),
                _ => warn!(backend = "local", option = key, "ignoring unknown backend option"),
            }
        }
    }

    /// Checks that an interpreter is configured.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when the shell is blank.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shell.trim().is_empty() {
            return Err(Self::OPTIONS[0].missing());
        }
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// Raised when a backend option value cannot be interpreted.
    #[error("invalid value '{value}' for option '{key}': {reason}")]
    InvalidOption {
        /// Option key after normalisation.
        key: String,
        /// Value as written.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
    /// Raised when the specfile cannot be read or is malformed.
    #[error("invalid specfile {path}: {message}")]
    Specfile {
        /// Specfile that was read.
        path: String,
        /// What went wrong.
        message: String,
    },
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn remote() -> RemoteConfig {
        RemoteConfig {
            ami_id: None,
            ami_version: String::from("==*"),
            default_region: String::from("eu-west-1"),
            efs_dns_name: None,
            efs_packs_dir: String::from("packs"),
            iam_profile: None,
            instance_name: None,
            instance_id: None,
            instance_type: String::from("c5.large"),
            key_name: None,
            s3_bucket_name: Some(String::from("bucket")),
            s3_keyprefix: String::from("ssm"),
            security_group_id: None,
            subnet_id: None,
            keep_ec2_instances: false,
            cli_bin: String::from("aws"),
            poll_interval_secs: 5,
            ready_max_attempts: 120,
            command_max_attempts: 120,
            command_timeout_secs: 600,
        }
    }

    #[rstest]
    fn options_normalise_dashes_and_case() {
        let options: BackendOptions = [("Instance-Type", "m5.large")].into_iter().collect();
        assert_eq!(options.get("instance_type"), Some("m5.large"));
        assert_eq!(options.get("instance-type"), Some("m5.large"));
    }

    #[rstest]
    fn merge_prefers_overlay_values() {
        let mut base: BackendOptions = [("a", "1"), ("b", "2")].into_iter().collect();
        let overlay: BackendOptions = [("b", "3")].into_iter().collect();
        base.merge(&overlay);
        assert_eq!(base.iter().collect::<Vec<_>>(), [("a", "1"), ("b", "3")]);
    }

    #[rstest]
    #[case::missing_equals("instance_type")]
    #[case::empty_key("=value")]
    fn malformed_assignments_are_rejected(#[case] raw: &str) {
        let err = BackendOptions::from_assignments(&[raw]).expect_err("should fail");
        assert!(matches!(err, ConfigError::InvalidOption { .. }), "{err:?}");
    }

    #[rstest]
    fn assignments_keep_equals_in_values() {
        let options =
            BackendOptions::from_assignments(&["ami-version= >=1.2 ", "tag=a=b"]).expect("parse");
        assert_eq!(options.get("ami_version"), Some(">=1.2"));
        assert_eq!(options.get("tag"), Some("a=b"));
    }

    #[rstest]
    #[case("ready_max_attempts")]
    #[case("command_max_attempts")]
    fn zero_status_checks_are_rejected(mut remote: RemoteConfig, #[case] key: &str) {
        let options: BackendOptions = [(key, "0")].into_iter().collect();
        remote.apply_options(&options).expect("zero parses");

        let err = remote.validate().expect_err("zero attempts");
        assert!(
            matches!(err, ConfigError::InvalidOption { key: ref reported, .. } if reported == key),
            "{err:?}"
        );
    }

    #[rstest]
    fn apply_options_overrides_fields(mut remote: RemoteConfig) {
        let options: BackendOptions = [
            ("instance-id", "i-123"),
            ("keep-ec2-instances", "true"),
            ("poll-interval-secs", "1"),
            ("ami_version", "~=1.1"),
            ("unknown", "ignored"),
        ]
        .into_iter()
        .collect();

        remote.apply_options(&options).expect("options should apply");

        assert_eq!(remote.instance_id.as_deref(), Some("i-123"));
        assert!(remote.keep_ec2_instances);
        assert_eq!(remote.poll_interval_secs, 1);
        assert_eq!(remote.ami_version, "~=1.1");
    }

    #[rstest]
    #[case("keep_ec2_instances", "maybe")]
    #[case("ready_max_attempts", "-1")]
    #[case("command_timeout_secs", "ten")]
    fn apply_options_rejects_malformed_values(
        mut remote: RemoteConfig,
        #[case] key: &str,
        #[case] value: &str,
    ) {
        let options: BackendOptions = [(key, value)].into_iter().collect();
        let err = remote.apply_options(&options).expect_err("should fail");
        assert!(
            matches!(err, ConfigError::InvalidOption { key: ref k, .. } if k == key),
            "{err:?}"
        );
    }

    #[rstest]
    fn validation_requires_bucket_with_actionable_error(mut remote: RemoteConfig) {
        remote.s3_bucket_name = None;
        let message = remote.validate().expect_err("bucket is required").to_string();
        assert!(message.contains("AWS_S3_BUCKET_NAME"), "{message}");
        assert!(message.contains("s3_bucket_name"), "{message}");
        assert!(message.contains(CONFIG_FILE_NAME), "{message}");
    }

    #[rstest]
    fn every_option_key_is_applicable(mut remote: RemoteConfig) {
        for info in RemoteConfig::OPTIONS {
            let value = info.default.unwrap_or("value");
            let options: BackendOptions = [(info.key, value)].into_iter().collect();
            remote
                .apply_options(&options)
                .unwrap_or_else(|err| panic!("{} should apply: {err}", info.key));
        }
    }

    #[rstest]
    fn policies_follow_configured_budgets(mut remote: RemoteConfig) {
        remote.poll_interval_secs = 2;
        remote.ready_max_attempts = 3;
        remote.command_max_attempts = 4;
        assert_eq!(remote.ready_policy().interval, Duration::from_secs(2));
        assert_eq!(remote.ready_policy().max_attempts, 3);
        assert_eq!(remote.command_policy().max_attempts, 4);
    }

    #[rstest]
    fn local_options_replace_shell() {
        let mut local = LocalConfig::default();
        let options: BackendOptions = [("shell", "sh")].into_iter().collect();
        local.apply_options(&options);
        assert_eq!(local.shell, "sh");
        local.shell = String::from(" ");
        assert!(local.validate().is_err());
    }
}
