//! Specfile model and YAML loading.
//!
//! A specfile names the working directory, per-backend options, the ordered
//! upload and download patterns, and the steps to run:
//!
//! ```yaml
//! name: blinky
//! workdir: ./
//! backend:
//!   remote:
//!     instance-type: c5.xlarge
//! upload:
//!   - "**/*"
//!   - "-:out/**"
//! steps:
//!   - run: make test
//! download:
//!   - "out/**/*"
//! ```

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::Deserialize;
use serde_yaml::Value;

use crate::backend::BackendKind;
use crate::config::{BackendOptions, ConfigError};
use crate::fileset::Pattern;

/// Specfile read when none is given on the command line.
pub const DEFAULT_SPECFILE: &str = "simferry.yml";

/// Pattern list used when `upload` or `download` is omitted.
pub const DEFAULT_PATTERNS: [&str; 1] = ["**/*"];

/// Alternative specfile key for the remote backend's options.
const REMOTE_ALIAS: &str = "aws";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSpec {
    name: Option<String>,
    workdir: Option<String>,
    #[serde(default)]
    backend: BTreeMap<String, Option<BTreeMap<String, Value>>>,
    /// Absent means [`DEFAULT_PATTERNS`]. An explicit empty list is kept
    /// empty, so `upload: []` transfers nothing.
    upload: Option<Vec<String>>,
    #[serde(default)]
    steps: Vec<RawStep>,
    /// Same rule as `upload`: `download: []` retrieves nothing.
    download: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStep {
    run: String,
}

/// Validated job description.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobSpec {
    /// Optional workload name, used in log output.
    pub name: Option<String>,
    /// Local directory uploads are resolved against and downloads land in.
    pub workdir: Utf8PathBuf,
    /// Ordered upload patterns.
    pub upload: Vec<Pattern>,
    /// Script bodies run in order on the target.
    pub steps: Vec<String>,
    /// Ordered download patterns.
    pub download: Vec<Pattern>,
    backend: BTreeMap<String, BackendOptions>,
}

impl JobSpec {
    /// Reads and validates the specfile at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Specfile`] when the file cannot be read or does
    /// not describe a valid job.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let text = read_specfile(path).map_err(|message| ConfigError::Specfile {
            path: path.to_string(),
            message,
        })?;
        let base = match path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent,
            _ => Utf8Path::new("."),
        };
        Self::from_yaml(path.as_str(), &text, base)
    }

    /// Parses specfile `text`; relative `workdir` values resolve against
    /// `base`. `origin` names the source in error messages.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Specfile`] for malformed YAML, missing steps,
    /// invalid patterns, or non-scalar backend options.
    pub fn from_yaml(origin: &str, text: &str, base: &Utf8Path) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::Specfile {
            path: origin.to_owned(),
            message,
        };

        let raw: RawSpec = serde_yaml::from_str(text).map_err(|err| invalid(err.to_string()))?;

        if raw.steps.is_empty() {
            return Err(invalid(String::from("at least one step is required")));
        }

        let upload = parse_patterns(raw.upload.as_deref()).map_err(&invalid)?;
        let download = parse_patterns(raw.download.as_deref()).map_err(&invalid)?;

        let mut backend = BTreeMap::new();
        for (name, options) in raw.backend {
            let converted = convert_options(&name, options.unwrap_or_default()).map_err(&invalid)?;
            backend.insert(name.trim().to_ascii_lowercase(), converted);
        }

        Ok(Self {
            name: raw.name,
            workdir: resolve_workdir(base, raw.workdir.as_deref()),
            upload,
            steps: raw.steps.into_iter().map(|step| step.run).collect(),
            download,
            backend,
        })
    }

    /// Options the specfile supplies for `kind`. The remote backend also
    /// reads the `aws` section; `remote` wins where both set a key.
    #[must_use]
    pub fn backend_options(&self, kind: BackendKind) -> BackendOptions {
        let alias = (kind == BackendKind::Remote)
            .then(|| self.backend.get(REMOTE_ALIAS))
            .flatten();
        let mut options = BackendOptions::new();
        for section in [alias, self.backend.get(kind.name())].into_iter().flatten() {
            options.merge(section);
        }
        options
    }

    /// Label used in log output.
    #[must_use]
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed job")
    }
}

fn read_specfile(path: &Utf8Path) -> Result<String, String> {
    let (dir_path, file_name) = match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_str().is_empty() => (parent, name),
        (_, Some(name)) => (Utf8Path::new("."), name),
        (_, None) => return Err(format!("path has no file name: {path}")),
    };
    let dir =
        Dir::open_ambient_dir(dir_path, ambient_authority()).map_err(|err| err.to_string())?;
    dir.read_to_string(file_name).map_err(|err| err.to_string())
}

fn resolve_workdir(base: &Utf8Path, workdir: Option<&str>) -> Utf8PathBuf {
    let joined = base.join(workdir.unwrap_or("."));
    joined.canonicalize_utf8().unwrap_or(joined)
}

fn parse_patterns(raw: Option<&[String]>) -> Result<Vec<Pattern>, String> {
    let result = match raw {
        Some(patterns) => Pattern::parse_all(patterns),
        None => Pattern::parse_all(&DEFAULT_PATTERNS),
    };
    result.map_err(|err| err.to_string())
}

fn convert_options(
    backend: &str,
    options: BTreeMap<String, Value>,
) -> Result<BackendOptions, String> {
    let mut converted = BackendOptions::new();
    for (key, value) in options {
        let text = match value {
            Value::Null => String::new(),
            Value::Bool(flag) => flag.to_string(),
            Value::Number(number) => number.to_string(),
            Value::String(text) => text,
            Value::Sequence(_) | Value::Mapping(_) | Value::Tagged(_) => {
                return Err(format!(
                    "backend.{backend}.{key} must be a string, number or boolean"
                ));
            }
        };
        converted.insert(&key, text);
    }
    Ok(converted)
}
