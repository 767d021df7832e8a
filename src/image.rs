//! Image selection by semantic version constraint.
//!
//! Catalogue images carry a `major.minor.patch` version in their name. The
//! resolver picks the highest version satisfying a single constraint
//! expression, or the highest overall when no constraint is given.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::debug;

/// Errors raised while selecting an image.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ImageError {
    /// Raised when no candidate satisfies the constraint.
    #[error("no image satisfies '{constraint}' (available: {})", render_versions(.available))]
    NoMatchingImage {
        /// Constraint that was applied.
        constraint: String,
        /// Versions that were on offer.
        available: Vec<Version>,
    },
    /// Raised when the constraint expression cannot be parsed.
    #[error("invalid version constraint '{constraint}': {reason}")]
    InvalidConstraint {
        /// Constraint as written.
        constraint: String,
        /// Why it was rejected.
        reason: String,
    },
}

fn render_versions(versions: &[Version]) -> String {
    if versions.is_empty() {
        return String::from("none");
    }
    versions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Three-part semantic version ordered numerically.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Version {
    /// Major component.
    pub major: u64,
    /// Minor component.
    pub minor: u64,
    /// Patch component.
    pub patch: u64,
}

impl Version {
    /// Builds a version from its parts.
    #[must_use]
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let partial = PartialVersion::parse(raw)?;
        match (partial.minor, partial.patch) {
            (Some(minor), Some(patch)) => Ok(Self::new(partial.major, minor, patch)),
            _ => Err(format!("'{raw}' is not a full major.minor.patch version")),
        }
    }
}

/// Version with optional trailing components, as written in constraints.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PartialVersion {
    /// Major component.
    pub major: u64,
    /// Minor component, if written.
    pub minor: Option<u64>,
    /// Patch component, if written.
    pub patch: Option<u64>,
}

impl PartialVersion {
    fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        let body = trimmed.strip_suffix(".*").unwrap_or(trimmed);
        let mut parts = body.split('.');
        let mut next = |required: bool| -> Result<Option<u64>, String> {
            match parts.next() {
                Some(part) => part
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|_| format!("'{part}' is not a version number")),
                None if required => Err(String::from("missing version number")),
                None => Ok(None),
            }
        };

        let major = next(true)?.unwrap_or_default();
        let minor = next(false)?;
        let patch = if minor.is_some() { next(false)? } else { None };
        if parts.next().is_some() {
            return Err(format!("'{raw}' has more than three components"));
        }
        Ok(Self {
            major,
            minor,
            patch,
        })
    }

    fn padded(self) -> Version {
        Version::new(
            self.major,
            self.minor.unwrap_or_default(),
            self.patch.unwrap_or_default(),
        )
    }

    fn covers(self, version: Version) -> bool {
        self.major == version.major
            && self.minor.is_none_or(|minor| minor == version.minor)
            && self.patch.is_none_or(|patch| patch == version.patch)
    }
}

impl fmt::Display for PartialVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.major)?;
        if let Some(minor) = self.minor {
            write!(f, ".{minor}")?;
        }
        if let Some(patch) = self.patch {
            write!(f, ".{patch}")?;
        }
        Ok(())
    }
}

/// Operators in match order; longer prefixes precede their one-character
/// counterparts.
const OPERATORS: [&str; 7] = ["~=", "==", ">=", "<=", ">", "<", "="];

/// A single version constraint expression.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Constraint {
    /// Matches every version.
    Any,
    /// Matches versions equal to the given components.
    Exact(PartialVersion),
    /// Matches versions sharing the leading components and not below them.
    Compatible(PartialVersion),
    /// Strictly greater than.
    Greater(Version),
    /// Greater than or equal.
    GreaterOrEqual(Version),
    /// Strictly less than.
    Less(Version),
    /// Less than or equal.
    LessOrEqual(Version),
}

impl Constraint {
    /// Returns `true` when `version` satisfies the constraint.
    #[must_use]
    pub fn allows(&self, version: Version) -> bool {
        match *self {
            Self::Any => true,
            Self::Exact(partial) => partial.covers(version),
            Self::Compatible(partial) => {
                let series = PartialVersion {
                    patch: None,
                    ..partial
                };
                series.covers(version) && version >= partial.padded()
            }
            Self::Greater(bound) => version > bound,
            Self::GreaterOrEqual(bound) => version >= bound,
            Self::Less(bound) => version < bound,
            Self::LessOrEqual(bound) => version <= bound,
        }
    }
}

impl FromStr for Constraint {
    type Err = ImageError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let expr = raw.trim();
        let invalid = |reason: String| ImageError::InvalidConstraint {
            constraint: raw.to_owned(),
            reason,
        };

        if expr.is_empty() || expr == "*" || expr == "==*" {
            return Ok(Self::Any);
        }
        if expr.contains(',') {
            return Err(invalid(String::from(
                "only one constraint expression is supported",
            )));
        }

        let (operator, operand) = OPERATORS
            .iter()
            .find_map(|op| expr.strip_prefix(*op).map(|rest| (*op, rest)))
            .unwrap_or(("==", expr));

        let partial = PartialVersion::parse(operand).map_err(invalid)?;
        Ok(match operator {
            "~=" => Self::Compatible(partial),
            ">=" => Self::GreaterOrEqual(partial.padded()),
            "<=" => Self::LessOrEqual(partial.padded()),
            ">" => Self::Greater(partial.padded()),
            "<" => Self::Less(partial.padded()),
            _ => Self::Exact(partial),
        })
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Exact(p) => write!(f, "=={p}"),
            Self::Compatible(p) => write!(f, "~={p}"),
            Self::Greater(v) => write!(f, ">{v}"),
            Self::GreaterOrEqual(v) => write!(f, ">={v}"),
            Self::Less(v) => write!(f, "<{v}"),
            Self::LessOrEqual(v) => write!(f, "<={v}"),
        }
    }
}

/// Image identifier paired with the version parsed from its name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageCandidate {
    /// Provider identifier used to launch the image.
    pub id: String,
    /// Version carried by the image name.
    pub version: Version,
}

impl ImageCandidate {
    /// Builds a candidate from explicit parts.
    #[must_use]
    pub fn new(id: impl Into<String>, version: Version) -> Self {
        Self {
            id: id.into(),
            version,
        }
    }

    /// Extracts the version from a catalogue name shaped like
    /// `<family>-<major.minor.patch>[-suffix]`.
    ///
    /// Returns `None` (and logs at debug) when the name carries no parsable
    /// version.
    #[must_use]
    pub fn from_image_name(id: &str, name: &str) -> Option<Self> {
        let Some(raw_version) = name.split('-').nth(1) else {
            debug!(image_id = id, image_name = name, "image name has no version");
            return None;
        };
        match raw_version.parse::<Version>() {
            Ok(version) => Some(Self::new(id, version)),
            Err(reason) => {
                debug!(image_id = id, image_name = name, %reason, "skipping image");
                None
            }
        }
    }
}

/// Picks the highest-versioned candidate satisfying `constraint`.
///
/// When several candidates share the winning version, the first one listed
/// is returned.
///
/// # Errors
///
/// Returns [`ImageError::InvalidConstraint`] when the constraint cannot be
/// parsed and [`ImageError::NoMatchingImage`] when nothing satisfies it.
pub fn resolve(
    candidates: &[ImageCandidate],
    constraint: Option<&str>,
) -> Result<ImageCandidate, ImageError> {
    let parsed = constraint.map_or(Ok(Constraint::Any), str::parse::<Constraint>)?;

    let best = candidates
        .iter()
        .filter(|candidate| parsed.allows(candidate.version))
        .fold(None::<&ImageCandidate>, |best, candidate| match best {
            Some(current) if current.version >= candidate.version => Some(current),
            _ => Some(candidate),
        });

    best.cloned().ok_or_else(|| {
        let mut available: Vec<Version> = candidates.iter().map(|c| c.version).collect();
        available.sort_unstable();
        available.dedup();
        ImageError::NoMatchingImage {
            constraint: constraint.unwrap_or("*").trim().to_owned(),
            available,
        }
    })
}
