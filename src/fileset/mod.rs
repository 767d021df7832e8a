//! Resolution of ordered include/exclude glob patterns into file sets.
//!
//! Patterns are applied in list order against a deterministic listing of
//! regular files. Includes append matches that are not yet present; excludes
//! remove matches regardless of which earlier pattern added them.

mod pattern;

use std::collections::HashSet;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::warn;
use walkdir::WalkDir;

pub use pattern::{EXCLUDE_PREFIX, Pattern, PatternMode};

/// Errors raised while resolving a file set.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FileSetError {
    /// Raised when a directory under the root cannot be read.
    #[error("failed to walk {path}: {message}")]
    Walk {
        /// Path that could not be read.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when a path under the root is not valid UTF-8.
    #[error("path is not valid UTF-8: {path}")]
    NonUtf8Path {
        /// Lossy rendering of the offending path.
        path: String,
    },
    /// Raised when the root does not exist or is not a directory.
    #[error("file set root is not a directory: {path}")]
    MissingRoot {
        /// Root that was requested.
        path: Utf8PathBuf,
    },
    /// Raised when a pattern cannot be parsed.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// Pattern as written, including any exclusion prefix.
        pattern: String,
        /// Why the pattern was rejected.
        reason: String,
    },
}

/// Ordered, duplicate-free sequence of relative file paths.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FileSet {
    paths: Vec<Utf8PathBuf>,
}

impl FileSet {
    /// Returns the member paths in first-inclusion order.
    #[must_use]
    pub fn paths(&self) -> &[Utf8PathBuf] {
        &self.paths
    }

    /// Returns the number of members.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.paths.len()
    }

    /// Returns `true` when the set has no members.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Iterates over the member paths in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Utf8PathBuf> {
        self.paths.iter()
    }
}

impl<'a> IntoIterator for &'a FileSet {
    type Item = &'a Utf8PathBuf;
    type IntoIter = std::slice::Iter<'a, Utf8PathBuf>;

    fn into_iter(self) -> Self::IntoIter {
        self.paths.iter()
    }
}

impl FromIterator<Utf8PathBuf> for FileSet {
    fn from_iter<I: IntoIterator<Item = Utf8PathBuf>>(iter: I) -> Self {
        let mut seen = HashSet::new();
        let paths = iter
            .into_iter()
            .filter(|path| seen.insert(path.clone()))
            .collect();
        Self { paths }
    }
}

/// Lists every regular file below `root` as a relative path.
///
/// Directories are visited in lexicographic file-name order. Symlinks are
/// listed when they point at regular files and never followed into
/// directories. Entries that are not UTF-8 or cannot be read are logged and
/// left out.
///
/// # Errors
///
/// Returns [`FileSetError::MissingRoot`] when `root` is not a directory and
/// [`FileSetError::Walk`] when `root` itself cannot be read.
pub fn list_files(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>, FileSetError> {
    walk(root, |_| false)
}

/// Resolves `patterns` against the files below `root`.
///
/// Entries that are not UTF-8 or cannot be read are skipped unless an
/// include pattern selects them.
///
/// # Errors
///
/// Returns [`FileSetError::MissingRoot`] when `root` is not a directory,
/// [`FileSetError::Walk`] when `root` or a selected entry cannot be read,
/// and [`FileSetError::NonUtf8Path`] when a selected file is not UTF-8.
pub fn resolve(root: &Utf8Path, patterns: &[Pattern]) -> Result<FileSet, FileSetError> {
    let listing = walk(root, |lossy| {
        let components: Vec<&str> = lossy.split('/').collect();
        patterns
            .iter()
            .any(|pattern| pattern.mode() == PatternMode::Include && pattern.matches(&components))
    })?;
    Ok(resolve_listing(&listing, patterns))
}

/// Walks `root`; `selected` decides, from a lossy relative path, whether a
/// problem entry fails the walk or is skipped.
fn walk(
    root: &Utf8Path,
    selected: impl Fn(&str) -> bool,
) -> Result<Vec<Utf8PathBuf>, FileSetError> {
    if !root.is_dir() {
        return Err(FileSetError::MissingRoot {
            path: root.to_path_buf(),
        });
    }
    let lossy_relative = |path: &Path| {
        path.strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    };

    let mut listing = Vec::new();
    for item in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = match item {
            Ok(entry) => entry,
            Err(err) => {
                let path = err.path().map_or_else(|| root.to_string(), &lossy_relative);
                if err.depth() == 0 || selected(&path) {
                    return Err(FileSetError::Walk {
                        path,
                        message: err.to_string(),
                    });
                }
                warn!(%root, %path, error = %err, "skipping unreadable entry");
                continue;
            }
        };

        let file_type = entry.file_type();
        let is_file = file_type.is_file() || (file_type.is_symlink() && entry.path().is_file());
        if !is_file {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or_else(|_| entry.path());
        let Some(utf8) = Utf8Path::from_path(relative) else {
            let path = lossy_relative(entry.path());
            if selected(&path) {
                return Err(FileSetError::NonUtf8Path { path });
            }
            warn!(%root, %path, "skipping file whose name is not UTF-8");
            continue;
        };
        listing.push(utf8.to_path_buf());
    }
    Ok(listing)
}

/// Resolves `patterns` against an already collected listing of relative
/// file paths.
///
/// The listing is sorted component-wise first, so the result does not depend
/// on the order the caller collected it in.
#[must_use]
pub fn resolve_listing(listing: &[Utf8PathBuf], patterns: &[Pattern]) -> FileSet {
    let mut candidates: Vec<(&Utf8PathBuf, Vec<&str>)> = listing
        .iter()
        .map(|path| (path, path.iter().collect()))
        .collect();
    candidates.sort_by(|(_, left), (_, right)| left.cmp(right));
    candidates.dedup_by(|(_, left), (_, right)| left == right);

    let mut selected: Vec<&Utf8PathBuf> = Vec::new();
    let mut members: HashSet<&Utf8PathBuf> = HashSet::new();

    for pattern in patterns {
        match pattern.mode() {
            PatternMode::Include => {
                for (path, components) in &candidates {
                    if pattern.matches(components) && members.insert(*path) {
                        selected.push(*path);
                    }
                }
            }
            PatternMode::Exclude => {
                selected.retain(|path| {
                    let components: Vec<&str> = path.iter().collect();
                    let keep = !pattern.matches(&components);
                    if !keep {
                        members.remove(path);
                    }
                    keep
                });
            }
        }
    }

    FileSet {
        paths: selected.into_iter().cloned().collect(),
    }
}
