//! Slash-separated relative paths for targets and source entries.
use std::fmt;
use std::path::{Path, PathBuf};

use crate::attr::{parse_dir_attr, parse_file_attr};

/// A `/`-separated path relative to the destination or source root.
///
/// Ordering is plain string ordering, which always sorts a directory before
/// its descendants.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelPath(String);

impl RelPath {
    /// Create a relative path, normalising away empty components.
    #[must_use]
    pub fn new(s: &str) -> Self {
        Self(
            s.split('/')
                .filter(|c| !c.is_empty() && *c != ".")
                .collect::<Vec<_>>()
                .join("/"),
        )
    }

    /// Lexically clean `s`, resolving `..` against earlier components.
    ///
    /// Returns `None` for an absolute path or one that climbs above its root.
    #[must_use]
    pub fn clean(s: &str) -> Option<Self> {
        if s.starts_with('/') || s.starts_with('\\') || Path::new(s).is_absolute() {
            return None;
        }
        let mut parts = Vec::new();
        for component in s.split('/') {
            match component {
                "" | "." => {}
                ".." => {
                    parts.pop()?;
                }
                name => parts.push(name),
            }
        }
        Some(Self(parts.join("/")))
    }

    /// The empty path, i.e. the root itself.
    #[must_use]
    pub const fn root() -> Self {
        Self(String::new())
    }

    /// Whether this is the root.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Underlying string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append one or more components.
    #[must_use]
    pub fn join(&self, name: &str) -> Self {
        if self.0.is_empty() {
            Self::new(name)
        } else {
            Self::new(&format!("{}/{name}", self.0))
        }
    }

    /// Append another relative path.
    #[must_use]
    pub fn join_rel(&self, other: &Self) -> Self {
        self.join(&other.0)
    }

    /// Parent path, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            return None;
        }
        Some(
            self.0
                .rsplit_once('/')
                .map_or_else(Self::root, |(dir, _)| Self(dir.to_string())),
        )
    }

    /// Final component.
    #[must_use]
    pub fn base(&self) -> &str {
        self.0.rsplit_once('/').map_or(self.0.as_str(), |(_, b)| b)
    }

    /// Iterate over components.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }

    /// Whether `self` equals `ancestor` or lies beneath it.
    #[must_use]
    pub fn has_prefix(&self, ancestor: &Self) -> bool {
        ancestor.0.is_empty()
            || self.0 == ancestor.0
            || self
                .0
                .strip_prefix(&ancestor.0)
                .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Strip `ancestor` from the front of this path.
    #[must_use]
    pub fn trim_prefix(&self, ancestor: &Self) -> Option<Self> {
        if !self.has_prefix(ancestor) {
            return None;
        }
        if ancestor.0.is_empty() {
            return Some(self.clone());
        }
        Some(Self::new(self.0.get(ancestor.0.len()..).unwrap_or("")))
    }

    /// Resolve against an absolute root directory.
    #[must_use]
    pub fn to_abs(&self, root: &Path) -> PathBuf {
        self.components().fold(root.to_path_buf(), |p, c| p.join(c))
    }

    /// Build from a native relative path, e.g. one returned by `strip_prefix`.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        let parts: Vec<String> = path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        Self::new(&parts.join("/"))
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RelPath {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A path relative to the source root, tagged as directory or not.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceRelPath {
    rel_path: RelPath,
    is_dir: bool,
}

impl SourceRelPath {
    /// Source-relative path of a directory.
    #[must_use]
    pub const fn dir(rel_path: RelPath) -> Self {
        Self {
            rel_path,
            is_dir: true,
        }
    }

    /// Source-relative path of a file.
    #[must_use]
    pub const fn file(rel_path: RelPath) -> Self {
        Self {
            rel_path,
            is_dir: false,
        }
    }

    /// Underlying relative path.
    #[must_use]
    pub const fn rel_path(&self) -> &RelPath {
        &self.rel_path
    }

    /// Whether this names a directory.
    #[must_use]
    pub const fn is_dir(&self) -> bool {
        self.is_dir
    }

    /// Append a directory component.
    #[must_use]
    pub fn join_dir(&self, name: &str) -> Self {
        Self::dir(self.rel_path.join(name))
    }

    /// Append a file component.
    #[must_use]
    pub fn join_file(&self, name: &str) -> Self {
        Self::file(self.rel_path.join(name))
    }

    /// Decode every component through the attribute codec to get the
    /// destination-relative path this source entry produces.
    #[must_use]
    pub fn target_rel_path(&self, encrypted_suffix: &str) -> RelPath {
        let names: Vec<&str> = self.rel_path.components().collect();
        let Some((last, dirs)) = names.split_last() else {
            return RelPath::root();
        };
        let mut target: Vec<String> = dirs
            .iter()
            .map(|name| parse_dir_attr(name).target_name)
            .collect();
        if self.is_dir {
            target.push(parse_dir_attr(last).target_name);
        } else {
            target.push(parse_file_attr(last, encrypted_suffix).target_name);
        }
        RelPath::new(&target.join("/"))
    }
}

impl fmt::Display for SourceRelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.rel_path.fmt(f)
    }
}
