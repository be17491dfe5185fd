//! Glob pattern sets from `.dotstateignore` and `.dotstateremove` files.
use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context as _, Result};
use glob::{MatchOptions, Pattern};

use crate::relpath::RelPath;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Outcome of [`PatternSet::matches`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternMatch {
    /// An include pattern matched, or only exclude patterns exist and none matched.
    Include,
    /// An exclude pattern matched, or only include patterns exist and none matched.
    Exclude,
    /// Both kinds exist and neither matched.
    Unknown,
}

/// Include and exclude glob patterns over target-relative paths.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    include: BTreeSet<String>,
    exclude: BTreeSet<String>,
}

impl PatternSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no patterns have been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// Whether any exclude pattern has been added.
    #[must_use]
    pub fn has_exclude(&self) -> bool {
        !self.exclude.is_empty()
    }

    /// Add `pattern` as an include or exclude pattern.
    ///
    /// # Errors
    ///
    /// Returns an error if `pattern` is not a valid glob.
    pub fn add(&mut self, pattern: &str, include: bool) -> Result<()> {
        Pattern::new(pattern).with_context(|| format!("{pattern}: invalid pattern"))?;
        if include {
            self.include.insert(pattern.to_string());
        } else {
            self.exclude.insert(pattern.to_string());
        }
        Ok(())
    }

    /// Add the patterns in `contents`, one per line, relative to `dir`.
    ///
    /// `#` starts a comment and a leading `!` makes the line an exclude
    /// pattern. `origin` names the file in errors.
    ///
    /// # Errors
    ///
    /// Returns an error naming the line of the first invalid pattern.
    pub fn add_lines(&mut self, contents: &str, dir: &RelPath, origin: &str) -> Result<()> {
        for (i, line) in contents.lines().enumerate() {
            let text = line.split_once('#').map_or(line, |(before, _)| before).trim();
            if text.is_empty() {
                continue;
            }
            let (text, include) = text
                .strip_prefix('!')
                .map_or((text, true), |rest| (rest, false));
            self.add(dir.join(text).as_str(), include)
                .with_context(|| format!("{origin}:{}", i + 1))?;
        }
        Ok(())
    }

    /// Classify `name`. Exclude patterns take precedence.
    #[must_use]
    pub fn matches(&self, name: &str) -> PatternMatch {
        let hit = |patterns: &BTreeSet<String>| {
            patterns.iter().any(|p| {
                Pattern::new(p).is_ok_and(|p| p.matches_with(name, MATCH_OPTIONS))
            })
        };
        if hit(&self.exclude) {
            return PatternMatch::Exclude;
        }
        if hit(&self.include) {
            return PatternMatch::Include;
        }
        match (self.include.is_empty(), self.exclude.is_empty()) {
            (false, true) => PatternMatch::Exclude,
            (true, false) => PatternMatch::Include,
            _ => PatternMatch::Unknown,
        }
    }

    /// Whether `name` matches an include pattern and no exclude pattern.
    #[must_use]
    pub fn is_included(&self, name: &str) -> bool {
        !self.include.is_empty() && self.matches(name) == PatternMatch::Include
    }

    /// Paths beneath `root` matching an include pattern and no exclude
    /// pattern, relative to `root` and sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be read while matching.
    pub fn glob(&self, root: &Path) -> Result<Vec<RelPath>> {
        let mut found = BTreeSet::new();
        let escaped_root = Pattern::escape(&root.to_string_lossy());
        for pattern in &self.include {
            let paths = glob::glob_with(&format!("{escaped_root}/{pattern}"), MATCH_OPTIONS)
                .with_context(|| format!("{pattern}: invalid pattern"))?;
            for path in paths {
                let path = path.with_context(|| format!("glob {pattern}"))?;
                if let Ok(rel) = path.strip_prefix(root) {
                    found.insert(RelPath::from_path(rel));
                }
            }
        }
        Ok(found
            .into_iter()
            .filter(|rel| {
                !self.exclude.iter().any(|p| {
                    Pattern::new(p).is_ok_and(|p| p.matches_with(rel.as_str(), MATCH_OPTIONS))
                })
            })
            .collect())
    }
}
