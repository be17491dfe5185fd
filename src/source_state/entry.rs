//! What the source directory declares for one target path.
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};

use crate::attr::{DirAttr, FileAttr, ScriptCondition, ScriptOrder, SourceDirType};
use crate::entry_type_set::SourceAttr;
use crate::lazy::LazyContents;
use crate::system::{Cmd, System};
use crate::target_state::TargetStateEntry;

/// Produces the target state of a file entry for a destination path.
///
/// Takes the destination system because `create_` and `modify_` entries
/// depend on what is currently there.
pub type TargetFn = Arc<dyn Fn(&Arc<dyn System>, &Path) -> Result<TargetStateEntry> + Send + Sync>;

/// One source declaration for a target path.
pub enum SourceStateEntry {
    /// A directory, either declared in the source tree or implied by an
    /// external beneath it.
    Dir {
        /// Where the declaration came from.
        origin: String,
        /// Decoded attributes; default for implicit directories.
        attr: DirAttr,
        /// Permission bits, umask already applied.
        perm: u32,
        /// Created only to hold an external. Equivalent to any other directory.
        implicit: bool,
        /// Comes from an external.
        external: bool,
    },
    /// A file, symlink or script.
    File {
        /// Where the declaration came from.
        origin: String,
        /// Decoded attributes.
        attr: FileAttr,
        /// Raw source contents, decrypted but not templated.
        contents: Arc<LazyContents>,
        /// Target state factory.
        target: TargetFn,
        /// Comes from an external.
        external: bool,
    },
    /// The target must not exist.
    Remove {
        /// Where the declaration came from.
        origin: String,
    },
    /// A directory maintained by a command, i.e. a `git-repo` external.
    Command {
        /// Where the declaration came from.
        origin: String,
        /// Run when the destination does not exist yet.
        init: Cmd,
        /// Run when the destination exists.
        update: Cmd,
        /// Minimum time between runs; `None` runs once.
        refresh_period: Option<Duration>,
        /// Run on every apply.
        force: bool,
        /// Permission bits recorded for the directory.
        perm: u32,
    },
}

impl fmt::Debug for SourceStateEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dir {
                origin,
                attr,
                perm,
                implicit,
                external,
            } => f
                .debug_struct("Dir")
                .field("origin", origin)
                .field("attr", attr)
                .field("perm", &format_args!("{perm:o}"))
                .field("implicit", implicit)
                .field("external", external)
                .finish(),
            Self::File {
                origin,
                attr,
                external,
                ..
            } => f
                .debug_struct("File")
                .field("origin", origin)
                .field("attr", attr)
                .field("external", external)
                .finish_non_exhaustive(),
            Self::Remove { origin } => f.debug_struct("Remove").field("origin", origin).finish(),
            Self::Command {
                origin,
                init,
                update,
                refresh_period,
                force,
                ..
            } => f
                .debug_struct("Command")
                .field("origin", origin)
                .field("init", init)
                .field("update", update)
                .field("refresh_period", refresh_period)
                .field("force", force)
                .finish_non_exhaustive(),
        }
    }
}

impl SourceStateEntry {
    /// Where the declaration came from: a source-relative path, an external
    /// manifest, or a pattern file.
    #[must_use]
    pub fn origin(&self) -> &str {
        match self {
            Self::Dir { origin, .. }
            | Self::File { origin, .. }
            | Self::Remove { origin }
            | Self::Command { origin, .. } => origin,
        }
    }

    /// Script ordering; everything that is not a script runs during.
    #[must_use]
    pub const fn order(&self) -> ScriptOrder {
        match self {
            Self::File { attr, .. } => attr.order,
            Self::Dir { .. } | Self::Remove { .. } | Self::Command { .. } => ScriptOrder::During,
        }
    }

    /// Classification used by include/exclude filters before evaluation.
    #[must_use]
    pub fn source_attr(&self) -> SourceAttr {
        match self {
            Self::Dir { external, .. } => SourceAttr {
                external: *external,
                ..SourceAttr::default()
            },
            Self::File { attr, external, .. } => SourceAttr {
                encrypted: attr.encrypted,
                external: *external,
                template: attr.template,
                always: attr.condition == ScriptCondition::Always,
            },
            Self::Remove { .. } => SourceAttr::default(),
            Self::Command { .. } => SourceAttr {
                external: true,
                ..SourceAttr::default()
            },
        }
    }

    /// Whether this is a directory of either kind.
    #[must_use]
    pub const fn is_dir(&self) -> bool {
        matches!(self, Self::Dir { .. })
    }

    /// Exact directories have their undeclared destination children removed.
    #[must_use]
    pub const fn is_exact_dir(&self) -> bool {
        matches!(self, Self::Dir { attr, .. } if attr.exact)
    }

    /// Read and decrypt source contents so that errors surface early.
    ///
    /// # Errors
    ///
    /// Returns the read or decryption error.
    pub fn evaluate(&self) -> Result<()> {
        match self {
            Self::File { contents, .. } => contents.sha256().map(|_| ()),
            Self::Dir { .. } | Self::Remove { .. } | Self::Command { .. } => Ok(()),
        }
    }

    /// Desired state of `dest_path`, reading current contents through
    /// `dest_system` where the entry depends on them.
    ///
    /// # Errors
    ///
    /// Returns an error if the destination cannot be inspected.
    pub fn target_state_entry(
        &self,
        dest_system: &Arc<dyn System>,
        dest_path: &Path,
    ) -> Result<TargetStateEntry> {
        Ok(match self {
            // A remove_ directory is kept only while it exists, so that its
            // children can be applied before it is removed once empty.
            Self::Dir { attr, .. }
                if attr.dir_type == SourceDirType::Remove
                    && matches!(
                        dest_system.lstat(dest_path),
                        Err(e) if e.kind() == io::ErrorKind::NotFound
                    ) =>
            {
                TargetStateEntry::Remove
            }
            Self::Dir { perm, .. } => TargetStateEntry::Dir {
                perm: *perm,
                source_attr: self.source_attr(),
            },
            Self::File { target, .. } => target(dest_system, dest_path)?,
            Self::Remove { .. } => TargetStateEntry::Remove,
            Self::Command {
                init,
                update,
                refresh_period,
                force,
                perm,
                ..
            } => {
                let cmd = match dest_system.lstat(dest_path) {
                    Ok(_) => update.clone(),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => init.clone(),
                    Err(e) => {
                        return Err(e).with_context(|| format!("lstat {}", dest_path.display()));
                    }
                };
                TargetStateEntry::ModifyDirWithCommand {
                    perm: *perm,
                    cmd,
                    refresh_period: *refresh_period,
                    force: *force,
                    source_attr: self.source_attr(),
                }
            }
        })
    }
}

/// Pick one entry to stand for several declarations of the same target.
///
/// Only directories can be merged: all real directories must carry the same
/// attributes, and implicit directories match anything. The first real
/// directory wins.
#[must_use]
pub fn canonical(entries: &[SourceStateEntry]) -> Option<usize> {
    let mut first_real: Option<(usize, &DirAttr)> = None;
    for (i, entry) in entries.iter().enumerate() {
        match entry {
            SourceStateEntry::Dir { implicit: true, .. } => {}
            SourceStateEntry::Dir { attr, .. } => match first_real {
                None => first_real = Some((i, attr)),
                Some((_, first)) if first == attr => {}
                Some(_) => return None,
            },
            _ => return None,
        }
    }
    match first_real {
        Some((i, _)) => Some(i),
        None if entries.is_empty() => None,
        None => Some(0),
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::system::{DumpSystem, RealSystem};
    use std::path::PathBuf;

    fn dir(origin: &str, exact: bool) -> SourceStateEntry {
        SourceStateEntry::Dir {
            origin: origin.to_string(),
            attr: DirAttr {
                target_name: "d".to_string(),
                exact,
                ..DirAttr::default()
            },
            perm: 0o755,
            implicit: false,
            external: false,
        }
    }

    fn implicit() -> SourceStateEntry {
        SourceStateEntry::Dir {
            origin: "external".to_string(),
            attr: DirAttr::default(),
            perm: 0o755,
            implicit: true,
            external: false,
        }
    }

    fn command() -> SourceStateEntry {
        let cmd = |arg: &str| Cmd {
            program: "git".to_string(),
            args: vec![arg.to_string()],
            dir: PathBuf::from("/d"),
        };
        SourceStateEntry::Command {
            origin: ".dotstateexternal.toml".to_string(),
            init: cmd("clone"),
            update: cmd("pull"),
            refresh_period: None,
            force: false,
            perm: 0o755,
        }
    }

    #[test]
    fn identical_dirs_are_canonical() {
        assert_eq!(canonical(&[dir("a", false), dir("b", false)]), Some(0));
        assert_eq!(canonical(&[implicit(), dir("b", true)]), Some(1));
        assert_eq!(canonical(&[implicit(), implicit()]), Some(0));
    }

    #[test]
    fn differing_dirs_or_files_are_not() {
        assert_eq!(canonical(&[dir("a", false), dir("b", true)]), None);
        let remove = SourceStateEntry::Remove {
            origin: "x".to_string(),
        };
        assert_eq!(canonical(&[dir("a", false), remove]), None);
        assert_eq!(canonical(&[]), None);
    }

    fn command_args(target: TargetStateEntry) -> Option<(Vec<String>, bool)> {
        match target {
            TargetStateEntry::ModifyDirWithCommand {
                cmd, source_attr, ..
            } => Some((cmd.args, source_attr.external)),
            _ => None,
        }
    }

    #[test]
    fn command_clones_when_destination_is_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let system: Arc<dyn System> = Arc::new(RealSystem::new());
        let target = command()
            .target_state_entry(&system, &tmp.path().join("repo"))
            .unwrap();
        assert_eq!(command_args(target), Some((vec!["clone".to_string()], true)));

        let target = command().target_state_entry(&system, tmp.path()).unwrap();
        assert_eq!(command_args(target), Some((vec!["pull".to_string()], true)));
    }

    #[test]
    fn dir_target_keeps_perm() {
        let system: Arc<dyn System> = Arc::new(DumpSystem::new(Path::new("/d")));
        let target = dir("a", true)
            .target_state_entry(&system, Path::new("/d/x"))
            .unwrap();
        assert!(matches!(target, TargetStateEntry::Dir { perm: 0o755, .. }));
        assert!(dir("a", true).is_exact_dir());
        assert!(!implicit().is_exact_dir());
    }
}
