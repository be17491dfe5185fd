//! What currently exists at a destination path.
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};

use crate::entry_state::EntryState;
use crate::error::SourceError;
use crate::lazy::{LazyContents, LazyLinkname};
use crate::system::{FileKind, System};

/// Live state of one destination path.
///
/// Built from a single `lstat`; contents and link targets are read on
/// first use and memoized.
#[derive(Debug)]
pub enum ActualStateEntry {
    /// Nothing exists.
    Absent {
        /// Destination path.
        path: PathBuf,
    },
    /// A directory.
    Dir {
        /// Destination path.
        path: PathBuf,
        /// Permission bits.
        perm: u32,
    },
    /// A regular file.
    File {
        /// Destination path.
        path: PathBuf,
        /// Permission bits.
        perm: u32,
        /// Lazily read contents.
        contents: LazyContents,
    },
    /// A symbolic link.
    Symlink {
        /// Destination path.
        path: PathBuf,
        /// Lazily read link target.
        linkname: LazyLinkname,
    },
}

impl ActualStateEntry {
    /// Inspect `path` through `system`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::UnsupportedFileType`] for sockets, devices and
    /// named pipes, or the `lstat` error for anything but "not found".
    pub fn new(system: &Arc<dyn System>, path: &Path) -> Result<Self> {
        let info = match system.lstat(path) {
            Ok(info) => info,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Self::Absent {
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(e).with_context(|| format!("lstat {}", path.display())),
        };
        Ok(match info.kind {
            FileKind::Dir => Self::Dir {
                path: path.to_path_buf(),
                perm: info.perm,
            },
            FileKind::File => {
                let system = Arc::clone(system);
                let abs = path.to_path_buf();
                Self::File {
                    path: path.to_path_buf(),
                    perm: info.perm,
                    contents: LazyContents::new(move || {
                        system
                            .read_file(&abs)
                            .with_context(|| format!("read {}", abs.display()))
                    }),
                }
            }
            FileKind::Symlink => {
                let system = Arc::clone(system);
                let abs = path.to_path_buf();
                Self::Symlink {
                    path: path.to_path_buf(),
                    linkname: LazyLinkname::new(move || {
                        system
                            .readlink(&abs)
                            .map(|l| normalize_linkname(&l))
                            .with_context(|| format!("readlink {}", abs.display()))
                    }),
                }
            }
            FileKind::Other(mode) => {
                return Err(SourceError::UnsupportedFileType {
                    path: path.to_path_buf(),
                    mode: mode.to_string(),
                }
                .into());
            }
        })
    }

    /// Destination path.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Absent { path }
            | Self::Dir { path, .. }
            | Self::File { path, .. }
            | Self::Symlink { path, .. } => path,
        }
    }

    /// Whether nothing exists.
    #[must_use]
    pub const fn is_absent(&self) -> bool {
        matches!(self, Self::Absent { .. })
    }

    /// Snapshot of this entry, reading contents if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the contents or link target cannot be read.
    pub fn entry_state(&self) -> Result<EntryState> {
        Ok(match self {
            Self::Absent { .. } => EntryState::remove(),
            Self::Dir { perm, .. } => EntryState::dir(*perm),
            Self::File { perm, contents, .. } => EntryState::file(
                *perm,
                &contents.sha256()?,
                Some(contents.contents()?.to_vec()),
            ),
            Self::Symlink { linkname, .. } => {
                EntryState::symlink(&linkname.sha256()?, linkname.linkname()?)
            }
        })
    }

    /// Remove whatever exists.
    ///
    /// # Errors
    ///
    /// Returns the removal error.
    pub fn remove(&self, system: &dyn System) -> Result<()> {
        match self {
            Self::Absent { .. } => Ok(()),
            _ => system
                .remove_all(self.path())
                .with_context(|| format!("remove {}", self.path().display())),
        }
    }
}

/// Link targets are compared with `/` separators on every platform.
#[must_use]
pub fn normalize_linkname(linkname: &str) -> String {
    if cfg!(windows) {
        linkname.replace('\\', "/")
    } else {
        linkname.to_string()
    }
}
