//! Backend that records the target state as serialisable data.
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::Result;
use serde::Serialize;

use super::{Cmd, FileInfo, Interpreter, System, archive_name, not_found};
use crate::relpath::RelPath;

/// One entry of a dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DumpEntry {
    /// A command that would modify a directory.
    Command {
        /// Program.
        path: String,
        /// Arguments.
        args: Vec<String>,
    },
    /// A directory.
    Dir {
        /// Target-relative name.
        name: String,
        /// Permission bits.
        perm: u32,
    },
    /// A regular file.
    File {
        /// Target-relative name.
        name: String,
        /// Contents, lossily decoded.
        contents: String,
        /// Permission bits.
        perm: u32,
    },
    /// A script.
    Script {
        /// Script name.
        name: String,
        /// Contents, lossily decoded.
        contents: String,
        /// Interpreter, when one is configured for the extension.
        #[serde(skip_serializing_if = "Option::is_none")]
        interpreter: Option<Interpreter>,
    },
    /// A symbolic link.
    Symlink {
        /// Target-relative name.
        name: String,
        /// Link target.
        linkname: String,
    },
}

/// Collects every write into a map keyed by target-relative path.
///
/// Reads always report "not found", so every entry is dumped as if the
/// destination were empty.
#[derive(Debug)]
pub struct DumpSystem {
    root: PathBuf,
    data: Mutex<BTreeMap<String, DumpEntry>>,
}

impl DumpSystem {
    /// Dump entries relative to `root`.
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            data: Mutex::new(BTreeMap::new()),
        }
    }

    /// Snapshot of everything recorded so far.
    #[must_use]
    pub fn data(&self) -> BTreeMap<String, DumpEntry> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn insert(&self, key: String, entry: DumpEntry) -> io::Result<()> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        if data.contains_key(&key) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{key}: already exists"),
            ));
        }
        data.insert(key, entry);
        Ok(())
    }
}

impl System for DumpSystem {
    fn lstat(&self, path: &Path) -> io::Result<FileInfo> {
        Err(not_found(path))
    }

    fn stat(&self, path: &Path) -> io::Result<FileInfo> {
        Err(not_found(path))
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        Err(not_found(path))
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        Err(not_found(path))
    }

    fn readlink(&self, path: &Path) -> io::Result<String> {
        Err(not_found(path))
    }

    fn mkdir(&self, path: &Path, perm: u32) -> io::Result<()> {
        let name = archive_name(&self.root, path);
        self.insert(name.clone(), DumpEntry::Dir { name, perm })
    }

    fn write_file(&self, path: &Path, data: &[u8], perm: u32) -> io::Result<()> {
        let name = archive_name(&self.root, path);
        self.insert(
            name.clone(),
            DumpEntry::File {
                name,
                contents: String::from_utf8_lossy(data).to_string(),
                perm,
            },
        )
    }

    fn write_symlink(&self, oldname: &str, newname: &Path) -> io::Result<()> {
        let name = archive_name(&self.root, newname);
        self.insert(
            name.clone(),
            DumpEntry::Symlink {
                name,
                linkname: oldname.to_string(),
            },
        )
    }

    fn chmod(&self, _path: &Path, _perm: u32) -> io::Result<()> {
        Ok(())
    }

    fn remove(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn remove_all(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn rename(&self, _old: &Path, _new: &Path) -> io::Result<()> {
        Ok(())
    }

    fn run_script(
        &self,
        name: &RelPath,
        _dir: &Path,
        contents: &[u8],
        interpreter: Option<&Interpreter>,
    ) -> Result<()> {
        self.insert(
            name.to_string(),
            DumpEntry::Script {
                name: name.to_string(),
                contents: String::from_utf8_lossy(contents).to_string(),
                interpreter: interpreter.filter(|i| !i.is_none()).cloned(),
            },
        )?;
        Ok(())
    }

    fn run_cmd(&self, cmd: &Cmd) -> Result<()> {
        let key = archive_name(&self.root, &cmd.dir);
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key,
                DumpEntry::Command {
                    path: cmd.program.clone(),
                    args: cmd.args.clone(),
                },
            );
        Ok(())
    }
}
