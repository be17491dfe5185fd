//! Backend that streams the target state into a tar archive.
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::Result;
use tar::{Builder, EntryType, Header};

use super::{Cmd, FileInfo, Interpreter, System, archive_name, not_found};
use crate::relpath::RelPath;

/// Writes each directory, file, symlink and script as a tar member.
pub struct TarWriterSystem<W: Write + Send> {
    root: PathBuf,
    mtime: u64,
    builder: Mutex<Builder<W>>,
}

impl<W: Write + Send> fmt::Debug for TarWriterSystem<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TarWriterSystem")
            .field("root", &self.root)
            .field("mtime", &self.mtime)
            .finish_non_exhaustive()
    }
}

impl<W: Write + Send> TarWriterSystem<W> {
    /// Archive paths relative to `root`, stamping every member with `mtime`.
    pub fn new(writer: W, root: &Path, mtime: u64) -> Self {
        Self {
            root: root.to_path_buf(),
            mtime,
            builder: Mutex::new(Builder::new(writer)),
        }
    }

    /// Write the end-of-archive marker and return the writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the trailer cannot be written.
    pub fn finish(self) -> io::Result<W> {
        self.builder
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_inner()
    }

    fn header(&self, entry_type: EntryType, perm: u32, size: u64) -> Header {
        let mut header = Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_mode(perm);
        header.set_size(size);
        header.set_mtime(self.mtime);
        header.set_uid(0);
        header.set_gid(0);
        header
    }

    fn append(&self, mut header: Header, name: &str, data: &[u8]) -> io::Result<()> {
        self.builder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .append_data(&mut header, name, data)
    }
}

impl<W: Write + Send> System for TarWriterSystem<W> {
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
        let header = self.header(EntryType::Directory, perm, 0);
        self.append(header, &archive_name(&self.root, path), &[])
    }

    fn write_file(&self, path: &Path, data: &[u8], perm: u32) -> io::Result<()> {
        let header = self.header(EntryType::Regular, perm, data.len() as u64);
        self.append(header, &archive_name(&self.root, path), data)
    }

    fn write_symlink(&self, oldname: &str, newname: &Path) -> io::Result<()> {
        let mut header = self.header(EntryType::Symlink, 0o777, 0);
        header.set_link_name(oldname)?;
        self.append(header, &archive_name(&self.root, newname), &[])
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
        _interpreter: Option<&Interpreter>,
    ) -> Result<()> {
        let header = self.header(EntryType::Regular, 0o700, contents.len() as u64);
        self.append(header, name.as_str(), contents)?;
        Ok(())
    }

    fn run_cmd(&self, _cmd: &Cmd) -> Result<()> {
        Ok(())
    }
}
