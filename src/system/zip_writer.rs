//! Backend that streams the target state into a zip archive.
use std::fmt;
use std::io::{self, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::Result;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::{Cmd, FileInfo, Interpreter, System, archive_name, not_found};
use crate::relpath::RelPath;

/// Writes each directory, file, symlink and script as a zip member with
/// Unix permissions.
pub struct ZipWriterSystem<W: Write + Seek + Send> {
    root: PathBuf,
    writer: Mutex<ZipWriter<W>>,
}

impl<W: Write + Seek + Send> fmt::Debug for ZipWriterSystem<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZipWriterSystem")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

fn zip_err(e: zip::result::ZipError) -> io::Error {
    match e {
        zip::result::ZipError::Io(e) => e,
        other => io::Error::other(other),
    }
}

impl<W: Write + Seek + Send> ZipWriterSystem<W> {
    /// Archive paths relative to `root`.
    pub fn new(writer: W, root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            writer: Mutex::new(ZipWriter::new(writer)),
        }
    }

    /// Write the central directory and return the writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the central directory cannot be written.
    pub fn finish(self) -> io::Result<W> {
        self.writer
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .finish()
            .map_err(zip_err)
    }

    fn options(perm: u32) -> SimpleFileOptions {
        SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(perm)
    }

    fn add_file(&self, name: &str, data: &[u8], perm: u32) -> io::Result<()> {
        let mut zip = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        zip.start_file(name, Self::options(perm)).map_err(zip_err)?;
        zip.write_all(data)
    }
}

impl<W: Write + Seek + Send> System for ZipWriterSystem<W> {
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
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add_directory(archive_name(&self.root, path), Self::options(perm))
            .map_err(zip_err)
    }

    fn write_file(&self, path: &Path, data: &[u8], perm: u32) -> io::Result<()> {
        self.add_file(&archive_name(&self.root, path), data, perm)
    }

    fn write_symlink(&self, oldname: &str, newname: &Path) -> io::Result<()> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add_symlink(
                archive_name(&self.root, newname),
                oldname,
                Self::options(0o777),
            )
            .map_err(zip_err)
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
        self.add_file(name.as_str(), contents, 0o700)?;
        Ok(())
    }

    fn run_cmd(&self, _cmd: &Cmd) -> Result<()> {
        Ok(())
    }
}
