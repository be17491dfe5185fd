//! Destination I/O abstraction.
//!
//! Everything the engine does to the destination goes through the
//! [`System`] trait so that the same apply pass can write to the real
//! filesystem, do nothing ([`DryRunSystem`]), collect a serialisable
//! description of the target state ([`DumpSystem`]), or stream it into an
//! archive ([`TarWriterSystem`], [`ZipWriterSystem`]).
//!
//! Methods take absolute paths. Permission bits are always passed
//! explicitly and are applied exactly, independent of the process umask.
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::relpath::RelPath;

mod dry_run;
mod dump;
mod real;
mod tar_writer;
mod zip_writer;

pub use dry_run::DryRunSystem;
pub use dump::{DumpEntry, DumpSystem};
pub use real::RealSystem;
pub use tar_writer::TarWriterSystem;
pub use zip_writer::ZipWriterSystem;

/// Kind of a filesystem entry as reported by [`System::lstat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// A directory.
    Dir,
    /// A regular file.
    File,
    /// A symbolic link.
    Symlink,
    /// A socket, device or named pipe, with a short description.
    Other(&'static str),
}

/// Metadata returned by [`System::lstat`] and [`System::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    /// Entry kind.
    pub kind: FileKind,
    /// Permission bits (`0o777` mask).
    pub perm: u32,
    /// Size in bytes.
    pub size: u64,
}

impl FileInfo {
    /// Metadata from a [`std::fs::Metadata`].
    #[must_use]
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        let ft = meta.file_type();
        let kind = if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_dir() {
            FileKind::Dir
        } else if ft.is_file() {
            FileKind::File
        } else {
            FileKind::Other(other_kind_name(ft))
        };
        Self {
            kind,
            perm: perm_of(meta),
            size: meta.len(),
        }
    }
}

#[cfg(unix)]
fn perm_of(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn perm_of(meta: &std::fs::Metadata) -> u32 {
    let base = if meta.is_dir() { 0o777 } else { 0o666 };
    if meta.permissions().readonly() {
        base & !0o222
    } else {
        base
    }
}

/// Name of a file type that is not a file, directory or symlink.
fn other_kind_name(ft: std::fs::FileType) -> &'static str {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if ft.is_socket() {
            return "socket";
        }
        if ft.is_fifo() {
            return "named pipe";
        }
        if ft.is_block_device() {
            return "block device";
        }
        if ft.is_char_device() {
            return "character device";
        }
    }
    #[cfg(not(unix))]
    let _ = ft;
    "unknown"
}

/// Program used to run scripts with a particular extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interpreter {
    /// Program to run.
    pub command: String,
    /// Arguments placed before the script path.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Interpreter {
    /// Whether no interpreter is configured.
    #[must_use]
    pub const fn is_none(&self) -> bool {
        self.command.is_empty()
    }
}

/// An external command run against the destination, e.g. `git pull`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cmd {
    /// Program to run.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub dir: PathBuf,
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Destination I/O used by the apply engine.
pub trait System: Send + Sync + fmt::Debug {
    /// Metadata of `path` without following a final symlink.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::NotFound`] if nothing exists at `path`.
    fn lstat(&self, path: &Path) -> io::Result<FileInfo>;

    /// Metadata of `path`, following symlinks.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::NotFound`] if nothing exists at `path`.
    fn stat(&self, path: &Path) -> io::Result<FileInfo>;

    /// Full contents of the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Names of the entries in directory `path`, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if `path` cannot be listed.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>>;

    /// Target of the symlink at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if `path` is not a readable symlink.
    fn readlink(&self, path: &Path) -> io::Result<String>;

    /// Create directory `path` with exactly `perm`.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::AlreadyExists`] if `path` exists.
    fn mkdir(&self, path: &Path, perm: u32) -> io::Result<()>;

    /// Replace the file at `path` with `data` and mode `perm`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    fn write_file(&self, path: &Path, data: &[u8], perm: u32) -> io::Result<()>;

    /// Replace whatever is at `newname` with a symlink to `oldname`.
    ///
    /// # Errors
    ///
    /// Returns an error if the link cannot be created.
    fn write_symlink(&self, oldname: &str, newname: &Path) -> io::Result<()>;

    /// Set the permission bits of `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if `path` does not exist.
    fn chmod(&self, path: &Path, perm: u32) -> io::Result<()>;

    /// Remove a file, symlink or empty directory.
    ///
    /// # Errors
    ///
    /// Returns an error if `path` is missing or is a non-empty directory.
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Remove `path` and everything beneath it. A missing path is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if removal fails.
    fn remove_all(&self, path: &Path) -> io::Result<()>;

    /// Rename `old` to `new`.
    ///
    /// # Errors
    ///
    /// Returns an error if the rename fails.
    fn rename(&self, old: &Path, new: &Path) -> io::Result<()>;

    /// Run script `name` with `contents` in or near `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error, including the script's standard error, if it
    /// cannot be run or exits non-zero.
    fn run_script(
        &self,
        name: &RelPath,
        dir: &Path,
        contents: &[u8],
        interpreter: Option<&Interpreter>,
    ) -> anyhow::Result<()>;

    /// Run an external command that modifies the destination.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be run or exits non-zero.
    fn run_cmd(&self, cmd: &Cmd) -> anyhow::Result<()>;
}

/// Replace `path` with `data` via a temporary file in the same directory.
///
/// The temporary file gets `perm` and is synced before the rename, so
/// readers see either the old or the new contents, never a mix.
pub(crate) fn write_atomic(path: &Path, data: &[u8], perm: u32) -> io::Result<()> {
    use std::io::Write as _;

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".dotstate")
        .tempfile_in(dir)?;
    tmp.write_all(data)?;
    set_perm(tmp.path(), perm)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Set exact permission bits.
#[cfg(unix)]
pub(crate) fn set_perm(path: &Path, perm: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(perm & 0o7777))
}

/// Set the read-only flag, the only permission bit Windows has.
#[cfg(not(unix))]
pub(crate) fn set_perm(path: &Path, perm: u32) -> io::Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_readonly(perm & 0o200 == 0);
    std::fs::set_permissions(path, perms)
}

/// Error returned by the write-only systems for every read.
pub(crate) fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{}: not found", path.display()),
    )
}

/// `path` relative to `root` with `/` separators, as used in archives and dumps.
pub(crate) fn archive_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .map_or_else(|_| RelPath::from_path(path), RelPath::from_path)
        .to_string()
}
