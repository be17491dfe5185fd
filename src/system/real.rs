//! Direct filesystem backend.
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context as _, Result};
use tempfile::TempDir;

use super::{Cmd, FileInfo, Interpreter, System, set_perm, write_atomic};
use crate::exec;
use crate::relpath::RelPath;

/// Writes straight to the filesystem.
///
/// Files are replaced atomically and every created entry gets exactly the
/// requested permission bits. Scripts are written to a private temporary
/// directory that lives as long as this value.
#[derive(Debug, Default)]
pub struct RealSystem {
    script_dir: Mutex<Option<TempDir>>,
}

impl RealSystem {
    /// A new real system.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Private directory for script files, created on first use.
    fn script_dir(&self) -> Result<PathBuf> {
        let mut guard = self
            .script_dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(dir) = guard.as_ref() {
            return Ok(dir.path().to_path_buf());
        }
        let dir = tempfile::Builder::new()
            .prefix("dotstate-scripts")
            .tempdir()
            .context("Failed to create script directory")?;
        set_perm(dir.path(), 0o700)?;
        let path = dir.path().to_path_buf();
        *guard = Some(dir);
        Ok(path)
    }
}

/// Nearest existing ancestor of `dir`, so scripts that create their own
/// target directory can still run.
fn script_working_dir(dir: &Path) -> PathBuf {
    dir.ancestors()
        .find(|d| d.is_dir())
        .map_or_else(|| PathBuf::from("/"), Path::to_path_buf)
}

#[cfg(unix)]
fn symlink(oldname: &str, newname: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(oldname, newname)
}

#[cfg(windows)]
fn symlink(oldname: &str, newname: &Path) -> io::Result<()> {
    let target = newname
        .parent()
        .map_or_else(|| PathBuf::from(oldname), |p| p.join(oldname));
    if target.is_dir() {
        std::os::windows::fs::symlink_dir(oldname, newname)
    } else {
        std::os::windows::fs::symlink_file(oldname, newname)
    }
}

impl System for RealSystem {
    fn lstat(&self, path: &Path) -> io::Result<FileInfo> {
        fs::symlink_metadata(path).map(|m| FileInfo::from_metadata(&m))
    }

    fn stat(&self, path: &Path) -> io::Result<FileInfo> {
        fs::metadata(path).map(|m| FileInfo::from_metadata(&m))
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names = fs::read_dir(path)?
            .map(|e| e.map(|entry| entry.file_name().to_string_lossy().to_string()))
            .collect::<io::Result<Vec<_>>>()?;
        names.sort();
        Ok(names)
    }

    fn readlink(&self, path: &Path) -> io::Result<String> {
        fs::read_link(path).map(|p| p.to_string_lossy().to_string())
    }

    fn mkdir(&self, path: &Path, perm: u32) -> io::Result<()> {
        fs::create_dir(path)?;
        set_perm(path, perm)
    }

    fn write_file(&self, path: &Path, data: &[u8], perm: u32) -> io::Result<()> {
        write_atomic(path, data, perm)
    }

    fn write_symlink(&self, oldname: &str, newname: &Path) -> io::Result<()> {
        self.remove_all(newname)?;
        symlink(oldname, newname)
    }

    fn chmod(&self, path: &Path, perm: u32) -> io::Result<()> {
        set_perm(path, perm)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        if fs::symlink_metadata(path)?.is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        }
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        let result = match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
            Ok(_) => fs::remove_file(path),
            Err(e) => Err(e),
        };
        match result {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn rename(&self, old: &Path, new: &Path) -> io::Result<()> {
        fs::rename(old, new)
    }

    fn run_script(
        &self,
        name: &RelPath,
        dir: &Path,
        contents: &[u8],
        interpreter: Option<&Interpreter>,
    ) -> Result<()> {
        let script_dir = self.script_dir()?;
        let mut file = tempfile::Builder::new()
            .prefix("")
            .suffix(&format!(".{}", name.base()))
            .tempfile_in(&script_dir)
            .with_context(|| format!("Failed to create script file for {name}"))?;
        file.write_all(contents)
            .with_context(|| format!("Failed to write script {name}"))?;
        set_perm(file.path(), 0o700)?;
        // Close the handle before exec to avoid ETXTBSY; the path is still
        // removed when `script` drops.
        let script = file.into_temp_path();

        let (program, args) = match interpreter.filter(|i| !i.is_none()) {
            Some(i) => {
                let mut args = i.args.clone();
                args.push(script.to_string_lossy().to_string());
                (PathBuf::from(&i.command), args)
            }
            None => (script.to_path_buf(), Vec::new()),
        };
        let cwd = script_working_dir(dir);
        tracing::debug!("running script {name} in {}", cwd.display());
        let result = exec::run_with_stdin(&program, &args, Some(&cwd), &[], name.as_str())?;
        let stdout = result.stdout_lossy();
        for line in stdout.lines() {
            tracing::info!("{line}");
        }
        Ok(())
    }

    fn run_cmd(&self, cmd: &Cmd) -> Result<()> {
        fs::create_dir_all(&cmd.dir)?;
        exec::run_in(&cmd.dir, &cmd.program, &cmd.args)?;
        Ok(())
    }
}
