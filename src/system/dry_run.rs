//! Read-through, write-nothing backend for `--dry-run`.
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

use super::{Cmd, FileInfo, Interpreter, System};
use crate::relpath::RelPath;

/// Delegates reads to an underlying system and records, but does not
/// perform, every write.
#[derive(Debug)]
pub struct DryRunSystem {
    inner: Arc<dyn System>,
    modified: AtomicBool,
}

impl DryRunSystem {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn System>) -> Self {
        Self {
            inner,
            modified: AtomicBool::new(false),
        }
    }

    /// Whether any write was attempted.
    #[must_use]
    pub fn modified(&self) -> bool {
        self.modified.load(Ordering::Relaxed)
    }

    fn would(&self, action: &str, path: &Path) {
        self.modified.store(true, Ordering::Relaxed);
        tracing::info!(target: "dotstate::dry_run", "Would {action} {}", path.display());
    }
}

impl System for DryRunSystem {
    fn lstat(&self, path: &Path) -> io::Result<FileInfo> {
        self.inner.lstat(path)
    }

    fn stat(&self, path: &Path) -> io::Result<FileInfo> {
        self.inner.stat(path)
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.inner.read_file(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        self.inner.read_dir(path)
    }

    fn readlink(&self, path: &Path) -> io::Result<String> {
        self.inner.readlink(path)
    }

    fn mkdir(&self, path: &Path, perm: u32) -> io::Result<()> {
        self.would(&format!("create directory ({perm:o})"), path);
        Ok(())
    }

    fn write_file(&self, path: &Path, _data: &[u8], perm: u32) -> io::Result<()> {
        self.would(&format!("write file ({perm:o})"), path);
        Ok(())
    }

    fn write_symlink(&self, oldname: &str, newname: &Path) -> io::Result<()> {
        self.would(&format!("link to {oldname}"), newname);
        Ok(())
    }

    fn chmod(&self, path: &Path, perm: u32) -> io::Result<()> {
        self.would(&format!("chmod {perm:o}"), path);
        Ok(())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        self.would("remove", path);
        Ok(())
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        self.would("remove", path);
        Ok(())
    }

    fn rename(&self, old: &Path, new: &Path) -> io::Result<()> {
        self.would(&format!("rename {} to", old.display()), new);
        Ok(())
    }

    fn run_script(
        &self,
        name: &RelPath,
        dir: &Path,
        _contents: &[u8],
        _interpreter: Option<&Interpreter>,
    ) -> Result<()> {
        self.would(&format!("run script {name} in"), dir);
        Ok(())
    }

    fn run_cmd(&self, cmd: &Cmd) -> Result<()> {
        self.would(&format!("run `{cmd}` in"), &cmd.dir);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::system::RealSystem;

    #[test]
    fn reads_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), "x").unwrap();
        let system = DryRunSystem::new(Arc::new(RealSystem::new()));
        assert_eq!(system.read_file(&dir.path().join("f")).unwrap(), b"x");
        assert!(!system.modified());
    }

    #[test]
    fn writes_are_swallowed_and_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let system = DryRunSystem::new(Arc::new(RealSystem::new()));
        let path = dir.path().join("f");
        system.write_file(&path, b"x", 0o644).unwrap();
        system.mkdir(&dir.path().join("d"), 0o755).unwrap();
        system
            .run_script(&RelPath::new("s.sh"), dir.path(), b"exit 1", None)
            .unwrap();
        assert!(!path.exists());
        assert!(!dir.path().join("d").exists());
        assert!(system.modified());
    }
}
