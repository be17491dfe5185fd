//! Single-file store with per-mutation atomic writes and process locking.
//!
//! Read-only openers take a shared lock on a sidecar `<path>.lock` file and a
//! read-write opener takes an exclusive one, so any number of readers or a
//! single writer may hold the store at a time. Waiting for the lock is
//! bounded by a timeout that surfaces as [`StateError::Locked`].
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use fs2::FileExt;

use super::memory::{
    bucket_snapshot, map_delete, map_delete_bucket, map_for_each, map_get, map_set,
};
use super::{
    ForEachFn, OpenMode, PersistentState, StateData, lock_path, read_data_file, write_data_file,
};
use crate::error::StateError;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Transactional single-file store.
#[derive(Debug)]
pub struct TransactionalState {
    path: PathBuf,
    mode: OpenMode,
    data: Mutex<StateData>,
    lock: Mutex<Option<File>>,
    closed: Mutex<bool>,
}

impl TransactionalState {
    /// Open `path`, waiting up to `timeout` for the lock.
    ///
    /// A read-only open of a store that does not exist yet creates nothing
    /// and behaves as an empty store.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Locked`] on lock timeout, or an I/O or decode error.
    pub fn open(path: &Path, mode: OpenMode, timeout: Duration) -> Result<Self, StateError> {
        let io_err = |source| StateError::Io {
            path: path.to_path_buf(),
            source,
        };
        let lock_file_path = lock_path(path);
        let lock = match mode {
            OpenMode::ReadWrite => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(io_err)?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .write(true)
                    .open(&lock_file_path)
                    .map_err(io_err)?;
                acquire(&file, path, timeout, <File as FileExt>::try_lock_exclusive)?;
                Some(file)
            }
            OpenMode::ReadOnly => match File::open(&lock_file_path) {
                Ok(file) => {
                    acquire(&file, path, timeout, <File as FileExt>::try_lock_shared)?;
                    Some(file)
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(io_err(e)),
            },
        };
        let data = read_data_file(path)?;
        tracing::debug!("opened persistent state {} ({mode:?})", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            mode,
            data: Mutex::new(data),
            lock: Mutex::new(lock),
            closed: Mutex::new(false),
        })
    }

    fn check_open(&self) -> Result<(), StateError> {
        if *self.closed.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(StateError::Closed);
        }
        Ok(())
    }

    fn read(&self) -> Result<MutexGuard<'_, StateData>, StateError> {
        self.check_open()?;
        Ok(self.data.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Apply `f` and, if it changed anything, commit the whole store.
    fn update(&self, f: impl FnOnce(&mut StateData) -> bool) -> Result<(), StateError> {
        self.check_open()?;
        if self.mode == OpenMode::ReadOnly {
            return Err(StateError::ReadOnly {
                path: self.path.clone(),
            });
        }
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = data.clone();
        if f(&mut next) {
            write_data_file(&self.path, &next)?;
            *data = next;
        }
        Ok(())
    }
}

/// Poll `try_lock` until it succeeds or `timeout` elapses.
fn acquire(
    file: &File,
    path: &Path,
    timeout: Duration,
    try_lock: fn(&File) -> std::io::Result<()>,
) -> Result<(), StateError> {
    let deadline = Instant::now() + timeout;
    let contended = fs2::lock_contended_error().raw_os_error();
    loop {
        match try_lock(file) {
            Ok(()) => return Ok(()),
            Err(e) if e.raw_os_error() == contended || e.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(StateError::Locked {
                        path: path.to_path_buf(),
                    });
                }
                std::thread::sleep(LOCK_POLL_INTERVAL);
            }
            Err(source) => {
                return Err(StateError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
    }
}

impl PersistentState for TransactionalState {
    fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StateError> {
        Ok(map_get(&*self.read()?, bucket, key))
    }

    fn set(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StateError> {
        self.update(|d| {
            map_set(d, bucket, key, value);
            true
        })
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), StateError> {
        self.update(|d| map_delete(d, bucket, key))
    }

    fn delete_bucket(&self, bucket: &str) -> Result<(), StateError> {
        self.update(|d| map_delete_bucket(d, bucket))
    }

    fn for_each(&self, bucket: &str, f: &mut ForEachFn<'_>) -> Result<(), StateError> {
        let snapshot = bucket_snapshot(&*self.read()?, bucket);
        map_for_each(snapshot, f)
    }

    fn data(&self) -> Result<StateData, StateError> {
        Ok(self.read()?.clone())
    }

    fn close(&self) -> Result<(), StateError> {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner) = true;
        if let Some(file) = self
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            <File as FileExt>::unlock(&file).map_err(|source| StateError::Io {
                path: self.path.clone(),
                source,
            })?;
        }
        Ok(())
    }
}
