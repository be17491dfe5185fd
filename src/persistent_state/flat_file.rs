//! Flat JSON file loaded lazily and written back on close.
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::memory::{
    bucket_snapshot, map_delete, map_delete_bucket, map_for_each, map_get, map_set,
};
use super::{ForEachFn, OpenMode, PersistentState, StateData, read_data_file, write_data_file};
use crate::error::StateError;

#[derive(Debug, Default)]
struct Inner {
    data: Option<StateData>,
    modified: bool,
}

/// A store kept entirely in memory between open and close.
///
/// The file is read on first access and rewritten by
/// [`close`](PersistentState::close) only if something changed.
#[derive(Debug)]
pub struct FlatFileState {
    path: PathBuf,
    mode: OpenMode,
    inner: Mutex<Inner>,
}

impl FlatFileState {
    /// Store backed by `path`. Nothing is read until first use.
    #[must_use]
    pub fn new(path: &Path, mode: OpenMode) -> Self {
        Self {
            path: path.to_path_buf(),
            mode,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Lock and load on first access.
    fn loaded(&self) -> Result<MutexGuard<'_, Inner>, StateError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.data.is_none() {
            inner.data = Some(read_data_file(&self.path)?);
        }
        Ok(inner)
    }

    fn mutate(&self, f: impl FnOnce(&mut StateData) -> bool) -> Result<(), StateError> {
        if self.mode == OpenMode::ReadOnly {
            return Err(StateError::ReadOnly {
                path: self.path.clone(),
            });
        }
        let mut inner = self.loaded()?;
        let changed = inner.data.as_mut().is_some_and(f);
        inner.modified |= changed;
        Ok(())
    }
}

impl PersistentState for FlatFileState {
    fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StateError> {
        let inner = self.loaded()?;
        Ok(inner.data.as_ref().and_then(|d| map_get(d, bucket, key)))
    }

    fn set(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StateError> {
        self.mutate(|d| {
            map_set(d, bucket, key, value);
            true
        })
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), StateError> {
        self.mutate(|d| map_delete(d, bucket, key))
    }

    fn delete_bucket(&self, bucket: &str) -> Result<(), StateError> {
        self.mutate(|d| map_delete_bucket(d, bucket))
    }

    fn for_each(&self, bucket: &str, f: &mut ForEachFn<'_>) -> Result<(), StateError> {
        let snapshot = {
            let inner = self.loaded()?;
            inner
                .data
                .as_ref()
                .map(|d| bucket_snapshot(d, bucket))
                .unwrap_or_default()
        };
        map_for_each(snapshot, f)
    }

    fn data(&self) -> Result<StateData, StateError> {
        Ok(self.loaded()?.data.clone().unwrap_or_default())
    }

    fn close(&self) -> Result<(), StateError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !inner.modified {
            return Ok(());
        }
        if let Some(data) = &inner.data {
            write_data_file(&self.path, data)?;
        }
        inner.modified = false;
        Ok(())
    }
}
