//! In-memory store, also the map logic shared by the file-backed adapters.
use std::sync::{Mutex, PoisonError};

use super::{ForEachFn, PersistentState, StateData};
use crate::error::StateError;

pub(super) fn map_get(data: &StateData, bucket: &str, key: &str) -> Option<Vec<u8>> {
    data.get(bucket).and_then(|b| b.get(key)).cloned()
}

pub(super) fn map_set(data: &mut StateData, bucket: &str, key: &str, value: &[u8]) {
    data.entry(bucket.to_string())
        .or_default()
        .insert(key.to_string(), value.to_vec());
}

/// Returns whether anything was removed.
pub(super) fn map_delete(data: &mut StateData, bucket: &str, key: &str) -> bool {
    let Some(entries) = data.get_mut(bucket) else {
        return false;
    };
    let removed = entries.remove(key).is_some();
    if entries.is_empty() {
        data.remove(bucket);
    }
    removed
}

/// Returns whether anything was removed.
pub(super) fn map_delete_bucket(data: &mut StateData, bucket: &str) -> bool {
    data.remove(bucket).is_some()
}

/// Iterate over a snapshot of `bucket` so `f` may call back into the store.
pub(super) fn map_for_each(
    snapshot: Vec<(String, Vec<u8>)>,
    f: &mut ForEachFn<'_>,
) -> Result<(), StateError> {
    for (key, value) in snapshot {
        if f(&key, &value)?.is_break() {
            break;
        }
    }
    Ok(())
}

pub(super) fn bucket_snapshot(data: &StateData, bucket: &str) -> Vec<(String, Vec<u8>)> {
    data.get(bucket)
        .map(|b| b.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

/// A store that lives only as long as the process.
///
/// Used as the write layer over a read-only store for dry runs and status,
/// and in tests.
#[derive(Debug, Default)]
pub struct InMemoryState {
    data: Mutex<StateData>,
}

impl InMemoryState {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PersistentState for InMemoryState {
    fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StateError> {
        Ok(map_get(&self.lock(), bucket, key))
    }

    fn set(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StateError> {
        map_set(&mut self.lock(), bucket, key, value);
        Ok(())
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), StateError> {
        map_delete(&mut self.lock(), bucket, key);
        Ok(())
    }

    fn delete_bucket(&self, bucket: &str) -> Result<(), StateError> {
        map_delete_bucket(&mut self.lock(), bucket);
        Ok(())
    }

    fn for_each(&self, bucket: &str, f: &mut ForEachFn<'_>) -> Result<(), StateError> {
        let snapshot = bucket_snapshot(&self.lock(), bucket);
        map_for_each(snapshot, f)
    }

    fn data(&self) -> Result<StateData, StateError> {
        Ok(self.lock().clone())
    }

    fn close(&self) -> Result<(), StateError> {
        Ok(())
    }
}
