//! Bucket/key/value store remembering what was last written.
//!
//! One trait, [`PersistentState`], with independent adapters:
//!
//! - [`TransactionalState`]: single JSON file, every mutation written
//!   atomically, guarded by a lock file so only one read-write opener exists
//! - [`SqliteState`]: an SQLite table keyed by `(bucket, key)`
//! - [`FlatFileState`]: whole map loaded on first access, written on close
//! - [`InMemoryState`]: the write layer used by dry runs and tests
use std::collections::BTreeMap;
use std::fmt;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StateError;

mod flat_file;
mod memory;
mod sqlite;
mod transactional;

pub use flat_file::FlatFileState;
pub use memory::InMemoryState;
pub use sqlite::SqliteState;
pub use transactional::TransactionalState;

/// Last written state of each destination path, keyed by absolute path.
pub const ENTRY_STATE_BUCKET: &str = "entryState";
/// Run markers of `run_once_` scripts, keyed by hex content digest.
pub const SCRIPT_STATE_BUCKET: &str = "scriptState";
/// Miscellaneous configuration fingerprints.
pub const CONFIG_STATE_BUCKET: &str = "configState";
/// Last clone/pull time of `git-repo` externals, keyed by target path.
pub const GIT_REPO_EXTERNAL_STATE_BUCKET: &str = "gitRepoExternalState";
/// Fetched external contents, keyed by hex digest of the URL.
pub const EXTERNAL_CACHE_BUCKET: &str = "externalCache";

/// Full contents of a store: bucket → key → value.
pub type StateData = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

/// Callback passed to [`PersistentState::for_each`].
pub type ForEachFn<'a> = dyn FnMut(&str, &[u8]) -> Result<ControlFlow<()>, StateError> + 'a;

/// A bucket/key/value store.
///
/// Implementations must be safe to share between walker threads.
pub trait PersistentState: Send + Sync + fmt::Debug {
    /// Value stored under `bucket`/`key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StateError>;

    /// Store `value` under `bucket`/`key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is read-only or cannot be written.
    fn set(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StateError>;

    /// Remove `bucket`/`key`. Missing keys are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is read-only or cannot be written.
    fn delete(&self, bucket: &str, key: &str) -> Result<(), StateError>;

    /// Remove a whole bucket. Missing buckets are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is read-only or cannot be written.
    fn delete_bucket(&self, bucket: &str) -> Result<(), StateError>;

    /// Call `f` for each key in `bucket` in key order until it breaks or fails.
    ///
    /// # Errors
    ///
    /// Returns the first error from the backend or from `f`.
    fn for_each(&self, bucket: &str, f: &mut ForEachFn<'_>) -> Result<(), StateError>;

    /// Snapshot of every bucket.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn data(&self) -> Result<StateData, StateError>;

    /// Flush pending writes and release any lock.
    ///
    /// # Errors
    ///
    /// Returns an error if pending data cannot be written.
    fn close(&self) -> Result<(), StateError>;

    /// Copy every key of every bucket into `other`.
    ///
    /// # Errors
    ///
    /// Returns the first read or write error.
    fn copy_to(&self, other: &dyn PersistentState) -> Result<(), StateError> {
        for (bucket, entries) in self.data()? {
            for (key, value) in entries {
                other.set(&bucket, &key, &value)?;
            }
        }
        Ok(())
    }
}

/// Whether a store may be mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Shared lock, mutations rejected.
    ReadOnly,
    /// Exclusive lock.
    ReadWrite,
}

/// Backend selector used by configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// [`TransactionalState`].
    #[default]
    Transactional,
    /// [`SqliteState`].
    Sqlite,
    /// [`FlatFileState`].
    Json,
}

impl Backend {
    /// Default file name for this backend.
    #[must_use]
    pub const fn default_file_name(self) -> &'static str {
        match self {
            Self::Transactional => "dotstatestate.db.json",
            Self::Sqlite => "dotstatestate.sqlite3",
            Self::Json => "dotstatestate.json",
        }
    }
}

/// Open the store at `path` with the given backend.
///
/// # Errors
///
/// Returns [`StateError::Locked`] if another process holds the lock for
/// longer than `lock_timeout`, or any backend open error.
pub fn open(
    backend: Backend,
    path: &Path,
    mode: OpenMode,
    lock_timeout: Duration,
) -> Result<Arc<dyn PersistentState>, StateError> {
    Ok(match backend {
        Backend::Transactional => Arc::new(TransactionalState::open(path, mode, lock_timeout)?),
        Backend::Sqlite => Arc::new(SqliteState::open(path, mode, lock_timeout)?),
        Backend::Json => Arc::new(FlatFileState::new(path, mode)),
    })
}

/// Deserialize a JSON value stored under `bucket`/`key`.
///
/// # Errors
///
/// Returns an error if the store cannot be read or the value is not valid JSON.
pub fn get_json<T: DeserializeOwned>(
    state: &dyn PersistentState,
    bucket: &str,
    key: &str,
) -> Result<Option<T>, StateError> {
    state
        .get(bucket, key)?
        .map(|bytes| serde_json::from_slice(&bytes))
        .transpose()
        .map_err(StateError::from)
}

/// Serialize `value` as JSON under `bucket`/`key`.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub fn set_json<T: Serialize>(
    state: &dyn PersistentState,
    bucket: &str,
    key: &str,
    value: &T,
) -> Result<(), StateError> {
    state.set(bucket, key, &serde_json::to_vec(value)?)
}

/// On-disk form of [`StateData`]: values base64-encoded.
type EncodedData = BTreeMap<String, BTreeMap<String, String>>;

/// Serialize a whole store for the file-backed adapters.
pub(crate) fn encode_data(data: &StateData) -> Result<Vec<u8>, StateError> {
    let encoded: EncodedData = data
        .iter()
        .map(|(bucket, entries)| {
            (
                bucket.clone(),
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), BASE64.encode(v)))
                    .collect(),
            )
        })
        .collect();
    Ok(serde_json::to_vec_pretty(&encoded)?)
}

/// Inverse of [`encode_data`].
pub(crate) fn decode_data(path: &Path, bytes: &[u8]) -> Result<StateData, StateError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(StateData::new());
    }
    let corrupt = |reason: String| StateError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };
    let encoded: EncodedData =
        serde_json::from_slice(bytes).map_err(|e| corrupt(e.to_string()))?;
    encoded
        .into_iter()
        .map(|(bucket, entries)| {
            let entries = entries
                .into_iter()
                .map(|(k, v)| {
                    BASE64
                        .decode(v.as_bytes())
                        .map(|v| (k, v))
                        .map_err(|e| corrupt(e.to_string()))
                })
                .collect::<Result<BTreeMap<_, _>, _>>()?;
            Ok((bucket, entries))
        })
        .collect()
}

/// Read a state file, treating a missing file as empty.
pub(crate) fn read_data_file(path: &Path) -> Result<StateData, StateError> {
    match std::fs::read(path) {
        Ok(bytes) => decode_data(path, &bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StateData::new()),
        Err(source) => Err(StateError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Write a state file atomically with mode 0600.
pub(crate) fn write_data_file(path: &Path, data: &StateData) -> Result<(), StateError> {
    let bytes = encode_data(data)?;
    crate::system::write_atomic(path, &bytes, 0o600).map_err(|source| StateError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Path of the sidecar lock file for `path`.
pub(crate) fn lock_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".lock");
    PathBuf::from(s)
}

/// Render a store as JSON for `state dump`: values that are themselves JSON
/// are embedded, anything else is shown as base64.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub fn dump_json(state: &dyn PersistentState) -> Result<serde_json::Value, StateError> {
    let data = state.data()?;
    let mut root = serde_json::Map::new();
    for (bucket, entries) in data {
        let mut obj = serde_json::Map::new();
        for (key, value) in entries {
            let rendered = serde_json::from_slice::<serde_json::Value>(&value)
                .unwrap_or_else(|_| serde_json::Value::String(BASE64.encode(&value)));
            obj.insert(key, rendered);
        }
        root.insert(bucket, serde_json::Value::Object(obj));
    }
    Ok(serde_json::Value::Object(root))
}
