//! SQLite-backed store with one `(bucket, key, value)` table.
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension, params};

use super::{ForEachFn, OpenMode, PersistentState, StateData};
use crate::error::StateError;

const CREATE_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS state (
        bucket TEXT NOT NULL,
        key TEXT NOT NULL,
        value BLOB NOT NULL,
        PRIMARY KEY (bucket, key)
    );
";

/// Relational store.
#[derive(Debug)]
pub struct SqliteState {
    path: PathBuf,
    read_only: bool,
    conn: Mutex<Option<Connection>>,
}

impl SqliteState {
    /// Open or create the database at `path`.
    ///
    /// A read-only open of a missing database uses an empty in-memory one so
    /// that nothing is created on disk. Either way a read-only store rejects
    /// mutations with [`StateError::ReadOnly`].
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be created.
    pub fn open(path: &Path, mode: OpenMode, busy_timeout: Duration) -> Result<Self, StateError> {
        let conn = match mode {
            OpenMode::ReadWrite => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|source| StateError::Io {
                        path: path.to_path_buf(),
                        source,
                    })?;
                }
                let conn = Connection::open(path)?;
                conn.busy_timeout(busy_timeout)?;
                conn.execute_batch(CREATE_SCHEMA)
                    .map_err(|e| map_busy(e, path))?;
                conn
            }
            OpenMode::ReadOnly if path.exists() => {
                let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
                conn.busy_timeout(busy_timeout)?;
                conn
            }
            OpenMode::ReadOnly => {
                let conn = Connection::open_in_memory()?;
                conn.execute_batch(CREATE_SCHEMA)?;
                conn
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            read_only: mode == OpenMode::ReadOnly,
            conn: Mutex::new(Some(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StateError> {
        let guard = self.conn();
        let conn = guard.as_ref().ok_or(StateError::Closed)?;
        f(conn).map_err(|e| map_busy(e, &self.path))
    }

    fn with_writable_conn(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<()>,
    ) -> Result<(), StateError> {
        if self.read_only {
            return Err(StateError::ReadOnly {
                path: self.path.clone(),
            });
        }
        self.with_conn(f)
    }
}

/// Translate lock contention into the friendly error.
fn map_busy(e: rusqlite::Error, path: &Path) -> StateError {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) {
            return StateError::Locked {
                path: path.to_path_buf(),
            };
        }
        if err.code == ErrorCode::ReadOnly {
            return StateError::ReadOnly {
                path: path.to_path_buf(),
            };
        }
    }
    StateError::Sqlite(e)
}

impl PersistentState for SqliteState {
    fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StateError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM state WHERE bucket = ?1 AND key = ?2",
                params![bucket, key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    fn set(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StateError> {
        self.with_writable_conn(|conn| {
            conn.execute(
                "INSERT INTO state (bucket, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT (bucket, key) DO UPDATE SET value = excluded.value",
                params![bucket, key, value],
            )
            .map(drop)
        })
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), StateError> {
        self.with_writable_conn(|conn| {
            conn.execute(
                "DELETE FROM state WHERE bucket = ?1 AND key = ?2",
                params![bucket, key],
            )
            .map(drop)
        })
    }

    fn delete_bucket(&self, bucket: &str) -> Result<(), StateError> {
        self.with_writable_conn(|conn| {
            conn.execute("DELETE FROM state WHERE bucket = ?1", params![bucket])
                .map(drop)
        })
    }

    fn for_each(&self, bucket: &str, f: &mut ForEachFn<'_>) -> Result<(), StateError> {
        // Collect first so the connection is not held while `f` runs.
        let rows: Vec<(String, Vec<u8>)> = self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT key, value FROM state WHERE bucket = ?1 ORDER BY key")?;
            let rows = stmt.query_map(params![bucket], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })?;
        for (key, value) in rows {
            if f(&key, &value)?.is_break() {
                break;
            }
        }
        Ok(())
    }

    fn data(&self) -> Result<StateData, StateError> {
        let rows: Vec<(String, String, Vec<u8>)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT bucket, key, value FROM state")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            rows.collect()
        })?;
        let mut data = StateData::new();
        for (bucket, key, value) in rows {
            data.entry(bucket).or_default().insert(key, value);
        }
        Ok(data)
    }

    fn close(&self) -> Result<(), StateError> {
        if let Some(conn) = self.conn().take() {
            conn.close().map_err(|(_, e)| StateError::Sqlite(e))?;
        }
        Ok(())
    }
}
