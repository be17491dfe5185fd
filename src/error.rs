//! Error types for reading, storing and applying state.
//!
//! Each layer has its own [`thiserror`] enum. Core code wraps them in
//! [`anyhow::Error`] with the path being processed, so the typed error stays
//! the root cause and callers can `downcast_ref` to it.
//!
//! ```text
//! DotstateError
//! ├── Source(SourceError)   reading the source directory and externals
//! ├── State(StateError)     persistent state backends
//! └── Apply(ApplyError)     writing the destination, running commands
//! ```
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for the engine.
///
/// Aggregates domain-specific sub-errors and is convertible to
/// [`anyhow::Error`] for use at CLI command boundaries.
#[derive(Error, Debug)]
pub enum DotstateError {
    /// Error while reading the source state.
    #[error("Source state error: {0}")]
    Source(#[from] SourceError),

    /// Error from a persistent state backend.
    #[error("Persistent state error: {0}")]
    State(#[from] StateError),

    /// Error while applying the target state.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),
}

/// One target path claimed by several non-equivalent source entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InconsistentTarget {
    /// Target-relative path in conflict.
    pub target: String,
    /// Source-relative paths that all produce `target`, sorted.
    pub origins: Vec<String>,
}

impl fmt::Display for InconsistentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: inconsistent state ({})",
            self.target,
            self.origins.join(", ")
        )
    }
}

/// Joins [`InconsistentTarget`]s one per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InconsistentTargets(pub Vec<InconsistentTarget>);

impl fmt::Display for InconsistentTargets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, target) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{target}")?;
        }
        Ok(())
    }
}

/// Errors that arise while reading the source directory and its externals.
#[derive(Error, Debug)]
pub enum SourceError {
    /// A source or destination entry is neither a file, directory nor symlink.
    #[error("{path}: unsupported file type {mode}")]
    UnsupportedFileType {
        /// Offending path.
        path: PathBuf,
        /// Human-readable file mode.
        mode: String,
    },

    /// A non-script entry was found inside the scripts directory.
    #[error("{path}: not a script")]
    NotAScript {
        /// Offending source-relative path.
        path: String,
    },

    /// A reserved name was found where it is not permitted.
    #[error("{path}: not allowed in {dir} directory")]
    NotAllowed {
        /// Offending source-relative path.
        path: String,
        /// Directory the entry was found in.
        dir: String,
    },

    /// Several source entries produce the same target with different attributes.
    #[error("{0}")]
    Inconsistent(InconsistentTargets),

    /// The source directory requires a newer version of this program.
    #[error("source state requires version {need} or later, running version {have}")]
    TooOld {
        /// Running version.
        have: semver::Version,
        /// Version declared by the source directory.
        need: semver::Version,
    },

    /// An external declaration is malformed.
    #[error("{path}: invalid external: {reason}")]
    InvalidExternal {
        /// Target-relative path of the external.
        path: String,
        /// What is wrong with it.
        reason: String,
    },

    /// An archive member name is absolute or climbs out of the archive.
    #[error("{name}: invalid filename")]
    InvalidFilename {
        /// Member name as stored in the archive.
        name: String,
    },

    /// The same external target path is declared twice.
    #[error("{path}: duplicate external")]
    DuplicateExternal {
        /// Target-relative path of the external.
        path: String,
    },

    /// A manifest or archive format could not be determined.
    #[error("{path}: unknown format")]
    UnknownFormat {
        /// File or URL whose format is unknown.
        path: String,
    },

    /// Downloaded content does not match its declared checksum.
    #[error("{url}: {kind} mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// URL the content was fetched from.
        url: String,
        /// `sha256` or `size`.
        kind: &'static str,
        /// Declared value.
        expected: String,
        /// Computed value.
        actual: String,
    },

    /// `archive-file` external names a path the archive does not contain.
    #[error("{url}: {path}: not found in archive")]
    NotInArchive {
        /// Archive URL.
        url: String,
        /// Requested member path.
        path: String,
    },

    /// An encrypted entry was found but no encryption tool is configured.
    #[error("{path}: encryption not configured")]
    EncryptionNotConfigured {
        /// Source-relative path of the encrypted entry.
        path: String,
    },

    /// A template references data that does not exist.
    #[error("{name}: {reason}")]
    Template {
        /// Template name (usually the source-relative path).
        name: String,
        /// What went wrong.
        reason: String,
    },
}

/// An entry type name in an include/exclude list is not recognised.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}: unknown entry type")]
pub struct UnknownEntryType(pub String);

/// Errors from persistent state backends.
#[derive(Error, Debug)]
pub enum StateError {
    /// The state file is locked by another process.
    #[error("{path}: timeout obtaining persistent state lock, is another instance running?")]
    Locked {
        /// State file path.
        path: PathBuf,
    },

    /// The store was opened read-only and a mutation was attempted.
    #[error("{path}: persistent state is read-only")]
    ReadOnly {
        /// State file path.
        path: PathBuf,
    },

    /// The store was used after [`close`](crate::persistent_state::PersistentState::close).
    #[error("persistent state is closed")]
    Closed,

    /// An I/O error occurred on the state file.
    #[error("IO error on persistent state {path}: {source}")]
    Io {
        /// State file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The state file could not be decoded.
    #[error("{path}: invalid persistent state: {reason}")]
    Corrupt {
        /// State file path.
        path: PathBuf,
        /// Decoder message.
        reason: String,
    },

    /// An SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored value could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error raised by a [`for_each`](crate::persistent_state::PersistentState::for_each)
    /// callback.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors that arise while applying the target state.
#[derive(Error, Debug)]
pub enum ApplyError {
    /// A script, modify script, filter or external command exited non-zero.
    #[error("{label} failed (exit {code}): {stderr}")]
    CommandFailed {
        /// Command or script name.
        label: String,
        /// Exit code, or -1 if killed by a signal.
        code: i32,
        /// Captured standard error, trimmed.
        stderr: String,
    },

    /// A directory to be removed is not a directory.
    #[error("{path}: not a directory")]
    NotADirectory {
        /// Destination path.
        path: PathBuf,
    },

    /// A target path has no source entry.
    #[error("{path}: not managed")]
    NotManaged {
        /// Target-relative path.
        path: String,
    },
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use std::io;

    // -----------------------------------------------------------------------
    // SourceError
    // -----------------------------------------------------------------------

    #[test]
    fn unsupported_file_type_display() {
        let e = SourceError::UnsupportedFileType {
            path: PathBuf::from("/src/fifo"),
            mode: "p---------".to_string(),
        };
        assert_eq!(e.to_string(), "/src/fifo: unsupported file type p---------");
    }

    #[test]
    fn not_a_script_display() {
        let e = SourceError::NotAScript {
            path: ".dotstatescripts/dot_bashrc".to_string(),
        };
        assert_eq!(e.to_string(), ".dotstatescripts/dot_bashrc: not a script");
    }

    #[test]
    fn inconsistent_lists_one_target_per_line() {
        let e = SourceError::Inconsistent(InconsistentTargets(vec![
            InconsistentTarget {
                target: ".a".to_string(),
                origins: vec!["dot_a".to_string(), "private_dot_a".to_string()],
            },
            InconsistentTarget {
                target: ".b".to_string(),
                origins: vec!["dot_b".to_string(), "exact_dot_b".to_string()],
            },
        ]));
        assert_eq!(
            e.to_string(),
            ".a: inconsistent state (dot_a, private_dot_a)\n\
             .b: inconsistent state (dot_b, exact_dot_b)"
        );
    }

    #[test]
    fn too_old_display() {
        let e = SourceError::TooOld {
            have: semver::Version::new(0, 1, 0),
            need: semver::Version::new(2, 0, 0),
        };
        assert_eq!(
            e.to_string(),
            "source state requires version 2.0.0 or later, running version 0.1.0"
        );
    }

    #[test]
    fn invalid_filename_display() {
        let e = SourceError::InvalidFilename {
            name: "../../escaped".to_string(),
        };
        assert_eq!(e.to_string(), "../../escaped: invalid filename");
    }

    #[test]
    fn checksum_mismatch_display() {
        let e = SourceError::ChecksumMismatch {
            url: "https://example.com/a.tar.gz".to_string(),
            kind: "size",
            expected: "10".to_string(),
            actual: "12".to_string(),
        };
        assert_eq!(
            e.to_string(),
            "https://example.com/a.tar.gz: size mismatch: expected 10, got 12"
        );
    }

    // -----------------------------------------------------------------------
    // StateError
    // -----------------------------------------------------------------------

    #[test]
    fn locked_mentions_another_instance() {
        let e = StateError::Locked {
            path: PathBuf::from("/home/u/.config/dotstate/state.json"),
        };
        assert!(e.to_string().contains("another instance"));
        assert!(e.to_string().contains("state.json"));
    }

    #[test]
    fn state_io_has_source() {
        use std::error::Error as StdError;
        let e = StateError::Io {
            path: PathBuf::from("/state"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "permission denied"),
        };
        assert!(e.source().is_some());
    }

    // -----------------------------------------------------------------------
    // ApplyError
    // -----------------------------------------------------------------------

    #[test]
    fn command_failed_display() {
        let e = ApplyError::CommandFailed {
            label: "run_once_setup.sh".to_string(),
            code: 2,
            stderr: "boom".to_string(),
        };
        assert_eq!(e.to_string(), "run_once_setup.sh failed (exit 2): boom");
    }

    // -----------------------------------------------------------------------
    // DotstateError conversions
    // -----------------------------------------------------------------------

    #[test]
    fn dotstate_error_from_sub_errors() {
        let e: DotstateError = StateError::Closed.into();
        assert!(e.to_string().contains("Persistent state error"));
        let e: DotstateError = ApplyError::NotManaged {
            path: ".x".to_string(),
        }
        .into();
        assert!(e.to_string().contains("Apply error"));
        let e: DotstateError = SourceError::NotAScript {
            path: "x".to_string(),
        }
        .into();
        assert!(e.to_string().contains("Source state error"));
    }

    #[test]
    fn typed_root_cause_survives_anyhow_context() {
        use anyhow::Context as _;
        let result: anyhow::Result<()> = Err(StateError::Closed).context("reading state");
        let err = result.expect_err("should fail");
        assert!(err.downcast_ref::<StateError>().is_some());
    }

    // -----------------------------------------------------------------------
    // Send + Sync bounds
    // -----------------------------------------------------------------------

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn all_error_types_are_send_sync() {
        assert_send_sync::<DotstateError>();
        assert_send_sync::<SourceError>();
        assert_send_sync::<StateError>();
        assert_send_sync::<ApplyError>();
    }
}
