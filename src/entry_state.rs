//! The persisted snapshot of one destination entry.
use serde::{Deserialize, Serialize};

use crate::digest::{Sha256Sum, hex};

/// Kind of a persisted entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStateType {
    /// A directory.
    Dir,
    /// A regular file.
    File,
    /// A symbolic link.
    Symlink,
    /// Nothing exists at the path.
    #[default]
    Remove,
    /// A script that has been run.
    Script,
}

/// `{type, mode, contentsSHA256}` snapshot recorded after each write.
///
/// Keyed by absolute destination path in the `entryState` bucket and used on
/// the next run as the last written state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryState {
    /// Entry kind.
    #[serde(rename = "type")]
    pub entry_type: EntryStateType,
    /// Permission bits, zero when not meaningful.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub mode: u32,
    /// Hex SHA-256 of the contents (or symlink target).
    #[serde(
        rename = "contentsSHA256",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub contents_sha256: String,
    /// Raw contents, never persisted.
    #[serde(skip)]
    pub contents: Option<Vec<u8>>,
    /// Whether the entry was written with overwrite semantics.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub overwrite: bool,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_zero(mode: &u32) -> bool {
    *mode == 0
}

impl EntryState {
    /// State recorded for an absent path.
    #[must_use]
    pub fn remove() -> Self {
        Self::default()
    }

    /// State of a directory with `perm`.
    #[must_use]
    pub fn dir(perm: u32) -> Self {
        Self {
            entry_type: EntryStateType::Dir,
            mode: perm,
            ..Self::default()
        }
    }

    /// State of a file with `perm` and `contents`.
    #[must_use]
    pub fn file(perm: u32, sha256: &Sha256Sum, contents: Option<Vec<u8>>) -> Self {
        Self {
            entry_type: EntryStateType::File,
            mode: perm,
            contents_sha256: hex(sha256),
            contents,
            overwrite: false,
        }
    }

    /// State of a symlink whose target hashes to `sha256`.
    #[must_use]
    pub fn symlink(sha256: &Sha256Sum, linkname: &str) -> Self {
        Self {
            entry_type: EntryStateType::Symlink,
            contents_sha256: hex(sha256),
            contents: Some(linkname.as_bytes().to_vec()),
            ..Self::default()
        }
    }

    /// State of a script whose contents hash to `sha256`.
    #[must_use]
    pub fn script(sha256: &Sha256Sum, contents: Option<Vec<u8>>) -> Self {
        Self {
            entry_type: EntryStateType::Script,
            contents_sha256: hex(sha256),
            contents,
            ..Self::default()
        }
    }

    /// Whether type, permissions and content digest all match.
    ///
    /// Permission bits are ignored on platforms without Unix modes.
    #[must_use]
    pub fn equal(&self, other: &Self) -> bool {
        self.entry_type == other.entry_type
            && (cfg!(windows) || self.mode == other.mode)
            && self.contents_sha256 == other.contents_sha256
    }

    /// Serialized form stored in the `entryState` bucket.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Like [`EntryState::equal`], but treats a missing state as [`EntryStateType::Remove`].
#[must_use]
pub fn equivalent(a: Option<&EntryState>, b: Option<&EntryState>) -> bool {
    let a_remove = a.is_none_or(|s| s.entry_type == EntryStateType::Remove);
    let b_remove = b.is_none_or(|s| s.entry_type == EntryStateType::Remove);
    match (a, b) {
        _ if a_remove && b_remove => true,
        _ if a_remove != b_remove => false,
        (Some(a), Some(b)) => a.equal(b),
        _ => false,
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::digest::sha256_sum;

    #[test]
    fn json_omits_empty_fields() {
        let json = String::from_utf8(EntryState::remove().to_json().unwrap()).unwrap();
        assert_eq!(json, r#"{"type":"remove"}"#);
        let json = String::from_utf8(EntryState::dir(0o755).to_json().unwrap()).unwrap();
        assert_eq!(json, r#"{"type":"dir","mode":493}"#);
    }

    #[test]
    fn json_never_contains_contents() {
        let state = EntryState::file(0o644, &sha256_sum(b"secret"), Some(b"secret".to_vec()));
        let json = String::from_utf8(state.to_json().unwrap()).unwrap();
        assert!(!json.contains("secret"));
        let back: EntryState = serde_json::from_str(&json).unwrap();
        assert!(back.equal(&state));
        assert_eq!(back.contents, None);
    }

    #[test]
    fn equal_compares_mode_and_digest() {
        let a = EntryState::file(0o644, &sha256_sum(b"a"), None);
        assert!(a.equal(&EntryState::file(0o644, &sha256_sum(b"a"), None)));
        assert!(!a.equal(&EntryState::file(0o644, &sha256_sum(b"b"), None)));
        #[cfg(unix)]
        assert!(!a.equal(&EntryState::file(0o600, &sha256_sum(b"a"), None)));
    }

    #[test]
    fn missing_is_equivalent_to_remove() {
        let remove = EntryState::remove();
        assert!(equivalent(None, None));
        assert!(equivalent(None, Some(&remove)));
        assert!(equivalent(Some(&remove), None));
        assert!(!equivalent(None, Some(&EntryState::dir(0o755))));
    }
}
