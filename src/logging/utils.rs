//! Log file helpers.
use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::config;

/// CSI sequences (`ESC [ params final`) and two-byte `ESC x` escapes.
static ANSI_RX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\x1b(?:\[[0-?]*[ -/]*[@-~]|[@-_])").ok());

/// `s` without terminal escape sequences.
pub(super) fn strip_ansi(s: &str) -> Cow<'_, str> {
    ANSI_RX
        .as_ref()
        .map_or(Cow::Borrowed(s), |rx| rx.replace_all(s, ""))
}

/// `<cache dir>/<command>.log`; `None` when the directory cannot be made.
pub(super) fn log_path(command: &str) -> Option<PathBuf> {
    let dir = config::cache_dir();
    std::fs::create_dir_all(&dir).ok()?;
    Some(dir.join(command).with_extension("log"))
}

/// Time of day for each log line.
pub(super) fn clock(now: DateTime<Utc>) -> String {
    now.format("%H:%M:%S%.3f").to_string()
}

/// Full timestamp for the run header.
pub(super) fn stamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    #[test]
    fn colors_and_cursor_moves_are_removed() {
        assert_eq!(strip_ansi("\x1b[31mERROR\x1b[0m hello"), "ERROR hello");
        assert_eq!(strip_ansi("\x1b[1;34m==>\x1b[0m \x1b[1mx\x1b[0m"), "==> x");
        assert_eq!(strip_ansi("\x1b[2;5Htext"), "text");
        assert_eq!(strip_ansi("\x1b[2Jhello"), "hello");
        assert_eq!(strip_ansi("\x1bMtext"), "text");
    }

    #[test]
    fn plain_text_is_borrowed() {
        assert!(matches!(strip_ansi("no codes"), Cow::Borrowed("no codes")));
        assert_eq!(strip_ansi(""), "");
    }

    #[test]
    fn timestamps() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(clock(now), "07:05:01.000");
        assert_eq!(stamp(now), "2024-03-09T07:05:01Z");
    }
}
