//! Two-column status lines and managed-target listings.
//!
//! The first column compares the last written state with the actual state,
//! the second compares the actual state with the target state:
//!
//! ```text
//!  A .bashrc      not there yet
//! M  .gitconfig   edited since the last apply, already matches the source
//! MM .vimrc       edited, and the source changed too
//!  R install.sh   script would run
//! ```
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context as _, Result};

use crate::entry_state::{EntryState, EntryStateType, equivalent};
use crate::entry_type_set::EntryTypeFilter;
use crate::relpath::RelPath;
use crate::source_state::{ApplyEnv, PreApplyFn, SourceState};
use crate::system::System;

/// Status character for a change from `from` to `to`.
#[must_use]
pub fn rune(from: &EntryState, to: &EntryState) -> char {
    if equivalent(Some(from), Some(to)) {
        ' '
    } else if to.entry_type == EntryStateType::Script {
        'R'
    } else if from.entry_type == EntryStateType::Remove {
        'A'
    } else if to.entry_type == EntryStateType::Remove {
        'D'
    } else {
        'M'
    }
}

/// The `XY path` line for one target, or `None` when nothing differs.
#[must_use]
pub fn status_line(
    path: &RelPath,
    target: &EntryState,
    last: Option<&EntryState>,
    actual: &EntryState,
) -> Option<String> {
    let x = match last {
        Some(last) if target.entry_type != EntryStateType::Script => rune(last, actual),
        _ => ' ',
    };
    let y = rune(actual, target);
    (x != ' ' || y != ' ').then(|| format!("{x}{y} {path}"))
}

/// Status lines for `selected` (everything when empty), in apply order.
///
/// Nothing is written to the destination. Empty `remove_` directories are
/// listed with a `D` instead of being removed. Entries that are already in
/// sync still have their last written state refreshed, so `env.state`
/// should be a scratch copy.
///
/// # Errors
///
/// Returns the first evaluation error.
pub fn status(
    source_state: &SourceState,
    env: &ApplyEnv<'_>,
    selected: &[RelPath],
) -> Result<Vec<String>> {
    let order: BTreeMap<RelPath, usize> = source_state
        .select(selected)?
        .into_iter()
        .enumerate()
        .map(|(i, path)| (path, i))
        .collect();
    let lines = Mutex::new(Vec::new());
    let collect = |path: &RelPath,
                   target: &EntryState,
                   last: Option<&EntryState>,
                   actual: &EntryState|
     -> Result<ControlFlow<()>> {
        if let Some(line) = status_line(path, target, last, actual) {
            lines
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((order.get(path).copied().unwrap_or(usize::MAX), line));
        }
        Ok(ControlFlow::Break(()))
    };
    let pre_apply: &PreApplyFn<'_> = &collect;
    let env = ApplyEnv {
        pre_apply: Some(pre_apply),
        ..*env
    };
    source_state.apply_all(&env, selected)?;

    let mut lines = lines.into_inner().unwrap_or_else(PoisonError::into_inner);
    lines.sort();
    Ok(lines.into_iter().map(|(_, line)| line).collect())
}

/// Managed target paths whose entry passes `filter`, sorted.
///
/// # Errors
///
/// Returns an error if an entry's target cannot be evaluated.
pub fn managed(
    source_state: &SourceState,
    dest_system: &Arc<dyn System>,
    filter: EntryTypeFilter,
) -> Result<Vec<RelPath>> {
    let mut paths = Vec::new();
    for (path, entry) in source_state.entries() {
        if !filter.includes_source(&entry.source_attr()) {
            continue;
        }
        let target = entry
            .target_state_entry(dest_system, &path.to_abs(source_state.dest_dir()))
            .with_context(|| format!("{path}"))?;
        if filter.includes_entry(target.kind(), &target.source_attr()) {
            paths.push(path.clone());
        }
    }
    Ok(paths)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::digest::sha256_sum;
    use crate::entry_type_set::EntryTypeSet;
    use crate::persistent_state::InMemoryState;
    use crate::source_state::ReadOptions;
    use crate::system::RealSystem;
    use std::fs;
    use std::path::Path;

    fn file(contents: &str) -> EntryState {
        EntryState::file(0o644, &sha256_sum(contents.as_bytes()), None)
    }

    #[test]
    fn runes_compare_type_then_contents() {
        let remove = EntryState::remove();
        assert_eq!(rune(&remove, &remove), ' ');
        assert_eq!(rune(&remove, &file("a")), 'A');
        assert_eq!(rune(&file("a"), &remove), 'D');
        assert_eq!(rune(&file("a"), &file("b")), 'M');
        assert_eq!(rune(&file("a"), &EntryState::dir(0o755)), 'M');
        assert_eq!(
            rune(&remove, &EntryState::script(&sha256_sum(b"echo"), None)),
            'R'
        );
    }

    #[test]
    fn lines_need_a_difference() {
        let path = RelPath::new(".bashrc");
        assert_eq!(
            status_line(&path, &file("a"), None, &EntryState::remove()),
            Some(" A .bashrc".to_string())
        );
        assert_eq!(
            status_line(&path, &file("a"), Some(&file("a")), &file("a")),
            None
        );
        assert_eq!(
            status_line(&path, &file("b"), Some(&file("a")), &file("c")),
            Some("MM .bashrc".to_string())
        );
        assert_eq!(
            status_line(&path, &file("b"), Some(&file("a")), &file("b")),
            Some("M  .bashrc".to_string())
        );
    }

    #[test]
    fn scripts_ignore_the_last_run() {
        let path = RelPath::new("setup.sh");
        let script = EntryState::script(&sha256_sum(b"echo"), None);
        assert_eq!(
            status_line(&path, &script, Some(&script), &EntryState::remove()),
            Some(" R setup.sh".to_string())
        );
    }

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[cfg(unix)]
    fn chmod(path: &Path, mode: u32) {
        use std::os::unix::fs::PermissionsExt as _;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[cfg(not(unix))]
    fn chmod(_path: &Path, _mode: u32) {}

    #[test]
    fn status_reports_without_writing() {
        let tmp = tempfile::tempdir().unwrap();
        let (source, dest) = (tmp.path().join("src"), tmp.path().join("home"));
        write(&source, "dot_a", "a\n");
        write(&source, "dot_b", "b\n");
        write(&source, "dot_config/c", "c\n");
        write(&dest, ".b", "b\n");
        write(&dest, ".config/c", "old\n");
        chmod(&dest.join(".b"), 0o644);
        chmod(&dest.join(".config"), 0o755);

        let source_state = SourceState::read(&ReadOptions::new(&source, &dest)).unwrap();
        let system: Arc<dyn System> = Arc::new(RealSystem::new());
        let state = InMemoryState::new();
        let env = ApplyEnv {
            target_system: &system,
            dest_system: &system,
            state: &state,
            target_dir: &dest,
            filter: EntryTypeFilter::default(),
            umask: 0o022,
            parallel: true,
            pre_apply: None,
        };

        let lines = status(&source_state, &env, &[]).unwrap();
        assert_eq!(lines, vec![" A .a", " M .config/c"]);
        assert!(!dest.join(".a").exists());
        assert_eq!(fs::read_to_string(dest.join(".config/c")).unwrap(), "old\n");
    }

    #[test]
    fn managed_filters_by_type() {
        let tmp = tempfile::tempdir().unwrap();
        let (source, dest) = (tmp.path().join("src"), tmp.path().join("home"));
        write(&source, "dot_a", "a\n");
        write(&source, "symlink_dot_l", "target\n");
        write(&source, "dot_config/c", "c\n");

        let source_state = SourceState::read(&ReadOptions::new(&source, &dest)).unwrap();
        let system: Arc<dyn System> = Arc::new(RealSystem::new());

        let all = managed(&source_state, &system, EntryTypeFilter::default()).unwrap();
        assert_eq!(
            all.iter().map(RelPath::as_str).collect::<Vec<_>>(),
            vec![".a", ".config", ".config/c", ".l"]
        );

        let files = EntryTypeFilter::new(EntryTypeSet::FILES, EntryTypeSet::NONE);
        let only_files = managed(&source_state, &system, files).unwrap();
        assert_eq!(
            only_files.iter().map(RelPath::as_str).collect::<Vec<_>>(),
            vec![".a", ".config/c"]
        );
    }
}
