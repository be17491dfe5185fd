//! Reconciling the destination with a [`SourceState`].
use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context as _, Result};

use super::{SourceState, SourceStateEntry};
use crate::actual_state::ActualStateEntry;
use crate::attr::ScriptOrder;
use crate::concurrent_tree::ConcurrentTree;
use crate::entry_state::{EntryState, equivalent};
use crate::entry_type_set::EntryTypeFilter;
use crate::error::ApplyError;
use crate::persistent_state::{self, ENTRY_STATE_BUCKET, PersistentState};
use crate::relpath::RelPath;
use crate::system::{FileKind, System};

/// Called before each write with the target, last written and actual
/// states. Returning [`ControlFlow::Break`] skips the entry.
pub type PreApplyFn<'f> = dyn Fn(
        &RelPath,
        &EntryState,
        Option<&EntryState>,
        &EntryState,
    ) -> Result<ControlFlow<()>>
    + Sync
    + 'f;

/// Where and how to apply.
pub struct ApplyEnv<'a> {
    /// Receives the writes.
    pub target_system: &'a Arc<dyn System>,
    /// Inspected by entries whose target depends on the current destination.
    pub dest_system: &'a Arc<dyn System>,
    /// Last written states and run markers.
    pub state: &'a dyn PersistentState,
    /// Root the target paths are resolved against.
    pub target_dir: &'a Path,
    /// Entry types to apply.
    pub filter: EntryTypeFilter,
    /// Bits cleared from every permission.
    pub umask: u32,
    /// Walk sibling subtrees concurrently.
    pub parallel: bool,
    /// Status and diff hook. When set, empty `remove_` directories are
    /// reported through it instead of being removed.
    pub pre_apply: Option<&'a PreApplyFn<'a>>,
}

impl fmt::Debug for ApplyEnv<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplyEnv")
            .field("target_system", self.target_system)
            .field("dest_system", self.dest_system)
            .field("state", &self.state)
            .field("target_dir", &self.target_dir)
            .field("filter", &self.filter)
            .field("umask", &format_args!("{:03o}", self.umask))
            .field("parallel", &self.parallel)
            .field("pre_apply", &self.pre_apply.map(|_| "<dyn Fn>"))
            .finish()
    }
}

fn entry_state_key(abs: &Path) -> String {
    abs.to_string_lossy().to_string()
}

impl SourceState {
    /// Make the destination entry at `target` match the source.
    ///
    /// Returns whether anything was written or run.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::NotManaged`] for unknown targets, and any
    /// evaluation, I/O, subprocess or persistent state error.
    pub fn apply(&self, env: &ApplyEnv<'_>, target: &RelPath) -> Result<bool> {
        let entry = self.entry(target).ok_or_else(|| ApplyError::NotManaged {
            path: target.to_string(),
        })?;
        if !env.filter.includes_source(&entry.source_attr()) {
            return Ok(false);
        }

        let target_state_entry = entry
            .target_state_entry(env.dest_system, &target.to_abs(&self.dest_dir))
            .with_context(|| format!("{target}"))?;
        if !env
            .filter
            .includes_entry(target_state_entry.kind(), &target_state_entry.source_attr())
        {
            return Ok(false);
        }
        let target_state = target_state_entry
            .entry_state(env.umask)
            .with_context(|| format!("{target}"))?;

        let abs = target.to_abs(env.target_dir);
        if target_state_entry.skip_apply(env.state, &abs)? {
            tracing::debug!("{target}: skipped");
            return Ok(false);
        }

        let actual = ActualStateEntry::new(env.target_system, &abs)?;
        let actual_state = actual.entry_state()?;
        let key = entry_state_key(&abs);
        let mut last: Option<EntryState> =
            persistent_state::get_json(env.state, ENTRY_STATE_BUCKET, &key)?;

        // The destination already matches; only the record is out of date.
        if !target_state_entry.is_script()
            && target_state.equal(&actual_state)
            && !equivalent(Some(&target_state), last.as_ref())
        {
            tracing::debug!("{target}: recording current state");
            persistent_state::set_json(env.state, ENTRY_STATE_BUCKET, &key, &target_state)?;
            last = Some(target_state.clone());
        }

        if let Some(pre_apply) = env.pre_apply
            && pre_apply(target, &target_state, last.as_ref(), &actual_state)?.is_break()
        {
            return Ok(false);
        }

        let changed = target_state_entry
            .apply(env.target_system.as_ref(), env.state, &actual)
            .with_context(|| format!("{target}"))?;
        if changed {
            tracing::info!("{target}");
            persistent_state::set_json(env.state, ENTRY_STATE_BUCKET, &key, &target_state)?;
        } else {
            tracing::debug!("{target}: up to date");
        }
        Ok(changed)
    }

    /// Managed targets at or beneath any of `selected`, in apply order.
    /// Empty `selected` means everything.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::NotManaged`] for a selection that matches nothing.
    pub fn select(&self, selected: &[RelPath]) -> Result<Vec<RelPath>> {
        let all = self.target_rel_paths();
        if selected.is_empty() {
            return Ok(all);
        }
        for wanted in selected {
            if !self.entries.keys().any(|path| path.has_prefix(wanted)) {
                return Err(ApplyError::NotManaged {
                    path: wanted.to_string(),
                }
                .into());
            }
        }
        Ok(all
            .into_iter()
            .filter(|path| selected.iter().any(|wanted| path.has_prefix(wanted)))
            .collect())
    }

    /// Apply `selected` (everything when empty): `before_` scripts in
    /// order, other entries through the concurrent walker, then `after_`
    /// scripts, then empty `remove_` directories.
    ///
    /// Returns the changed targets, sorted.
    ///
    /// # Errors
    ///
    /// Returns the first error. Sibling subtrees of a failed entry still
    /// finish.
    pub fn apply_all(&self, env: &ApplyEnv<'_>, selected: &[RelPath]) -> Result<Vec<RelPath>> {
        let targets = self.select(selected)?;
        let changed = Mutex::new(Vec::new());
        let visit = |target: &RelPath| -> Result<()> {
            if self.apply(env, target)? {
                changed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(target.clone());
            }
            Ok(())
        };

        let (mut before, mut during, mut after) = (Vec::new(), Vec::new(), Vec::new());
        for target in &targets {
            match self
                .entry(target)
                .map_or(ScriptOrder::During, SourceStateEntry::order)
            {
                ScriptOrder::Before => before.push(target),
                ScriptOrder::During => during.push(target),
                ScriptOrder::After => after.push(target),
            }
        }
        for target in before {
            visit(target)?;
        }
        ConcurrentTree::new(during).walk(env.parallel, &visit)?;
        for target in after {
            visit(target)?;
        }

        let visited: BTreeSet<&RelPath> = targets.iter().collect();
        self.post_apply(env, &visited)?;
        let mut changed = changed.into_inner().unwrap_or_else(PoisonError::into_inner);
        changed.sort();
        Ok(changed)
    }

    /// Remove visited `remove_` directories that are now empty, deepest
    /// first. Directories that still hold unmanaged entries are kept.
    fn post_apply(&self, env: &ApplyEnv<'_>, visited: &BTreeSet<&RelPath>) -> Result<()> {
        for dir in self.remove_dirs.iter().rev() {
            if !visited.contains(dir) {
                continue;
            }
            let abs = dir.to_abs(env.target_dir);
            match env.target_system.stat(&abs) {
                Ok(info) if info.kind == FileKind::Dir => {}
                Ok(_) => return Err(ApplyError::NotADirectory { path: abs }.into()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e).with_context(|| format!("stat {}", abs.display())),
            }
            if let Some(pre_apply) = env.pre_apply {
                let empty = env
                    .target_system
                    .read_dir(&abs)
                    .with_context(|| format!("read {}", abs.display()))?
                    .is_empty();
                if empty {
                    let last: Option<EntryState> = persistent_state::get_json(
                        env.state,
                        ENTRY_STATE_BUCKET,
                        &entry_state_key(&abs),
                    )?;
                    let actual = ActualStateEntry::new(env.target_system, &abs)?.entry_state()?;
                    pre_apply(dir, &EntryState::remove(), last.as_ref(), &actual)?;
                }
                continue;
            }
            match env.target_system.remove(&abs) {
                Ok(()) => {
                    tracing::info!("{dir}");
                    persistent_state::set_json(
                        env.state,
                        ENTRY_STATE_BUCKET,
                        &entry_state_key(&abs),
                        &EntryState::remove(),
                    )?;
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::NotFound | io::ErrorKind::DirectoryNotEmpty
                    ) =>
                {
                    tracing::debug!("{dir}: not removed: {e}");
                }
                Err(e) => return Err(e).with_context(|| format!("remove {}", abs.display())),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::entry_type_set::EntryTypeSet;
    use crate::persistent_state::InMemoryState;
    use crate::source_state::ReadOptions;
    use crate::system::RealSystem;
    use pretty_assertions::assert_eq;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn env<'a>(
        system: &'a Arc<dyn System>,
        state: &'a dyn PersistentState,
        dest: &'a Path,
    ) -> ApplyEnv<'a> {
        ApplyEnv {
            target_system: system,
            dest_system: system,
            state,
            target_dir: dest,
            filter: EntryTypeFilter::new(EntryTypeSet::ALL, EntryTypeSet::NONE),
            umask: 0o022,
            parallel: false,
            pre_apply: None,
        }
    }

    #[test]
    fn select_expands_prefixes_and_rejects_unknown_paths() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        write(src.path(), "dot_a", "a");
        write(src.path(), "dot_config/b", "b");
        write(src.path(), "dot_config/c", "c");
        let state = SourceState::read(&ReadOptions::new(src.path(), dest.path())).unwrap();

        let selected = state.select(&[RelPath::new(".config")]).unwrap();
        assert_eq!(
            selected,
            vec![
                RelPath::new(".config"),
                RelPath::new(".config/b"),
                RelPath::new(".config/c"),
            ]
        );
        let err = state.select(&[RelPath::new(".nope")]).unwrap_err();
        assert_eq!(err.to_string(), ".nope: not managed");
    }

    #[test]
    fn apply_records_entry_state() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        write(src.path(), "dot_a", "a");
        let source_state = SourceState::read(&ReadOptions::new(src.path(), dest.path())).unwrap();
        let system: Arc<dyn System> = Arc::new(RealSystem::new());
        let state = InMemoryState::new();

        let changed = source_state
            .apply_all(&env(&system, &state, dest.path()), &[])
            .unwrap();

        assert_eq!(changed, vec![RelPath::new(".a")]);
        let key = entry_state_key(&dest.path().join(".a"));
        let recorded: Option<EntryState> =
            persistent_state::get_json(&state, ENTRY_STATE_BUCKET, &key).unwrap();
        assert!(recorded.is_some());
        assert_eq!(std::fs::read_to_string(dest.path().join(".a")).unwrap(), "a");
    }

    #[test]
    fn pre_apply_break_skips_the_write() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        write(src.path(), "dot_a", "a");
        let source_state = SourceState::read(&ReadOptions::new(src.path(), dest.path())).unwrap();
        let system: Arc<dyn System> = Arc::new(RealSystem::new());
        let state = InMemoryState::new();
        let seen = Mutex::new(Vec::new());
        let skip = |target: &RelPath,
                    _: &EntryState,
                    last: Option<&EntryState>,
                    _: &EntryState|
         -> Result<ControlFlow<()>> {
            assert!(last.is_none());
            seen.lock().unwrap().push(target.clone());
            Ok(ControlFlow::Break(()))
        };
        let pre_apply: &PreApplyFn<'_> = &skip;
        let env = ApplyEnv {
            pre_apply: Some(pre_apply),
            ..env(&system, &state, dest.path())
        };

        let changed = source_state.apply_all(&env, &[]).unwrap();

        assert!(changed.is_empty());
        assert_eq!(*seen.lock().unwrap(), vec![RelPath::new(".a")]);
        assert!(!dest.path().join(".a").exists());
    }

    #[test]
    fn unknown_target_is_not_managed() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let source_state = SourceState::read(&ReadOptions::new(src.path(), dest.path())).unwrap();
        let system: Arc<dyn System> = Arc::new(RealSystem::new());
        let state = InMemoryState::new();

        let err = source_state
            .apply(&env(&system, &state, dest.path()), &RelPath::new(".x"))
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ApplyError>(),
            Some(ApplyError::NotManaged { .. })
        ));
    }

    #[test]
    fn emptied_remove_dir_is_deleted_after_its_children() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        write(src.path(), "remove_dot_old/remove_a", "");
        write(dest.path(), ".old/a", "stale");
        let source_state = SourceState::read(&ReadOptions::new(src.path(), dest.path())).unwrap();
        let system: Arc<dyn System> = Arc::new(RealSystem::new());
        let state = InMemoryState::new();

        source_state
            .apply_all(&env(&system, &state, dest.path()), &[])
            .unwrap();

        assert!(!dest.path().join(".old").exists());
    }

    #[test]
    fn remove_dir_with_unmanaged_children_is_kept() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        write(src.path(), "remove_dot_old/remove_a", "");
        write(dest.path(), ".old/a", "stale");
        write(dest.path(), ".old/mine", "keep");
        let source_state = SourceState::read(&ReadOptions::new(src.path(), dest.path())).unwrap();
        let system: Arc<dyn System> = Arc::new(RealSystem::new());
        let state = InMemoryState::new();

        source_state
            .apply_all(&env(&system, &state, dest.path()), &[])
            .unwrap();

        assert!(!dest.path().join(".old/a").exists());
        assert_eq!(
            std::fs::read_to_string(dest.path().join(".old/mine")).unwrap(),
            "keep"
        );
    }

    #[test]
    fn pre_apply_hook_sees_empty_remove_dir_instead_of_removing_it() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("remove_dot_old")).unwrap();
        std::fs::create_dir(dest.path().join(".old")).unwrap();
        let source_state = SourceState::read(&ReadOptions::new(src.path(), dest.path())).unwrap();
        let system: Arc<dyn System> = Arc::new(RealSystem::new());
        let state = InMemoryState::new();
        let seen = Mutex::new(Vec::new());
        let record = |target: &RelPath,
                      wanted: &EntryState,
                      _: Option<&EntryState>,
                      _: &EntryState|
         -> Result<ControlFlow<()>> {
            seen.lock()
                .unwrap()
                .push((target.clone(), wanted.entry_type));
            Ok(ControlFlow::Break(()))
        };
        let pre_apply: &PreApplyFn<'_> = &record;
        let env = ApplyEnv {
            pre_apply: Some(pre_apply),
            ..env(&system, &state, dest.path())
        };

        source_state.apply_all(&env, &[]).unwrap();

        assert!(dest.path().join(".old").is_dir());
        let seen = seen.into_inner().unwrap();
        assert_eq!(
            seen.last(),
            Some(&(RelPath::new(".old"), EntryState::remove().entry_type))
        );
    }

    #[test]
    fn filter_excludes_entry_types() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        write(src.path(), "dot_a", "a");
        write(src.path(), "dot_dir/dot_keep", "");
        let source_state = SourceState::read(&ReadOptions::new(src.path(), dest.path())).unwrap();
        let system: Arc<dyn System> = Arc::new(RealSystem::new());
        let state = InMemoryState::new();
        let env = ApplyEnv {
            filter: EntryTypeFilter::new(EntryTypeSet::ALL, EntryTypeSet::FILES),
            ..env(&system, &state, dest.path())
        };

        let changed = source_state.apply_all(&env, &[]).unwrap();

        assert_eq!(changed, vec![RelPath::new(".dir")]);
        assert!(dest.path().join(".dir").is_dir());
        assert!(!dest.path().join(".a").exists());
    }
}
