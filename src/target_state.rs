//! Desired end state of one destination path.
//!
//! A [`TargetStateEntry`] is produced by a source entry for a particular
//! destination. Contents and link targets stay lazy, so templating and
//! decryption only happen when a comparison or write actually needs them.
use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::actual_state::{ActualStateEntry, normalize_linkname};
use crate::attr::ScriptCondition;
use crate::digest::hex;
use crate::entry_state::EntryState;
use crate::entry_type_set::{EntryTypeSet, SourceAttr};
use crate::lazy::{LazyContents, LazyLinkname};
use crate::persistent_state::{
    self, ENTRY_STATE_BUCKET, GIT_REPO_EXTERNAL_STATE_BUCKET, PersistentState,
    SCRIPT_STATE_BUCKET,
};
use crate::relpath::RelPath;
use crate::system::{Cmd, Interpreter, System};

/// Record written to `scriptState` after a script runs, keyed by the hex
/// digest of its contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptState {
    /// Script name.
    pub name: String,
    /// When the script was run.
    #[serde(rename = "runAt")]
    pub run_at: DateTime<Utc>,
}

/// Record written to `gitRepoExternalState` after a directory command runs,
/// keyed by the absolute destination path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyDirWithCmdState {
    /// Destination path.
    pub name: String,
    /// When the command was run.
    #[serde(rename = "runAt")]
    pub run_at: DateTime<Utc>,
}

/// The desired state of a destination path.
#[derive(Debug)]
pub enum TargetStateEntry {
    /// Nothing should exist.
    Remove,
    /// A directory. Children are handled by their own entries.
    Dir {
        /// Permission bits, umask already applied.
        perm: u32,
        /// Source classification.
        source_attr: SourceAttr,
    },
    /// A regular file.
    File {
        /// Permission bits, umask already applied.
        perm: u32,
        /// Lazily produced contents.
        contents: LazyContents,
        /// Keep the file even if its contents are blank.
        empty: bool,
        /// Contents were computed from the current destination contents.
        overwrite: bool,
        /// Source classification.
        source_attr: SourceAttr,
    },
    /// A symbolic link.
    Symlink {
        /// Lazily produced link target; blank means remove.
        linkname: LazyLinkname,
        /// Source classification.
        source_attr: SourceAttr,
    },
    /// A script to run.
    Script {
        /// Script name, the target-relative path.
        name: RelPath,
        /// When the script runs.
        condition: ScriptCondition,
        /// Lazily produced script body.
        contents: LazyContents,
        /// Interpreter chosen from the script's extension.
        interpreter: Option<Interpreter>,
        /// Source classification.
        source_attr: SourceAttr,
    },
    /// A directory maintained by an external command, e.g. `git pull`.
    ModifyDirWithCommand {
        /// Permission bits recorded for the directory.
        perm: u32,
        /// Command to run.
        cmd: Cmd,
        /// Minimum time between runs; `None` runs only once.
        refresh_period: Option<Duration>,
        /// Run regardless of previous runs.
        force: bool,
        /// Source classification.
        source_attr: SourceAttr,
    },
}

/// Blank contents mean "no file" unless `empty_` is set.
fn is_blank(data: &[u8]) -> bool {
    data.iter().all(u8::is_ascii_whitespace)
}

impl TargetStateEntry {
    /// Structural entry type bit used by include/exclude filters.
    #[must_use]
    pub const fn kind(&self) -> EntryTypeSet {
        match self {
            Self::Remove => EntryTypeSet::REMOVE,
            Self::Dir { .. } | Self::ModifyDirWithCommand { .. } => EntryTypeSet::DIRS,
            Self::File { .. } => EntryTypeSet::FILES,
            Self::Symlink { .. } => EntryTypeSet::SYMLINKS,
            Self::Script { .. } => EntryTypeSet::SCRIPTS,
        }
    }

    /// Source classification used by include/exclude filters.
    #[must_use]
    pub const fn source_attr(&self) -> SourceAttr {
        match self {
            Self::Remove => SourceAttr {
                encrypted: false,
                external: false,
                template: false,
                always: false,
            },
            Self::Dir { source_attr, .. }
            | Self::File { source_attr, .. }
            | Self::Symlink { source_attr, .. }
            | Self::Script { source_attr, .. }
            | Self::ModifyDirWithCommand { source_attr, .. } => *source_attr,
        }
    }

    /// Whether this is a script.
    #[must_use]
    pub const fn is_script(&self) -> bool {
        matches!(self, Self::Script { .. })
    }

    /// Force evaluation of lazy contents so errors surface early.
    ///
    /// # Errors
    ///
    /// Returns the template, decryption or read error.
    pub fn evaluate(&self) -> Result<()> {
        match self {
            Self::File { contents, .. } | Self::Script { contents, .. } => {
                contents.sha256().map(|_| ())
            }
            Self::Symlink { linkname, .. } => linkname.sha256().map(|_| ()),
            Self::Remove | Self::Dir { .. } | Self::ModifyDirWithCommand { .. } => Ok(()),
        }
    }

    /// The entry state this target would leave behind.
    ///
    /// # Errors
    ///
    /// Returns the evaluation error of lazy contents.
    pub fn entry_state(&self, umask: u32) -> Result<EntryState> {
        Ok(match self {
            Self::Remove => EntryState::remove(),
            Self::Dir { perm, .. } => EntryState::dir(perm & !umask),
            Self::ModifyDirWithCommand { perm, .. } => EntryState::dir(perm & !umask),
            Self::File {
                perm,
                contents,
                empty,
                overwrite,
                ..
            } => {
                let data = contents.contents()?;
                if !*empty && is_blank(data) {
                    return Ok(EntryState::remove());
                }
                let mut state =
                    EntryState::file(perm & !umask, &contents.sha256()?, Some(data.to_vec()));
                state.overwrite = *overwrite;
                state
            }
            Self::Symlink { linkname, .. } => {
                let target = linkname.linkname()?;
                if target.is_empty() {
                    return Ok(EntryState::remove());
                }
                EntryState::symlink(&linkname.sha256()?, target)
            }
            Self::Script { contents, .. } => EntryState::script(&contents.sha256()?, None),
        })
    }

    /// Whether previous runs recorded in `state` mean there is nothing to do.
    ///
    /// Only scripts and directory commands are ever skipped: blank scripts
    /// always, `once` scripts whose contents have run before, `onchange`
    /// scripts whose contents match the last run at `abs_path`, and directory
    /// commands still within their refresh period.
    ///
    /// # Errors
    ///
    /// Returns evaluation or persistent state errors.
    pub fn skip_apply(&self, state: &dyn PersistentState, abs_path: &Path) -> Result<bool> {
        match self {
            Self::Script {
                condition,
                contents,
                ..
            } => {
                if contents.contents()?.is_empty() {
                    return Ok(true);
                }
                match condition {
                    ScriptCondition::Once => {
                        let key = hex(&contents.sha256()?);
                        Ok(state.get(SCRIPT_STATE_BUCKET, &key)?.is_some())
                    }
                    ScriptCondition::OnChange => {
                        let last: Option<EntryState> = persistent_state::get_json(
                            state,
                            ENTRY_STATE_BUCKET,
                            &abs_path.to_string_lossy(),
                        )?;
                        let sha = hex(&contents.sha256()?);
                        Ok(last.is_some_and(|last| last.contents_sha256 == sha))
                    }
                    ScriptCondition::Always | ScriptCondition::None => Ok(false),
                }
            }
            Self::ModifyDirWithCommand {
                refresh_period,
                force,
                ..
            } => {
                if *force {
                    return Ok(false);
                }
                let last: Option<ModifyDirWithCmdState> = persistent_state::get_json(
                    state,
                    GIT_REPO_EXTERNAL_STATE_BUCKET,
                    &abs_path.to_string_lossy(),
                )?;
                Ok(match (last, refresh_period) {
                    (None, _) => false,
                    (Some(_), None) => true,
                    (Some(last), Some(period)) => {
                        let elapsed = Utc::now().signed_duration_since(last.run_at);
                        elapsed.to_std().is_ok_and(|elapsed| elapsed < *period)
                    }
                })
            }
            Self::Remove | Self::Dir { .. } | Self::File { .. } | Self::Symlink { .. } => {
                Ok(false)
            }
        }
    }

    /// Make `actual` match this target through `system`.
    ///
    /// Returns whether anything was changed. Scripts and directory commands
    /// record their own run markers in `state`.
    ///
    /// # Errors
    ///
    /// Returns evaluation, I/O, subprocess or persistent state errors.
    pub fn apply(
        &self,
        system: &dyn System,
        state: &dyn PersistentState,
        actual: &ActualStateEntry,
    ) -> Result<bool> {
        let path = actual.path();
        match self {
            Self::Remove => {
                if actual.is_absent() {
                    return Ok(false);
                }
                actual.remove(system)?;
                Ok(true)
            }
            Self::Dir { perm, .. } => {
                if let ActualStateEntry::Dir {
                    perm: actual_perm, ..
                } = actual
                {
                    if cfg!(windows) || actual_perm == perm {
                        return Ok(false);
                    }
                    system
                        .chmod(path, *perm)
                        .with_context(|| format!("chmod {}", path.display()))?;
                    return Ok(true);
                }
                actual.remove(system)?;
                system
                    .mkdir(path, *perm)
                    .with_context(|| format!("mkdir {}", path.display()))?;
                Ok(true)
            }
            Self::File {
                perm,
                contents,
                empty,
                ..
            } => {
                let data = contents.contents()?;
                if !*empty && is_blank(data) {
                    if actual.is_absent() {
                        return Ok(false);
                    }
                    actual.remove(system)?;
                    return Ok(true);
                }
                if let ActualStateEntry::File {
                    perm: actual_perm,
                    contents: actual_contents,
                    ..
                } = actual
                {
                    if actual_contents.sha256()? == contents.sha256()? {
                        if cfg!(windows) || actual_perm == perm {
                            return Ok(false);
                        }
                        system
                            .chmod(path, *perm)
                            .with_context(|| format!("chmod {}", path.display()))?;
                        return Ok(true);
                    }
                } else {
                    actual.remove(system)?;
                }
                system
                    .write_file(path, data, *perm)
                    .with_context(|| format!("write {}", path.display()))?;
                Ok(true)
            }
            Self::Symlink { linkname, .. } => {
                let target = linkname.linkname()?;
                if target.is_empty() {
                    if actual.is_absent() {
                        return Ok(false);
                    }
                    actual.remove(system)?;
                    return Ok(true);
                }
                if let ActualStateEntry::Symlink {
                    linkname: actual_linkname,
                    ..
                } = actual
                    && normalize_linkname(actual_linkname.linkname()?)
                        == normalize_linkname(target)
                {
                    return Ok(false);
                }
                actual.remove(system)?;
                system
                    .write_symlink(target, path)
                    .with_context(|| format!("symlink {}", path.display()))?;
                Ok(true)
            }
            Self::Script {
                name,
                condition,
                contents,
                interpreter,
                ..
            } => {
                if self.skip_apply(state, path)? {
                    return Ok(false);
                }
                let sha = contents.sha256()?;
                let run_at = Utc::now();
                let data = contents.contents()?;
                if !is_blank(data) {
                    let dir = path.parent().unwrap_or(path);
                    system
                        .run_script(name, dir, data, interpreter.as_ref())
                        .with_context(|| format!("run {name}"))?;
                }
                if *condition == ScriptCondition::Once {
                    persistent_state::set_json(
                        state,
                        SCRIPT_STATE_BUCKET,
                        &hex(&sha),
                        &ScriptState {
                            name: name.to_string(),
                            run_at,
                        },
                    )?;
                }
                Ok(true)
            }
            Self::ModifyDirWithCommand { cmd, .. } => {
                if !matches!(actual, ActualStateEntry::Dir { .. }) {
                    actual.remove(system)?;
                }
                let run_at = Utc::now();
                system
                    .run_cmd(cmd)
                    .with_context(|| format!("{}: {cmd}", path.display()))?;
                let key = path.to_string_lossy();
                persistent_state::set_json(
                    state,
                    GIT_REPO_EXTERNAL_STATE_BUCKET,
                    &key,
                    &ModifyDirWithCmdState {
                        name: key.to_string(),
                        run_at,
                    },
                )?;
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::digest::sha256_hex;
    use crate::entry_state::EntryStateType;
    use crate::persistent_state::InMemoryState;
    use crate::system::{DumpEntry, DumpSystem, RealSystem};

    fn real() -> Arc<dyn System> {
        Arc::new(RealSystem::new())
    }

    fn file(perm: u32, contents: &str) -> TargetStateEntry {
        TargetStateEntry::File {
            perm,
            contents: LazyContents::ready(contents.as_bytes().to_vec()),
            empty: false,
            overwrite: false,
            source_attr: SourceAttr::default(),
        }
    }

    fn script(condition: ScriptCondition, body: &str) -> TargetStateEntry {
        TargetStateEntry::Script {
            name: RelPath::new("setup.sh"),
            condition,
            contents: LazyContents::ready(body.as_bytes().to_vec()),
            interpreter: None,
            source_attr: SourceAttr::default(),
        }
    }

    // -----------------------------------------------------------------------
    // entry_state
    // -----------------------------------------------------------------------

    #[test]
    fn file_entry_state_masks_umask() {
        let state = file(0o666, "x").entry_state(0o022).unwrap();
        assert_eq!(state.entry_type, EntryStateType::File);
        assert_eq!(state.mode, 0o644);
        assert_eq!(state.contents_sha256, sha256_hex(b"x"));
    }

    #[test]
    fn blank_file_without_empty_is_remove() {
        let state = file(0o644, " \n").entry_state(0).unwrap();
        assert_eq!(state.entry_type, EntryStateType::Remove);
    }

    #[test]
    fn blank_symlink_is_remove() {
        let target = TargetStateEntry::Symlink {
            linkname: LazyLinkname::ready(String::new()),
            source_attr: SourceAttr::default(),
        };
        assert_eq!(
            target.entry_state(0).unwrap().entry_type,
            EntryStateType::Remove
        );
    }

    #[test]
    fn lazy_error_surfaces_from_evaluate() {
        let target = TargetStateEntry::File {
            perm: 0o644,
            contents: LazyContents::new(|| Err(anyhow::anyhow!("bad template"))),
            empty: false,
            overwrite: false,
            source_attr: SourceAttr::default(),
        };
        assert!(target.evaluate().unwrap_err().to_string().contains("bad template"));
    }

    // -----------------------------------------------------------------------
    // skip_apply
    // -----------------------------------------------------------------------

    #[test]
    fn once_script_skips_after_marker() {
        let state = InMemoryState::new();
        let target = script(ScriptCondition::Once, "echo hi");
        let path = Path::new("/home/u/setup.sh");
        assert!(!target.skip_apply(&state, path).unwrap());
        let key = sha256_hex(b"echo hi");
        persistent_state::set_json(
            &state,
            SCRIPT_STATE_BUCKET,
            &key,
            &ScriptState {
                name: "setup.sh".to_string(),
                run_at: Utc::now(),
            },
        )
        .unwrap();
        assert!(target.skip_apply(&state, path).unwrap());
    }

    #[test]
    fn onchange_script_compares_last_entry_state() {
        let state = InMemoryState::new();
        let target = script(ScriptCondition::OnChange, "echo one");
        let path = Path::new("/home/u/setup.sh");
        let recorded = EntryState::script(&crate::digest::sha256_sum(b"echo one"), None);
        persistent_state::set_json(&state, ENTRY_STATE_BUCKET, "/home/u/setup.sh", &recorded)
            .unwrap();
        assert!(target.skip_apply(&state, path).unwrap());
        let changed = script(ScriptCondition::OnChange, "echo two");
        assert!(!changed.skip_apply(&state, path).unwrap());
    }

    #[test]
    fn empty_script_is_always_skipped() {
        let state = InMemoryState::new();
        let target = script(ScriptCondition::Always, "");
        assert!(target.skip_apply(&state, Path::new("/x")).unwrap());
    }

    #[test]
    fn dir_command_honours_refresh_period() {
        let state = InMemoryState::new();
        let path = Path::new("/home/u/.oh-my-zsh");
        let target = |refresh_period, force| TargetStateEntry::ModifyDirWithCommand {
            perm: 0o755,
            cmd: Cmd {
                program: "git".to_string(),
                args: vec!["pull".to_string()],
                dir: path.to_path_buf(),
            },
            refresh_period,
            force,
            source_attr: SourceAttr::default(),
        };
        assert!(!target(None, false).skip_apply(&state, path).unwrap());
        persistent_state::set_json(
            &state,
            GIT_REPO_EXTERNAL_STATE_BUCKET,
            &path.to_string_lossy(),
            &ModifyDirWithCmdState {
                name: path.to_string_lossy().to_string(),
                run_at: Utc::now() - chrono::Duration::hours(2),
            },
        )
        .unwrap();
        assert!(target(None, false).skip_apply(&state, path).unwrap());
        assert!(
            target(Some(Duration::from_secs(3 * 3600)), false)
                .skip_apply(&state, path)
                .unwrap()
        );
        assert!(
            !target(Some(Duration::from_secs(3600)), false)
                .skip_apply(&state, path)
                .unwrap()
        );
        assert!(!target(None, true).skip_apply(&state, path).unwrap());
    }

    // -----------------------------------------------------------------------
    // apply
    // -----------------------------------------------------------------------

    #[cfg(unix)]
    #[test]
    fn file_apply_writes_then_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let system = real();
        let state = InMemoryState::new();
        let target = file(0o600, "hello");

        let actual = ActualStateEntry::new(&system, &path).unwrap();
        assert!(target.apply(system.as_ref(), &state, &actual).unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");

        let actual = ActualStateEntry::new(&system, &path).unwrap();
        assert!(!target.apply(system.as_ref(), &state, &actual).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn file_apply_only_chmods_when_contents_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        crate::system::write_atomic(&path, b"same", 0o644).unwrap();
        let system = real();
        let actual = ActualStateEntry::new(&system, &path).unwrap();
        assert!(
            file(0o600, "same")
                .apply(system.as_ref(), &InMemoryState::new(), &actual)
                .unwrap()
        );
        let after = ActualStateEntry::new(&system, &path).unwrap();
        assert_eq!(after.entry_state().unwrap().mode, 0o600);
    }

    #[test]
    fn file_replaces_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x");
        std::fs::create_dir_all(path.join("child")).unwrap();
        let system = real();
        let actual = ActualStateEntry::new(&system, &path).unwrap();
        file(0o644, "now a file")
            .apply(system.as_ref(), &InMemoryState::new(), &actual)
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"now a file");
    }

    #[cfg(unix)]
    #[test]
    fn symlink_apply_replaces_wrong_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("l");
        std::os::unix::fs::symlink("old", &path).unwrap();
        let system = real();
        let target = TargetStateEntry::Symlink {
            linkname: LazyLinkname::ready("new".to_string()),
            source_attr: SourceAttr::default(),
        };
        let actual = ActualStateEntry::new(&system, &path).unwrap();
        assert!(target.apply(system.as_ref(), &InMemoryState::new(), &actual).unwrap());
        assert_eq!(std::fs::read_link(&path).unwrap(), Path::new("new"));
        let actual = ActualStateEntry::new(&system, &path).unwrap();
        assert!(!target.apply(system.as_ref(), &InMemoryState::new(), &actual).unwrap());
    }

    #[test]
    fn remove_apply_deletes_tree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone");
        std::fs::create_dir_all(path.join("a")).unwrap();
        let system = real();
        let actual = ActualStateEntry::new(&system, &path).unwrap();
        assert!(
            TargetStateEntry::Remove
                .apply(system.as_ref(), &InMemoryState::new(), &actual)
                .unwrap()
        );
        assert!(!path.exists());
        let actual = ActualStateEntry::new(&system, &path).unwrap();
        assert!(
            !TargetStateEntry::Remove
                .apply(system.as_ref(), &InMemoryState::new(), &actual)
                .unwrap()
        );
    }

    #[test]
    fn once_script_records_marker() {
        let root = Path::new("/home/u");
        let system: Arc<dyn System> = Arc::new(DumpSystem::new(root));
        let state = InMemoryState::new();
        let target = script(ScriptCondition::Once, "echo hi");
        let actual = ActualStateEntry::new(&system, &root.join("setup.sh")).unwrap();
        assert!(target.apply(system.as_ref(), &state, &actual).unwrap());
        assert!(
            state
                .get(SCRIPT_STATE_BUCKET, &sha256_hex(b"echo hi"))
                .unwrap()
                .is_some()
        );
        assert!(!target.apply(system.as_ref(), &state, &actual).unwrap());
    }

    #[test]
    fn dir_command_records_run_marker() {
        let root = Path::new("/home/u");
        let dump = Arc::new(DumpSystem::new(root));
        let system: Arc<dyn System> = dump.clone();
        let state = InMemoryState::new();
        let path = root.join(".vim").join("pack");
        let target = TargetStateEntry::ModifyDirWithCommand {
            perm: 0o755,
            cmd: Cmd {
                program: "git".to_string(),
                args: vec!["pull".to_string()],
                dir: path.clone(),
            },
            refresh_period: None,
            force: false,
            source_attr: SourceAttr::default(),
        };
        let actual = ActualStateEntry::new(&system, &path).unwrap();
        assert!(target.apply(system.as_ref(), &state, &actual).unwrap());
        assert_eq!(
            dump.data().get(".vim/pack"),
            Some(&DumpEntry::Command {
                path: "git".to_string(),
                args: vec!["pull".to_string()],
            })
        );
        assert!(target.skip_apply(&state, &path).unwrap());
    }
}
