//! Subcommand implementations.
//!
//! Each command takes a [`CommandSetup`] and writes its output to a caller
//! supplied writer, so the binary passes stdout and tests pass a buffer.
pub mod apply;
pub mod archive;
pub mod completion;
pub mod dump;
pub mod managed;
pub mod state;
pub mod status;
pub mod version;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::cli::GlobalOpts;
use crate::config::{self, Config};
use crate::digest::sha256_hex;
use crate::encryption;
use crate::entry_type_set::EntryTypeFilter;
use crate::persistent_state::{
    self, CONFIG_STATE_BUCKET, InMemoryState, OpenMode, PersistentState,
};
use crate::relpath::RelPath;
use crate::source_state::{
    ApplyEnv, Fetcher, HttpFetcher, ReadOptions, RefreshExternals, SourceState,
};
use crate::system::System;

const CONFIG_STATE_KEY: &str = "configState";

/// Fingerprint of the config file the last apply ran with.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
struct ConfigState {
    #[serde(rename = "configContentsSHA256")]
    config_contents_sha256: String,
}

/// Settings resolved from the config file and the command line.
pub struct CommandSetup {
    /// Loaded config file.
    pub config: Config,
    /// Where `config` was loaded from; it need not exist.
    pub config_path: PathBuf,
    /// Absolute source directory.
    pub source_dir: PathBuf,
    /// Absolute destination directory.
    pub dest_dir: PathBuf,
    /// Persistent state file.
    pub state_path: PathBuf,
    /// Bits cleared from every permission.
    pub umask: u32,
    /// Entry types to operate on.
    pub filter: EntryTypeFilter,
    /// Walk sibling subtrees concurrently.
    pub parallel: bool,
    /// Leave the destination and the persistent state untouched.
    pub dry_run: bool,
    /// Cache policy for externals.
    pub refresh_externals: RefreshExternals,
    /// Downloads externals.
    pub fetcher: Arc<dyn Fetcher>,
}

impl fmt::Debug for CommandSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSetup")
            .field("config_path", &self.config_path)
            .field("source_dir", &self.source_dir)
            .field("dest_dir", &self.dest_dir)
            .field("state_path", &self.state_path)
            .field("umask", &format_args!("{:03o}", self.umask))
            .field("filter", &self.filter)
            .field("parallel", &self.parallel)
            .field("dry_run", &self.dry_run)
            .field("refresh_externals", &self.refresh_externals)
            .field("fetcher", &"<dyn Fetcher>")
            .finish_non_exhaustive()
    }
}

/// `path` made absolute against the current directory.
fn absolute(path: &Path) -> Result<PathBuf> {
    let abs = std::path::absolute(path)
        .with_context(|| format!("resolving {}", path.display()))?;
    Ok(dunce::simplified(&abs).to_path_buf())
}

impl CommandSetup {
    /// Load the config file and apply command-line overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be loaded or a directory
    /// cannot be resolved.
    pub fn init(global: &GlobalOpts) -> Result<Self> {
        let config_path = global
            .config
            .clone()
            .unwrap_or_else(config::default_config_path);
        let config = Config::load(&config_path)?;
        tracing::debug!("config: {}", config_path.display());

        let source_dir = absolute(
            &global
                .source
                .clone()
                .or_else(|| config.source_dir.clone())
                .unwrap_or_else(config::data_dir),
        )?;
        let dest_dir = absolute(
            &global
                .destination
                .clone()
                .or_else(|| config.dest_dir.clone())
                .unwrap_or_else(config::home_dir),
        )?;
        let state_path = absolute(
            &global
                .persistent_state
                .clone()
                .or_else(|| config.persistent_state.path.clone())
                .unwrap_or_else(|| {
                    config::config_dir().join(config.persistent_state.backend.default_file_name())
                }),
        )?;
        tracing::debug!("source: {}", source_dir.display());
        tracing::debug!("destination: {}", dest_dir.display());
        tracing::debug!("persistent state: {}", state_path.display());

        Ok(Self {
            umask: config.umask()?,
            filter: EntryTypeFilter::new(global.include, global.exclude),
            parallel: global.parallel,
            dry_run: global.dry_run,
            refresh_externals: global.refresh_externals.unwrap_or(config.refresh_externals),
            fetcher: Arc::new(HttpFetcher),
            config,
            config_path,
            source_dir,
            dest_dir,
            state_path,
        })
    }

    /// Replace the downloader.
    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Open the persistent state file.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Locked`](crate::error::StateError::Locked) if
    /// another instance holds the lock, or any backend error.
    pub fn open_state(&self, mode: OpenMode) -> Result<Arc<dyn PersistentState>> {
        let backend = self.config.persistent_state.backend;
        persistent_state::open(
            backend,
            &self.state_path,
            mode,
            self.config.persistent_state.lock_timeout(),
        )
        .with_context(|| format!("opening {}", self.state_path.display()))
    }

    /// An in-memory copy of the persistent state. Writes to it are
    /// discarded, which is what commands that only look use.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file cannot be read.
    pub fn scratch_state(&self) -> Result<Arc<dyn PersistentState>> {
        let on_disk = self.open_state(OpenMode::ReadOnly)?;
        let scratch = InMemoryState::new();
        on_disk.copy_to(&scratch)?;
        on_disk.close()?;
        Ok(Arc::new(scratch))
    }

    /// Options for reading the source directory.
    #[must_use]
    pub fn read_options(
        &self,
        state: Arc<dyn PersistentState>,
        dest_system: Arc<dyn System>,
    ) -> ReadOptions {
        ReadOptions::new(&self.source_dir, &self.dest_dir)
            .with_umask(self.umask)
            .with_encryption(Arc::from(encryption::from_config(&self.config.encryption)))
            .with_interpreters(self.config.interpreters.clone())
            .with_refresh_externals(self.refresh_externals)
            .with_fetcher(Arc::clone(&self.fetcher))
            .with_state(state)
            .with_dest_system(dest_system)
            .with_priority_data(self.config.data.clone())
    }

    /// Read the source directory.
    ///
    /// # Errors
    ///
    /// Returns any source state error.
    pub fn read_source_state(
        &self,
        state: Arc<dyn PersistentState>,
        dest_system: Arc<dyn System>,
    ) -> Result<SourceState> {
        SourceState::read(&self.read_options(state, dest_system))
            .with_context(|| format!("reading {}", self.source_dir.display()))
    }

    /// Target-relative paths for destination paths given on the command line.
    ///
    /// # Errors
    ///
    /// Returns an error for a path outside the destination directory.
    pub fn target_paths(&self, targets: &[PathBuf]) -> Result<Vec<RelPath>> {
        targets
            .iter()
            .map(|target| {
                let abs = absolute(target)?;
                let rel = abs.strip_prefix(&self.dest_dir).with_context(|| {
                    format!(
                        "{}: not in destination directory {}",
                        target.display(),
                        self.dest_dir.display()
                    )
                })?;
                Ok(RelPath::from_path(rel))
            })
            .collect()
    }

    /// Record the config file's digest in the `configState` bucket, or
    /// clear it when there is no config file.
    ///
    /// Returns whether a previously recorded digest differed, meaning
    /// templates may now render differently than at the last apply.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or the state
    /// cannot be written.
    pub fn record_config_state(&self, state: &dyn PersistentState) -> Result<bool> {
        let current = match std::fs::read(&self.config_path) {
            Ok(data) => Some(ConfigState {
                config_contents_sha256: sha256_hex(&data),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.config_path.display()));
            }
        };
        let previous: Option<ConfigState> =
            persistent_state::get_json(state, CONFIG_STATE_BUCKET, CONFIG_STATE_KEY)?;
        if previous == current {
            return Ok(false);
        }
        match &current {
            Some(current) => {
                persistent_state::set_json(state, CONFIG_STATE_BUCKET, CONFIG_STATE_KEY, current)?;
            }
            None => state.delete(CONFIG_STATE_BUCKET, CONFIG_STATE_KEY)?,
        }
        Ok(previous.is_some())
    }

    /// Apply environment writing through `target_system` into the
    /// destination directory.
    #[must_use]
    pub fn apply_env<'a>(
        &'a self,
        target_system: &'a Arc<dyn System>,
        dest_system: &'a Arc<dyn System>,
        state: &'a dyn PersistentState,
    ) -> ApplyEnv<'a> {
        ApplyEnv {
            target_system,
            dest_system,
            state,
            target_dir: &self.dest_dir,
            filter: self.filter,
            umask: self.umask,
            parallel: self.parallel,
            pre_apply: None,
        }
    }
}

/// Run the selected targets against `target_system` with a scratch state,
/// for commands that render the target state somewhere other than the
/// destination.
fn render_target_state(
    setup: &CommandSetup,
    target_system: &Arc<dyn System>,
    targets: &[PathBuf],
) -> Result<()> {
    let real: Arc<dyn System> = Arc::new(crate::system::RealSystem::new());
    let state = setup.scratch_state()?;
    let source_state = setup.read_source_state(Arc::clone(&state), Arc::clone(&real))?;
    let targets = setup.target_paths(targets)?;
    let env = setup.apply_env(target_system, &real, state.as_ref());
    source_state.apply_all(&env, &targets)?;
    Ok(())
}
