//! The `dotstate.toml` configuration file and default locations.
pub mod toml_loader;

use anyhow::{Context as _, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::encryption::EncryptionConfig;
use crate::persistent_state::Backend;
use crate::source_state::RefreshExternals;
use crate::system::Interpreter;

/// Everything `dotstate.toml` can set. Command-line flags take precedence.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Source directory; defaults to `$XDG_DATA_HOME/dotstate`.
    pub source_dir: Option<PathBuf>,
    /// Destination directory; defaults to the home directory.
    pub dest_dir: Option<PathBuf>,
    /// Octal umask applied to every permission.
    pub umask: String,
    /// Where and how last written states are kept.
    pub persistent_state: PersistentStateConfig,
    /// Cache policy for externals.
    pub refresh_externals: RefreshExternals,
    /// Script interpreters by file extension, without the dot.
    pub interpreters: BTreeMap<String, Interpreter>,
    /// Tool used for `encrypted_` entries.
    pub encryption: EncryptionConfig,
    /// Template data that overrides the source directory's data files.
    pub data: serde_json::Value,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_dir: None,
            dest_dir: None,
            umask: "022".to_string(),
            persistent_state: PersistentStateConfig::default(),
            refresh_externals: RefreshExternals::default(),
            interpreters: BTreeMap::new(),
            encryption: EncryptionConfig::default(),
            data: serde_json::Value::Null,
        }
    }
}

/// `[persistent_state]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PersistentStateConfig {
    /// Storage backend.
    pub backend: Backend,
    /// State file; defaults to the backend's file name in the config directory.
    pub path: Option<PathBuf>,
    /// How long to wait for another instance to release the state file.
    pub lock_timeout_secs: u64,
}

impl Default for PersistentStateConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            path: None,
            lock_timeout_secs: 1,
        }
    }
}

impl PersistentStateConfig {
    /// Lock timeout as a [`Duration`].
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

impl Config {
    /// Load `path`, or defaults if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if `umask`
    /// is not an octal number.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = toml_loader::load_config(path)?;
        config
            .umask()
            .with_context(|| format!("loading {}", path.display()))?;
        Ok(config)
    }

    /// Parsed umask.
    ///
    /// # Errors
    ///
    /// Returns an error if `umask` is not an octal number up to `777`.
    pub fn umask(&self) -> Result<u32> {
        let umask = u32::from_str_radix(self.umask.trim(), 8)
            .with_context(|| format!("invalid umask {:?}", self.umask))?;
        anyhow::ensure!(umask <= 0o777, "invalid umask {:?}", self.umask);
        Ok(umask)
    }
}

/// The home directory, or `.` when it cannot be determined.
#[must_use]
pub fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// `$<var>/dotstate`, else the platform directory, else `~/<fallback>`.
fn app_dir(var: &str, platform: fn() -> Option<PathBuf>, fallback: &str) -> PathBuf {
    std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(platform)
        .unwrap_or_else(|| home_dir().join(fallback))
        .join("dotstate")
}

/// `$XDG_CONFIG_HOME/dotstate`.
#[must_use]
pub fn config_dir() -> PathBuf {
    app_dir("XDG_CONFIG_HOME", dirs::config_dir, ".config")
}

/// `$XDG_DATA_HOME/dotstate`, the default source directory.
#[must_use]
pub fn data_dir() -> PathBuf {
    app_dir("XDG_DATA_HOME", dirs::data_dir, ".local/share")
}

/// `$XDG_CACHE_HOME/dotstate`, where logs go.
#[must_use]
pub fn cache_dir() -> PathBuf {
    app_dir("XDG_CACHE_HOME", dirs::cache_dir, ".cache")
}

/// Default config file.
#[must_use]
pub fn default_config_path() -> PathBuf {
    config_dir().join("dotstate.toml")
}
