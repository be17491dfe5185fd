//! The source state: everything the source directory declares.
//!
//! [`SourceState::read`] scans the source directory once, resolves
//! externals and pattern files, and produces one [`SourceStateEntry`] per
//! target path. The result is read-only; [`SourceState::apply`] and
//! [`SourceState::apply_all`] reconcile the destination against it.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::encryption::{Encryption, NoEncryption};
use crate::persistent_state::{InMemoryState, PersistentState};
use crate::relpath::RelPath;
use crate::system::{Interpreter, RealSystem, System};
use crate::template::{BuiltinTemplateEngine, TemplateContext, TemplateEngine, merge_data};

mod apply;
pub mod data;
pub mod entry;
pub mod external;
pub mod pattern_set;
mod read;

pub use apply::{ApplyEnv, PreApplyFn};
pub use entry::{SourceStateEntry, TargetFn};
pub use external::{External, ExternalType, Fetcher, HttpFetcher, RefreshExternals};
pub use pattern_set::{PatternMatch, PatternSet};

/// Reserved prefix of special source names.
pub const PREFIX: &str = ".dotstate";
/// Template data files, `.dotstatedata.{json,toml,yaml}`, or a directory of them.
pub const DATA_NAME: &str = ".dotstatedata";
/// External manifests, `.dotstateexternal.{json,toml,yaml}[.tmpl]`.
pub const EXTERNAL_NAME: &str = ".dotstateexternal";
/// Directory of external manifests.
pub const EXTERNALS_DIR: &str = ".dotstateexternals";
/// Ignore patterns.
pub const IGNORE_NAME: &str = ".dotstateignore";
/// Remove patterns.
pub const REMOVE_NAME: &str = ".dotstateremove";
/// Scripts that do not create a directory in the destination.
pub const SCRIPTS_DIR: &str = ".dotstatescripts";
/// Named templates available to every template.
pub const TEMPLATES_DIR: &str = ".dotstatetemplates";
/// Minimum version required by the source directory.
pub const VERSION_NAME: &str = ".dotstateversion";

/// Inputs to [`SourceState::read`].
pub struct ReadOptions {
    /// Source directory.
    pub source_dir: PathBuf,
    /// Destination directory.
    pub dest_dir: PathBuf,
    /// Bits cleared from every permission.
    pub umask: u32,
    /// Decrypts `encrypted_` entries and encrypted externals.
    pub encryption: Arc<dyn Encryption>,
    /// Executes `.tmpl` entries.
    pub template_engine: Arc<dyn TemplateEngine>,
    /// Script interpreters by file extension, without the dot.
    pub interpreters: BTreeMap<String, Interpreter>,
    /// External cache policy.
    pub refresh_externals: RefreshExternals,
    /// Downloads externals.
    pub fetcher: Arc<dyn Fetcher>,
    /// Store holding the external cache.
    pub state: Arc<dyn PersistentState>,
    /// Reads the current destination for `create_`, `modify_` and exact directories.
    pub dest_system: Arc<dyn System>,
    /// Template data that overrides data files.
    pub priority_data: Value,
    /// Running version, compared against `.dotstateversion`.
    pub version: semver::Version,
    /// Time the read started.
    pub now: DateTime<Utc>,
}

impl fmt::Debug for ReadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadOptions")
            .field("source_dir", &self.source_dir)
            .field("dest_dir", &self.dest_dir)
            .field("umask", &format_args!("{:03o}", self.umask))
            .field("encryption", &self.encryption)
            .field("template_engine", &self.template_engine)
            .field("interpreters", &self.interpreters)
            .field("refresh_externals", &self.refresh_externals)
            .field("fetcher", &"<dyn Fetcher>")
            .field("state", &self.state)
            .field("dest_system", &self.dest_system)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Version of this build, used by the `.dotstateversion` check.
#[must_use]
pub fn crate_version() -> semver::Version {
    semver::Version::parse(env!("CARGO_PKG_VERSION"))
        .unwrap_or_else(|_| semver::Version::new(0, 0, 0))
}

impl ReadOptions {
    /// Options for reading `source_dir` into `dest_dir` with defaults: umask
    /// `022`, no encryption, the built-in template engine, HTTP downloads
    /// and an in-memory cache.
    #[must_use]
    pub fn new(source_dir: impl Into<PathBuf>, dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            dest_dir: dest_dir.into(),
            umask: 0o022,
            encryption: Arc::new(NoEncryption),
            template_engine: Arc::new(BuiltinTemplateEngine),
            interpreters: BTreeMap::new(),
            refresh_externals: RefreshExternals::Auto,
            fetcher: Arc::new(HttpFetcher),
            state: Arc::new(InMemoryState::new()),
            dest_system: Arc::new(RealSystem::new()),
            priority_data: Value::Null,
            version: crate_version(),
            now: Utc::now(),
        }
    }

    /// Set the umask.
    #[must_use]
    pub const fn with_umask(mut self, umask: u32) -> Self {
        self.umask = umask;
        self
    }

    /// Set the encryption tool.
    #[must_use]
    pub fn with_encryption(mut self, encryption: Arc<dyn Encryption>) -> Self {
        self.encryption = encryption;
        self
    }

    /// Set the template engine.
    #[must_use]
    pub fn with_template_engine(mut self, engine: Arc<dyn TemplateEngine>) -> Self {
        self.template_engine = engine;
        self
    }

    /// Set the interpreter map.
    #[must_use]
    pub fn with_interpreters(mut self, interpreters: BTreeMap<String, Interpreter>) -> Self {
        self.interpreters = interpreters;
        self
    }

    /// Set the external cache policy.
    #[must_use]
    pub const fn with_refresh_externals(mut self, refresh: RefreshExternals) -> Self {
        self.refresh_externals = refresh;
        self
    }

    /// Set the downloader.
    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Set the store holding the external cache.
    #[must_use]
    pub fn with_state(mut self, state: Arc<dyn PersistentState>) -> Self {
        self.state = state;
        self
    }

    /// Set the system used to inspect the destination.
    #[must_use]
    pub fn with_dest_system(mut self, system: Arc<dyn System>) -> Self {
        self.dest_system = system;
        self
    }

    /// Set template data that overrides data files.
    #[must_use]
    pub fn with_priority_data(mut self, data: Value) -> Self {
        self.priority_data = data;
        self
    }

    /// Pretend to be a different version.
    #[must_use]
    pub fn with_version(mut self, version: semver::Version) -> Self {
        self.version = version;
        self
    }

    /// Set the reference time for cache expiry.
    #[must_use]
    pub const fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }
}

/// Template execution with layered data.
///
/// Data is built-in defaults, then data files in read order, then priority
/// data. Named templates come from the templates directory.
pub struct Templater {
    engine: Arc<dyn TemplateEngine>,
    base: Value,
    priority: Value,
    dest_dir: PathBuf,
    data: RwLock<Value>,
    templates: RwLock<BTreeMap<String, String>>,
}

impl fmt::Debug for Templater {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Templater")
            .field("engine", &self.engine)
            .field("data", &self.data())
            .finish_non_exhaustive()
    }
}

impl Templater {
    fn new(opts: &ReadOptions) -> Self {
        let base = json!({
            "dotstate": {
                "sourceDir": opts.source_dir.to_string_lossy(),
                "destDir": opts.dest_dir.to_string_lossy(),
                "os": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
            }
        });
        Self {
            engine: Arc::clone(&opts.template_engine),
            base,
            priority: opts.priority_data.clone(),
            dest_dir: opts.dest_dir.clone(),
            data: RwLock::new(Value::Object(serde_json::Map::new())),
            templates: RwLock::new(BTreeMap::new()),
        }
    }

    fn merge(&self, data: Value) {
        let mut current = self.data.write().unwrap_or_else(PoisonError::into_inner);
        merge_data(&mut current, data);
    }

    fn add_templates(&self, templates: impl IntoIterator<Item = (String, String)>) {
        self.templates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(templates);
    }

    /// Effective template data without per-file keys.
    #[must_use]
    pub fn data(&self) -> Value {
        let mut data = self.base.clone();
        merge_data(
            &mut data,
            self.data
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        );
        if !self.priority.is_null() {
            merge_data(&mut data, self.priority.clone());
        }
        data
    }

    /// Execute `source`, named `name` in errors. When `target` is given,
    /// `dotstate.sourceFile` and `dotstate.targetFile` are set for it.
    ///
    /// # Errors
    ///
    /// Returns the template engine's error.
    pub fn execute(&self, name: &str, source: &[u8], target: Option<&RelPath>) -> Result<Vec<u8>> {
        let mut data = self.data();
        if let Some(target) = target {
            merge_data(
                &mut data,
                json!({
                    "dotstate": {
                        "sourceFile": name,
                        "targetFile": target.to_abs(&self.dest_dir).to_string_lossy(),
                    }
                }),
            );
        }
        let ctx = TemplateContext {
            data,
            templates: self
                .templates
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        };
        self.engine.execute(name, source, &ctx)
    }
}

/// The declared state of every managed target path.
#[derive(Debug)]
pub struct SourceState {
    source_dir: PathBuf,
    dest_dir: PathBuf,
    umask: u32,
    entries: BTreeMap<RelPath, SourceStateEntry>,
    remove_dirs: BTreeSet<RelPath>,
    ignore: PatternSet,
    templater: Arc<Templater>,
}

impl SourceState {
    /// Read the source directory named by `opts`.
    ///
    /// A missing source directory yields an empty state.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`](crate::error::SourceError)s for malformed
    /// entries, version skew and inconsistent targets, wrapped with the path
    /// being read, and fetch errors from externals.
    pub fn read(opts: &ReadOptions) -> Result<Self> {
        read::Reader::new(opts).read()
    }

    /// Source directory.
    #[must_use]
    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    /// Destination directory.
    #[must_use]
    pub fn dest_dir(&self) -> &Path {
        &self.dest_dir
    }

    /// Umask the state was read with.
    #[must_use]
    pub const fn umask(&self) -> u32 {
        self.umask
    }

    /// Every entry by target path.
    #[must_use]
    pub const fn entries(&self) -> &BTreeMap<RelPath, SourceStateEntry> {
        &self.entries
    }

    /// Entry for `target`, if managed.
    #[must_use]
    pub fn entry(&self, target: &RelPath) -> Option<&SourceStateEntry> {
        self.entries.get(target)
    }

    /// Whether `target` or one of its ancestors matches an ignore pattern.
    #[must_use]
    pub fn is_ignored(&self, target: &RelPath) -> bool {
        is_ignored(&self.ignore, target)
    }

    /// Directories declared with `remove_`, removed after apply once empty.
    #[must_use]
    pub const fn remove_dirs(&self) -> &BTreeSet<RelPath> {
        &self.remove_dirs
    }

    /// Every target path in apply order: `before_` scripts, everything
    /// else, then `after_` scripts, each group sorted by path.
    #[must_use]
    pub fn target_rel_paths(&self) -> Vec<RelPath> {
        let mut paths: Vec<(_, &RelPath)> = self
            .entries
            .iter()
            .map(|(path, entry)| (entry.order(), path))
            .collect();
        paths.sort();
        paths.into_iter().map(|(_, path)| path.clone()).collect()
    }

    /// Effective template data.
    #[must_use]
    pub fn template_data(&self) -> Value {
        self.templater.data()
    }

    /// Execute an ad hoc template against the source state's data.
    ///
    /// # Errors
    ///
    /// Returns the template engine's error.
    pub fn execute_template(&self, name: &str, source: &[u8]) -> Result<Vec<u8>> {
        self.templater.execute(name, source, None)
    }
}

/// Whether `target` or one of its ancestors is included by `ignore`.
pub(crate) fn is_ignored(ignore: &PatternSet, target: &RelPath) -> bool {
    if ignore.is_empty() {
        return false;
    }
    let mut current = Some(target.clone());
    while let Some(path) = current {
        if path.is_empty() {
            break;
        }
        if ignore.is_included(path.as_str()) {
            return true;
        }
        current = path.parent();
    }
    false
}
