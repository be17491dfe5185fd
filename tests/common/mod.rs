// Integration test fixtures: a throwaway source tree, destination and state
// file under one temp dir, plus a fetcher that serves canned downloads.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use clap::Parser as _;

use dotstate::cli::Cli;
use dotstate::commands::CommandSetup;
use dotstate::persistent_state::OpenMode;
use dotstate::relpath::RelPath;
use dotstate::source_state::Fetcher;
use dotstate::status;
use dotstate::system::{RealSystem, System};

/// Serves fixed bodies by URL and counts requests.
#[derive(Debug, Default)]
pub struct FakeFetcher {
    bodies: Mutex<BTreeMap<String, Vec<u8>>>,
    requests: AtomicUsize,
}

impl FakeFetcher {
    /// Serve `body` at `url`.
    pub fn serve(&self, url: &str, body: &[u8]) {
        self.bodies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string(), body.to_vec());
    }

    /// Number of fetches so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Fetcher for FakeFetcher {
    fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.bodies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("{url}: 404 Not Found"))
    }
}

/// An isolated source directory, destination directory and state file,
/// backed by a [`tempfile::TempDir`].
pub struct TestEnv {
    /// Holds everything; deleted on drop.
    pub root: tempfile::TempDir,
    /// Downloads served to externals.
    pub fetcher: Arc<FakeFetcher>,
    /// Extra global flags, e.g. `--persistent-state` backend overrides.
    flags: Vec<String>,
}

impl TestEnv {
    /// Source directory.
    pub fn source(&self) -> PathBuf {
        self.root.path().join("source")
    }

    /// Destination directory.
    pub fn dest(&self) -> PathBuf {
        self.root.path().join("home")
    }

    /// Config file path.
    pub fn config(&self) -> PathBuf {
        self.root.path().join("dotstate.toml")
    }

    /// Persistent state file.
    pub fn state_path(&self) -> PathBuf {
        self.root.path().join("state")
    }

    /// Resolved settings for `args` on top of the environment's directories.
    pub fn setup(&self, args: &[&str]) -> CommandSetup {
        let mut argv = vec![
            "dotstate".to_string(),
            "--config".to_string(),
            self.config().display().to_string(),
            "--source".to_string(),
            self.source().display().to_string(),
            "--destination".to_string(),
            self.dest().display().to_string(),
            "--persistent-state".to_string(),
            self.state_path().display().to_string(),
        ];
        argv.extend(self.flags.iter().cloned());
        argv.extend(args.iter().map(ToString::to_string));
        if !argv.iter().any(|a| !a.starts_with('-') && is_subcommand(a)) {
            argv.push("apply".to_string());
        }
        let cli = Cli::parse_from(argv);
        let fetcher: Arc<dyn Fetcher> = self.fetcher.clone();
        CommandSetup::init(&cli.global)
            .expect("init command setup")
            .with_fetcher(fetcher)
    }

    /// Apply everything and return the changed targets.
    pub fn apply(&self) -> Vec<String> {
        self.try_apply(&[]).expect("apply")
    }

    /// Apply with extra global flags.
    pub fn try_apply(&self, args: &[&str]) -> anyhow::Result<Vec<String>> {
        let setup = self.setup(args);
        let real: Arc<dyn System> = Arc::new(RealSystem::new());
        let state = setup.open_state(OpenMode::ReadWrite)?;
        let source_state = setup.read_source_state(Arc::clone(&state), Arc::clone(&real))?;
        let env = setup.apply_env(&real, &real, state.as_ref());
        let result = source_state.apply_all(&env, &[]);
        state.close()?;
        Ok(result?.iter().map(ToString::to_string).collect())
    }

    /// Status lines for everything.
    pub fn status(&self) -> Vec<String> {
        let setup = self.setup(&["status"]);
        let real: Arc<dyn System> = Arc::new(RealSystem::new());
        let state = setup.scratch_state().expect("scratch state");
        let source_state = setup
            .read_source_state(Arc::clone(&state), Arc::clone(&real))
            .expect("read source state");
        let env = setup.apply_env(&real, &real, state.as_ref());
        status::status(&source_state, &env, &[]).expect("status")
    }

    /// Contents of a destination file.
    pub fn read_dest(&self, rel: &str) -> String {
        std::fs::read_to_string(self.dest().join(rel)).expect("read destination file")
    }

    /// Write a source file, creating parents.
    pub fn write_source(&self, rel: &str, contents: &str) {
        write(&self.source().join(rel), contents);
    }

    /// Write a destination file, creating parents.
    pub fn write_dest(&self, rel: &str, contents: &str) {
        write(&self.dest().join(rel), contents);
    }

    /// Permission bits of a destination path.
    #[cfg(unix)]
    pub fn dest_mode(&self, rel: &str) -> u32 {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::symlink_metadata(self.dest().join(rel))
            .expect("stat destination")
            .permissions()
            .mode()
            & 0o7777
    }

    /// Target-relative path helper.
    pub fn rel(path: &str) -> RelPath {
        RelPath::new(path)
    }
}

fn is_subcommand(arg: &str) -> bool {
    matches!(
        arg,
        "apply" | "status" | "managed" | "dump" | "archive" | "state" | "completion" | "version"
    )
}

fn write(path: &Path, contents: &str) {
    std::fs::create_dir_all(path.parent().expect("parent")).expect("create parent dir");
    std::fs::write(path, contents).expect("write file");
}

/// Fluent builder for [`TestEnv`].
pub struct TestEnvBuilder {
    env: TestEnv,
}

impl TestEnvBuilder {
    /// Begin with empty source and destination directories.
    pub fn new() -> Self {
        let root = tempfile::tempdir().expect("create temp dir");
        let env = TestEnv {
            root,
            fetcher: Arc::new(FakeFetcher::default()),
            flags: Vec::new(),
        };
        std::fs::create_dir_all(env.source()).expect("create source dir");
        std::fs::create_dir_all(env.dest()).expect("create destination dir");
        Self { env }
    }

    /// Add a source file.
    pub fn with_source_file(self, rel: &str, contents: &str) -> Self {
        self.env.write_source(rel, contents);
        self
    }

    /// Add an empty source directory.
    pub fn with_source_dir(self, rel: &str) -> Self {
        std::fs::create_dir_all(self.env.source().join(rel)).expect("create source dir");
        self
    }

    /// Add a destination file.
    pub fn with_dest_file(self, rel: &str, contents: &str) -> Self {
        self.env.write_dest(rel, contents);
        self
    }

    /// Write the config file.
    pub fn with_config(self, toml: &str) -> Self {
        std::fs::write(self.env.config(), toml).expect("write config");
        self
    }

    /// Serve `body` at `url` to externals.
    pub fn with_download(self, url: &str, body: &[u8]) -> Self {
        self.env.fetcher.serve(url, body);
        self
    }

    /// Add global flags to every command.
    pub fn with_flags(mut self, flags: &[&str]) -> Self {
        self.env
            .flags
            .extend(flags.iter().map(ToString::to_string));
        self
    }

    /// Finish building.
    pub fn build(self) -> TestEnv {
        self.env
    }
}
