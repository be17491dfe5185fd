//! Command-line interface.
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::entry_type_set::EntryTypeSet;
use crate::source_state::RefreshExternals;

/// Top-level CLI entry point.
#[derive(Parser, Debug)]
#[command(
    name = "dotstate",
    about = "Reconcile a destination directory with a templated source directory",
    version
)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Options shared by every subcommand
    #[command(flatten)]
    pub global: GlobalOpts,
}

/// Options shared across all subcommands.
#[derive(Args, Debug, Clone)]
pub struct GlobalOpts {
    /// Config file [default: $XDG_CONFIG_HOME/dotstate/dotstate.toml]
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Source directory
    #[arg(short = 'S', long, global = true)]
    pub source: Option<PathBuf>,

    /// Destination directory
    #[arg(short = 'D', long, global = true)]
    pub destination: Option<PathBuf>,

    /// Persistent state file
    #[arg(long, global = true)]
    pub persistent_state: Option<PathBuf>,

    /// Show what would change without changing anything
    #[arg(short = 'n', long, global = true)]
    pub dry_run: bool,

    /// Walk the destination sequentially, in sorted order
    #[arg(long = "no-parallel", global = true, action = clap::ArgAction::SetFalse)]
    pub parallel: bool,

    /// Entry types to include, e.g. `files,dirs` or `noscripts`
    #[arg(short, long, global = true, default_value = "all")]
    pub include: EntryTypeSet,

    /// Entry types to exclude
    #[arg(short = 'x', long, global = true, default_value = "none")]
    pub exclude: EntryTypeSet,

    /// When to fetch externals again
    #[arg(short = 'R', long, global = true, value_enum)]
    pub refresh_externals: Option<RefreshExternals>,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Update the destination to match the source
    Apply(TargetArgs),
    /// Show what apply would change
    Status(TargetArgs),
    /// List managed target paths
    Managed,
    /// Print the target state as JSON
    Dump(TargetArgs),
    /// Write the target state to a tar or zip archive
    Archive(ArchiveOpts),
    /// Inspect or edit the persistent state
    #[command(subcommand)]
    State(StateCommand),
    /// Print a shell completion script
    Completion(CompletionOpts),
    /// Print version information
    Version,
}

/// Target selection.
#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// Destination paths to operate on; everything when empty
    pub targets: Vec<PathBuf>,
}

/// Archive formats.
#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// Uncompressed tar.
    #[default]
    Tar,
    /// Zip.
    Zip,
}

/// Options for the `archive` subcommand.
#[derive(Args, Debug, Clone)]
pub struct ArchiveOpts {
    /// Archive format
    #[arg(short, long, value_enum, default_value_t)]
    pub format: ArchiveFormat,

    /// Output file
    #[arg(short, long)]
    pub output: PathBuf,

    /// Target selection
    #[command(flatten)]
    pub targets: TargetArgs,
}

/// `state` subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum StateCommand {
    /// Print every bucket as JSON
    Dump,
    /// Print one value
    Get(StateKey),
    /// Set one value
    Set(StateValue),
    /// Delete one value
    Delete(StateKey),
    /// Delete a whole bucket
    DeleteBucket(StateBucket),
}

/// A bucket.
#[derive(Args, Debug, Clone)]
pub struct StateBucket {
    /// Bucket name
    #[arg(long)]
    pub bucket: String,
}

/// A key in a bucket.
#[derive(Args, Debug, Clone)]
pub struct StateKey {
    /// Bucket name
    #[arg(long)]
    pub bucket: String,
    /// Key
    #[arg(long)]
    pub key: String,
}

/// A value for a key in a bucket.
#[derive(Args, Debug, Clone)]
pub struct StateValue {
    /// Bucket name
    #[arg(long)]
    pub bucket: String,
    /// Key
    #[arg(long)]
    pub key: String,
    /// Value
    #[arg(long)]
    pub value: String,
}

/// Options for the `completion` subcommand.
#[derive(Args, Debug, Clone)]
pub struct CompletionOpts {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: clap_complete::Shell,
}

impl Command {
    /// Name used for the log file.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Apply(_) => "apply",
            Self::Status(_) => "status",
            Self::Managed => "managed",
            Self::Dump(_) => "dump",
            Self::Archive(_) => "archive",
            Self::State(_) => "state",
            Self::Completion(_) => "completion",
            Self::Version => "version",
        }
    }
}
