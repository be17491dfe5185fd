//! Console and log file output.
//!
//! Everything goes through [`tracing`]. Two targets get their own rendering:
//! [`stage`] headers and [`dry_run`] notices for changes that were not made.

mod subscriber;
mod utils;

pub use subscriber::init_subscriber;

const STAGE_TARGET: &str = "dotstate::stage";
const DRY_RUN_TARGET: &str = "dotstate::dry_run";

/// Log a section header.
pub fn stage(msg: &str) {
    tracing::info!(target: "dotstate::stage", "{msg}");
}

/// Log a change that a dry run skipped.
pub fn dry_run(msg: &str) {
    tracing::info!(target: "dotstate::dry_run", "{msg}");
}
