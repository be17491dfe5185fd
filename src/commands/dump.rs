//! Command: print the target state as JSON.
use std::io::Write;
use std::sync::Arc;

use anyhow::Result;

use super::{CommandSetup, render_target_state};
use crate::cli::TargetArgs;
use crate::system::{DumpSystem, System};

/// Write the target state of the selected targets as a JSON object keyed
/// by target path.
///
/// # Errors
///
/// Returns an error if the source state cannot be read, an entry cannot be
/// evaluated, or `out` cannot be written.
pub fn run(setup: &CommandSetup, args: &TargetArgs, out: &mut dyn Write) -> Result<()> {
    let dump = Arc::new(DumpSystem::new(&setup.dest_dir));
    let target_system: Arc<dyn System> = dump.clone();
    render_target_state(setup, &target_system, &args.targets)?;
    serde_json::to_writer_pretty(&mut *out, &dump.data())?;
    writeln!(out)?;
    Ok(())
}
