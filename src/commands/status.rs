//! Command: show what apply would change.
use std::io::Write;
use std::sync::Arc;

use anyhow::Result;

use super::CommandSetup;
use crate::cli::TargetArgs;
use crate::status;
use crate::system::{RealSystem, System};

/// Print one `XY path` line per target that apply would change.
///
/// # Errors
///
/// Returns an error if the source state cannot be read, a target is not
/// managed, an entry cannot be evaluated, or `out` cannot be written.
pub fn run(setup: &CommandSetup, args: &TargetArgs, out: &mut dyn Write) -> Result<()> {
    let real: Arc<dyn System> = Arc::new(RealSystem::new());
    let state = setup.scratch_state()?;
    let source_state = setup.read_source_state(Arc::clone(&state), Arc::clone(&real))?;
    let targets = setup.target_paths(&args.targets)?;
    let env = setup.apply_env(&real, &real, state.as_ref());
    for line in status::status(&source_state, &env, &targets)? {
        writeln!(out, "{line}")?;
    }
    Ok(())
}
