//! Command: list managed target paths.
use std::io::Write;
use std::sync::Arc;

use anyhow::Result;

use super::CommandSetup;
use crate::status;
use crate::system::{RealSystem, System};

/// Print every managed target path that passes the entry type filter.
///
/// # Errors
///
/// Returns an error if the source state cannot be read, an entry cannot be
/// evaluated, or `out` cannot be written.
pub fn run(setup: &CommandSetup, out: &mut dyn Write) -> Result<()> {
    let real: Arc<dyn System> = Arc::new(RealSystem::new());
    let state = setup.scratch_state()?;
    let source_state = setup.read_source_state(state, Arc::clone(&real))?;
    for path in status::managed(&source_state, &real, setup.filter)? {
        writeln!(out, "{path}")?;
    }
    Ok(())
}
