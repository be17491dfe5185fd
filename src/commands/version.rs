//! Command: print version information.
use std::io::Write;

use anyhow::Result;

/// Version string: `DOTSTATE_VERSION` from the build, else the package version.
#[must_use]
pub fn version() -> &'static str {
    option_env!("DOTSTATE_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"))
}

/// Print the version.
///
/// # Errors
///
/// Returns an error if `out` cannot be written.
pub fn run(out: &mut dyn Write) -> Result<()> {
    writeln!(out, "dotstate {}", version())?;
    Ok(())
}
