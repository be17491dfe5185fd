//! Command: print a shell completion script.
use std::io::Write;

use anyhow::Result;
use clap::CommandFactory as _;

use crate::cli::{Cli, CompletionOpts};

/// Write the completion script for `opts.shell`.
///
/// # Errors
///
/// Returns an error if `out` cannot be flushed.
pub fn run(opts: &CompletionOpts, out: &mut dyn Write) -> Result<()> {
    clap_complete::generate(opts.shell, &mut Cli::command(), "dotstate", out);
    out.flush()?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn bash_completion_names_subcommands() {
        let mut out = Vec::new();
        run(
            &CompletionOpts {
                shell: clap_complete::Shell::Bash,
            },
            &mut out,
        )
        .unwrap();
        let script = String::from_utf8(out).unwrap();
        assert!(script.contains("dotstate"));
        assert!(script.contains("apply"));
        assert!(script.contains("delete-bucket"));
    }
}
