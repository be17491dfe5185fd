//! Command: inspect or edit the persistent state.
use std::io::Write;

use anyhow::Result;

use super::CommandSetup;
use crate::cli::StateCommand;
use crate::logging;
use crate::persistent_state::{self, OpenMode};

/// Run a `state` subcommand.
///
/// `get` prints nothing for a missing key. Mutations are only logged under
/// `--dry-run`.
///
/// # Errors
///
/// Returns an error if the state file cannot be opened, read or written,
/// or `out` cannot be written.
pub fn run(setup: &CommandSetup, command: &StateCommand, out: &mut dyn Write) -> Result<()> {
    match command {
        StateCommand::Dump => {
            let state = setup.open_state(OpenMode::ReadOnly)?;
            let dump = persistent_state::dump_json(state.as_ref())?;
            state.close()?;
            serde_json::to_writer_pretty(&mut *out, &dump)?;
            writeln!(out)?;
        }
        StateCommand::Get(key) => {
            let state = setup.open_state(OpenMode::ReadOnly)?;
            let value = state.get(&key.bucket, &key.key)?;
            state.close()?;
            match value {
                Some(value) => {
                    out.write_all(&value)?;
                    writeln!(out)?;
                }
                None => tracing::debug!("{}/{}: not set", key.bucket, key.key),
            }
        }
        StateCommand::Set(value) if setup.dry_run => {
            logging::dry_run(&format!("set {}/{}", value.bucket, value.key));
        }
        StateCommand::Set(value) => {
            let state = setup.open_state(OpenMode::ReadWrite)?;
            state.set(&value.bucket, &value.key, value.value.as_bytes())?;
            state.close()?;
        }
        StateCommand::Delete(key) if setup.dry_run => {
            logging::dry_run(&format!("delete {}/{}", key.bucket, key.key));
        }
        StateCommand::Delete(key) => {
            let state = setup.open_state(OpenMode::ReadWrite)?;
            state.delete(&key.bucket, &key.key)?;
            state.close()?;
        }
        StateCommand::DeleteBucket(bucket) if setup.dry_run => {
            logging::dry_run(&format!("delete bucket {}", bucket.bucket));
        }
        StateCommand::DeleteBucket(bucket) => {
            let state = setup.open_state(OpenMode::ReadWrite)?;
            state.delete_bucket(&bucket.bucket)?;
            state.close()?;
        }
    }
    Ok(())
}
