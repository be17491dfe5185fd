//! Command: make the destination match the source.
use std::sync::Arc;

use anyhow::Result;

use super::CommandSetup;
use crate::cli::TargetArgs;
use crate::logging;
use crate::persistent_state::OpenMode;
use crate::system::{DryRunSystem, RealSystem, System};

/// Run the apply command.
///
/// With `--dry-run` writes go to a [`DryRunSystem`] and state changes to a
/// scratch copy. A successful apply records the config file's digest.
///
/// # Errors
///
/// Returns an error if the source state cannot be read, a target is not
/// managed, or any entry fails to apply.
pub fn run(setup: &CommandSetup, args: &TargetArgs) -> Result<()> {
    let real: Arc<dyn System> = Arc::new(RealSystem::new());
    let state = if setup.dry_run {
        setup.scratch_state()?
    } else {
        setup.open_state(OpenMode::ReadWrite)?
    };

    logging::stage("Reading source state");
    let source_state = setup.read_source_state(Arc::clone(&state), Arc::clone(&real))?;
    let targets = setup.target_paths(&args.targets)?;
    tracing::debug!("{} managed targets", source_state.entries().len());

    logging::stage("Applying");
    let dry_run = Arc::new(DryRunSystem::new(Arc::clone(&real)));
    let target_system: Arc<dyn System> = if setup.dry_run {
        dry_run.clone()
    } else {
        Arc::clone(&real)
    };
    let env = setup.apply_env(&target_system, &real, state.as_ref());
    let result = source_state.apply_all(&env, &targets).and_then(|changed| {
        if setup.record_config_state(state.as_ref())? {
            tracing::info!("config file changed since the last apply");
        }
        Ok(changed)
    });
    state.close()?;
    let changed = result?;

    if setup.dry_run {
        if dry_run.modified() {
            logging::dry_run(&format!("{} target(s) would change", changed.len()));
        } else {
            logging::dry_run("nothing to do");
        }
    } else if changed.is_empty() {
        tracing::info!("nothing to do");
    } else {
        tracing::info!("{} target(s) changed", changed.len());
    }
    Ok(())
}
