//! Command: write the target state to an archive.
use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::sync::Arc;

use anyhow::{Context as _, Result};

use super::{CommandSetup, render_target_state};
use crate::cli::{ArchiveFormat, ArchiveOpts};
use crate::system::{System, TarWriterSystem, ZipWriterSystem};

/// Write the selected targets to `opts.output` as a tar or zip archive.
///
/// # Errors
///
/// Returns an error if the output cannot be created, the source state
/// cannot be read, or an entry cannot be evaluated.
pub fn run(setup: &CommandSetup, opts: &ArchiveOpts) -> Result<()> {
    let file = File::create(&opts.output)
        .with_context(|| format!("creating {}", opts.output.display()))?;
    let writer = BufWriter::new(file);
    let mtime = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default();

    let mut writer = match opts.format {
        ArchiveFormat::Tar => {
            let archive = Arc::new(TarWriterSystem::new(writer, &setup.dest_dir, mtime));
            render(setup, &archive, &opts.targets.targets)?;
            Arc::try_unwrap(archive)
                .map_err(|_| anyhow::anyhow!("archive still in use"))?
                .finish()?
        }
        ArchiveFormat::Zip => {
            let archive = Arc::new(ZipWriterSystem::new(writer, &setup.dest_dir));
            render(setup, &archive, &opts.targets.targets)?;
            Arc::try_unwrap(archive)
                .map_err(|_| anyhow::anyhow!("archive still in use"))?
                .finish()?
        }
    };
    writer.flush()?;
    tracing::info!("wrote {}", opts.output.display());
    Ok(())
}

fn render<S: System + 'static>(
    setup: &CommandSetup,
    archive: &Arc<S>,
    targets: &[std::path::PathBuf],
) -> Result<()> {
    let target_system: Arc<dyn System> = Arc::clone(archive) as Arc<dyn System>;
    render_target_state(setup, &target_system, targets)
}
