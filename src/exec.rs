//! Subprocess execution for scripts, modify scripts, filters and git.
use anyhow::{Context, Result};
use std::io::Write as _;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use crate::error::ApplyError;

/// Result of a command execution.
#[derive(Debug)]
pub struct ExecResult {
    /// Raw standard output.
    pub stdout: Vec<u8>,
    /// Standard error, lossily decoded.
    pub stderr: String,
    /// Whether the process exited zero.
    pub success: bool,
    /// Exit code, if the process was not killed by a signal.
    pub code: Option<i32>,
}

impl From<Output> for ExecResult {
    fn from(output: Output) -> Self {
        Self {
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        }
    }
}

impl ExecResult {
    /// Standard output, lossily decoded.
    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }
}

/// Turn a finished process into an error if it exited non-zero.
fn check(result: ExecResult, label: &str) -> Result<ExecResult> {
    if !result.success {
        return Err(ApplyError::CommandFailed {
            label: label.to_string(),
            code: result.code.unwrap_or(-1),
            stderr: result.stderr.trim().to_string(),
        }
        .into());
    }
    Ok(result)
}

/// Execute a command and return the result, failing on non-zero exit.
fn execute_checked(mut cmd: Command, label: &str) -> Result<ExecResult> {
    let output = cmd
        .output()
        .with_context(|| format!("failed to execute: {label}"))?;
    check(ExecResult::from(output), label)
}

/// Run a command in a specific directory.
///
/// # Errors
///
/// Returns an error if the program cannot be started or exits non-zero.
pub fn run_in(dir: &Path, program: &str, args: &[String]) -> Result<ExecResult> {
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(dir);
    execute_checked(cmd, &format!("{program} in {}", dir.display()))
}

/// Run a command with `stdin` piped to it, returning its captured output.
///
/// `dir` sets the working directory when given. `label` names the command in
/// error messages.
///
/// # Errors
///
/// Returns an error if the program cannot be started, its input cannot be
/// written, or it exits non-zero.
pub fn run_with_stdin(
    program: &Path,
    args: &[String],
    dir: Option<&Path>,
    stdin: &[u8],
    label: &str,
) -> Result<ExecResult> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to execute: {label}"))?;

    // Feed stdin from a separate thread so a child that writes more than a
    // pipe buffer before reading all of its input cannot deadlock us.
    let output = std::thread::scope(|scope| -> Result<Output> {
        let writer = child.stdin.take().map(|mut pipe| {
            scope.spawn(move || -> std::io::Result<()> {
                match pipe.write_all(stdin) {
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                    other => other,
                }
            })
        });
        let output = child
            .wait_with_output()
            .with_context(|| format!("failed to wait for: {label}"))?;
        if let Some(writer) = writer {
            writer
                .join()
                .map_err(|_| anyhow::anyhow!("stdin writer for {label} panicked"))?
                .with_context(|| format!("failed to write stdin of: {label}"))?;
        }
        Ok(output)
    })?;
    check(ExecResult::from(output), label)
}
