//! External tool invocation.
//!
//! Every tool (`btrfs`, `ssh`, `age`) is configured as a command line so it can
//! be wrapped (`sudo btrfs`, `ionice -c3 btrfs`). Children are spawned with
//! `kill_on_drop`, so dropping a pending run after cancellation kills them.

use crate::utils::errors::{BackupError, Result};
use std::process::{Output, Stdio};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bytes of a stage's stderr kept for its error message.
const STDERR_TAIL: usize = 64 * 1024;

/// A configured external program with its leading arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tool {
    program: String,
    args: Vec<String>,
}

impl Tool {
    /// Parse a whitespace-separated command line such as `sudo btrfs`.
    pub fn parse(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| BackupError::Config("empty tool command".to_string()))?;

        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    /// Start a command for this tool. Stdin is closed unless the caller
    /// overrides it.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

/// Render a command the way a shell user would type it.
pub fn render(cmd: &Command) -> String {
    let std_cmd = cmd.as_std();
    std::iter::once(std_cmd.get_program())
        .chain(std_cmd.get_args())
        .map(|part| part.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Spawn a command, mapping failure to start into a `ToolExecution` error.
pub fn spawn(cmd: &mut Command, what: &str) -> Result<Child> {
    cmd.spawn()
        .map_err(|e| BackupError::ToolExecution(format!("{what}: failed to start: {e}")))
}

/// Read a child's stderr in the background until EOF.
///
/// Stages of a streaming pipeline must never block on a full stderr pipe
/// while their stdout is still being consumed. Only the last
/// [`STDERR_TAIL`] bytes are kept.
pub fn collect_stderr(child: &mut Child) -> JoinHandle<Vec<u8>> {
    let stderr = child.stderr.take();
    tokio::spawn(async move {
        let mut kept = Vec::new();
        let Some(mut stderr) = stderr else {
            return kept;
        };

        let mut chunk = [0u8; 8192];
        loop {
            match stderr.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    kept.extend_from_slice(&chunk[..n]);
                    if kept.len() > STDERR_TAIL {
                        kept.drain(..kept.len() - STDERR_TAIL);
                    }
                }
            }
        }
        kept
    })
}

/// Wait for a child whose stderr is read by [`collect_stderr`].
pub async fn reap(mut child: Child, stderr: JoinHandle<Vec<u8>>) -> Result<Output> {
    let status = child.wait().await?;
    let stderr = stderr.await.unwrap_or_default();
    Ok(Output {
        status,
        stdout: Vec::new(),
        stderr,
    })
}

/// Turn a finished command's exit status into a `ToolExecution` error
/// carrying its stderr.
pub fn check_output(what: &str, output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    Err(BackupError::ToolExecution(if stderr.is_empty() {
        format!("{what} failed: {}", output.status)
    } else {
        format!("{what} failed: {}: {stderr}", output.status)
    }))
}

/// Run a command to completion and return its stdout.
///
/// Non-zero exit becomes a `ToolExecution` error carrying the command's
/// stderr. Cancellation kills the child and returns `Cancelled`.
pub async fn run_output(mut cmd: Command, what: &str, cancel: &CancellationToken) -> Result<String> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let child = spawn(&mut cmd, what)?;

    let output = tokio::select! {
        output = child.wait_with_output() => output?,
        _ = cancel.cancelled() => return Err(BackupError::Cancelled),
    };

    check_output(what, &output)?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a command to completion, discarding its stdout.
pub async fn run(cmd: Command, what: &str, cancel: &CancellationToken) -> Result<()> {
    run_output(cmd, what, cancel).await.map(|_| ())
}
