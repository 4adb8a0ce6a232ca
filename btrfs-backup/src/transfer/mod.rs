//! Snapshot transfer to the remote host.
//!
//! A transfer is a chain of up to three processes:
//!
//! ```text
//! btrfs send [-p parent] snap  ->  [age -r recipient]  ->  ssh host "tee <name>.tmp | sha256sum"
//! ```
//!
//! The last hop is forwarded by a local task that hashes every byte it
//! writes, and the digest printed by the remote `sha256sum` is drained by a
//! second task running alongside it. Both are joined before any process is
//! waited on. A transfer only becomes a backup once [`TransferPipeline::move_tmp_file`]
//! has renamed the verified temp file to its final name.

pub mod digest_reader;
pub mod progress;

use crate::config::{Config, RunOptions};
use crate::naming::{TransmissionMode, CHECKSUM_SUFFIX, TEMP_SUFFIX};
use crate::remote::{shell_escape, RemoteShell};
use crate::utils::errors::{BackupError, Result};
use crate::utils::process::{self, Tool};
use digest_reader::DigestReader;
use progress::ProgressReporter;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// A running stage and the task collecting its stderr.
type Stage = (Child, JoinHandle<Vec<u8>>);

/// What to send and where to put it.
#[derive(Debug, Clone, Copy)]
pub struct SendRequest<'a> {
    /// The new read-only snapshot
    pub snapshot: &'a Path,

    /// Snapshot the stream is diffed against; `None` sends a full stream
    pub parent: Option<&'a Path>,

    /// Final remote file name
    pub file_name: &'a str,
}

pub struct TransferPipeline {
    btrfs: Tool,
    age: Tool,
    remote: RemoteShell,
    mode: TransmissionMode,
    options: RunOptions,
}

impl TransferPipeline {
    pub fn new(
        btrfs: Tool,
        age: Tool,
        remote: RemoteShell,
        mode: TransmissionMode,
        options: RunOptions,
    ) -> Self {
        Self {
            btrfs,
            age,
            remote,
            mode,
            options,
        }
    }

    pub fn from_config(config: &Config, options: RunOptions) -> Result<Self> {
        Ok(Self::new(
            Tool::parse(&config.tools.btrfs)?,
            Tool::parse(&config.tools.age)?,
            RemoteShell::from_config(config)?,
            config.transmission_mode(),
            options,
        ))
    }

    pub fn remote(&self) -> &RemoteShell {
        &self.remote
    }

    pub fn mode(&self) -> &TransmissionMode {
        &self.mode
    }

    fn send_command(&self, req: &SendRequest<'_>) -> Command {
        let mut cmd = self.btrfs.command();
        cmd.arg("send");
        if let Some(parent) = req.parent {
            cmd.arg("-p").arg(parent);
        }
        cmd.arg(req.snapshot);
        cmd
    }

    fn encrypt_command(&self) -> Option<Command> {
        match &self.mode {
            TransmissionMode::Plain => None,
            TransmissionMode::Encrypted { recipient } => {
                let mut cmd = self.age.command();
                cmd.arg("-r").arg(recipient);
                Some(cmd)
            }
        }
    }

    fn upload_command(&self, tmp_name: &str) -> String {
        format!("tee {} | sha256sum", self.remote.quoted_path(tmp_name))
    }

    fn render_pipeline(&self, req: &SendRequest<'_>, upload_cmd: &str) -> String {
        let mut stages = vec![process::render(&self.send_command(req))];
        if let Some(cmd) = self.encrypt_command() {
            stages.push(process::render(&cmd));
        }
        stages.push(self.remote.render(upload_cmd));
        stages.join(" | ")
    }

    /// Stream a snapshot into `<file_name>.tmp` on the remote and verify it.
    ///
    /// Returns the verified lowercase hex SHA-256 of the stored bytes, or an
    /// empty string in dry-run. On any failure the temp file is removed
    /// before the error is returned.
    pub async fn send_snapshot(
        &self,
        req: &SendRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let tmp_name = format!("{}{}", req.file_name, TEMP_SUFFIX);
        let upload_cmd = self.upload_command(&tmp_name);

        info!(
            "[{}] Sending snapshot {} → {}:{}",
            self.mode.label(),
            req.snapshot.display(),
            self.remote.host(),
            self.remote.path(req.file_name)
        );

        if self.options.dry_run {
            debug!("[DRY-RUN] {}", self.render_pipeline(req, &upload_cmd));
            return Ok(String::new());
        }

        match self.run_pipeline(req, &upload_cmd, cancel).await {
            Ok(digest) => {
                info!("Checksum validation passed");
                Ok(digest)
            }
            Err(e) => {
                self.remove_tmp(&tmp_name).await;
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        &self,
        req: &SendRequest<'_>,
        upload_cmd: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        // Every stage's stderr is read from the moment it starts, so a chatty
        // stage cannot stall the stream on a full pipe.
        let mut producer = {
            let mut cmd = self.send_command(req);
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            process::spawn(&mut cmd, "btrfs send")?
        };
        let producer_err = process::collect_stderr(&mut producer);
        let producer_out = producer
            .stdout
            .take()
            .ok_or_else(|| missing_pipe("btrfs send"))?;

        // The filter command is dropped right after spawning so this process
        // keeps no copy of the producer's stdout.
        let (filter, stream): (Option<Stage>, ByteStream) = match self.encrypt_command() {
            None => (None, Box::new(producer_out) as ByteStream),
            Some(mut cmd) => {
                let stdin: Stdio = producer_out.try_into()?;
                cmd.stdin(stdin).stdout(Stdio::piped()).stderr(Stdio::piped());
                let mut child = process::spawn(&mut cmd, "age")?;
                let stderr = process::collect_stderr(&mut child);
                let out = child.stdout.take().ok_or_else(|| missing_pipe("age"))?;
                (Some((child, stderr)), Box::new(out) as ByteStream)
            }
        };

        let mut sink = {
            let mut cmd = self.remote.command(upload_cmd);
            cmd.stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            process::spawn(&mut cmd, "ssh")?
        };
        let sink_err = process::collect_stderr(&mut sink);
        let sink_in = sink.stdin.take().ok_or_else(|| missing_pipe("ssh"))?;
        let mut sink_out = sink.stdout.take().ok_or_else(|| missing_pipe("ssh"))?;

        let counter = Arc::new(AtomicU64::new(0));
        let reporter = self
            .options
            .progress
            .then(|| ProgressReporter::start("Transfer", Arc::clone(&counter)));

        let forward = tokio::spawn(forward_stream(
            DigestReader::new(stream, Arc::clone(&counter)),
            sink_in,
        ));
        let drain = tokio::spawn(async move {
            let mut reported = String::new();
            sink_out.read_to_string(&mut reported).await?;
            Ok::<_, io::Error>(reported)
        });

        let forward_abort = forward.abort_handle();
        let drain_abort = drain.abort_handle();

        let outcome = tokio::select! {
            outcome = finish_pipeline(
                req.file_name,
                (producer, producer_err),
                filter,
                (sink, sink_err),
                forward,
                drain,
            ) => outcome,
            _ = cancel.cancelled() => {
                forward_abort.abort();
                drain_abort.abort();
                Err(BackupError::Cancelled)
            }
        };

        if let Some(reporter) = reporter {
            match &outcome {
                Ok(_) => reporter.finish().await,
                Err(_) => reporter.abandon().await,
            }
        }

        outcome
    }

    /// Best-effort removal of a temp file. Runs even after cancellation.
    async fn remove_tmp(&self, tmp_name: &str) {
        let names = [tmp_name.to_string()];
        match self.remote.remove_files(&names, &CancellationToken::new()).await {
            Ok(()) => info!("Cleaned up remote temp file: {}", tmp_name),
            Err(e) => warn!("Error during cleanup of remote temp file {}: {}", tmp_name, e),
        }
    }

    /// Commit a transferred backup: rename `<name>.tmp` to `<name>`, check the
    /// final file against `digest` and write the `<name>.sha256` sidecar.
    ///
    /// An empty `digest` skips the check and the sidecar. A final file that
    /// fails the check is deleted.
    pub async fn move_tmp_file(
        &self,
        name: &str,
        digest: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let tmp_name = format!("{name}{TEMP_SUFFIX}");
        let mv_cmd = format!(
            "mv {} {}",
            self.remote.quoted_path(&tmp_name),
            self.remote.quoted_path(name)
        );

        if self.options.dry_run {
            debug!("[DRY-RUN] {}", self.remote.render(&mv_cmd));
            debug!(
                "[DRY-RUN] {}",
                self.remote.render(&self.sidecar_command(name, "<calculated-sha256>"))
            );
            return Ok(());
        }

        self.remote.run(&mv_cmd, cancel).await?;

        if digest.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.validate_remote_checksum(name, digest, cancel).await {
            if !matches!(e, BackupError::Cancelled) {
                let names = [name.to_string()];
                if let Err(rm_err) = self.remote.remove_files(&names, &CancellationToken::new()).await {
                    warn!("Failed to remove corrupt backup {}: {}", name, rm_err);
                }
            }
            return Err(e);
        }

        self.remote.run(&self.sidecar_command(name, digest), cancel).await?;
        debug!(file = %name, digest = %digest, "Checksum sidecar written");
        Ok(())
    }

    fn sidecar_command(&self, name: &str, digest: &str) -> String {
        format!(
            "printf '%s  %s\\n' {} {} > {}",
            shell_escape(digest),
            shell_escape(name),
            self.remote.quoted_path(&format!("{name}{CHECKSUM_SUFFIX}"))
        )
    }

    /// Recompute the digest of a committed file on the remote and compare it
    /// (case-insensitively) with `digest`.
    pub async fn validate_remote_checksum(
        &self,
        name: &str,
        digest: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let remote_cmd = format!("sha256sum {}", self.remote.quoted_path(name));
        let output = self.remote.output(&remote_cmd, cancel).await?;
        let remote = parse_digest(&output)?;

        if !remote.eq_ignore_ascii_case(digest) {
            return Err(BackupError::Integrity {
                file: name.to_string(),
                local: digest.to_string(),
                remote: remote.to_string(),
            });
        }

        debug!(file = %name, "Remote checksum verified");
        Ok(())
    }

    /// Whether the final file already exists on the remote.
    pub async fn remote_backup_exists(&self, name: &str, cancel: &CancellationToken) -> bool {
        self.remote.file_exists(name, cancel).await
    }
}

async fn forward_stream<R>(mut reader: DigestReader<R>, mut sink: ChildStdin) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    tokio::io::copy(&mut reader, &mut sink).await?;
    sink.shutdown().await?;
    Ok(reader.finalize())
}

/// Join the stream tasks, reap every stage and check the digest.
///
/// Failures are reported by stage, the sink first: a dying sink makes the
/// upstream stages fail with broken pipes.
async fn finish_pipeline(
    file_name: &str,
    (producer, producer_err): Stage,
    filter: Option<Stage>,
    (sink, sink_err): Stage,
    forward: JoinHandle<io::Result<String>>,
    drain: JoinHandle<io::Result<String>>,
) -> Result<String> {
    let (forwarded, reported) = tokio::join!(forward, drain);

    let sink_output = process::reap(sink, sink_err).await?;
    let filter_output = match filter {
        Some((child, stderr)) => Some(process::reap(child, stderr).await?),
        None => None,
    };
    let producer_output = process::reap(producer, producer_err).await?;

    process::check_output("ssh", &sink_output)?;
    if let Some(output) = &filter_output {
        process::check_output("age", output)?;
    }
    process::check_output("btrfs send", &producer_output)?;

    let local = forwarded
        .map_err(task_error)?
        .map_err(|e| BackupError::ToolExecution(format!("forwarding stream to ssh failed: {e}")))?;
    let reported = reported
        .map_err(task_error)?
        .map_err(|e| BackupError::ToolExecution(format!("failed to read remote checksum: {e}")))?;

    let remote = parse_digest(&reported)?;
    if !remote.eq_ignore_ascii_case(&local) {
        return Err(BackupError::Integrity {
            file: file_name.to_string(),
            local,
            remote: remote.to_string(),
        });
    }

    Ok(local)
}

/// First field of `sha256sum` output.
fn parse_digest(output: &str) -> Result<&str> {
    output.split_whitespace().next().ok_or_else(|| {
        BackupError::ToolExecution(format!("unable to parse remote checksum output: {output:?}"))
    })
}

fn missing_pipe(what: &str) -> BackupError {
    BackupError::ToolExecution(format!("{what}: stdio pipe unavailable"))
}

fn task_error(e: JoinError) -> BackupError {
    BackupError::ToolExecution(format!("transfer task failed: {e}"))
}
