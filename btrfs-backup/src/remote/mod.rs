//! Remote execution over ssh.
//!
//! Every remote operation (listing, streaming writes, renames, deletes) is a
//! shell command string run on the backup host. Paths interpolated into those
//! strings always go through [`shell_escape`].

pub mod inventory;

use crate::config::Config;
use crate::utils::errors::{BackupError, Result};
use crate::utils::process::{self, Tool};
use std::path::PathBuf;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Quote a string for a POSIX shell: `it's` becomes `'it'\''s'`.
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// The ssh channel to the backup host and the directory backups live in.
#[derive(Debug, Clone)]
pub struct RemoteShell {
    ssh: Tool,
    host: String,
    identity: Option<PathBuf>,
    options: Vec<String>,
    dest: String,
}

impl RemoteShell {
    pub fn new(ssh: Tool, host: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            ssh,
            host: host.into(),
            identity: None,
            options: Vec::new(),
            dest: dest.into(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            Tool::parse(&config.tools.ssh)?,
            config.remote_host.clone(),
            config.remote_dest.clone(),
        )
        .with_identity(config.ssh_key.clone())
        .with_options(config.ssh_options.clone()))
    }

    pub fn with_identity(mut self, identity: Option<PathBuf>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn dest(&self) -> &str {
        &self.dest
    }

    /// Path of `name` inside the backup directory, unescaped.
    pub fn path(&self, name: &str) -> String {
        format!("{}/{}", self.dest.trim_end_matches('/'), name)
    }

    /// Path of `name` inside the backup directory, quoted for the remote shell.
    pub fn quoted_path(&self, name: &str) -> String {
        shell_escape(&self.path(name))
    }

    /// ssh arguments for running `remote_cmd` on the host.
    pub fn ssh_args(&self, remote_cmd: &str) -> Vec<String> {
        let mut args = Vec::with_capacity(self.options.len() + 4);
        if let Some(identity) = &self.identity {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.extend(self.options.iter().cloned());
        args.push(self.host.clone());
        args.push(remote_cmd.to_string());
        args
    }

    /// An ssh command running `remote_cmd`; stdin is closed by default.
    pub fn command(&self, remote_cmd: &str) -> Command {
        let mut cmd = self.ssh.command();
        cmd.args(self.ssh_args(remote_cmd));
        cmd
    }

    /// Human-readable form of the ssh invocation, for dry-run output.
    pub fn render(&self, remote_cmd: &str) -> String {
        process::render(&self.command(remote_cmd))
    }

    pub async fn run(&self, remote_cmd: &str, cancel: &CancellationToken) -> Result<()> {
        debug!(command = %remote_cmd, host = %self.host, "remote command");
        process::run(self.command(remote_cmd), "ssh", cancel).await
    }

    pub async fn output(&self, remote_cmd: &str, cancel: &CancellationToken) -> Result<String> {
        debug!(command = %remote_cmd, host = %self.host, "remote command");
        process::run_output(self.command(remote_cmd), "ssh", cancel).await
    }

    /// Make sure the host answers and the backup directory exists.
    pub async fn check_access(&self, cancel: &CancellationToken) -> Result<()> {
        let dest = shell_escape(&self.dest);
        let remote_cmd = format!("test -d {dest} || mkdir -p {dest}");

        self.run(&remote_cmd, cancel).await.map_err(|e| match e {
            BackupError::Cancelled => e,
            other => BackupError::Access(format!(
                "failed to access remote host {}: {} (check SSH connectivity and permissions)",
                self.host, other
            )),
        })?;

        info!("Remote host {} is accessible", self.host);
        Ok(())
    }

    /// Whether `name` already exists as a regular file in the backup directory.
    ///
    /// Any failure to probe reads as "does not exist".
    pub async fn file_exists(&self, name: &str, cancel: &CancellationToken) -> bool {
        let remote_cmd = format!("test -f {} && echo exists", self.quoted_path(name));
        match self.output(&remote_cmd, cancel).await {
            Ok(out) => out.trim() == "exists",
            Err(_) => false,
        }
    }

    /// Remove files from the backup directory in one `rm -f`.
    pub async fn remove_files(&self, names: &[String], cancel: &CancellationToken) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        self.run(&remove_command(self, names), cancel).await
    }
}

/// `rm -f` over the quoted paths of `names`.
pub fn remove_command(remote: &RemoteShell, names: &[String]) -> String {
    let paths: Vec<String> = names.iter().map(|name| remote.quoted_path(name)).collect();
    format!("rm -f {}", paths.join(" "))
}
