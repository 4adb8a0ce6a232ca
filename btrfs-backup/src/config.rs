//! Configuration management for btrfs-backup.
//!
//! Loads configuration from a YAML file (or any format the `config` crate
//! recognizes by extension) with `BTRFS_BACKUP_*` environment variable
//! overrides. Nested keys use `__`, e.g. `BTRFS_BACKUP_TOOLS__SSH`.

use crate::naming::{TransmissionMode, DEFAULT_SNAPSHOT_PREFIX};
use crate::utils::errors::{BackupError, Result};
use crate::utils::process::Tool;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/btrfs-backup.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identity file passed to ssh with `-i`
    #[serde(default)]
    pub ssh_key: Option<PathBuf>,

    /// Remote `user@host`
    pub remote_host: String,

    /// Remote directory holding the backup files
    pub remote_dest: String,

    /// Extra arguments passed to ssh before the host
    #[serde(default)]
    pub ssh_options: Vec<String>,

    /// Force a full backup once the last remote full is this many days old (0 disables)
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,

    /// Force a full backup after this many incrementals (0 disables)
    #[serde(default)]
    pub max_incrementals: u32,

    /// age recipient; empty means the stream is stored unencrypted
    #[serde(default)]
    pub encryption_key: Option<String>,

    /// Number of full backup chains kept on the remote
    #[serde(default = "default_keep_chains")]
    pub keep_chains: usize,

    /// Prefix of local snapshot directory names
    #[serde(default = "default_snapshot_prefix")]
    pub snapshot_prefix: String,

    /// Advisory lock preventing concurrent runs
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub volumes: Vec<Volume>,
}

/// One backup unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    /// Name used in remote file names
    pub name: String,

    /// Source subvolume
    pub src: PathBuf,

    /// Directory holding this volume's local snapshots
    #[serde(rename = "snapdir")]
    pub snap_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_btrfs")]
    pub btrfs: String,

    #[serde(default = "default_ssh")]
    pub ssh: String,

    #[serde(default = "default_age")]
    pub age: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level used when no `-v` flag is given
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Per-invocation switches from the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Log what would run instead of running it
    pub dry_run: bool,

    /// Draw a transfer progress line on stderr
    pub progress: bool,

    /// Skip the policy and send full backups
    pub force_full: bool,
}

// Default values
fn default_max_age_days() -> u32 {
    7
}

fn default_keep_chains() -> usize {
    1
}

fn default_snapshot_prefix() -> String {
    DEFAULT_SNAPSHOT_PREFIX.to_string()
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/var/run/btrfs-backup.lock")
}

fn default_btrfs() -> String {
    "btrfs".to_string()
}

fn default_ssh() -> String {
    "ssh".to_string()
}

fn default_age() -> String {
    "age".to_string()
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            btrfs: default_btrfs(),
            ssh: default_ssh(),
            age: default_age(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::load(path, Self::environment())
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix("BTRFS_BACKUP")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn load(path: &Path, environment: config::Environment) -> Result<Self> {
        let file = config::File::from(path).required(true);
        // Files without an extension (e.g. /etc/btrfs-backup) are YAML.
        let file = if path.extension().is_none() {
            file.format(config::FileFormat::Yaml)
        } else {
            file
        };

        let config: Config = config::Config::builder()
            .add_source(file)
            .add_source(environment)
            .build()?
            .try_deserialize()?;

        config.normalized().validate()
    }

    /// Trim values that commonly carry stray whitespace from copy-paste.
    fn normalized(mut self) -> Self {
        self.encryption_key = self
            .encryption_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());
        self.remote_host = self.remote_host.trim().to_string();
        self
    }

    fn validate(self) -> Result<Self> {
        if self.remote_host.is_empty() {
            return Err(BackupError::Config("remote_host must be set".to_string()));
        }
        if self.remote_dest.trim().is_empty() {
            return Err(BackupError::Config("remote_dest must be set".to_string()));
        }
        if self.volumes.is_empty() {
            return Err(BackupError::Config("no volumes configured".to_string()));
        }

        let mut seen = HashSet::new();
        for volume in &self.volumes {
            if volume.name.is_empty()
                || volume.name.contains('/')
                || volume.name.chars().any(char::is_whitespace)
            {
                return Err(BackupError::Config(format!(
                    "invalid volume name {:?}",
                    volume.name
                )));
            }
            if !seen.insert(volume.name.as_str()) {
                return Err(BackupError::Config(format!(
                    "duplicate volume name {:?}",
                    volume.name
                )));
            }
        }

        for tool in [&self.tools.btrfs, &self.tools.ssh, &self.tools.age] {
            Tool::parse(tool)?;
        }

        Ok(self)
    }

    /// Plain or encrypted, from `encryption_key`.
    pub fn transmission_mode(&self) -> TransmissionMode {
        TransmissionMode::from_recipient(self.encryption_key.as_deref())
    }
}
