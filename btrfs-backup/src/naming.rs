//! Snapshot and backup file naming.
//!
//! Local snapshots are named `<prefix>-YYYY-MM-DD_HH-MM-SS`; remote backups are
//! named `<volume>-YYYY-MM-DD_HH-MM-SS.<full|inc><suffix>`. The timestamp is the
//! join key between a local snapshot and its remote backup, and the filename is
//! the only identity a remote backup has, so parsing rejects anything that does
//! not match exactly.

use crate::utils::errors::{BackupError, Result};
use chrono::NaiveDateTime;
use regex::Regex;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

/// Fixed-width, lexicographically sortable timestamp format.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Default prefix of local snapshot directory names.
pub const DEFAULT_SNAPSHOT_PREFIX: &str = "btrfs-backup";

/// Suffix of the checksum sidecar written next to each backup.
pub const CHECKSUM_SUFFIX: &str = ".sha256";

/// Suffix of the in-flight file a transfer writes before commit.
pub const TEMP_SUFFIX: &str = ".tmp";

const RAW_SUFFIX: &str = ".btrfs";
const ENCRYPTED_SUFFIX: &str = ".btrfs.age";

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .map_err(|e| BackupError::Naming(format!("invalid timestamp {s:?}: {e}")))
}

/// Directory name of a local snapshot taken at `ts`.
pub fn snapshot_name(prefix: &str, ts: &NaiveDateTime) -> String {
    format!("{}-{}", prefix, format_timestamp(ts))
}

fn timestamp_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d{4}-\d{2}-\d{2}_\d{2}-\d{2}-\d{2})").expect("static regex is valid")
    })
}

/// Extract the timestamp embedded in a snapshot path's final component.
pub fn extract_snapshot_timestamp(path: &Path) -> Result<NaiveDateTime> {
    let base = path
        .file_name()
        .map(|name| name.to_string_lossy())
        .ok_or_else(|| BackupError::Naming(format!("{} has no file name", path.display())))?;

    let found = timestamp_regex()
        .find(&base)
        .ok_or_else(|| BackupError::Naming(format!("no timestamp in snapshot name {base:?}")))?;

    parse_timestamp(found.as_str())
}

/// Kind of a remote backup file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    Full,
    Incremental,
}

impl BackupKind {
    /// The tag used in file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "inc",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "full" => Some(BackupKind::Full),
            "inc" => Some(BackupKind::Incremental),
            _ => None,
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupKind::Full => f.write_str("full"),
            BackupKind::Incremental => f.write_str("incremental"),
        }
    }
}

/// How the send stream travels to the remote: as-is, or through `age`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransmissionMode {
    Plain,
    Encrypted { recipient: String },
}

impl TransmissionMode {
    /// An empty or blank recipient means plain transmission.
    pub fn from_recipient(recipient: Option<&str>) -> Self {
        match recipient.map(str::trim) {
            Some(r) if !r.is_empty() => TransmissionMode::Encrypted {
                recipient: r.to_string(),
            },
            _ => TransmissionMode::Plain,
        }
    }

    pub fn file_suffix(&self) -> &'static str {
        match self {
            TransmissionMode::Plain => RAW_SUFFIX,
            TransmissionMode::Encrypted { .. } => ENCRYPTED_SUFFIX,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TransmissionMode::Plain => "plain",
            TransmissionMode::Encrypted { .. } => "age encrypt",
        }
    }
}

/// Final remote file name of a backup.
pub fn backup_file_name(volume: &str, ts: &NaiveDateTime, kind: BackupKind, mode: &TransmissionMode) -> String {
    format!(
        "{}-{}.{}{}",
        volume,
        format_timestamp(ts),
        kind.as_str(),
        mode.file_suffix()
    )
}

/// A parsed remote backup file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBackupEntry {
    pub name: String,
    pub timestamp: NaiveDateTime,
    pub kind: BackupKind,
}

/// Filename grammar for one volume and one transmission mode.
#[derive(Debug, Clone)]
pub struct BackupNamePattern {
    re: Regex,
}

impl BackupNamePattern {
    pub fn new(volume: &str, mode: &TransmissionMode) -> Result<Self> {
        let pattern = format!(
            r"^{}-(\d{{4}}-\d{{2}}-\d{{2}}_\d{{2}}-\d{{2}}-\d{{2}})\.(full|inc){}$",
            regex::escape(volume),
            regex::escape(mode.file_suffix())
        );
        let re = Regex::new(&pattern)
            .map_err(|e| BackupError::Naming(format!("bad pattern for volume {volume:?}: {e}")))?;
        Ok(Self { re })
    }

    /// Parse a file name, or `None` if it does not belong to this volume and mode.
    pub fn parse(&self, name: &str) -> Option<RemoteBackupEntry> {
        let caps = self.re.captures(name)?;
        let timestamp = parse_timestamp(caps.get(1)?.as_str()).ok()?;
        let kind = BackupKind::from_tag(caps.get(2)?.as_str())?;

        Some(RemoteBackupEntry {
            name: name.to_string(),
            timestamp,
            kind,
        })
    }
}
