//! Custom error types for btrfs-backup.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A source volume or the remote host cannot be reached.
    #[error("Access error: {0}")]
    Access(String),

    /// An external tool failed to start or exited non-zero.
    #[error("{0}")]
    ToolExecution(String),

    #[error("Checksum mismatch for {file}: local={local} remote={remote}")]
    Integrity {
        file: String,
        local: String,
        remote: String,
    },

    #[error("Listing remote backups failed: {0}")]
    Inventory(String),

    #[error("Cleanup of old backups failed: {0}")]
    Retention(String),

    #[error("Invalid name: {0}")]
    Naming(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl BackupError {
    /// Whether this error should stop the whole run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BackupError::Retention(_))
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
