//! btrfs-backup library
//!
//! Incremental btrfs snapshot backups to a remote host over SSH, with
//! optional age encryption, end-to-end checksum verification and chain-based
//! retention.

pub mod config;
pub mod executor;
pub mod lock;
pub mod naming;
pub mod policy;
pub mod remote;
pub mod retention;
pub mod shutdown;
pub mod snapshot;
pub mod transfer;
pub mod utils;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{BackupError, Result};
