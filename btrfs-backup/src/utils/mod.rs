//! Utility modules for btrfs-backup.

pub mod errors;
pub mod logger;
pub mod process;

pub use errors::{BackupError, Result};
