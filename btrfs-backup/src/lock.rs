//! Single-instance guard.
//!
//! An exclusive, non-blocking `flock` on the lock file. The lock lives as
//! long as the returned [`InstanceLock`] and is released by the kernel when
//! the process exits, whatever the outcome of the run.

use crate::utils::errors::{BackupError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct InstanceLock {
    _flock: Flock<File>,
    path: PathBuf,
}

impl InstanceLock {
    /// Take the lock, failing immediately if another run holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| {
                BackupError::Lock(format!("cannot open lock file {}: {}", path.display(), e))
            })?;

        let flock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            if errno == Errno::EWOULDBLOCK {
                BackupError::Lock(format!(
                    "another instance is already running (lock file {})",
                    path.display()
                ))
            } else {
                BackupError::Lock(format!("cannot lock {}: {}", path.display(), errno))
            }
        })?;

        debug!(path = %path.display(), "Instance lock acquired");
        Ok(Self {
            _flock: flock,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_fails_while_held() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("btrfs-backup.lock");

        let held = InstanceLock::acquire(&path).unwrap();
        assert_eq!(held.path(), path.as_path());

        let err = InstanceLock::acquire(&path).err().unwrap();
        assert!(matches!(err, BackupError::Lock(_)));
        assert!(err.to_string().contains("already running"), "{err}");
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("btrfs-backup.lock");

        drop(InstanceLock::acquire(&path).unwrap());
        assert!(InstanceLock::acquire(&path).is_ok());
    }

    #[test]
    fn test_unopenable_lock_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing/dir/btrfs-backup.lock");

        assert!(matches!(
            InstanceLock::acquire(&path),
            Err(BackupError::Lock(_))
        ));
    }
}
