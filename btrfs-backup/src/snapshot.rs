//! Local read-only snapshots.
//!
//! At most one snapshot per volume is kept locally: the one the next
//! incremental is diffed against. It is replaced only after the backup that
//! superseded it has been committed on the remote.

use crate::naming;
use crate::utils::errors::{BackupError, Result};
use crate::utils::process::{self, Tool};
use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct SnapshotManager {
    btrfs: Tool,
    prefix: String,
    dry_run: bool,
}

impl SnapshotManager {
    pub fn new(btrfs: Tool, prefix: impl Into<String>, dry_run: bool) -> Self {
        Self {
            btrfs,
            prefix: prefix.into(),
            dry_run,
        }
    }

    /// The newest snapshot in `snap_dir`, or `None` if there is none.
    ///
    /// Names embed a fixed-width timestamp, so the lexicographically greatest
    /// directory name is the most recent. A missing directory means no
    /// snapshot yet.
    pub fn latest_snapshot(&self, snap_dir: &Path) -> Option<PathBuf> {
        let entries = std::fs::read_dir(snap_dir).ok()?;

        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|entry| entry.file_name())
            .max()
            .map(|name| snap_dir.join(name))
    }

    /// Take a read-only snapshot of `src` named after `now`.
    pub async fn create_snapshot(
        &self,
        src: &Path,
        snap_dir: &Path,
        now: &NaiveDateTime,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let path = snap_dir.join(naming::snapshot_name(&self.prefix, now));

        let mut cmd = self.btrfs.command();
        cmd.args(["subvolume", "snapshot", "-r"]).arg(src).arg(&path);

        if self.dry_run {
            debug!("[DRY-RUN] {}", process::render(&cmd));
            return Ok(path);
        }

        tokio::fs::create_dir_all(snap_dir).await?;
        process::run(cmd, "btrfs subvolume snapshot", cancel).await?;

        info!("Created snapshot {}", path.display());
        Ok(path)
    }

    /// Delete a snapshot. Failure is logged, never returned: a leftover
    /// snapshot wastes space but does not break the backup chain.
    pub async fn delete_snapshot(&self, path: &Path, cancel: &CancellationToken) {
        let mut cmd = self.btrfs.command();
        cmd.args(["subvolume", "delete"]).arg(path);

        info!("Deleting old local snapshot: {}", path.display());

        if self.dry_run {
            debug!("[DRY-RUN] {}", process::render(&cmd));
            return;
        }

        if let Err(e) = process::run(cmd, "btrfs subvolume delete", cancel).await {
            error!("Error deleting old snapshot {}: {}", path.display(), e);
        }
    }

    /// Make sure `src` is a btrfs subvolume we can read.
    pub async fn check_access(&self, src: &Path, cancel: &CancellationToken) -> Result<()> {
        let mut cmd = self.btrfs.command();
        cmd.args(["subvolume", "list"]).arg(src);

        process::run(cmd, "btrfs subvolume list", cancel)
            .await
            .map_err(|e| match e {
                BackupError::Cancelled => e,
                other => BackupError::Access(format!(
                    "error accessing btrfs subvolume at {}: {}",
                    src.display(),
                    other
                )),
            })
    }
}
