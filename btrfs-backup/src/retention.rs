//! Remote retention.
//!
//! Retention works on chain boundaries: the newest `keep_chains` chains are
//! kept whole, everything older than the full that starts the oldest kept
//! chain is deleted together with its checksum sidecar.

use crate::naming::{BackupNamePattern, RemoteBackupEntry, CHECKSUM_SUFFIX};
use crate::remote::{self, inventory, RemoteShell};
use crate::utils::errors::{BackupError, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Entries that fall outside the newest `keep_chains` chains.
///
/// `backups` must be sorted by timestamp. Without any full backup nothing is
/// selected. A `keep_chains` of zero is treated as one.
pub fn select_for_deletion(
    backups: &[RemoteBackupEntry],
    keep_chains: usize,
) -> Vec<&RemoteBackupEntry> {
    let keep = keep_chains.max(1);
    let chains = inventory::chains(backups);

    let Some(first_kept) = chains.get(chains.len().saturating_sub(keep)) else {
        return Vec::new();
    };
    let cutoff = first_kept.full.timestamp;

    backups.iter().filter(|b| b.timestamp < cutoff).collect()
}

pub struct RetentionManager {
    keep_chains: usize,
    dry_run: bool,
}

impl RetentionManager {
    pub fn new(keep_chains: usize, dry_run: bool) -> Self {
        Self {
            keep_chains: keep_chains.max(1),
            dry_run,
        }
    }

    /// Delete backups of one volume that fell out of retention and return
    /// their names.
    ///
    /// In dry-run the backup that would have just been created is passed as
    /// `pending`, since it is not on the remote. Every failure except
    /// cancellation is a `Retention` error.
    pub async fn cleanup_old_backups(
        &self,
        remote: &RemoteShell,
        pattern: &BackupNamePattern,
        volume: &str,
        pending: Option<RemoteBackupEntry>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let mut backups = inventory::list_backups(remote, pattern, cancel)
            .await
            .map_err(|e| match e {
                BackupError::Cancelled => e,
                other => BackupError::Retention(format!("failed to list remote backups: {other}")),
            })?;

        if self.dry_run {
            if let Some(pending) = pending {
                if !backups.iter().any(|b| b.name == pending.name) {
                    backups.push(pending);
                    backups.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.name.cmp(&b.name)));
                }
            }
        }

        let doomed: Vec<String> = select_for_deletion(&backups, self.keep_chains)
            .into_iter()
            .map(|b| b.name.clone())
            .collect();

        if doomed.is_empty() {
            debug!(volume = %volume, "Nothing to clean up");
            return Ok(doomed);
        }

        info!(
            "Cleaning up {} old backup(s) for {} (keeping latest {} full chain(s))",
            doomed.len(),
            volume,
            self.keep_chains
        );
        for name in &doomed {
            info!("Deleting: {}", name);
        }

        let targets: Vec<String> = doomed
            .iter()
            .flat_map(|name| [name.clone(), format!("{name}{CHECKSUM_SUFFIX}")])
            .collect();

        if self.dry_run {
            debug!(
                "[DRY-RUN] {}",
                remote.render(&remote::remove_command(remote, &targets))
            );
            return Ok(doomed);
        }

        remote
            .remove_files(&targets, cancel)
            .await
            .map_err(|e| match e {
                BackupError::Cancelled => e,
                other => BackupError::Retention(format!("failed to delete old backups: {other}")),
            })?;

        Ok(doomed)
    }
}
