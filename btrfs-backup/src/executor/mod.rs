//! Backup run executor - Orchestrates one backup run over all volumes.
//!
//! Per volume, in order:
//! - Locate the previous local snapshot
//! - Decide full or incremental (or honor a forced full)
//! - Snapshot, send, verify and commit
//! - Prune remote chains that fell out of retention
//! - Drop the superseded local snapshot
//!
//! Volumes run one at a time and the first fatal error aborts the run.

use crate::config::{Config, RunOptions, Volume};
use crate::naming::{self, BackupKind, BackupNamePattern, RemoteBackupEntry};
use crate::policy::{self, Decision, FullReason, Thresholds};
use crate::retention::RetentionManager;
use crate::snapshot::SnapshotManager;
use crate::transfer::{SendRequest, TransferPipeline};
use crate::utils::errors::{BackupError, Result};
use crate::utils::process::Tool;
use chrono::{NaiveDateTime, Timelike};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Outcome for one volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeReport {
    pub volume: String,
    pub file_name: String,
    pub kind: BackupKind,
    /// Verified SHA-256 of the stored stream; empty in dry-run or when skipped
    pub digest: String,
    /// The target file already existed on the remote
    pub skipped: bool,
    /// Remote backups removed by retention
    pub deleted: Vec<String>,
}

/// Backup run result
#[derive(Debug)]
pub struct RunSummary {
    pub volumes: Vec<VolumeReport>,
    pub duration_secs: u64,
}

/// Main backup executor
pub struct BackupExecutor {
    config: Config,
    options: RunOptions,
    snapshots: SnapshotManager,
    transfer: TransferPipeline,
    retention: RetentionManager,
    cancel_token: CancellationToken,
}

impl BackupExecutor {
    /// Create a new backup executor (no cancellation support)
    pub fn new(config: Config, options: RunOptions) -> Result<Self> {
        Self::with_cancel(config, options, CancellationToken::new())
    }

    /// Create a new backup executor with cancellation support
    pub fn with_cancel(
        config: Config,
        options: RunOptions,
        cancel_token: CancellationToken,
    ) -> Result<Self> {
        let snapshots = SnapshotManager::new(
            Tool::parse(&config.tools.btrfs)?,
            config.snapshot_prefix.clone(),
            options.dry_run,
        );
        let transfer = TransferPipeline::from_config(&config, options)?;
        let retention = RetentionManager::new(config.keep_chains, options.dry_run);

        Ok(Self {
            config,
            options,
            snapshots,
            transfer,
            retention,
            cancel_token,
        })
    }

    fn thresholds(&self) -> Thresholds {
        Thresholds {
            max_age_days: self.config.max_age_days,
            max_incrementals: self.config.max_incrementals,
        }
    }

    /// Back up every configured volume, stamping all of them with `now`.
    pub async fn run(&self, now: NaiveDateTime) -> Result<RunSummary> {
        let start_time = Instant::now();
        // Names carry whole seconds only.
        let now = now.with_nanosecond(0).unwrap_or(now);

        if self.options.dry_run {
            info!("Dry run: no changes will be made");
        } else {
            self.preflight().await?;
        }

        let mut volumes = Vec::with_capacity(self.config.volumes.len());
        for volume in &self.config.volumes {
            if self.cancel_token.is_cancelled() {
                return Err(BackupError::Cancelled);
            }

            match self.backup_volume(volume, &now).await {
                Ok(report) => volumes.push(report),
                Err(e) => {
                    error!("Backup of volume {} failed: {}", volume.name, e);
                    return Err(e);
                }
            }
        }

        Ok(RunSummary {
            volumes,
            duration_secs: start_time.elapsed().as_secs(),
        })
    }

    /// Check every source volume, then the remote, before touching anything.
    async fn preflight(&self) -> Result<()> {
        for volume in &self.config.volumes {
            self.snapshots
                .check_access(&volume.src, &self.cancel_token)
                .await?;
        }

        self.transfer.remote().check_access(&self.cancel_token).await
    }

    async fn backup_volume(&self, volume: &Volume, now: &NaiveDateTime) -> Result<VolumeReport> {
        let cancel = &self.cancel_token;

        info!(
            "Processing volume: {} (src: {}, snapdir: {})",
            volume.name,
            volume.src.display(),
            volume.snap_dir.display()
        );

        let old_snap = self.snapshots.latest_snapshot(&volume.snap_dir);
        if let Some(old) = &old_snap {
            info!("Found previous snapshot: {}", old.display());
        }

        let pattern = BackupNamePattern::new(&volume.name, self.transfer.mode())?;

        let decision = if self.options.force_full {
            info!("Forcing full backup for {}", volume.name);
            Decision::Full(FullReason::Forced)
        } else {
            policy::needs_full_backup(
                old_snap.as_deref(),
                self.transfer.remote(),
                &pattern,
                now,
                self.thresholds(),
                cancel,
            )
            .await?
        };

        let kind = if decision.is_full() {
            BackupKind::Full
        } else {
            BackupKind::Incremental
        };
        info!("Doing {} backup for {}", kind, volume.name);

        let file_name = naming::backup_file_name(&volume.name, now, kind, self.transfer.mode());

        if self.transfer.remote_backup_exists(&file_name, cancel).await {
            warn!(
                "Backup file {} already exists on remote, skipping volume {}",
                file_name, volume.name
            );
            return Ok(VolumeReport {
                volume: volume.name.clone(),
                file_name,
                kind,
                digest: String::new(),
                skipped: true,
                deleted: Vec::new(),
            });
        }

        let new_snap = self
            .snapshots
            .create_snapshot(&volume.src, &volume.snap_dir, now, cancel)
            .await?;

        let request = SendRequest {
            snapshot: &new_snap,
            parent: decision.parent(),
            file_name: &file_name,
        };
        let digest = self.transfer.send_snapshot(&request, cancel).await?;
        self.transfer.move_tmp_file(&file_name, &digest, cancel).await?;

        if !digest.is_empty() {
            info!("SHA256: {}", digest);
        }

        let pending = self.options.dry_run.then(|| RemoteBackupEntry {
            name: file_name.clone(),
            timestamp: *now,
            kind,
        });

        let deleted = match self
            .retention
            .cleanup_old_backups(self.transfer.remote(), &pattern, &volume.name, pending, cancel)
            .await
        {
            Ok(deleted) => deleted,
            Err(e) if !e.is_fatal() => {
                warn!("Error cleaning up old backups: {}", e);
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        if let Some(old) = &old_snap {
            if *old != new_snap {
                self.snapshots.delete_snapshot(old, cancel).await;
            }
        }

        info!("Finished processing: {}", volume.name);

        Ok(VolumeReport {
            volume: volume.name.clone(),
            file_name,
            kind,
            digest,
            skipped: false,
            deleted,
        })
    }
}
