//! Full versus incremental decision.
//!
//! An incremental is only safe when the remote provably holds the backup of
//! the local snapshot it will be diffed against. Every rule that cannot
//! establish that falls back to a full backup.

use crate::naming::{self, BackupNamePattern, RemoteBackupEntry};
use crate::remote::inventory;
use crate::remote::RemoteShell;
use crate::utils::errors::{BackupError, Result};
use chrono::{Duration, NaiveDateTime};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Limits after which a new chain is started. Zero disables a limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Thresholds {
    pub max_age_days: u32,
    pub max_incrementals: u32,
}

/// Why a full backup was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FullReason {
    NoLocalSnapshot,
    InventoryUnavailable(String),
    EmptyInventory,
    UnparsableSnapshotName(String),
    Gap(NaiveDateTime),
    NoRemoteFull,
    MaxAge { days: u32 },
    MaxIncrementals { count: usize, limit: u32 },
    Forced,
}

impl fmt::Display for FullReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FullReason::NoLocalSnapshot => write!(f, "no local snapshot to diff against"),
            FullReason::InventoryUnavailable(e) => write!(f, "remote backups unavailable: {e}"),
            FullReason::EmptyInventory => write!(f, "remote target has no backups"),
            FullReason::UnparsableSnapshotName(e) => write!(f, "local snapshot name unusable: {e}"),
            FullReason::Gap(ts) => write!(
                f,
                "remote target missing backup for snapshot {}",
                naming::format_timestamp(ts)
            ),
            FullReason::NoRemoteFull => write!(f, "remote target missing full backup"),
            FullReason::MaxAge { days } => {
                write!(f, "last remote full backup is older than {days} days")
            }
            FullReason::MaxIncrementals { count, limit } => write!(
                f,
                "remote has {count} incrementals since last full (limit {limit})"
            ),
            FullReason::Forced => write!(f, "full backup forced"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Full(FullReason),
    Incremental { parent: PathBuf },
}

impl Decision {
    pub fn is_full(&self) -> bool {
        matches!(self, Decision::Full(_))
    }

    /// The snapshot an incremental is diffed against.
    pub fn parent(&self) -> Option<&Path> {
        match self {
            Decision::Full(_) => None,
            Decision::Incremental { parent } => Some(parent),
        }
    }
}

/// Apply the rules to an already fetched inventory.
///
/// `listing` is the listing outcome, not a list: a failed listing must be
/// distinguishable from an empty one.
pub fn evaluate(
    local: Option<&Path>,
    listing: std::result::Result<&[RemoteBackupEntry], &BackupError>,
    now: &NaiveDateTime,
    thresholds: Thresholds,
) -> Decision {
    let Some(local) = local else {
        return Decision::Full(FullReason::NoLocalSnapshot);
    };

    let backups = match listing {
        Ok(backups) => backups,
        Err(e) => return Decision::Full(FullReason::InventoryUnavailable(e.to_string())),
    };

    if backups.is_empty() {
        return Decision::Full(FullReason::EmptyInventory);
    }

    let local_ts = match naming::extract_snapshot_timestamp(local) {
        Ok(ts) => ts,
        Err(e) => return Decision::Full(FullReason::UnparsableSnapshotName(e.to_string())),
    };

    if !inventory::has_timestamp(backups, &local_ts) {
        return Decision::Full(FullReason::Gap(local_ts));
    }

    let Some(last_full) = inventory::latest_full(backups) else {
        return Decision::Full(FullReason::NoRemoteFull);
    };

    if thresholds.max_age_days > 0
        && *now - last_full.timestamp >= Duration::days(i64::from(thresholds.max_age_days))
    {
        return Decision::Full(FullReason::MaxAge {
            days: thresholds.max_age_days,
        });
    }

    if thresholds.max_incrementals > 0 {
        let count = inventory::count_incrementals_since(backups, &last_full.timestamp);
        if count >= thresholds.max_incrementals as usize {
            return Decision::Full(FullReason::MaxIncrementals {
                count,
                limit: thresholds.max_incrementals,
            });
        }
    }

    Decision::Incremental {
        parent: local.to_path_buf(),
    }
}

/// Decide how the next backup of a volume is sent.
///
/// The remote is only listed when a local snapshot exists. A failed listing
/// yields a full backup; only cancellation is returned as an error.
pub async fn needs_full_backup(
    local: Option<&Path>,
    remote: &RemoteShell,
    pattern: &BackupNamePattern,
    now: &NaiveDateTime,
    thresholds: Thresholds,
    cancel: &CancellationToken,
) -> Result<Decision> {
    if local.is_none() {
        return Ok(Decision::Full(FullReason::NoLocalSnapshot));
    }

    let listed = inventory::list_backups(remote, pattern, cancel).await;
    if let Err(BackupError::Cancelled) = listed {
        return Err(BackupError::Cancelled);
    }

    let decision = evaluate(local, listed.as_deref(), now, thresholds);
    match &decision {
        Decision::Full(reason @ FullReason::InventoryUnavailable(_)) => warn!("{}", reason),
        Decision::Full(reason) => info!("Full backup needed: {}", reason),
        Decision::Incremental { parent } => {
            info!("Incremental backup based on {}", parent.display())
        }
    }

    Ok(decision)
}
