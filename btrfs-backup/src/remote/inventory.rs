//! Remote backup inventory.
//!
//! The remote directory listing is the only record of what has been backed up.
//! It is re-read for every decision and parsed with [`BackupNamePattern`];
//! anything that does not parse (other volumes, sidecars, temp files, garbage)
//! is ignored.

use super::RemoteShell;
use crate::naming::{BackupKind, BackupNamePattern, RemoteBackupEntry};
use crate::utils::errors::{BackupError, Result};
use chrono::NaiveDateTime;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A full backup and the incrementals that depend on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupChain<'a> {
    pub full: &'a RemoteBackupEntry,
    pub incrementals: Vec<&'a RemoteBackupEntry>,
}

impl<'a> BackupChain<'a> {
    /// Every entry of the chain, full first.
    pub fn entries(&self) -> impl Iterator<Item = &'a RemoteBackupEntry> + '_ {
        std::iter::once(self.full).chain(self.incrementals.iter().copied())
    }
}

/// Parse a raw `ls -1` listing into entries sorted by timestamp.
pub fn parse_listing(listing: &str, pattern: &BackupNamePattern) -> Vec<RemoteBackupEntry> {
    let mut backups: Vec<RemoteBackupEntry> = listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| pattern.parse(line))
        .collect();

    backups.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.name.cmp(&b.name)));
    backups
}

/// List the backups of one volume on the remote, oldest first.
///
/// A failed listing is an `Inventory` error, never an empty list: callers must
/// be able to tell "no backups" from "could not look".
pub async fn list_backups(
    remote: &RemoteShell,
    pattern: &BackupNamePattern,
    cancel: &CancellationToken,
) -> Result<Vec<RemoteBackupEntry>> {
    let remote_cmd = format!("cd {} && ls -1", super::shell_escape(remote.dest()));

    let listing = remote.output(&remote_cmd, cancel).await.map_err(|e| match e {
        BackupError::Cancelled => e,
        other => BackupError::Inventory(other.to_string()),
    })?;

    let backups = parse_listing(&listing, pattern);
    debug!(count = backups.len(), "Remote backups listed");
    Ok(backups)
}

/// Whether any entry carries exactly this timestamp.
pub fn has_timestamp(backups: &[RemoteBackupEntry], ts: &NaiveDateTime) -> bool {
    backups.iter().any(|b| b.timestamp == *ts)
}

/// The newest full backup, if any.
pub fn latest_full(backups: &[RemoteBackupEntry]) -> Option<&RemoteBackupEntry> {
    backups.iter().rev().find(|b| b.kind == BackupKind::Full)
}

/// Number of incrementals strictly newer than `since`.
pub fn count_incrementals_since(backups: &[RemoteBackupEntry], since: &NaiveDateTime) -> usize {
    backups
        .iter()
        .filter(|b| b.kind == BackupKind::Incremental && b.timestamp > *since)
        .count()
}

/// Group sorted entries into chains. Incrementals older than the first full
/// belong to no chain and are left out.
pub fn chains(backups: &[RemoteBackupEntry]) -> Vec<BackupChain<'_>> {
    let mut chains: Vec<BackupChain<'_>> = Vec::new();

    for entry in backups {
        match entry.kind {
            BackupKind::Full => chains.push(BackupChain {
                full: entry,
                incrementals: Vec::new(),
            }),
            BackupKind::Incremental => {
                if let Some(current) = chains.last_mut() {
                    current.incrementals.push(entry);
                }
            }
        }
    }

    chains
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::TransmissionMode;
    use crate::test_support::StubEnv;
    use chrono::NaiveDate;

    fn ts(d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn entry(kind: BackupKind, t: NaiveDateTime) -> RemoteBackupEntry {
        RemoteBackupEntry {
            name: format!("vol-{}.{}.btrfs", crate::naming::format_timestamp(&t), kind.as_str()),
            timestamp: t,
            kind,
        }
    }

    fn pattern(volume: &str) -> BackupNamePattern {
        BackupNamePattern::new(volume, &TransmissionMode::Plain).unwrap()
    }

    #[test]
    fn test_parse_listing_filters_and_sorts() {
        let listing = "\
testvol-2024-05-12_12-00-00.full.btrfs
testvol-2024-05-10_10-00-00.full.btrfs
testvol-2024-05-10_10-00-00.full.btrfs.sha256
othervol-2024-05-10_10-00-00.full.btrfs
testvol-invalid.btrfs

testvol-2024-05-11_11-00-00.inc.btrfs
testvol-2024-05-13_11-00-00.inc.btrfs.tmp
";
        let backups = parse_listing(listing, &pattern("testvol"));
        let names: Vec<&str> = backups.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "testvol-2024-05-10_10-00-00.full.btrfs",
                "testvol-2024-05-11_11-00-00.inc.btrfs",
                "testvol-2024-05-12_12-00-00.full.btrfs",
            ]
        );
        assert_eq!(backups[0].timestamp, ts(10, 10));
    }

    #[test]
    fn test_latest_full_and_counts() {
        let backups = vec![
            entry(BackupKind::Full, ts(1, 0)),
            entry(BackupKind::Incremental, ts(2, 0)),
            entry(BackupKind::Full, ts(3, 0)),
            entry(BackupKind::Incremental, ts(4, 0)),
            entry(BackupKind::Incremental, ts(5, 0)),
        ];

        assert_eq!(latest_full(&backups).unwrap().timestamp, ts(3, 0));
        assert_eq!(count_incrementals_since(&backups, &ts(3, 0)), 2);
        assert_eq!(count_incrementals_since(&backups, &ts(1, 0)), 3);
        assert!(has_timestamp(&backups, &ts(4, 0)));
        assert!(!has_timestamp(&backups, &ts(6, 0)));
    }

    #[test]
    fn test_latest_full_none() {
        let backups = vec![entry(BackupKind::Incremental, ts(2, 0))];
        assert!(latest_full(&backups).is_none());
        assert!(latest_full(&[]).is_none());
    }

    #[test]
    fn test_chains() {
        let backups = vec![
            entry(BackupKind::Incremental, ts(1, 0)),
            entry(BackupKind::Full, ts(2, 0)),
            entry(BackupKind::Incremental, ts(3, 0)),
            entry(BackupKind::Full, ts(4, 0)),
        ];

        let chains = chains(&backups);
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0].full.timestamp, ts(2, 0));
        assert_eq!(chains[0].incrementals.len(), 1);
        assert_eq!(chains[1].entries().count(), 1);
    }

    #[tokio::test]
    async fn test_list_backups_empty_directory() {
        let env = StubEnv::new();
        let backups = list_backups(&env.remote_shell(), &pattern("testvol"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(backups.is_empty());
    }

    #[tokio::test]
    async fn test_list_backups_with_files() {
        let env = StubEnv::new();
        for name in [
            "testvol-2024-05-10_10-00-00.full.btrfs",
            "testvol-2024-05-11_11-00-00.inc.btrfs",
            "testvol-2024-05-12_12-00-00.full.btrfs",
            "othervol-2024-05-10_10-00-00.full.btrfs",
            "testvol-invalid.btrfs",
        ] {
            env.touch_remote(name);
        }

        let backups = list_backups(&env.remote_shell(), &pattern("testvol"), &CancellationToken::new())
            .await
            .unwrap();

        let kinds: Vec<BackupKind> = backups.iter().map(|b| b.kind).collect();
        assert_eq!(
            kinds,
            vec![BackupKind::Full, BackupKind::Incremental, BackupKind::Full]
        );
        assert_eq!(backups[0].timestamp, ts(10, 10));
    }

    #[tokio::test]
    async fn test_list_backups_failure_is_inventory_error() {
        let env = StubEnv::new();
        env.set_flag("fail-ls");

        let err = list_backups(&env.remote_shell(), &pattern("testvol"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Inventory(_)), "{err}");
    }
}
