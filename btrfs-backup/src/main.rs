//! btrfs-backup - Main entry point
//!
//! One backup run over every configured volume, then exit.

use anyhow::{Context, Result};
use btrfs_backup::config::{Config, RunOptions, DEFAULT_CONFIG_PATH};
use btrfs_backup::executor::BackupExecutor;
use btrfs_backup::lock::InstanceLock;
use btrfs_backup::shutdown::ShutdownCoordinator;
use btrfs_backup::utils;
use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Verbose output (-v info, -vv debug including dry-run commands)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Dry run: log what would be done without changing anything
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Force full backups
    #[arg(short, long)]
    force: bool,

    /// Show transfer progress
    #[arg(short, long)]
    progress: bool,

    /// Log level (trace, debug, info, warn, error); overrides -v
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::from_file(&args.config)
        .with_context(|| format!("Error loading config {}", args.config.display()))?;

    // Initialize logging
    let log_level = utils::logger::resolve_level(
        args.log_level.as_deref(),
        args.verbose,
        args.dry_run,
        &config.log.level,
    );
    utils::logger::init(&log_level)?;

    let lock = InstanceLock::acquire(&config.lock_file)?;

    tracing::info!(
        "Starting btrfs-backup v{} ({} volume(s) → {}:{})",
        env!("CARGO_PKG_VERSION"),
        config.volumes.len(),
        config.remote_host,
        config.remote_dest
    );

    let options = RunOptions {
        dry_run: args.dry_run,
        progress: args.progress,
        force_full: args.force,
    };

    // Signals cancel the run; every child process is killed with it
    let shutdown_coordinator = ShutdownCoordinator::new();
    let signal_handle = {
        let coordinator = shutdown_coordinator.clone();
        tokio::spawn(async move { coordinator.wait_for_signal().await })
    };

    let executor = BackupExecutor::with_cancel(config, options, shutdown_coordinator.token())?;
    let result = executor.run(chrono::Local::now().naive_local()).await;

    signal_handle.abort();

    match result {
        Ok(summary) => {
            for report in &summary.volumes {
                if report.skipped {
                    tracing::warn!("{}: skipped, {} already exists", report.volume, report.file_name);
                } else {
                    tracing::info!(
                        "{}: {} backup {} done ({} old backup(s) removed)",
                        report.volume,
                        report.kind,
                        report.file_name,
                        report.deleted.len()
                    );
                }
            }
            tracing::info!("Backup run complete in {}s", summary.duration_secs);
            Ok(())
        }
        Err(e) => {
            tracing::error!("Backup run aborted: {}", e);
            drop(lock);
            std::process::exit(1);
        }
    }
}
