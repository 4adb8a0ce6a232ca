//! Byte-level progress reporting for snapshot transfers.
//!
//! A send stream has no known length, so progress is bytes moved, current
//! speed and elapsed time. The forwarding path bumps a shared counter; a
//! background task samples it once per second and redraws one stderr line.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// One sample of a running transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    /// Bytes forwarded so far
    pub transferred_bytes: u64,

    /// Bytes per second since the previous sample
    pub bytes_per_second: u64,

    /// Whole seconds since the transfer started
    pub elapsed_seconds: u64,
}

impl TransferProgress {
    /// Status column: speed, or why there is none.
    pub fn status(&self) -> String {
        if self.bytes_per_second > 0 {
            format_speed(self.bytes_per_second)
        } else if self.transferred_bytes > 0 {
            "stalled".to_string()
        } else {
            "waiting...".to_string()
        }
    }
}

/// Progress tracker with time-based speed calculation
pub struct ProgressTracker {
    start_time: Instant,
    last_update_time: Instant,
    last_bytes: u64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            last_update_time: now,
            last_bytes: 0,
        }
    }

    /// Take a sample at the current byte count.
    pub fn update(&mut self, transferred_bytes: u64) -> TransferProgress {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update_time).as_secs_f64();

        let bytes_per_second = if elapsed > 0.0 {
            let bytes_diff = transferred_bytes.saturating_sub(self.last_bytes);
            (bytes_diff as f64 / elapsed) as u64
        } else {
            0
        };

        self.last_update_time = now;
        self.last_bytes = transferred_bytes;

        TransferProgress {
            transferred_bytes,
            bytes_per_second,
            elapsed_seconds: self.elapsed().as_secs(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average speed since start
    pub fn average_speed(&self, transferred_bytes: u64) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (transferred_bytes as f64 / elapsed) as u64
        } else {
            0
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Redraws a progress line on stderr until finished.
pub struct ProgressReporter {
    label: String,
    counter: Arc<AtomicU64>,
    stop: CancellationToken,
    handle: JoinHandle<ProgressTracker>,
}

impl ProgressReporter {
    /// Start sampling `counter` in the background.
    pub fn start(label: impl Into<String>, counter: Arc<AtomicU64>) -> Self {
        let label = label.into();
        let stop = CancellationToken::new();

        let handle = {
            let label = label.clone();
            let counter = Arc::clone(&counter);
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut tracker = ProgressTracker::new();
                let mut ticker = tokio::time::interval(UPDATE_INTERVAL);
                // The first tick completes immediately.
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let progress = tracker.update(counter.load(Ordering::Relaxed));
                            redraw(&format!(
                                "→ {}: {} transferred, {}, {} elapsed",
                                label,
                                format_bytes(progress.transferred_bytes),
                                progress.status(),
                                format_duration(progress.elapsed_seconds),
                            ));
                        }
                        _ = stop.cancelled() => break,
                    }
                }

                tracker
            })
        };

        Self {
            label,
            counter,
            stop,
            handle,
        }
    }

    /// Stop the reporter and print the final summary line.
    pub async fn finish(self) {
        self.stop.cancel();
        let Ok(tracker) = self.handle.await else {
            return;
        };

        let total = self.counter.load(Ordering::Relaxed);
        redraw(&format!(
            "→ {}: {} transferred, {} average, {} total\n",
            self.label,
            format_bytes(total),
            format_speed(tracker.average_speed(total)),
            format_duration(tracker.elapsed().as_secs()),
        ));
    }

    /// Stop the reporter without a summary, clearing the line.
    pub async fn abandon(self) {
        self.stop.cancel();
        let _ = self.handle.await;
        redraw("");
    }
}

fn redraw(line: &str) {
    let mut stderr = std::io::stderr().lock();
    let _ = write!(stderr, "\r\x1b[K{line}");
    let _ = stderr.flush();
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_progress_tracker() {
        let mut tracker = ProgressTracker::new();

        let prog = tracker.update(100);
        assert_eq!(prog.transferred_bytes, 100);

        thread::sleep(Duration::from_millis(100));
        let prog = tracker.update(500);
        assert_eq!(prog.transferred_bytes, 500);
        assert!(prog.bytes_per_second > 0);
    }

    #[test]
    fn test_status() {
        let mut progress = TransferProgress {
            transferred_bytes: 0,
            bytes_per_second: 0,
            elapsed_seconds: 3,
        };
        assert_eq!(progress.status(), "waiting...");

        progress.transferred_bytes = 2048;
        assert_eq!(progress.status(), "stalled");

        progress.bytes_per_second = 1024;
        assert_eq!(progress.status(), "1.00 KB/s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(1024), "1.00 KB/s");
        assert_eq!(format_speed(1024 * 1024), "1.00 MB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3665), "1h 1m");
    }

    #[tokio::test]
    async fn test_reporter_finishes() {
        let counter = Arc::new(AtomicU64::new(0));
        let reporter = ProgressReporter::start("Transfer", Arc::clone(&counter));
        counter.fetch_add(4096, Ordering::Relaxed);
        reporter.finish().await;
    }
}
