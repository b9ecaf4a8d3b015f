use std::time::Instant;
use tokio::sync::mpsc;

use super::constants::PROGRESS_INTERVAL;
use crate::AppEvent;

/// Throttled progress reporting for one transfer.
pub struct ProgressReporter {
    event_tx: mpsc::Sender<AppEvent>,
    file_name: String,
    total_bytes: u64,
    start_time: Instant,
    last_reported: u64,
    is_sending: bool,
}

impl ProgressReporter {
    pub fn new(
        event_tx: mpsc::Sender<AppEvent>,
        file_name: &str,
        total_bytes: u64,
        is_sending: bool,
    ) -> Self {
        Self {
            event_tx,
            file_name: file_name.to_string(),
            total_bytes,
            start_time: Instant::now(),
            last_reported: 0,
            is_sending,
        }
    }

    /// Report `bytes_done` if enough has moved since the last report, or if
    /// the transfer is complete.
    pub async fn update(&mut self, bytes_done: u64) {
        let complete = bytes_done >= self.total_bytes;
        if !complete && bytes_done.saturating_sub(self.last_reported) < PROGRESS_INTERVAL {
            return;
        }
        self.last_reported = bytes_done;

        let progress = if self.total_bytes == 0 {
            100.0
        } else {
            (bytes_done as f32 / self.total_bytes as f32) * 100.0
        };
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let speed_bps = if elapsed > 0.0 {
            bytes_done as f64 / elapsed
        } else {
            0.0
        };

        let _ = self
            .event_tx
            .send(AppEvent::TransferProgress {
                file_name: self.file_name.clone(),
                progress,
                speed: format_transfer_speed(bytes_done, elapsed),
                speed_bps,
                is_sending: self.is_sending,
            })
            .await;
    }
}

/// Format transfer speed from bytes and elapsed time
pub fn format_transfer_speed(bytes_transferred: u64, elapsed_secs: f64) -> String {
    if elapsed_secs <= 0.0 {
        return "Starting...".to_string();
    }

    let speed_bps = bytes_transferred as f64 / elapsed_secs;
    if speed_bps > 1_000_000.0 {
        format!("{:.2} MB/s", speed_bps / 1_000_000.0)
    } else if speed_bps > 1_000.0 {
        format!("{:.1} KB/s", speed_bps / 1_000.0)
    } else {
        format!("{:.0} B/s", speed_bps)
    }
}
