//! Terminal progress bar for a single upload

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Instant;

pub struct TransferBar {
    bar: ProgressBar,
    start_time: Instant,
}

impl TransferBar {
    pub fn new(total: u64, label: &str) -> Self {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.set_message(label.to_string());
        Self {
            bar,
            start_time: Instant::now(),
        }
    }

    /// A bar that draws nothing (`--quiet`).
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
            start_time: Instant::now(),
        }
    }

    pub fn set_position(&self, bytes: u64) {
        self.bar.set_position(bytes);
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    pub fn finish_success(&self, bytes: u64) {
        let secs = self.elapsed_secs();
        let throughput = if secs > 0.0 {
            bytes as f64 / secs / 1_048_576.0
        } else {
            0.0
        };
        self.bar.set_position(bytes);
        self.bar.finish_with_message(format!(
            "Uploaded {:.1} MB in {:.1}s ({:.1} MB/s)",
            bytes as f64 / 1_048_576.0,
            secs,
            throughput
        ));
    }

    pub fn finish_error(&self, msg: &str) {
        self.bar.abandon_with_message(format!("Failed: {}", msg));
    }
}
