//! Terminal spinner for interactive client runs.

use crate::logger::Logger;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Spinner that shows the running file count and throughput. With
/// `show_files` every completed file is printed above the spinner.
pub struct ProgressLogger {
    spinner: ProgressBar,
    start_time: Instant,
    files: AtomicU64,
    bytes: AtomicU64,
    show_files: bool,
}

impl ProgressLogger {
    pub fn new(show_files: bool) -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("  {spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        spinner.enable_steady_tick(Duration::from_millis(120));
        Self {
            spinner,
            start_time: Instant::now(),
            files: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            show_files,
        }
    }

    fn file_op(&self, op: &str, path: &str, bytes: u64) {
        let files = self.files.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if self.show_files {
            self.spinner.suspend(|| println!("  {:>8} {}", op, path));
        }
        self.spinner.set_message(status_line(files, total, self.start_time.elapsed()));
    }
}

fn status_line(files: u64, bytes: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    let throughput = if secs > 0.1 {
        format!(" @ {:.1} MB/s", bytes as f64 / secs / 1_048_576.0)
    } else {
        String::new()
    };
    format!(
        "{} files ({:.1} MB) in {:.1}s{}",
        files,
        bytes as f64 / 1_048_576.0,
        secs,
        throughput
    )
}

impl Logger for ProgressLogger {
    fn start(&self, direction: &str, local: &Path, remote: &str) {
        self.spinner
            .set_message(format!("{} {} <-> {}", direction, local.display(), remote));
    }
    fn file_sent(&self, path: &str, bytes: u64) {
        self.file_op("sent", path, bytes);
    }
    fn file_received(&self, path: &str, bytes: u64) {
        self.file_op("received", path, bytes);
    }
    fn delete(&self, path: &str) {
        if self.show_files {
            self.spinner.suspend(|| println!("  {:>8} {}", "deleted", path));
        }
    }
    fn conflict(&self, path: &str) {
        self.spinner.suspend(|| println!("  {:>8} {}", "CONFLICT", path));
    }
    fn error(&self, context: &str, path: &str, msg: &str) {
        self.spinner
            .suspend(|| eprintln!("  {:>8} {} ({}: {})", "failed", path, context, msg));
    }
    fn done(&self, files: u64, bytes: u64, seconds: f64) {
        self.spinner.finish_with_message(format!(
            "Completed {}",
            status_line(files, bytes, Duration::from_secs_f64(seconds.max(0.0)))
        ));
    }
}
