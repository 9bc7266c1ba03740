use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the stderr `tracing` subscriber. `RUST_LOG` overrides `default_level`.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

/// Per-job signals. Every hook defaults to doing nothing.
pub trait Logger: Send + Sync {
    fn start(&self, _direction: &str, _local: &Path, _remote: &str) {}
    fn file_sent(&self, _path: &str, _bytes: u64) {}
    fn file_received(&self, _path: &str, _bytes: u64) {}
    fn delete(&self, _path: &str) {}
    fn conflict(&self, _path: &str) {}
    fn error(&self, _context: &str, _path: &str, _msg: &str) {}
    fn done(&self, _files: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Logger for TextLogger {
    fn start(&self, direction: &str, local: &Path, remote: &str) {
        self.line(&format!("START {} local={} remote={}", direction, local.display(), remote));
    }
    fn file_sent(&self, path: &str, bytes: u64) {
        self.line(&format!("SENT path={} bytes={}", path, bytes));
    }
    fn file_received(&self, path: &str, bytes: u64) {
        self.line(&format!("RECEIVED path={} bytes={}", path, bytes));
    }
    fn delete(&self, path: &str) {
        self.line(&format!("DELETE path={}", path));
    }
    fn conflict(&self, path: &str) {
        self.line(&format!("CONFLICT path={}", path));
    }
    fn error(&self, context: &str, path: &str, msg: &str) {
        self.line(&format!("ERROR ctx={} path={} msg={}", context, path, msg));
    }
    fn done(&self, files: u64, bytes: u64, seconds: f64) {
        self.line(&format!("DONE files={files} bytes={bytes} seconds={seconds:.3}"));
    }
}

/// Fans every signal out to several loggers.
pub struct Tee(pub Vec<Box<dyn Logger>>);

impl Logger for Tee {
    fn start(&self, direction: &str, local: &Path, remote: &str) {
        self.0.iter().for_each(|l| l.start(direction, local, remote));
    }
    fn file_sent(&self, path: &str, bytes: u64) {
        self.0.iter().for_each(|l| l.file_sent(path, bytes));
    }
    fn file_received(&self, path: &str, bytes: u64) {
        self.0.iter().for_each(|l| l.file_received(path, bytes));
    }
    fn delete(&self, path: &str) {
        self.0.iter().for_each(|l| l.delete(path));
    }
    fn conflict(&self, path: &str) {
        self.0.iter().for_each(|l| l.conflict(path));
    }
    fn error(&self, context: &str, path: &str, msg: &str) {
        self.0.iter().for_each(|l| l.error(context, path, msg));
    }
    fn done(&self, files: u64, bytes: u64, seconds: f64) {
        self.0.iter().for_each(|l| l.done(files, bytes, seconds));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_logger_appends_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("logs/job.log");
        let log = TextLogger::new(&path).unwrap();
        log.start("backup", Path::new("/src"), "vault://h/docs");
        log.file_sent("a.txt", 3);
        log.conflict("b.txt");
        log.done(1, 3, 0.5);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].ends_with("SENT path=a.txt bytes=3"));
        assert!(lines[2].ends_with("CONFLICT path=b.txt"));
        assert!(lines[3].contains("seconds=0.500"));
    }
}
