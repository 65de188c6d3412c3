//! Decoupled service logging pipeline.
//!
//! Every `log::info!()`/`warn!()`/`error!()` call in the crate lands here once
//! `init_global_logger` has installed the collector.
//!
//! ```text
//! log::* macros
//!     |
//! [LogCollector] (non-blocking send)
//!     | (crossbeam unbounded channel)
//!     v
//! [persister thread] ---> <log_dir>/rpmforge_<ts>.log
//!                    \--> stderr (optional echo)
//! ```
//!
//! Build output of individual sessions does not go through here; see `broadcast`.

use chrono::Local;
use crossbeam_channel::{unbounded, Sender};
use log::{LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Internal log line or special marker
enum LogMessage {
    Line(LogLine),
    /// Flush marker; the persister answers once everything before it is on disk
    Flush(std::sync::mpsc::Sender<()>),
}

/// A log line with metadata
#[derive(Clone, Debug)]
pub struct LogLine {
    pub message: String,
    /// `HH:MM:SS.mmm` at creation
    pub timestamp: String,
}

impl LogLine {
    pub fn new(message: String) -> Self {
        LogLine {
            message,
            timestamp: Local::now().format("%H:%M:%S%.3f").to_string(),
        }
    }
}

/// Ensure the logs directory exists
pub fn ensure_logs_dir_exists(log_dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(log_dir)
        .map_err(|e| format!("Failed to create logs directory: {}", e))?;
    Ok(())
}

/// Service logger writing to a timestamped file under `log_dir`.
#[derive(Clone)]
pub struct LogCollector {
    tx: Sender<LogMessage>,
    log_path: PathBuf,
    level: LevelFilter,
}

impl LogCollector {
    /// Create the collector and its persister thread.
    pub fn new(log_dir: PathBuf, level: LevelFilter, echo_stderr: bool) -> Result<Self, String> {
        ensure_logs_dir_exists(&log_dir)?;

        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let log_path = log_dir.join(format!("rpmforge_{}.log", timestamp));
        let mut file: File = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| format!("Failed to open log file {}: {}", log_path.display(), e))?;

        let (tx, rx) = unbounded::<LogMessage>();

        // OS thread rather than a tokio task: records arrive from blocking
        // git2 callbacks and spawn_blocking workers as well as async tasks.
        std::thread::Builder::new()
            .name("rpmforge-log".to_string())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        LogMessage::Line(line) => {
                            let formatted = format!("[{}] {}\n", line.timestamp, line.message);
                            let _ = file.write_all(formatted.as_bytes());
                            if echo_stderr {
                                eprint!("{}", formatted);
                            }
                        }
                        LogMessage::Flush(done) => {
                            let _ = file.flush();
                            let _ = file.sync_data();
                            let _ = done.send(());
                        }
                    }
                }
                let _ = file.flush();
            })
            .map_err(|e| format!("Failed to spawn log persister thread: {}", e))?;

        Ok(LogCollector { tx, log_path, level })
    }

    /// Path of the file this collector appends to
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Send a log line (non-blocking)
    pub fn log_str(&self, message: impl Into<String>) {
        let _ = self.tx.send(LogMessage::Line(LogLine::new(message.into())));
    }

    /// Block until every line sent before this call has been written.
    pub fn flush_blocking(&self) -> Result<(), String> {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        self.tx
            .send(LogMessage::Flush(tx))
            .map_err(|e| format!("Failed to send flush marker: {}", e))?;
        rx.recv()
            .map_err(|e| format!("Flush signal interrupted: {}", e))
    }

    /// Async variant of `flush_blocking`, safe to call from a runtime worker.
    pub async fn wait_for_empty(&self) -> Result<(), String> {
        let collector = self.clone();
        tokio::task::spawn_blocking(move || collector.flush_blocking())
            .await
            .map_err(|e| format!("Flush task failed: {}", e))?
    }
}

impl Log for LogCollector {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.log_str(format!("[{}] {}", record.level(), record.args()));
        }
    }

    fn flush(&self) {
        let _ = self.flush_blocking();
    }
}

/// Install a `LogCollector` as the global `log` backend.
///
/// Returns the collector so the caller can flush it at shutdown.
pub fn init_global_logger(log_dir: PathBuf, level: LevelFilter) -> Result<LogCollector, String> {
    let collector = LogCollector::new(log_dir, level, true)?;
    log::set_boxed_logger(Box::new(collector.clone()))
        .map(|()| log::set_max_level(level))
        .map_err(|e| format!("Failed to install global logger: {}", e))?;
    Ok(collector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_log_collector_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let collector = LogCollector::new(dir.path().join("logs"), LevelFilter::Info, false).unwrap();
        assert!(collector.log_path().exists());
        assert!(collector.log_path().starts_with(dir.path().join("logs")));
    }

    #[test]
    fn test_flush_persists_everything_sent_before() {
        let dir = tempfile::tempdir().unwrap();
        let collector = LogCollector::new(dir.path().to_path_buf(), LevelFilter::Info, false).unwrap();

        for i in 0..500 {
            collector.log_str(format!("line {}", i));
        }
        collector.flush_blocking().unwrap();

        let content = fs::read_to_string(collector.log_path()).unwrap();
        assert_eq!(content.lines().count(), 500);
        assert!(content.lines().last().unwrap().ends_with("line 499"));
    }

    #[test]
    fn test_level_filtering() {
        let dir = tempfile::tempdir().unwrap();
        let collector = LogCollector::new(dir.path().to_path_buf(), LevelFilter::Warn, false).unwrap();

        collector.log(
            &Record::builder()
                .args(format_args!("quiet"))
                .level(log::Level::Info)
                .build(),
        );
        collector.log(
            &Record::builder()
                .args(format_args!("loud"))
                .level(log::Level::Error)
                .build(),
        );
        collector.flush_blocking().unwrap();

        let content = fs::read_to_string(collector.log_path()).unwrap();
        assert!(!content.contains("quiet"));
        assert!(content.contains("[ERROR] loud"));
    }

    #[tokio::test]
    async fn test_wait_for_empty_from_async() {
        let dir = tempfile::tempdir().unwrap();
        let collector = LogCollector::new(dir.path().to_path_buf(), LevelFilter::Info, false).unwrap();
        collector.log_str("async line");
        collector.wait_for_empty().await.unwrap();
        let content = fs::read_to_string(collector.log_path()).unwrap();
        assert!(content.contains("async line"));
    }
}
