//! User-facing colored logger.
//!
//! Four channels: [`Logger::info`], [`Logger::ok`], [`Logger::warn`], and
//! the terminal [`Logger::error`], which logs unconditionally and hands back
//! the [`Error`] the caller must propagate. Messages below the configured
//! threshold are dropped. An optional file mirror appends timestamped plain
//! lines.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::Error;

/// Severity ranks. A message is shown when its rank is at least the
/// configured threshold's rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Info,
    Ok,
    Warn,
    Error,
}

impl LogLevel {
    fn tag(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Ok => "OK",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    fn styled_tag(self) -> String {
        let tag = self.tag();
        match self {
            LogLevel::Info => console::style(tag).cyan().bold().to_string(),
            LogLevel::Ok => console::style(tag).green().bold().to_string(),
            LogLevel::Warn => console::style(tag).yellow().bold().to_string(),
            LogLevel::Error => console::style(tag).red().bold().to_string(),
        }
    }
}

/// Colored console logger with an optional file mirror.
#[derive(Clone)]
pub struct Logger {
    level: LogLevel,
    file: Option<Arc<Mutex<File>>>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(LogLevel::Info)
    }
}

impl Logger {
    /// Creates a logger that drops messages below `level`.
    pub fn new(level: LogLevel) -> Self {
        Self { level, file: None }
    }

    /// Mirrors every shown message into `path` (appended, plain text).
    pub fn with_file(mut self, path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.file = Some(Arc::new(Mutex::new(file)));
        Ok(self)
    }

    fn enabled(&self, level: LogLevel) -> bool {
        level >= self.level
    }

    fn emit(&self, level: LogLevel, msg: &str) {
        if !self.enabled(level) {
            return;
        }
        println!("{} {}", level.styled_tag(), msg);
        if let Some(file) = &self.file {
            let stamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S");
            if let Ok(mut file) = file.lock() {
                let _ = writeln!(file, "{} [{}] {}", stamp, level.tag(), msg);
            }
        }
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        self.emit(LogLevel::Info, msg.as_ref());
    }

    pub fn ok(&self, msg: impl AsRef<str>) {
        self.emit(LogLevel::Ok, msg.as_ref());
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        self.emit(LogLevel::Warn, msg.as_ref());
    }

    /// Terminal channel: logs and returns the error to propagate.
    #[must_use]
    pub fn error(&self, msg: impl Into<String>) -> Error {
        let msg = msg.into();
        self.emit(LogLevel::Error, &msg);
        Error::Fatal(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_threshold_matrix() {
        let info = Logger::new(LogLevel::Info);
        assert!(info.enabled(LogLevel::Info));
        assert!(info.enabled(LogLevel::Ok));
        assert!(info.enabled(LogLevel::Warn));
        assert!(info.enabled(LogLevel::Error));

        let ok = Logger::new(LogLevel::Ok);
        assert!(!ok.enabled(LogLevel::Info));
        assert!(ok.enabled(LogLevel::Ok));

        let warn = Logger::new(LogLevel::Warn);
        assert!(!warn.enabled(LogLevel::Ok));
        assert!(warn.enabled(LogLevel::Warn));

        let error = Logger::new(LogLevel::Error);
        assert!(!error.enabled(LogLevel::Warn));
        assert!(error.enabled(LogLevel::Error));
    }

    #[test]
    fn test_error_returns_fatal() {
        let logger = Logger::new(LogLevel::Error);
        let err = logger.error("pip install failed for demo");
        match err {
            Error::Fatal(msg) => assert_eq!(msg, "pip install failed for demo"),
            other => panic!("expected Fatal, got {other:?}"),
        }
    }

    #[test]
    fn test_file_mirror_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.log");
        let logger = Logger::new(LogLevel::Info).with_file(&path).unwrap();
        logger.info("first");
        logger.warn("second");

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[INFO] first"));
        assert!(lines[1].contains("[WARN] second"));
    }

    #[test]
    fn test_file_mirror_respects_threshold() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.log");
        let logger = Logger::new(LogLevel::Warn).with_file(&path).unwrap();
        logger.info("hidden");
        logger.ok("also hidden");

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.is_empty());
    }
}
