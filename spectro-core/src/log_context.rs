//! # Log Context
//!
//! An explicitly constructed logging context handed to every component.
//! Entries are kept in a bounded in-memory ring for display, appended to
//! a plain-text log file, and forwarded to the `log` facade so the usual
//! terminal backend still sees them.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};
use log::Level;
use parking_lot::Mutex;

/// One recorded log line.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: Level,
    pub source: String,
    pub message: String,
}

impl LogEntry {
    /// `2024-05-01 12:00:00.000 [INFO] [receiver] message`
    pub fn format_line(&self) -> String {
        format!(
            "{} [{}] [{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.level,
            self.source,
            self.message
        )
    }
}

#[derive(Clone)]
pub struct LogContext {
    inner: Arc<Inner>,
}

struct Inner {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
    file: Option<Mutex<File>>,
    path: Option<PathBuf>,
}

impl LogContext {
    /// Creates a context that also appends to `file_path`, creating its
    /// parent directory when needed.
    pub fn new(capacity: usize, file_path: Option<&Path>) -> std::io::Result<Self> {
        let file = match file_path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Mutex::new(file))
            }
            None => None,
        };
        Ok(Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
                file,
                path: file_path.map(Path::to_path_buf),
            }),
        })
    }

    /// A context without a file sink.
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                entries: Mutex::new(VecDeque::new()),
                file: None,
                path: None,
            }),
        }
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn log(&self, level: Level, source: &str, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Local::now(),
            level,
            source: source.to_string(),
            message: message.into(),
        };

        let target = format!("spectro::{}", entry.source);
        log::log!(target: &target, level, "{}", entry.message);

        if let Some(file) = &self.inner.file {
            let mut file = file.lock();
            // A failing log file must never disturb the pipeline.
            let _ = writeln!(file, "{}", entry.format_line());
        }

        let mut entries = self.inner.entries.lock();
        entries.push_back(entry);
        while entries.len() > self.inner.capacity {
            entries.pop_front();
        }
    }

    pub fn debug(&self, source: &str, message: impl Into<String>) {
        self.log(Level::Debug, source, message);
    }

    pub fn info(&self, source: &str, message: impl Into<String>) {
        self.log(Level::Info, source, message);
    }

    pub fn warn(&self, source: &str, message: impl Into<String>) {
        self.log(Level::Warn, source, message);
    }

    pub fn error(&self, source: &str, message: impl Into<String>) {
        self.log(Level::Error, source, message);
    }

    /// Snapshot of the ring, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.entries.lock().clear();
    }
}

impl std::fmt::Debug for LogContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogContext")
            .field("capacity", &self.inner.capacity)
            .field("path", &self.inner.path)
            .finish()
    }
}
