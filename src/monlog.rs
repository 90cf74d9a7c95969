//! Operational log: a process-wide ring buffer mirrored to a daily per-node
//! file under the farm tree.
//!
//! The handle is cheap to clone and explicit rather than global so tests can
//! run isolated instances. Every append also emits the matching `tracing`
//! event, so operational messages have a single call site.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{Duration, Local, NaiveDate};

const MAX_ENTRIES: usize = 1000;
const RETAIN_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub timestamp_ms: i64,
    pub level: Level,
    pub category: String,
    pub message: String,
}

#[derive(Debug)]
struct Inner {
    buffer: VecDeque<Entry>,
    file_target: Option<FileTarget>,
}

#[derive(Debug)]
struct FileTarget {
    node_dir: PathBuf,
    current_date: NaiveDate,
}

/// Thread-safe operational log handle.
#[derive(Debug, Clone)]
pub struct MonitorLog {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MonitorLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorLog {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                buffer: VecDeque::with_capacity(MAX_ENTRIES),
                file_target: None,
            })),
        }
    }

    /// Mirror subsequent appends to `nodes/{node_id}/monitor-YYYY-MM-DD.log`.
    pub fn start_file_logging(&self, farm_path: &Path, node_id: &str) {
        let node_dir = farm_path.join("nodes").join(node_id);
        let _ = std::fs::create_dir_all(&node_dir);

        let mut inner = self.inner.lock().unwrap();
        inner.file_target = Some(FileTarget {
            node_dir,
            current_date: Local::now().date_naive(),
        });
    }

    pub fn stop_file_logging(&self) {
        self.inner.lock().unwrap().file_target = None;
    }

    pub fn info(&self, category: &str, message: impl Into<String>) {
        self.append(Level::Info, category, message.into());
    }

    pub fn warn(&self, category: &str, message: impl Into<String>) {
        self.append(Level::Warn, category, message.into());
    }

    pub fn error(&self, category: &str, message: impl Into<String>) {
        self.append(Level::Error, category, message.into());
    }

    fn append(&self, level: Level, category: &str, message: String) {
        match level {
            Level::Info => tracing::info!(category, "{message}"),
            Level::Warn => tracing::warn!(category, "{message}"),
            Level::Error => tracing::error!(category, "{message}"),
        }

        let now = Local::now();
        let entry = Entry {
            timestamp_ms: now.timestamp_millis(),
            level,
            category: category.to_string(),
            message,
        };

        let line = format!(
            "{} {}  [{}] {}",
            now.format("%H:%M:%S%.3f"),
            level.as_str(),
            entry.category,
            entry.message
        );

        let mut inner = self.inner.lock().unwrap();
        if inner.buffer.len() >= MAX_ENTRIES {
            inner.buffer.pop_front();
        }
        inner.buffer.push_back(entry);

        if let Some(target) = inner.file_target.as_mut() {
            let today = now.date_naive();
            let rolled = today != target.current_date;
            if rolled {
                target.current_date = today;
            }
            let path = target
                .node_dir
                .join(format!("monitor-{}.log", target.current_date.format("%Y-%m-%d")));
            let node_dir = target.node_dir.clone();
            drop(inner);

            if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
                let _ = writeln!(file, "{line}");
            }
            if rolled {
                purge_old_files(&node_dir, today);
            }
        }
    }

    /// Snapshot of the ring buffer in chronological order.
    pub fn entries(&self) -> Vec<Entry> {
        self.inner.lock().unwrap().buffer.iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().buffer.clear();
    }

    /// Read the tail of another node's log files (today + yesterday), capped
    /// at `max_lines`. Best-effort: unreadable files yield nothing.
    pub fn read_node_log(farm_path: &Path, node_id: &str, max_lines: usize) -> Vec<String> {
        let node_dir = farm_path.join("nodes").join(node_id);
        let today = Local::now().date_naive();
        let yesterday = today - Duration::days(1);

        let mut lines = Vec::new();
        for date in [yesterday, today] {
            let path = node_dir.join(format!("monitor-{}.log", date.format("%Y-%m-%d")));
            if let Ok(content) = std::fs::read_to_string(&path) {
                lines.extend(content.lines().map(str::to_string));
            }
        }

        if lines.len() > max_lines {
            lines.drain(..lines.len() - max_lines);
        }
        lines
    }
}

fn purge_old_files(node_dir: &Path, today: NaiveDate) {
    let cutoff = today - Duration::days(RETAIN_DAYS);
    let Ok(entries) = std::fs::read_dir(node_dir) else {
        return;
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(date_str) = name
            .strip_prefix("monitor-")
            .and_then(|rest| rest.strip_suffix(".log"))
        else {
            continue;
        };
        if let Ok(date) = NaiveDate::parse_from_str(date_str, "%Y-%m-%d") {
            if date < cutoff {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_overwrites_oldest() {
        let log = MonitorLog::new();
        for i in 0..(MAX_ENTRIES + 5) {
            log.info("test", format!("entry {i}"));
        }
        let entries = log.entries();
        assert_eq!(entries.len(), MAX_ENTRIES);
        assert_eq!(entries[0].message, "entry 5");
        assert_eq!(entries.last().unwrap().message, format!("entry {}", MAX_ENTRIES + 4));
    }

    #[test]
    fn file_logging_appends_daily_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = MonitorLog::new();
        log.start_file_logging(dir.path(), "abc123def456");
        log.info("health", "started");
        log.warn("health", "peer stale");

        let lines = MonitorLog::read_node_log(dir.path(), "abc123def456", 10);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("INFO"));
        assert!(lines[0].contains("[health] started"));
        assert!(lines[1].contains("WARN"));
    }

    #[test]
    fn read_node_log_caps_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = MonitorLog::new();
        log.start_file_logging(dir.path(), "n1");
        for i in 0..20 {
            log.info("test", format!("line {i}"));
        }
        let lines = MonitorLog::read_node_log(dir.path(), "n1", 5);
        assert_eq!(lines.len(), 5);
        assert!(lines[4].contains("line 19"));
    }

    #[test]
    fn purge_removes_files_past_retention() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("monitor-2001-01-01.log");
        let recent_date = Local::now().date_naive();
        let recent = dir
            .path()
            .join(format!("monitor-{}.log", recent_date.format("%Y-%m-%d")));
        std::fs::write(&old, "old\n").unwrap();
        std::fs::write(&recent, "new\n").unwrap();

        purge_old_files(dir.path(), recent_date);
        assert!(!old.exists());
        assert!(recent.exists());
    }
}
