//! Per-node filesystem inboxes.
//!
//! Anyone may write into `commands/{target}/`; only the owning node
//! consumes. A consumed file is renamed into `processed/` (or deleted if the
//! rename fails) so it is never handed to the main loop twice.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::bus::dedup::MessageDedup;
use crate::fsio;
use crate::monlog::MonitorLog;
use crate::scheduler::chunk::ChunkRange;

const POLL_INTERVAL: Duration = Duration::from_secs(3);
const PURGE_INTERVAL: Duration = Duration::from_secs(60);
const DEDUP_PURGE_INTERVAL: Duration = Duration::from_secs(30);
const PURGE_AGE_MS: i64 = 24 * 60 * 60 * 1000;

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    AssignChunk,
    AbortChunk,
    ChunkCompleted,
    ChunkFailed,
    StopJob,
    StopAll,
    ResumeAll,
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommandType::AssignChunk => "assign_chunk",
            CommandType::AbortChunk => "abort_chunk",
            CommandType::ChunkCompleted => "chunk_completed",
            CommandType::ChunkFailed => "chunk_failed",
            CommandType::StopJob => "stop_job",
            CommandType::StopAll => "stop_all",
            CommandType::ResumeAll => "resume_all",
        };
        write!(f, "{s}")
    }
}

/// The on-disk command record. `msg_id = "{timestamp_ms}.{sender}"` doubles
/// as the filename stem, so the inbox sorts chronologically per sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMsg {
    #[serde(rename = "_version", default = "default_version")]
    pub version: u32,
    pub msg_id: String,
    pub from: String,
    pub target: String,
    pub timestamp_ms: i64,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_start: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_end: Option<i32>,
}

/// A consumed command, ready for the main loop.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub command_type: CommandType,
    pub job_id: String,
    pub reason: String,
    pub from: String,
    pub msg_id: String,
    pub chunk: Option<ChunkRange>,
}

impl Action {
    fn from_msg(msg: CommandMsg) -> Self {
        let chunk = match (msg.frame_start, msg.frame_end) {
            (Some(start), Some(end)) => Some(ChunkRange::new(start, end)),
            _ => None,
        };
        Self {
            command_type: msg.command_type,
            job_id: msg.job_id,
            reason: msg.reason,
            from: msg.from,
            msg_id: msg.msg_id,
            chunk,
        }
    }
}

/// Sends commands to peers and consumes this node's own inbox.
#[derive(Debug, Clone)]
pub struct CommandManager {
    farm_path: PathBuf,
    node_id: String,
    log: MonitorLog,
    queue: Arc<Mutex<VecDeque<Action>>>,
    dedup: Arc<Mutex<MessageDedup>>,
    last_sent_ms: Arc<AtomicI64>,
}

impl CommandManager {
    pub fn new(farm_path: &std::path::Path, node_id: String, log: MonitorLog) -> Self {
        let _ = std::fs::create_dir_all(farm_path.join("commands").join(&node_id).join("processed"));
        Self {
            farm_path: farm_path.to_path_buf(),
            node_id,
            log,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            dedup: Arc::new(Mutex::new(MessageDedup::new())),
            last_sent_ms: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Write a command into `commands/{target}/`. The timestamp is forced
    /// strictly monotonic per process so this sender can never reuse a
    /// `msg_id`.
    pub fn send_command(
        &self,
        target: &str,
        command_type: CommandType,
        job_id: &str,
        reason: &str,
        chunk: Option<ChunkRange>,
    ) {
        let now = Utc::now().timestamp_millis();
        let ts = self
            .last_sent_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev + 1))
            })
            .map(|prev| now.max(prev + 1))
            .unwrap_or(now);

        let msg_id = format!("{ts}.{}", self.node_id);
        let msg = CommandMsg {
            version: 1,
            msg_id: msg_id.clone(),
            from: self.node_id.clone(),
            target: target.to_string(),
            timestamp_ms: ts,
            command_type,
            job_id: job_id.to_string(),
            reason: reason.to_string(),
            frame_start: chunk.map(|c| c.frame_start),
            frame_end: chunk.map(|c| c.frame_end),
        };

        let target_dir = self.farm_path.join("commands").join(target);
        let _ = std::fs::create_dir_all(&target_dir);

        if let Err(e) = fsio::write_json(&target_dir.join(format!("{msg_id}.json")), &msg) {
            self.log
                .error("command", format!("Failed to send {command_type} to {target}: {e}"));
            return;
        }

        let mut note = format!("Sent {command_type} to {target}");
        if !job_id.is_empty() {
            note.push_str(&format!(" job={job_id}"));
        }
        self.log.info("command", note);
    }

    /// Drain the action queue. The caller must process every returned action
    /// exactly once; per-sender order is preserved.
    pub fn pop_actions(&self) -> Vec<Action> {
        self.queue.lock().unwrap().drain(..).collect()
    }

    /// Poll the inbox and purge `processed/` until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        self.log
            .info("command", format!("Started for node {}", self.node_id));

        let mut last_poll: Option<Instant> = None;
        let mut last_purge = Instant::now();
        let mut last_dedup_purge = Instant::now();

        loop {
            let poll_due = last_poll.map_or(true, |t| t.elapsed() >= POLL_INTERVAL);
            if poll_due {
                self.poll_inbox();
                last_poll = Some(Instant::now());
            }

            if last_purge.elapsed() >= PURGE_INTERVAL {
                self.purge_processed();
                last_purge = Instant::now();
            }

            if last_dedup_purge.elapsed() >= DEDUP_PURGE_INTERVAL {
                self.dedup.lock().unwrap().purge();
                last_dedup_purge = Instant::now();
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }

        self.log.info("command", "Stopped");
    }

    /// Enumerate pending inbox files in filename (chronological) order,
    /// enqueue their actions, and archive each file exactly once.
    pub fn poll_inbox(&self) {
        let inbox_dir = self.farm_path.join("commands").join(&self.node_id);
        let processed_dir = inbox_dir.join("processed");

        let Ok(entries) = std::fs::read_dir(&inbox_dir) else {
            return;
        };

        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        for file in files {
            let parsed = fsio::safe_read_json::<CommandMsg>(&file);

            match parsed {
                Some(msg) => {
                    let duplicate = self.dedup.lock().unwrap().is_duplicate(&msg.msg_id);
                    if duplicate {
                        self.log
                            .warn("command", format!("Dropping duplicate command {}", msg.msg_id));
                    } else {
                        self.queue.lock().unwrap().push_back(Action::from_msg(msg));
                    }
                }
                None => {
                    self.log.error(
                        "command",
                        format!("Failed to parse command: {}", file.display()),
                    );
                }
            }

            // Archive regardless of parse outcome to break loops. If the
            // rename fails (cloud FS race), delete instead — either way the
            // file is never re-processed.
            let archived = file
                .file_name()
                .map(|name| std::fs::rename(&file, processed_dir.join(name)).is_ok())
                .unwrap_or(false);
            if !archived {
                let _ = std::fs::remove_file(&file);
            }
        }
    }

    /// Delete archived commands older than 24h. Age comes from the msg_id
    /// timestamp prefix, not mtime, so clock drift between peers is moot.
    pub fn purge_processed(&self) {
        let processed_dir = self
            .farm_path
            .join("commands")
            .join(&self.node_id)
            .join("processed");
        let Ok(entries) = std::fs::read_dir(&processed_dir) else {
            return;
        };

        let now = Utc::now().timestamp_millis();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(ts) = stem.split('.').next().and_then(|t| t.parse::<i64>().ok()) else {
                continue;
            };
            if now - ts > PURGE_AGE_MS {
                let _ = std::fs::remove_file(&path);
            }
        }
    }
}
