//! Per-node chunk executor. Consumes at most one chunk at a time, drives
//! the renderer through the agent supervisor, emits durable event and
//! stdout files under the job tree, and reports terminal states through a
//! completion channel.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;

use crate::fsio;
use crate::jobs::manifest::JobManifest;
use crate::monlog::MonitorLog;
use crate::scheduler::chunk::ChunkRange;
use crate::scheduler::dispatch::CompletionState;
use crate::worker::agent::AgentSupervisor;
use crate::worker::messages::{AgentToMonitor, CommandSpec, OutputSpec, TaskMessage};

/// Terminal chunk report sent back to the node's routing loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkReport {
    pub job_id: String,
    pub chunk: ChunkRange,
    pub state: CompletionState,
}

#[derive(Debug)]
struct PendingDispatch {
    manifest: JobManifest,
    chunk: ChunkRange,
}

#[derive(Debug)]
struct ActiveRender {
    manifest: JobManifest,
    chunk: ChunkRange,
    ack_received: bool,
    progress_pct: f32,
    start_time: Instant,
    stdout_buffer: Vec<String>,
    stdout_log_name: String,
    completed_frames: BTreeSet<i32>,
}

/// The per-node render state machine, driven by the main loop.
#[derive(Debug)]
pub struct RenderCoordinator {
    farm_path: PathBuf,
    node_id: String,
    node_os: String,
    log: MonitorLog,
    reports: mpsc::UnboundedSender<ChunkReport>,
    dispatch_queue: VecDeque<PendingDispatch>,
    active: Option<ActiveRender>,
    stopped: bool,
    /// Per-job event counter, lazily seeded from existing event files.
    event_seq: HashMap<String, u64>,
}

impl RenderCoordinator {
    pub fn new(
        farm_path: &std::path::Path,
        node_id: String,
        node_os: String,
        log: MonitorLog,
        reports: mpsc::UnboundedSender<ChunkReport>,
    ) -> Self {
        log.info("render", format!("Initialized for node {node_id}"));
        Self {
            farm_path: farm_path.to_path_buf(),
            node_id,
            node_os,
            log,
            reports,
            dispatch_queue: VecDeque::new(),
            active: None,
            stopped: false,
            event_seq: HashMap::new(),
        }
    }

    pub fn queue_dispatch(&mut self, manifest: JobManifest, chunk: ChunkRange) {
        self.log.info(
            "render",
            format!("Queued dispatch: job={} chunk={}", manifest.job_id, chunk.range_str()),
        );
        self.dispatch_queue.push_back(PendingDispatch { manifest, chunk });
    }

    /// Drop queued assignments for a job (it was stopped or cancelled).
    pub fn purge_job(&mut self, job_id: &str) {
        self.dispatch_queue.retain(|p| p.manifest.job_id != job_id);
    }

    pub fn set_stopped(&mut self, stopped: bool) {
        self.stopped = stopped;
    }

    pub fn is_rendering(&self) -> bool {
        self.active.is_some()
    }

    pub fn current_job_id(&self) -> Option<&str> {
        self.active.as_ref().map(|ar| ar.manifest.job_id.as_str())
    }

    pub fn current_chunk(&self) -> Option<ChunkRange> {
        self.active.as_ref().map(|ar| ar.chunk)
    }

    /// Short label like `f12` or `f1-10` for heartbeats and status lines.
    pub fn current_chunk_label(&self) -> Option<String> {
        self.active.as_ref().map(|ar| ar.chunk.to_string())
    }

    pub fn current_progress(&self) -> f32 {
        self.active.as_ref().map(|ar| ar.progress_pct).unwrap_or(0.0)
    }

    pub fn ack_received(&self) -> bool {
        self.active.as_ref().map(|ar| ar.ack_received).unwrap_or(false)
    }

    /// Time since the active render started (reset on ack).
    pub fn elapsed(&self) -> Option<std::time::Duration> {
        self.active.as_ref().map(|ar| ar.start_time.elapsed())
    }

    pub fn completed_frame_count(&self) -> usize {
        self.active
            .as_ref()
            .map(|ar| ar.completed_frames.len())
            .unwrap_or(0)
    }

    /// One main-loop step: start the next queued chunk if idle, and fail the
    /// active one if the agent dropped off mid-render.
    pub fn update(&mut self, agent: &AgentSupervisor) {
        if self.active.is_none() {
            if let Some(pending) = self.dispatch_queue.pop_front() {
                if self.stopped {
                    self.log
                        .info("render", "Stopped - skipping dispatch, abandoning chunk");
                    self.report(&pending.manifest.job_id, pending.chunk, CompletionState::Abandoned);
                } else if !agent.is_connected() {
                    self.log
                        .warn("render", "Agent not connected, re-queuing dispatch");
                    self.dispatch_queue.push_front(pending);
                } else {
                    self.start_render(pending, agent);
                }
            }
        }

        if self.active.is_some() && !agent.is_connected() {
            self.log.error("render", "Agent disconnected during render!");
            self.flush_stdout();
            let chunk = self.active.as_ref().map(|ar| ar.chunk).unwrap_or_default();
            self.emit_event("chunk_failed", chunk, json!({"error": "Agent disconnected"}));
            self.fail_chunk("Agent disconnected during render");
        }
    }

    fn start_render(&mut self, pending: PendingDispatch, agent: &AgentSupervisor) {
        let chunk = pending.chunk;
        let manifest = pending.manifest;

        self.log.info(
            "render",
            format!("Starting render: job={} chunk={}", manifest.job_id, chunk.range_str()),
        );

        if let Some(dir) = manifest.output_dir.as_deref().filter(|d| !d.is_empty()) {
            if let Err(e) = std::fs::create_dir_all(dir) {
                self.log
                    .warn("render", format!("Failed to create output dir: {dir} ({e})"));
            }
        }

        let stdout_log_name = format!("{}_{}.log", chunk.range_str(), Utc::now().timestamp_millis());
        let task = build_task_message(&manifest, chunk, &self.node_os);

        self.active = Some(ActiveRender {
            manifest,
            chunk,
            ack_received: false,
            progress_pct: 0.0,
            start_time: Instant::now(),
            stdout_buffer: Vec::new(),
            stdout_log_name,
            completed_frames: BTreeSet::new(),
        });

        self.log.info(
            "render",
            format!("Dispatching chunk {} for job {}", chunk.range_str(), task.job_id),
        );
        agent.send_task(task);
    }

    /// Forward an abort to the renderer and fail the active chunk.
    pub fn abort_current_render(&mut self, reason: &str, agent: &AgentSupervisor) {
        let Some(ar) = self.active.as_ref() else {
            return;
        };
        let chunk = ar.chunk;
        self.log.warn(
            "render",
            format!(
                "Aborting render: job={} chunk={} reason={reason}",
                ar.manifest.job_id,
                chunk.range_str()
            ),
        );

        agent.send_abort(reason);
        self.flush_stdout();
        self.emit_event("chunk_failed", chunk, json!({"error": reason}));
        self.fail_chunk(reason);
    }

    pub fn handle_agent_message(&mut self, msg: AgentToMonitor) {
        if self.active.is_none() {
            self.log.warn("render", "Received agent message with no active render, ignoring");
            return;
        }

        match msg {
            AgentToMonitor::Ack { .. } => {
                let (chunk, label) = {
                    let ar = self.active.as_mut().unwrap();
                    ar.ack_received = true;
                    ar.start_time = Instant::now();
                    (ar.chunk, ar.chunk.range_str())
                };
                self.emit_event("chunk_started", chunk, json!({}));
                self.log.info("render", format!("Chunk {label} acknowledged"));
            }
            AgentToMonitor::Progress { progress_pct } => {
                self.active.as_mut().unwrap().progress_pct = progress_pct;
            }
            AgentToMonitor::Stdout { lines } => {
                self.active.as_mut().unwrap().stdout_buffer.extend(lines);
                self.flush_stdout();
            }
            AgentToMonitor::FrameCompleted { frame } => {
                if frame >= 0 {
                    let job_id = {
                        let ar = self.active.as_mut().unwrap();
                        ar.completed_frames.insert(frame);
                        ar.manifest.job_id.clone()
                    };
                    self.emit_event("frame_finished", ChunkRange::new(frame, frame), json!({}));
                    self.log
                        .info("render", format!("Frame {frame} finished for job {job_id}"));
                }
            }
            AgentToMonitor::Completed {
                elapsed_ms,
                exit_code,
                output_file,
            } => {
                self.flush_stdout();
                let (job_id, chunk) = {
                    let ar = self.active.as_ref().unwrap();
                    (ar.manifest.job_id.clone(), ar.chunk)
                };
                self.emit_event(
                    "chunk_finished",
                    chunk,
                    json!({
                        "elapsed_ms": elapsed_ms,
                        "exit_code": exit_code,
                        "output_file": output_file,
                    }),
                );
                self.log.info(
                    "render",
                    format!(
                        "Chunk {} completed for job {job_id} (exit_code={exit_code}, elapsed={elapsed_ms}ms)",
                        chunk.range_str()
                    ),
                );
                self.active = None;
                self.report(&job_id, chunk, CompletionState::Completed);
            }
            AgentToMonitor::Failed { exit_code, error } => {
                self.flush_stdout();
                let chunk = self.active.as_ref().unwrap().chunk;
                self.emit_event(
                    "chunk_failed",
                    chunk,
                    json!({"exit_code": exit_code, "error": error}),
                );
                self.log
                    .error("render", format!("Chunk {} failed: {error}", chunk.range_str()));
                self.fail_chunk(&error);
            }
            // Consumed by the supervisor before forwarding.
            AgentToMonitor::Pong | AgentToMonitor::Status { .. } => {}
        }
    }

    fn fail_chunk(&mut self, error: &str) {
        let Some(ar) = self.active.take() else {
            return;
        };
        self.log.error(
            "render",
            format!(
                "Chunk {} FAILED for job {}: {error}",
                ar.chunk.range_str(),
                ar.manifest.job_id
            ),
        );
        self.report(&ar.manifest.job_id, ar.chunk, CompletionState::Failed);
    }

    fn report(&self, job_id: &str, chunk: ChunkRange, state: CompletionState) {
        let _ = self.reports.send(ChunkReport {
            job_id: job_id.to_string(),
            chunk,
            state,
        });
    }

    // ─── Event files ─────────────────────────────────────────────────────

    /// Write one durable event file. Filenames are
    /// `{seq:06}_{type}_{rangeStr}.json`, so they sort chronologically and
    /// are unique within `(node, job)`.
    fn emit_event(&mut self, event_type: &str, chunk: ChunkRange, extra: serde_json::Value) {
        let Some(ar) = self.active.as_ref() else {
            return;
        };
        let job_id = ar.manifest.job_id.clone();
        let events_dir = self
            .farm_path
            .join("jobs")
            .join(&job_id)
            .join("events")
            .join(&self.node_id);
        let _ = std::fs::create_dir_all(&events_dir);

        let seq = self.next_event_seq(&job_id, &events_dir);
        let name = format!("{seq:06}_{event_type}_{}.json", chunk.range_str());

        let mut event = json!({
            "_version": 1,
            "node_id": self.node_id,
            "seq": seq,
            "frame_start": chunk.frame_start,
            "frame_end": chunk.frame_end,
            "type": event_type,
            "timestamp_ms": Utc::now().timestamp_millis(),
        });
        if let (Some(obj), Some(extra)) = (event.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }

        if let Err(e) = fsio::write_json(&events_dir.join(name), &event) {
            self.log
                .error("render", format!("Failed to write event file: {e}"));
        }
    }

    fn next_event_seq(&mut self, job_id: &str, events_dir: &std::path::Path) -> u64 {
        let counter = self.event_seq.entry(job_id.to_string()).or_insert_with(|| {
            // Resume after the highest seq already on disk for this node.
            let mut max_seq = 0u64;
            if let Ok(entries) = std::fs::read_dir(events_dir) {
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else { continue };
                    if let Some(seq) = name.get(..6).and_then(|s| s.parse::<u64>().ok()) {
                        max_seq = max_seq.max(seq);
                    }
                }
            }
            max_seq
        });
        *counter += 1;
        *counter
    }

    // ─── Stdout logs ─────────────────────────────────────────────────────

    fn flush_stdout(&mut self) {
        let Some(ar) = self.active.as_mut() else {
            return;
        };
        if ar.stdout_buffer.is_empty() {
            return;
        }

        let stdout_dir = self
            .farm_path
            .join("jobs")
            .join(&ar.manifest.job_id)
            .join("stdout")
            .join(&self.node_id);
        let _ = std::fs::create_dir_all(&stdout_dir);
        let path = stdout_dir.join(&ar.stdout_log_name);

        match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(mut file) => {
                for line in &ar.stdout_buffer {
                    let _ = writeln!(file, "{line}");
                }
                ar.stdout_buffer.clear();
            }
            Err(e) => self.log.error(
                "render",
                format!("Failed to open stdout log: {} ({e})", path.display()),
            ),
        }
    }
}

/// Assemble the task message for the agent: executable for this OS, flag
/// args with `{frame}` / `{chunk_start}` / `{chunk_end}` substituted, and
/// the manifest's progress / output-detection / environment passed through.
pub fn build_task_message(manifest: &JobManifest, chunk: ChunkRange, node_os: &str) -> TaskMessage {
    let executable = manifest.cmd_for_os(node_os).unwrap_or_default().to_string();

    let mut args = Vec::new();
    for flag in &manifest.flags {
        if !flag.flag.is_empty() {
            args.push(substitute_tokens(&flag.flag, chunk));
        }
        if let Some(value) = &flag.value {
            args.push(substitute_tokens(value, chunk));
        }
    }

    let progress = if manifest.progress.patterns.is_empty()
        && manifest.progress.completion_pattern.is_none()
    {
        None
    } else {
        Some(manifest.progress.clone())
    };

    let output_detection = manifest
        .output_detection
        .stdout_regex
        .as_ref()
        .map(|regex| OutputSpec {
            regex: regex.clone(),
            capture_group: manifest.output_detection.path_group,
        });

    let working_dir = manifest
        .process
        .working_dir
        .as_ref()
        .map(|dir| substitute_tokens(dir, chunk))
        .filter(|dir| !dir.is_empty());

    TaskMessage {
        job_id: manifest.job_id.clone(),
        frame_start: chunk.frame_start,
        frame_end: chunk.frame_end,
        command: CommandSpec { executable, args },
        working_dir,
        environment: manifest.environment.clone(),
        progress,
        output_detection,
        timeout_seconds: manifest.timeout_seconds,
    }
}

/// `{frame}` is an alias for `{chunk_start}`.
fn substitute_tokens(input: &str, chunk: ChunkRange) -> String {
    input
        .replace("{frame}", &chunk.frame_start.to_string())
        .replace("{chunk_start}", &chunk.frame_start.to_string())
        .replace("{chunk_end}", &chunk.frame_end.to_string())
}
