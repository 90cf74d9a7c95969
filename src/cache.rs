//! Read-only background computer of derived snapshots for an attached UI
//! shell: per-job progress, the selected job's frame-state grid, the
//! selected job's task-output tail, and remote node log tails.
//!
//! Never mutates farm state. When the coordinator injects its in-memory
//! dispatch tables, those win over disk reads; other jobs (completed,
//! foreign) fall back to `dispatch.json`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::fsio;
use crate::monlog::MonitorLog;
use crate::scheduler::table::{ChunkState, DispatchChunk, DispatchTable};

const PROGRESS_COOLDOWN: Duration = Duration::from_secs(5);
const FRAME_COOLDOWN: Duration = Duration::from_secs(3);
const OUTPUT_COOLDOWN: Duration = Duration::from_secs(2);
const LOG_COOLDOWN: Duration = Duration::from_secs(5);
const OUTPUT_TAIL_LINES: usize = 200;
const REMOTE_LOG_LINES: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobProgress {
    pub total: i64,
    pub completed: i64,
    pub rendering: i64,
    pub failed: i64,
}

impl JobProgress {
    fn from_table(table: &DispatchTable) -> Self {
        let mut progress = JobProgress::default();
        for dc in &table.chunks {
            let count = (dc.frame_end - dc.frame_start + 1) as i64;
            progress.total += count;
            match dc.state {
                ChunkState::Completed => progress.completed += count,
                ChunkState::Assigned => progress.rendering += count,
                ChunkState::Failed => progress.failed += count,
                ChunkState::Pending => {}
            }
        }
        progress
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Unclaimed,
    Rendering,
    Completed,
    Failed,
}

impl FrameState {
    fn from_chunk(state: ChunkState) -> Self {
        match state {
            ChunkState::Pending => FrameState::Unclaimed,
            ChunkState::Assigned => FrameState::Rendering,
            ChunkState::Completed => FrameState::Completed,
            ChunkState::Failed => FrameState::Failed,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FrameStateSnapshot {
    pub job_id: String,
    pub chunks: Vec<DispatchChunk>,
    pub frame_states: Vec<(i32, FrameState)>,
}

impl FrameStateSnapshot {
    fn from_table(job_id: &str, table: &DispatchTable) -> Self {
        let mut snap = Self {
            job_id: job_id.to_string(),
            chunks: table.chunks.clone(),
            frame_states: Vec::new(),
        };
        for dc in &table.chunks {
            let state = FrameState::from_chunk(dc.state);
            for frame in dc.frame_start..=dc.frame_end {
                snap.frame_states.push((frame, state));
            }
        }
        snap
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskOutputSnapshot {
    pub job_id: String,
    pub log_name: String,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RemoteLogSnapshot {
    pub logs: HashMap<String, Vec<String>>,
}

#[derive(Debug, Default)]
struct Inputs {
    selected_job_id: String,
    job_ids: Vec<String>,
    log_node_ids: Vec<String>,
    coordinator_tables: Option<HashMap<String, DispatchTable>>,
}

#[derive(Debug, Default)]
struct Outputs {
    progress: HashMap<String, JobProgress>,
    frame_states: FrameStateSnapshot,
    task_output: TaskOutputSnapshot,
    remote_logs: RemoteLogSnapshot,
}

#[derive(Debug, Clone)]
pub struct UiDataCache {
    farm_path: PathBuf,
    inputs: Arc<Mutex<Inputs>>,
    outputs: Arc<Mutex<Outputs>>,
    wake: Arc<AtomicBool>,
}

impl UiDataCache {
    pub fn new(farm_path: &std::path::Path) -> Self {
        Self {
            farm_path: farm_path.to_path_buf(),
            inputs: Arc::new(Mutex::new(Inputs::default())),
            outputs: Arc::new(Mutex::new(Outputs::default())),
            wake: Arc::new(AtomicBool::new(false)),
        }
    }

    // ─── Main thread setters ─────────────────────────────────────────────

    pub fn set_selected_job_id(&self, job_id: &str) {
        let mut inputs = self.inputs.lock().unwrap();
        if inputs.selected_job_id != job_id {
            inputs.selected_job_id = job_id.to_string();
            // Skip cooldowns so the new selection fills in promptly.
            self.wake.store(true, Ordering::Relaxed);
        }
    }

    pub fn set_job_ids(&self, ids: Vec<String>) {
        self.inputs.lock().unwrap().job_ids = ids;
    }

    pub fn set_log_request(&self, node_ids: Vec<String>) {
        self.inputs.lock().unwrap().log_node_ids = node_ids;
    }

    /// Coordinator fast path: progress and frame states for tracked jobs
    /// come straight from memory, skipping disk.
    pub fn set_dispatch_tables(&self, tables: HashMap<String, DispatchTable>) {
        let selected = {
            let mut inputs = self.inputs.lock().unwrap();
            inputs.coordinator_tables = Some(tables.clone());
            inputs.selected_job_id.clone()
        };

        let mut outputs = self.outputs.lock().unwrap();
        for (job_id, table) in &tables {
            outputs
                .progress
                .insert(job_id.clone(), JobProgress::from_table(table));
        }
        if !selected.is_empty() {
            if let Some(table) = tables.get(&selected) {
                outputs.frame_states = FrameStateSnapshot::from_table(&selected, table);
            }
        }
    }

    // ─── Main thread getters ─────────────────────────────────────────────

    pub fn progress_snapshot(&self) -> HashMap<String, JobProgress> {
        self.outputs.lock().unwrap().progress.clone()
    }

    pub fn frame_state_snapshot(&self) -> FrameStateSnapshot {
        self.outputs.lock().unwrap().frame_states.clone()
    }

    pub fn task_output_snapshot(&self) -> TaskOutputSnapshot {
        self.outputs.lock().unwrap().task_output.clone()
    }

    pub fn remote_log_snapshot(&self) -> RemoteLogSnapshot {
        self.outputs.lock().unwrap().remote_logs.clone()
    }

    // ─── Background loop ─────────────────────────────────────────────────

    pub async fn run(self, cancel: CancellationToken) {
        let mut last_progress: Option<Instant> = None;
        let mut last_frames: Option<Instant> = None;
        let mut last_output: Option<Instant> = None;
        let mut last_logs: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }

            let wake = self.wake.swap(false, Ordering::Relaxed);

            if wake || last_progress.map_or(true, |t| t.elapsed() >= PROGRESS_COOLDOWN) {
                self.scan_progress();
                last_progress = Some(Instant::now());
            }
            if wake || last_frames.map_or(true, |t| t.elapsed() >= FRAME_COOLDOWN) {
                self.scan_frame_states();
                last_frames = Some(Instant::now());
            }
            if wake || last_output.map_or(true, |t| t.elapsed() >= OUTPUT_COOLDOWN) {
                self.scan_task_output();
                last_output = Some(Instant::now());
            }
            if last_logs.map_or(true, |t| t.elapsed() >= LOG_COOLDOWN) {
                self.scan_remote_logs();
                last_logs = Some(Instant::now());
            }
        }
    }

    fn scan_progress(&self) {
        let (job_ids, coord_job_ids) = {
            let inputs = self.inputs.lock().unwrap();
            let coord: HashSet<String> = inputs
                .coordinator_tables
                .as_ref()
                .map(|t| t.keys().cloned().collect())
                .unwrap_or_default();
            (inputs.job_ids.clone(), coord)
        };

        let mut disk_progress = HashMap::new();
        for job_id in &job_ids {
            // Coordinator-tracked jobs are refreshed in set_dispatch_tables.
            if coord_job_ids.contains(job_id) {
                continue;
            }
            let path = self.farm_path.join("jobs").join(job_id).join("dispatch.json");
            if let Some(table) = fsio::safe_read_json::<DispatchTable>(&path) {
                disk_progress.insert(job_id.clone(), JobProgress::from_table(&table));
            }
        }

        let mut outputs = self.outputs.lock().unwrap();
        for (job_id, progress) in disk_progress {
            outputs.progress.insert(job_id, progress);
        }
        outputs.progress.retain(|job_id, _| job_ids.contains(job_id));
    }

    fn scan_frame_states(&self) {
        let (job_id, coord_tracked) = {
            let inputs = self.inputs.lock().unwrap();
            let tracked = inputs
                .coordinator_tables
                .as_ref()
                .is_some_and(|t| t.contains_key(&inputs.selected_job_id));
            (inputs.selected_job_id.clone(), tracked)
        };

        if coord_tracked {
            return;
        }
        if job_id.is_empty() {
            self.outputs.lock().unwrap().frame_states = FrameStateSnapshot::default();
            return;
        }

        let path = self.farm_path.join("jobs").join(&job_id).join("dispatch.json");
        let snapshot = match fsio::safe_read_json::<DispatchTable>(&path) {
            Some(table) => FrameStateSnapshot::from_table(&job_id, &table),
            None => FrameStateSnapshot {
                job_id: job_id.clone(),
                ..Default::default()
            },
        };
        self.outputs.lock().unwrap().frame_states = snapshot;
    }

    /// Tail of the newest stdout log of the selected job, across all nodes.
    fn scan_task_output(&self) {
        let job_id = self.inputs.lock().unwrap().selected_job_id.clone();
        if job_id.is_empty() {
            self.outputs.lock().unwrap().task_output = TaskOutputSnapshot::default();
            return;
        }

        let stdout_base = self.farm_path.join("jobs").join(&job_id).join("stdout");
        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;

        if let Ok(node_dirs) = std::fs::read_dir(&stdout_base) {
            for node_dir in node_dirs.flatten() {
                let Ok(files) = std::fs::read_dir(node_dir.path()) else {
                    continue;
                };
                for file in files.flatten() {
                    let path = file.path();
                    if !path.extension().is_some_and(|ext| ext == "log") {
                        continue;
                    }
                    let Ok(modified) = file.metadata().and_then(|m| m.modified()) else {
                        continue;
                    };
                    if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
                        newest = Some((modified, path));
                    }
                }
            }
        }

        let mut snapshot = TaskOutputSnapshot {
            job_id,
            ..Default::default()
        };
        if let Some((_, path)) = newest {
            if let Some(content) = fsio::safe_read_text(&path) {
                let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
                if lines.len() > OUTPUT_TAIL_LINES {
                    lines.drain(..lines.len() - OUTPUT_TAIL_LINES);
                }
                snapshot.log_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                snapshot.lines = lines;
            }
        }

        self.outputs.lock().unwrap().task_output = snapshot;
    }

    fn scan_remote_logs(&self) {
        let node_ids = self.inputs.lock().unwrap().log_node_ids.clone();
        if node_ids.is_empty() {
            return;
        }

        let mut logs = HashMap::new();
        for node_id in node_ids {
            let lines = MonitorLog::read_node_log(&self.farm_path, &node_id, REMOTE_LOG_LINES);
            logs.insert(node_id, lines);
        }

        self.outputs.lock().unwrap().remote_logs = RemoteLogSnapshot { logs };
    }
}
