//! The coordinator's scheduler: owns the global chunk-to-worker mapping,
//! honoring priority, OS, and tag constraints, with bounded retries,
//! dead-worker reclamation, and stale-assignment reassignment.
//!
//! The manager has no background task; `Node` drives `update()` from the
//! main loop with owned snapshots. Side effects (commands to peers, local
//! dispatches) leave through a typed channel so cycles are testable without
//! a live farm.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::bus::{Action, CommandType};
use crate::config::TimingConfig;
use crate::fsio;
use crate::heartbeat::NodeInfo;
use crate::jobs::manifest::{JobInfo, JobManifest, JobState, JobStateEntry};
use crate::monlog::MonitorLog;
use crate::scheduler::chunk::{compute_chunks, ChunkRange};
use crate::scheduler::table::{ChunkState, DispatchTable};

const WRITE_THROTTLE_MS: u128 = 2000;
const MIN_STALE_MS: i64 = 60_000;

/// Terminal state of one chunk execution, as reported by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    Completed,
    Failed,
    /// The worker declined the chunk without attempting it.
    Abandoned,
}

impl std::fmt::Display for CompletionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionState::Completed => write!(f, "completed"),
            CompletionState::Failed => write!(f, "failed"),
            CompletionState::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Side effects emitted by a scheduler cycle, routed by `Node`.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutbound {
    /// Write a command into a peer's inbox.
    Command {
        target: String,
        command_type: CommandType,
        job_id: String,
        reason: String,
        chunk: Option<ChunkRange>,
    },
    /// Hand a chunk to this node's own render coordinator.
    LocalDispatch {
        manifest: JobManifest,
        chunk: ChunkRange,
    },
}

#[derive(Debug, Clone)]
struct Assignment {
    job_id: String,
    chunk: ChunkRange,
    assigned_at_ms: i64,
}

/// Coordinator-only chunk scheduler. Re-enterable on restart via
/// `dispatch.json` recovery.
#[derive(Debug)]
pub struct DispatchManager {
    farm_path: PathBuf,
    node_id: String,
    timing: TimingConfig,
    log: MonitorLog,
    outbound: mpsc::UnboundedSender<DispatchOutbound>,

    /// At most one active assignment per worker.
    assignments: HashMap<String, Assignment>,
    dispatch_tables: HashMap<String, DispatchTable>,
    dirty_tables: HashSet<String>,
    completion_written: HashSet<String>,
    local_completions: VecDeque<(String, ChunkRange, CompletionState)>,
    worker_reports: VecDeque<Action>,
    recovered: bool,
    node_active: bool,
    last_write: Option<Instant>,
}

impl DispatchManager {
    pub fn new(
        farm_path: &std::path::Path,
        node_id: String,
        timing: TimingConfig,
        log: MonitorLog,
        outbound: mpsc::UnboundedSender<DispatchOutbound>,
    ) -> Self {
        log.info("dispatch", "Started as coordinator");
        Self {
            farm_path: farm_path.to_path_buf(),
            node_id,
            timing,
            log,
            outbound,
            assignments: HashMap::new(),
            dispatch_tables: HashMap::new(),
            dirty_tables: HashSet::new(),
            completion_written: HashSet::new(),
            local_completions: VecDeque::new(),
            worker_reports: VecDeque::new(),
            recovered: false,
            node_active: true,
            last_write: None,
        }
    }

    pub fn update_timing(&mut self, timing: TimingConfig) {
        self.timing = timing;
    }

    pub fn set_node_active(&mut self, active: bool) {
        self.node_active = active;
    }

    /// Worker report (`chunk_completed` / `chunk_failed`) from the inbox.
    pub fn process_action(&mut self, action: Action) {
        if matches!(
            action.command_type,
            CommandType::ChunkCompleted | CommandType::ChunkFailed
        ) {
            self.worker_reports.push_back(action);
        }
    }

    /// Terminal report from this node's own render coordinator.
    pub fn queue_local_completion(
        &mut self,
        job_id: String,
        chunk: ChunkRange,
        state: CompletionState,
    ) {
        self.local_completions.push_back((job_id, chunk, state));
    }

    /// One scheduler cycle.
    pub fn update(&mut self, nodes: &[NodeInfo], jobs: &[JobInfo]) {
        if !self.recovered {
            self.recover_from_disk(nodes, jobs);
            self.recovered = true;
        }

        for job in jobs {
            if job.current_state == JobState::Active
                && !self.dispatch_tables.contains_key(&job.manifest.job_id)
            {
                self.init_dispatch_table(&job.manifest);
            }
        }

        self.process_local_completions(jobs);
        self.process_worker_reports(jobs);
        self.detect_dead_workers(nodes, jobs);
        self.check_job_completions(jobs);

        if self.node_active {
            self.assign_work(nodes, jobs);
        }

        self.write_dispatch_tables(false);
    }

    /// Flush dirty tables once before returning; call on shutdown.
    pub fn stop(&mut self) {
        self.write_dispatch_tables(true);
        self.log.info("dispatch", "Stopped");
    }

    /// Owned copy of the in-memory dispatch tables, for the UI cache.
    pub fn table_snapshot(&self) -> HashMap<String, DispatchTable> {
        self.dispatch_tables.clone()
    }

    // ─── Cycle steps ─────────────────────────────────────────────────────

    fn process_local_completions(&mut self, jobs: &[JobInfo]) {
        while let Some((job_id, chunk, state)) = self.local_completions.pop_front() {
            match state {
                CompletionState::Completed => self.mark_chunk_completed(&job_id, chunk),
                CompletionState::Failed => self.mark_chunk_failed(&job_id, chunk, jobs),
                CompletionState::Abandoned => self.mark_chunk_released(&job_id, chunk),
            }

            if self
                .assignments
                .get(&self.node_id)
                .is_some_and(|a| a.job_id == job_id)
            {
                self.assignments.remove(&self.node_id);
            }

            self.log.info(
                "dispatch",
                format!("Local {state}: job={job_id} chunk={}", chunk.range_str()),
            );
        }
    }

    fn process_worker_reports(&mut self, jobs: &[JobInfo]) {
        while let Some(action) = self.worker_reports.pop_front() {
            let Some(chunk) = action.chunk else { continue };

            match action.command_type {
                CommandType::ChunkCompleted => self.mark_chunk_completed(&action.job_id, chunk),
                // A busy worker rejecting a duplicate assignment is still
                // rendering its original chunk; touch nothing.
                CommandType::ChunkFailed if action.reason == "worker_busy" => continue,
                // An abandoned chunk was never attempted; it goes back to
                // pending without burning a retry.
                CommandType::ChunkFailed if action.reason == "abandoned" => {
                    self.mark_chunk_released(&action.job_id, chunk)
                }
                CommandType::ChunkFailed => self.mark_chunk_failed(&action.job_id, chunk, jobs),
                _ => continue,
            }

            if self
                .assignments
                .get(&action.from)
                .is_some_and(|a| a.job_id == action.job_id)
            {
                self.assignments.remove(&action.from);
            }

            self.log.info(
                "dispatch",
                format!(
                    "Worker {} from {}: job={}",
                    action.command_type, action.from, action.job_id
                ),
            );
        }
    }

    fn mark_chunk_completed(&mut self, job_id: &str, chunk: ChunkRange) {
        let Some(table) = self.dispatch_tables.get_mut(job_id) else {
            return;
        };
        if let Some(dc) = table.find_chunk_mut(chunk) {
            dc.state = ChunkState::Completed;
            dc.completed_at_ms = Utc::now().timestamp_millis();
            self.dirty_tables.insert(job_id.to_string());
        }
    }

    /// A failure bumps the retry counter, then returns the chunk to pending
    /// unless retries are exhausted.
    fn mark_chunk_failed(&mut self, job_id: &str, chunk: ChunkRange, jobs: &[JobInfo]) {
        let max_retries = max_retries_for(jobs, job_id);
        let Some(table) = self.dispatch_tables.get_mut(job_id) else {
            return;
        };
        if let Some(dc) = table.find_chunk_mut(chunk) {
            dc.retry_count += 1;
            if dc.retry_count >= max_retries {
                dc.state = ChunkState::Failed;
                dc.assigned_to.clear();
                dc.assigned_at_ms = 0;
            } else {
                dc.release();
            }
            self.dirty_tables.insert(job_id.to_string());
        }
    }

    fn mark_chunk_released(&mut self, job_id: &str, chunk: ChunkRange) {
        let Some(table) = self.dispatch_tables.get_mut(job_id) else {
            return;
        };
        if let Some(dc) = table.find_chunk_mut(chunk) {
            dc.release();
            self.dirty_tables.insert(job_id.to_string());
        }
    }

    /// Reap assignments held by dead or reclaim-eligible workers, and
    /// assignments that sat unacknowledged past the stale timeout while the
    /// worker's heartbeat shows it is not rendering the job.
    fn detect_dead_workers(&mut self, nodes: &[NodeInfo], jobs: &[JobInfo]) {
        let now = Utc::now().timestamp_millis();
        // Generous: command propagation + inbox poll + render start.
        let stale_ms = MIN_STALE_MS.max(
            self.timing.dead_threshold_scans as i64 * self.timing.heartbeat_interval_ms as i64 * 2,
        );

        let mut stale_holders = Vec::new();
        for (holder, assignment) in &self.assignments {
            if *holder == self.node_id {
                continue; // self is never stale
            }

            if is_node_gone(holder, nodes) {
                stale_holders.push(holder.clone());
                continue;
            }

            let age = now - assignment.assigned_at_ms;
            if age > stale_ms {
                let rendering_this_job = nodes.iter().any(|n| {
                    n.heartbeat.node_id == *holder
                        && n.heartbeat.render_state == crate::heartbeat::RenderState::Rendering
                        && n.heartbeat.active_job.as_deref() == Some(assignment.job_id.as_str())
                });
                if !rendering_this_job {
                    self.log.warn(
                        "dispatch",
                        format!(
                            "Stale assignment to {holder} chunk={} job={} (age={}s, worker not rendering)",
                            assignment.chunk.range_str(),
                            assignment.job_id,
                            age / 1000
                        ),
                    );
                    stale_holders.push(holder.clone());
                }
            }
        }

        for holder in stale_holders {
            let Some(assignment) = self.assignments.remove(&holder) else {
                continue;
            };
            let max_retries = max_retries_for(jobs, &assignment.job_id);
            if let Some(table) = self.dispatch_tables.get_mut(&assignment.job_id) {
                if let Some(dc) = table
                    .find_chunk_mut(assignment.chunk)
                    .filter(|dc| dc.state == ChunkState::Assigned)
                {
                    dc.retry_count += 1;
                    if dc.retry_count >= max_retries {
                        dc.state = ChunkState::Failed;
                        dc.assigned_to.clear();
                        dc.assigned_at_ms = 0;
                    } else {
                        dc.release();
                    }
                    self.dirty_tables.insert(assignment.job_id.clone());
                    self.log.warn(
                        "dispatch",
                        format!(
                            "Reassigning chunk {} from {holder} for job {}",
                            assignment.chunk.range_str(),
                            assignment.job_id
                        ),
                    );
                }
            }
        }
    }

    /// When every chunk of an active job is completed, append the terminal
    /// state entry exactly once.
    fn check_job_completions(&mut self, jobs: &[JobInfo]) {
        for job in jobs {
            if job.current_state != JobState::Active {
                continue;
            }
            let job_id = &job.manifest.job_id;
            if self.completion_written.contains(job_id) {
                continue;
            }
            let Some(table) = self.dispatch_tables.get(job_id) else {
                continue;
            };
            if !table.all_completed() {
                continue;
            }

            let now = Utc::now().timestamp_millis();
            let entry = JobStateEntry {
                version: 1,
                state: JobState::Completed,
                priority: 0,
                node_id: self.node_id.clone(),
                timestamp_ms: now,
            };
            let state_dir = self.farm_path.join("jobs").join(job_id).join("state");
            let _ = std::fs::create_dir_all(&state_dir);
            let name = format!("{now}_{}.json", self.node_id);
            if let Err(e) = fsio::write_json(&state_dir.join(name), &entry) {
                self.log
                    .error("dispatch", format!("Failed to write completion for {job_id}: {e}"));
                continue;
            }

            self.completion_written.insert(job_id.clone());
            self.log.info("dispatch", format!("JOB COMPLETED: {job_id}"));
        }
    }

    /// Map idle workers to pending chunks: jobs in priority order, one
    /// assignment per worker per cycle.
    fn assign_work(&mut self, nodes: &[NodeInfo], jobs: &[JobInfo]) {
        let idle_workers: Vec<&NodeInfo> = nodes
            .iter()
            .filter(|n| n.assignable() && !self.assignments.contains_key(&n.heartbeat.node_id))
            .collect();
        if idle_workers.is_empty() {
            return;
        }

        let mut active_jobs: Vec<&JobInfo> = jobs
            .iter()
            .filter(|j| j.current_state == JobState::Active)
            .collect();
        active_jobs.sort_by(|a, b| b.current_priority.cmp(&a.current_priority));

        for worker in idle_workers {
            let worker_id = &worker.heartbeat.node_id;
            let worker_os = &worker.heartbeat.os;
            let worker_tags = &worker.heartbeat.tags;

            for job in &active_jobs {
                let job_id = &job.manifest.job_id;

                if job.manifest.cmd_for_os(worker_os).is_none() {
                    continue;
                }
                if !has_required_tags(&job.manifest.tags_required, worker_tags) {
                    self.log.warn(
                        "dispatch",
                        format!(
                            "Tag mismatch: job '{job_id}' requires [{}], worker {worker_id} has [{}]",
                            job.manifest.tags_required.join(","),
                            worker_tags.join(",")
                        ),
                    );
                    continue;
                }

                let Some(table) = self.dispatch_tables.get_mut(job_id) else {
                    continue;
                };
                let Some(pending) = table.first_pending_mut() else {
                    continue;
                };

                pending.state = ChunkState::Assigned;
                pending.assigned_to = worker_id.clone();
                pending.assigned_at_ms = Utc::now().timestamp_millis();
                let chunk = pending.range();
                let assigned_at_ms = pending.assigned_at_ms;
                self.dirty_tables.insert(job_id.clone());

                self.assignments.insert(
                    worker_id.clone(),
                    Assignment {
                        job_id: job_id.clone(),
                        chunk,
                        assigned_at_ms,
                    },
                );

                if *worker_id == self.node_id {
                    let _ = self.outbound.send(DispatchOutbound::LocalDispatch {
                        manifest: job.manifest.clone(),
                        chunk,
                    });
                    self.log.info(
                        "dispatch",
                        format!("Self-assigned: job={job_id} chunk={}", chunk.range_str()),
                    );
                } else {
                    let _ = self.outbound.send(DispatchOutbound::Command {
                        target: worker_id.clone(),
                        command_type: CommandType::AssignChunk,
                        job_id: job_id.clone(),
                        reason: "coordinator_dispatch".to_string(),
                        chunk: Some(chunk),
                    });
                    self.log.info(
                        "dispatch",
                        format!(
                            "Assigned to {worker_id}: job={job_id} chunk={}",
                            chunk.range_str()
                        ),
                    );
                }

                break; // one assignment per worker per cycle
            }
        }
    }

    fn write_dispatch_tables(&mut self, force: bool) {
        if self.dirty_tables.is_empty() {
            return;
        }
        if !force {
            if let Some(last) = self.last_write {
                if last.elapsed().as_millis() < WRITE_THROTTLE_MS {
                    return;
                }
            }
        }
        self.last_write = Some(Instant::now());

        for job_id in self.dirty_tables.drain() {
            let Some(table) = self.dispatch_tables.get_mut(&job_id) else {
                continue;
            };
            table.updated_at_ms = Utc::now().timestamp_millis();
            table.coordinator_id = self.node_id.clone();

            let path = self.farm_path.join("jobs").join(&job_id).join("dispatch.json");
            if let Err(e) = fsio::write_json(&path, table) {
                self.log
                    .error("dispatch", format!("Failed to write dispatch table {job_id}: {e}"));
            }
        }
    }

    // ─── Job state change hooks ──────────────────────────────────────────

    pub fn handle_job_state_change(&mut self, job_id: &str, new_state: JobState, jobs: &[JobInfo]) {
        match new_state {
            JobState::Paused | JobState::Cancelled => {
                let reason = match new_state {
                    JobState::Paused => "job_paused",
                    _ => "job_cancelled",
                };

                let holders: Vec<String> = self
                    .assignments
                    .iter()
                    .filter(|(_, a)| a.job_id == job_id)
                    .map(|(holder, _)| holder.clone())
                    .collect();
                for holder in holders {
                    if holder != self.node_id {
                        if let Some(a) = self.assignments.get(&holder) {
                            let _ = self.outbound.send(DispatchOutbound::Command {
                                target: holder.clone(),
                                command_type: CommandType::AbortChunk,
                                job_id: job_id.to_string(),
                                reason: reason.to_string(),
                                chunk: Some(a.chunk),
                            });
                        }
                    }
                    self.assignments.remove(&holder);
                }

                if let Some(table) = self.dispatch_tables.get_mut(job_id) {
                    for dc in &mut table.chunks {
                        if dc.state == ChunkState::Assigned {
                            dc.release();
                        }
                    }
                    self.dirty_tables.insert(job_id.to_string());
                }
            }
            JobState::Active => {
                // Resume: the table may have been cleaned up since pausing.
                if !self.dispatch_tables.contains_key(job_id) {
                    if let Some(job) = jobs.iter().find(|j| j.manifest.job_id == job_id) {
                        self.init_dispatch_table(&job.manifest);
                    }
                }
            }
            _ => {}
        }
    }

    // ─── Manual chunk controls ───────────────────────────────────────────

    /// Pull an assigned chunk back: abort the holder, return it to pending.
    pub fn reassign_chunk(&mut self, job_id: &str, chunk: ChunkRange) {
        let Some(table) = self.dispatch_tables.get_mut(job_id) else {
            return;
        };
        let Some(dc) = table
            .find_chunk_mut(chunk)
            .filter(|dc| dc.state == ChunkState::Assigned)
        else {
            return;
        };

        if !dc.assigned_to.is_empty() {
            // A self-assigned chunk is aborted through our own inbox and
            // picked up on the next poll, same as any other worker.
            let _ = self.outbound.send(DispatchOutbound::Command {
                target: dc.assigned_to.clone(),
                command_type: CommandType::AbortChunk,
                job_id: job_id.to_string(),
                reason: "coordinator_reassign".to_string(),
                chunk: Some(chunk),
            });
            self.assignments.remove(&dc.assigned_to);
        }

        dc.release();
        self.dirty_tables.insert(job_id.to_string());
        self.log.info(
            "dispatch",
            format!(
                "Manual reassign: job={job_id} chunk={}-{}",
                chunk.frame_start, chunk.frame_end
            ),
        );
    }

    /// Move a failed chunk back to pending. `retry_count` is kept so
    /// `max_retries` still binds.
    pub fn retry_failed_chunk(&mut self, job_id: &str, chunk: ChunkRange) {
        let Some(table) = self.dispatch_tables.get_mut(job_id) else {
            return;
        };
        let Some(dc) = table
            .find_chunk_mut(chunk)
            .filter(|dc| dc.state == ChunkState::Failed)
        else {
            return;
        };

        dc.release();
        self.dirty_tables.insert(job_id.to_string());
        self.log.info(
            "dispatch",
            format!(
                "Manual retry: job={job_id} chunk={}-{}",
                chunk.frame_start, chunk.frame_end
            ),
        );
    }

    // ─── Table lifecycle ─────────────────────────────────────────────────

    fn init_dispatch_table(&mut self, manifest: &JobManifest) {
        let chunks = compute_chunks(manifest.frame_start, manifest.frame_end, manifest.chunk_size);
        let table = DispatchTable {
            version: 1,
            coordinator_id: self.node_id.clone(),
            updated_at_ms: Utc::now().timestamp_millis(),
            chunks: chunks
                .iter()
                .map(|c| crate::scheduler::table::DispatchChunk::new(*c))
                .collect(),
        };

        self.log.info(
            "dispatch",
            format!("Init dispatch table: job={} chunks={}", manifest.job_id, chunks.len()),
        );
        self.dispatch_tables.insert(manifest.job_id.clone(), table);
        self.dirty_tables.insert(manifest.job_id.clone());
    }

    /// One-time recovery on the first cycle after restart: reload each
    /// active job's table, demote chunks assigned to dead or unknown
    /// workers, and rebuild the in-memory assignment map for live holders so
    /// stale detection can watch them.
    fn recover_from_disk(&mut self, nodes: &[NodeInfo], jobs: &[JobInfo]) {
        for job in jobs {
            if job.current_state != JobState::Active {
                continue;
            }
            let job_id = &job.manifest.job_id;
            let path = self.farm_path.join("jobs").join(job_id).join("dispatch.json");

            let Some(mut table) = fsio::safe_read_json::<DispatchTable>(&path) else {
                continue;
            };

            for dc in &mut table.chunks {
                if dc.state != ChunkState::Assigned {
                    continue;
                }
                if dc.assigned_to.is_empty() || is_node_gone(&dc.assigned_to, nodes) {
                    dc.release();
                } else {
                    self.assignments.insert(
                        dc.assigned_to.clone(),
                        Assignment {
                            job_id: job_id.clone(),
                            chunk: dc.range(),
                            assigned_at_ms: dc.assigned_at_ms,
                        },
                    );
                }
            }

            self.dispatch_tables.insert(job_id.clone(), table);
            self.dirty_tables.insert(job_id.clone());
            self.log
                .info("dispatch", format!("Recovered dispatch table: {job_id}"));
        }
    }
}

/// Whether a worker's chunks may be taken back: unknown to the snapshot, or
/// dead past the grace scan, or self-declared `stopped`.
fn is_node_gone(node_id: &str, nodes: &[NodeInfo]) -> bool {
    match nodes.iter().find(|n| n.heartbeat.node_id == node_id) {
        Some(info) => info.reclaim_eligible(),
        None => true,
    }
}

fn has_required_tags(required: &[String], node_tags: &[String]) -> bool {
    required.iter().all(|req| node_tags.contains(req))
}

fn max_retries_for(jobs: &[JobInfo], job_id: &str) -> u32 {
    jobs.iter()
        .find(|j| j.manifest.job_id == job_id)
        .map(|j| j.manifest.max_retries)
        .unwrap_or(3)
}
