//! Node orchestration: wires every component together and routes actions
//! between them.
//!
//! One `Node` is one peer process. Background scanners run as spawned
//! tasks; the dispatch manager and render coordinator have no task of
//! their own and are driven from the main loop here.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::{Action, CommandManager, CommandType};
use crate::cache::UiDataCache;
use crate::config::Config;
use crate::error::{FarmError, Result};
use crate::farm;
use crate::fsio;
use crate::heartbeat::{current_os, HeartbeatManager, NodeState, RenderState, SystemInfo};
use crate::jobs::manifest::{JobManifest, JobState};
use crate::jobs::{JobManager, TemplateManager};
use crate::monlog::MonitorLog;
use crate::scheduler::chunk::ChunkRange;
use crate::scheduler::dispatch::{CompletionState, DispatchManager, DispatchOutbound};
use crate::scheduler::SubmissionManager;
use crate::worker::render::ChunkReport;
use crate::worker::{AgentSupervisor, RenderCoordinator};

const MAIN_LOOP_TICK: Duration = Duration::from_millis(250);
/// Push coordinator tables and job lists into the UI cache every N ticks.
const CACHE_SYNC_TICKS: u32 = 8;

/// One peer process: component wiring plus the main action loop.
pub struct Node {
    config: Config,
    node_id: String,
    farm_path: PathBuf,
    log: MonitorLog,

    heartbeat: HeartbeatManager,
    commands: CommandManager,
    jobs: JobManager,
    templates: TemplateManager,
    cache: UiDataCache,
    agent: AgentSupervisor,
    render: RenderCoordinator,
    dispatch: Option<DispatchManager>,
    submission: Option<SubmissionManager>,

    dispatch_rx: mpsc::UnboundedReceiver<DispatchOutbound>,
    reports_rx: mpsc::UnboundedReceiver<ChunkReport>,
    /// Worker completions waiting for a coordinator to reappear.
    pending_completions: Vec<ChunkReport>,
    node_state: NodeState,
}

impl Node {
    /// Initialise the farm tree and every component. Refuses to start as
    /// coordinator while another live coordinator is visible.
    pub async fn start(
        config: Config,
        node_id: String,
        log: MonitorLog,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let farm_path = farm::init(&config.sync_root, &node_id, &log)?;
        log.start_file_logging(&farm_path, &node_id);

        let heartbeat = HeartbeatManager::new(
            &farm_path,
            node_id.clone(),
            SystemInfo::detect(),
            config.timing,
            config.tags.clone(),
            log.clone(),
        );
        heartbeat.set_is_coordinator(config.is_coordinator);

        if config.is_coordinator {
            // A peer proves liveness by advancing seq between two scans, so
            // a crashed coordinator's stale heartbeat doesn't block us.
            heartbeat.scan_peers();
            tokio::time::sleep(Duration::from_millis(
                config.timing.heartbeat_interval_ms + 2000,
            ))
            .await;
            heartbeat.scan_peers();

            let nodes = heartbeat.get_node_snapshot();
            if let Some(other) = farm::find_live_coordinator(&nodes) {
                let err = FarmError::CoordinatorConflict {
                    hostname: other.heartbeat.hostname.clone(),
                    node_id: other.heartbeat.node_id.clone(),
                };
                log.error("farm", err.to_string());
                return Err(err);
            }
        }

        let commands = CommandManager::new(&farm_path, node_id.clone(), log.clone());
        let jobs = JobManager::new(&farm_path, log.clone());
        let templates = TemplateManager::new(&farm_path, log.clone());
        let cache = UiDataCache::new(&farm_path);

        let agent = AgentSupervisor::start(node_id.clone(), log.clone(), cancel.clone());
        if config.auto_start_agent {
            agent.spawn_agent();
        }

        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let render = RenderCoordinator::new(
            &farm_path,
            node_id.clone(),
            current_os().to_string(),
            log.clone(),
            reports_tx,
        );

        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (dispatch, submission) = if config.is_coordinator {
            let dispatch = DispatchManager::new(
                &farm_path,
                node_id.clone(),
                config.timing,
                log.clone(),
                dispatch_tx,
            );
            let submission = SubmissionManager::new(
                &farm_path,
                node_id.clone(),
                current_os().to_string(),
                templates.clone(),
                jobs.clone(),
                log.clone(),
            );
            log.info("farm", "Started as coordinator");
            (Some(dispatch), Some(submission))
        } else {
            log.info("farm", "Started as worker");
            (None, None)
        };

        log.info("farm", format!("Farm started at: {}", farm_path.display()));

        Ok(Self {
            config,
            node_id,
            farm_path,
            log,
            heartbeat,
            commands,
            jobs,
            templates,
            cache,
            agent,
            render,
            dispatch,
            submission,
            dispatch_rx,
            reports_rx,
            pending_completions: Vec::new(),
            node_state: NodeState::Active,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn farm_path(&self) -> &std::path::Path {
        &self.farm_path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn templates(&self) -> &TemplateManager {
        &self.templates
    }

    pub fn cache(&self) -> &UiDataCache {
        &self.cache
    }

    /// Run all background tasks and the main action loop until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        tokio::spawn(self.heartbeat.clone().run(cancel.clone()));
        tokio::spawn(self.commands.clone().run(cancel.clone()));
        tokio::spawn(self.jobs.clone().run(cancel.clone()));
        tokio::spawn(self.templates.clone().run(cancel.clone()));
        tokio::spawn(self.cache.clone().run(cancel.clone()));
        if let Some(submission) = self.submission.take() {
            tokio::spawn(submission.run(cancel.clone()));
        }

        let mut interval = tokio::time::interval(MAIN_LOOP_TICK);
        let mut tick: u32 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            tick = tick.wrapping_add(1);
            self.step(tick);
        }

        self.shutdown().await;
    }

    /// One main-loop cycle. Separated from `run` so tests can drive it.
    pub fn step(&mut self, tick: u32) {
        for msg in self.agent.process_messages() {
            self.render.handle_agent_message(msg);
        }

        let actions = self.commands.pop_actions();
        if !actions.is_empty() {
            self.heartbeat.note_command_consumed();
        }
        for action in actions {
            self.route_action(action);
        }

        if self.dispatch.is_some() {
            let nodes = self.heartbeat.get_node_snapshot();
            let jobs = self.jobs.get_job_snapshot();
            let dispatch = self.dispatch.as_mut().unwrap();
            dispatch.update(&nodes, &jobs);

            if tick % CACHE_SYNC_TICKS == 0 {
                self.cache.set_dispatch_tables(dispatch.table_snapshot());
            }
        }

        while let Ok(outbound) = self.dispatch_rx.try_recv() {
            match outbound {
                DispatchOutbound::Command {
                    target,
                    command_type,
                    job_id,
                    reason,
                    chunk,
                } => {
                    self.commands
                        .send_command(&target, command_type, &job_id, &reason, chunk);
                }
                DispatchOutbound::LocalDispatch { manifest, chunk } => {
                    self.render.queue_dispatch(manifest, chunk);
                }
            }
        }

        self.render.update(&self.agent);

        while let Ok(report) = self.reports_rx.try_recv() {
            self.route_completion(report);
        }

        if self.dispatch.is_none() && !self.pending_completions.is_empty() {
            self.flush_pending_completions();
        }

        if tick % CACHE_SYNC_TICKS == 0 {
            let job_ids = self
                .jobs
                .get_job_snapshot()
                .into_iter()
                .map(|j| j.manifest.job_id)
                .collect();
            self.cache.set_job_ids(job_ids);
        }

        // Mirror render state into the heartbeat so peers can see it.
        if self.render.is_rendering() {
            self.heartbeat.set_render_state(
                RenderState::Rendering,
                self.render.current_job_id().map(str::to_string),
                self.render.current_chunk_label(),
            );
        } else {
            self.heartbeat
                .set_render_state(RenderState::Idle, None, None);
        }
    }

    fn route_action(&mut self, action: Action) {
        match action.command_type {
            CommandType::AssignChunk => self.handle_assign_chunk(&action),
            CommandType::AbortChunk => {
                if self.render.current_job_id() == Some(action.job_id.as_str()) {
                    self.render.abort_current_render(
                        &format!("Coordinator abort: {}", action.reason),
                        &self.agent,
                    );
                }
            }
            CommandType::ChunkCompleted | CommandType::ChunkFailed => {
                if let Some(dispatch) = self.dispatch.as_mut() {
                    dispatch.process_action(action);
                }
            }
            CommandType::StopJob => {
                self.render.purge_job(&action.job_id);
                if self.render.current_job_id() == Some(action.job_id.as_str()) {
                    self.render.abort_current_render(
                        &format!("Remote stop: {}", action.reason),
                        &self.agent,
                    );
                }
            }
            CommandType::StopAll => self.set_node_state(NodeState::Stopped),
            CommandType::ResumeAll => self.set_node_state(NodeState::Active),
        }
    }

    /// Worker side of an `assign_chunk`: load the manifest and hand the
    /// chunk to the render coordinator, or report failure back.
    fn handle_assign_chunk(&mut self, action: &Action) {
        let Some(chunk) = action.chunk else {
            return;
        };

        if self.render.is_rendering() {
            self.report_assign_failure(action, "worker_busy");
            return;
        }

        let manifest_path = self
            .farm_path
            .join("jobs")
            .join(&action.job_id)
            .join("manifest.json");
        let Some(manifest) = fsio::safe_read_json::<JobManifest>(&manifest_path) else {
            self.log.error(
                "farm",
                format!("Can't read manifest for assigned job: {}", action.job_id),
            );
            self.report_assign_failure(action, "manifest_read_failed");
            return;
        };

        self.log.info(
            "farm",
            format!(
                "Accepted assignment: job={} chunk={}",
                action.job_id,
                chunk.range_str()
            ),
        );
        self.render.queue_dispatch(manifest, chunk);
    }

    fn report_assign_failure(&self, action: &Action, reason: &str) {
        if let Some(coord) = self.find_coordinator() {
            self.commands.send_command(
                &coord,
                CommandType::ChunkFailed,
                &action.job_id,
                reason,
                action.chunk,
            );
        }
    }

    fn find_coordinator(&self) -> Option<String> {
        self.heartbeat
            .get_node_snapshot()
            .iter()
            .find(|n| !n.is_dead() && n.heartbeat.is_coordinator)
            .map(|n| n.heartbeat.node_id.clone())
    }

    /// Terminal chunk report from this node's own render coordinator.
    fn route_completion(&mut self, report: ChunkReport) {
        if let Some(dispatch) = self.dispatch.as_mut() {
            dispatch.queue_local_completion(report.job_id, report.chunk, report.state);
            return;
        }

        let Some(coord) = self.find_coordinator() else {
            self.log
                .warn("farm", "No coordinator found, buffering completion for retry");
            self.pending_completions.push(report);
            return;
        };
        send_completion(&self.commands, &coord, &report);
    }

    fn flush_pending_completions(&mut self) {
        let Some(coord) = self.find_coordinator() else {
            return; // still no coordinator, try again next cycle
        };
        for report in &self.pending_completions {
            send_completion(&self.commands, &coord, report);
        }
        self.log.info(
            "farm",
            format!(
                "Flushed {} buffered completion(s) to coordinator",
                self.pending_completions.len()
            ),
        );
        self.pending_completions.clear();
    }

    // ─── Job controls ────────────────────────────────────────────────────

    pub fn pause_job(&mut self, job_id: &str) {
        let priority = self.current_priority(job_id);
        let _ = self
            .jobs
            .write_state_entry(job_id, JobState::Paused, priority, &self.node_id);

        if self.render.current_job_id() == Some(job_id) {
            self.render.abort_current_render("Job paused", &self.agent);
        }
        if let Some(dispatch) = self.dispatch.as_mut() {
            let jobs = self.jobs.get_job_snapshot();
            dispatch.handle_job_state_change(job_id, JobState::Paused, &jobs);
        }
        self.broadcast_stop_job(job_id, "user_request");
        self.log.info("job", format!("Paused job: {job_id}"));
    }

    pub fn resume_job(&mut self, job_id: &str) {
        let priority = self.current_priority(job_id);
        let _ = self
            .jobs
            .write_state_entry(job_id, JobState::Active, priority, &self.node_id);

        if let Some(dispatch) = self.dispatch.as_mut() {
            let jobs = self.jobs.get_job_snapshot();
            dispatch.handle_job_state_change(job_id, JobState::Active, &jobs);
        }
        self.log.info("job", format!("Resumed job: {job_id}"));
    }

    pub fn cancel_job(&mut self, job_id: &str) {
        let _ = self
            .jobs
            .write_state_entry(job_id, JobState::Cancelled, 0, &self.node_id);

        if self.render.current_job_id() == Some(job_id) {
            self.render.abort_current_render("Job cancelled", &self.agent);
        }
        if let Some(dispatch) = self.dispatch.as_mut() {
            let jobs = self.jobs.get_job_snapshot();
            dispatch.handle_job_state_change(job_id, JobState::Cancelled, &jobs);
        }
        self.broadcast_stop_job(job_id, "job_cancelled");
        self.log.info("job", format!("Cancelled job: {job_id}"));
    }

    /// Clone a finished or stuck job as `{base}-requeueN` with a fresh
    /// submission identity, keeping the source job's current priority.
    pub fn requeue_job(&mut self, job_id: &str) -> Option<String> {
        let source = self
            .jobs
            .get_job_snapshot()
            .into_iter()
            .find(|j| j.manifest.job_id == job_id)?;

        let jobs_dir = self.farm_path.join("jobs");
        let base_slug = match job_id.rfind("-requeue") {
            Some(pos) => &job_id[..pos],
            None => job_id,
        };

        // Never recycle an old requeue number.
        let prefix = format!("{base_slug}-requeue");
        let mut max_n = 0u32;
        if let Ok(entries) = std::fs::read_dir(&jobs_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if let Some(n) = name.strip_prefix(&prefix).and_then(|s| s.parse::<u32>().ok()) {
                    max_n = max_n.max(n);
                }
            }
        }
        let new_slug = format!("{prefix}{}", max_n + 1);

        let mut manifest = source.manifest.clone();
        manifest.job_id = new_slug.clone();
        manifest.submitted_by = self.node_id.clone();
        manifest.submitted_at_ms = chrono::Utc::now().timestamp_millis();

        match self.jobs.submit_job(&manifest, source.current_priority) {
            Ok(_) => {
                self.log
                    .info("job", format!("Requeued job: {job_id} -> {new_slug}"));
                Some(new_slug)
            }
            Err(e) => {
                self.log
                    .error("job", format!("Failed to requeue job {job_id}: {e}"));
                None
            }
        }
    }

    /// Cancel, then remove the job directory entirely.
    pub fn delete_job(&mut self, job_id: &str) {
        self.cancel_job(job_id);

        let job_dir = self.farm_path.join("jobs").join(job_id);
        if let Err(e) = std::fs::remove_dir_all(&job_dir) {
            self.log
                .error("job", format!("Failed to delete job dir: {e}"));
        }
        self.jobs.invalidate();
        self.log.info("job", format!("Deleted job: {job_id}"));
    }

    pub fn reassign_chunk(&mut self, job_id: &str, chunk: ChunkRange) {
        if let Some(dispatch) = self.dispatch.as_mut() {
            dispatch.reassign_chunk(job_id, chunk);
        }
    }

    pub fn retry_failed_chunk(&mut self, job_id: &str, chunk: ChunkRange) {
        if let Some(dispatch) = self.dispatch.as_mut() {
            dispatch.retry_failed_chunk(job_id, chunk);
        }
    }

    // ─── Node state ──────────────────────────────────────────────────────

    pub fn set_node_state(&mut self, state: NodeState) {
        self.node_state = state;
        match state {
            NodeState::Active => {
                self.render.set_stopped(false);
                if let Some(dispatch) = self.dispatch.as_mut() {
                    dispatch.set_node_active(true);
                }
                self.heartbeat.set_node_state(NodeState::Active);
                self.log.info("farm", "Node state: Active");
            }
            NodeState::Stopped | NodeState::Draining => {
                if state == NodeState::Stopped && self.render.is_rendering() {
                    self.render.abort_current_render("Node stopped", &self.agent);
                }
                self.render.set_stopped(true);
                if let Some(dispatch) = self.dispatch.as_mut() {
                    dispatch.set_node_active(false);
                }
                self.heartbeat.set_node_state(state);
                self.log.info("farm", format!("Node state: {state}"));
            }
        }
    }

    pub fn node_state(&self) -> NodeState {
        self.node_state
    }

    // ─── Helpers ─────────────────────────────────────────────────────────

    fn current_priority(&self, job_id: &str) -> i32 {
        self.jobs
            .get_job_snapshot()
            .iter()
            .find(|j| j.manifest.job_id == job_id)
            .map(|j| j.current_priority)
            .unwrap_or(50)
    }

    fn broadcast_stop_job(&self, job_id: &str, reason: &str) {
        for node in self.heartbeat.get_node_snapshot() {
            if node.is_local || node.is_dead() {
                continue;
            }
            self.commands.send_command(
                &node.heartbeat.node_id,
                CommandType::StopJob,
                job_id,
                reason,
                None,
            );
        }
    }

    async fn shutdown(&mut self) {
        if let Some(dispatch) = self.dispatch.as_mut() {
            dispatch.stop();
        }
        self.agent.shutdown_agent().await;
        // The heartbeat task publishes the final `stopped` heartbeat as it
        // winds down; give it a moment to land on slow filesystems.
        tokio::time::sleep(Duration::from_millis(700)).await;
        self.log.stop_file_logging();
        self.log.info("farm", "Shutdown complete");
    }
}

fn send_completion(commands: &CommandManager, coordinator: &str, report: &ChunkReport) {
    let command_type = match report.state {
        CompletionState::Completed => CommandType::ChunkCompleted,
        CompletionState::Failed | CompletionState::Abandoned => CommandType::ChunkFailed,
    };
    commands.send_command(
        coordinator,
        command_type,
        &report.job_id,
        &report.state.to_string(),
        Some(report.chunk),
    );
}
