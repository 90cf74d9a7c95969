//! Liveness layer: heartbeat publication, peer scanning, staleness and
//! clock-skew detection.
//!
//! Peers judge liveness by watching `seq` advance, never by comparing
//! wall-clock timestamps, so the scheme tolerates clock skew between
//! machines. A peer whose `seq` stays flat for `dead_threshold_scans`
//! consecutive scans is declared dead, with a one-scan grace before its
//! chunks become reclaimable.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::{TimingConfig, APP_VERSION, CLOCK_SKEW_WARN_MS, PROTOCOL_VERSION};
use crate::fsio;
use crate::monlog::MonitorLog;

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Active,
    Stopped,
    Draining,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Active => write!(f, "active"),
            NodeState::Stopped => write!(f, "stopped"),
            NodeState::Draining => write!(f, "draining"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderState {
    Idle,
    Rendering,
}

/// The on-disk heartbeat record, written atomically to
/// `nodes/{node_id}/heartbeat.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(rename = "_version", default = "default_version")]
    pub version: u32,
    pub node_id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub app_version: String,
    #[serde(default = "default_version")]
    pub protocol_version: u32,
    /// Strictly monotonic per-node publication counter.
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub timestamp_ms: i64,
    pub node_state: NodeState,
    pub render_state: RenderState,
    #[serde(default)]
    pub active_job: Option<String>,
    #[serde(default)]
    pub active_frames: Option<String>,
    #[serde(default)]
    pub gpu_name: String,
    #[serde(default)]
    pub cpu_cores: u32,
    #[serde(default)]
    pub ram_gb: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_coordinator: bool,
    #[serde(default)]
    pub last_cmd_timestamp_ms: i64,
}

/// Derived liveness of a peer, separate from its self-reported `node_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// Declared dead; one-scan grace before reclamation.
    Dead,
    /// Dead for more than one scan past the threshold; assignments may be
    /// taken back.
    Reclaimable,
}

/// A peer as seen from this node: last heartbeat plus staleness bookkeeping.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub heartbeat: Heartbeat,
    pub is_local: bool,
    pub liveness: Liveness,
    pub stale_count: u32,
    pub last_seen_seq: u64,
    pub clock_skew_warning: bool,
    pub skew_ms: i64,
}

impl NodeInfo {
    fn discovered(heartbeat: Heartbeat, is_local: bool) -> Self {
        // A newly discovered peer must prove liveness by advancing seq.
        let seq = heartbeat.seq;
        Self {
            heartbeat,
            is_local,
            liveness: if is_local {
                Liveness::Alive
            } else {
                Liveness::Reclaimable
            },
            stale_count: 0,
            last_seen_seq: seq,
            clock_skew_warning: false,
            skew_ms: 0,
        }
    }

    pub fn is_dead(&self) -> bool {
        !matches!(self.liveness, Liveness::Alive)
    }

    /// Whether this peer's assignments may be taken back. A `stopped` peer
    /// is alive but explicitly out of the pool, so its chunks are fair game.
    pub fn reclaim_eligible(&self) -> bool {
        matches!(self.liveness, Liveness::Reclaimable)
            || self.heartbeat.node_state == NodeState::Stopped
    }

    /// Whether the scheduler may hand this peer new work.
    pub fn assignable(&self) -> bool {
        !self.is_dead()
            && self.heartbeat.node_state == NodeState::Active
            && self.heartbeat.render_state == RenderState::Idle
    }
}

/// System facts stamped into every heartbeat.
#[derive(Debug, Clone, Default)]
pub struct SystemInfo {
    pub hostname: String,
    pub gpu_name: String,
    pub cpu_cores: u32,
    pub ram_gb: u64,
}

impl SystemInfo {
    pub fn detect() -> Self {
        let hostname = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(0);
        Self {
            hostname,
            gpu_name: String::new(),
            cpu_cores,
            ram_gb: 0,
        }
    }
}

pub fn current_os() -> &'static str {
    if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "macos") {
        "macos"
    } else {
        "linux"
    }
}

#[derive(Debug)]
struct State {
    seq: u64,
    timing: TimingConfig,
    tags: Vec<String>,
    node_state: NodeState,
    render_state: RenderState,
    active_job: Option<String>,
    active_frames: Option<String>,
    is_coordinator: bool,
    last_cmd_timestamp_ms: i64,
    local_clock_skew: bool,
    nodes: HashMap<String, NodeInfo>,
}

/// Maintains this node's presence in the farm and a liveness view of peers.
#[derive(Debug, Clone)]
pub struct HeartbeatManager {
    node_id: String,
    sysinfo: SystemInfo,
    os: &'static str,
    nodes_dir: PathBuf,
    log: MonitorLog,
    state: Arc<Mutex<State>>,
}

impl HeartbeatManager {
    pub fn new(
        farm_path: &std::path::Path,
        node_id: String,
        sysinfo: SystemInfo,
        timing: TimingConfig,
        tags: Vec<String>,
        log: MonitorLog,
    ) -> Self {
        Self {
            node_id,
            sysinfo,
            os: current_os(),
            nodes_dir: farm_path.join("nodes"),
            log,
            state: Arc::new(Mutex::new(State {
                seq: 0,
                timing,
                tags,
                node_state: NodeState::Active,
                render_state: RenderState::Idle,
                active_job: None,
                active_frames: None,
                is_coordinator: false,
                last_cmd_timestamp_ms: 0,
                local_clock_skew: false,
                nodes: HashMap::new(),
            })),
        }
    }

    /// Publish heartbeats and scan peers until cancelled, then publish the
    /// final `stopped` heartbeat.
    pub async fn run(self, cancel: CancellationToken) {
        let log = self.log.clone();
        {
            let timing = self.state.lock().unwrap().timing;
            log.info(
                "health",
                format!(
                    "Started (heartbeat={}ms, scan={}ms, dead_scans={})",
                    timing.heartbeat_interval_ms,
                    timing.scan_interval_ms,
                    timing.dead_threshold_scans
                ),
            );
        }

        // First heartbeat immediately, so peers see us before the first tick.
        self.publish_heartbeat();

        let mut last_heartbeat = Instant::now();
        let mut last_scan: Option<Instant> = None;

        loop {
            let timing = self.state.lock().unwrap().timing;

            if last_heartbeat.elapsed().as_millis() as u64 >= timing.heartbeat_interval_ms {
                self.publish_heartbeat();
                last_heartbeat = Instant::now();
            }

            let scan_due = match last_scan {
                None => true,
                Some(t) => t.elapsed().as_millis() as u64 >= timing.scan_interval_ms,
            };
            if scan_due {
                self.scan_peers();
                last_scan = Some(Instant::now());
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }

        self.publish_final_heartbeat();
        log.info("health", "Stopped");
    }

    fn publish_heartbeat(&self) {
        let mut state = self.state.lock().unwrap();
        state.seq += 1;
        let hb = self.build_heartbeat(&state);
        let seq = hb.seq;

        let info = NodeInfo {
            heartbeat: hb.clone(),
            is_local: true,
            liveness: Liveness::Alive,
            stale_count: 0,
            last_seen_seq: seq,
            clock_skew_warning: false,
            skew_ms: 0,
        };
        state.nodes.insert(self.node_id.clone(), info);
        drop(state);

        let path = self.nodes_dir.join(&self.node_id).join("heartbeat.json");
        if let Err(e) = fsio::write_json(&path, &hb) {
            self.log
                .error("health", format!("Failed to write heartbeat (seq={seq}): {e}"));
        }
    }

    fn publish_final_heartbeat(&self) {
        let mut state = self.state.lock().unwrap();
        state.seq += 1;
        let mut hb = self.build_heartbeat(&state);
        hb.node_state = NodeState::Stopped;
        drop(state);

        let path = self.nodes_dir.join(&self.node_id).join("heartbeat.json");
        let _ = fsio::write_json(&path, &hb);
    }

    fn build_heartbeat(&self, state: &State) -> Heartbeat {
        Heartbeat {
            version: 1,
            node_id: self.node_id.clone(),
            hostname: self.sysinfo.hostname.clone(),
            os: self.os.to_string(),
            app_version: APP_VERSION.to_string(),
            protocol_version: PROTOCOL_VERSION,
            seq: state.seq,
            timestamp_ms: Utc::now().timestamp_millis(),
            node_state: state.node_state,
            render_state: state.render_state,
            active_job: state.active_job.clone(),
            active_frames: state.active_frames.clone(),
            gpu_name: self.sysinfo.gpu_name.clone(),
            cpu_cores: self.sysinfo.cpu_cores,
            ram_gb: self.sysinfo.ram_gb,
            tags: state.tags.clone(),
            is_coordinator: state.is_coordinator,
            last_cmd_timestamp_ms: state.last_cmd_timestamp_ms,
        }
    }

    /// Scan `nodes/*/heartbeat.json`, fold each into the peer map, then run
    /// staleness and clock-skew detection.
    pub fn scan_peers(&self) {
        let mut scanned: Vec<(String, Heartbeat)> = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.nodes_dir) {
            for entry in entries.flatten() {
                if !entry.path().is_dir() {
                    continue;
                }
                let peer_id = entry.file_name().to_string_lossy().to_string();
                let hb_path = entry.path().join("heartbeat.json");
                if let Some(hb) = fsio::safe_read_json::<Heartbeat>(&hb_path) {
                    scanned.push((peer_id, hb));
                }
            }
        }

        let mut state = self.state.lock().unwrap();
        for (peer_id, hb) in scanned {
            let is_local = peer_id == self.node_id;
            match state.nodes.entry(peer_id) {
                std::collections::hash_map::Entry::Occupied(mut entry) => {
                    let info = entry.get_mut();
                    info.heartbeat = hb;
                    info.is_local = is_local;
                }
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(NodeInfo::discovered(hb, is_local));
                }
            }
        }

        let timing = state.timing;
        let newly_dead = detect_staleness(&mut state.nodes, timing.dead_threshold_scans);
        let now_ms = Utc::now().timestamp_millis();
        state.local_clock_skew = detect_clock_skew(&mut state.nodes, now_ms);
        drop(state);

        for (id, stale_count) in newly_dead {
            self.log
                .warn("health", format!("Node DEAD: {id} (stale for {stale_count} scans)"));
        }
    }

    /// Owned copy of the in-memory peer map.
    pub fn get_node_snapshot(&self) -> Vec<NodeInfo> {
        self.state.lock().unwrap().nodes.values().cloned().collect()
    }

    pub fn local_clock_skew(&self) -> bool {
        self.state.lock().unwrap().local_clock_skew
    }

    pub fn update_timing(&self, timing: TimingConfig) {
        self.state.lock().unwrap().timing = timing;
    }

    pub fn update_tags(&self, tags: Vec<String>) {
        self.state.lock().unwrap().tags = tags;
    }

    pub fn set_is_coordinator(&self, coordinator: bool) {
        self.state.lock().unwrap().is_coordinator = coordinator;
    }

    pub fn set_node_state(&self, node_state: NodeState) {
        self.state.lock().unwrap().node_state = node_state;
    }

    pub fn set_render_state(
        &self,
        render_state: RenderState,
        active_job: Option<String>,
        active_frames: Option<String>,
    ) {
        let mut state = self.state.lock().unwrap();
        state.render_state = render_state;
        state.active_job = active_job;
        state.active_frames = active_frames;
    }

    /// Stamp the moment this node last consumed a command from its inbox.
    pub fn note_command_consumed(&self) {
        self.state.lock().unwrap().last_cmd_timestamp_ms = Utc::now().timestamp_millis();
    }
}

/// Fold one scan's observations into staleness state. Returns peers that
/// transitioned to dead this scan, for logging.
pub fn detect_staleness(
    nodes: &mut HashMap<String, NodeInfo>,
    dead_threshold_scans: u32,
) -> Vec<(String, u32)> {
    let mut newly_dead = Vec::new();

    for (id, info) in nodes.iter_mut() {
        if info.is_local {
            continue;
        }

        if info.heartbeat.seq == info.last_seen_seq {
            info.stale_count += 1;
        } else {
            info.stale_count = 0;
            info.liveness = Liveness::Alive;
        }
        info.last_seen_seq = info.heartbeat.seq;

        if info.stale_count >= dead_threshold_scans {
            match info.liveness {
                Liveness::Alive => {
                    // One-scan grace before assignments may be reclaimed.
                    info.liveness = Liveness::Dead;
                    newly_dead.push((id.clone(), info.stale_count));
                }
                Liveness::Dead => info.liveness = Liveness::Reclaimable,
                Liveness::Reclaimable => {}
            }
        }
    }

    newly_dead
}

/// Flag peers whose wall clock disagrees with ours by more than the warning
/// threshold. Returns true when a strict majority of alive peers look
/// skewed, meaning this node is probably the outlier.
pub fn detect_clock_skew(nodes: &mut HashMap<String, NodeInfo>, now_ms: i64) -> bool {
    let mut alive = 0u32;
    let mut skewed = 0u32;

    for info in nodes.values_mut() {
        if info.is_local || info.is_dead() {
            continue;
        }
        alive += 1;
        info.skew_ms = now_ms - info.heartbeat.timestamp_ms;
        info.clock_skew_warning = info.skew_ms.abs() > CLOCK_SKEW_WARN_MS;
        if info.clock_skew_warning {
            skewed += 1;
        }
    }

    alive > 0 && skewed > alive / 2
}
