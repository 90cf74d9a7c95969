use std::path::Path;

use tempfile::tempdir;
use tokio::sync::mpsc;

use smallrender::bus::{Action, CommandType};
use smallrender::config::TimingConfig;
use smallrender::heartbeat::{Heartbeat, Liveness, NodeInfo, NodeState, RenderState};
use smallrender::jobs::manifest::{JobInfo, JobManifest, JobState, JobStateEntry};
use smallrender::monlog::MonitorLog;
use smallrender::scheduler::dispatch::{CompletionState, DispatchManager, DispatchOutbound};
use smallrender::scheduler::{ChunkRange, ChunkState, DispatchTable};

const COORD: &str = "c0ffee000001";
const WORKER: &str = "beef00000002";
const WORKER2: &str = "beef00000003";

fn heartbeat(node_id: &str) -> Heartbeat {
    Heartbeat {
        version: 1,
        node_id: node_id.to_string(),
        hostname: format!("host-{node_id}"),
        os: "linux".into(),
        app_version: "0.1.0".into(),
        protocol_version: 1,
        seq: 10,
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
        node_state: NodeState::Active,
        render_state: RenderState::Idle,
        active_job: None,
        active_frames: None,
        gpu_name: String::new(),
        cpu_cores: 8,
        ram_gb: 32,
        tags: Vec::new(),
        is_coordinator: node_id == COORD,
        last_cmd_timestamp_ms: 0,
    }
}

fn alive_node(node_id: &str) -> NodeInfo {
    NodeInfo {
        heartbeat: heartbeat(node_id),
        is_local: node_id == COORD,
        liveness: Liveness::Alive,
        stale_count: 0,
        last_seen_seq: 10,
        clock_skew_warning: false,
        skew_ms: 0,
    }
}

fn dead_node(node_id: &str) -> NodeInfo {
    let mut info = alive_node(node_id);
    info.liveness = Liveness::Reclaimable;
    info
}

fn job(job_id: &str, frame_start: i32, frame_end: i32, chunk_size: i32) -> JobInfo {
    JobInfo {
        manifest: JobManifest {
            job_id: job_id.to_string(),
            submitted_by: COORD.into(),
            submitted_os: "linux".into(),
            submitted_at_ms: 1000,
            cmd: [("linux".to_string(), "/usr/bin/blender".to_string())]
                .into_iter()
                .collect(),
            frame_start,
            frame_end,
            chunk_size,
            max_retries: 3,
            ..Default::default()
        },
        current_state: JobState::Active,
        current_priority: 50,
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    farm: std::path::PathBuf,
    dispatch: DispatchManager,
    rx: mpsc::UnboundedReceiver<DispatchOutbound>,
}

fn fixture() -> Fixture {
    let dir = tempdir().unwrap();
    let farm = dir.path().to_path_buf();
    std::fs::create_dir_all(farm.join("jobs")).unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let dispatch = DispatchManager::new(
        &farm,
        COORD.to_string(),
        TimingConfig::default(),
        MonitorLog::new(),
        tx,
    );
    Fixture {
        _dir: dir,
        farm,
        dispatch,
        rx,
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<DispatchOutbound>) -> Vec<DispatchOutbound> {
    let mut out = Vec::new();
    while let Ok(o) = rx.try_recv() {
        out.push(o);
    }
    out
}

fn read_table(farm: &Path, job_id: &str) -> DispatchTable {
    let path = farm.join("jobs").join(job_id).join("dispatch.json");
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

fn worker_failure(job_id: &str, from: &str, chunk: ChunkRange, reason: &str) -> Action {
    Action {
        command_type: CommandType::ChunkFailed,
        job_id: job_id.to_string(),
        reason: reason.to_string(),
        from: from.to_string(),
        msg_id: format!("1700000000000.{from}"),
        chunk: Some(chunk),
    }
}

// ─── S1: happy path, coordinator alone ──────────────────────────────────────

#[test]
fn single_chunk_job_self_dispatches_and_completes() {
    let mut fx = fixture();
    let nodes = vec![alive_node(COORD)];
    let jobs = vec![job("shot-010", 1, 1, 1)];

    fx.dispatch.update(&nodes, &jobs);

    // One local dispatch for the single chunk.
    let effects = drain(&mut fx.rx);
    assert_eq!(effects.len(), 1);
    match &effects[0] {
        DispatchOutbound::LocalDispatch { manifest, chunk } => {
            assert_eq!(manifest.job_id, "shot-010");
            assert_eq!(*chunk, ChunkRange::new(1, 1));
        }
        other => panic!("expected LocalDispatch, got {other:?}"),
    }

    let table = read_table(&fx.farm, "shot-010");
    assert_eq!(table.chunks.len(), 1);
    assert_eq!(table.chunks[0].state, ChunkState::Assigned);
    assert_eq!(table.chunks[0].assigned_to, COORD);
    assert_eq!(table.coordinator_id, COORD);

    // The render finishes; the next cycle records completion and writes the
    // terminal state entry.
    fx.dispatch
        .queue_local_completion("shot-010".into(), ChunkRange::new(1, 1), CompletionState::Completed);
    fx.dispatch.update(&nodes, &jobs);
    fx.dispatch.stop();

    let table = read_table(&fx.farm, "shot-010");
    assert_eq!(table.chunks[0].state, ChunkState::Completed);
    assert!(table.chunks[0].completed_at_ms > 0);

    let state_dir = fx.farm.join("jobs").join("shot-010").join("state");
    let entries: Vec<JobStateEntry> = std::fs::read_dir(&state_dir)
        .unwrap()
        .flatten()
        .map(|e| serde_json::from_slice(&std::fs::read(e.path()).unwrap()).unwrap())
        .collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].state, JobState::Completed);
    assert_eq!(entries[0].priority, 0);
    assert_eq!(entries[0].node_id, COORD);

    // Completion entry is written exactly once.
    fx.dispatch.update(&nodes, &jobs);
    assert_eq!(std::fs::read_dir(&state_dir).unwrap().count(), 1);
}

// ─── Assignment constraints ─────────────────────────────────────────────────

#[test]
fn one_assignment_per_worker_per_cycle() {
    let mut fx = fixture();
    let nodes = vec![alive_node(WORKER)];
    let jobs = vec![job("a", 1, 10, 1), job("b", 1, 10, 1)];

    fx.dispatch.update(&nodes, &jobs);

    let effects = drain(&mut fx.rx);
    assert_eq!(effects.len(), 1);
    match &effects[0] {
        DispatchOutbound::Command {
            target,
            command_type,
            ..
        } => {
            assert_eq!(target, WORKER);
            assert_eq!(*command_type, CommandType::AssignChunk);
        }
        other => panic!("expected Command, got {other:?}"),
    }

    // Assigned chunks never exceed the idle worker pool.
    let assigned: usize = ["a", "b"]
        .iter()
        .map(|id| {
            read_table(&fx.farm, id)
                .chunks
                .iter()
                .filter(|c| c.state == ChunkState::Assigned)
                .count()
        })
        .sum();
    assert_eq!(assigned, 1);
}

#[test]
fn higher_priority_job_wins() {
    let mut fx = fixture();
    let nodes = vec![alive_node(WORKER)];
    let mut low = job("low", 1, 10, 1);
    low.current_priority = 10;
    let mut high = job("high", 1, 10, 1);
    high.current_priority = 90;

    fx.dispatch.update(&nodes, &[low, high]);

    let effects = drain(&mut fx.rx);
    match &effects[0] {
        DispatchOutbound::Command { job_id, .. } => assert_eq!(job_id, "high"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn os_mismatch_skips_job() {
    let mut fx = fixture();
    let mut windows_worker = alive_node(WORKER);
    windows_worker.heartbeat.os = "windows".into();

    // Manifest only carries a linux path.
    fx.dispatch.update(&[windows_worker], &[job("a", 1, 10, 1)]);
    assert!(drain(&mut fx.rx).is_empty());
    assert!(read_table(&fx.farm, "a")
        .chunks
        .iter()
        .all(|c| c.state == ChunkState::Pending));
}

#[test]
fn missing_required_tag_skips_worker() {
    let mut fx = fixture();
    let mut tagged_job = job("a", 1, 10, 1);
    tagged_job.manifest.tags_required = vec!["gpu".into()];

    fx.dispatch.update(&[alive_node(WORKER)], &[tagged_job.clone()]);
    assert!(drain(&mut fx.rx).is_empty());

    let mut gpu_worker = alive_node(WORKER);
    gpu_worker.heartbeat.tags = vec!["gpu".into(), "blender-4".into()];
    fx.dispatch.update(&[gpu_worker], &[tagged_job]);
    assert_eq!(drain(&mut fx.rx).len(), 1);
}

#[test]
fn busy_stopped_and_dead_workers_get_nothing() {
    let mut fx = fixture();

    let mut rendering = alive_node(WORKER);
    rendering.heartbeat.render_state = RenderState::Rendering;

    let mut stopped = alive_node(WORKER2);
    stopped.heartbeat.node_state = NodeState::Stopped;

    let dead = dead_node("dead00000004");

    fx.dispatch
        .update(&[rendering, stopped, dead], &[job("a", 1, 10, 1)]);
    assert!(drain(&mut fx.rx).is_empty());
}

// ─── S3: retry exhaustion ───────────────────────────────────────────────────

#[test]
fn retries_exhaust_into_failed_state() {
    let mut fx = fixture();
    let nodes = vec![alive_node(WORKER)];
    let mut j = job("flaky", 1, 1, 1);
    j.manifest.max_retries = 2;
    let jobs = vec![j];
    let chunk = ChunkRange::new(1, 1);

    // First attempt.
    fx.dispatch.update(&nodes, &jobs);
    drain(&mut fx.rx);
    fx.dispatch
        .process_action(worker_failure("flaky", WORKER, chunk, "failed"));
    fx.dispatch.update(&nodes, &jobs);
    drain(&mut fx.rx);

    // After one failure the chunk went pending and was immediately
    // reassigned in the same cycle's assignment phase.
    fx.dispatch.stop();
    let table = read_table(&fx.farm, "flaky");
    assert_eq!(table.chunks[0].retry_count, 1);
    assert_eq!(table.chunks[0].state, ChunkState::Assigned);

    // Second failure exhausts max_retries=2.
    fx.dispatch
        .process_action(worker_failure("flaky", WORKER, chunk, "failed"));
    fx.dispatch.update(&nodes, &jobs);
    drain(&mut fx.rx);
    fx.dispatch.stop();

    let table = read_table(&fx.farm, "flaky");
    assert_eq!(table.chunks[0].state, ChunkState::Failed);
    assert_eq!(table.chunks[0].retry_count, 2);

    // Manual retry re-pends without resetting the counter; the next failure
    // immediately terminalizes again.
    fx.dispatch.retry_failed_chunk("flaky", chunk);
    fx.dispatch.stop();
    let table = read_table(&fx.farm, "flaky");
    assert_eq!(table.chunks[0].state, ChunkState::Pending);
    assert_eq!(table.chunks[0].retry_count, 2);
}

#[test]
fn worker_busy_report_leaves_active_assignment_untouched() {
    let mut fx = fixture();
    let jobs = vec![job("a", 1, 1, 1)];
    let chunk = ChunkRange::new(1, 1);

    fx.dispatch.update(&[alive_node(WORKER)], &jobs);
    drain(&mut fx.rx);

    // A duplicate assign_chunk delivery: the worker rejects the second copy
    // while still rendering the first. Nothing may change.
    fx.dispatch
        .process_action(worker_failure("a", WORKER, chunk, "worker_busy"));
    let mut rendering = alive_node(WORKER);
    rendering.heartbeat.render_state = RenderState::Rendering;
    rendering.heartbeat.active_job = Some("a".into());
    fx.dispatch.update(&[rendering.clone()], &jobs);
    fx.dispatch.stop();

    assert!(drain(&mut fx.rx).is_empty());
    let table = read_table(&fx.farm, "a");
    assert_eq!(table.chunks[0].state, ChunkState::Assigned);
    assert_eq!(table.chunks[0].assigned_to, WORKER);
    assert_eq!(table.chunks[0].retry_count, 0);

    // The assignment is still live: the worker's real completion report
    // closes it out normally.
    fx.dispatch.process_action(Action {
        command_type: CommandType::ChunkCompleted,
        job_id: "a".into(),
        reason: "completed".into(),
        from: WORKER.into(),
        msg_id: format!("1700000000002.{WORKER}"),
        chunk: Some(chunk),
    });
    fx.dispatch.update(&[rendering], &jobs);
    fx.dispatch.stop();

    let table = read_table(&fx.farm, "a");
    assert_eq!(table.chunks[0].state, ChunkState::Completed);
}

#[test]
fn abandoned_report_returns_chunk_without_retry() {
    let mut fx = fixture();
    let nodes = vec![alive_node(WORKER)];
    let jobs = vec![job("a", 1, 1, 1)];
    let chunk = ChunkRange::new(1, 1);

    fx.dispatch.update(&nodes, &jobs);
    drain(&mut fx.rx);

    fx.dispatch
        .process_action(worker_failure("a", WORKER, chunk, "abandoned"));
    // Pass a busy snapshot so the chunk is not instantly reassigned.
    let mut busy = alive_node(WORKER);
    busy.heartbeat.render_state = RenderState::Rendering;
    fx.dispatch.update(&[busy], &jobs);
    fx.dispatch.stop();

    let table = read_table(&fx.farm, "a");
    assert_eq!(table.chunks[0].state, ChunkState::Pending);
    assert_eq!(table.chunks[0].retry_count, 0);
}

// ─── S5: pause then resume ──────────────────────────────────────────────────

#[test]
fn pause_aborts_workers_and_releases_chunks() {
    let mut fx = fixture();
    let nodes = vec![alive_node(WORKER), alive_node(WORKER2)];
    let jobs = vec![job("a", 1, 4, 1)];

    fx.dispatch.update(&nodes, &jobs);
    assert_eq!(drain(&mut fx.rx).len(), 2);

    fx.dispatch.handle_job_state_change("a", JobState::Paused, &jobs);
    fx.dispatch.stop();

    let aborts: Vec<DispatchOutbound> = drain(&mut fx.rx);
    assert_eq!(aborts.len(), 2);
    for abort in &aborts {
        match abort {
            DispatchOutbound::Command {
                command_type,
                reason,
                ..
            } => {
                assert_eq!(*command_type, CommandType::AbortChunk);
                assert_eq!(reason, "job_paused");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    let table = read_table(&fx.farm, "a");
    assert!(table.chunks.iter().all(|c| c.state == ChunkState::Pending));

    // Resume: the next cycle hands chunks out again.
    fx.dispatch.handle_job_state_change("a", JobState::Active, &jobs);
    fx.dispatch.update(&nodes, &jobs);
    assert_eq!(drain(&mut fx.rx).len(), 2);
}

// ─── S2: dead worker reclamation ────────────────────────────────────────────

#[test]
fn dead_worker_chunk_is_reclaimed_and_reassigned() {
    let mut fx = fixture();
    let jobs = vec![job("a", 1, 1, 1)];

    fx.dispatch.update(&[alive_node(WORKER)], &jobs);
    drain(&mut fx.rx);

    // The worker dies; another worker is available.
    fx.dispatch
        .update(&[dead_node(WORKER), alive_node(WORKER2)], &jobs);
    fx.dispatch.stop();

    let effects = drain(&mut fx.rx);
    assert_eq!(effects.len(), 1);
    match &effects[0] {
        DispatchOutbound::Command { target, .. } => assert_eq!(target, WORKER2),
        other => panic!("unexpected {other:?}"),
    }

    let table = read_table(&fx.farm, "a");
    assert_eq!(table.chunks[0].state, ChunkState::Assigned);
    assert_eq!(table.chunks[0].assigned_to, WORKER2);
    assert_eq!(table.chunks[0].retry_count, 1);
}

#[test]
fn stopped_worker_chunk_is_reclaimable() {
    let mut fx = fixture();
    let jobs = vec![job("a", 1, 1, 1)];

    fx.dispatch.update(&[alive_node(WORKER)], &jobs);
    drain(&mut fx.rx);

    let mut stopped = alive_node(WORKER);
    stopped.heartbeat.node_state = NodeState::Stopped;
    fx.dispatch.update(&[stopped], &jobs);
    fx.dispatch.stop();

    let table = read_table(&fx.farm, "a");
    assert_eq!(table.chunks[0].retry_count, 1);
}

// ─── Stale assignment watchdog ──────────────────────────────────────────────

#[test]
fn stale_unacknowledged_assignment_is_pulled() {
    let mut fx = fixture();
    let jobs = vec![job("a", 1, 1, 1)];

    // Seed a dispatch table whose assignment is two minutes old; recovery
    // rebuilds the in-memory assignment so the watchdog sees its age.
    let stale_table = DispatchTable {
        version: 1,
        coordinator_id: COORD.into(),
        updated_at_ms: 0,
        chunks: vec![{
            let mut dc = smallrender::scheduler::DispatchChunk::new(ChunkRange::new(1, 1));
            dc.state = ChunkState::Assigned;
            dc.assigned_to = WORKER.into();
            dc.assigned_at_ms = chrono::Utc::now().timestamp_millis() - 120_000;
            dc
        }],
    };
    let job_dir = fx.farm.join("jobs").join("a");
    std::fs::create_dir_all(&job_dir).unwrap();
    std::fs::write(
        job_dir.join("dispatch.json"),
        serde_json::to_vec_pretty(&stale_table).unwrap(),
    )
    .unwrap();

    // Worker is alive but idle, i.e. it never started the render.
    let mut idle_worker = alive_node(WORKER);
    idle_worker.heartbeat.render_state = RenderState::Idle;
    fx.dispatch.update(&[idle_worker], &jobs);
    fx.dispatch.stop();

    let table = read_table(&fx.farm, "a");
    // Reclaimed (retry 1) and handed right back to the only idle worker.
    assert_eq!(table.chunks[0].retry_count, 1);
    assert_eq!(table.chunks[0].state, ChunkState::Assigned);
    assert!(table.chunks[0].assigned_at_ms > chrono::Utc::now().timestamp_millis() - 10_000);
}

#[test]
fn rendering_worker_is_not_stale() {
    let mut fx = fixture();
    let jobs = vec![job("a", 1, 1, 1)];

    let old_ms = chrono::Utc::now().timestamp_millis() - 120_000;
    let stale_table = DispatchTable {
        version: 1,
        coordinator_id: COORD.into(),
        updated_at_ms: 0,
        chunks: vec![{
            let mut dc = smallrender::scheduler::DispatchChunk::new(ChunkRange::new(1, 1));
            dc.state = ChunkState::Assigned;
            dc.assigned_to = WORKER.into();
            dc.assigned_at_ms = old_ms;
            dc
        }],
    };
    let job_dir = fx.farm.join("jobs").join("a");
    std::fs::create_dir_all(&job_dir).unwrap();
    std::fs::write(
        job_dir.join("dispatch.json"),
        serde_json::to_vec_pretty(&stale_table).unwrap(),
    )
    .unwrap();

    let mut rendering = alive_node(WORKER);
    rendering.heartbeat.render_state = RenderState::Rendering;
    rendering.heartbeat.active_job = Some("a".into());
    fx.dispatch.update(&[rendering], &jobs);
    fx.dispatch.stop();

    let table = read_table(&fx.farm, "a");
    assert_eq!(table.chunks[0].state, ChunkState::Assigned);
    assert_eq!(table.chunks[0].assigned_to, WORKER);
    assert_eq!(table.chunks[0].assigned_at_ms, old_ms);
    assert_eq!(table.chunks[0].retry_count, 0);
}

// ─── S6: coordinator restart recovery ───────────────────────────────────────

#[test]
fn restart_recovers_tables_and_demotes_dead_assignments() {
    let mut fx = fixture();
    let jobs = vec![job("a", 1, 2, 1)];

    let table = DispatchTable {
        version: 1,
        coordinator_id: "old-coordinator".into(),
        updated_at_ms: 0,
        chunks: vec![
            {
                let mut dc = smallrender::scheduler::DispatchChunk::new(ChunkRange::new(1, 1));
                dc.state = ChunkState::Assigned;
                dc.assigned_to = WORKER.into();
                dc.assigned_at_ms = chrono::Utc::now().timestamp_millis();
                dc
            },
            {
                let mut dc = smallrender::scheduler::DispatchChunk::new(ChunkRange::new(2, 2));
                dc.state = ChunkState::Assigned;
                dc.assigned_to = "gone00000009".into();
                dc.assigned_at_ms = chrono::Utc::now().timestamp_millis();
                dc
            },
        ],
    };
    let job_dir = fx.farm.join("jobs").join("a");
    std::fs::create_dir_all(&job_dir).unwrap();
    std::fs::write(
        job_dir.join("dispatch.json"),
        serde_json::to_vec_pretty(&table).unwrap(),
    )
    .unwrap();

    // WORKER is alive and rendering its chunk; the other holder is unknown.
    let mut rendering = alive_node(WORKER);
    rendering.heartbeat.render_state = RenderState::Rendering;
    rendering.heartbeat.active_job = Some("a".into());
    fx.dispatch.update(&[rendering], &jobs);
    fx.dispatch.stop();

    let recovered = read_table(&fx.farm, "a");
    // The live holder keeps its chunk; the unknown holder's chunk went back
    // to pending (and there is no idle worker to take it).
    assert_eq!(recovered.chunks[0].state, ChunkState::Assigned);
    assert_eq!(recovered.chunks[0].assigned_to, WORKER);
    assert_eq!(recovered.chunks[1].state, ChunkState::Pending);
    assert_eq!(recovered.coordinator_id, COORD);

    // The recovered assignment is live again: the worker's completion
    // report closes it out normally.
    fx.dispatch.process_action(Action {
        command_type: CommandType::ChunkCompleted,
        job_id: "a".into(),
        reason: "completed".into(),
        from: WORKER.into(),
        msg_id: format!("1700000000001.{WORKER}"),
        chunk: Some(ChunkRange::new(1, 1)),
    });
    let mut busy = alive_node(WORKER);
    busy.heartbeat.render_state = RenderState::Rendering;
    busy.heartbeat.active_job = Some("a".into());
    fx.dispatch.update(&[busy], &jobs);
    fx.dispatch.stop();

    let after = read_table(&fx.farm, "a");
    assert_eq!(after.chunks[0].state, ChunkState::Completed);
}

// ─── Manual reassign ────────────────────────────────────────────────────────

#[test]
fn manual_reassign_aborts_holder_and_repends() {
    let mut fx = fixture();
    let jobs = vec![job("a", 1, 1, 1)];
    let chunk = ChunkRange::new(1, 1);

    fx.dispatch.update(&[alive_node(WORKER)], &jobs);
    drain(&mut fx.rx);

    fx.dispatch.reassign_chunk("a", chunk);
    fx.dispatch.stop();

    let effects = drain(&mut fx.rx);
    assert_eq!(effects.len(), 1);
    match &effects[0] {
        DispatchOutbound::Command {
            target,
            command_type,
            reason,
            ..
        } => {
            assert_eq!(target, WORKER);
            assert_eq!(*command_type, CommandType::AbortChunk);
            assert_eq!(reason, "coordinator_reassign");
        }
        other => panic!("unexpected {other:?}"),
    }

    let table = read_table(&fx.farm, "a");
    assert_eq!(table.chunks[0].state, ChunkState::Pending);
}

// ─── Chunk coverage invariant ───────────────────────────────────────────────

#[test]
fn table_chunks_cover_frame_range_exactly() {
    let mut fx = fixture();
    let jobs = vec![job("a", 1, 10, 3)];
    fx.dispatch.update(&[], &jobs);
    fx.dispatch.stop();

    let table = read_table(&fx.farm, "a");
    let mut next = 1;
    for dc in &table.chunks {
        assert_eq!(dc.frame_start, next);
        next = dc.frame_end + 1;
    }
    assert_eq!(next, 11);
}
