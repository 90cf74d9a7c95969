//! Render coordinator + agent supervisor driven end to end against a fake
//! renderer connected over the real local IPC endpoint.
#![cfg(unix)]

use std::path::Path;
use std::time::Duration;

use tempfile::tempdir;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use smallrender::jobs::manifest::JobManifest;
use smallrender::monlog::MonitorLog;
use smallrender::scheduler::dispatch::CompletionState;
use smallrender::scheduler::ChunkRange;
use smallrender::worker::ipc::{endpoint_name, read_frame, write_frame};
use smallrender::worker::render::{build_task_message, ChunkReport};
use smallrender::worker::{AgentSupervisor, RenderCoordinator};

fn manifest(job_id: &str) -> JobManifest {
    JobManifest {
        job_id: job_id.to_string(),
        submitted_by: "sub000000001".into(),
        submitted_os: "linux".into(),
        submitted_at_ms: 1000,
        cmd: [("linux".to_string(), "/usr/bin/blender".to_string())]
            .into_iter()
            .collect(),
        flags: vec![
            smallrender::jobs::manifest::ManifestFlag {
                flag: "-b".into(),
                value: Some("/p/s.blend".into()),
            },
            smallrender::jobs::manifest::ManifestFlag {
                flag: "-f".into(),
                value: Some("{chunk_start}..{chunk_end}".into()),
            },
        ],
        frame_start: 1,
        frame_end: 10,
        chunk_size: 5,
        max_retries: 3,
        ..Default::default()
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached within 5s");
}

struct Fixture {
    _dir: tempfile::TempDir,
    farm: std::path::PathBuf,
    supervisor: AgentSupervisor,
    render: RenderCoordinator,
    reports: mpsc::UnboundedReceiver<ChunkReport>,
    agent: UnixStream,
    cancel: CancellationToken,
}

async fn fixture(node_id: &str) -> Fixture {
    let dir = tempdir().unwrap();
    let farm = dir.path().to_path_buf();
    std::fs::create_dir_all(farm.join("jobs")).unwrap();

    let log = MonitorLog::new();
    let cancel = CancellationToken::new();
    let supervisor = AgentSupervisor::start(node_id.to_string(), log.clone(), cancel.clone());

    // The fake renderer dials in once the endpoint exists.
    let endpoint = endpoint_name(node_id);
    let mut agent = None;
    for _ in 0..100 {
        match UnixStream::connect(&endpoint).await {
            Ok(stream) => {
                agent = Some(stream);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    let agent = agent.expect("fake agent failed to connect");

    let sup = supervisor.clone();
    wait_until(move || sup.is_connected()).await;

    let (reports_tx, reports) = mpsc::unbounded_channel();
    let render = RenderCoordinator::new(
        &farm,
        node_id.to_string(),
        "linux".to_string(),
        log,
        reports_tx,
    );

    Fixture {
        _dir: dir,
        farm,
        supervisor,
        render,
        reports,
        agent,
        cancel,
    }
}

fn event_files(farm: &Path, job_id: &str, node_id: &str) -> Vec<String> {
    let dir = farm.join("jobs").join(job_id).join("events").join(node_id);
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

async fn pump(fx: &mut Fixture) {
    // One main-loop turn: drain agent messages into the render coordinator.
    tokio::time::sleep(Duration::from_millis(150)).await;
    for msg in fx.supervisor.process_messages() {
        fx.render.handle_agent_message(msg);
    }
}

#[tokio::test]
async fn chunk_lifecycle_emits_events_and_reports_completion() {
    let mut fx = fixture("rc0000000001").await;
    let chunk = ChunkRange::new(1, 5);

    fx.render.queue_dispatch(manifest("shot-010"), chunk);
    fx.render.update(&fx.supervisor);
    assert!(fx.render.is_rendering());

    // The fake agent receives the task with substituted args.
    let frame = read_frame(&mut fx.agent).await.unwrap();
    let task: serde_json::Value = serde_json::from_slice(&frame).unwrap();
    assert_eq!(task["type"], "task");
    assert_eq!(task["job_id"], "shot-010");
    assert_eq!(task["frame_start"], 1);
    assert_eq!(task["frame_end"], 5);
    assert_eq!(task["command"]["executable"], "/usr/bin/blender");
    assert_eq!(task["command"]["args"][3], "1..5");

    // ack -> chunk_started event.
    write_frame(&mut fx.agent, br#"{"type":"ack","job_id":"shot-010"}"#)
        .await
        .unwrap();
    pump(&mut fx).await;
    assert!(fx.render.ack_received());
    let events = event_files(&fx.farm, "shot-010", "rc0000000001");
    assert_eq!(events, vec!["000001_chunk_started_000001-000005.json"]);

    // stdout lines land in the per-attempt log.
    write_frame(
        &mut fx.agent,
        br#"{"type":"stdout","lines":["Fra:1 rendering","Fra:1 saved"]}"#,
    )
    .await
    .unwrap();
    pump(&mut fx).await;
    let stdout_dir = fx
        .farm
        .join("jobs")
        .join("shot-010")
        .join("stdout")
        .join("rc0000000001");
    let log_file = std::fs::read_dir(&stdout_dir).unwrap().next().unwrap().unwrap();
    let content = std::fs::read_to_string(log_file.path()).unwrap();
    assert_eq!(content, "Fra:1 rendering\nFra:1 saved\n");

    // progress + per-frame completion.
    write_frame(&mut fx.agent, br#"{"type":"progress","progress_pct":40.0}"#)
        .await
        .unwrap();
    write_frame(&mut fx.agent, br#"{"type":"frame_completed","frame":1}"#)
        .await
        .unwrap();
    pump(&mut fx).await;
    assert_eq!(fx.render.current_progress(), 40.0);
    assert_eq!(fx.render.completed_frame_count(), 1);
    let events = event_files(&fx.farm, "shot-010", "rc0000000001");
    assert!(events.contains(&"000002_frame_finished_000001-000001.json".to_string()));

    // completion -> chunk_finished event, idle coordinator, completed report.
    write_frame(
        &mut fx.agent,
        br#"{"type":"completed","elapsed_ms":1234,"exit_code":0,"output_file":"/out/f1.png"}"#,
    )
    .await
    .unwrap();
    pump(&mut fx).await;

    assert!(!fx.render.is_rendering());
    let events = event_files(&fx.farm, "shot-010", "rc0000000001");
    assert!(events.contains(&"000003_chunk_finished_000001-000005.json".to_string()));

    let report = fx.reports.try_recv().unwrap();
    assert_eq!(report.job_id, "shot-010");
    assert_eq!(report.chunk, chunk);
    assert_eq!(report.state, CompletionState::Completed);

    fx.cancel.cancel();
}

#[tokio::test]
async fn failed_render_reports_failure() {
    let mut fx = fixture("rc0000000002").await;
    fx.render.queue_dispatch(manifest("shot-020"), ChunkRange::new(6, 10));
    fx.render.update(&fx.supervisor);
    let _ = read_frame(&mut fx.agent).await.unwrap();

    write_frame(
        &mut fx.agent,
        br#"{"type":"failed","exit_code":137,"error":"GPU out of memory"}"#,
    )
    .await
    .unwrap();
    pump(&mut fx).await;

    assert!(!fx.render.is_rendering());
    let report = fx.reports.try_recv().unwrap();
    assert_eq!(report.state, CompletionState::Failed);

    let events = event_files(&fx.farm, "shot-020", "rc0000000002");
    assert!(events.iter().any(|e| e.contains("chunk_failed")));

    fx.cancel.cancel();
}

#[tokio::test]
async fn agent_disconnect_fails_active_chunk() {
    let mut fx = fixture("rc0000000003").await;
    fx.render.queue_dispatch(manifest("shot-030"), ChunkRange::new(1, 5));
    fx.render.update(&fx.supervisor);
    let _ = read_frame(&mut fx.agent).await.unwrap();

    // The renderer process dies.
    drop(fx.agent);
    let sup = fx.supervisor.clone();
    wait_until(move || !sup.is_connected()).await;

    fx.render.update(&fx.supervisor);

    assert!(!fx.render.is_rendering());
    let report = fx.reports.try_recv().unwrap();
    assert_eq!(report.state, CompletionState::Failed);

    let events = event_files(&fx.farm, "shot-030", "rc0000000003");
    assert!(events.iter().any(|e| e.contains("chunk_failed")));

    fx.cancel.cancel();
}

#[tokio::test]
async fn stopped_node_abandons_queued_chunks() {
    let mut fx = fixture("rc0000000004").await;
    fx.render.set_stopped(true);
    fx.render.queue_dispatch(manifest("shot-040"), ChunkRange::new(1, 5));
    fx.render.update(&fx.supervisor);

    assert!(!fx.render.is_rendering());
    let report = fx.reports.try_recv().unwrap();
    assert_eq!(report.state, CompletionState::Abandoned);

    fx.cancel.cancel();
}

#[tokio::test]
async fn abort_notifies_agent_and_fails_chunk() {
    let mut fx = fixture("rc0000000005").await;
    fx.render.queue_dispatch(manifest("shot-050"), ChunkRange::new(1, 5));
    fx.render.update(&fx.supervisor);
    let _ = read_frame(&mut fx.agent).await.unwrap();

    fx.render.abort_current_render("job_paused", &fx.supervisor);

    // The agent sees the abort message.
    let frame = read_frame(&mut fx.agent).await.unwrap();
    let msg: serde_json::Value = serde_json::from_slice(&frame).unwrap();
    assert_eq!(msg["type"], "abort");
    assert_eq!(msg["reason"], "job_paused");

    let report = fx.reports.try_recv().unwrap();
    assert_eq!(report.state, CompletionState::Failed);

    fx.cancel.cancel();
}

#[tokio::test]
async fn event_seq_resumes_after_existing_files() {
    let mut fx = fixture("rc0000000006").await;

    // A previous attempt left events behind.
    let events_dir = fx
        .farm
        .join("jobs")
        .join("shot-060")
        .join("events")
        .join("rc0000000006");
    std::fs::create_dir_all(&events_dir).unwrap();
    std::fs::write(events_dir.join("000007_chunk_failed_000001-000005.json"), b"{}").unwrap();

    fx.render.queue_dispatch(manifest("shot-060"), ChunkRange::new(1, 5));
    fx.render.update(&fx.supervisor);
    let _ = read_frame(&mut fx.agent).await.unwrap();

    write_frame(&mut fx.agent, br#"{"type":"ack"}"#).await.unwrap();
    pump(&mut fx).await;

    let events = event_files(&fx.farm, "shot-060", "rc0000000006");
    assert!(events.contains(&"000008_chunk_started_000001-000005.json".to_string()));

    fx.cancel.cancel();
}

#[test]
fn task_message_substitutes_chunk_tokens() {
    let task = build_task_message(&manifest("shot-070"), ChunkRange::new(4, 6), "linux");
    assert_eq!(task.command.executable, "/usr/bin/blender");
    assert_eq!(task.command.args, vec!["-b", "/p/s.blend", "-f", "4..6"]);
    assert_eq!(task.frame_start, 4);
    assert_eq!(task.frame_end, 6);
    assert!(task.progress.is_none());
    assert!(task.output_detection.is_none());
}
