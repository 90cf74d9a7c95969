use std::collections::HashMap;
use std::path::Path;

use tempfile::tempdir;

use smallrender::cache::{FrameState, UiDataCache};
use smallrender::scheduler::{ChunkRange, ChunkState, DispatchChunk, DispatchTable};

fn table(states: &[(i32, i32, ChunkState)]) -> DispatchTable {
    DispatchTable {
        version: 1,
        coordinator_id: "c0ffee000001".into(),
        updated_at_ms: 0,
        chunks: states
            .iter()
            .map(|(start, end, state)| {
                let mut dc = DispatchChunk::new(ChunkRange::new(*start, *end));
                dc.state = *state;
                dc
            })
            .collect(),
    }
}

fn write_table(farm: &Path, job_id: &str, table: &DispatchTable) {
    let dir = farm.join("jobs").join(job_id);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("dispatch.json"),
        serde_json::to_vec_pretty(table).unwrap(),
    )
    .unwrap();
}

#[test]
fn coordinator_tables_drive_progress_and_frame_grid() {
    let dir = tempdir().unwrap();
    let cache = UiDataCache::new(dir.path());
    cache.set_selected_job_id("shot-010");
    cache.set_job_ids(vec!["shot-010".into()]);

    let mut tables = HashMap::new();
    tables.insert(
        "shot-010".to_string(),
        table(&[
            (1, 5, ChunkState::Completed),
            (6, 10, ChunkState::Assigned),
            (11, 15, ChunkState::Pending),
            (16, 20, ChunkState::Failed),
        ]),
    );
    cache.set_dispatch_tables(tables);

    let progress = cache.progress_snapshot();
    let p = &progress["shot-010"];
    assert_eq!(p.total, 20);
    assert_eq!(p.completed, 5);
    assert_eq!(p.rendering, 5);
    assert_eq!(p.failed, 5);

    let grid = cache.frame_state_snapshot();
    assert_eq!(grid.job_id, "shot-010");
    assert_eq!(grid.frame_states.len(), 20);
    assert_eq!(grid.frame_states[0], (1, FrameState::Completed));
    assert_eq!(grid.frame_states[5], (6, FrameState::Rendering));
    assert_eq!(grid.frame_states[10], (11, FrameState::Unclaimed));
    assert_eq!(grid.frame_states[19], (20, FrameState::Failed));
}

#[tokio::test]
async fn disk_tables_fill_in_for_untracked_jobs() {
    let dir = tempdir().unwrap();
    write_table(
        dir.path(),
        "old-job",
        &table(&[(1, 10, ChunkState::Completed)]),
    );

    let cache = UiDataCache::new(dir.path());
    cache.set_job_ids(vec!["old-job".into()]);
    cache.set_selected_job_id("old-job");

    // One background pass without waiting for the cooldown loop.
    let cancel = tokio_util::sync::CancellationToken::new();
    let handle = tokio::spawn(cache.clone().run(cancel.clone()));
    tokio::time::sleep(std::time::Duration::from_millis(800)).await;
    cancel.cancel();
    handle.await.unwrap();

    let progress = cache.progress_snapshot();
    assert_eq!(progress["old-job"].completed, 10);

    let grid = cache.frame_state_snapshot();
    assert_eq!(grid.job_id, "old-job");
    assert!(grid
        .frame_states
        .iter()
        .all(|(_, s)| *s == FrameState::Completed));
}

#[tokio::test]
async fn progress_of_deleted_jobs_is_pruned() {
    let dir = tempdir().unwrap();
    write_table(dir.path(), "gone", &table(&[(1, 5, ChunkState::Completed)]));

    let cache = UiDataCache::new(dir.path());
    cache.set_job_ids(vec!["gone".into()]);

    let cancel = tokio_util::sync::CancellationToken::new();
    let handle = tokio::spawn(cache.clone().run(cancel.clone()));
    tokio::time::sleep(std::time::Duration::from_millis(800)).await;

    // The job disappears from the job list; its progress entry follows.
    cache.set_job_ids(vec![]);
    tokio::time::sleep(std::time::Duration::from_millis(5300)).await;
    cancel.cancel();
    handle.await.unwrap();

    assert!(cache.progress_snapshot().is_empty());
}

#[tokio::test]
async fn task_output_tail_reads_newest_log() {
    let dir = tempdir().unwrap();
    let stdout_dir = dir
        .path()
        .join("jobs")
        .join("shot-010")
        .join("stdout")
        .join("node00000001");
    std::fs::create_dir_all(&stdout_dir).unwrap();
    std::fs::write(stdout_dir.join("000001-000005_1000.log"), "old attempt\n").unwrap();
    // Ensure the second attempt is unambiguously newer by mtime.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    std::fs::write(
        stdout_dir.join("000001-000005_2000.log"),
        "line one\nline two\n",
    )
    .unwrap();

    let cache = UiDataCache::new(dir.path());
    cache.set_selected_job_id("shot-010");

    let cancel = tokio_util::sync::CancellationToken::new();
    let handle = tokio::spawn(cache.clone().run(cancel.clone()));
    tokio::time::sleep(std::time::Duration::from_millis(800)).await;
    cancel.cancel();
    handle.await.unwrap();

    let output = cache.task_output_snapshot();
    assert_eq!(output.job_id, "shot-010");
    assert_eq!(output.lines, vec!["line one", "line two"]);
}

#[tokio::test]
async fn remote_log_request_returns_tails() {
    let dir = tempdir().unwrap();
    let log = smallrender::monlog::MonitorLog::new();
    log.start_file_logging(dir.path(), "peer00000001");
    log.info("health", "peer says hi");

    let cache = UiDataCache::new(dir.path());
    cache.set_log_request(vec!["peer00000001".into()]);

    let cancel = tokio_util::sync::CancellationToken::new();
    let handle = tokio::spawn(cache.clone().run(cancel.clone()));
    tokio::time::sleep(std::time::Duration::from_millis(800)).await;
    cancel.cancel();
    handle.await.unwrap();

    let logs = cache.remote_log_snapshot();
    let lines = &logs.logs["peer00000001"];
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("peer says hi"));
}
