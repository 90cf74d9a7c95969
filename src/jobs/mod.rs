pub mod manifest;
pub mod template;

pub use manifest::{JobInfo, JobManifest, JobState, JobStateEntry, JobTemplate};
pub use template::TemplateManager;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::{FarmError, Result};
use crate::fsio;
use crate::monlog::MonitorLog;

const SCAN_COOLDOWN: Duration = Duration::from_secs(3);

/// Scans the job directory and maintains a sorted snapshot of every job's
/// manifest plus its authoritative state from the state log.
#[derive(Debug, Clone)]
pub struct JobManager {
    farm_path: PathBuf,
    log: MonitorLog,
    jobs: Arc<Mutex<Vec<JobInfo>>>,
    invalidated: Arc<AtomicBool>,
}

impl JobManager {
    pub fn new(farm_path: &std::path::Path, log: MonitorLog) -> Self {
        Self {
            farm_path: farm_path.to_path_buf(),
            log,
            jobs: Arc::new(Mutex::new(Vec::new())),
            invalidated: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        // Synchronous first scan so the snapshot is populated immediately.
        self.scan_now();
        let mut last_scan = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }

            let forced = self.invalidated.load(Ordering::Relaxed);
            if !forced && last_scan.elapsed() < SCAN_COOLDOWN {
                continue;
            }

            self.scan_now();
            last_scan = Instant::now();
        }
    }

    /// Force the next scan to run regardless of cooldown.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Relaxed);
    }

    /// Owned, sorted copy of the job list: priority descending, submission
    /// time ascending (FIFO within a priority band).
    pub fn get_job_snapshot(&self) -> Vec<JobInfo> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn scan_now(&self) {
        self.invalidated.store(false, Ordering::Relaxed);

        let jobs_dir = self.farm_path.join("jobs");
        let mut jobs = Vec::new();

        if let Ok(entries) = std::fs::read_dir(&jobs_dir) {
            for entry in entries.flatten() {
                let job_dir = entry.path();
                if !job_dir.is_dir() {
                    continue;
                }

                let Some(manifest) =
                    fsio::safe_read_json::<JobManifest>(&job_dir.join("manifest.json"))
                else {
                    continue;
                };

                let mut info = JobInfo::new(manifest);
                if let Some(entry) = latest_state_entry(&job_dir.join("state")) {
                    info.current_state = entry.state;
                    info.current_priority = entry.priority;
                }
                jobs.push(info);
            }
        }

        jobs.sort_by(|a, b| {
            b.current_priority
                .cmp(&a.current_priority)
                .then(a.manifest.submitted_at_ms.cmp(&b.manifest.submitted_at_ms))
        });

        *self.jobs.lock().unwrap() = jobs;
    }

    /// Create the job directory tree, write the immutable manifest and the
    /// initial `active` state entry. Refuses if the manifest already exists.
    pub fn submit_job(&self, manifest: &JobManifest, priority: i32) -> Result<String> {
        let job_dir = self.farm_path.join("jobs").join(&manifest.job_id);

        std::fs::create_dir_all(job_dir.join("state"))?;
        std::fs::create_dir_all(job_dir.join("claims"))?;
        std::fs::create_dir_all(job_dir.join("events"))?;

        let manifest_path = job_dir.join("manifest.json");
        if manifest_path.exists() {
            self.log.error(
                "job",
                format!("Manifest already exists: {}", manifest_path.display()),
            );
            return Err(FarmError::JobExists(manifest.job_id.clone()));
        }

        fsio::write_json(&manifest_path, manifest)?;

        let now = Utc::now().timestamp_millis();
        let entry = JobStateEntry {
            version: 1,
            state: JobState::Active,
            priority,
            node_id: manifest.submitted_by.clone(),
            timestamp_ms: now,
        };
        let state_name = format!("{now}_{}.json", manifest.submitted_by);
        fsio::write_json(&job_dir.join("state").join(state_name), &entry)?;

        self.invalidate();
        self.log
            .info("job", format!("Job submitted: {}", manifest.job_id));
        Ok(manifest.job_id.clone())
    }

    /// Append a timestamped state entry; existing entries are never mutated.
    pub fn write_state_entry(
        &self,
        job_id: &str,
        state: JobState,
        priority: i32,
        node_id: &str,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let entry = JobStateEntry {
            version: 1,
            state,
            priority,
            node_id: node_id.to_string(),
            timestamp_ms: now,
        };

        let state_dir = self.farm_path.join("jobs").join(job_id).join("state");
        std::fs::create_dir_all(&state_dir)?;
        fsio::write_json(&state_dir.join(format!("{now}_{node_id}.json")), &entry)?;

        self.invalidate();
        self.log.info(
            "job",
            format!("State entry: job={job_id} state={state} priority={priority}"),
        );
        Ok(())
    }
}

/// The entry with the lexicographically greatest filename wins; filenames
/// start with `{timestamp_ms}`, so greatest filename = newest entry.
fn latest_state_entry(state_dir: &std::path::Path) -> Option<JobStateEntry> {
    let entries = std::fs::read_dir(state_dir).ok()?;
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    files
        .iter()
        .find_map(|path| fsio::safe_read_json::<JobStateEntry>(path))
}
