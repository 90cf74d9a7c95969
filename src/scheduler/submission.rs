//! Submission inbox: headless job submission from DCC integrations.
//!
//! External tools drop request files into `submissions/`; the coordinator
//! resolves the template, applies overrides, bakes a manifest and submits
//! it. Files that cannot be read yet are retried a few times to ride out
//! cloud-filesystem propagation, then moved aside.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::fsio;
use crate::jobs::template::{self, TemplateManager};
use crate::jobs::JobManager;
use crate::monlog::MonitorLog;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const PURGE_INTERVAL: Duration = Duration::from_secs(3600);
const PURGE_AGE_MS: i64 = 24 * 60 * 60 * 1000;
const MAX_READ_RETRIES: u32 = 6;

#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionRequest {
    #[serde(default)]
    pub template_id: String,
    #[serde(default)]
    pub job_name: String,
    #[serde(default)]
    pub submitted_by_host: String,
    /// Flag overrides keyed by `flag.id`.
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
    #[serde(default)]
    pub frame_start: Option<i32>,
    #[serde(default)]
    pub frame_end: Option<i32>,
    #[serde(default)]
    pub chunk_size: Option<i32>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Present-and-null clears the template default.
    #[serde(default, deserialize_with = "deserialize_timeout")]
    pub timeout_seconds: Option<Option<u64>>,
}

fn deserialize_timeout<'de, D>(deserializer: D) -> Result<Option<Option<u64>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Some(Option::<u64>::deserialize(deserializer)?))
}

/// Coordinator-only poller for the submission inbox.
pub struct SubmissionManager {
    farm_path: PathBuf,
    node_id: String,
    os: String,
    templates: TemplateManager,
    jobs: JobManager,
    log: MonitorLog,
    wake: Arc<Notify>,
    read_fail_counts: HashMap<String, u32>,
}

impl SubmissionManager {
    pub fn new(
        farm_path: &Path,
        node_id: String,
        os: String,
        templates: TemplateManager,
        jobs: JobManager,
        log: MonitorLog,
    ) -> Self {
        let _ = std::fs::create_dir_all(farm_path.join("submissions").join("processed"));
        log.info("farm", "Submission manager started");
        Self {
            farm_path: farm_path.to_path_buf(),
            node_id,
            os,
            templates,
            jobs,
            log,
            wake: Arc::new(Notify::new()),
            read_fail_counts: HashMap::new(),
        }
    }

    /// Handle an external notifier can use to short-circuit the poll sleep.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut last_poll: Option<Instant> = None;
        let mut last_purge = Instant::now();

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

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => { last_poll = None; }
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    }

    pub fn poll_inbox(&mut self) {
        let inbox_dir = self.farm_path.join("submissions");
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
            self.process_submission(&file);
        }
    }

    fn process_submission(&mut self, file: &Path) {
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let Some(request) = fsio::safe_read_json::<SubmissionRequest>(file) else {
            let count = self.read_fail_counts.entry(file_name.clone()).or_insert(0);
            *count += 1;
            if *count >= MAX_READ_RETRIES {
                self.log.error(
                    "farm",
                    format!("Giving up on unreadable submission after {count} retries: {file_name}"),
                );
                self.move_to_processed(file);
                self.read_fail_counts.remove(&file_name);
            } else {
                self.log.info(
                    "farm",
                    format!("Submission not yet readable (retry {count}): {file_name}"),
                );
            }
            return;
        };
        self.read_fail_counts.remove(&file_name);

        if request.template_id.is_empty() {
            self.log
                .error("farm", format!("Submission missing template_id: {file_name}"));
            self.move_to_processed(file);
            return;
        }

        let Some(mut tmpl) = self.templates.find(&request.template_id) else {
            self.log.error(
                "farm",
                format!("Template not found for submission: {}", request.template_id),
            );
            self.move_to_processed(file);
            return;
        };

        // Apply overrides by flag id.
        for (key, value) in &request.overrides {
            match tmpl.flags.iter_mut().find(|f| !f.id.is_empty() && f.id == *key) {
                Some(flag) => flag.value = Some(value.clone()),
                None => self.log.warn(
                    "farm",
                    format!("Submission override key not found in template: {key}"),
                ),
            }
        }

        let defaults = tmpl.job_defaults;
        let frame_start = request.frame_start.unwrap_or(defaults.frame_start);
        let frame_end = request.frame_end.unwrap_or(defaults.frame_end);
        let chunk_size = request.chunk_size.unwrap_or(defaults.chunk_size);
        let priority = request.priority.unwrap_or(defaults.priority);
        let max_retries = request.max_retries.unwrap_or(defaults.max_retries);
        let timeout = match request.timeout_seconds {
            Some(explicit) => explicit,
            None => defaults.timeout_seconds,
        };

        let flag_values: Vec<String> = tmpl
            .flags
            .iter()
            .map(|f| f.value.clone().unwrap_or_default())
            .collect();

        let jobs_dir = self.farm_path.join("jobs");
        let job_name = if request.job_name.is_empty() {
            format!("{}-batch", request.template_id)
        } else {
            request.job_name.clone()
        };
        let slug = template::generate_slug(&job_name, &jobs_dir);
        if slug.is_empty() {
            self.log
                .error("farm", format!("Failed to generate slug for submission: {job_name}"));
            self.move_to_processed(file);
            return;
        }

        let cmd_path = tmpl.cmd.for_os(&self.os).to_string();
        let manifest = template::bake_manifest(
            &tmpl,
            &flag_values,
            &cmd_path,
            &slug,
            frame_start,
            frame_end,
            chunk_size,
            max_retries,
            timeout,
            &self.node_id,
            &self.os,
        );

        match self.jobs.submit_job(&manifest, priority) {
            Ok(job_id) => self.log.info(
                "farm",
                format!(
                    "Auto-submitted job '{job_id}' from {} (template: {})",
                    request.submitted_by_host, request.template_id
                ),
            ),
            Err(e) => self
                .log
                .error("farm", format!("Failed to submit job from submission: {e}")),
        }

        // Always archive, even on error, to break retry loops.
        self.move_to_processed(file);
    }

    fn move_to_processed(&self, file: &Path) {
        let processed_dir = self.farm_path.join("submissions").join("processed");
        if let Some(name) = file.file_name() {
            if std::fs::rename(file, processed_dir.join(name)).is_err() {
                let _ = std::fs::remove_file(file);
            }
        }
    }

    pub fn purge_processed(&self) {
        let processed_dir = self.farm_path.join("submissions").join("processed");
        let Ok(entries) = std::fs::read_dir(&processed_dir) else {
            return;
        };

        let cutoff = Utc::now().timestamp_millis() - PURGE_AGE_MS;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            // Submission filenames start with a ms timestamp by convention.
            let Some(ts) = stem.split('.').next().and_then(|t| t.parse::<i64>().ok()) else {
                continue;
            };
            if ts < cutoff {
                let _ = std::fs::remove_file(&path);
            }
        }
    }
}
