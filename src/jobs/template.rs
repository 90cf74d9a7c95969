//! Job templates: loading, validation, manifest baking and output-path
//! pattern resolution.
//!
//! Templates live in `templates/` (user) and `templates/examples/`
//! (bundled); a user template shadows a bundled one with the same
//! `template_id`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, Utc};
use tokio_util::sync::CancellationToken;

use crate::fsio;
use crate::jobs::manifest::{JobManifest, JobTemplate, ManifestFlag};
use crate::monlog::MonitorLog;

const SCAN_COOLDOWN: Duration = Duration::from_secs(5);
const SLUG_MAX_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct TemplateManager {
    farm_path: PathBuf,
    log: MonitorLog,
    templates: Arc<Mutex<Vec<JobTemplate>>>,
}

impl TemplateManager {
    pub fn new(farm_path: &Path, log: MonitorLog) -> Self {
        let manager = Self {
            farm_path: farm_path.to_path_buf(),
            log,
            templates: Arc::new(Mutex::new(Vec::new())),
        };
        // First scan synchronous so templates are available immediately.
        manager.scan_now();
        manager
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut last_scan = Instant::now();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
            if last_scan.elapsed() < SCAN_COOLDOWN {
                continue;
            }
            self.scan_now();
            last_scan = Instant::now();
        }
    }

    pub fn get_template_snapshot(&self) -> Vec<JobTemplate> {
        self.templates.lock().unwrap().clone()
    }

    /// Look up a valid template by id.
    pub fn find(&self, template_id: &str) -> Option<JobTemplate> {
        self.templates
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.template_id == template_id && t.valid)
            .cloned()
    }

    pub fn scan_now(&self) {
        let mut templates = Vec::new();
        load_templates_from_dir(
            &self.farm_path.join("templates").join("examples"),
            true,
            &mut templates,
            &self.log,
        );
        load_templates_from_dir(
            &self.farm_path.join("templates"),
            false,
            &mut templates,
            &self.log,
        );

        // User templates shadow bundled examples with the same id.
        let user_ids: Vec<String> = templates
            .iter()
            .filter(|t| !t.is_example)
            .map(|t| t.template_id.clone())
            .collect();
        templates.retain(|t| !(t.is_example && user_ids.contains(&t.template_id)));

        *self.templates.lock().unwrap() = templates;
    }
}

fn load_templates_from_dir(
    dir: &Path,
    is_example: bool,
    out: &mut Vec<JobTemplate>,
    log: &MonitorLog,
) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || !path.extension().is_some_and(|ext| ext == "json") {
            continue;
        }

        match fsio::safe_read_json::<JobTemplate>(&path) {
            Some(mut tmpl) => {
                tmpl.is_example = is_example;
                validate_template(&mut tmpl);
                out.push(tmpl);
            }
            None => {
                // Keep an invalid placeholder so operators can see the error.
                log.warn(
                    "farm",
                    format!("Unparseable template: {}", path.display()),
                );
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                out.push(JobTemplate {
                    template_id: stem.clone(),
                    name: stem,
                    valid: false,
                    validation_error: "Failed to parse JSON".to_string(),
                    is_example,
                    ..Default::default()
                });
            }
        }
    }
}

fn validate_template(tmpl: &mut JobTemplate) {
    tmpl.valid = true;
    tmpl.validation_error.clear();

    if tmpl.template_id.is_empty() {
        tmpl.valid = false;
        tmpl.validation_error = "Missing template_id".to_string();
    } else if tmpl.name.is_empty() {
        tmpl.valid = false;
        tmpl.validation_error = "Missing name".to_string();
    } else if tmpl.cmd.windows.is_empty() && tmpl.cmd.linux.is_empty() && tmpl.cmd.macos.is_empty()
    {
        tmpl.valid = false;
        tmpl.validation_error = "No executable path for any OS".to_string();
    }
}

// ─── Slug generation ─────────────────────────────────────────────────────────

/// Turn a job name into a unique directory slug: lowercase, non-alphanumeric
/// runs collapse to single dashes, trimmed, capped at 64 chars, with a
/// `-2..-99` suffix on collision. Empty result means submission must fail.
pub fn generate_slug(job_name: &str, jobs_dir: &Path) -> String {
    let mut slug = String::with_capacity(job_name.len());
    let mut last_dash = false;
    for ch in job_name.chars() {
        let lower = ch.to_ascii_lowercase();
        if lower.is_ascii_alphanumeric() || lower == '_' {
            slug.push(lower);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }

    let slug = slug.trim_matches('-');
    let mut slug = slug.to_string();
    slug.truncate(SLUG_MAX_LEN);

    if slug.is_empty() {
        return String::new();
    }

    if !jobs_dir.join(&slug).exists() {
        return slug;
    }
    for i in 2..=99 {
        let candidate = format!("{slug}-{i}");
        if !jobs_dir.join(&candidate).exists() {
            return candidate;
        }
    }
    String::new()
}

// ─── Submission validation ───────────────────────────────────────────────────

pub fn validate_submission(
    tmpl: &JobTemplate,
    flag_values: &[String],
    cmd_path: &str,
    job_name: &str,
    frame_start: i32,
    frame_end: i32,
    chunk_size: i32,
    jobs_dir: &Path,
) -> Vec<String> {
    let mut errors = Vec::new();

    if cmd_path.is_empty() {
        errors.push("Executable path is empty".to_string());
    }

    if job_name.is_empty() {
        errors.push("Job name is empty".to_string());
    } else if generate_slug(job_name, jobs_dir).is_empty() {
        errors.push("Job name produces an empty slug".to_string());
    }

    if frame_start > frame_end {
        errors.push("Frame start must be <= frame end".to_string());
    }
    if chunk_size < 1 {
        errors.push("Chunk size must be >= 1".to_string());
    }

    for (i, flag) in tmpl.flags.iter().enumerate() {
        if flag.editable && flag.required {
            let value = flag_values.get(i).map(String::as_str).unwrap_or("");
            if value.is_empty() {
                errors.push(format!("Required field is empty: {}", flag.info));
            }
        }
    }

    errors
}

// ─── Manifest baking ─────────────────────────────────────────────────────────

/// Whether flag `i` is a bare flag (`-o` style, no value, not editable)
/// whose following positional value is editable, non-required, and empty —
/// in which case both are skipped together.
fn skips_bare_flag_pair(tmpl: &JobTemplate, flag_values: &[String], i: usize) -> bool {
    let flag = &tmpl.flags[i];
    if flag.flag.is_empty() || flag.value.is_some() || flag.editable {
        return false;
    }
    let Some(next) = tmpl.flags.get(i + 1) else {
        return false;
    };
    if !next.flag.is_empty() || !next.editable || next.required {
        return false;
    }
    flag_values.get(i + 1).map_or(true, |v| v.is_empty())
}

/// Whether flag `i` is an empty, non-required editable positional on its
/// own, to be dropped from the baked flag list.
fn skips_empty_positional(tmpl: &JobTemplate, flag_values: &[String], i: usize) -> bool {
    let flag = &tmpl.flags[i];
    flag.flag.is_empty()
        && flag.editable
        && !flag.required
        && flag_values.get(i).map_or(true, |v| v.is_empty())
}

/// Produce the immutable job manifest from a template plus the submitter's
/// edited flag values.
#[allow(clippy::too_many_arguments)]
pub fn bake_manifest(
    tmpl: &JobTemplate,
    flag_values: &[String],
    cmd_for_my_os: &str,
    job_slug: &str,
    frame_start: i32,
    frame_end: i32,
    chunk_size: i32,
    max_retries: u32,
    timeout_seconds: Option<u64>,
    node_id: &str,
    os: &str,
) -> JobManifest {
    let mut manifest = JobManifest {
        job_id: job_slug.to_string(),
        template_id: tmpl.template_id.clone(),
        submitted_by: node_id.to_string(),
        submitted_os: os.to_string(),
        submitted_at_ms: Utc::now().timestamp_millis(),
        frame_start,
        frame_end,
        chunk_size,
        max_retries,
        timeout_seconds,
        progress: tmpl.progress.clone(),
        output_detection: tmpl.output_detection.clone(),
        process: tmpl.process.clone(),
        environment: tmpl.environment.clone(),
        tags_required: tmpl.tags_required.clone(),
        ..Default::default()
    };

    // Every OS path from the template, with the submitter's own OS entry
    // overridden by the caller-edited path.
    if !tmpl.cmd.windows.is_empty() {
        manifest.cmd.insert("windows".into(), tmpl.cmd.windows.clone());
    }
    if !tmpl.cmd.linux.is_empty() {
        manifest.cmd.insert("linux".into(), tmpl.cmd.linux.clone());
    }
    if !tmpl.cmd.macos.is_empty() {
        manifest.cmd.insert("macos".into(), tmpl.cmd.macos.clone());
    }
    manifest.cmd.insert(os.to_string(), cmd_for_my_os.to_string());

    // Flags in template order; editable values come from the caller,
    // everything else from template defaults. Empty optional values collapse
    // together with their bare preceding flag.
    let mut i = 0;
    while i < tmpl.flags.len() {
        if skips_bare_flag_pair(tmpl, flag_values, i) {
            i += 2;
            continue;
        }
        if skips_empty_positional(tmpl, flag_values, i) {
            i += 1;
            continue;
        }

        let tf = &tmpl.flags[i];
        let value = if tf.editable && i < flag_values.len() {
            Some(flag_values[i].clone())
        } else {
            tf.value.clone()
        };
        manifest.flags.push(ManifestFlag {
            flag: tf.flag.clone(),
            value,
        });
        i += 1;
    }

    // The first output-type flag with a non-empty value determines the
    // output directory (its parent), pre-created before rendering.
    for (i, tf) in tmpl.flags.iter().enumerate() {
        if tf.r#type == "output" {
            if let Some(value) = flag_values.get(i).filter(|v| !v.is_empty()) {
                if let Some(parent) = Path::new(value).parent() {
                    let parent = parent.to_string_lossy();
                    if !parent.is_empty() {
                        manifest.output_dir = Some(parent.to_string());
                    }
                }
                break;
            }
        }
    }

    manifest
}

// ─── Output pattern resolution ───────────────────────────────────────────────

/// Expand the tokens of a `default_pattern` string: `{frame_pad}`,
/// `{project_dir}` / `{file_name}` (from the first file-type flag),
/// `{flag:id}`, and date/time tokens. A cleanup pass collapses separator
/// artefacts left behind by empty expansions.
pub fn resolve_pattern(
    pattern: &str,
    tmpl: &JobTemplate,
    flag_values: &[String],
    now: DateTime<Local>,
) -> String {
    let mut result = pattern.replace("{frame_pad}", &tmpl.frame_padding);

    if let Some((i, _)) = tmpl
        .flags
        .iter()
        .enumerate()
        .find(|(_, f)| f.r#type == "file")
    {
        let file_path = flag_values.get(i).map(String::as_str).unwrap_or("");
        let (project_dir, file_name) = if file_path.is_empty() {
            (String::new(), String::new())
        } else {
            let p = Path::new(file_path);
            (
                p.parent()
                    .map(|d| d.to_string_lossy().to_string())
                    .unwrap_or_default(),
                p.file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default(),
            )
        };
        result = result.replace("{project_dir}", &project_dir);
        result = result.replace("{file_name}", &file_name);
    }

    for (i, flag) in tmpl.flags.iter().enumerate() {
        if !flag.id.is_empty() {
            let token = format!("{{flag:{}}}", flag.id);
            let value = flag_values.get(i).map(String::as_str).unwrap_or("");
            result = result.replace(&token, value);
        }
    }

    result = result.replace("{date:YYYYMMDD}", &now.format("%Y%m%d").to_string());
    result = result.replace("{date:YYYY}", &now.format("%Y").to_string());
    result = result.replace("{date:MM}", &now.format("%m").to_string());
    result = result.replace("{date:DD}", &now.format("%d").to_string());
    result = result.replace("{time:HHmm}", &now.format("%H%M").to_string());
    result = result.replace("{time:HH}", &now.format("%H").to_string());
    result = result.replace("{time:mm}", &now.format("%M").to_string());

    // Cleanup: empty expansions leave dangling separators behind.
    result = result.replace("-/", "/");
    result = result.replace("-\\", "\\");
    result = result.replace("-_", "_");
    result = result.replace("_-", "_");
    result = result.replace("--", "-");

    result
}

// ─── Command preview ─────────────────────────────────────────────────────────

/// Human-readable command line for confirmation surfaces. Values with
/// spaces are quoted; empty editable values render as `<empty>`.
pub fn build_command_preview(
    tmpl: &JobTemplate,
    flag_values: &[String],
    cmd_path: &str,
) -> String {
    fn maybe_quote(s: &str) -> String {
        if s.contains(' ') {
            format!("\"{s}\"")
        } else {
            s.to_string()
        }
    }

    let mut preview = maybe_quote(cmd_path);

    let mut i = 0;
    while i < tmpl.flags.len() {
        if skips_bare_flag_pair(tmpl, flag_values, i) {
            i += 2;
            continue;
        }
        if skips_empty_positional(tmpl, flag_values, i) {
            i += 1;
            continue;
        }

        let f = &tmpl.flags[i];
        if !f.flag.is_empty() {
            preview.push(' ');
            preview.push_str(&f.flag);
        }
        if f.value.is_some() {
            let displayed = if f.editable && i < flag_values.len() {
                flag_values[i].as_str()
            } else {
                f.value.as_deref().unwrap_or("")
            };
            preview.push(' ');
            if displayed.is_empty() {
                preview.push_str("<empty>");
            } else {
                preview.push_str(&maybe_quote(displayed));
            }
        }
        i += 1;
    }

    preview
}
