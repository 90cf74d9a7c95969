use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

fn default_version() -> u32 {
    1
}

fn default_priority() -> i32 {
    50
}

/// Lifecycle state of a job. The newest entry in `state/` is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Active,
    Paused,
    Cancelled,
    Completed,
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Active => write!(f, "active"),
            JobState::Paused => write!(f, "paused"),
            JobState::Cancelled => write!(f, "cancelled"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

// ─── Shared sub-structures (templates and manifests) ────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressPattern {
    pub regex: String,
    /// "fraction" or "percentage"
    #[serde(rename = "type")]
    pub pattern_type: String,
    #[serde(default = "one")]
    pub numerator_group: u32,
    #[serde(default = "two")]
    pub denominator_group: u32,
    #[serde(default = "one")]
    pub group: u32,
    #[serde(default)]
    pub info: String,
}

fn one() -> u32 {
    1
}

fn two() -> u32 {
    2
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionPattern {
    pub regex: String,
    #[serde(default)]
    pub info: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub regex: String,
    #[serde(default)]
    pub info: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressConfig {
    #[serde(default)]
    pub patterns: Vec<ProgressPattern>,
    #[serde(default)]
    pub completion_pattern: Option<CompletionPattern>,
    #[serde(default)]
    pub error_patterns: Vec<ErrorPattern>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDetection {
    /// `None` disables detection.
    #[serde(default)]
    pub stdout_regex: Option<String>,
    #[serde(default = "one")]
    pub path_group: u32,
    /// "exit_code_only" or "exists_nonzero"
    #[serde(default = "default_validation")]
    pub validation: String,
    #[serde(default)]
    pub info: String,
}

fn default_validation() -> String {
    "exit_code_only".to_string()
}

impl Default for OutputDetection {
    fn default() -> Self {
        Self {
            stdout_regex: None,
            path_group: 1,
            validation: default_validation(),
            info: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    #[serde(default = "default_kill_method")]
    pub kill_method: String,
    #[serde(default)]
    pub working_dir: Option<String>,
}

fn default_kill_method() -> String {
    "terminate".to_string()
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            kill_method: default_kill_method(),
            working_dir: None,
        }
    }
}

// ─── Templates ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateCmd {
    #[serde(default)]
    pub windows: String,
    #[serde(default)]
    pub linux: String,
    #[serde(default)]
    pub macos: String,
    #[serde(default)]
    pub label: String,
    #[serde(default = "yes")]
    pub editable: bool,
}

fn yes() -> bool {
    true
}

impl TemplateCmd {
    pub fn for_os(&self, os: &str) -> &str {
        match os {
            "windows" => &self.windows,
            "macos" => &self.macos,
            _ => &self.linux,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateFlag {
    /// "-b", "-o", or "" for a positional value.
    #[serde(default)]
    pub flag: String,
    /// `None` = standalone flag, `""` = user fills in, `"{frame}"` = runtime.
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub info: String,
    #[serde(default)]
    pub editable: bool,
    #[serde(default)]
    pub required: bool,
    /// "file" = scene file picker, "output" = output path, "" = plain text.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub r#type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filter: String,
    /// Cross-reference identifier for `{flag:id}` tokens and overrides.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_pattern: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefaults {
    pub frame_start: i32,
    pub frame_end: i32,
    pub chunk_size: i32,
    pub priority: i32,
    pub max_retries: u32,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            frame_start: 1,
            frame_end: 250,
            chunk_size: 1,
            priority: 50,
            max_retries: 3,
            timeout_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobTemplate {
    #[serde(rename = "_version", default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub template_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cmd: TemplateCmd,
    #[serde(default)]
    pub flags: Vec<TemplateFlag>,
    /// Output frame padding, e.g. "####" (Blender), "[####]" (After Effects).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub frame_padding: String,
    #[serde(default)]
    pub job_defaults: JobDefaults,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub output_detection: OutputDetection,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub tags_required: Vec<String>,

    // Runtime only, never serialized.
    #[serde(skip)]
    pub valid: bool,
    #[serde(skip)]
    pub validation_error: String,
    #[serde(skip)]
    pub is_example: bool,
}

// ─── Manifests ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestFlag {
    #[serde(default)]
    pub flag: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// The immutable description of a job, written once at submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobManifest {
    #[serde(rename = "_version", default = "default_version")]
    pub version: u32,
    pub job_id: String,
    #[serde(default)]
    pub template_id: String,
    #[serde(default)]
    pub submitted_by: String,
    #[serde(default)]
    pub submitted_os: String,
    #[serde(default)]
    pub submitted_at_ms: i64,
    /// Map of os name ("windows" | "linux" | "macos") to executable path.
    #[serde(default)]
    pub cmd: BTreeMap<String, String>,
    #[serde(default)]
    pub flags: Vec<ManifestFlag>,
    #[serde(default)]
    pub frame_start: i32,
    #[serde(default)]
    pub frame_end: i32,
    #[serde(default = "one_i32")]
    pub chunk_size: i32,
    #[serde(default = "three")]
    pub max_retries: u32,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Parent directory of the output path, pre-created before rendering.
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub output_detection: OutputDetection,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub tags_required: Vec<String>,
}

fn one_i32() -> i32 {
    1
}

fn three() -> u32 {
    3
}

impl JobManifest {
    pub fn cmd_for_os(&self, os: &str) -> Option<&str> {
        self.cmd
            .get(os)
            .map(String::as_str)
            .filter(|path| !path.is_empty())
    }
}

// ─── State log entries ──────────────────────────────────────────────────────

/// One append-only entry under `jobs/{id}/state/`. The filename encodes
/// `{timestamp_ms}_{node_id}`, making concurrent writes collision-free.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStateEntry {
    #[serde(rename = "_version", default = "default_version")]
    pub version: u32,
    pub state: JobState,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub timestamp_ms: i64,
}

/// A scanned job: manifest plus the authoritative state from the state log.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub manifest: JobManifest,
    pub current_state: JobState,
    pub current_priority: i32,
}

impl JobInfo {
    pub fn new(manifest: JobManifest) -> Self {
        Self {
            manifest,
            current_state: JobState::Active,
            current_priority: 50,
        }
    }
}
