//! Wire messages exchanged with the out-of-process renderer agent over the
//! local IPC pipe. Both directions are length-prefixed JSON with a `type`
//! tag.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::jobs::manifest::ProgressConfig;

// ─── Monitor → agent ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorToAgent {
    Ping,
    Shutdown,
    Task(TaskMessage),
    Abort { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskMessage {
    pub job_id: String,
    pub frame_start: i32,
    pub frame_end: i32,
    pub command: CommandSpec,
    pub working_dir: Option<String>,
    pub environment: BTreeMap<String, String>,
    /// `None` when the template defines no progress patterns.
    pub progress: Option<ProgressConfig>,
    pub output_detection: Option<OutputSpec>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandSpec {
    pub executable: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputSpec {
    pub regex: String,
    pub capture_group: u32,
}

// ─── Agent → monitor ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentToMonitor {
    Pong,
    Status {
        #[serde(default)]
        state: String,
        #[serde(default)]
        pid: u32,
    },
    Ack {
        #[serde(default)]
        job_id: String,
    },
    Progress {
        #[serde(default)]
        progress_pct: f32,
    },
    Stdout {
        #[serde(default)]
        lines: Vec<String>,
    },
    FrameCompleted {
        frame: i32,
    },
    Completed {
        #[serde(default)]
        elapsed_ms: u64,
        #[serde(default)]
        exit_code: i32,
        #[serde(default)]
        output_file: Option<String>,
    },
    Failed {
        #[serde(default = "default_exit_code")]
        exit_code: i32,
        #[serde(default = "default_error")]
        error: String,
    },
}

fn default_exit_code() -> i32 {
    -1
}

fn default_error() -> String {
    "Unknown error".to_string()
}
