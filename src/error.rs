use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FarmError {
    #[error("Sync root is not a valid directory: {0}")]
    InvalidSyncRoot(PathBuf),

    #[error("Another coordinator is already active: {hostname} ({node_id})")]
    CoordinatorConflict { hostname: String, node_id: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Job already exists: {0}")]
    JobExists(String),

    #[error("Submission rejected: {0}")]
    SubmissionInvalid(String),

    #[error("Agent IPC error: {0}")]
    AgentIpc(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FarmError>;
