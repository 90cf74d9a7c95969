use serde::{Deserialize, Serialize};

use crate::scheduler::chunk::ChunkRange;

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    Pending,
    Assigned,
    Completed,
    Failed,
}

impl std::fmt::Display for ChunkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkState::Pending => write!(f, "pending"),
            ChunkState::Assigned => write!(f, "assigned"),
            ChunkState::Completed => write!(f, "completed"),
            ChunkState::Failed => write!(f, "failed"),
        }
    }
}

/// One chunk row in a job's dispatch table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchChunk {
    pub frame_start: i32,
    pub frame_end: i32,
    pub state: ChunkState,
    #[serde(default)]
    pub assigned_to: String,
    #[serde(default)]
    pub assigned_at_ms: i64,
    #[serde(default)]
    pub completed_at_ms: i64,
    #[serde(default)]
    pub retry_count: u32,
}

impl DispatchChunk {
    pub fn new(range: ChunkRange) -> Self {
        Self {
            frame_start: range.frame_start,
            frame_end: range.frame_end,
            state: ChunkState::Pending,
            assigned_to: String::new(),
            assigned_at_ms: 0,
            completed_at_ms: 0,
            retry_count: 0,
        }
    }

    pub fn range(&self) -> ChunkRange {
        ChunkRange::new(self.frame_start, self.frame_end)
    }

    pub fn matches(&self, range: ChunkRange) -> bool {
        self.frame_start == range.frame_start && self.frame_end == range.frame_end
    }

    /// Return the chunk to the pending pool, clearing the assignee.
    pub fn release(&mut self) {
        self.state = ChunkState::Pending;
        self.assigned_to.clear();
        self.assigned_at_ms = 0;
    }
}

/// The coordinator's durable per-job chunk table, persisted to
/// `jobs/{id}/dispatch.json` on a throttle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchTable {
    #[serde(rename = "_version", default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub coordinator_id: String,
    #[serde(default)]
    pub updated_at_ms: i64,
    #[serde(default)]
    pub chunks: Vec<DispatchChunk>,
}

impl DispatchTable {
    pub fn find_chunk_mut(&mut self, range: ChunkRange) -> Option<&mut DispatchChunk> {
        self.chunks.iter_mut().find(|c| c.matches(range))
    }

    pub fn first_pending_mut(&mut self) -> Option<&mut DispatchChunk> {
        self.chunks
            .iter_mut()
            .find(|c| c.state == ChunkState::Pending)
    }

    pub fn all_completed(&self) -> bool {
        !self.chunks.is_empty()
            && self.chunks.iter().all(|c| c.state == ChunkState::Completed)
    }
}
