use serde::{Deserialize, Serialize};

/// An inclusive, contiguous frame range assigned to one worker as a unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    pub frame_start: i32,
    pub frame_end: i32,
}

impl ChunkRange {
    pub fn new(frame_start: i32, frame_end: i32) -> Self {
        Self {
            frame_start,
            frame_end,
        }
    }

    /// Zero-padded range label used in event and stdout filenames, e.g.
    /// `000001-000010`. Pads to six digits so names sort numerically.
    pub fn range_str(&self) -> String {
        format!("{:06}-{:06}", self.frame_start, self.frame_end)
    }

    pub fn frame_count(&self) -> i32 {
        self.frame_end - self.frame_start + 1
    }
}

impl std::fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.frame_start == self.frame_end {
            write!(f, "f{}", self.frame_start)
        } else {
            write!(f, "f{}-{}", self.frame_start, self.frame_end)
        }
    }
}

/// Split `[frame_start, frame_end]` into chunks of `chunk_size` frames.
/// The final chunk absorbs the remainder. Degenerate inputs yield nothing.
pub fn compute_chunks(frame_start: i32, frame_end: i32, chunk_size: i32) -> Vec<ChunkRange> {
    let mut chunks = Vec::new();
    if chunk_size <= 0 || frame_start > frame_end {
        return chunks;
    }

    let mut f = frame_start;
    while f <= frame_end {
        chunks.push(ChunkRange::new(f, (f + chunk_size - 1).min(frame_end)));
        f += chunk_size;
    }
    chunks
}
