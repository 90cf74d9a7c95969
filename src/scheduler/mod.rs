pub mod chunk;
pub mod dispatch;
pub mod submission;
pub mod table;

pub use chunk::{compute_chunks, ChunkRange};
pub use dispatch::{CompletionState, DispatchManager, DispatchOutbound};
pub use submission::SubmissionManager;
pub use table::{ChunkState, DispatchChunk, DispatchTable};
