//! Worker execution engine: the per-node side of the farm.
//!
//! - [`agent`]: supervises the out-of-process renderer and its IPC pipe
//! - [`render`]: the chunk state machine driving one render at a time
//! - [`ipc`]: length-prefixed JSON framing over a local socket/pipe
//! - [`messages`]: the monitor/agent wire protocol
//!
//! # Execution flow
//!
//! 1. The main loop routes an `assign_chunk` into [`RenderCoordinator::queue_dispatch`]
//! 2. The next `update()` sends a task to the connected agent
//! 3. Agent messages stream back (ack, progress, stdout, frame completions)
//! 4. A terminal `completed`/`failed` lands as a [`render::ChunkReport`]
//!    which the node forwards to the coordinator

pub mod agent;
pub mod ipc;
pub mod messages;
pub mod render;

pub use agent::AgentSupervisor;
pub use render::{ChunkReport, RenderCoordinator};
