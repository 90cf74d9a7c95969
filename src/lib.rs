pub mod bus;
pub mod cache;
pub mod config;
pub mod error;
pub mod farm;
pub mod fsio;
pub mod heartbeat;
pub mod jobs;
pub mod monlog;
pub mod node;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use config::{Config, TimingConfig, TimingPreset};
pub use error::{FarmError, Result};
pub use monlog::MonitorLog;
pub use node::Node;
