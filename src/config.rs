use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PROTOCOL_VERSION: u32 = 1;
pub const CLOCK_SKEW_WARN_MS: i64 = 30_000;

/// Timing presets tuned for the latency of the underlying shared filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimingPreset {
    /// Low-latency local network share.
    LocalNas,
    /// Higher-latency cloud storage (Dropbox, OneDrive, etc.).
    CloudFs,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    pub heartbeat_interval_ms: u64,
    pub scan_interval_ms: u64,
    pub claim_settle_ms: u64,
    /// Consecutive stale scans before declaring a peer dead.
    pub dead_threshold_scans: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingPreset::LocalNas.timing()
    }
}

impl TimingPreset {
    pub fn timing(self) -> TimingConfig {
        match self {
            // Death at ~9s
            TimingPreset::LocalNas => TimingConfig {
                heartbeat_interval_ms: 5000,
                scan_interval_ms: 3000,
                claim_settle_ms: 3000,
                dead_threshold_scans: 3,
            },
            // Death at ~20s
            TimingPreset::CloudFs => TimingConfig {
                heartbeat_interval_ms: 10_000,
                scan_interval_ms: 5000,
                claim_settle_ms: 5000,
                dead_threshold_scans: 4,
            },
            TimingPreset::Custom => TimingConfig {
                heartbeat_interval_ms: 5000,
                scan_interval_ms: 3000,
                claim_settle_ms: 3000,
                dead_threshold_scans: 3,
            },
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TimingPreset::LocalNas => "Local / NAS",
            TimingPreset::CloudFs => "Cloud FS",
            TimingPreset::Custom => "Custom",
        }
    }
}

/// Per-node configuration, persisted outside the shared tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Mount point of the shared filesystem; the farm tree lives underneath.
    pub sync_root: PathBuf,
    pub timing_preset: TimingPreset,
    pub timing: TimingConfig,
    /// Capability tags matched against a job's `tags_required`.
    pub tags: Vec<String>,
    pub is_coordinator: bool,
    pub auto_start_agent: bool,
    pub show_notifications: bool,
    pub font_scale: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_root: PathBuf::new(),
            timing_preset: TimingPreset::LocalNas,
            timing: TimingConfig::default(),
            tags: Vec::new(),
            is_coordinator: false,
            auto_start_agent: true,
            show_notifications: true,
            font_scale: 1.0,
        }
    }
}

impl Config {
    pub fn new(sync_root: PathBuf) -> Self {
        Self {
            sync_root,
            ..Default::default()
        }
    }

    pub fn with_preset(mut self, preset: TimingPreset) -> Self {
        self.timing_preset = preset;
        self.timing = preset.timing();
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}
