//! Farm tree initialisation and node identity.
//!
//! The shared tree is versioned by its directory name; peers with
//! incompatible layouts simply operate in different trees.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::{APP_VERSION, PROTOCOL_VERSION};
use crate::error::{FarmError, Result};
use crate::fsio;
use crate::heartbeat::NodeInfo;
use crate::monlog::MonitorLog;

pub const FARM_DIR_NAME: &str = "SmallRender-v1";

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FarmMeta {
    #[serde(rename = "_version", default = "default_version")]
    pub version: u32,
    pub protocol_version: u32,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub created_at_ms: i64,
    #[serde(default)]
    pub last_example_update: String,
}

/// Create or open the farm tree under `sync_root`. Creates the directory
/// skeleton and `farm.json` on first run, refreshes bundled example
/// templates when the app version changed, and always ensures this node's
/// own directories exist.
pub fn init(sync_root: &Path, node_id: &str, log: &MonitorLog) -> Result<PathBuf> {
    if !sync_root.is_dir() {
        return Err(FarmError::InvalidSyncRoot(sync_root.to_path_buf()));
    }

    let farm_path = sync_root.join(FARM_DIR_NAME);
    let first_node = !farm_path.exists();

    if first_node {
        log.info(
            "farm",
            format!("Creating farm structure at: {}", farm_path.display()),
        );

        std::fs::create_dir_all(farm_path.join("nodes"))?;
        std::fs::create_dir_all(farm_path.join("jobs"))?;
        std::fs::create_dir_all(farm_path.join("commands"))?;
        std::fs::create_dir_all(farm_path.join("templates").join("examples"))?;
        std::fs::create_dir_all(farm_path.join("submissions").join("processed"))?;

        let meta = FarmMeta {
            version: 1,
            protocol_version: PROTOCOL_VERSION,
            created_by: node_id.to_string(),
            created_at_ms: Utc::now().timestamp_millis(),
            last_example_update: APP_VERSION.to_string(),
        };
        fsio::write_json(&farm_path.join("farm.json"), &meta)?;

        copy_example_templates(&farm_path, log);
        log.info("farm", "Farm created successfully");
    } else if let Some(mut meta) = fsio::safe_read_json::<FarmMeta>(&farm_path.join("farm.json")) {
        if meta.last_example_update != APP_VERSION {
            log.info(
                "farm",
                format!(
                    "Updating example templates ({} -> {APP_VERSION})",
                    meta.last_example_update
                ),
            );
            copy_example_templates(&farm_path, log);
            meta.last_example_update = APP_VERSION.to_string();
            fsio::write_json(&farm_path.join("farm.json"), &meta)?;
        }
    }

    std::fs::create_dir_all(farm_path.join("nodes").join(node_id))?;
    std::fs::create_dir_all(farm_path.join("commands").join(node_id).join("processed"))?;

    Ok(farm_path)
}

/// Copy bundled example templates from `resources/templates` next to the
/// executable, overwriting stale copies. Missing bundle is non-fatal.
fn copy_example_templates(farm_path: &Path, log: &MonitorLog) {
    let Some(bundled) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|d| d.join("resources").join("templates")))
        .filter(|dir| dir.is_dir())
    else {
        log.warn("farm", "No bundled templates found, skipping example copy");
        return;
    };

    let dest_dir = farm_path.join("templates").join("examples");
    let Ok(entries) = std::fs::read_dir(&bundled) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || !path.extension().is_some_and(|ext| ext == "json") {
            continue;
        }
        let Some(name) = path.file_name() else { continue };
        if std::fs::copy(&path, dest_dir.join(name)).is_ok() {
            log.info(
                "farm",
                format!("Copied template: {}", name.to_string_lossy()),
            );
        }
    }
}

/// A live peer already claiming the coordinator role, if any.
pub fn find_live_coordinator(nodes: &[NodeInfo]) -> Option<&NodeInfo> {
    nodes
        .iter()
        .find(|n| !n.is_local && !n.is_dead() && n.heartbeat.is_coordinator)
}

/// Load this machine's 12-hex node identity from local app data, creating
/// it on first run. The identity never lives in the shared tree.
pub fn load_or_generate_node_id(data_dir: &Path) -> Result<String> {
    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join("node_id");

    if let Some(existing) = fsio::safe_read_text(&path) {
        let id = existing.trim().to_string();
        if id.len() == 12 && id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(id);
        }
    }

    let id: String = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
    fsio::write_text(&path, &id)?;
    Ok(id)
}

/// Per-node app data directory, overridable for tests and multi-instance
/// setups via `SMALLRENDER_DATA_DIR`.
pub fn app_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SMALLRENDER_DATA_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
        return PathBuf::from(home).join(".smallrender");
    }
    PathBuf::from(".smallrender")
}
