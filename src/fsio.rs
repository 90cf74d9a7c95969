//! Atomic publication primitives for the shared tree.
//!
//! Every write goes to `{path}.tmp`, is flushed to disk, then renamed over
//! the destination. The rename is the atomic publication point; the flush
//! bounds the window in which a crash can leave a zero-byte temp visible.
//! Reads return `None` on missing, unreadable, or unparseable files — the
//! shared filesystem is allowed to show us torn state at any time.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_vec_pretty(value)?;
    write_bytes(path, &body)
}

pub fn write_text(path: &Path, content: &str) -> Result<()> {
    write_bytes(path, content.as_bytes())
}

fn write_bytes(path: &Path, body: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);

    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(body)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

pub fn safe_read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Unparseable JSON file");
            None
        }
    }
}

pub fn safe_read_value(path: &Path) -> Option<serde_json::Value> {
    safe_read_json(path)
}

pub fn safe_read_text(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok()
}

fn tmp_path(path: &Path) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    os.into()
}
