use std::collections::HashMap;
use std::time::{Duration, Instant};

const TTL: Duration = Duration::from_secs(60);

/// Short-TTL set of recently seen message IDs. Message IDs are globally
/// unique by construction, so the set only needs to cover redelivery windows
/// (a command observed again before its processed/ move lands).
#[derive(Debug, Default)]
pub struct MessageDedup {
    seen: HashMap<String, Instant>,
}

impl MessageDedup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `msg_id` was already seen; records it if new.
    pub fn is_duplicate(&mut self, msg_id: &str) -> bool {
        if self.seen.contains_key(msg_id) {
            return true;
        }
        self.seen.insert(msg_id.to_string(), Instant::now());
        false
    }

    /// Drop entries older than the TTL. Call every ~30s.
    pub fn purge(&mut self) {
        self.seen.retain(|_, at| at.elapsed() < TTL);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
