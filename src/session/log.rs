//! Per-container session log: `{ "node_id": .., "sessions": [..] }`.
//!
//! Only the owning scheduler writes it. A missing or corrupt file is read
//! as an empty record and rewritten on the next save.

use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::flags::write_atomic;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    /// Wall-clock start of the iteration, seconds since the Unix epoch.
    pub timestamp: f64,
    /// Sampled inter-session delay, seconds.
    pub sleep_duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_kbps: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionLog {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<u64>,
    #[serde(default)]
    pub sessions: Vec<SessionEntry>,
}

impl SessionLog {
    pub fn load_or_default(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!("unreadable session log {}, starting fresh: {e}", path.display());
                return Self::default();
            }
        };
        serde_json::from_str(&text).unwrap_or_else(|e| {
            warn!("corrupt session log {}, starting fresh: {e}", path.display());
            Self::default()
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("serialize session log")?;
        write_atomic(path, &json)
    }

    /// Record `node_id` unless one is already present. Returns true if set.
    pub fn record_node_id(&mut self, node_id: u64) -> bool {
        if self.node_id.is_some() {
            return false;
        }
        self.node_id = Some(node_id);
        true
    }

    pub fn push(&mut self, entry: SessionEntry) {
        self.sessions.push(entry);
    }
}
