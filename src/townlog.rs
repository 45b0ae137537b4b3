//! Append-only town event log at `<town>/.runtime/town.log`.
//!
//! One JSON object per line. Callers typically ignore logging failures;
//! the log is observability, not state.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;

/// Town-level event kinds.
pub const EVENT_CALLBACK: &str = "callback";
pub const EVENT_LIFECYCLE: &str = "lifecycle";

pub struct Logger {
    path: PathBuf,
}

impl Logger {
    pub fn new(town_root: &Path) -> Self {
        Self {
            path: town_root.join(".runtime").join("town.log"),
        }
    }

    /// Append one event line.
    pub fn log(&self, event: &str, actor: &str, context: &str) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::json!({
            "ts": Utc::now(),
            "event": event,
            "actor": actor,
            "context": context,
        });
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}
