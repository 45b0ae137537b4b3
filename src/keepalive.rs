//! Agent activity signaling via a timestamp file.
//!
//! Best-effort: touch never fails loudly, and readers treat a missing or
//! unreadable file as very stale.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Keepalive file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub last_command: String,
    pub timestamp: DateTime<Utc>,
}

impl State {
    /// How old the signal is.
    pub fn age(&self) -> Duration {
        Utc::now() - self.timestamp
    }

    /// Less than 2 minutes old.
    pub fn is_fresh(&self) -> bool {
        self.age() < Duration::minutes(2)
    }

    /// Between 2 and 5 minutes old.
    pub fn is_stale(&self) -> bool {
        let age = self.age();
        age >= Duration::minutes(2) && age < Duration::minutes(5)
    }

    /// 5 minutes old or more.
    pub fn is_very_stale(&self) -> bool {
        self.age() >= Duration::minutes(5)
    }
}

/// Update the keepalive file in a workspace's `.runtime` directory.
/// Errors are silently ignored.
pub fn touch(workspace_root: &Path, command: &str) {
    let runtime_dir = workspace_root.join(".runtime");
    if std::fs::create_dir_all(&runtime_dir).is_err() {
        return;
    }

    let state = State {
        last_command: command.to_string(),
        timestamp: Utc::now(),
    };
    if let Ok(data) = serde_json::to_string(&state) {
        let _ = std::fs::write(runtime_dir.join("keepalive.json"), data);
    }
}

/// Read the keepalive state for a workspace. None when missing or
/// unreadable.
pub fn read(workspace_root: &Path) -> Option<State> {
    let data = std::fs::read_to_string(workspace_root.join(".runtime/keepalive.json")).ok()?;
    serde_json::from_str(&data).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_then_read_is_fresh() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path(), "boomtown prime");

        let state = read(tmp.path()).unwrap();
        assert_eq!(state.last_command, "boomtown prime");
        assert!(state.is_fresh());
        assert!(!state.is_stale());
        assert!(!state.is_very_stale());
    }

    #[test]
    fn read_missing_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(read(tmp.path()).is_none());
    }

    #[test]
    fn freshness_bands() {
        let state = State {
            last_command: "x".to_string(),
            timestamp: Utc::now() - Duration::minutes(3),
        };
        assert!(!state.is_fresh());
        assert!(state.is_stale());
        assert!(!state.is_very_stale());

        let state = State {
            last_command: "x".to_string(),
            timestamp: Utc::now() - Duration::minutes(10),
        };
        assert!(state.is_very_stale());
    }

    #[test]
    fn touch_overwrites_previous_signal() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path(), "first");
        touch(tmp.path(), "second");
        assert_eq!(read(tmp.path()).unwrap().last_command, "second");
    }
}
