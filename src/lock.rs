//! Agent identity locking.
//!
//! Lock files live at `<worker>/.runtime/agent.lock` and record the owning
//! PID, acquisition time, multiplexer session, and hostname. A lock is
//! valid only while its PID refers to a live process on this host; stale
//! locks are cleaned up automatically on the next acquire or check.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

/// Lock file name inside a workspace's `.runtime` directory.
pub const LOCK_FILE: &str = "agent.lock";

/// Typed lock failures.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("locked by another agent: PID {pid} (session: {session_id}, acquired: {acquired_at})")]
    Locked {
        pid: i32,
        session_id: String,
        acquired_at: DateTime<Utc>,
    },

    #[error("workspace is not locked")]
    NotLocked,

    #[error("invalid lock file: {0}")]
    InvalidLock(String),
}

/// Contents of a lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: i32,
    pub acquired_at: DateTime<Utc>,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub hostname: String,
}

impl LockInfo {
    /// True when the owning process is dead.
    pub fn is_stale(&self) -> bool {
        !process_exists(self.pid)
    }
}

/// Null-signal probe: true when a process with this PID is alive.
fn process_exists(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    kill(Pid::from_raw(pid), None).is_ok()
}

fn current_hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// An identity lock for one worker directory.
pub struct IdentityLock {
    lock_path: PathBuf,
}

impl IdentityLock {
    pub fn new(worker_dir: &Path) -> Self {
        Self {
            lock_path: worker_dir.join(".runtime").join(LOCK_FILE),
        }
    }

    /// Acquire the lock for this worker.
    ///
    /// A stale lock (dead PID) is removed and re-acquired. A lock held by
    /// the current process is refreshed. A lock held by another live
    /// process fails with `LockError::Locked` carrying the holder's
    /// details.
    pub fn acquire(&self, session_id: &str) -> anyhow::Result<()> {
        match self.read() {
            Ok(info) => {
                if info.is_stale() {
                    self.release().context("removing stale lock")?;
                } else if info.pid == std::process::id() as i32 {
                    return self.write(session_id);
                } else {
                    return Err(LockError::Locked {
                        pid: info.pid,
                        session_id: info.session_id,
                        acquired_at: info.acquired_at,
                    }
                    .into());
                }
            }
            Err(e) if e.downcast_ref::<LockError>().is_some_and(|e| matches!(e, LockError::NotLocked)) => {}
            Err(e) => return Err(e),
        }

        self.write(session_id)
    }

    /// Remove the lock file. Missing file is fine.
    pub fn release(&self) -> anyhow::Result<()> {
        match std::fs::remove_file(&self.lock_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::new(e).context("removing lock file")),
        }
    }

    /// Read the current lock info without modifying it.
    pub fn read(&self) -> anyhow::Result<LockInfo> {
        let data = match std::fs::read_to_string(&self.lock_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LockError::NotLocked.into());
            }
            Err(e) => return Err(anyhow::Error::new(e).context("reading lock file")),
        };

        serde_json::from_str(&data)
            .map_err(|e| LockError::InvalidLock(e.to_string()).into())
    }

    /// Check whether another live agent holds this lock.
    ///
    /// Returns Ok for unlocked, stale (cleaned up as a side effect), or
    /// held-by-us; `LockError::Locked` otherwise.
    pub fn check(&self) -> anyhow::Result<()> {
        let info = match self.read() {
            Ok(info) => info,
            Err(e) if e.downcast_ref::<LockError>().is_some_and(|e| matches!(e, LockError::NotLocked)) => {
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if info.is_stale() {
            let _ = self.release();
            return Ok(());
        }
        if info.pid == std::process::id() as i32 {
            return Ok(());
        }

        Err(LockError::Locked {
            pid: info.pid,
            session_id: info.session_id,
            acquired_at: info.acquired_at,
        }
        .into())
    }

    /// Human-readable lock status line.
    pub fn status(&self) -> String {
        match self.read() {
            Ok(info) => {
                if info.is_stale() {
                    format!("stale (dead PID {})", info.pid)
                } else if info.pid == std::process::id() as i32 {
                    "locked (by us)".to_string()
                } else {
                    format!("locked by PID {} (session: {})", info.pid, info.session_id)
                }
            }
            Err(e) => {
                if e.downcast_ref::<LockError>().is_some_and(|e| matches!(e, LockError::NotLocked)) {
                    "unlocked".to_string()
                } else {
                    format!("error: {e}")
                }
            }
        }
    }

    /// Remove the lock regardless of who holds it. For doctor --fix
    /// scenarios only.
    pub fn force_release(&self) -> anyhow::Result<()> {
        self.release()
    }

    fn write(&self, session_id: &str) -> anyhow::Result<()> {
        let dir = self
            .lock_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("lock path has no parent"))?;
        std::fs::create_dir_all(dir).context("creating lock directory")?;

        let info = LockInfo {
            pid: std::process::id() as i32,
            acquired_at: Utc::now(),
            session_id: session_id.to_string(),
            hostname: current_hostname(),
        };
        let data = serde_json::to_string_pretty(&info)?;
        std::fs::write(&self.lock_path, data).context("writing lock file")
    }
}

/// Scan a directory tree for agent locks. Returns (worker dir, lock info)
/// pairs; unreadable or invalid lock files are skipped.
pub fn find_all_locks(root: &Path) -> Vec<(PathBuf, LockInfo)> {
    let mut locks = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() || entry.file_name().to_str() != Some(LOCK_FILE) {
            continue;
        }
        let runtime_dir = entry.path().parent();
        let in_runtime = runtime_dir
            .and_then(|d| d.file_name())
            .and_then(|n| n.to_str())
            == Some(".runtime");
        if !in_runtime {
            continue;
        }
        let Some(worker_dir) = runtime_dir.and_then(Path::parent) else {
            continue;
        };
        if let Ok(info) = IdentityLock::new(worker_dir).read() {
            locks.push((worker_dir.to_path_buf(), info));
        }
    }
    locks
}

/// Remove all stale locks under a tree. Returns the number cleaned.
pub fn clean_stale_locks(root: &Path) -> usize {
    let mut cleaned = 0;
    for (worker_dir, info) in find_all_locks(root) {
        if info.is_stale() && IdentityLock::new(&worker_dir).release().is_ok() {
            cleaned += 1;
        }
    }
    cleaned
}

/// Compare lock files against the set of active multiplexer sessions and
/// describe the two failure modes: stale locks (dead PID) and orphaned
/// locks (live PID whose session is gone).
pub fn detect_collisions(root: &Path, active_sessions: &[String]) -> Vec<String> {
    let mut collisions = Vec::new();
    for (worker_dir, info) in find_all_locks(root) {
        if info.is_stale() {
            collisions.push(format!(
                "stale lock in {} (dead PID {}, session: {})",
                worker_dir.display(),
                info.pid,
                info.session_id
            ));
            continue;
        }
        if !info.session_id.is_empty() && !active_sessions.contains(&info.session_id) {
            collisions.push(format!(
                "orphaned lock in {} (session {} not found, PID {} still alive)",
                worker_dir.display(),
                info.session_id,
                info.pid
            ));
        }
    }
    collisions
}
