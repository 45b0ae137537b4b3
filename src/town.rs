//! Town tree discovery and rig path layout.
//!
//! A town is the root directory holding every rig, the shared agent
//! registry, and the town-level runtime state. Each rig under it owns one
//! canonical clone (`mayor/rig`), an optional integration checkout
//! (`refinery/rig`), worker worktrees under `polecats/`, and the shared
//! tracker database at `.beads/`.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Directory holding worker worktrees inside a rig.
pub const POLECATS_DIR: &str = "polecats";

/// Runtime metadata directory name (pool state, locks, keepalive).
pub const RUNTIME_DIR: &str = ".runtime";

/// Find the town root by walking up from `start`.
///
/// A directory is the town root if it contains `settings/agents.json` or a
/// `mayor/` subdirectory. Returns None when no ancestor qualifies.
pub fn find_root(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join("settings").join("agents.json").is_file() || dir.join("mayor").is_dir() {
            return Some(dir);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Find the town root from the current directory.
pub fn find_root_from_cwd() -> anyhow::Result<PathBuf> {
    let cwd = std::env::current_dir()?;
    find_root(&cwd).ok_or_else(|| anyhow::anyhow!("not inside a town (no settings/agents.json or mayor/ in any ancestor)"))
}

/// One code repository being worked on, and the paths its agents live at.
#[derive(Debug, Clone)]
pub struct Rig {
    pub name: String,
    pub path: PathBuf,
    pub default_branch: String,
}

#[derive(Debug, Deserialize)]
struct RigConfigFile {
    #[serde(default)]
    default_branch: Option<String>,
}

impl Rig {
    /// Open a rig under a town root, reading its default branch from
    /// `<rig>/config.json` when present.
    pub fn open(town_root: &Path, name: &str) -> anyhow::Result<Self> {
        let path = town_root.join(name);
        if !path.is_dir() {
            anyhow::bail!("rig {name} not found at {}", path.display());
        }

        let default_branch = std::fs::read_to_string(path.join("config.json"))
            .ok()
            .and_then(|data| serde_json::from_str::<RigConfigFile>(&data).ok())
            .and_then(|cfg| cfg.default_branch)
            .unwrap_or_else(|| "main".to_string());

        Ok(Self {
            name: name.to_string(),
            path,
            default_branch,
        })
    }

    /// The canonical clone worktrees are spawned from.
    pub fn mayor_clone(&self) -> PathBuf {
        self.path.join("mayor").join("rig")
    }

    /// The integration checkout used by the merge engine. Falls back to the
    /// mayor clone when no refinery checkout exists.
    pub fn refinery_clone(&self) -> PathBuf {
        let refinery = self.path.join("refinery").join("rig");
        if refinery.is_dir() {
            refinery
        } else {
            self.mayor_clone()
        }
    }

    /// Directory of worker worktrees.
    pub fn polecats_dir(&self) -> PathBuf {
        self.path.join(POLECATS_DIR)
    }

    /// A single worker's workspace path.
    pub fn polecat_dir(&self, name: &str) -> PathBuf {
        self.polecats_dir().join(name)
    }

    /// Runtime metadata directory (pool state, merge queue, events).
    pub fn runtime_dir(&self) -> PathBuf {
        self.path.join(RUNTIME_DIR)
    }

    /// The rig's shared tracker database directory.
    pub fn beads_dir(&self) -> PathBuf {
        self.path.join(".beads")
    }

    /// Rig settings file (namepool configuration and friends).
    pub fn settings_path(&self) -> PathBuf {
        self.path.join("settings").join("config.json")
    }

    /// The worker branch for a given worker name.
    pub fn polecat_branch(name: &str) -> String {
        format!("polecat/{name}")
    }
}
