//! Ephemeral wisp files for cross-restart coordination.
//!
//! Wisps live in `.beads-wisp/`, are never git-tracked, and are burned
//! after use. Two kinds matter here: slung work (a bead attached to an
//! agent's hook, single slot per agent) and patrol cycles (loop state for
//! continuous roles). Writes are atomic via write-temp-then-rename; that
//! is the only concurrency primitive the conflict window needs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Directory name for ephemeral wisps.
pub const WISP_DIR: &str = ".beads-wisp";

const HOOK_PREFIX: &str = "hook-";
const HOOK_SUFFIX: &str = ".json";

/// Typed wisp failures. Reading a missing hook is distinct from reading a
/// malformed one.
#[derive(Debug, thiserror::Error)]
pub enum WispError {
    #[error("no hook file found")]
    NoHook,

    #[error("invalid wisp format: {0}")]
    InvalidWisp(String),
}

/// Work attached to an agent's hook. Written by a coordinator's sling,
/// burned by the agent on pickup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlungWork {
    #[serde(rename = "type")]
    pub wisp_type: String,
    pub bead_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subject: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Wisp type tag for slung work.
pub const TYPE_SLUNG_WORK: &str = "slung-work";

/// Wisp type tag for patrol cycles.
pub const TYPE_PATROL_CYCLE: &str = "patrol-cycle";

impl SlungWork {
    pub fn new(bead_id: &str, created_by: &str) -> Self {
        Self {
            wisp_type: TYPE_SLUNG_WORK.to_string(),
            bead_id: bead_id.to_string(),
            context: String::new(),
            subject: String::new(),
            created_by: created_by.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Execution state of one patrol step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepState {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Loop state for a continuous role (deacon, witness, refinery).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatrolCycle {
    #[serde(rename = "type")]
    pub wisp_type: String,
    pub formula_id: String,
    #[serde(default)]
    pub current_step: String,
    #[serde(default)]
    pub step_states: BTreeMap<String, StepState>,
    #[serde(default)]
    pub cycle_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl PatrolCycle {
    pub fn new(formula_id: &str, created_by: &str) -> Self {
        Self {
            wisp_type: TYPE_PATROL_CYCLE.to_string(),
            formula_id: formula_id.to_string(),
            current_step: String::new(),
            step_states: BTreeMap::new(),
            cycle_count: 0,
            last_cycle_at: None,
            created_by: created_by.to_string(),
            created_at: Utc::now(),
        }
    }

    /// Mark a step as started and make it current.
    pub fn begin_step(&mut self, step_id: &str) {
        self.current_step = step_id.to_string();
        self.step_states.insert(
            step_id.to_string(),
            StepState {
                status: "in_progress".to_string(),
                started_at: Some(Utc::now()),
                ..Default::default()
            },
        );
    }

    /// Mark a step completed with optional output.
    pub fn complete_step(&mut self, step_id: &str, output: &str) {
        let state = self.step_states.entry(step_id.to_string()).or_default();
        state.status = "completed".to_string();
        state.completed_at = Some(Utc::now());
        state.output = output.to_string();
    }

    /// Mark a step failed with the error text.
    pub fn fail_step(&mut self, step_id: &str, error: &str) {
        let state = self.step_states.entry(step_id.to_string()).or_default();
        state.status = "failed".to_string();
        state.completed_at = Some(Utc::now());
        state.error = error.to_string();
    }

    /// Close out one full cycle: bump the counter and clear step state.
    pub fn complete_cycle(&mut self) {
        self.cycle_count += 1;
        self.last_cycle_at = Some(Utc::now());
        self.current_step.clear();
        self.step_states.clear();
    }
}

/// Filename of an agent's hook file.
pub fn hook_filename(agent: &str) -> String {
    format!("{HOOK_PREFIX}{agent}{HOOK_SUFFIX}")
}

/// Ensure `.beads-wisp/` exists under the given root; returns its path.
pub fn ensure_dir(root: &Path) -> anyhow::Result<PathBuf> {
    let dir = root.join(WISP_DIR);
    std::fs::create_dir_all(&dir).context("creating wisp dir")?;
    Ok(dir)
}

/// Path to an agent's hook file.
pub fn hook_path(root: &Path, agent: &str) -> PathBuf {
    root.join(WISP_DIR).join(hook_filename(agent))
}

fn patrol_path(root: &Path, id: &str) -> PathBuf {
    root.join(WISP_DIR).join(format!("patrol-{id}.json"))
}

/// Write a slung work wisp onto the agent's hook.
pub fn write_slung_work(root: &Path, agent: &str, work: &SlungWork) -> anyhow::Result<()> {
    let dir = ensure_dir(root)?;
    write_json(&dir.join(hook_filename(agent)), work)
}

/// Write a patrol cycle wisp.
pub fn write_patrol_cycle(root: &Path, id: &str, cycle: &PatrolCycle) -> anyhow::Result<()> {
    let dir = ensure_dir(root)?;
    write_json(&dir.join(format!("patrol-{id}.json")), cycle)
}

/// Read the slung work from an agent's hook. `WispError::NoHook` when the
/// hook file does not exist.
pub fn read_hook(root: &Path, agent: &str) -> anyhow::Result<SlungWork> {
    let work: SlungWork = read_json(&hook_path(root, agent))?;
    if work.wisp_type != TYPE_SLUNG_WORK {
        return Err(WispError::InvalidWisp(format!(
            "expected {TYPE_SLUNG_WORK}, got {}",
            work.wisp_type
        ))
        .into());
    }
    Ok(work)
}

/// Read a patrol cycle wisp.
pub fn read_patrol_cycle(root: &Path, id: &str) -> anyhow::Result<PatrolCycle> {
    let cycle: PatrolCycle = read_json(&patrol_path(root, id))?;
    if cycle.wisp_type != TYPE_PATROL_CYCLE {
        return Err(WispError::InvalidWisp(format!(
            "expected {TYPE_PATROL_CYCLE}, got {}",
            cycle.wisp_type
        ))
        .into());
    }
    Ok(cycle)
}

/// Remove an agent's hook after pickup. Already-burned is fine.
pub fn burn_hook(root: &Path, agent: &str) -> anyhow::Result<()> {
    remove_if_exists(&hook_path(root, agent))
}

/// Remove a patrol cycle wisp.
pub fn burn_patrol_cycle(root: &Path, id: &str) -> anyhow::Result<()> {
    remove_if_exists(&patrol_path(root, id))
}

/// Whether an agent has a hook file.
pub fn has_hook(root: &Path, agent: &str) -> bool {
    hook_path(root, agent).exists()
}

/// Agents with active hooks under this root.
pub fn list_hooks(root: &Path) -> anyhow::Result<Vec<String>> {
    let dir = root.join(WISP_DIR);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(anyhow::Error::new(e).context("listing wisp dir")),
    };

    let mut agents = Vec::new();
    for entry in entries.filter_map(Result::ok) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(stem) = name
            .strip_prefix(HOOK_PREFIX)
            .and_then(|s| s.strip_suffix(HOOK_SUFFIX))
            && !stem.is_empty()
        {
            agents.push(stem.to_string());
        }
    }
    agents.sort();
    Ok(agents)
}

fn remove_if_exists(path: &Path) -> anyhow::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow::Error::new(e).context("removing wisp")),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(WispError::NoHook.into());
        }
        Err(e) => return Err(anyhow::Error::new(e).context("reading wisp")),
    };
    serde_json::from_str(&data).map_err(|e| WispError::InvalidWisp(e.to_string()).into())
}

/// Write JSON atomically: temp file in the same directory, then rename.
fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let data = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data).context("writing temp wisp")?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(anyhow::Error::new(e).context("renaming wisp into place"));
    }
    Ok(())
}
