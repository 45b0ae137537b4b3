//! Worker (polecat) lifecycle.
//!
//! Workers are git worktrees over the mayor clone's object store: one
//! shared object database, many working directories, one branch per
//! worker. A worker's state is never stored on the worker - it is derived
//! from the tracker's assignee and status fields, which keeps the manager
//! and the tracker from fighting over a second copy.

use std::fmt;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RigSettings;
use crate::git::{Git, UncommittedWorkStatus};
use crate::namepool::NamePool;
use crate::town::Rig;
use crate::tracker::{Tracker, UpdateOptions};

/// Typed worker-lifecycle failures.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("polecat already exists: {0}")]
    Exists(String),

    #[error("polecat not found: {0}")]
    NotFound(String),

    #[error("polecat {name} has uncommitted work: {status}")]
    HasUncommittedWork {
        name: String,
        status: UncommittedWorkStatus,
    },
}

/// Derived worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Working,
    Done,
    Stuck,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Idle => "idle",
            WorkerState::Working => "working",
            WorkerState::Done => "done",
            WorkerState::Stuck => "stuck",
        };
        write!(f, "{s}")
    }
}

/// A worker record. State and issue are projections of tracker fields.
#[derive(Debug, Clone, Serialize)]
pub struct Polecat {
    pub name: String,
    pub rig: String,
    pub state: WorkerState,
    pub workspace: PathBuf,
    pub branch: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub issue: String,
    pub created_at: DateTime<Utc>,
}

/// Handles worker lifecycle for one rig.
pub struct Manager {
    rig: Rig,
    pool: NamePool,
    tracker: Tracker,
}

impl Manager {
    /// Create a manager, loading namepool configuration from the rig's
    /// settings file and any persisted pool state.
    pub fn new(rig: Rig) -> Self {
        let settings = RigSettings::load(&rig.settings_path()).unwrap_or_default();
        let mut pool = match settings.namepool {
            Some(np) => NamePool::with_config(
                &rig.path,
                &rig.name,
                &np.style,
                &np.names,
                np.max_before_numbering,
            ),
            None => NamePool::new(&rig.path, &rig.name),
        };
        // Load existing state; a fresh rig has none
        let _ = pool.load();

        let tracker = Tracker::new(&rig.path);
        Self { rig, pool, tracker }
    }

    /// The tracker assignee identifier for a worker: `<rig>/<name>`.
    fn assignee_id(&self, name: &str) -> String {
        format!("{}/{}", self.rig.name, name)
    }

    fn exists(&self, name: &str) -> bool {
        self.rig.polecat_dir(name).is_dir()
    }

    /// Create a worker as a worktree from the mayor clone.
    ///
    /// An existing `polecat/<name>` branch (a revived worker) is reused;
    /// otherwise the branch is created from the mayor's current HEAD.
    pub fn add(&mut self, name: &str) -> anyhow::Result<Polecat> {
        if self.exists(name) {
            return Err(ManagerError::Exists(name.to_string()).into());
        }

        let workspace = self.rig.polecat_dir(name);
        let branch = Rig::polecat_branch(name);

        std::fs::create_dir_all(self.rig.polecats_dir()).context("creating polecats dir")?;

        let mayor_path = self.rig.mayor_clone();
        if !mayor_path.is_dir() {
            anyhow::bail!(
                "mayor clone not found at {} (set up the rig structure first)",
                mayor_path.display()
            );
        }
        let mayor_git = Git::new(&mayor_path);

        if mayor_git.branch_exists(&branch)? {
            mayor_git
                .worktree_add_existing(&workspace, &branch)
                .context("creating worktree on existing branch")?;
        } else {
            mayor_git
                .worktree_add(&workspace, &branch)
                .context("creating worktree")?;
        }

        // Shared tracker: all workers in a rig read one database
        if let Err(e) = self.write_tracker_redirect(&workspace) {
            eprintln!("Warning: could not set up shared tracker redirect: {e}");
        }

        self.pool.mark_in_use(name);
        let _ = self.pool.save();

        Ok(Polecat {
            name: name.to_string(),
            rig: self.rig.name.clone(),
            state: WorkerState::Idle,
            workspace,
            branch,
            issue: String::new(),
            created_at: Utc::now(),
        })
    }

    /// Remove a worker worktree and release its name to the pool.
    ///
    /// `force` bypasses only the uncommitted-changes check; stashes and
    /// unpushed commits still block. `nuclear` bypasses every check.
    /// (recreate is intentionally looser - see there.)
    pub fn remove(&mut self, name: &str, force: bool, nuclear: bool) -> anyhow::Result<()> {
        if !self.exists(name) {
            return Err(ManagerError::NotFound(name.to_string()).into());
        }

        let workspace = self.rig.polecat_dir(name);
        if !nuclear
            && let Ok(status) = Git::new(&workspace).uncommitted_work()
            && !status.clean()
        {
            let blocked = if force {
                status.stash_count > 0 || status.unpushed_commits > 0
            } else {
                true
            };
            if blocked {
                return Err(ManagerError::HasUncommittedWork {
                    name: name.to_string(),
                    status,
                }
                .into());
            }
        }

        let mayor_git = Git::new(&self.rig.mayor_clone());
        if mayor_git.worktree_remove(&workspace, force || nuclear).is_err() {
            // Old-style full clone, or a half-removed worktree
            std::fs::remove_dir_all(&workspace).context("removing polecat dir")?;
        }
        let _ = mayor_git.worktree_prune();

        self.pool.release(name);
        let _ = self.pool.save();

        Ok(())
    }

    /// Destroy and rebuild a worker against the latest trunk.
    ///
    /// The branch is deleted so the new worktree starts from the mayor's
    /// current HEAD; the name is kept (not released) since the worker
    /// continues to exist. `force` bypasses the whole uncommitted-work
    /// check - looser than remove's force, and deliberately so.
    pub fn recreate(&mut self, name: &str, force: bool) -> anyhow::Result<Polecat> {
        if !self.exists(name) {
            return Err(ManagerError::NotFound(name.to_string()).into());
        }

        let workspace = self.rig.polecat_dir(name);
        let branch = Rig::polecat_branch(name);
        let mayor_git = Git::new(&self.rig.mayor_clone());

        if !force
            && let Ok(status) = Git::new(&workspace).uncommitted_work()
            && !status.clean()
        {
            return Err(ManagerError::HasUncommittedWork {
                name: name.to_string(),
                status,
            }
            .into());
        }

        if mayor_git.worktree_remove(&workspace, true).is_err() {
            std::fs::remove_dir_all(&workspace).context("removing polecat dir")?;
        }
        let _ = mayor_git.worktree_prune();

        // Branch may fail to delete (e.g. protected); fall back to reuse
        let _ = mayor_git.delete_branch(&branch, true);

        if mayor_git.branch_exists(&branch)? {
            mayor_git
                .worktree_add_existing(&workspace, &branch)
                .context("recreating worktree on surviving branch")?;
        } else {
            mayor_git
                .worktree_add(&workspace, &branch)
                .context("recreating worktree")?;
        }

        if let Err(e) = self.write_tracker_redirect(&workspace) {
            eprintln!("Warning: could not set up shared tracker redirect: {e}");
        }

        Ok(Polecat {
            name: name.to_string(),
            rig: self.rig.name.clone(),
            state: WorkerState::Idle,
            workspace,
            branch,
            issue: String::new(),
            created_at: Utc::now(),
        })
    }

    /// Allocate a name from the pool, reconciling against the filesystem
    /// first so stale claims from crashes do not leak slots.
    pub fn allocate_name(&mut self) -> anyhow::Result<String> {
        self.reconcile_pool();
        let name = self.pool.allocate();
        self.pool.save().context("saving pool state")?;
        Ok(name)
    }

    /// Release a name back to the pool.
    pub fn release_name(&mut self, name: &str) {
        self.pool.release(name);
        let _ = self.pool.save();
    }

    /// Sync pool state with the worker directories that actually exist.
    pub fn reconcile_pool(&mut self) {
        let names: Vec<String> = self.worker_names();
        self.pool.reconcile(&names);
        let _ = self.pool.save();
    }

    /// (active count, active names) of the pool.
    pub fn pool_status(&self) -> (usize, Vec<String>) {
        (self.pool.active_count(), self.pool.active_names())
    }

    /// Switch the rig's name theme. In-use names missing from the new
    /// theme silently stop counting against the quota.
    pub fn set_theme(&mut self, theme: &str) -> anyhow::Result<()> {
        self.pool.set_theme(theme)?;
        self.pool.save()
    }

    fn worker_names(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.rig.polecats_dir()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    /// All workers in the rig, with derived state.
    pub fn list(&self) -> Vec<Polecat> {
        self.worker_names()
            .iter()
            .filter_map(|name| self.get(name).ok())
            .collect()
    }

    /// One worker, with state derived from the tracker.
    ///
    /// Tracker unreachable degrades to an Idle record rather than failing:
    /// workspace operations must keep working when the tracker is down.
    pub fn get(&self, name: &str) -> anyhow::Result<Polecat> {
        if !self.exists(name) {
            return Err(ManagerError::NotFound(name.to_string()).into());
        }

        let workspace = self.rig.polecat_dir(name);
        let branch = Rig::polecat_branch(name);
        let created_at = std::fs::metadata(&workspace)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let (state, issue) = match self.tracker.assigned_issue(&self.assignee_id(name)) {
            Ok(Some(issue)) => {
                let state = match issue.status.as_str() {
                    "open" | "in_progress" => WorkerState::Working,
                    "closed" => WorkerState::Done,
                    // Unknown status, assume working if assigned
                    _ => WorkerState::Working,
                };
                (state, issue.id)
            }
            Ok(None) => (WorkerState::Idle, String::new()),
            Err(_) => (WorkerState::Idle, String::new()),
        };

        Ok(Polecat {
            name: name.to_string(),
            rig: self.rig.name.clone(),
            state,
            workspace,
            branch,
            issue,
            created_at,
        })
    }

    /// Project a state change onto the tracker's assignee/status fields.
    /// A no-op when the tracker is unreachable or nothing is assigned.
    pub fn set_state(&self, name: &str, state: WorkerState) -> anyhow::Result<()> {
        if !self.exists(name) {
            return Err(ManagerError::NotFound(name.to_string()).into());
        }

        let Ok(issue) = self.tracker.assigned_issue(&self.assignee_id(name)) else {
            return Ok(());
        };
        let Some(issue) = issue else {
            return Ok(());
        };

        match state {
            WorkerState::Working => {
                self.tracker
                    .update(
                        &issue.id,
                        &UpdateOptions {
                            status: Some("in_progress".to_string()),
                            ..Default::default()
                        },
                    )
                    .context("setting issue status")?;
            }
            WorkerState::Done | WorkerState::Idle => {
                self.tracker
                    .update(
                        &issue.id,
                        &UpdateOptions {
                            assignee: Some(String::new()),
                            ..Default::default()
                        },
                    )
                    .context("clearing assignee")?;
            }
            WorkerState::Stuck => {
                // The assignment stays; blocked-ness shows on the issue
            }
        }
        Ok(())
    }

    /// Assign an issue to a worker and mark it in progress.
    pub fn assign_issue(&self, name: &str, issue_id: &str) -> anyhow::Result<()> {
        if !self.exists(name) {
            return Err(ManagerError::NotFound(name.to_string()).into());
        }
        self.tracker
            .update(
                issue_id,
                &UpdateOptions {
                    assignee: Some(self.assignee_id(name)),
                    status: Some("in_progress".to_string()),
                    ..Default::default()
                },
            )
            .context("setting issue assignee")
    }

    /// Clear the worker's issue assignment. A no-op when the tracker is
    /// unreachable or nothing is assigned.
    pub fn clear_issue(&self, name: &str) -> anyhow::Result<()> {
        if !self.exists(name) {
            return Err(ManagerError::NotFound(name.to_string()).into());
        }

        let Ok(Some(issue)) = self.tracker.assigned_issue(&self.assignee_id(name)) else {
            return Ok(());
        };
        self.tracker
            .update(
                &issue.id,
                &UpdateOptions {
                    assignee: Some(String::new()),
                    ..Default::default()
                },
            )
            .context("clearing issue assignee")
    }

    /// Legacy alias: idle/done -> working. Kept for compatibility.
    pub fn wake(&self, name: &str) -> anyhow::Result<()> {
        let polecat = self.get(name)?;
        match polecat.state {
            WorkerState::Idle | WorkerState::Done => self.set_state(name, WorkerState::Working),
            other => anyhow::bail!("polecat is not idle (state: {other})"),
        }
    }

    /// Legacy alias: working -> done. Kept for compatibility.
    pub fn sleep(&self, name: &str) -> anyhow::Result<()> {
        let polecat = self.get(name)?;
        match polecat.state {
            WorkerState::Working => self.set_state(name, WorkerState::Done),
            other => anyhow::bail!("polecat is not active (state: {other})"),
        }
    }

    /// Finish a worker's assignment from a working-family state.
    pub fn finish(&self, name: &str) -> anyhow::Result<()> {
        let polecat = self.get(name)?;
        match polecat.state {
            WorkerState::Working | WorkerState::Done | WorkerState::Stuck => {
                self.clear_issue(name)
            }
            other => anyhow::bail!("polecat is not in a finishing state (state: {other})"),
        }
    }

    /// Force a worker to idle regardless of current state.
    pub fn reset(&self, name: &str) -> anyhow::Result<()> {
        if !self.exists(name) {
            return Err(ManagerError::NotFound(name.to_string()).into());
        }
        self.clear_issue(name)
    }

    /// Write the shared-tracker redirect so the worker reads the rig's
    /// `.beads/` database instead of carrying its own.
    pub fn write_tracker_redirect(&self, workspace: &std::path::Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(self.rig.beads_dir()).context("creating rig .beads dir")?;

        let beads_dir = workspace.join(".beads");
        std::fs::create_dir_all(&beads_dir).context("creating worker .beads dir")?;
        std::fs::write(beads_dir.join("redirect"), "../../.beads\n")
            .context("writing redirect file")
    }
}
