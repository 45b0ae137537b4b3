//! Sling work onto a worker's hook (and take it off again).
//!
//! `sling` writes the wisp and pins the bead; `pickup` reads and burns
//! the current agent's hook; `unsling` clears a hook and reopens the
//! bead.

use clap::Args;

use crate::commands::prime::{self, Role};
use crate::town::{self, Rig};
use crate::tracker::{Tracker, UpdateOptions};
use crate::wisp::{self, SlungWork};

#[derive(Debug, Args)]
pub struct SlingArgs {
    /// Bead to sling
    pub bead_id: String,
    /// Target agent as <rig>/<worker>
    pub target: String,
    /// Extra context for the worker
    #[arg(long, default_value = "")]
    pub context: String,
    /// Subject line for the handoff
    #[arg(long, default_value = "")]
    pub subject: String,
}

#[derive(Debug, Args)]
pub struct UnslingArgs {
    /// Only unsling if this bead is hooked
    pub bead_id: Option<String>,
    /// Target agent as <rig>/<worker> (default: self)
    pub target: Option<String>,
    /// Show what would be done
    #[arg(short = 'n', long)]
    pub dry_run: bool,
    /// Unsling even if the work is incomplete
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct PickupArgs {
    /// Agent as <rig>/<worker> (default: self)
    #[arg(long)]
    pub agent: Option<String>,
}

fn split_target(target: &str) -> anyhow::Result<(String, String)> {
    target
        .split_once('/')
        .map(|(rig, worker)| (rig.to_string(), worker.to_string()))
        .filter(|(rig, worker)| !rig.is_empty() && !worker.is_empty())
        .ok_or_else(|| anyhow::anyhow!("target must be <rig>/<worker>, got {target:?}"))
}

/// Whether a bare argument names an agent rather than a bead.
fn is_agent_target(s: &str) -> bool {
    s.contains('/')
        || matches!(s, "mayor" | "deacon" | "witness" | "refinery" | "crew" | "overseer")
}

/// Current rig/worker from the cwd, for self-targeted commands.
fn detect_self() -> anyhow::Result<(String, String)> {
    let cwd = std::env::current_dir()?;
    let town_root = town::find_root_from_cwd()?;
    let ctx = prime::detect_role(&cwd, &town_root);
    match ctx.role {
        Role::Polecat | Role::Crew => Ok((ctx.rig, ctx.worker)),
        _ => anyhow::bail!("not in a worker directory; pass an explicit <rig>/<worker> target"),
    }
}

fn sender_identity() -> String {
    if let Ok(agent) = std::env::var("BOOMTOWN_AGENT") {
        return agent;
    }
    let Ok(cwd) = std::env::current_dir() else {
        return "overseer".to_string();
    };
    match town::find_root(&cwd) {
        Some(root) => {
            let ctx = prime::detect_role(&cwd, &root);
            ctx.mail_address().unwrap_or_else(|| "overseer".to_string())
        }
        None => "overseer".to_string(),
    }
}

impl SlingArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let town_root = town::find_root_from_cwd()?;
        let (rig_name, worker) = split_target(&self.target)?;
        let rig = Rig::open(&town_root, &rig_name)?;

        // The hook is a single write-once slot per agent
        if wisp::has_hook(&rig.path, &worker) {
            let hooked = wisp::read_hook(&rig.path, &worker)?;
            anyhow::bail!(
                "{} already has {} hooked; unsling it first",
                self.target,
                hooked.bead_id
            );
        }

        let mut work = SlungWork::new(&self.bead_id, &sender_identity());
        work.context = self.context.clone();
        work.subject = self.subject.clone();
        wisp::write_slung_work(&rig.path, &worker, &work)?;

        // Pin the bead so triage stops offering it elsewhere
        Tracker::new(&rig.path).update(
            &self.bead_id,
            &UpdateOptions {
                status: Some("pinned".to_string()),
                assignee: Some(format!("{rig_name}/{worker}")),
                ..Default::default()
            },
        )?;

        println!("Slung {} onto {}'s hook", self.bead_id, self.target);
        Ok(())
    }
}

impl PickupArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let town_root = town::find_root_from_cwd()?;
        let (rig_name, worker) = match &self.agent {
            Some(target) => split_target(target)?,
            None => detect_self()?,
        };
        let rig = Rig::open(&town_root, &rig_name)?;

        let work = wisp::read_hook(&rig.path, &worker)?;
        println!("Hooked work: {}", work.bead_id);
        if !work.subject.is_empty() {
            println!("Subject: {}", work.subject);
        }
        if !work.context.is_empty() {
            println!("Context: {}", work.context);
        }
        println!("Slung by: {} at {}", work.created_by, work.created_at);

        // Burn on pickup: the hook is a single-shot slot
        wisp::burn_hook(&rig.path, &worker)?;
        Ok(())
    }
}

impl UnslingArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let town_root = town::find_root_from_cwd()?;

        // A single <rig>/<worker> argument is a target, not a bead id
        let (bead_filter, target) = match (&self.bead_id, &self.target) {
            (Some(first), None) if is_agent_target(first) => (None, Some(first.clone())),
            (bead, target) => (bead.clone(), target.clone()),
        };

        let (rig_name, worker) = match &target {
            Some(target) => split_target(target)?,
            None => detect_self()?,
        };
        let rig = Rig::open(&town_root, &rig_name)?;

        let work = match wisp::read_hook(&rig.path, &worker) {
            Ok(work) => work,
            Err(e) if e.downcast_ref::<wisp::WispError>().is_some_and(|e| matches!(e, wisp::WispError::NoHook)) => {
                println!("Nothing on {worker}'s hook");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if let Some(ref bead_id) = bead_filter
            && &work.bead_id != bead_id
        {
            anyhow::bail!(
                "bead {bead_id} is not hooked (current hook: {})",
                work.bead_id
            );
        }

        let tracker = Tracker::new(&rig.path);
        // Incomplete work needs --force; a dead tracker counts as incomplete
        let complete = tracker
            .show(&work.bead_id)
            .map(|issue| !issue.is_open())
            .unwrap_or(false);
        if !complete && !self.force {
            anyhow::bail!(
                "hooked work {} is incomplete\n  Use --force to unsling anyway",
                work.bead_id
            );
        }

        if self.dry_run {
            println!("Would burn hook for {worker} and reopen {}", work.bead_id);
            return Ok(());
        }

        wisp::burn_hook(&rig.path, &worker)?;
        tracker.update(
            &work.bead_id,
            &UpdateOptions {
                status: Some("open".to_string()),
                ..Default::default()
            },
        )?;

        println!("Work removed from hook");
        println!("  Bead {} is now status=open", work.bead_id);
        Ok(())
    }
}
