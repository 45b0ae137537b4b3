//! Merge queue CLI: submit and inspect.

use clap::Subcommand;

use crate::mrqueue::{MergeRequest, Queue};
use crate::refinery::Engineer;
use crate::town::{self, Rig};

#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    /// Submit a merge request for a worker branch
    Submit {
        rig: String,
        /// Source branch (e.g. polecat/furiosa)
        #[arg(long)]
        branch: String,
        /// Worker name
        #[arg(long)]
        worker: String,
        /// Target branch (default: rig default branch)
        #[arg(long)]
        target: Option<String>,
        /// Source issue this branch closes
        #[arg(long)]
        issue: Option<String>,
        /// Agent bead for traceability
        #[arg(long)]
        agent_bead: Option<String>,
        /// Priority (lower is more urgent)
        #[arg(long, default_value_t = 2)]
        priority: i64,
    },
    /// List ready (or blocked) merge requests
    List {
        rig: String,
        #[arg(long)]
        blocked: bool,
        #[arg(long)]
        json: bool,
    },
    /// Abandon a merge request (removes it from the queue)
    Remove { rig: String, id: String },
}

impl QueueCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        let town_root = town::find_root_from_cwd()?;
        match self {
            QueueCommand::Submit { rig, branch, worker, target, issue, agent_bead, priority } => {
                let rig = Rig::open(&town_root, rig)?;
                let target = target.clone().unwrap_or_else(|| rig.default_branch.clone());

                let mut mr = MergeRequest::new(branch, &target, worker);
                mr.priority = *priority;
                if let Some(issue) = issue {
                    mr.source_issue_id = issue.clone();
                }
                if let Some(agent_bead) = agent_bead {
                    mr.agent_bead_id = agent_bead.clone();
                }

                Queue::new(&rig.path).enqueue(&mr)?;
                println!("Queued {}: {branch} -> {target} (P{priority})", mr.id);
                Ok(())
            }
            QueueCommand::List { rig, blocked, json } => {
                let rig = Rig::open(&town_root, rig)?;
                let engineer = Engineer::new(&town_root, rig)?;
                let mrs = if *blocked {
                    engineer.list_blocked()?
                } else {
                    engineer.list_ready()?
                };

                if *json {
                    println!("{}", serde_json::to_string_pretty(&mrs)?);
                    return Ok(());
                }
                if mrs.is_empty() {
                    println!("No {} merge requests", if *blocked { "blocked" } else { "ready" });
                    return Ok(());
                }
                for mr in mrs {
                    let blocked_note = if mr.blocked_by_task_id.is_empty() {
                        String::new()
                    } else {
                        format!(" blocked-by {}", mr.blocked_by_task_id)
                    };
                    println!(
                        "  {} P{} retries={} {} -> {}{blocked_note}",
                        mr.id, mr.priority, mr.retry_count, mr.source_branch, mr.target_branch
                    );
                }
                Ok(())
            }
            QueueCommand::Remove { rig, id } => {
                let rig = Rig::open(&town_root, rig)?;
                Queue::new(&rig.path).remove(id)?;
                println!("Removed {id} from the queue");
                Ok(())
            }
        }
    }
}
