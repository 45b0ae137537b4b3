//! Doctor: inspect and repair identity locks across the town.

use clap::Subcommand;

use crate::config::AgentRegistry;
use crate::lock;
use crate::subprocess::Tool;
use crate::town::{self, Rig};
use crate::wisp;

#[derive(Debug, Subcommand)]
pub enum DoctorCommand {
    /// List every identity lock and its holder status
    Locks,
    /// Remove stale locks (dead PIDs)
    Clean,
    /// Compare locks against active multiplexer sessions
    Collisions {
        /// Comma-separated session names (default: tmux list-sessions)
        #[arg(long)]
        sessions: Option<String>,
    },
    /// Validate and list the town's agent registry
    Agents,
    /// List active work hooks in a rig
    Hooks { rig: String },
}

/// Active tmux session names, empty when tmux is unavailable.
fn tmux_sessions() -> Vec<String> {
    let Ok(output) = Tool::new("tmux").args(&["list-sessions", "-F", "#{session_name}"]).run()
    else {
        return Vec::new();
    };
    if !output.success() {
        return Vec::new();
    }
    output
        .stdout
        .lines()
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

impl DoctorCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        let town_root = town::find_root_from_cwd()?;
        match self {
            DoctorCommand::Locks => {
                let locks = lock::find_all_locks(&town_root);
                if locks.is_empty() {
                    println!("No identity locks found");
                    return Ok(());
                }
                for (worker_dir, _) in locks {
                    let status = lock::IdentityLock::new(&worker_dir).status();
                    println!("  {}: {status}", worker_dir.display());
                }
                Ok(())
            }
            DoctorCommand::Clean => {
                let cleaned = lock::clean_stale_locks(&town_root);
                println!("Cleaned {cleaned} stale lock(s)");
                Ok(())
            }
            DoctorCommand::Collisions { sessions } => {
                let active: Vec<String> = match sessions {
                    Some(list) => list
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect(),
                    None => tmux_sessions(),
                };

                let collisions = lock::detect_collisions(&town_root, &active);
                if collisions.is_empty() {
                    println!("No collisions detected");
                    return Ok(());
                }
                for collision in collisions {
                    println!("  {collision}");
                }
                Ok(())
            }
            DoctorCommand::Agents => {
                let registry = AgentRegistry::load(&town_root)?;
                println!("Agent registry (version {}):", registry.version);
                for (name, preset) in &registry.agents {
                    println!("  {name}: {} {}", preset.command, preset.args.join(" "));
                }
                Ok(())
            }
            DoctorCommand::Hooks { rig } => {
                let rig = Rig::open(&town_root, rig)?;
                let hooks = wisp::list_hooks(&rig.path)?;
                if hooks.is_empty() {
                    println!("No active hooks in {}", rig.name);
                    return Ok(());
                }
                for agent in hooks {
                    let work = wisp::read_hook(&rig.path, &agent)?;
                    println!("  {agent}: {} (slung by {})", work.bead_id, work.created_by);
                }
                Ok(())
            }
        }
    }
}
