//! Worker lifecycle CLI.

use clap::Subcommand;

use crate::manager::{Manager, ManagerError};
use crate::town::{self, Rig};

#[derive(Debug, Subcommand)]
pub enum PolecatCommand {
    /// Create a worker (allocates a pool name when none is given)
    Add {
        rig: String,
        name: Option<String>,
    },
    /// Remove a worker and release its name
    Remove {
        rig: String,
        name: String,
        /// Allow uncommitted changes (stashes and unpushed commits still block)
        #[arg(short, long)]
        force: bool,
        /// Bypass every safety check
        #[arg(long)]
        nuclear: bool,
    },
    /// Destroy and rebuild a worker against the latest trunk
    Recreate {
        rig: String,
        name: String,
        /// Bypass the uncommitted-work check entirely
        #[arg(short, long)]
        force: bool,
    },
    /// List workers with derived state
    List {
        rig: String,
        #[arg(long)]
        json: bool,
    },
    /// Assign an issue to a worker
    Assign {
        rig: String,
        name: String,
        issue: String,
    },
    /// Finish a worker's assignment
    Finish { rig: String, name: String },
    /// Force a worker back to idle
    Reset { rig: String, name: String },
    /// Show name pool status
    Pool { rig: String },
    /// List built-in name themes
    Themes,
    /// Switch the rig's name theme
    SetTheme { rig: String, theme: String },
}

fn open_manager(rig_name: &str) -> anyhow::Result<Manager> {
    let town_root = town::find_root_from_cwd()?;
    Ok(Manager::new(Rig::open(&town_root, rig_name)?))
}

/// Turn a typed uncommitted-work error into operator remediation.
fn explain(e: anyhow::Error, name: &str) -> anyhow::Error {
    if let Some(ManagerError::HasUncommittedWork { status, .. }) =
        e.downcast_ref::<ManagerError>()
    {
        eprintln!("Worker {name} has work that would be lost: {status}");
        eprintln!("  Commit and push it, or re-run with --nuclear to discard everything.");
    }
    e
}

impl PolecatCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        match self {
            PolecatCommand::Add { rig, name } => {
                let mut manager = open_manager(rig)?;
                let name = match name {
                    Some(name) => name.clone(),
                    None => manager.allocate_name()?,
                };
                let polecat = manager.add(&name)?;
                println!("Created {}/{} at {}", rig, polecat.name, polecat.workspace.display());
                println!("  branch: {}", polecat.branch);
                Ok(())
            }
            PolecatCommand::Remove { rig, name, force, nuclear } => {
                let mut manager = open_manager(rig)?;
                manager
                    .remove(name, *force, *nuclear)
                    .map_err(|e| explain(e, name))?;
                println!("Removed {rig}/{name}");
                Ok(())
            }
            PolecatCommand::Recreate { rig, name, force } => {
                let mut manager = open_manager(rig)?;
                let polecat = manager
                    .recreate(name, *force)
                    .map_err(|e| explain(e, name))?;
                println!("Recreated {rig}/{} from latest trunk", polecat.name);
                Ok(())
            }
            PolecatCommand::List { rig, json } => {
                let manager = open_manager(rig)?;
                let polecats = manager.list();
                if *json {
                    println!("{}", serde_json::to_string_pretty(&polecats)?);
                    return Ok(());
                }
                if polecats.is_empty() {
                    println!("No workers in {rig}");
                    return Ok(());
                }
                for p in polecats {
                    let issue = if p.issue.is_empty() {
                        String::new()
                    } else {
                        format!(" ({})", p.issue)
                    };
                    println!("  {} [{}]{issue}", p.name, p.state);
                }
                Ok(())
            }
            PolecatCommand::Assign { rig, name, issue } => {
                open_manager(rig)?.assign_issue(name, issue)?;
                println!("Assigned {issue} to {rig}/{name}");
                Ok(())
            }
            PolecatCommand::Finish { rig, name } => {
                open_manager(rig)?.finish(name)?;
                println!("Finished {rig}/{name}");
                Ok(())
            }
            PolecatCommand::Reset { rig, name } => {
                open_manager(rig)?.reset(name)?;
                println!("Reset {rig}/{name} to idle");
                Ok(())
            }
            PolecatCommand::Pool { rig } => {
                let manager = open_manager(rig)?;
                let (active, names) = manager.pool_status();
                println!("Pool for {rig}: {active} name(s) in use");
                for name in names {
                    println!("  {name}");
                }
                Ok(())
            }
            PolecatCommand::Themes => {
                for theme in crate::namepool::list_themes() {
                    let names = crate::namepool::theme_names(theme)?;
                    println!("  {theme} ({} names): {}, ...", names.len(), names[..5].join(", "));
                }
                Ok(())
            }
            PolecatCommand::SetTheme { rig, theme } => {
                let mut manager = open_manager(rig)?;
                manager.set_theme(theme)?;
                println!("Theme for {rig} is now {theme}");
                Ok(())
            }
        }
    }
}
