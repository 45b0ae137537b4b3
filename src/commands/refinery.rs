//! Merge engine CLI: run the loop, or process one tick.

use clap::Subcommand;

use crate::refinery::Engineer;
use crate::subprocess::CancelToken;
use crate::town::{self, Rig};

#[derive(Debug, Subcommand)]
pub enum RefineryCommand {
    /// Poll the queue on the configured interval until interrupted
    Run { rig: String },
    /// Drain the ready queue once
    Process { rig: String },
}

impl RefineryCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        let town_root = town::find_root_from_cwd()?;
        match self {
            RefineryCommand::Run { rig } => {
                let engineer = Engineer::new(&town_root, Rig::open(&town_root, rig)?)?;
                engineer.run(&CancelToken::new())
            }
            RefineryCommand::Process { rig } => {
                let engineer = Engineer::new(&town_root, Rig::open(&town_root, rig)?)?;
                engineer.tick(&CancelToken::new())
            }
        }
    }
}
