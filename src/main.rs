mod commands;
mod config;
mod error;
mod git;
mod keepalive;
mod lock;
mod mail;
mod manager;
mod mrqueue;
mod namepool;
mod refinery;
mod subprocess;
mod telemetry;
mod town;
mod townlog;
mod tracker;
mod wisp;

use std::process::ExitCode;

use clap::{Parser, Subcommand};

use commands::callbacks::CallbacksArgs;
use commands::doctor::DoctorCommand;
use commands::mail::MailCommand;
use commands::polecat::PolecatCommand;
use commands::queue::QueueCommand;
use commands::refinery::RefineryCommand;
use commands::sling::{PickupArgs, SlingArgs, UnslingArgs};

#[derive(Debug, Parser)]
#[command(
    name = "boomtown",
    version,
    about = "Workspace, identity, and merge-queue substrate for multi-agent coding fleets"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage worker workspaces (worktrees over the mayor clone)
    Polecat {
        #[command(subcommand)]
        command: PolecatCommand,
    },
    /// Submit and inspect merge requests
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
    /// Run the merge engine
    Refinery {
        #[command(subcommand)]
        command: RefineryCommand,
    },
    /// Process the mayor's inbox callbacks
    Callbacks(CallbacksArgs),
    /// Send and read inter-agent mail
    Mail {
        #[command(subcommand)]
        command: MailCommand,
    },
    /// Attach work to a worker's hook
    Sling(SlingArgs),
    /// Remove work from a hook
    Unsling(UnslingArgs),
    /// Pick up (and burn) hooked work
    Pickup(PickupArgs),
    /// Detect role from cwd and output agent context
    Prime,
    /// Inspect and repair identity locks
    Doctor {
        #[command(subcommand)]
        command: DoctorCommand,
    },
    /// Print the JSON Schema for the merge_queue config section
    Schema,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Polecat { .. } => "polecat",
            Self::Queue { .. } => "queue",
            Self::Refinery { .. } => "refinery",
            Self::Callbacks(_) => "callbacks",
            Self::Mail { .. } => "mail",
            Self::Sling(_) => "sling",
            Self::Unsling(_) => "unsling",
            Self::Pickup(_) => "pickup",
            Self::Prime => "prime",
            Self::Doctor { .. } => "doctor",
            Self::Schema => "schema",
        }
    }
}

/// Best-effort liveness signal for worker roles, stamped on every command.
fn touch_keepalive(command: &str) {
    let Ok(cwd) = std::env::current_dir() else {
        return;
    };
    let Some(town_root) = town::find_root(&cwd) else {
        return;
    };
    let ctx = commands::prime::detect_role(&cwd, &town_root);
    if matches!(
        ctx.role,
        commands::prime::Role::Polecat | commands::prime::Role::Crew
    ) {
        keepalive::touch(&ctx.work_dir, &format!("boomtown {command}"));
    }
}

fn main() -> ExitCode {
    let _telemetry = telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();
    touch_keepalive(cli.command.name());

    let result = match cli.command {
        Commands::Polecat { command } => command.execute(),
        Commands::Queue { command } => command.execute(),
        Commands::Refinery { command } => command.execute(),
        Commands::Callbacks(args) => args.execute(),
        Commands::Mail { command } => command.execute(),
        Commands::Sling(args) => args.execute(),
        Commands::Unsling(args) => args.execute(),
        Commands::Pickup(args) => args.execute(),
        Commands::Prime => commands::prime::run(),
        Commands::Doctor { command } => command.execute(),
        Commands::Schema => commands::schema::run_schema(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<error::ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
