//! Role priming: classify the current directory into an agent role, claim
//! the identity, repair the tracker redirect, and emit the role's context
//! block plus any pending mail.

use std::path::{Path, PathBuf};

use minijinja::Environment;
use serde::Serialize;

use crate::keepalive;
use crate::lock::{IdentityLock, LockError};
use crate::mail::Router;
use crate::town;

const ROLE_CONTEXT_TEMPLATE: &str = include_str!("templates/role-context.md.jinja");

/// Detected agent role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Mayor,
    Deacon,
    Witness,
    Refinery,
    Polecat,
    Crew,
    Unknown,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Mayor => "mayor",
            Role::Deacon => "deacon",
            Role::Witness => "witness",
            Role::Refinery => "refinery",
            Role::Polecat => "polecat",
            Role::Crew => "crew",
            Role::Unknown => "unknown",
        }
    }
}

/// Where prime decided it is running.
#[derive(Debug, Clone)]
pub struct RoleContext {
    pub role: Role,
    pub rig: String,
    pub worker: String,
    pub town_root: PathBuf,
    pub work_dir: PathBuf,
}

impl RoleContext {
    /// The mailbox address this role reads.
    pub fn mail_address(&self) -> Option<String> {
        match self.role {
            Role::Mayor => Some("mayor/".to_string()),
            Role::Deacon => Some("deacon".to_string()),
            Role::Witness => Some(format!("{}/witness", self.rig)),
            Role::Refinery => Some(format!("{}/refinery", self.rig)),
            Role::Polecat | Role::Crew => Some(format!("{}/{}", self.rig, self.worker)),
            Role::Unknown => None,
        }
    }
}

/// Classify a directory against the town tree. Each role maps to a
/// deterministic relative-path predicate.
pub fn detect_role(cwd: &Path, town_root: &Path) -> RoleContext {
    let mut ctx = RoleContext {
        role: Role::Unknown,
        rig: String::new(),
        worker: String::new(),
        town_root: town_root.to_path_buf(),
        work_dir: cwd.to_path_buf(),
    };

    let Ok(rel) = cwd.strip_prefix(town_root) else {
        return ctx;
    };
    let parts: Vec<&str> = rel
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect();

    // Town root itself is the mayor's seat
    if parts.is_empty() {
        ctx.role = Role::Mayor;
        return ctx;
    }
    match parts[0] {
        "mayor" => {
            ctx.role = Role::Mayor;
            return ctx;
        }
        "deacon" => {
            ctx.role = Role::Deacon;
            return ctx;
        }
        _ => {}
    }

    ctx.rig = parts[0].to_string();
    match parts.get(1).copied() {
        Some("witness") => ctx.role = Role::Witness,
        Some("refinery") => ctx.role = Role::Refinery,
        Some("polecats") => {
            if let Some(name) = parts.get(2) {
                ctx.role = Role::Polecat;
                ctx.worker = name.to_string();
            }
        }
        Some("crew") => {
            if let Some(name) = parts.get(2) {
                ctx.role = Role::Crew;
                ctx.worker = name.to_string();
            }
        }
        _ => {}
    }
    ctx
}

#[derive(Serialize)]
struct TemplateData {
    role: String,
    rig: String,
    worker: String,
    town_root: String,
    work_dir: String,
}

/// Render the role context block.
pub fn render_context(ctx: &RoleContext) -> anyhow::Result<String> {
    let mut env = Environment::new();
    env.add_template("role-context", ROLE_CONTEXT_TEMPLATE)?;
    let template = env.get_template("role-context")?;
    let rendered = template.render(TemplateData {
        role: ctx.role.as_str().to_string(),
        rig: ctx.rig.clone(),
        worker: ctx.worker.clone(),
        town_root: ctx.town_root.display().to_string(),
        work_dir: ctx.work_dir.display().to_string(),
    })?;
    Ok(rendered)
}

/// The worker's workspace path for a polecat/crew context.
fn worker_dir(ctx: &RoleContext) -> PathBuf {
    let family = if ctx.role == Role::Crew { "crew" } else { "polecats" };
    ctx.town_root.join(&ctx.rig).join(family).join(&ctx.worker)
}

/// Claim the identity lock for worker roles. Infrastructure roles are
/// singletons managed by multiplexer session names and take no file lock.
fn acquire_identity_lock(ctx: &RoleContext) -> anyhow::Result<()> {
    if ctx.role != Role::Polecat && ctx.role != Role::Crew {
        return Ok(());
    }

    let dir = worker_dir(ctx);
    let lock = IdentityLock::new(&dir);
    let session_id = std::env::var("TMUX_PANE")
        .unwrap_or_else(|_| format!("{}/{}", ctx.rig, ctx.worker));

    if let Err(e) = lock.acquire(&session_id) {
        if let Some(LockError::Locked { pid, session_id, acquired_at }) =
            e.downcast_ref::<LockError>()
        {
            eprintln!();
            eprintln!("IDENTITY COLLISION DETECTED");
            eprintln!("Another agent already claims this worker identity.");
            eprintln!();
            eprintln!("Lock holder:");
            eprintln!("  PID: {pid}");
            eprintln!("  Session: {session_id}");
            eprintln!("  Acquired: {acquired_at}");
            eprintln!();
            eprintln!("To resolve:");
            eprintln!("  1. Find the other session and close it, OR");
            eprintln!("  2. Run: boomtown doctor clean (removes stale locks)");
            eprintln!("  3. If the lock is stale: rm {}/.runtime/agent.lock", dir.display());
            eprintln!();
            anyhow::bail!("cannot claim identity {}/{}: {e}", ctx.rig, ctx.worker);
        }
        return Err(e.context("acquiring identity lock"));
    }
    Ok(())
}

/// Restore the shared-tracker redirect for worker roles if git clean or
/// similar wiped it. Silent on success and on failure.
pub fn ensure_tracker_redirect(ctx: &RoleContext) {
    if ctx.role != Role::Polecat && ctx.role != Role::Crew {
        return;
    }

    let dir = worker_dir(ctx);
    let redirect_path = dir.join(".beads").join("redirect");
    if redirect_path.exists() {
        return;
    }

    let rig_root = ctx.town_root.join(&ctx.rig);
    // Prefer the mayor clone's database, then the rig root's
    let content = if rig_root.join("mayor/rig/.beads").is_dir() {
        "../../mayor/rig/.beads"
    } else if rig_root.join(".beads").is_dir() {
        "../../.beads"
    } else {
        return;
    };

    if std::fs::create_dir_all(dir.join(".beads")).is_err() {
        return;
    }
    let _ = std::fs::write(redirect_path, format!("{content}\n"));
}

/// Print unread mail for the role, if any.
fn inject_pending_mail(ctx: &RoleContext) {
    let Some(address) = ctx.mail_address() else {
        return;
    };
    let mailbox = Router::new(&ctx.town_root).mailbox(&address);
    let Ok(unread) = mailbox.list_unread() else {
        return;
    };
    if unread.is_empty() {
        return;
    }

    println!();
    println!("## Pending Mail ({} unread)", unread.len());
    for msg in unread.iter().take(10) {
        println!("  {} [{:?}] {}: {}", msg.id, msg.priority, msg.from, msg.subject);
    }
    if unread.len() > 10 {
        println!("  ... and {} more", unread.len() - 10);
    }
    println!();
    println!("Read with: boomtown mail read <id>");
}

/// Run `boomtown prime`.
pub fn run() -> anyhow::Result<()> {
    let cwd = std::env::current_dir()?;
    let town_root = town::find_root_from_cwd()?;
    let ctx = detect_role(&cwd, &town_root);

    // Worker roles refuse to proceed on a live identity collision
    acquire_identity_lock(&ctx)?;
    ensure_tracker_redirect(&ctx);
    keepalive::touch(&ctx.work_dir, "boomtown prime");

    print!("{}", render_context(&ctx)?);
    println!();
    inject_pending_mail(&ctx);
    Ok(())
}
