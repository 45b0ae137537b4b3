//! Mail CLI: send, inbox, read, archive.

use clap::Subcommand;

use crate::commands::prime;
use crate::mail::{Message, Priority, Router};
use crate::town;

#[derive(Debug, Subcommand)]
pub enum MailCommand {
    /// Send a message to an agent or role address
    Send {
        /// Recipient address (e.g. "gastown/furiosa", "mayor/", "overseer")
        to: String,
        #[arg(long)]
        subject: String,
        #[arg(long, default_value = "")]
        body: String,
        /// low, normal, high, or urgent
        #[arg(long, default_value = "normal")]
        priority: String,
        /// Sender address (default: detected from cwd)
        #[arg(long)]
        from: Option<String>,
    },
    /// List unread messages
    Inbox {
        /// Mailbox address (default: detected from cwd)
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Read a message (marks it read)
    Read {
        id: String,
        #[arg(long)]
        agent: Option<String>,
    },
    /// Archive a message
    Archive {
        id: String,
        #[arg(long)]
        agent: Option<String>,
    },
    /// Delete a message outright
    Delete {
        id: String,
        #[arg(long)]
        agent: Option<String>,
    },
}

fn parse_priority(s: &str) -> anyhow::Result<Priority> {
    match s {
        "low" => Ok(Priority::Low),
        "normal" => Ok(Priority::Normal),
        "high" => Ok(Priority::High),
        "urgent" => Ok(Priority::Urgent),
        other => anyhow::bail!("unknown priority {other:?} (low|normal|high|urgent)"),
    }
}

/// Resolve an address: the flag wins, otherwise the role detected from
/// the current directory.
fn resolve_address(agent: &Option<String>) -> anyhow::Result<String> {
    if let Some(agent) = agent {
        return Ok(agent.clone());
    }
    let cwd = std::env::current_dir()?;
    let town_root = town::find_root_from_cwd()?;
    prime::detect_role(&cwd, &town_root)
        .mail_address()
        .ok_or_else(|| anyhow::anyhow!("could not detect an agent address here; pass --agent"))
}

impl MailCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        let town_root = town::find_root_from_cwd()?;
        let router = Router::new(&town_root);

        match self {
            MailCommand::Send { to, subject, body, priority, from } => {
                let from = match from {
                    Some(from) => from.clone(),
                    None => resolve_address(&None).unwrap_or_else(|_| "overseer".to_string()),
                };
                let id = router.send(Message {
                    id: String::new(),
                    from,
                    to: to.clone(),
                    subject: subject.clone(),
                    body: body.clone(),
                    priority: parse_priority(priority)?,
                    read: false,
                })?;
                println!("Sent {id} to {to}");
                Ok(())
            }
            MailCommand::Inbox { agent, json } => {
                let address = resolve_address(agent)?;
                let unread = router.mailbox(&address).list_unread()?;
                if *json {
                    println!("{}", serde_json::to_string_pretty(&unread)?);
                    return Ok(());
                }
                if unread.is_empty() {
                    println!("No unread mail for {address}");
                    return Ok(());
                }
                println!("Inbox for {address} ({} unread):", unread.len());
                for msg in unread {
                    println!("  {} [{:?}] {}: {}", msg.id, msg.priority, msg.from, msg.subject);
                }
                Ok(())
            }
            MailCommand::Read { id, agent } => {
                let address = resolve_address(agent)?;
                let msg = router.mailbox(&address).read(id)?;
                println!("From: {}", msg.from);
                println!("To: {}", msg.to);
                println!("Subject: {}", msg.subject);
                println!("Priority: {:?}", msg.priority);
                println!();
                println!("{}", msg.body);
                Ok(())
            }
            MailCommand::Archive { id, agent } => {
                let address = resolve_address(agent)?;
                router.mailbox(&address).archive(id)?;
                println!("Archived {id}");
                Ok(())
            }
            MailCommand::Delete { id, agent } => {
                let address = resolve_address(agent)?;
                router.mailbox(&address).delete(id)?;
                println!("Deleted {id}");
                Ok(())
            }
        }
    }
}
