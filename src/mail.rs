//! File-based inter-agent mail.
//!
//! One directory per address under `<town>/.mail/`, one JSON file per
//! message, atomic rename on send. Delivery order within a mailbox is
//! priority first, then arrival (ties broken by id). Mailboxes are
//! single-reader single-writer per address by convention.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Root directory of the mail tree, town-relative.
pub const MAIL_DIR: &str = ".mail";

/// Message priority ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// One mail message, as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read: bool,
}

static SEND_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_message_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let seq = SEND_SEQ.fetch_add(1, Ordering::Relaxed) % 10_000;
    format!("m-{millis}-{}-{seq:04}", std::process::id())
}

/// Routes messages into per-address mailbox directories.
pub struct Router {
    town_root: PathBuf,
}

impl Router {
    pub fn new(town_root: &Path) -> Self {
        Self {
            town_root: town_root.to_path_buf(),
        }
    }

    /// Mailbox directory for an address. Role addresses may carry a
    /// trailing slash ("mayor/"); it is not significant.
    fn mailbox_dir(&self, address: &str) -> PathBuf {
        let mut dir = self.town_root.join(MAIL_DIR);
        for part in address.split('/').filter(|p| !p.is_empty()) {
            dir = dir.join(part);
        }
        dir
    }

    /// The mailbox for an address.
    pub fn mailbox(&self, address: &str) -> Mailbox {
        Mailbox {
            dir: self.mailbox_dir(address),
            address: address.to_string(),
        }
    }

    /// Deliver a message to its recipient's mailbox. Assigns an id when
    /// the message has none; the write is atomic (temp + rename).
    pub fn send(&self, mut msg: Message) -> anyhow::Result<String> {
        if msg.to.is_empty() {
            anyhow::bail!("message has no recipient");
        }
        if msg.id.is_empty() {
            msg.id = next_message_id();
        }

        let dir = self.mailbox_dir(&msg.to);
        std::fs::create_dir_all(&dir).context("creating mailbox dir")?;

        let path = dir.join(format!("{}.json", msg.id));
        let tmp = dir.join(format!("{}.json.tmp", msg.id));
        let data = serde_json::to_string_pretty(&msg)?;
        std::fs::write(&tmp, data).context("writing message")?;
        std::fs::rename(&tmp, &path).context("delivering message")?;

        Ok(msg.id)
    }
}

/// One address's inbox.
pub struct Mailbox {
    dir: PathBuf,
    address: String,
}

impl Mailbox {
    pub fn address(&self) -> &str {
        &self.address
    }

    fn message_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn list_all(&self) -> anyhow::Result<Vec<Message>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(anyhow::Error::new(e).context("listing mailbox")),
        };

        let mut messages = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let Ok(data) = std::fs::read_to_string(&path) else {
                continue;
            };
            // Skip unparsable files rather than wedging the whole inbox
            if let Ok(msg) = serde_json::from_str::<Message>(&data) {
                messages.push(msg);
            }
        }

        // Priority first, then arrival (ids are arrival-ordered)
        messages.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Ok(messages)
    }

    /// Unread messages in delivery order.
    pub fn list_unread(&self) -> anyhow::Result<Vec<Message>> {
        Ok(self.list_all()?.into_iter().filter(|m| !m.read).collect())
    }

    /// Read a message and mark it read.
    pub fn read(&self, id: &str) -> anyhow::Result<Message> {
        let path = self.message_path(id);
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("no message {id} in {}", self.address))?;
        let mut msg: Message =
            serde_json::from_str(&data).with_context(|| format!("parsing message {id}"))?;

        if !msg.read {
            msg.read = true;
            std::fs::write(&path, serde_json::to_string_pretty(&msg)?)
                .context("marking message read")?;
        }
        Ok(msg)
    }

    /// Delete a message outright.
    pub fn delete(&self, id: &str) -> anyhow::Result<()> {
        std::fs::remove_file(self.message_path(id))
            .with_context(|| format!("no message {id} in {}", self.address))
    }

    /// Move a message into the mailbox's archive.
    pub fn archive(&self, id: &str) -> anyhow::Result<()> {
        let archive_dir = self.dir.join("archive");
        std::fs::create_dir_all(&archive_dir).context("creating archive dir")?;
        let from = self.message_path(id);
        let to = archive_dir.join(format!("{id}.json"));
        std::fs::rename(&from, &to)
            .with_context(|| format!("no message {id} in {}", self.address))
    }
}

/// Structured MERGE_FAILED notification to a rig's witness, so the worker
/// behind a failed merge gets told.
pub fn merge_failed_message(
    rig: &str,
    worker: &str,
    branch: &str,
    source_issue: &str,
    target: &str,
    failure_type: &str,
    error: &str,
) -> Message {
    Message {
        id: String::new(),
        from: format!("{rig}/refinery"),
        to: format!("{rig}/witness"),
        subject: format!("MERGE_FAILED: {branch}"),
        body: format!(
            "Worker: {worker}\nBranch: {branch}\nTarget: {target}\nSource: {source_issue}\nType: {failure_type}\nError: {error}\n"
        ),
        priority: Priority::High,
        read: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(to: &str, subject: &str, priority: Priority) -> Message {
        Message {
            id: String::new(),
            from: "test/sender".to_string(),
            to: to.to_string(),
            subject: subject.to_string(),
            body: String::new(),
            priority,
            read: false,
        }
    }

    #[test]
    fn send_and_list_unread() {
        let tmp = tempfile::tempdir().unwrap();
        let router = Router::new(tmp.path());

        router.send(msg("mayor/", "first", Priority::Normal)).unwrap();
        router.send(msg("mayor/", "second", Priority::Normal)).unwrap();

        let mailbox = router.mailbox("mayor/");
        let unread = mailbox.list_unread().unwrap();
        assert_eq!(unread.len(), 2);
        assert_eq!(unread[0].subject, "first");
        assert_eq!(unread[1].subject, "second");
    }

    #[test]
    fn priority_orders_before_arrival() {
        let tmp = tempfile::tempdir().unwrap();
        let router = Router::new(tmp.path());

        router.send(msg("overseer", "routine", Priority::Low)).unwrap();
        router.send(msg("overseer", "notice", Priority::Normal)).unwrap();
        router.send(msg("overseer", "alarm", Priority::Urgent)).unwrap();

        let unread = router.mailbox("overseer").list_unread().unwrap();
        let subjects: Vec<&str> = unread.iter().map(|m| m.subject.as_str()).collect();
        assert_eq!(subjects, vec!["alarm", "notice", "routine"]);
    }

    #[test]
    fn read_marks_message_read() {
        let tmp = tempfile::tempdir().unwrap();
        let router = Router::new(tmp.path());
        let id = router.send(msg("gastown/furiosa", "hi", Priority::Normal)).unwrap();

        let mailbox = router.mailbox("gastown/furiosa");
        let message = mailbox.read(&id).unwrap();
        assert!(message.read);
        assert!(mailbox.list_unread().unwrap().is_empty());
    }

    #[test]
    fn archive_removes_from_inbox() {
        let tmp = tempfile::tempdir().unwrap();
        let router = Router::new(tmp.path());
        let id = router.send(msg("mayor/", "done", Priority::Normal)).unwrap();

        let mailbox = router.mailbox("mayor/");
        mailbox.archive(&id).unwrap();
        assert!(mailbox.list_unread().unwrap().is_empty());
        assert!(
            tmp.path()
                .join(".mail/mayor/archive")
                .join(format!("{id}.json"))
                .exists()
        );
    }

    #[test]
    fn delete_missing_message_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        let router = Router::new(tmp.path());
        assert!(router.mailbox("mayor/").delete("m-nope").is_err());
    }

    #[test]
    fn role_and_rig_addresses_map_to_distinct_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let router = Router::new(tmp.path());
        router.send(msg("mayor/", "a", Priority::Normal)).unwrap();
        router.send(msg("gastown/nux", "b", Priority::Normal)).unwrap();

        assert!(tmp.path().join(".mail/mayor").is_dir());
        assert!(tmp.path().join(".mail/gastown/nux").is_dir());
    }

    #[test]
    fn merge_failed_message_shape() {
        let message = merge_failed_message(
            "gastown",
            "furiosa",
            "polecat/furiosa",
            "bt-12",
            "main",
            "conflict",
            "merge conflicts in: [src/lib.rs]",
        );
        assert_eq!(message.to, "gastown/witness");
        assert_eq!(message.from, "gastown/refinery");
        assert_eq!(message.subject, "MERGE_FAILED: polecat/furiosa");
        assert!(message.body.contains("Worker: furiosa"));
        assert!(message.body.contains("Type: conflict"));
        assert_eq!(message.priority, Priority::High);
    }
}
