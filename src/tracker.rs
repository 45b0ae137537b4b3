//! Wrapper over the external tracker binary (`bd`).
//!
//! The tracker owns issue state: assignments drive worker state (derived,
//! never stored on the worker), MR issues mirror queue entries, and the
//! rig-scoped merge slot serializes conflict repair. All calls shell out;
//! callers decide whether a tracker failure degrades or aborts.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::subprocess::Tool;

/// A typed, possibly-parented tracker issue.
#[derive(Debug, Clone, Deserialize)]
pub struct Issue {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, rename = "type")]
    pub issue_type: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub assignee: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parent: Option<String>,
}

impl Issue {
    pub fn is_open(&self) -> bool {
        self.status != "closed"
    }
}

/// Options for creating an issue.
#[derive(Debug, Default)]
pub struct CreateOptions {
    pub title: String,
    pub issue_type: String,
    pub priority: i64,
    pub description: String,
    pub actor: String,
    pub parent: Option<String>,
}

/// Field updates; None leaves the field untouched.
#[derive(Debug, Default)]
pub struct UpdateOptions {
    pub status: Option<String>,
    pub assignee: Option<String>,
    pub description: Option<String>,
}

/// Result of a merge-slot acquire attempt.
#[derive(Debug, Clone, Deserialize)]
pub struct SlotStatus {
    pub available: bool,
    #[serde(default)]
    pub holder: String,
}

/// Tracker handle rooted at a directory with a `.beads/` database (or a
/// redirect to one).
pub struct Tracker {
    work_dir: PathBuf,
}

impl Tracker {
    pub fn new(work_dir: &Path) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
        }
    }

    fn bd(&self, args: &[&str]) -> Tool {
        Tool::new("bd").args(args).current_dir(&self.work_dir)
    }

    /// Fetch one issue.
    pub fn show(&self, id: &str) -> anyhow::Result<Issue> {
        let output = self.bd(&["show", id, "--json"]).run_ok()?;
        output.parse_json().context("parsing issue")
    }

    /// Create an issue and return it.
    pub fn create(&self, opts: &CreateOptions) -> anyhow::Result<Issue> {
        let priority = opts.priority.to_string();
        let mut args = vec![
            "create",
            "--title",
            &opts.title,
            "--type",
            &opts.issue_type,
            "--priority",
            &priority,
            "--description",
            &opts.description,
        ];
        if !opts.actor.is_empty() {
            args.extend(["--actor", &opts.actor]);
        }
        if let Some(ref parent) = opts.parent {
            args.extend(["--parent", parent]);
        }
        args.push("--json");

        let output = self.bd(&args).run_ok()?;
        output.parse_json().context("parsing created issue")
    }

    /// Apply field updates to an issue.
    pub fn update(&self, id: &str, opts: &UpdateOptions) -> anyhow::Result<()> {
        let mut args: Vec<String> = vec!["update".to_string(), id.to_string()];
        if let Some(ref status) = opts.status {
            args.push(format!("--status={status}"));
        }
        if let Some(ref assignee) = opts.assignee {
            args.push(format!("--assignee={assignee}"));
        }
        if let Some(ref description) = opts.description {
            args.push("--description".to_string());
            args.push(description.clone());
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.bd(&arg_refs).run_ok()?;
        Ok(())
    }

    /// Close an issue with a reason.
    pub fn close(&self, id: &str, reason: &str) -> anyhow::Result<()> {
        self.bd(&["close", id, "--reason", reason]).run_ok()?;
        Ok(())
    }

    /// List issues filtered by status and/or assignee.
    pub fn list(&self, status: Option<&str>, assignee: Option<&str>) -> anyhow::Result<Vec<Issue>> {
        let mut args = vec!["list"];
        if let Some(status) = status {
            args.extend(["--status", status]);
        }
        if let Some(assignee) = assignee {
            args.extend(["--assignee", assignee]);
        }
        args.push("--json");

        let output = self.bd(&args).run_ok()?;
        output.parse_json().context("parsing issue list")
    }

    /// The issue currently assigned to an agent, if any.
    ///
    /// Open and in-progress issues win over closed ones so a freshly
    /// finished worker reads as Done, not Working.
    pub fn assigned_issue(&self, assignee: &str) -> anyhow::Result<Option<Issue>> {
        let issues = self.list(None, Some(assignee))?;
        let open = issues.iter().find(|i| i.is_open()).cloned();
        Ok(open.or_else(|| issues.into_iter().next()))
    }

    /// Set or clear the active_mr field on an agent bead.
    pub fn set_active_mr(&self, agent_bead: &str, mr_id: &str) -> anyhow::Result<()> {
        let field = format!("active_mr={mr_id}");
        self.bd(&["update", agent_bead, "--meta", &field]).run_ok()?;
        Ok(())
    }

    /// Ensure the rig's merge slot exists (idempotent). Returns its id.
    pub fn slot_ensure(&self) -> anyhow::Result<String> {
        let output = self.bd(&["slot", "ensure", "--json"]).run_ok()?;
        let value: serde_json::Value = output.parse_json()?;
        Ok(value["id"].as_str().unwrap_or_default().to_string())
    }

    /// Try to acquire the merge slot for a holder. Non-blocking.
    pub fn slot_acquire(&self, holder: &str) -> anyhow::Result<SlotStatus> {
        let output = self.bd(&["slot", "acquire", holder, "--json"]).run_ok()?;
        output.parse_json().context("parsing slot status")
    }

    /// Release the merge slot held by `holder`.
    pub fn slot_release(&self, holder: &str) -> anyhow::Result<()> {
        self.bd(&["slot", "release", holder]).run_ok()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_parses_with_missing_fields() {
        let issue: Issue =
            serde_json::from_str(r#"{"id": "bt-1", "title": "Fix it", "status": "open"}"#).unwrap();
        assert_eq!(issue.id, "bt-1");
        assert!(issue.is_open());
        assert_eq!(issue.issue_type, "");
        assert_eq!(issue.priority, 0);
        assert!(issue.parent.is_none());
    }

    #[test]
    fn closed_issue_is_not_open() {
        let issue: Issue =
            serde_json::from_str(r#"{"id": "bt-2", "status": "closed"}"#).unwrap();
        assert!(!issue.is_open());
    }

    #[test]
    fn slot_status_parses() {
        let status: SlotStatus =
            serde_json::from_str(r#"{"available": false, "holder": "gastown/refinery"}"#).unwrap();
        assert!(!status.available);
        assert_eq!(status.holder, "gastown/refinery");
    }
}
