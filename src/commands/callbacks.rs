//! Callback processing: drain the mayor's inbox and fold worker replies
//! back into tracker and town state.
//!
//! Subject lines are a hard interface between agent prompts and this
//! router - classification is exact-regex, never normalized.

use std::path::Path;
use std::sync::LazyLock;

use clap::Args;
use regex::Regex;

use crate::mail::{Message, Priority, Router};
use crate::town;
use crate::townlog::{EVENT_CALLBACK, Logger};
use crate::tracker::Tracker;

static PATTERN_POLECAT_DONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^POLECAT_DONE\s+(\S+)").unwrap());
static PATTERN_MERGE_REJECTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Merge Request Rejected:\s+(.+)").unwrap());
static PATTERN_MERGE_COMPLETED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Merge Request Completed:\s+(.+)").unwrap());
static PATTERN_HELP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^HELP:\s+(.+)").unwrap());
static PATTERN_ESCALATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ESCALATION:\s+(.+)").unwrap());
static PATTERN_SLING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^SLING_REQUEST:\s+(\S+)").unwrap());
static PATTERN_WITNESS_REPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^WITNESS_REPORT:\s+(\S+)").unwrap());
static PATTERN_REFINERY_REPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^REFINERY_REPORT:\s+(\S+)").unwrap());

/// Classified callback kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    PolecatDone,
    MergeRejected,
    MergeCompleted,
    Help,
    Escalation,
    Sling,
    WitnessReport,
    RefineryReport,
    Unknown,
}

impl CallbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackKind::PolecatDone => "polecat_done",
            CallbackKind::MergeRejected => "merge_rejected",
            CallbackKind::MergeCompleted => "merge_completed",
            CallbackKind::Help => "help",
            CallbackKind::Escalation => "escalation",
            CallbackKind::Sling => "sling",
            CallbackKind::WitnessReport => "witness_report",
            CallbackKind::RefineryReport => "refinery_report",
            CallbackKind::Unknown => "unknown",
        }
    }
}

/// Classify a callback from its subject line.
pub fn classify(subject: &str) -> CallbackKind {
    if PATTERN_POLECAT_DONE.is_match(subject) {
        CallbackKind::PolecatDone
    } else if PATTERN_MERGE_REJECTED.is_match(subject) {
        CallbackKind::MergeRejected
    } else if PATTERN_MERGE_COMPLETED.is_match(subject) {
        CallbackKind::MergeCompleted
    } else if PATTERN_HELP.is_match(subject) {
        CallbackKind::Help
    } else if PATTERN_ESCALATION.is_match(subject) {
        CallbackKind::Escalation
    } else if PATTERN_SLING.is_match(subject) {
        CallbackKind::Sling
    } else if PATTERN_WITNESS_REPORT.is_match(subject) {
        CallbackKind::WitnessReport
    } else if PATTERN_REFINERY_REPORT.is_match(subject) {
        CallbackKind::RefineryReport
    } else {
        CallbackKind::Unknown
    }
}

/// Result of processing one callback message.
#[derive(Debug)]
pub struct CallbackResult {
    pub message_id: String,
    pub kind: CallbackKind,
    pub from: String,
    pub subject: String,
    pub handled: bool,
    pub action: String,
    pub error: Option<String>,
}

#[derive(Debug, Args)]
pub struct CallbacksArgs {
    /// Show what would be processed without taking action
    #[arg(long)]
    pub dry_run: bool,
    /// Show detailed processing info
    #[arg(short, long)]
    pub verbose: bool,
}

impl CallbacksArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let town_root = town::find_root_from_cwd()?;
        let results = process_inbox(&town_root, self.dry_run)?;

        if results.is_empty() {
            println!("○ No pending callbacks");
            return Ok(());
        }

        println!("● Processing {} callback(s)", results.len());
        for result in &results {
            if let Some(ref error) = result.error {
                println!("  ✗ {}: {error}", result.subject);
            } else if result.handled {
                println!("  ✓ [{}] {}", result.kind.as_str(), result.action);
            } else {
                println!("  ○ [{}] {}", result.kind.as_str(), result.action);
            }
            if self.verbose {
                println!("      From: {}", result.from);
                println!("      Subject: {}", result.subject);
            }
        }

        let handled = results.iter().filter(|r| r.handled).count();
        let errors = results.iter().filter(|r| r.error.is_some()).count();
        println!();
        if self.dry_run {
            println!("○ Dry run: would process {handled}/{} callbacks", results.len());
        } else if errors > 0 {
            println!("✓ Processed {handled}/{} callbacks ({errors} errors)", results.len());
        } else {
            println!("✓ Processed {handled}/{} callbacks", results.len());
        }
        Ok(())
    }
}

/// Process every unread message in the mayor's inbox. One bad message
/// never halts the batch.
pub fn process_inbox(town_root: &Path, dry_run: bool) -> anyhow::Result<Vec<CallbackResult>> {
    let router = Router::new(town_root);
    let mailbox = router.mailbox("mayor/");
    let messages = mailbox.list_unread()?;

    let mut results = Vec::new();
    for msg in messages {
        let result = process_callback(town_root, &msg, dry_run);

        // Handled messages leave the inbox; unknown ones stay unread
        if result.handled && !dry_run {
            let _ = mailbox.archive(&msg.id);
        }
        results.push(result);
    }
    Ok(results)
}

/// Handle a single callback message.
pub fn process_callback(town_root: &Path, msg: &Message, dry_run: bool) -> CallbackResult {
    let kind = classify(&msg.subject);
    let outcome = match kind {
        CallbackKind::PolecatDone => handle_polecat_done(town_root, msg, dry_run),
        CallbackKind::MergeCompleted => handle_merge_completed(town_root, msg, dry_run),
        CallbackKind::MergeRejected => handle_merge_rejected(town_root, msg, dry_run),
        CallbackKind::Help => handle_help(town_root, msg, dry_run),
        CallbackKind::Escalation => handle_escalation(town_root, msg, dry_run),
        CallbackKind::Sling => handle_sling(town_root, msg, dry_run),
        CallbackKind::WitnessReport => handle_witness_report(town_root, msg, dry_run),
        CallbackKind::RefineryReport => handle_refinery_report(town_root, msg, dry_run),
        CallbackKind::Unknown => Ok(("unknown message type, skipped".to_string(), false)),
    };

    match outcome {
        Ok((action, handled)) => CallbackResult {
            message_id: msg.id.clone(),
            kind,
            from: msg.from.clone(),
            subject: msg.subject.clone(),
            handled,
            action,
            error: None,
        },
        Err(e) => CallbackResult {
            message_id: msg.id.clone(),
            kind,
            from: msg.from.clone(),
            subject: msg.subject.clone(),
            handled: false,
            action: String::new(),
            error: Some(e.to_string()),
        },
    }
}

/// First capture group of a pattern against a subject.
fn capture(pattern: &Regex, subject: &str) -> String {
    pattern
        .captures(subject)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

/// Value of a `Key: value` line in a message body.
fn body_field(body: &str, key: &str) -> String {
    body.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix(key))
        .map(|rest| rest.trim().to_string())
        .unwrap_or_default()
}

fn body_count(body: &str, key: &str) -> i64 {
    body_field(body, key).parse().unwrap_or(0)
}

fn log_callback(town_root: &Path, context: &str) {
    let _ = Logger::new(town_root).log(EVENT_CALLBACK, "mayor/", context);
}

fn handle_polecat_done(
    town_root: &Path,
    msg: &Message,
    dry_run: bool,
) -> anyhow::Result<(String, bool)> {
    let name = capture(&PATTERN_POLECAT_DONE, &msg.subject);
    let exit_type = body_field(&msg.body, "Exit:");
    let issue = body_field(&msg.body, "Issue:");

    if dry_run {
        return Ok((
            format!("would log completion for {name} (exit={exit_type}, issue={issue})"),
            true,
        ));
    }

    log_callback(
        town_root,
        &format!("polecat_done: {} completed with {exit_type} (issue: {issue})", msg.from),
    );
    Ok((format!("logged completion for {name}"), true))
}

fn handle_merge_completed(
    town_root: &Path,
    msg: &Message,
    dry_run: bool,
) -> anyhow::Result<(String, bool)> {
    let branch = capture(&PATTERN_MERGE_COMPLETED, &msg.subject);
    let mr_id = body_field(&msg.body, "MR:");
    let source_issue = body_field(&msg.body, "Source:");
    let merge_commit = body_field(&msg.body, "Commit:");

    if dry_run {
        return Ok((
            format!("would close source issue {source_issue} (mr={mr_id}, commit={merge_commit})"),
            true,
        ));
    }

    log_callback(
        town_root,
        &format!(
            "merge_completed: branch {branch} merged (mr={mr_id}, source={source_issue}, commit={merge_commit})"
        ),
    );

    if !source_issue.is_empty() {
        let tracker = Tracker::new(town_root);
        let reason = format!("Merged in {merge_commit}");
        if let Err(e) = tracker.close(&source_issue, &reason) {
            // Issue may already be closed or gone; still a handled callback
            return Ok((
                format!("logged merge for {branch} (could not close {source_issue}: {e})"),
                true,
            ));
        }
    }

    Ok((format!("logged merge for {branch}, closed {source_issue}"), true))
}

fn handle_merge_rejected(
    town_root: &Path,
    msg: &Message,
    dry_run: bool,
) -> anyhow::Result<(String, bool)> {
    let branch = capture(&PATTERN_MERGE_REJECTED, &msg.subject);
    let reason = msg
        .body
        .split_once("Reason:")
        .map(|(_, rest)| rest.trim().lines().next().unwrap_or("").to_string())
        .unwrap_or_default();

    if dry_run {
        return Ok((format!("would log rejection for {branch} (reason: {reason})"), true));
    }

    log_callback(
        town_root,
        &format!("merge_rejected: branch {branch} rejected: {reason}"),
    );
    Ok((format!("logged rejection for {branch}"), true))
}

fn handle_help(town_root: &Path, msg: &Message, dry_run: bool) -> anyhow::Result<(String, bool)> {
    let topic = capture(&PATTERN_HELP, &msg.subject);

    if dry_run {
        return Ok((format!("would forward help request to overseer: {topic}"), true));
    }

    let router = Router::new(town_root);
    router.send(Message {
        id: String::new(),
        from: "mayor/".to_string(),
        to: "overseer".to_string(),
        subject: format!("[FWD] HELP: {topic}"),
        body: format!("Forwarded from: {}\n\n{}", msg.from, msg.body),
        priority: Priority::High,
        read: false,
    })?;

    log_callback(town_root, &format!("help_request: from {}: {topic}", msg.from));
    Ok((format!("forwarded help request to overseer: {topic}"), true))
}

fn handle_escalation(
    town_root: &Path,
    msg: &Message,
    dry_run: bool,
) -> anyhow::Result<(String, bool)> {
    let topic = capture(&PATTERN_ESCALATION, &msg.subject);

    if dry_run {
        return Ok((format!("would forward escalation to overseer: {topic}"), true));
    }

    let router = Router::new(town_root);
    router.send(Message {
        id: String::new(),
        from: "mayor/".to_string(),
        to: "overseer".to_string(),
        subject: format!("[ESCALATION] {topic}"),
        body: format!("Escalated by: {}\n\n{}", msg.from, msg.body),
        priority: Priority::Urgent,
        read: false,
    })?;

    log_callback(town_root, &format!("escalation: from {}: {topic}", msg.from));
    Ok((format!("forwarded escalation to overseer: {topic}"), true))
}

fn handle_sling(town_root: &Path, msg: &Message, dry_run: bool) -> anyhow::Result<(String, bool)> {
    let bead_id = capture(&PATTERN_SLING, &msg.subject);
    let target_rig = body_field(&msg.body, "Rig:");

    if target_rig.is_empty() {
        anyhow::bail!("no target rig specified in sling request");
    }
    if dry_run {
        return Ok((format!("would sling {bead_id} to {target_rig}"), true));
    }

    // The operator executes the actual sling; this just records the ask
    log_callback(
        town_root,
        &format!("sling_request: bead {bead_id} to rig {target_rig}"),
    );
    Ok((
        format!("logged sling request: {bead_id} to {target_rig} (execute with: boomtown sling {bead_id} {target_rig})"),
        true,
    ))
}

fn handle_witness_report(
    town_root: &Path,
    msg: &Message,
    dry_run: bool,
) -> anyhow::Result<(String, bool)> {
    let rig = capture(&PATTERN_WITNESS_REPORT, &msg.subject);
    let healthy = body_count(&msg.body, "Healthy:");
    let unhealthy = body_count(&msg.body, "Unhealthy:");
    let stuck = body_count(&msg.body, "Stuck:");

    if dry_run {
        return Ok((
            format!("would log witness report for {rig} (healthy={healthy}, unhealthy={unhealthy})"),
            true,
        ));
    }

    log_callback(
        town_root,
        &format!("witness_report: rig {rig}: healthy={healthy}, unhealthy={unhealthy}, stuck={stuck}"),
    );
    Ok((format!("logged witness report for {rig}"), true))
}

fn handle_refinery_report(
    town_root: &Path,
    msg: &Message,
    dry_run: bool,
) -> anyhow::Result<(String, bool)> {
    let rig = capture(&PATTERN_REFINERY_REPORT, &msg.subject);
    let pending = body_count(&msg.body, "Pending:");
    let processed = body_count(&msg.body, "Processed:");
    let failed = body_count(&msg.body, "Failed:");

    if dry_run {
        return Ok((
            format!("would log refinery report for {rig} (pending={pending}, processed={processed})"),
            true,
        ));
    }

    log_callback(
        town_root,
        &format!("refinery_report: rig {rig}: pending={pending}, processed={processed}, failed={failed}"),
    );
    Ok((format!("logged refinery report for {rig}"), true))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(subject: &str, body: &str) -> Message {
        Message {
            id: String::new(),
            from: "gastown/furiosa".to_string(),
            to: "mayor/".to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            priority: Priority::Normal,
            read: false,
        }
    }

    #[test]
    fn classification_table() {
        let cases = [
            ("POLECAT_DONE furiosa", CallbackKind::PolecatDone),
            ("Merge Request Completed: polecat/nux", CallbackKind::MergeCompleted),
            ("Merge Request Rejected: polecat/nux", CallbackKind::MergeRejected),
            ("HELP: deploy keys missing", CallbackKind::Help),
            ("ESCALATION: polecat stuck 3 cycles", CallbackKind::Escalation),
            ("SLING_REQUEST: bt-77", CallbackKind::Sling),
            ("WITNESS_REPORT: gastown", CallbackKind::WitnessReport),
            ("REFINERY_REPORT: gastown", CallbackKind::RefineryReport),
            ("random chatter", CallbackKind::Unknown),
            // Patterns are anchored: no mid-string matches
            ("re: HELP: something", CallbackKind::Unknown),
            // POLECAT_DONE requires a name argument
            ("POLECAT_DONE", CallbackKind::Unknown),
        ];
        for (subject, expected) in cases {
            assert_eq!(classify(subject), expected, "subject: {subject}");
        }
    }

    #[test]
    fn help_is_forwarded_and_archived() {
        let tmp = tempfile::tempdir().unwrap();
        let router = Router::new(tmp.path());
        router
            .send(message("HELP: deploy keys missing", "Need the deploy key for origin."))
            .unwrap();

        let results = process_inbox(tmp.path(), false).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].handled);
        assert_eq!(results[0].kind, CallbackKind::Help);

        // Forwarded to overseer with priority high, carrying the sender
        let overseer = router.mailbox("overseer").list_unread().unwrap();
        assert_eq!(overseer.len(), 1);
        assert_eq!(overseer[0].subject, "[FWD] HELP: deploy keys missing");
        assert_eq!(overseer[0].priority, Priority::High);
        assert!(overseer[0].body.contains("Forwarded from: gastown/furiosa"));

        // Original archived out of the inbox
        assert!(router.mailbox("mayor/").list_unread().unwrap().is_empty());
    }

    #[test]
    fn dry_run_classifies_without_side_effects() {
        let tmp = tempfile::tempdir().unwrap();
        let router = Router::new(tmp.path());
        router
            .send(message("HELP: deploy keys missing", "body"))
            .unwrap();

        let results = process_inbox(tmp.path(), true).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].handled);
        assert!(results[0].action.starts_with("would forward"));

        // No forward, no archive, no log
        assert!(router.mailbox("overseer").list_unread().unwrap().is_empty());
        assert_eq!(router.mailbox("mayor/").list_unread().unwrap().len(), 1);
        assert!(!tmp.path().join(".runtime/town.log").exists());
    }

    #[test]
    fn escalation_is_urgent() {
        let tmp = tempfile::tempdir().unwrap();
        let router = Router::new(tmp.path());
        router
            .send(message("ESCALATION: refinery wedged", "three MRs stuck"))
            .unwrap();

        process_inbox(tmp.path(), false).unwrap();
        let overseer = router.mailbox("overseer").list_unread().unwrap();
        assert_eq!(overseer[0].priority, Priority::Urgent);
        assert_eq!(overseer[0].subject, "[ESCALATION] refinery wedged");
    }

    #[test]
    fn unknown_messages_stay_unread() {
        let tmp = tempfile::tempdir().unwrap();
        let router = Router::new(tmp.path());
        router.send(message("hello there", "just chatting")).unwrap();

        let results = process_inbox(tmp.path(), false).unwrap();
        assert!(!results[0].handled);
        assert_eq!(results[0].kind, CallbackKind::Unknown);
        assert_eq!(router.mailbox("mayor/").list_unread().unwrap().len(), 1);
    }

    #[test]
    fn witness_report_parses_counts() {
        let tmp = tempfile::tempdir().unwrap();
        let router = Router::new(tmp.path());
        router
            .send(message(
                "WITNESS_REPORT: gastown",
                "Healthy: 4\nUnhealthy: 1\nStuck: 2\n",
            ))
            .unwrap();

        let results = process_inbox(tmp.path(), false).unwrap();
        assert!(results[0].handled);

        let log = std::fs::read_to_string(tmp.path().join(".runtime/town.log")).unwrap();
        assert!(log.contains("healthy=4, unhealthy=1, stuck=2"));
    }

    #[test]
    fn sling_without_rig_is_an_error_result() {
        let tmp = tempfile::tempdir().unwrap();
        let router = Router::new(tmp.path());
        router.send(message("SLING_REQUEST: bt-9", "no rig line")).unwrap();

        let results = process_inbox(tmp.path(), false).unwrap();
        assert!(!results[0].handled);
        assert!(results[0].error.as_deref().unwrap().contains("no target rig"));
        // Errored messages stay in the inbox
        assert_eq!(router.mailbox("mayor/").list_unread().unwrap().len(), 1);
    }

    #[test]
    fn one_bad_message_does_not_halt_the_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let router = Router::new(tmp.path());
        router.send(message("SLING_REQUEST: bt-9", "no rig line")).unwrap();
        router.send(message("POLECAT_DONE nux", "Exit: clean\nIssue: bt-3\n")).unwrap();

        let results = process_inbox(tmp.path(), false).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results.iter().filter(|r| r.handled).count(), 1);
    }
}
