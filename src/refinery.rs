//! The merge engine: serialized integration of worker branches.
//!
//! One engine per rig drains the merge queue in priority order, one MR at
//! a time. Success closes the source issue and cleans the branch; a
//! conflict becomes a dispatchable repair task that gates the MR until the
//! task closes. The rig's merge slot keeps two MRs from being blocked on
//! two concurrent repair tasks.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::MergeQueueConfig;
use crate::git::Git;
use crate::mail::{Router, merge_failed_message};
use crate::mrqueue::{EventLogger, MergeRequest, Queue};
use crate::subprocess::{CancelToken, Tool};
use crate::town::Rig;
use crate::tracker::{CreateOptions, Tracker, UpdateOptions};
use crate::wisp::{self, PatrolCycle};

/// How long an engine's claim on an MR is respected before another engine
/// may pick it up after a crash.
const CLAIM_TTL_MINUTES: i64 = 30;

/// Outcome of processing one merge request.
#[derive(Debug, Default)]
pub struct ProcessResult {
    pub success: bool,
    pub merge_commit: String,
    pub error: String,
    pub conflict: bool,
    pub tests_failed: bool,
    pub canceled: bool,
}

impl ProcessResult {
    fn fail(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Default::default()
        }
    }

    fn conflict(error: impl Into<String>) -> Self {
        Self {
            conflict: true,
            error: error.into(),
            ..Default::default()
        }
    }
}

/// The merge queue processor for one rig.
pub struct Engineer {
    rig: Rig,
    tracker: Tracker,
    queue: Queue,
    git: Git,
    config: MergeQueueConfig,
    work_dir: PathBuf,
    events: EventLogger,
    router: Router,
}

impl Engineer {
    /// Create an engine for a rig. Merge-queue configuration comes from
    /// the rig's config.json; the target branch defaults to the rig's
    /// default branch.
    pub fn new(town_root: &std::path::Path, rig: Rig) -> anyhow::Result<Self> {
        let mut config = MergeQueueConfig::load(&rig.path.join("config.json"))?;
        if config.target_branch.is_empty() {
            config.target_branch = rig.default_branch.clone();
        }

        let work_dir = rig.refinery_clone();
        Ok(Self {
            tracker: Tracker::new(&rig.path),
            queue: Queue::new(&rig.path),
            git: Git::new(&work_dir),
            events: EventLogger::new(&rig.path),
            router: Router::new(town_root),
            config,
            work_dir,
            rig,
        })
    }

    pub fn config(&self) -> &MergeQueueConfig {
        &self.config
    }

    fn holder_id(&self) -> String {
        format!("{}/refinery", self.rig.name)
    }

    /// Whether a tracker issue is still open. Unreachable tracker reads as
    /// closed, so a blocked MR is not wedged forever by a dead tracker.
    pub fn is_issue_open(&self, id: &str) -> bool {
        match self.tracker.show(id) {
            Ok(issue) => issue.is_open(),
            Err(_) => false,
        }
    }

    /// Ready MRs in priority order.
    pub fn list_ready(&self) -> anyhow::Result<Vec<MergeRequest>> {
        self.queue.list_ready(|task| self.is_issue_open(task))
    }

    /// MRs gated behind open repair tasks.
    pub fn list_blocked(&self) -> anyhow::Result<Vec<MergeRequest>> {
        self.queue.list_blocked(|task| self.is_issue_open(task))
    }

    /// One scheduling tick: drain the ready queue serially.
    pub fn tick(&self, cancel: &CancelToken) -> anyhow::Result<()> {
        let ready = self.list_ready()?;
        if ready.is_empty() {
            return Ok(());
        }
        eprintln!("[refinery] {} MR(s) ready", ready.len());

        for mr in ready {
            if cancel.is_canceled() {
                break;
            }
            let _ = self
                .queue
                .claim(&mr.id, &self.holder_id(), chrono::Duration::minutes(CLAIM_TTL_MINUTES));

            let result = self.process_mr(&mr, cancel);
            if result.success {
                self.handle_success(&mr, &result);
            } else {
                self.handle_failure(&mr, &result);
            }
        }
        Ok(())
    }

    /// Poll loop: tick, sleep, repeat until canceled.
    pub fn run(&self, cancel: &CancelToken) -> anyhow::Result<()> {
        if !self.config.enabled {
            eprintln!("[refinery] merge queue disabled for {}", self.rig.name);
            return Ok(());
        }
        let interval = self.config.poll_interval()?;
        eprintln!(
            "[refinery] processing queue for {} every {}s",
            self.rig.name,
            interval.as_secs()
        );

        // Continuous-role loop state survives agent restarts via a patrol
        // wisp; a fresh cycle starts when none is readable
        let mut patrol = wisp::read_patrol_cycle(&self.rig.path, "refinery")
            .unwrap_or_else(|_| PatrolCycle::new("patrol-refinery", &self.holder_id()));

        while !cancel.is_canceled() {
            patrol.begin_step("drain-queue");
            match self.tick(cancel) {
                Ok(()) => patrol.complete_step("drain-queue", ""),
                Err(e) => {
                    eprintln!("[refinery] tick failed: {e}");
                    patrol.fail_step("drain-queue", &e.to_string());
                }
            }
            patrol.complete_cycle();
            if let Err(e) = wisp::write_patrol_cycle(&self.rig.path, "refinery", &patrol) {
                eprintln!("[refinery] warning: failed to write patrol wisp: {e}");
            }

            let mut slept = Duration::ZERO;
            while slept < interval && !cancel.is_canceled() {
                std::thread::sleep(Duration::from_secs(1));
                slept += Duration::from_secs(1);
            }
        }
        Ok(())
    }

    /// The merge pipeline for one MR.
    pub fn process_mr(&self, mr: &MergeRequest, cancel: &CancelToken) -> ProcessResult {
        let branch = &mr.source_branch;
        let target = if mr.target_branch.is_empty() {
            &self.config.target_branch
        } else {
            &mr.target_branch
        };

        eprintln!("[refinery] processing {}: {branch} -> {target}", mr.id);
        let _ = self.events.merge_started(mr);

        // Workers push into the shared object store; the engine never
        // fetches from a worker. A missing branch is fatal for this MR.
        match self.git.branch_exists(branch) {
            Ok(true) => {}
            Ok(false) => return ProcessResult::fail(format!("branch {branch} not found locally")),
            Err(e) => return ProcessResult::fail(format!("failed to check branch {branch}: {e}")),
        }

        if let Err(e) = self.git.checkout(target) {
            return ProcessResult::fail(format!("failed to checkout target {target}: {e}"));
        }
        if let Err(e) = self.git.pull("origin", target) {
            // Nothing to pull, or origin unreachable - merge with what we have
            eprintln!("[refinery] warning: pull from origin/{target}: {e} (continuing)");
        }

        match self.git.check_conflicts(branch, target) {
            Ok(conflicts) if conflicts.is_empty() => {}
            Ok(conflicts) => {
                return ProcessResult::conflict(format!("merge conflicts in: {conflicts:?}"));
            }
            Err(e) => return ProcessResult::conflict(format!("conflict check failed: {e}")),
        }

        if self.config.run_tests && !self.config.test_command.is_empty() {
            eprintln!("[refinery] running tests: {}", self.config.test_command);
            let result = self.run_tests(cancel);
            if !result.success {
                return result;
            }
            eprintln!("[refinery] tests passed");
        }

        let mut message = format!("Merge {branch} into {target}");
        if !mr.source_issue_id.is_empty() {
            message = format!("{message} ({})", mr.source_issue_id);
        }
        if let Err(e) = self.git.merge_no_ff(branch, &message) {
            // Unmerged paths in the index mean a real conflict; anything
            // else is a generic merge failure
            if let Ok(conflicts) = self.git.conflicting_files()
                && !conflicts.is_empty()
            {
                let _ = self.git.abort_merge();
                return ProcessResult::conflict("merge conflict during actual merge");
            }
            return ProcessResult::fail(format!("merge failed: {e}"));
        }

        let merge_commit = match self.git.rev("HEAD") {
            Ok(sha) => sha,
            Err(e) => return ProcessResult::fail(format!("failed to resolve merge commit: {e}")),
        };

        if let Err(e) = self.git.push("origin", target) {
            return ProcessResult::fail(format!("failed to push to origin: {e}"));
        }

        eprintln!("[refinery] merged: {}", &merge_commit[..8.min(merge_commit.len())]);
        ProcessResult {
            success: true,
            merge_commit,
            ..Default::default()
        }
    }

    /// Run the configured test command, retrying flaky failures.
    fn run_tests(&self, cancel: &CancelToken) -> ProcessResult {
        if self.config.test_command.is_empty() {
            return ProcessResult {
                success: true,
                ..Default::default()
            };
        }

        let attempts = self.config.retry_flaky_tests.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            if attempt > 1 {
                eprintln!("[refinery] retrying tests (attempt {attempt}/{attempts})...");
            }

            // The test command comes from the rig's own config, not from
            // the branch under merge; shell execution is intentional.
            let result = Tool::new("sh")
                .args(&["-c", &self.config.test_command])
                .current_dir(&self.work_dir)
                .cancel_token(cancel)
                .run();

            match result {
                Ok(output) if output.success() => {
                    return ProcessResult {
                        success: true,
                        ..Default::default()
                    };
                }
                Ok(output) => {
                    last_error = format!("exit {}: {}", output.exit_code, output.stderr.trim());
                }
                Err(e) => {
                    if cancel.is_canceled() {
                        return ProcessResult {
                            canceled: true,
                            error: "test run canceled".to_string(),
                            ..Default::default()
                        };
                    }
                    last_error = e.to_string();
                }
            }

            if cancel.is_canceled() {
                return ProcessResult {
                    canceled: true,
                    error: "test run canceled".to_string(),
                    ..Default::default()
                };
            }
        }

        ProcessResult {
            tests_failed: true,
            error: format!("tests failed after {attempts} attempt(s): {last_error}"),
            ..Default::default()
        }
    }

    /// Success path: close out tracker state, clean the branch, drop the
    /// MR from the queue, release the merge slot. Tracker failures are
    /// warnings - the merge already landed.
    pub fn handle_success(&self, mr: &MergeRequest, result: &ProcessResult) {
        let _ = self.events.merged(mr, &result.merge_commit);

        // The slot is held across a conflict-resolution round; the merge
        // that lands releases it
        match self.tracker.slot_release(&self.holder_id()) {
            Ok(()) => eprintln!("[refinery] released merge slot"),
            Err(e) => {
                let text = e.to_string();
                if !text.contains("not held") && !text.contains("not found") {
                    eprintln!("[refinery] warning: failed to release merge slot: {e}");
                }
            }
        }

        let description = format!(
            "merge_commit: {}\nclose_reason: merged",
            result.merge_commit
        );
        if let Err(e) = self.tracker.update(
            &mr.id,
            &UpdateOptions {
                description: Some(description),
                ..Default::default()
            },
        ) {
            eprintln!("[refinery] warning: failed to update MR {}: {e}", mr.id);
        }
        if let Err(e) = self.tracker.close(&mr.id, "merged") {
            eprintln!("[refinery] warning: failed to close MR {}: {e}", mr.id);
        }

        if !mr.source_issue_id.is_empty() {
            let reason = format!("Merged in {}", mr.id);
            match self.tracker.close(&mr.source_issue_id, &reason) {
                Ok(()) => eprintln!("[refinery] closed source issue: {}", mr.source_issue_id),
                Err(e) => eprintln!(
                    "[refinery] warning: failed to close source issue {}: {e}",
                    mr.source_issue_id
                ),
            }
        }

        // Traceability cleanup on the worker's agent bead
        if !mr.agent_bead_id.is_empty()
            && let Err(e) = self.tracker.set_active_mr(&mr.agent_bead_id, "")
        {
            eprintln!(
                "[refinery] warning: failed to clear active_mr on {}: {e}",
                mr.agent_bead_id
            );
        }

        if self.config.delete_merged_branches && !mr.source_branch.is_empty() {
            match self.git.delete_branch(&mr.source_branch, true) {
                Ok(()) => eprintln!("[refinery] deleted local branch: {}", mr.source_branch),
                Err(e) => eprintln!(
                    "[refinery] warning: failed to delete local branch {}: {e}",
                    mr.source_branch
                ),
            }
            match self.git.delete_remote_branch("origin", &mr.source_branch) {
                Ok(()) => eprintln!(
                    "[refinery] deleted remote branch: origin/{}",
                    mr.source_branch
                ),
                Err(e) => eprintln!(
                    "[refinery] warning: failed to delete remote branch {}: {e}",
                    mr.source_branch
                ),
            }
        }

        if let Err(e) = self.queue.remove(&mr.id) {
            eprintln!("[refinery] warning: failed to remove MR from queue: {e}");
        }

        eprintln!("[refinery] merged: {} ({})", mr.id, result.merge_commit);
    }

    /// Failure path. Conflicts become repair tasks gating the MR (behind
    /// the merge-slot gate); test failures go back to the worker; anything
    /// else leaves the MR queued for an unblocked retry.
    pub fn handle_failure(&self, mr: &MergeRequest, result: &ProcessResult) {
        let _ = self.events.merge_failed(mr, &result.error);

        let failure_type = if result.conflict {
            "conflict"
        } else if result.tests_failed {
            "tests"
        } else if result.canceled {
            "canceled"
        } else {
            "build"
        };
        let msg = merge_failed_message(
            &self.rig.name,
            &mr.worker_name,
            &mr.source_branch,
            &mr.source_issue_id,
            &mr.target_branch,
            failure_type,
            &result.error,
        );
        match self.router.send(msg) {
            Ok(_) => eprintln!(
                "[refinery] notified witness of merge failure for {}",
                mr.worker_name
            ),
            Err(e) => eprintln!("[refinery] warning: failed to send MERGE_FAILED: {e}"),
        }

        let _ = self.queue.release_claim(&mr.id);

        if result.conflict {
            let retry_count = mr.retry_count + 1;

            match self.create_repair_task(mr, retry_count) {
                Ok(Some(task_id)) => {
                    if let Err(e) = self.queue.set_blocked_by(&mr.id, &task_id) {
                        eprintln!("[refinery] warning: failed to block MR on task: {e}");
                    } else {
                        eprintln!(
                            "[refinery] {} blocked on repair task {task_id}; queue continues",
                            mr.id
                        );
                    }
                }
                Ok(None) => {
                    // Slot held elsewhere; MR retries after the current
                    // resolution lands
                }
                Err(e) => {
                    eprintln!("[refinery] warning: failed to create repair task: {e}");
                }
            }

            // Re-read so the retry bump lands on top of the blocked_by gate
            match self.queue.get(&mr.id) {
                Ok(mut updated) => {
                    updated.retry_count = retry_count;
                    if let Err(e) = self.queue.save(&updated) {
                        eprintln!("[refinery] warning: failed to record retry count: {e}");
                    }
                }
                Err(e) => {
                    eprintln!("[refinery] warning: failed to record retry count: {e}");
                }
            }
        }

        if result.tests_failed {
            // Test failures go back to the worker instead of hot-looping
            // in the queue: reopen the MR issue for rework and drop the
            // queue entry; the worker resubmits after fixing
            if let Err(e) = self.tracker.update(
                &mr.id,
                &UpdateOptions {
                    status: Some("open".to_string()),
                    ..Default::default()
                },
            ) {
                eprintln!("[refinery] warning: failed to reopen MR {}: {e}", mr.id);
            }
            if let Err(e) = self.queue.remove(&mr.id) {
                eprintln!("[refinery] warning: failed to remove MR from queue: {e}");
            }
            eprintln!(
                "[refinery] {} returned to {} for rework",
                mr.id, mr.worker_name
            );
        }

        eprintln!("[refinery] failed: {} - {}", mr.id, result.error);
        if !result.conflict && !result.tests_failed {
            eprintln!("[refinery] MR remains in queue for retry");
        }
    }

    /// Create the conflict-repair task, gated on the rig's merge slot so
    /// only one resolution runs at a time. Returns None when the slot is
    /// held by someone else (the MR simply stays queued).
    fn create_repair_task(
        &self,
        mr: &MergeRequest,
        retry_count: u32,
    ) -> anyhow::Result<Option<String>> {
        let holder = self.holder_id();
        match self.tracker.slot_ensure() {
            Ok(slot_id) => match self.tracker.slot_acquire(&holder) {
                Ok(status) => {
                    if !status.available && !status.holder.is_empty() && status.holder != holder {
                        eprintln!(
                            "[refinery] merge slot held by {} - deferring conflict resolution",
                            status.holder
                        );
                        return Ok(None);
                    }
                    eprintln!("[refinery] acquired merge slot: {slot_id}");
                }
                Err(e) => {
                    eprintln!("[refinery] warning: could not acquire merge slot: {e}");
                }
            },
            Err(e) => {
                eprintln!("[refinery] warning: could not ensure merge slot: {e}");
            }
        }

        let target_sha = self
            .git
            .rev(&format!("origin/{}", mr.target_branch))
            .unwrap_or_else(|_| "unknown-sha".to_string());
        let short_sha = &target_sha[..8.min(target_sha.len())];

        let original_title = if mr.source_issue_id.is_empty() {
            mr.source_branch.clone()
        } else {
            self.tracker
                .show(&mr.source_issue_id)
                .map(|issue| issue.title)
                .unwrap_or_else(|_| mr.source_issue_id.clone())
        };

        // Lower number is more urgent; P0 stays P0
        let boosted_priority = (mr.priority - 1).max(0);

        let description = format!(
            "Resolve merge conflicts for branch {branch}\n\n\
             ## Metadata\n\
             - Original MR: {mr_id}\n\
             - Branch: {branch}\n\
             - Conflict with: {target}@{short_sha}\n\
             - Original issue: {source}\n\
             - Retry count: {retry_count}\n\n\
             ## Instructions\n\
             1. Check out the branch: git checkout {branch}\n\
             2. Rebase onto target: git rebase origin/{target}\n\
             3. Resolve conflicts in your editor\n\
             4. Complete the rebase: git add . && git rebase --continue\n\
             5. Force-push the resolved branch: git push -f\n\
             6. Close this task\n\n\
             The refinery will automatically retry the merge after you force-push.",
            branch = mr.source_branch,
            mr_id = mr.id,
            target = mr.target_branch,
            source = mr.source_issue_id,
        );

        let task = self.tracker.create(&CreateOptions {
            title: format!("Resolve merge conflicts: {original_title}"),
            issue_type: "task".to_string(),
            priority: boosted_priority,
            description,
            actor: holder,
            parent: None,
        })?;

        eprintln!(
            "[refinery] created repair task: {} (P{})",
            task.id, boosted_priority
        );
        Ok(Some(task.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::Priority;
    use std::path::Path;

    /// Town with one rig: mayor clone with an origin, plus a worker branch
    /// carrying one commit.
    fn setup(town: &Path) -> (Rig, PathBuf) {
        let rig_path = town.join("gastown");
        let mayor = rig_path.join("mayor/rig");
        let origin = town.join("origin.git");
        std::fs::create_dir_all(&mayor).unwrap();
        std::fs::create_dir_all(&origin).unwrap();
        std::fs::create_dir_all(town.join("settings")).unwrap();
        std::fs::write(town.join("settings/agents.json"), "{\"version\":1}").unwrap();

        let run = |dir: &Path, args: &[&str]| {
            Tool::new("git").args(args).current_dir(dir).run_ok().unwrap();
        };
        run(&origin, &["init", "--bare", "-b", "main"]);
        run(&mayor, &["init", "-b", "main"]);
        run(&mayor, &["config", "user.email", "test@example.com"]);
        run(&mayor, &["config", "user.name", "test"]);
        std::fs::write(mayor.join("README.md"), "base\n").unwrap();
        run(&mayor, &["add", "."]);
        run(&mayor, &["commit", "-m", "init"]);
        run(&mayor, &["remote", "add", "origin", &origin.to_string_lossy()]);
        run(&mayor, &["push", "origin", "main"]);

        // Worker branch with non-conflicting work
        run(&mayor, &["checkout", "-b", "polecat/furiosa"]);
        std::fs::write(mayor.join("feature.txt"), "feature\n").unwrap();
        run(&mayor, &["add", "."]);
        run(&mayor, &["commit", "-m", "feature"]);
        run(&mayor, &["checkout", "main"]);

        (Rig::open(town, "gastown").unwrap(), mayor)
    }

    fn engineer(town: &Path, rig: &Rig) -> Engineer {
        Engineer::new(town, rig.clone()).unwrap()
    }

    fn queued_mr(rig: &Rig, id: &str) -> MergeRequest {
        let mut mr = MergeRequest::new("polecat/furiosa", "main", "furiosa");
        mr.id = id.to_string();
        Queue::new(&rig.path).enqueue(&mr).unwrap();
        mr
    }

    #[test]
    fn process_mr_merges_and_pushes() {
        let tmp = tempfile::tempdir().unwrap();
        let (rig, mayor) = setup(tmp.path());
        let eng = engineer(tmp.path(), &rig);

        let mr = MergeRequest::new("polecat/furiosa", "main", "furiosa");
        let result = eng.process_mr(&mr, &CancelToken::new());
        assert!(result.success, "unexpected failure: {}", result.error);
        assert!(!result.merge_commit.is_empty());

        // Merge commit message is deterministic
        let subject = Tool::new("git")
            .args(&["log", "-1", "--format=%s"])
            .current_dir(&mayor)
            .run_ok()
            .unwrap();
        assert_eq!(subject.stdout.trim(), "Merge polecat/furiosa into main");

        // Pushed to origin
        let pushed = Tool::new("git")
            .args(&["rev-parse", "main"])
            .current_dir(&tmp.path().join("origin.git"))
            .run_ok()
            .unwrap();
        assert_eq!(pushed.stdout.trim(), result.merge_commit);
    }

    #[test]
    fn merge_message_references_source_issue() {
        let tmp = tempfile::tempdir().unwrap();
        let (rig, mayor) = setup(tmp.path());
        let eng = engineer(tmp.path(), &rig);

        let mut mr = MergeRequest::new("polecat/furiosa", "main", "furiosa");
        mr.source_issue_id = "bt-42".to_string();
        let result = eng.process_mr(&mr, &CancelToken::new());
        assert!(result.success);

        let subject = Tool::new("git")
            .args(&["log", "-1", "--format=%s"])
            .current_dir(&mayor)
            .run_ok()
            .unwrap();
        assert_eq!(
            subject.stdout.trim(),
            "Merge polecat/furiosa into main (bt-42)"
        );
    }

    #[test]
    fn missing_branch_is_fatal_for_mr() {
        let tmp = tempfile::tempdir().unwrap();
        let (rig, _) = setup(tmp.path());
        let eng = engineer(tmp.path(), &rig);

        let mr = MergeRequest::new("polecat/ghost", "main", "ghost");
        let result = eng.process_mr(&mr, &CancelToken::new());
        assert!(!result.success);
        assert!(!result.conflict);
        assert!(result.error.contains("not found locally"));
    }

    #[test]
    fn conflicting_branch_short_circuits() {
        let tmp = tempfile::tempdir().unwrap();
        let (rig, mayor) = setup(tmp.path());
        let run = |args: &[&str]| {
            Tool::new("git").args(args).current_dir(&mayor).run_ok().unwrap();
        };
        // Both sides edit README.md
        run(&["checkout", "polecat/furiosa"]);
        std::fs::write(mayor.join("README.md"), "worker side\n").unwrap();
        run(&["commit", "-am", "worker edit"]);
        run(&["checkout", "main"]);
        std::fs::write(mayor.join("README.md"), "trunk side\n").unwrap();
        run(&["commit", "-am", "trunk edit"]);

        let eng = engineer(tmp.path(), &rig);
        let mr = MergeRequest::new("polecat/furiosa", "main", "furiosa");
        let result = eng.process_mr(&mr, &CancelToken::new());
        assert!(!result.success);
        assert!(result.conflict);
        assert!(result.error.contains("README.md"));

        // Working tree untouched - no half-finished merge left behind
        let status = Tool::new("git")
            .args(&["status", "--porcelain"])
            .current_dir(&mayor)
            .run_ok()
            .unwrap();
        assert_eq!(status.stdout.trim(), "");
    }

    #[test]
    fn failing_tests_block_merge() {
        let tmp = tempfile::tempdir().unwrap();
        let (rig, _) = setup(tmp.path());
        std::fs::write(
            rig.path.join("config.json"),
            r#"{"merge_queue": {"test_command": "false", "retry_flaky_tests": 2}}"#,
        )
        .unwrap();

        let eng = engineer(tmp.path(), &rig);
        let mr = MergeRequest::new("polecat/furiosa", "main", "furiosa");
        let result = eng.process_mr(&mr, &CancelToken::new());
        assert!(!result.success);
        assert!(result.tests_failed);
        assert!(result.error.contains("2 attempt(s)"));
    }

    #[test]
    fn canceled_tests_report_canceled() {
        let tmp = tempfile::tempdir().unwrap();
        let (rig, _) = setup(tmp.path());
        std::fs::write(
            rig.path.join("config.json"),
            r#"{"merge_queue": {"test_command": "sleep 30"}}"#,
        )
        .unwrap();

        let eng = engineer(tmp.path(), &rig);
        let cancel = CancelToken::new();
        cancel.cancel();
        let mr = MergeRequest::new("polecat/furiosa", "main", "furiosa");
        let result = eng.process_mr(&mr, &cancel);
        assert!(!result.success);
        assert!(result.canceled);
        assert_eq!(result.error, "test run canceled");
    }

    #[test]
    fn handle_success_cleans_queue_and_branch() {
        let tmp = tempfile::tempdir().unwrap();
        let (rig, _) = setup(tmp.path());
        let eng = engineer(tmp.path(), &rig);

        let mr = queued_mr(&rig, "mr-ok");
        let result = eng.process_mr(&mr, &CancelToken::new());
        assert!(result.success);
        eng.handle_success(&mr, &result);

        // MR file gone from the queue
        assert!(Queue::new(&rig.path).get("mr-ok").is_err());
        // Local branch deleted (delete_merged_branches defaults true)
        assert!(!eng.git.branch_exists("polecat/furiosa").unwrap());
        // Merged event recorded
        let events =
            std::fs::read_to_string(rig.path.join(".runtime/mrqueue-events.jsonl")).unwrap();
        assert!(events.lines().any(|l| l.contains("\"merged\"")));
    }

    #[test]
    fn handle_success_keeps_branches_when_configured() {
        let tmp = tempfile::tempdir().unwrap();
        let (rig, _) = setup(tmp.path());
        std::fs::write(
            rig.path.join("config.json"),
            r#"{"merge_queue": {"delete_merged_branches": false}}"#,
        )
        .unwrap();
        let eng = engineer(tmp.path(), &rig);

        let mr = queued_mr(&rig, "mr-keep");
        let result = eng.process_mr(&mr, &CancelToken::new());
        assert!(result.success);
        eng.handle_success(&mr, &result);

        assert!(eng.git.branch_exists("polecat/furiosa").unwrap());
        assert!(Queue::new(&rig.path).get("mr-keep").is_err());
    }

    #[test]
    fn handle_failure_conflict_notifies_witness_and_bumps_retry() {
        let tmp = tempfile::tempdir().unwrap();
        let (rig, _) = setup(tmp.path());
        let eng = engineer(tmp.path(), &rig);

        let mr = queued_mr(&rig, "mr-conflict");
        let result = ProcessResult::conflict("merge conflicts in: [\"README.md\"]");
        eng.handle_failure(&mr, &result);

        // Retry count persisted; MR still queued (tracker is down, so no
        // repair task could be created)
        let updated = Queue::new(&rig.path).get("mr-conflict").unwrap();
        assert_eq!(updated.retry_count, 1);

        // Witness got the structured MERGE_FAILED message
        let inbox = Router::new(tmp.path()).mailbox("gastown/witness");
        let unread = inbox.list_unread().unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].subject, "MERGE_FAILED: polecat/furiosa");
        assert_eq!(unread[0].priority, Priority::High);
        assert!(unread[0].body.contains("Type: conflict"));

        // merge_failed event recorded
        let events =
            std::fs::read_to_string(rig.path.join(".runtime/mrqueue-events.jsonl")).unwrap();
        assert!(events.lines().any(|l| l.contains("merge_failed")));
    }

    #[test]
    fn non_conflict_failure_keeps_mr_queued_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let (rig, _) = setup(tmp.path());
        let eng = engineer(tmp.path(), &rig);

        let mr = queued_mr(&rig, "mr-push");
        let result = ProcessResult::fail("failed to push to origin: rejected");
        eng.handle_failure(&mr, &result);

        let updated = Queue::new(&rig.path).get("mr-push").unwrap();
        assert_eq!(updated.retry_count, 0);
        assert!(updated.blocked_by_task_id.is_empty());
        assert!(!updated.claim_active());
    }

    #[test]
    fn test_failure_returns_mr_to_worker() {
        let tmp = tempfile::tempdir().unwrap();
        let (rig, _) = setup(tmp.path());
        let eng = engineer(tmp.path(), &rig);

        let mr = queued_mr(&rig, "mr-tests");
        let result = ProcessResult {
            tests_failed: true,
            error: "tests failed after 1 attempt(s)".to_string(),
            ..Default::default()
        };
        eng.handle_failure(&mr, &result);

        // Not retried by the engine: the queue entry is gone and the
        // witness was told
        assert!(Queue::new(&rig.path).get("mr-tests").is_err());
        let inbox = Router::new(tmp.path()).mailbox("gastown/witness");
        assert_eq!(inbox.list_unread().unwrap().len(), 1);
    }
}
