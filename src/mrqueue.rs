//! Merge request queue: one JSON file per pending MR.
//!
//! The queue holds runtime scheduling state (claims, retries, blocking);
//! the tracker holds the human-readable MR record. Ready MRs are ordered
//! by priority score: most urgent priority first, then higher retry count
//! (conflict-resolved MRs re-enter at or above their old position), then
//! enqueue time.

use std::cmp::Ordering;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Typed queue failures.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("merge request not found: {0}")]
    NotFound(String),

    #[error("merge request already queued: {0}")]
    AlreadyExists(String),
}

/// One pending integration request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
    pub id: String,
    pub source_branch: String,
    pub target_branch: String,
    pub worker_name: String,
    #[serde(default)]
    pub source_issue_id: String,
    #[serde(default)]
    pub agent_bead_id: String,
    /// Lower is more urgent (P0 beats P2).
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub blocked_by_task_id: String,
    #[serde(default)]
    pub claimed_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_commit: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl MergeRequest {
    /// A new MR ready to enqueue.
    pub fn new(source_branch: &str, target_branch: &str, worker_name: &str) -> Self {
        Self {
            id: format!(
                "mr-{}-{}",
                Utc::now().timestamp_millis(),
                std::process::id()
            ),
            source_branch: source_branch.to_string(),
            target_branch: target_branch.to_string(),
            worker_name: worker_name.to_string(),
            source_issue_id: String::new(),
            agent_bead_id: String::new(),
            priority: 2,
            retry_count: 0,
            blocked_by_task_id: String::new(),
            claimed_by: String::new(),
            claim_expires_at: None,
            merge_commit: None,
            enqueued_at: Utc::now(),
        }
    }

    /// A claim only counts while it has not expired.
    pub fn claim_active(&self) -> bool {
        !self.claimed_by.is_empty()
            && self
                .claim_expires_at
                .map(|t| t > Utc::now())
                .unwrap_or(true)
    }
}

/// Priority score ordering: urgency, then retries, then arrival.
fn ready_order(a: &MergeRequest, b: &MergeRequest) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then(b.retry_count.cmp(&a.retry_count))
        .then(a.enqueued_at.cmp(&b.enqueued_at))
}

/// The on-disk queue for one rig.
pub struct Queue {
    dir: PathBuf,
}

impl Queue {
    pub fn new(rig_path: &Path) -> Self {
        Self {
            dir: rig_path.join(".runtime").join("mrqueue"),
        }
    }

    fn mr_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn write(&self, mr: &MergeRequest) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir).context("creating queue dir")?;
        let path = self.mr_path(&mr.id);
        let tmp = self.dir.join(format!("{}.json.tmp", mr.id));
        std::fs::write(&tmp, serde_json::to_string_pretty(mr)?).context("writing MR")?;
        std::fs::rename(&tmp, &path).context("committing MR")?;
        Ok(())
    }

    /// Add a new MR to the queue.
    pub fn enqueue(&self, mr: &MergeRequest) -> anyhow::Result<()> {
        if self.mr_path(&mr.id).exists() {
            return Err(QueueError::AlreadyExists(mr.id.clone()).into());
        }
        self.write(mr)
    }

    /// Fetch one MR.
    pub fn get(&self, id: &str) -> anyhow::Result<MergeRequest> {
        let data = match std::fs::read_to_string(self.mr_path(id)) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(QueueError::NotFound(id.to_string()).into());
            }
            Err(e) => return Err(anyhow::Error::new(e).context("reading MR")),
        };
        serde_json::from_str(&data).with_context(|| format!("parsing MR {id}"))
    }

    /// Persist updated scheduling state for an MR already in the queue.
    pub fn save(&self, mr: &MergeRequest) -> anyhow::Result<()> {
        if !self.mr_path(&mr.id).exists() {
            return Err(QueueError::NotFound(mr.id.clone()).into());
        }
        self.write(mr)
    }

    /// Drop an MR from the queue (merged or abandoned).
    pub fn remove(&self, id: &str) -> anyhow::Result<()> {
        match std::fs::remove_file(self.mr_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(QueueError::NotFound(id.to_string()).into())
            }
            Err(e) => Err(anyhow::Error::new(e).context("removing MR")),
        }
    }

    /// Gate an MR behind a repair task. When the task closes, the MR
    /// becomes ready again.
    pub fn set_blocked_by(&self, mr_id: &str, task_id: &str) -> anyhow::Result<()> {
        let mut mr = self.get(mr_id)?;
        mr.blocked_by_task_id = task_id.to_string();
        self.write(&mr)
    }

    /// Claim an MR for a processor, with an expiry so claims survive
    /// engine crashes without wedging the queue.
    pub fn claim(&self, mr_id: &str, owner: &str, ttl: chrono::Duration) -> anyhow::Result<()> {
        let mut mr = self.get(mr_id)?;
        mr.claimed_by = owner.to_string();
        mr.claim_expires_at = Some(Utc::now() + ttl);
        self.write(&mr)
    }

    /// Release a claim.
    pub fn release_claim(&self, mr_id: &str) -> anyhow::Result<()> {
        let mut mr = self.get(mr_id)?;
        mr.claimed_by.clear();
        mr.claim_expires_at = None;
        self.write(&mr)
    }

    /// All MRs in the queue, unordered.
    pub fn list(&self) -> anyhow::Result<Vec<MergeRequest>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(anyhow::Error::new(e).context("listing queue")),
        };

        let mut mrs = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let Ok(data) = std::fs::read_to_string(&path) else {
                continue;
            };
            if let Ok(mr) = serde_json::from_str::<MergeRequest>(&data) {
                mrs.push(mr);
            }
        }
        Ok(mrs)
    }

    /// MRs eligible for processing: unclaimed (or claim expired) and not
    /// gated behind an open task. Sorted by priority score.
    pub fn list_ready<F>(&self, is_open: F) -> anyhow::Result<Vec<MergeRequest>>
    where
        F: Fn(&str) -> bool,
    {
        let mut ready: Vec<MergeRequest> = self
            .list()?
            .into_iter()
            .filter(|mr| !mr.claim_active())
            .filter(|mr| mr.blocked_by_task_id.is_empty() || !is_open(&mr.blocked_by_task_id))
            .collect();
        ready.sort_by(ready_order);
        Ok(ready)
    }

    /// MRs gated behind a still-open repair task.
    pub fn list_blocked<F>(&self, is_open: F) -> anyhow::Result<Vec<MergeRequest>>
    where
        F: Fn(&str) -> bool,
    {
        let mut blocked: Vec<MergeRequest> = self
            .list()?
            .into_iter()
            .filter(|mr| !mr.blocked_by_task_id.is_empty() && is_open(&mr.blocked_by_task_id))
            .collect();
        blocked.sort_by(ready_order);
        Ok(blocked)
    }
}

/// Append-only JSONL log of merge lifecycle events for one rig.
pub struct EventLogger {
    path: PathBuf,
}

impl EventLogger {
    pub fn new(rig_path: &Path) -> Self {
        Self {
            path: rig_path.join(".runtime").join("mrqueue-events.jsonl"),
        }
    }

    fn append(&self, event: &str, mr: &MergeRequest, extra: serde_json::Value) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::json!({
            "ts": Utc::now(),
            "event": event,
            "mr_id": mr.id,
            "branch": mr.source_branch,
            "target": mr.target_branch,
            "worker": mr.worker_name,
        });
        if let (Some(obj), Some(extra)) = (line.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    pub fn merge_started(&self, mr: &MergeRequest) -> anyhow::Result<()> {
        self.append("merge_started", mr, serde_json::json!({}))
    }

    pub fn merged(&self, mr: &MergeRequest, commit: &str) -> anyhow::Result<()> {
        self.append("merged", mr, serde_json::json!({ "commit": commit }))
    }

    pub fn merge_failed(&self, mr: &MergeRequest, error: &str) -> anyhow::Result<()> {
        self.append("merge_failed", mr, serde_json::json!({ "error": error }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mr(id: &str, priority: i64) -> MergeRequest {
        let mut mr = MergeRequest::new(
            &format!("polecat/{id}"),
            "main",
            id,
        );
        mr.id = id.to_string();
        mr.priority = priority;
        mr
    }

    #[test]
    fn enqueue_get_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = Queue::new(tmp.path());

        queue.enqueue(&mr("a", 2)).unwrap();
        let found = queue.get("a").unwrap();
        assert_eq!(found.source_branch, "polecat/a");

        queue.remove("a").unwrap();
        let err = queue.get("a").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<QueueError>(),
            Some(QueueError::NotFound(_))
        ));
    }

    #[test]
    fn enqueue_twice_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = Queue::new(tmp.path());
        queue.enqueue(&mr("a", 2)).unwrap();
        let err = queue.enqueue(&mr("a", 2)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<QueueError>(),
            Some(QueueError::AlreadyExists(_))
        ));
    }

    #[test]
    fn ready_sorts_urgent_priority_first() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = Queue::new(tmp.path());
        queue.enqueue(&mr("a", 2)).unwrap();
        queue.enqueue(&mr("b", 1)).unwrap();

        let ready = queue.list_ready(|_| true).unwrap();
        let ids: Vec<&str> = ready.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn retry_tie_break_favors_retries() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = Queue::new(tmp.path());

        let mut a = mr("a", 1);
        a.retry_count = 1;
        let b = mr("b", 1);
        queue.enqueue(&b).unwrap();
        queue.enqueue(&a).unwrap();

        let ready = queue.list_ready(|_| true).unwrap();
        let ids: Vec<&str> = ready.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn equal_score_orders_by_enqueue_time() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = Queue::new(tmp.path());

        let mut first = mr("first", 1);
        first.enqueued_at = Utc::now() - chrono::Duration::minutes(5);
        queue.enqueue(&first).unwrap();
        queue.enqueue(&mr("second", 1)).unwrap();

        let ready = queue.list_ready(|_| true).unwrap();
        let ids: Vec<&str> = ready.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    #[test]
    fn blocked_mr_excluded_until_task_closes() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = Queue::new(tmp.path());
        queue.enqueue(&mr("a", 1)).unwrap();
        queue.set_blocked_by("a", "task-9").unwrap();

        // Task still open: MR is blocked
        let ready = queue.list_ready(|task| task == "task-9").unwrap();
        assert!(ready.is_empty());
        let blocked = queue.list_blocked(|task| task == "task-9").unwrap();
        assert_eq!(blocked.len(), 1);

        // Task closed: MR is ready again
        let ready = queue.list_ready(|_| false).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(queue.list_blocked(|_| false).unwrap().is_empty());
    }

    #[test]
    fn active_claim_excludes_until_expiry() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = Queue::new(tmp.path());
        queue.enqueue(&mr("a", 1)).unwrap();

        queue
            .claim("a", "gastown/refinery", chrono::Duration::minutes(10))
            .unwrap();
        assert!(queue.list_ready(|_| true).unwrap().is_empty());

        // Expired claim no longer excludes
        let mut claimed = queue.get("a").unwrap();
        claimed.claim_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        queue.save(&claimed).unwrap();
        assert_eq!(queue.list_ready(|_| true).unwrap().len(), 1);

        queue.release_claim("a").unwrap();
        let released = queue.get("a").unwrap();
        assert!(released.claimed_by.is_empty());
        assert!(released.claim_expires_at.is_none());
    }

    #[test]
    fn save_requires_existing_mr() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = Queue::new(tmp.path());
        let err = queue.save(&mr("ghost", 1)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<QueueError>(),
            Some(QueueError::NotFound(_))
        ));
    }

    #[test]
    fn event_logger_appends_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let events = EventLogger::new(tmp.path());
        let request = mr("a", 1);

        events.merge_started(&request).unwrap();
        events.merged(&request, "abc123").unwrap();
        events.merge_failed(&request, "merge conflicts in: [lib.rs]").unwrap();

        let content =
            std::fs::read_to_string(tmp.path().join(".runtime/mrqueue-events.jsonl")).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event"], "merge_started");
        assert_eq!(lines[1]["commit"], "abc123");
        assert_eq!(lines[2]["event"], "merge_failed");
    }
}
