//! Thin wrapper over the git binary.
//!
//! Workers are worktrees over the mayor clone's object store, so branch
//! lookups and merges here never fetch from a worker - everything is
//! already local.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::subprocess::Tool;

/// Git operations rooted at one working directory.
pub struct Git {
    repo: PathBuf,
}

/// What a worker would lose if its worktree were deleted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UncommittedWorkStatus {
    pub staged: usize,
    pub unstaged: usize,
    pub untracked: usize,
    pub stash_count: usize,
    pub unpushed_commits: usize,
}

impl UncommittedWorkStatus {
    /// True when deleting the worktree loses nothing.
    pub fn clean(&self) -> bool {
        self.staged == 0
            && self.unstaged == 0
            && self.untracked == 0
            && self.stash_count == 0
            && self.unpushed_commits == 0
    }

    /// True when only the working tree is dirty (no stashes, nothing
    /// unpushed).
    pub fn only_uncommitted_changes(&self) -> bool {
        self.stash_count == 0 && self.unpushed_commits == 0
    }
}

impl fmt::Display for UncommittedWorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.staged > 0 {
            parts.push(format!("{} staged", self.staged));
        }
        if self.unstaged > 0 {
            parts.push(format!("{} unstaged", self.unstaged));
        }
        if self.untracked > 0 {
            parts.push(format!("{} untracked", self.untracked));
        }
        if self.stash_count > 0 {
            parts.push(format!("{} stash(es)", self.stash_count));
        }
        if self.unpushed_commits > 0 {
            parts.push(format!("{} unpushed commit(s)", self.unpushed_commits));
        }
        if parts.is_empty() {
            write!(f, "clean")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

impl Git {
    pub fn new(repo: &Path) -> Self {
        Self {
            repo: repo.to_path_buf(),
        }
    }

    fn git(&self, args: &[&str]) -> Tool {
        Tool::new("git").args(args).current_dir(&self.repo)
    }

    /// Whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> anyhow::Result<bool> {
        let output = self
            .git(&["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .run()?;
        Ok(output.success())
    }

    /// Create a worktree on a new branch from the current HEAD.
    pub fn worktree_add(&self, path: &Path, branch: &str) -> anyhow::Result<()> {
        self.git(&["worktree", "add", "-b", branch, &path.to_string_lossy()])
            .run_ok()
            .context("creating worktree")?;
        Ok(())
    }

    /// Create a worktree on an existing branch.
    pub fn worktree_add_existing(&self, path: &Path, branch: &str) -> anyhow::Result<()> {
        self.git(&["worktree", "add", &path.to_string_lossy(), branch])
            .run_ok()
            .context("creating worktree on existing branch")?;
        Ok(())
    }

    /// Detach a worktree.
    pub fn worktree_remove(&self, path: &Path, force: bool) -> anyhow::Result<()> {
        let path_str = path.to_string_lossy();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);
        self.git(&args).run_ok().context("removing worktree")?;
        Ok(())
    }

    /// Prune stale worktree registry entries.
    pub fn worktree_prune(&self) -> anyhow::Result<()> {
        self.git(&["worktree", "prune"]).run_ok()?;
        Ok(())
    }

    /// Delete a local branch.
    pub fn delete_branch(&self, branch: &str, force: bool) -> anyhow::Result<()> {
        let flag = if force { "-D" } else { "-d" };
        self.git(&["branch", flag, branch]).run_ok()?;
        Ok(())
    }

    /// Delete a branch on a remote.
    pub fn delete_remote_branch(&self, remote: &str, branch: &str) -> anyhow::Result<()> {
        self.git(&["push", remote, "--delete", branch]).run_ok()?;
        Ok(())
    }

    pub fn checkout(&self, branch: &str) -> anyhow::Result<()> {
        self.git(&["checkout", branch]).run_ok()?;
        Ok(())
    }

    pub fn pull(&self, remote: &str, branch: &str) -> anyhow::Result<()> {
        self.git(&["pull", remote, branch]).run_ok()?;
        Ok(())
    }

    pub fn push(&self, remote: &str, branch: &str) -> anyhow::Result<()> {
        self.git(&["push", remote, branch]).run_ok()?;
        Ok(())
    }

    /// Merge a branch into the current one with a merge commit.
    pub fn merge_no_ff(&self, branch: &str, message: &str) -> anyhow::Result<()> {
        self.git(&["merge", "--no-ff", "-m", message, branch])
            .run_ok()?;
        Ok(())
    }

    /// Abort an in-progress merge.
    pub fn abort_merge(&self) -> anyhow::Result<()> {
        self.git(&["merge", "--abort"]).run_ok()?;
        Ok(())
    }

    /// Paths with unmerged index entries (an in-progress conflicted merge).
    pub fn conflicting_files(&self) -> anyhow::Result<Vec<String>> {
        let output = self
            .git(&["diff", "--name-only", "--diff-filter=U"])
            .run_ok()?;
        Ok(output
            .stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Dry-run conflict probe between two branches without touching the
    /// working tree. Returns the conflicted paths, empty when clean.
    pub fn check_conflicts(&self, source: &str, target: &str) -> anyhow::Result<Vec<String>> {
        let output = self
            .git(&[
                "merge-tree",
                "--write-tree",
                "--no-messages",
                "--name-only",
                target,
                source,
            ])
            .run()?;

        if output.success() {
            return Ok(Vec::new());
        }
        // Exit 1 with output: first line is the tree OID, the rest are
        // conflicted paths. Anything else is a real failure.
        if output.exit_code == 1 {
            let conflicts: Vec<String> = output
                .stdout
                .lines()
                .skip(1)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
            return Ok(conflicts);
        }
        anyhow::bail!(
            "merge-tree {target}..{source} failed: {}",
            output.stderr.trim()
        );
    }

    /// Resolve a ref to its full SHA.
    pub fn rev(&self, refname: &str) -> anyhow::Result<String> {
        let output = self.git(&["rev-parse", refname]).run_ok()?;
        Ok(output.stdout.trim().to_string())
    }

    /// Everything a worker would lose: index, working tree, stashes, and
    /// commits not on any remote.
    pub fn uncommitted_work(&self) -> anyhow::Result<UncommittedWorkStatus> {
        let mut status = UncommittedWorkStatus::default();

        let porcelain = self.git(&["status", "--porcelain"]).run_ok()?;
        for line in porcelain.stdout.lines() {
            let mut chars = line.chars();
            let x = chars.next().unwrap_or(' ');
            let y = chars.next().unwrap_or(' ');
            if x == '?' && y == '?' {
                status.untracked += 1;
                continue;
            }
            if x != ' ' {
                status.staged += 1;
            }
            if y != ' ' {
                status.unstaged += 1;
            }
        }

        let stashes = self.git(&["stash", "list"]).run_ok()?;
        status.stash_count = stashes.stdout.lines().filter(|l| !l.is_empty()).count();

        // Commits not reachable from any remote ref. Works for worktree
        // branches that were never pushed, unlike @{upstream}.
        let unpushed = self
            .git(&["rev-list", "--count", "HEAD", "--not", "--remotes"])
            .run()?;
        if unpushed.success() {
            status.unpushed_commits = unpushed.stdout.trim().parse().unwrap_or(0);
        }

        Ok(status)
    }
}
