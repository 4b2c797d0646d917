//! Repository adapter: the only component allowed to mutate version control.
//!
//! Every mutating call is safe to retry. Pre-existing state (branch, tag,
//! applied cherry-pick) is reported distinguishably from transport failures
//! so the executor can decide whether it already matches the expected result.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::domain::ReleaseVersion;

/// Repository operation errors
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Cherry-pick of {commit} conflicts: {details}")]
    Conflict { commit: String, details: String },

    #[error("Tag {tag} already exists (points at {target})")]
    TagAlreadyExists { tag: String, target: String },

    #[error("Branch {branch} already exists (at {head})")]
    BranchAlreadyExists { branch: String, head: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata of a commit on a branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub id: String,
    pub summary: String,
    pub author: String,
    pub authored_at: DateTime<Utc>,

    /// Committer time; for cherry-picked commits this is when they were applied
    pub committed_at: DateTime<Utc>,
}

/// Result of a cherry-pick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CherryPickOutcome {
    /// Applied as a new commit
    Applied { commit: String },

    /// The commit was already on the branch; nothing changed
    AlreadyApplied,
}

/// Version-control operations used by the release engine
#[async_trait]
pub trait RepositoryAdapter: Send + Sync {
    /// Human-readable adapter name
    fn name(&self) -> &str;

    /// Resolve a ref to a commit id
    async fn head_commit(&self, refname: &str) -> Result<String, RepositoryError>;

    /// Create `branch` from `from`, returning the new branch head
    async fn create_branch(&self, branch: &str, from: &str) -> Result<String, RepositoryError>;

    async fn checkout(&self, branch: &str) -> Result<(), RepositoryError>;

    /// Apply `commit` onto the checked-out branch
    async fn cherry_pick(&self, commit: &str) -> Result<CherryPickOutcome, RepositoryError>;

    /// Write files (relative path -> content) and commit them
    ///
    /// Returns the resulting HEAD; committing identical content is a no-op.
    async fn commit_files(
        &self,
        files: &BTreeMap<String, String>,
        message: &str,
    ) -> Result<String, RepositoryError>;

    /// Create an annotated tag at HEAD, returning the tagged commit
    async fn tag(&self, version: &ReleaseVersion, message: &str) -> Result<String, RepositoryError>;

    /// Commit a tag points at, if the tag exists
    async fn tag_target(&self, tag: &str) -> Result<Option<String>, RepositoryError>;

    /// Push a ref to the configured remote
    async fn push(&self, refname: &str) -> Result<(), RepositoryError>;

    /// Commits reachable from `branch` but not from `since_tag`, oldest first
    async fn commits_between(
        &self,
        since_tag: &str,
        branch: &str,
    ) -> Result<Vec<CommitInfo>, RepositoryError>;
}

/// Repository adapter backed by the system `git` binary
pub struct GitRepository {
    /// Working tree root
    work_tree: PathBuf,

    /// Remote pushed to
    remote: String,

    git_binary: String,
}

impl GitRepository {
    pub fn new(work_tree: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            work_tree: work_tree.into(),
            remote: remote.into(),
            git_binary: "git".to_string(),
        }
    }

    /// Use a custom git binary path
    pub fn with_git_binary(mut self, binary: impl Into<String>) -> Self {
        self.git_binary = binary.into();
        self
    }

    pub fn work_tree(&self) -> &Path {
        &self.work_tree
    }

    async fn run(&self, args: &[&str]) -> Result<Output, RepositoryError> {
        debug!(args = ?args, "git");
        let output = Command::new(&self.git_binary)
            .arg("-C")
            .arg(&self.work_tree)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await?;
        Ok(output)
    }

    /// Run git, returning trimmed stdout or a classified error
    async fn run_ok(&self, args: &[&str]) -> Result<String, RepositoryError> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(classify_failure(args, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Resolve a ref quietly; `None` if it does not exist
    async fn resolve(&self, refname: &str) -> Result<Option<String>, RepositoryError> {
        let spec = format!("{}^{{commit}}", refname);
        let output = self.run(&["rev-parse", "--verify", "--quiet", &spec]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
    }

    /// Whether a commit was already cherry-picked onto HEAD (via the `-x` trailer)
    async fn already_picked(&self, commit: &str) -> Result<bool, RepositoryError> {
        let grep = format!("--grep=cherry picked from commit {}", commit);
        let found = self
            .run_ok(&["log", "--format=%H", "--fixed-strings", &grep, "HEAD"])
            .await?;
        Ok(!found.is_empty())
    }
}

#[async_trait]
impl RepositoryAdapter for GitRepository {
    fn name(&self) -> &str {
        "git"
    }

    async fn head_commit(&self, refname: &str) -> Result<String, RepositoryError> {
        self.resolve(refname)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(refname.to_string()))
    }

    async fn create_branch(&self, branch: &str, from: &str) -> Result<String, RepositoryError> {
        if let Some(head) = self.resolve(&format!("refs/heads/{}", branch)).await? {
            return Err(RepositoryError::BranchAlreadyExists {
                branch: branch.to_string(),
                head,
            });
        }

        self.run_ok(&["branch", branch, from]).await?;
        let head = self.head_commit(branch).await?;
        info!(%branch, %from, %head, "Branch created");
        Ok(head)
    }

    async fn checkout(&self, branch: &str) -> Result<(), RepositoryError> {
        self.run_ok(&["checkout", "--quiet", branch]).await?;
        Ok(())
    }

    async fn cherry_pick(&self, commit: &str) -> Result<CherryPickOutcome, RepositoryError> {
        if self.already_picked(commit).await? {
            debug!(%commit, "Commit already cherry-picked");
            return Ok(CherryPickOutcome::AlreadyApplied);
        }

        let output = self.run(&["cherry-pick", "-x", commit]).await?;
        if output.status.success() {
            let head = self.head_commit("HEAD").await?;
            return Ok(CherryPickOutcome::Applied { commit: head });
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();

        if stderr.contains("is now empty") || stdout.contains("nothing to commit") {
            self.run(&["cherry-pick", "--skip"]).await?;
            return Ok(CherryPickOutcome::AlreadyApplied);
        }

        if stderr.contains("CONFLICT") || stdout.contains("CONFLICT") || stderr.contains("could not apply") {
            if let Err(e) = self.run_ok(&["cherry-pick", "--abort"]).await {
                warn!(%commit, error = %e, "Failed to abort conflicting cherry-pick");
            }
            return Err(RepositoryError::Conflict {
                commit: commit.to_string(),
                details: first_line(&stdout, &stderr),
            });
        }

        Err(classify_failure(&["cherry-pick", "-x", commit], &output))
    }

    async fn commit_files(
        &self,
        files: &BTreeMap<String, String>,
        message: &str,
    ) -> Result<String, RepositoryError> {
        for (relative, content) in files {
            let path = self.work_tree.join(relative);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, content).await?;
            self.run_ok(&["add", "--", relative]).await?;
        }

        // Nothing staged means the content is already committed
        let staged = self.run(&["diff", "--cached", "--quiet"]).await?;
        if staged.status.success() {
            debug!("Release files unchanged; nothing to commit");
            return self.head_commit("HEAD").await;
        }

        self.run_ok(&["commit", "--quiet", "-m", message]).await?;
        self.head_commit("HEAD").await
    }

    async fn tag(&self, version: &ReleaseVersion, message: &str) -> Result<String, RepositoryError> {
        let tag = version.tag_name();
        if let Some(target) = self.tag_target(&tag).await? {
            return Err(RepositoryError::TagAlreadyExists { tag, target });
        }

        self.run_ok(&["tag", "-a", &tag, "-m", message]).await?;
        let target = self.head_commit("HEAD").await?;
        info!(%tag, %target, "Tag created");
        Ok(target)
    }

    async fn tag_target(&self, tag: &str) -> Result<Option<String>, RepositoryError> {
        self.resolve(&format!("refs/tags/{}", tag)).await
    }

    async fn push(&self, refname: &str) -> Result<(), RepositoryError> {
        self.run_ok(&["push", "--quiet", &self.remote, refname]).await?;
        info!(remote = %self.remote, %refname, "Pushed");
        Ok(())
    }

    async fn commits_between(
        &self,
        since_tag: &str,
        branch: &str,
    ) -> Result<Vec<CommitInfo>, RepositoryError> {
        let range = format!("{}..{}", since_tag, branch);
        let raw = self
            .run_ok(&[
                "log",
                "--reverse",
                "--no-merges",
                "--format=%H%x1f%an%x1f%at%x1f%ct%x1f%s%x1e",
                &range,
            ])
            .await?;

        Ok(parse_log(&raw))
    }
}

/// Parse `git log` output using unit (0x1f) / record (0x1e) separators
fn parse_log(raw: &str) -> Vec<CommitInfo> {
    raw.split('\u{1e}')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .filter_map(|record| {
            let fields: Vec<&str> = record.split('\u{1f}').collect();
            if fields.len() < 5 {
                return None;
            }
            Some(CommitInfo {
                id: fields[0].to_string(),
                author: fields[1].to_string(),
                authored_at: epoch(fields[2]),
                committed_at: epoch(fields[3]),
                summary: fields[4].to_string(),
            })
        })
        .collect()
}

fn epoch(raw: &str) -> DateTime<Utc> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_default()
}

fn first_line(stdout: &str, stderr: &str) -> String {
    stdout
        .lines()
        .chain(stderr.lines())
        .find(|l| l.contains("CONFLICT"))
        .or_else(|| stderr.lines().next())
        .unwrap_or("merge conflict")
        .trim()
        .to_string()
}

/// Separate network failures (retryable) from other git failures
fn classify_failure(args: &[&str], output: &Output) -> RepositoryError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let transport_markers = [
        "Could not resolve host",
        "unable to access",
        "Connection refused",
        "Connection timed out",
        "Connection reset",
        "early EOF",
        "remote end hung up",
    ];

    if transport_markers.iter().any(|m| stderr.contains(m)) {
        return RepositoryError::Transport(stderr);
    }

    RepositoryError::CommandFailed {
        command: args.first().copied().unwrap_or("").to_string(),
        stderr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_records() {
        let raw = "aaa\u{1f}Ana\u{1f}1700000000\u{1f}1700000100\u{1f}fix: one (#1)\u{1e}\n\
                   bbb\u{1f}Bo\u{1f}1700000050\u{1f}1700000200\u{1f}fix: two\u{1e}\n";
        let commits = parse_log(raw);
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].id, "aaa");
        assert_eq!(commits[0].author, "Ana");
        assert_eq!(commits[0].summary, "fix: one (#1)");
        assert_eq!(commits[1].committed_at.timestamp(), 1700000200);
    }

    #[test]
    fn test_parse_log_skips_malformed() {
        assert!(parse_log("garbage\u{1e}").is_empty());
        assert!(parse_log("").is_empty());
    }

    #[test]
    fn test_first_line_prefers_conflict_marker() {
        let stdout = "Auto-merging src/lib.rs\nCONFLICT (content): Merge conflict in src/lib.rs\n";
        assert_eq!(
            first_line(stdout, "error: could not apply abc"),
            "CONFLICT (content): Merge conflict in src/lib.rs"
        );
    }
}
