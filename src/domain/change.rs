//! Change records collected for a release.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One merged change being released. Immutable once captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Commit id on the release branch
    pub commit_id: String,

    /// First line of the commit message
    pub summary: String,

    /// Commit author name
    pub author: String,

    /// Pull request reference ("#1234"), if the summary carries one
    pub pr_reference: Option<String>,

    /// When the commit landed on the release branch
    pub committed_at: DateTime<Utc>,
}

impl ChangeRecord {
    /// Capture a change record, extracting the PR reference from the summary
    pub fn new(
        commit_id: impl Into<String>,
        summary: impl Into<String>,
        author: impl Into<String>,
        committed_at: DateTime<Utc>,
    ) -> Self {
        let summary = summary.into();
        let pr_reference = extract_pr_reference(&summary);
        Self {
            commit_id: commit_id.into(),
            summary,
            author: author.into(),
            pr_reference,
            committed_at,
        }
    }

    /// Abbreviated commit id (first 10 chars)
    pub fn short_id(&self) -> &str {
        let end = self
            .commit_id
            .char_indices()
            .nth(10)
            .map(|(i, _)| i)
            .unwrap_or(self.commit_id.len());
        &self.commit_id[..end]
    }
}

/// Pull a trailing "(#123)" out of a commit summary
pub fn extract_pr_reference(summary: &str) -> Option<String> {
    let trimmed = summary.trim_end();
    let inner = trimmed.strip_suffix(')')?;
    let start = inner.rfind("(#")?;
    let digits = &inner[start + 2..];

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    Some(format!("#{}", digits))
}
