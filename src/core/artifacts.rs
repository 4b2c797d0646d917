//! Artifact generator: change collection and release file rendering.
//!
//! `render` is a pure function of the manifest. Re-rendering the same
//! manifest must reproduce prior output byte for byte, so nothing here may
//! read the clock, the environment, or hash-ordered collections.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::Serialize;

use crate::adapters::{RepositoryAdapter, RepositoryError};
use crate::domain::{ChangeRecord, ReleaseManifest, ReleaseVersion};

/// Rendered files: relative path -> content
pub type RenderedFiles = BTreeMap<String, String>;

/// Changelog record path for a version
pub fn changelog_path(version: &ReleaseVersion) -> String {
    format!("changelog.d/{}.md", version.tag_name())
}

/// Machine-readable manifest path for a version
pub fn manifest_path(version: &ReleaseVersion) -> String {
    format!("release/{}.json", version.tag_name())
}

/// Version string read by the install script
pub const INSTALL_VERSION_PATH: &str = "distribution/install/VERSION";

/// Collect the changes on `branch` since `since_tag`
///
/// Oldest first, in the order the commits were applied to the branch. The
/// adapter reports that order; commit timestamps are not re-sorted because
/// commits cherry-picked in one pass usually share a committer second.
pub async fn collect_changes(
    repo: &dyn RepositoryAdapter,
    since_tag: &str,
    branch: &str,
) -> Result<Vec<ChangeRecord>, RepositoryError> {
    let commits = repo.commits_between(since_tag, branch).await?;

    Ok(commits
        .into_iter()
        .map(|c| ChangeRecord::new(c.id, c.summary, c.author, c.committed_at))
        .collect())
}

#[derive(Serialize)]
struct ManifestDocument<'a> {
    version: String,
    tag: String,
    previous_version: String,
    release_branch: &'a str,
    release_date: String,
    description: Option<&'a str>,
    changes: Vec<ChangeDocument<'a>>,
}

#[derive(Serialize)]
struct ChangeDocument<'a> {
    commit_id: &'a str,
    summary: &'a str,
    author: &'a str,
    pr_reference: Option<&'a str>,
}

/// Render every release file for `manifest`
pub fn render(manifest: &ReleaseManifest) -> RenderedFiles {
    let mut files = RenderedFiles::new();
    files.insert(changelog_path(&manifest.version), render_changelog(manifest));
    files.insert(manifest_path(&manifest.version), render_manifest(manifest));
    files.insert(INSTALL_VERSION_PATH.to_string(), format!("{}\n", manifest.version));
    files
}

fn render_changelog(manifest: &ReleaseManifest) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "# {} ({})",
        manifest.version.tag_name(),
        manifest.release_date.format("%Y-%m-%d")
    );
    out.push('\n');

    if let Some(description) = manifest.description.as_deref().map(str::trim) {
        if !description.is_empty() {
            out.push_str(description);
            out.push_str("\n\n");
        }
    }

    let _ = writeln!(
        out,
        "## Changes since {}",
        manifest.previous_version.tag_name()
    );
    out.push('\n');

    if manifest.changes.is_empty() {
        out.push_str("_No changes._\n");
        return out;
    }

    for change in &manifest.changes {
        let _ = writeln!(
            out,
            "- {} ({}, {})",
            change.summary.trim(),
            change.short_id(),
            change.author
        );
    }

    out
}

fn render_manifest(manifest: &ReleaseManifest) -> String {
    let document = ManifestDocument {
        version: manifest.version.to_string(),
        tag: manifest.version.tag_name(),
        previous_version: manifest.previous_version.to_string(),
        release_branch: &manifest.release_branch,
        release_date: manifest.release_date.format("%Y-%m-%d").to_string(),
        description: manifest.description.as_deref(),
        changes: manifest
            .changes
            .iter()
            .map(|c| ChangeDocument {
                commit_id: &c.commit_id,
                summary: &c.summary,
                author: &c.author,
                pr_reference: c.pr_reference.as_deref(),
            })
            .collect(),
    };

    // Serializing plain structs of strings cannot fail
    let mut json = serde_json::to_string_pretty(&document).unwrap_or_default();
    json.push('\n');
    json
}
