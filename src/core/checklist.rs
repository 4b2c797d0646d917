//! The patch-release checklist as a step graph.

use serde::{Deserialize, Serialize};

use crate::domain::ReleaseManifest;

use super::error::GraphError;
use super::graph::{Step, StepAction, StepGraph};

pub const VALIDATE_VERSION: &str = "validate-version";
pub const PREPARE_BRANCH: &str = "prepare-branch";
pub const CHERRY_PICK: &str = "cherry-pick";
pub const COLLECT_CHANGES: &str = "collect-changes";
pub const RENDER_ARTIFACTS: &str = "render-artifacts";
pub const TAG_RELEASE: &str = "tag-release";
pub const PUSH_RELEASE: &str = "push-release";
pub const RECORD_VERSION: &str = "record-version";
pub const BACKPORT_CHANGELOG: &str = "backport-changelog";

/// Optional parts of the checklist
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistSettings {
    /// External workflows to trigger once the release is pushed
    #[serde(default)]
    pub workflows: Vec<String>,

    /// Branch that receives the release commit afterwards (e.g. "master")
    #[serde(default)]
    pub backport_branch: Option<String>,
}

/// Name of the publish step for a workflow
pub fn publish_step_name(workflow: &str) -> String {
    format!("publish:{}", workflow)
}

/// Build the finalized checklist graph for one release
pub fn release_checklist(
    manifest: &ReleaseManifest,
    settings: &ChecklistSettings,
) -> Result<StepGraph, GraphError> {
    let scope = manifest.version.to_string();
    let mut graph = StepGraph::new();

    graph.add_step(Step::new(VALIDATE_VERSION, StepAction::ValidateVersion, &scope))?;
    graph.add_step(Step::new(PREPARE_BRANCH, StepAction::CreateBranch, &scope).depends_on(VALIDATE_VERSION))?;
    graph.add_step(Step::new(CHERRY_PICK, StepAction::CherryPick, &scope).depends_on(PREPARE_BRANCH))?;
    graph.add_step(Step::new(COLLECT_CHANGES, StepAction::CollectChanges, &scope).depends_on(CHERRY_PICK))?;
    graph.add_step(Step::new(RENDER_ARTIFACTS, StepAction::RenderArtifacts, &scope).depends_on(COLLECT_CHANGES))?;
    graph.add_step(Step::new(TAG_RELEASE, StepAction::Tag, &scope).depends_on(RENDER_ARTIFACTS))?;
    graph.add_step(Step::new(PUSH_RELEASE, StepAction::Push, &scope).depends_on(TAG_RELEASE))?;
    graph.add_step(Step::new(RECORD_VERSION, StepAction::CommitVersion, &scope).depends_on(PUSH_RELEASE))?;

    for workflow in &settings.workflows {
        let action = StepAction::Publish {
            workflow: workflow.clone(),
        };
        graph.add_step(Step::new(publish_step_name(workflow), action, &scope).depends_on(PUSH_RELEASE))?;
    }

    if let Some(target) = &settings.backport_branch {
        let action = StepAction::Backport {
            target_branch: target.clone(),
        };
        graph.add_step(Step::new(BACKPORT_CHANGELOG, action, &scope).depends_on(PUSH_RELEASE))?;
    }

    graph.finalize()?;
    Ok(graph)
}
