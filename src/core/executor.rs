//! Step execution: turns a checklist action into adapter calls.
//!
//! Every action is written so that re-running it after a crash converges on
//! the same end state instead of duplicating side effects. Existing branches,
//! tags and ledger entries that match what the step would have produced count
//! as success.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{
    wait_for_completion, CherryPickOutcome, PollPolicy, PublicationGateway, RepositoryAdapter,
    RepositoryError, TriggerRequest, WorkflowHandle,
};
use crate::domain::{ChangeRecord, ReleaseManifest};

use super::artifacts;
use super::error::StepError;
use super::graph::{Step, StepAction};
use super::ledger::{LedgerError, LedgerStore};
use super::run_store::RunStore;

/// Everything a step needs to execute one attempt
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: Uuid,
    pub step: Step,

    /// Manifest snapshot as of the moment the step was started
    pub manifest: ReleaseManifest,

    /// Artifacts produced by the step's direct dependencies
    pub dependency_artifacts: BTreeMap<String, Option<String>>,

    /// Key for deduplicating external side effects of this step
    pub idempotency_key: String,

    /// 1-based attempt number
    pub attempt: u32,
}

/// Result of a successful step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    /// Short reference to what the step produced (commit, tag, run URL)
    pub artifact: Option<String>,

    /// Change records to store on the manifest
    pub changes: Option<Vec<ChangeRecord>>,
}

impl StepOutcome {
    pub fn artifact(artifact: impl Into<String>) -> Self {
        Self {
            artifact: Some(artifact.into()),
            changes: None,
        }
    }
}

/// Executes the action behind a step
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, StepError>;
}

/// Executor for the patch-release checklist
pub struct ReleaseExecutor {
    repo: Arc<dyn RepositoryAdapter>,
    gateway: Option<Arc<dyn PublicationGateway>>,
    ledger: LedgerStore,
    run_store: Option<RunStore>,
    poll: PollPolicy,
}

impl ReleaseExecutor {
    pub fn new(repo: Arc<dyn RepositoryAdapter>, ledger: LedgerStore) -> Self {
        Self {
            repo,
            gateway: None,
            ledger,
            run_store: None,
            poll: PollPolicy::default(),
        }
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn PublicationGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Keep rendered files and in-flight workflow handles next to the run
    pub fn with_run_store(mut self, store: RunStore) -> Self {
        self.run_store = Some(store);
        self
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    async fn validate_version(&self, manifest: &ReleaseManifest) -> Result<StepOutcome, StepError> {
        if !manifest.version.same_line(&manifest.previous_version) {
            return Err(StepError::Validation(format!(
                "{} and {} are not on the same release line",
                manifest.version, manifest.previous_version
            )));
        }

        let ledger = self.ledger.load().await?;
        if ledger.is_released(&manifest.version) {
            return Err(LedgerError::DuplicateVersion(manifest.version).into());
        }

        let proposed = ledger.propose_patch(manifest.previous_version)?;
        if proposed != manifest.version {
            return Err(StepError::Validation(format!(
                "requested {} but the next patch after {} is {}",
                manifest.version, manifest.previous_version, proposed
            )));
        }

        Ok(StepOutcome::artifact(proposed.to_string()))
    }

    async fn create_branch(&self, manifest: &ReleaseManifest) -> Result<StepOutcome, StepError> {
        let branch = manifest.prepare_branch();
        let head = match self.repo.create_branch(&branch, &manifest.release_branch).await {
            Ok(head) => head,
            // The branch name carries the version, so an existing one is ours
            Err(RepositoryError::BranchAlreadyExists { head, .. }) => {
                info!(%branch, %head, "Preparation branch already exists");
                head
            }
            Err(e) => return Err(e.into()),
        };

        Ok(StepOutcome::artifact(format!("{}@{}", branch, head)))
    }

    async fn cherry_pick(&self, manifest: &ReleaseManifest) -> Result<StepOutcome, StepError> {
        self.repo.checkout(&manifest.prepare_branch()).await?;

        let mut applied = 0usize;
        let mut skipped = 0usize;
        for commit in &manifest.cherry_picks {
            match self.repo.cherry_pick(commit).await? {
                CherryPickOutcome::Applied { commit: new_commit } => {
                    debug!(%commit, %new_commit, "Cherry-picked");
                    applied += 1;
                }
                CherryPickOutcome::AlreadyApplied => {
                    debug!(%commit, "Already on preparation branch");
                    skipped += 1;
                }
            }
        }

        Ok(StepOutcome::artifact(format!(
            "{} applied, {} already present",
            applied, skipped
        )))
    }

    async fn collect_changes(&self, manifest: &ReleaseManifest) -> Result<StepOutcome, StepError> {
        let changes = artifacts::collect_changes(
            self.repo.as_ref(),
            &manifest.previous_version.tag_name(),
            &manifest.prepare_branch(),
        )
        .await?;

        Ok(StepOutcome {
            artifact: Some(format!("{} changes", changes.len())),
            changes: Some(changes),
        })
    }

    async fn render_artifacts(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        let manifest = &ctx.manifest;
        let files = artifacts::render(manifest);

        self.repo.checkout(&manifest.prepare_branch()).await?;
        let message = format!("chore(releasing): Prepare {} release", manifest.version.tag_name());
        let head = self.repo.commit_files(&files, &message).await?;

        if let Some(store) = &self.run_store {
            for (path, content) in &files {
                if let Err(e) = store.store_artifact(ctx.run_id, path, content).await {
                    warn!(%path, error = %e, "Failed to keep a copy of rendered file");
                }
            }
        }

        Ok(StepOutcome::artifact(head))
    }

    async fn tag(&self, manifest: &ReleaseManifest) -> Result<StepOutcome, StepError> {
        let branch = manifest.prepare_branch();
        let tag = manifest.version.tag_name();
        self.repo.checkout(&branch).await?;
        let expected = self.repo.head_commit(&branch).await?;

        let message = format!("Release {}", tag);
        let target = match self.repo.tag(&manifest.version, &message).await {
            Ok(target) => target,
            Err(RepositoryError::TagAlreadyExists { target, .. }) if target == expected => {
                info!(%tag, %target, "Tag already points at the release commit");
                target
            }
            Err(RepositoryError::TagAlreadyExists { target, .. }) => {
                return Err(StepError::Conflict(format!(
                    "tag {} already exists at {} but the release commit is {}",
                    tag, target, expected
                )));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(StepOutcome::artifact(format!("{}@{}", tag, target)))
    }

    async fn push(&self, manifest: &ReleaseManifest) -> Result<StepOutcome, StepError> {
        let refspec = format!("{}:{}", manifest.prepare_branch(), manifest.release_branch);
        let tag_ref = format!("refs/tags/{}", manifest.version.tag_name());

        self.repo.push(&refspec).await?;
        self.repo.push(&tag_ref).await?;

        Ok(StepOutcome::artifact(format!("{} {}", refspec, tag_ref)))
    }

    async fn commit_version(&self, manifest: &ReleaseManifest) -> Result<StepOutcome, StepError> {
        match self.ledger.commit(manifest.version).await {
            Ok(()) => {}
            Err(LedgerError::DuplicateVersion(version)) if version == manifest.version => {
                info!(%version, "Version already recorded");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(StepOutcome::artifact(manifest.version.to_string()))
    }

    async fn publish(&self, ctx: &StepContext, workflow: &str) -> Result<StepOutcome, StepError> {
        let gateway = self.gateway.as_ref().ok_or_else(|| {
            StepError::Validation(format!(
                "workflow '{}' requested but no publication gateway is configured",
                workflow
            ))
        })?;

        let request = TriggerRequest {
            workflow: workflow.to_string(),
            git_ref: ctx.manifest.version.tag_name(),
            version: ctx.manifest.version,
            idempotency_key: ctx.idempotency_key.clone(),
        };

        let handle = match self.earlier_handle(ctx, workflow).await {
            Some(handle) => {
                info!(%workflow, run = %handle.run_id, "Polling workflow triggered by an earlier attempt");
                handle
            }
            None => {
                let handle = gateway.trigger(&request).await?;
                info!(%workflow, run = %handle.run_id, "Workflow triggered");
                if let Some(store) = &self.run_store {
                    if let Err(e) = store.save_handle(ctx.run_id, &ctx.step.name, &handle).await {
                        warn!(%workflow, error = %e, "Failed to remember workflow handle");
                    }
                }
                handle
            }
        };

        wait_for_completion(gateway.as_ref(), &handle, &self.poll).await?;

        Ok(StepOutcome::artifact(
            handle.url.unwrap_or_else(|| format!("{}#{}", workflow, handle.run_id)),
        ))
    }

    /// Workflow run an interrupted attempt of this step already triggered
    async fn earlier_handle(&self, ctx: &StepContext, workflow: &str) -> Option<WorkflowHandle> {
        let store = self.run_store.as_ref()?;
        match store.load_handle::<WorkflowHandle>(ctx.run_id, &ctx.step.name).await {
            Ok(handle) => handle.filter(|h| h.workflow == workflow),
            Err(e) => {
                warn!(%workflow, error = %e, "Ignoring unreadable workflow handle");
                None
            }
        }
    }

    async fn backport(
        &self,
        manifest: &ReleaseManifest,
        target_branch: &str,
    ) -> Result<StepOutcome, StepError> {
        let tag = manifest.version.tag_name();
        let release_commit = self
            .repo
            .tag_target(&tag)
            .await?
            .ok_or_else(|| StepError::Validation(format!("tag {} does not exist", tag)))?;

        self.repo.checkout(target_branch).await?;
        let outcome = self.repo.cherry_pick(&release_commit).await?;
        self.repo.push(target_branch).await?;

        let artifact = match outcome {
            CherryPickOutcome::Applied { commit } => format!("{}@{}", target_branch, commit),
            CherryPickOutcome::AlreadyApplied => format!("{} (already present)", target_branch),
        };
        Ok(StepOutcome::artifact(artifact))
    }
}

#[async_trait]
impl StepExecutor for ReleaseExecutor {
    #[instrument(skip(self, ctx), fields(run_id = %ctx.run_id, step = %ctx.step.name, attempt = ctx.attempt))]
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        debug!(action = ctx.step.action.label(), "Executing step");
        let manifest = &ctx.manifest;

        match &ctx.step.action {
            StepAction::ValidateVersion => self.validate_version(manifest).await,
            StepAction::CreateBranch => self.create_branch(manifest).await,
            StepAction::CherryPick => self.cherry_pick(manifest).await,
            StepAction::CollectChanges => self.collect_changes(manifest).await,
            StepAction::RenderArtifacts => self.render_artifacts(ctx).await,
            StepAction::Tag => self.tag(manifest).await,
            StepAction::Push => self.push(manifest).await,
            StepAction::CommitVersion => self.commit_version(manifest).await,
            StepAction::Publish { workflow } => self.publish(ctx, workflow).await,
            StepAction::Backport { target_branch } => self.backport(manifest, target_branch).await,
        }
    }
}
