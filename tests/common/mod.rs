//! Shared fixtures for integration tests: an in-memory repository, a scripted
//! CI gateway and a scripted step executor.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use release_engine::adapters::{
    CherryPickOutcome, CommitInfo, GatewayError, PublicationGateway, RepositoryAdapter,
    RepositoryError, TriggerRequest, WorkflowHandle, WorkflowState, WorkflowStatus,
};
use release_engine::core::{StepContext, StepError, StepExecutor, StepOutcome};
use release_engine::domain::{ReleaseManifest, ReleaseVersion};

pub const RELEASE_BRANCH: &str = "release-0.19";
pub const BASE_COMMIT: &str = "base0000000000";

pub fn manifest() -> ReleaseManifest {
    ReleaseManifest::new(
        ReleaseVersion::new(0, 19, 4),
        ReleaseVersion::new(0, 19, 3),
        RELEASE_BRANCH,
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
    )
}

fn at(offset: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + offset * 60, 0).unwrap()
}

#[derive(Default)]
struct RepoState {
    branches: BTreeMap<String, Vec<String>>,
    commits: BTreeMap<String, CommitInfo>,
    tags: BTreeMap<String, String>,
    files: BTreeMap<String, String>,
    checked_out: Option<String>,
    picked: BTreeSet<(String, String)>,
    conflicting: BTreeSet<String>,
    pushed: Vec<String>,
    push_failures: usize,
    next_id: usize,
    tag_calls: usize,
}

impl RepoState {
    fn new_commit(&mut self, summary: &str, author: &str) -> String {
        self.next_id += 1;
        let id = format!("c{:013}", self.next_id);
        let info = CommitInfo {
            id: id.clone(),
            summary: summary.to_string(),
            author: author.to_string(),
            authored_at: at(self.next_id as i64),
            committed_at: at(self.next_id as i64),
        };
        self.commits.insert(id.clone(), info);
        id
    }

    fn head(&self) -> Result<String, RepositoryError> {
        let branch = self
            .checked_out
            .as_ref()
            .ok_or_else(|| RepositoryError::NotFound("HEAD".to_string()))?;
        self.branch_head(branch)
    }

    fn branch_head(&self, branch: &str) -> Result<String, RepositoryError> {
        self.branches
            .get(branch)
            .and_then(|h| h.last().cloned())
            .ok_or_else(|| RepositoryError::NotFound(branch.to_string()))
    }

    fn checked_out_history(&mut self) -> Result<&mut Vec<String>, RepositoryError> {
        let branch = self
            .checked_out
            .clone()
            .ok_or_else(|| RepositoryError::NotFound("HEAD".to_string()))?;
        self.branches
            .get_mut(&branch)
            .ok_or(RepositoryError::NotFound(branch))
    }
}

/// In-memory repository with a release branch tagged at the previous version
#[derive(Default)]
pub struct FakeRepository {
    state: Mutex<RepoState>,
}

impl FakeRepository {
    pub fn new() -> Self {
        let mut state = RepoState::default();
        state.commits.insert(
            BASE_COMMIT.to_string(),
            CommitInfo {
                id: BASE_COMMIT.to_string(),
                summary: "chore(releasing): Prepare v0.19.3 release".to_string(),
                author: "Release Bot".to_string(),
                authored_at: at(0),
                committed_at: at(0),
            },
        );
        state
            .branches
            .insert(RELEASE_BRANCH.to_string(), vec![BASE_COMMIT.to_string()]);
        state
            .branches
            .insert("master".to_string(), vec![BASE_COMMIT.to_string()]);
        state.tags.insert("v0.19.3".to_string(), BASE_COMMIT.to_string());
        Self {
            state: Mutex::new(state),
        }
    }

    /// Add a commit to `master` that can be cherry-picked
    pub fn add_mainline_commit(&self, summary: &str, author: &str) -> String {
        let mut state = self.state.lock().unwrap();
        let id = state.new_commit(summary, author);
        state.branches.entry("master".to_string()).or_default().push(id.clone());
        id
    }

    pub fn mark_conflicting(&self, commit: &str) {
        self.state.lock().unwrap().conflicting.insert(commit.to_string());
    }

    pub fn fail_pushes(&self, times: usize) {
        self.state.lock().unwrap().push_failures = times;
    }

    /// Create a tag directly, bypassing the adapter
    pub fn force_tag(&self, tag: &str, target: &str) {
        self.state
            .lock()
            .unwrap()
            .tags
            .insert(tag.to_string(), target.to_string());
    }

    pub fn tags(&self) -> BTreeMap<String, String> {
        self.state.lock().unwrap().tags.clone()
    }

    pub fn tag_calls(&self) -> usize {
        self.state.lock().unwrap().tag_calls
    }

    pub fn pushed(&self) -> Vec<String> {
        self.state.lock().unwrap().pushed.clone()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn branch(&self, name: &str) -> Option<Vec<String>> {
        self.state.lock().unwrap().branches.get(name).cloned()
    }
}

#[async_trait]
impl RepositoryAdapter for FakeRepository {
    fn name(&self) -> &str {
        "fake"
    }

    async fn head_commit(&self, refname: &str) -> Result<String, RepositoryError> {
        let state = self.state.lock().unwrap();
        if refname == "HEAD" {
            return state.head();
        }
        if let Some(target) = state.tags.get(refname) {
            return Ok(target.clone());
        }
        state.branch_head(refname)
    }

    async fn create_branch(&self, branch: &str, from: &str) -> Result<String, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        if let Ok(head) = state.branch_head(branch) {
            return Err(RepositoryError::BranchAlreadyExists {
                branch: branch.to_string(),
                head,
            });
        }
        let history = state
            .branches
            .get(from)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(from.to_string()))?;
        let head = history.last().cloned().unwrap_or_default();
        state.branches.insert(branch.to_string(), history);
        Ok(head)
    }

    async fn checkout(&self, branch: &str) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        if !state.branches.contains_key(branch) {
            return Err(RepositoryError::NotFound(branch.to_string()));
        }
        state.checked_out = Some(branch.to_string());
        Ok(())
    }

    async fn cherry_pick(&self, commit: &str) -> Result<CherryPickOutcome, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        if state.conflicting.contains(commit) {
            return Err(RepositoryError::Conflict {
                commit: commit.to_string(),
                details: "CONFLICT (content): Merge conflict in src/lib.rs".to_string(),
            });
        }

        let branch = state
            .checked_out
            .clone()
            .ok_or_else(|| RepositoryError::NotFound("HEAD".to_string()))?;
        if state.picked.contains(&(branch.clone(), commit.to_string())) {
            return Ok(CherryPickOutcome::AlreadyApplied);
        }

        let source = state
            .commits
            .get(commit)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(commit.to_string()))?;
        let new_commit = state.new_commit(&source.summary, &source.author);
        state.checked_out_history()?.push(new_commit.clone());
        state.picked.insert((branch, commit.to_string()));
        Ok(CherryPickOutcome::Applied { commit: new_commit })
    }

    async fn commit_files(
        &self,
        files: &BTreeMap<String, String>,
        message: &str,
    ) -> Result<String, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let unchanged = files.iter().all(|(path, content)| state.files.get(path) == Some(content));
        if unchanged {
            return state.head();
        }

        for (path, content) in files {
            state.files.insert(path.clone(), content.clone());
        }
        let commit = state.new_commit(message, "Release Bot");
        state.checked_out_history()?.push(commit.clone());
        Ok(commit)
    }

    async fn tag(&self, version: &ReleaseVersion, _message: &str) -> Result<String, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        state.tag_calls += 1;
        let tag = version.tag_name();
        if let Some(target) = state.tags.get(&tag) {
            return Err(RepositoryError::TagAlreadyExists {
                tag,
                target: target.clone(),
            });
        }
        let head = state.head()?;
        state.tags.insert(tag, head.clone());
        Ok(head)
    }

    async fn tag_target(&self, tag: &str) -> Result<Option<String>, RepositoryError> {
        Ok(self.state.lock().unwrap().tags.get(tag).cloned())
    }

    async fn push(&self, refname: &str) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        if state.push_failures > 0 {
            state.push_failures -= 1;
            return Err(RepositoryError::Transport(
                "fatal: the remote end hung up unexpectedly".to_string(),
            ));
        }
        state.pushed.push(refname.to_string());
        Ok(())
    }

    async fn commits_between(
        &self,
        since_tag: &str,
        branch: &str,
    ) -> Result<Vec<CommitInfo>, RepositoryError> {
        let state = self.state.lock().unwrap();
        let base = state
            .tags
            .get(since_tag)
            .ok_or_else(|| RepositoryError::NotFound(since_tag.to_string()))?;
        let history = state
            .branches
            .get(branch)
            .ok_or_else(|| RepositoryError::NotFound(branch.to_string()))?;

        let start = history.iter().position(|c| c == base).map(|i| i + 1).unwrap_or(0);
        Ok(history[start..]
            .iter()
            .filter_map(|id| state.commits.get(id).cloned())
            .collect())
    }
}

/// CI gateway that reports `pending` once, then the scripted final state
#[derive(Default)]
pub struct FakeGateway {
    outcomes: Mutex<HashMap<String, WorkflowState>>,
    triggers: Mutex<Vec<TriggerRequest>>,
    polls: AtomicUsize,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outcome(self, workflow: &str, state: WorkflowState) -> Self {
        self.outcomes
            .lock()
            .unwrap()
            .insert(workflow.to_string(), state);
        self
    }

    pub fn triggers(&self) -> Vec<TriggerRequest> {
        self.triggers.lock().unwrap().clone()
    }
}

#[async_trait]
impl PublicationGateway for FakeGateway {
    fn name(&self) -> &str {
        "fake-ci"
    }

    async fn trigger(&self, request: &TriggerRequest) -> Result<WorkflowHandle, GatewayError> {
        let mut triggers = self.triggers.lock().unwrap();
        triggers.push(request.clone());
        Ok(WorkflowHandle {
            workflow: request.workflow.clone(),
            run_id: triggers.len().to_string(),
            url: Some(format!("https://ci.example.com/runs/{}", triggers.len())),
        })
    }

    async fn poll(&self, handle: &WorkflowHandle) -> Result<WorkflowStatus, GatewayError> {
        if self.polls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            return Ok(WorkflowStatus {
                state: WorkflowState::Pending,
                logs_url: None,
            });
        }

        let state = self
            .outcomes
            .lock()
            .unwrap()
            .get(&handle.workflow)
            .copied()
            .unwrap_or(WorkflowState::Succeeded);
        Ok(WorkflowStatus {
            state,
            logs_url: Some(format!("https://ci.example.com/runs/{}/logs", handle.run_id)),
        })
    }
}

/// Executor whose outcomes are scripted per step; unscripted attempts succeed
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Result<StepOutcome, StepError>>>>,
    calls: Mutex<Vec<(String, u32)>>,
    delay: Option<Duration>,
    step_delays: HashMap<String, Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every execution for `delay` (to observe concurrency)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Hold executions of one step for `delay`
    pub fn with_step_delay(mut self, step: &str, delay: Duration) -> Self {
        self.step_delays.insert(step.to_string(), delay);
        self
    }

    pub fn script(self, step: &str, results: Vec<Result<StepOutcome, StepError>>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(step.to_string(), results.into());
        self
    }

    pub fn calls(&self) -> Vec<(String, u32)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, step: &str) -> usize {
        self.calls().iter().filter(|(name, _)| name == step).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        self.calls
            .lock()
            .unwrap()
            .push((ctx.step.name.clone(), ctx.attempt));

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.step_delays.get(&ctx.step.name).copied().or(self.delay) {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&ctx.step.name)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| Ok(StepOutcome::artifact(format!("{}-done", ctx.step.name))))
    }
}

/// Wraps an executor; after running `step` once it never returns, as if the
/// process died right after the side effect
pub struct CrashAfter {
    pub inner: Arc<dyn StepExecutor>,
    pub step: String,
}

#[async_trait]
impl StepExecutor for CrashAfter {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        let result = self.inner.execute(ctx).await;
        if ctx.step.name == self.step {
            std::future::pending::<()>().await;
        }
        result
    }
}
