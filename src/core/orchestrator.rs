//! Release orchestrator.
//!
//! Drives a `ReleaseRun` through the step graph: computes ready steps, runs
//! them (independent steps concurrently, bounded by `parallelism`), applies
//! retry policy and failure propagation, and persists the run after every
//! transition. Every persisted write is compare-and-set; when another process
//! got there first the run is reloaded, results of steps that already executed
//! are reapplied onto the fresher state, and advancement continues.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    Event, EventType, ReleaseManifest, ReleaseRun, RunStatus, SkipReason, StepExecutionRecord,
    StepStatus,
};

use super::error::{OrchestratorError, StepError};
use super::executor::{StepContext, StepExecutor, StepOutcome};
use super::graph::StepGraph;
use super::retry::RetryPolicy;
use super::run_store::{generate_idempotency_key, RunStore, StoreError};

type StepResult = (Result<StepOutcome, StepError>, Duration);

/// A finished step execution waiting to be persisted
struct Settled {
    step: String,
    result: Result<StepOutcome, StepError>,
    elapsed: Duration,
}

/// Tunables for step execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Retry policy for transient step failures
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Maximum number of steps executing at once
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

fn default_parallelism() -> usize {
    4
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            parallelism: default_parallelism(),
        }
    }
}

/// Main release orchestrator
pub struct Orchestrator {
    graph: StepGraph,
    store: RunStore,
    executor: Arc<dyn StepExecutor>,
    options: ExecutionOptions,
}

impl Orchestrator {
    pub fn new(graph: StepGraph, store: RunStore, executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            graph,
            store,
            executor,
            options: ExecutionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn graph(&self) -> &StepGraph {
        &self.graph
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Create and persist a new run with every step pending
    #[instrument(skip(self, manifest), fields(version = %manifest.version, branch = %manifest.release_branch))]
    pub async fn start(&self, manifest: ReleaseManifest) -> Result<ReleaseRun, OrchestratorError> {
        if !self.graph.is_finalized() {
            return Err(OrchestratorError::GraphNotFinalized);
        }

        let mut run = ReleaseRun::new(Uuid::new_v4(), manifest, self.graph.step_names());
        match self.store.create(&mut run).await {
            Ok(()) => {}
            Err(StoreError::ActiveRunExists { branch, run_id }) => {
                return Err(OrchestratorError::ActiveRunExists { branch, run_id });
            }
            Err(e) => return Err(e.into()),
        }

        info!(run_id = %run.run_id, steps = self.graph.len(), "Release run started");
        self.store
            .append(&Event::for_run(
                run.run_id,
                EventType::RunStarted,
                format!("Release {} prepared", run.manifest.version.tag_name()),
                StepStatus::Pending,
            ))
            .await?;

        Ok(run)
    }

    /// Load a run by id
    pub async fn status(&self, run_id: Uuid) -> Result<ReleaseRun, OrchestratorError> {
        self.load(run_id).await
    }

    /// Persisted runs, newest first
    pub async fn list_runs(&self, limit: Option<usize>) -> Result<Vec<ReleaseRun>, OrchestratorError> {
        Ok(self.store.load_recent(limit).await?)
    }

    /// Execute every step that can run until nothing more is ready
    ///
    /// Advancing a terminal run changes nothing. On return the run holds the
    /// latest persisted state.
    #[instrument(skip(self, run), fields(run_id = %run.run_id))]
    pub async fn advance(&self, run: &mut ReleaseRun) -> Result<(), OrchestratorError> {
        if !self.graph.is_finalized() {
            return Err(OrchestratorError::GraphNotFinalized);
        }

        loop {
            match self.advance_once(run).await {
                Err(OrchestratorError::Store(StoreError::StaleRunState { expected, actual, .. })) => {
                    warn!(expected, actual, "Run changed underneath us; reloading");
                    *run = self.load(run.run_id).await?;
                }
                other => return other,
            }
        }
    }

    /// Pick a run back up after a crash or operator intervention
    ///
    /// Steps left `running` by a dead process are reset to `pending` and
    /// executed again; their actions are idempotent.
    #[instrument(skip(self))]
    pub async fn resume(&self, run_id: Uuid) -> Result<ReleaseRun, OrchestratorError> {
        let mut reset = Vec::new();
        let mut run = self
            .mutate(run_id, |run| {
                reset = run.reset_interrupted();
                !reset.is_empty()
            })
            .await?;

        if run.is_terminal() {
            info!(status = %run.overall_status, "Run already finished; nothing to resume");
            return Ok(run);
        }

        for step in &reset {
            warn!(%step, "Step was interrupted; resetting to pending");
            self.store
                .append(&Event::new(
                    run_id,
                    Some(step.clone()),
                    EventType::StepReset,
                    self.step_key(run_id, step),
                    format!("Step '{}' was interrupted and will run again", step),
                    StepStatus::Pending,
                ))
                .await?;
        }
        self.store
            .append(&Event::for_run(
                run_id,
                EventType::RunResumed,
                format!("Resumed with {} interrupted step(s)", reset.len()),
                StepStatus::Running,
            ))
            .await?;

        self.advance(&mut run).await?;
        Ok(run)
    }

    /// Stop a run: every unfinished step becomes skipped and the run terminal
    ///
    /// Side effects of steps already executing are not rolled back.
    #[instrument(skip(self))]
    pub async fn cancel(&self, run_id: Uuid) -> Result<ReleaseRun, OrchestratorError> {
        let mut cancelled = Vec::new();
        let mut changed = false;
        let run = self
            .mutate(run_id, |run| {
                changed = !run.is_terminal();
                if changed {
                    cancelled = run.cancel();
                }
                changed
            })
            .await?;

        if !changed {
            info!(status = %run.overall_status, "Run already finished; nothing to cancel");
            return Ok(run);
        }

        for step in &cancelled {
            self.store
                .append(&Event::new(
                    run_id,
                    Some(step.clone()),
                    EventType::StepSkipped,
                    self.step_key(run_id, step),
                    format!("Step '{}' skipped: run cancelled", step),
                    StepStatus::Skipped,
                ))
                .await?;
        }
        self.store
            .append(&Event::for_run(
                run_id,
                EventType::RunCancelled,
                format!("Run cancelled; {} step(s) skipped", cancelled.len()),
                StepStatus::Skipped,
            ))
            .await?;

        info!(skipped = cancelled.len(), "Run cancelled");
        Ok(run)
    }

    async fn load(&self, run_id: Uuid) -> Result<ReleaseRun, OrchestratorError> {
        match self.store.load(run_id).await {
            Ok(run) => Ok(run),
            Err(StoreError::NotFound(id)) => Err(OrchestratorError::RunNotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Load, modify and save a run, retrying on compare-and-set conflicts
    ///
    /// `f` returns whether it changed anything; unchanged runs are not written.
    async fn mutate<F>(&self, run_id: Uuid, mut f: F) -> Result<ReleaseRun, OrchestratorError>
    where
        F: FnMut(&mut ReleaseRun) -> bool,
    {
        loop {
            let mut run = self.load(run_id).await?;
            if !f(&mut run) {
                return Ok(run);
            }

            match self.store.save(&mut run).await {
                Ok(()) => return Ok(run),
                Err(StoreError::StaleRunState { expected, actual, .. }) => {
                    debug!(expected, actual, "Conflicting write; retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn step_key(&self, run_id: Uuid, step_name: &str) -> String {
        let input = self
            .graph
            .step(step_name)
            .map(|s| s.idempotency_key.as_str())
            .unwrap_or(step_name);
        generate_idempotency_key(run_id, step_name, input)
    }

    async fn advance_once(&self, run: &mut ReleaseRun) -> Result<(), OrchestratorError> {
        if run.is_terminal() {
            debug!(status = %run.overall_status, "Run is terminal; nothing to advance");
            return Ok(());
        }

        for name in self.graph.step_names() {
            run.step_records
                .entry(name.to_string())
                .or_insert_with(|| StepExecutionRecord::new(name));
        }

        let parallelism = self.options.parallelism.max(1);

        loop {
            let batch: Vec<String> = self
                .graph
                .ready_steps(&run.step_records)
                .into_iter()
                .take(parallelism)
                .collect();
            if batch.is_empty() {
                break;
            }

            let handles = self.launch(run, &batch).await?;

            let mut settled = Vec::with_capacity(handles.len());
            for (step, handle) in handles {
                let (result, elapsed) = match handle.await {
                    Ok(result) => result,
                    Err(e) => (
                        Err(StepError::External(format!("step task aborted: {}", e))),
                        Duration::ZERO,
                    ),
                };
                settled.push(Settled { step, result, elapsed });
            }

            self.commit_batch(run, &settled).await?;
        }

        let before = run.overall_status;
        run.refresh_status();
        if run.overall_status != before {
            self.store.save(run).await?;
        }
        if run.is_terminal() {
            self.finish(run).await?;
        }

        Ok(())
    }

    /// Mark `batch` running, persist, then spawn their executions
    async fn launch(
        &self,
        run: &mut ReleaseRun,
        batch: &[String],
    ) -> Result<Vec<(String, JoinHandle<StepResult>)>, OrchestratorError> {
        let now = Utc::now();
        for name in batch {
            if let Some(step) = self.graph.step(name) {
                if step.action.freezes_manifest() && !run.manifest.is_frozen() {
                    debug!(step = %name, "Freezing release manifest");
                    run.manifest.freeze();
                }
            }
            if let Some(record) = run.record_mut(name) {
                record.status = StepStatus::Running;
                record.started_at = Some(now);
                record.finished_at = None;
            }
        }
        self.store.save(run).await?;

        let mut handles = Vec::with_capacity(batch.len());
        for name in batch {
            let step = self
                .graph
                .step(name)
                .cloned()
                .ok_or_else(|| OrchestratorError::UnknownStep(name.clone()))?;
            let failed_attempts = run.record(name).map(|r| r.attempt_count).unwrap_or(0);
            let attempt = failed_attempts + 1;

            let dependency_artifacts: BTreeMap<String, Option<String>> = step
                .dependencies
                .iter()
                .map(|dep| (dep.clone(), run.record(dep).and_then(|r| r.artifact.clone())))
                .collect();

            let ctx = StepContext {
                run_id: run.run_id,
                idempotency_key: self.step_key(run.run_id, name),
                manifest: run.manifest.clone(),
                dependency_artifacts,
                attempt,
                step,
            };

            self.store
                .append(
                    &Event::new(
                        run.run_id,
                        Some(name.clone()),
                        EventType::StepStarted,
                        ctx.idempotency_key.clone(),
                        format!("Step '{}' attempt {}", name, attempt),
                        StepStatus::Running,
                    )
                    .with_attempt(attempt),
                )
                .await?;

            let delay = if failed_attempts > 0 {
                self.options.retry.delay_for_attempt(failed_attempts)
            } else {
                Duration::ZERO
            };
            let executor = Arc::clone(&self.executor);

            info!(step = %name, attempt, ?delay, "Executing step");
            let handle = tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let started = Instant::now();
                let result = executor.execute(&ctx).await;
                (result, started.elapsed())
            });
            handles.push((name.clone(), handle));
        }

        Ok(handles)
    }

    /// Persist the results of an executed batch
    ///
    /// Losing the compare-and-set reloads the run and reapplies the results
    /// onto the fresh snapshot. Steps the fresh snapshot already settled (for
    /// example by cancellation) keep their persisted state.
    async fn commit_batch(&self, run: &mut ReleaseRun, settled: &[Settled]) -> Result<(), OrchestratorError> {
        loop {
            let mut events = Vec::new();
            let mut applied = 0usize;
            for item in settled {
                let open = !run.is_terminal()
                    && run.record(&item.step).is_some_and(|r| !r.status.is_terminal());
                if !open {
                    debug!(step = %item.step, "Step already settled in persisted state; dropping result");
                    continue;
                }
                self.apply_result(run, &item.step, &item.result, item.elapsed, &mut events);
                applied += 1;
            }
            if applied == 0 {
                return Ok(());
            }

            run.refresh_status();
            match self.store.save(run).await {
                Ok(()) => {
                    for event in &events {
                        self.store.append(event).await?;
                    }
                    return Ok(());
                }
                Err(StoreError::StaleRunState { expected, actual, .. }) => {
                    warn!(expected, actual, "Run changed while steps executed; reapplying results");
                    *run = self.load(run.run_id).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn apply_result(
        &self,
        run: &mut ReleaseRun,
        name: &str,
        result: &Result<StepOutcome, StepError>,
        elapsed: Duration,
        events: &mut Vec<Event>,
    ) {
        let run_id = run.run_id;
        let key = self.step_key(run_id, name);
        let duration_ms = elapsed.as_millis() as u64;

        // (retryable, message) on failure
        let result: Result<Option<String>, (bool, String)> = match result {
            Ok(outcome) => match outcome.changes.clone() {
                Some(changes) => run
                    .manifest
                    .set_changes(changes)
                    .map(|_| outcome.artifact.clone())
                    .map_err(|frozen| {
                        let e = StepError::from(frozen);
                        (e.is_retryable(), e.to_string())
                    }),
                None => Ok(outcome.artifact.clone()),
            },
            Err(e) => Err((e.is_retryable(), e.to_string())),
        };

        let Some(record) = run.record_mut(name) else {
            return;
        };
        let attempt = record.attempt_count + 1;

        match result {
            Ok(artifact) => {
                info!(step = %name, attempt, duration_ms, "Step succeeded");
                record.status = StepStatus::Succeeded;
                record.artifact = artifact;
                record.last_error = None;
                record.finished_at = Some(Utc::now());
                events.push(
                    Event::new(
                        run_id,
                        Some(name.to_string()),
                        EventType::StepSucceeded,
                        key,
                        record
                            .artifact
                            .clone()
                            .unwrap_or_else(|| format!("Step '{}' succeeded", name)),
                        StepStatus::Succeeded,
                    )
                    .with_attempt(attempt)
                    .with_duration(duration_ms),
                );
            }
            Err((retryable, message)) => {
                record.attempt_count = attempt;
                record.last_error = Some(message.clone());

                if retryable && self.options.retry.should_retry(attempt) {
                    warn!(step = %name, attempt, error = %message, "Step failed; will retry");
                    record.status = StepStatus::Pending;
                    events.push(
                        Event::new(
                            run_id,
                            Some(name.to_string()),
                            EventType::StepRetrying,
                            key,
                            format!("Step '{}' attempt {} failed; retrying", name, attempt),
                            StepStatus::Pending,
                        )
                        .with_attempt(attempt)
                        .with_duration(duration_ms)
                        .with_error(message),
                    );
                    return;
                }

                error!(step = %name, attempt, error = %message, "Step failed");
                record.status = StepStatus::Failed;
                record.finished_at = Some(Utc::now());
                events.push(
                    Event::new(
                        run_id,
                        Some(name.to_string()),
                        EventType::StepFailed,
                        key,
                        format!("Step '{}' failed after {} attempt(s)", name, attempt),
                        StepStatus::Failed,
                    )
                    .with_attempt(attempt)
                    .with_duration(duration_ms)
                    .with_error(message),
                );

                self.block_dependents(run, name, events);
            }
        }
    }

    /// Skip every pending step that transitively depends on `failed`
    fn block_dependents(&self, run: &mut ReleaseRun, failed: &str, events: &mut Vec<Event>) {
        let now = Utc::now();
        for dependent in self.graph.dependents_of(failed) {
            let key = self.step_key(run.run_id, &dependent);
            let Some(record) = run.record_mut(&dependent) else {
                continue;
            };
            if record.status != StepStatus::Pending {
                continue;
            }

            record.status = StepStatus::Skipped;
            record.skip_reason = Some(SkipReason::Blocked {
                by: failed.to_string(),
            });
            record.finished_at = Some(now);
            debug!(step = %dependent, blocked_by = %failed, "Step skipped");
            events.push(Event::new(
                run.run_id,
                Some(dependent.clone()),
                EventType::StepSkipped,
                key,
                format!("Step '{}' skipped: blocked by '{}'", dependent, failed),
                StepStatus::Skipped,
            ));
        }
    }

    async fn finish(&self, run: &ReleaseRun) -> Result<(), OrchestratorError> {
        let (event_type, status) = match run.overall_status {
            RunStatus::Succeeded => (EventType::RunSucceeded, StepStatus::Succeeded),
            RunStatus::Failed => (EventType::RunFailed, StepStatus::Failed),
            RunStatus::Cancelled | RunStatus::InProgress => return Ok(()),
        };

        let summary = match run.overall_status {
            RunStatus::Succeeded => format!("Release {} completed", run.manifest.version.tag_name()),
            _ => {
                let failed: Vec<&str> = run.failures().into_iter().map(|(name, _)| name).collect();
                format!("Release failed at: {}", failed.join(", "))
            }
        };

        info!(status = %run.overall_status, "Release run finished");
        self.store
            .append(&Event::for_run(run.run_id, event_type, summary, status))
            .await?;
        Ok(())
    }
}
