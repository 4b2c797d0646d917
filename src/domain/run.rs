//! Release run state.
//!
//! A `ReleaseRun` is the aggregate root of one release attempt. It is owned by
//! the orchestrator and persisted after every transition.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::manifest::ReleaseManifest;

/// One release attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRun {
    /// Unique identifier for this run
    pub run_id: Uuid,

    /// What is being released
    pub manifest: ReleaseManifest,

    /// Execution record per step (step name -> record)
    pub step_records: BTreeMap<String, StepExecutionRecord>,

    /// Overall status, derived from the step records
    pub overall_status: RunStatus,

    /// Optimistic concurrency revision, bumped on every persisted write
    pub revision: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Set once the run reaches a terminal status
    pub archived_at: Option<DateTime<Utc>>,
}

impl ReleaseRun {
    /// Create a new run with every step pending
    pub fn new<'a>(
        run_id: Uuid,
        manifest: ReleaseManifest,
        step_names: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let now = Utc::now();
        let step_records = step_names
            .into_iter()
            .map(|name| (name.to_string(), StepExecutionRecord::new(name)))
            .collect();

        Self {
            run_id,
            manifest,
            step_records,
            overall_status: RunStatus::InProgress,
            revision: 0,
            created_at: now,
            updated_at: now,
            archived_at: None,
        }
    }

    pub fn record(&self, step_name: &str) -> Option<&StepExecutionRecord> {
        self.step_records.get(step_name)
    }

    pub fn record_mut(&mut self, step_name: &str) -> Option<&mut StepExecutionRecord> {
        self.step_records.get_mut(step_name)
    }

    pub fn step_status(&self, step_name: &str) -> Option<StepStatus> {
        self.record(step_name).map(|r| r.status)
    }

    /// Whether any further transition can happen on this run
    ///
    /// A failed run whose independent branches are still pending is not yet
    /// terminal: those branches keep executing.
    pub fn is_terminal(&self) -> bool {
        match self.overall_status {
            RunStatus::InProgress => false,
            RunStatus::Succeeded | RunStatus::Cancelled => true,
            RunStatus::Failed => self.step_records.values().all(|r| r.status.is_terminal()),
        }
    }

    /// Re-derive `overall_status` from the step records
    pub fn refresh_status(&mut self) {
        if self.overall_status == RunStatus::Cancelled {
            return;
        }

        let any_failed = self
            .step_records
            .values()
            .any(|r| r.status == StepStatus::Failed);
        let all_done = self
            .step_records
            .values()
            .all(|r| r.status.is_terminal_success());

        self.overall_status = if any_failed {
            RunStatus::Failed
        } else if all_done {
            RunStatus::Succeeded
        } else {
            RunStatus::InProgress
        };

        if self.is_terminal() && self.archived_at.is_none() {
            self.archived_at = Some(Utc::now());
        }
    }

    /// Steps left `running` by a crashed process go back to `pending`
    pub fn reset_interrupted(&mut self) -> Vec<String> {
        let mut reset = Vec::new();
        for record in self.step_records.values_mut() {
            if record.status == StepStatus::Running {
                record.status = StepStatus::Pending;
                reset.push(record.step_name.clone());
            }
        }
        reset
    }

    /// Cancel the run: every unfinished step becomes `skipped(cancelled)`
    pub fn cancel(&mut self) -> Vec<String> {
        let mut cancelled = Vec::new();
        let now = Utc::now();
        for record in self.step_records.values_mut() {
            if matches!(record.status, StepStatus::Pending | StepStatus::Running) {
                record.status = StepStatus::Skipped;
                record.skip_reason = Some(SkipReason::Cancelled);
                record.finished_at = Some(now);
                cancelled.push(record.step_name.clone());
            }
        }
        self.overall_status = RunStatus::Cancelled;
        self.archived_at = Some(now);
        cancelled
    }

    /// Steps that failed, with their last error
    pub fn failures(&self) -> Vec<(&str, Option<&str>)> {
        self.step_records
            .values()
            .filter(|r| r.status == StepStatus::Failed)
            .map(|r| (r.step_name.as_str(), r.last_error.as_deref()))
            .collect()
    }

    /// Artifact references produced by completed steps
    pub fn artifacts(&self) -> BTreeMap<String, String> {
        self.step_records
            .values()
            .filter_map(|r| r.artifact.clone().map(|a| (r.step_name.clone(), a)))
            .collect()
    }
}

/// Overall status of a release run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::InProgress
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Execution record for one step within one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    pub step_name: String,
    pub status: StepStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,

    /// Why the step was skipped, when it was
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,

    /// Reference to whatever the step produced (tag, commit, workflow run)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepExecutionRecord {
    pub fn new(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            status: StepStatus::Pending,
            attempt_count: 0,
            last_error: None,
            skip_reason: None,
            artifact: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Status rendered for humans ("skipped (blocked by tag-release)")
    pub fn describe_status(&self) -> String {
        match (&self.status, &self.skip_reason) {
            (StepStatus::Skipped, Some(SkipReason::Blocked { by })) => {
                format!("skipped (blocked by {})", by)
            }
            (StepStatus::Skipped, Some(SkipReason::Cancelled)) => "skipped (cancelled)".to_string(),
            (status, _) => status.to_string(),
        }
    }
}

/// Status of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet started, or waiting for another attempt
    Pending,

    /// Currently executing
    Running,

    /// Completed successfully
    Succeeded,

    /// Exhausted its retry budget, or hit a non-retryable error
    Failed,

    /// Will not run (blocked or cancelled)
    Skipped,
}

impl StepStatus {
    /// No further transition occurs from this status
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Satisfies a dependency edge
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Why a step was skipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SkipReason {
    /// A (transitive) dependency failed
    Blocked { by: String },

    /// The run was cancelled
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ReleaseVersion;
    use chrono::NaiveDate;

    fn run(steps: &[&str]) -> ReleaseRun {
        let manifest = ReleaseManifest::new(
            ReleaseVersion::new(0, 19, 4),
            ReleaseVersion::new(0, 19, 3),
            "release-0.19",
            NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
        );
        ReleaseRun::new(Uuid::new_v4(), manifest, steps.iter().copied())
    }

    #[test]
    fn test_new_run_all_pending() {
        let run = run(&["a", "b"]);
        assert_eq!(run.overall_status, RunStatus::InProgress);
        assert!(run.step_records.values().all(|r| r.status == StepStatus::Pending));
        assert!(!run.is_terminal());
    }

    #[test]
    fn test_status_succeeded_when_all_succeeded_or_skipped() {
        let mut run = run(&["a", "b"]);
        run.record_mut("a").unwrap().status = StepStatus::Succeeded;
        run.record_mut("b").unwrap().status = StepStatus::Skipped;
        run.refresh_status();
        assert_eq!(run.overall_status, RunStatus::Succeeded);
        assert!(run.is_terminal());
        assert!(run.archived_at.is_some());
    }

    #[test]
    fn test_failed_run_not_terminal_while_independent_branch_pending() {
        let mut run = run(&["a", "b"]);
        run.record_mut("a").unwrap().status = StepStatus::Failed;
        run.refresh_status();
        assert_eq!(run.overall_status, RunStatus::Failed);
        assert!(!run.is_terminal());

        run.record_mut("b").unwrap().status = StepStatus::Succeeded;
        run.refresh_status();
        assert!(run.is_terminal());
    }

    #[test]
    fn test_cancel_marks_unfinished_steps() {
        let mut run = run(&["a", "b", "c"]);
        run.record_mut("a").unwrap().status = StepStatus::Succeeded;
        run.record_mut("b").unwrap().status = StepStatus::Running;

        let cancelled = run.cancel();
        assert_eq!(cancelled, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(run.step_status("a"), Some(StepStatus::Succeeded));
        assert_eq!(run.record("b").unwrap().skip_reason, Some(SkipReason::Cancelled));
        assert_eq!(run.overall_status, RunStatus::Cancelled);
        assert!(run.is_terminal());

        // Cancellation is sticky
        run.refresh_status();
        assert_eq!(run.overall_status, RunStatus::Cancelled);
    }

    #[test]
    fn test_reset_interrupted() {
        let mut run = run(&["a", "b"]);
        run.record_mut("a").unwrap().status = StepStatus::Running;
        assert_eq!(run.reset_interrupted(), vec!["a".to_string()]);
        assert_eq!(run.step_status("a"), Some(StepStatus::Pending));
    }

    #[test]
    fn test_describe_blocked_status() {
        let mut record = StepExecutionRecord::new("c");
        record.status = StepStatus::Skipped;
        record.skip_reason = Some(SkipReason::Blocked { by: "b".to_string() });
        assert_eq!(record.describe_status(), "skipped (blocked by b)");
    }
}
