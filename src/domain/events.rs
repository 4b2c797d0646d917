//! Audit events for release runs.
//!
//! Every state transition is appended to the run's event log. The snapshot in
//! `run.json` is the source of truth for resuming; the event log is the audit
//! trail of how the run got there.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run::StepStatus;

/// A single entry in a run's append-only audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Step name (if applicable)
    pub step_id: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Idempotency key of the step side effect (empty for run-level events)
    pub idempotency_key: String,

    /// Human-readable summary (NO secrets)
    pub payload_summary: String,

    /// Status of the step/run after this event
    pub status: StepStatus,

    /// Attempt number (for step events)
    pub attempt: Option<u32>,

    /// Time taken in milliseconds (for finished steps)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: Uuid,
        step_id: Option<String>,
        event_type: EventType,
        idempotency_key: String,
        payload_summary: String,
        status: StepStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            step_id,
            event_type,
            idempotency_key,
            payload_summary,
            status,
            attempt: None,
            duration_ms: None,
            error: None,
        }
    }

    /// Run-level event (no step, no idempotency key)
    pub fn for_run(run_id: Uuid, event_type: EventType, summary: String, status: StepStatus) -> Self {
        Self::new(run_id, None, event_type, String::new(), summary, status)
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Types of events recorded during a release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new release run was prepared
    RunStarted,

    /// A run was picked up again after an interruption
    RunResumed,

    /// Every step succeeded or was skipped
    RunSucceeded,

    /// A step exhausted its retry budget
    RunFailed,

    /// The run was cancelled by an operator
    RunCancelled,

    /// A step has started execution
    StepStarted,

    /// A step completed successfully
    StepSucceeded,

    /// A step failed and will be retried
    StepRetrying,

    /// A step failed permanently
    StepFailed,

    /// A step was skipped (blocked or cancelled)
    StepSkipped,

    /// A step left running by a crashed process was reset to pending
    StepReset,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = Event::new(
            Uuid::new_v4(),
            Some("tag-release".to_string()),
            EventType::StepStarted,
            "test-key".to_string(),
            "Starting tag-release".to_string(),
            StepStatus::Running,
        )
        .with_attempt(2);

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"step_started\""));

        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type, EventType::StepStarted);
        assert_eq!(parsed.status, StepStatus::Running);
        assert_eq!(parsed.attempt, Some(2));
    }

    #[test]
    fn test_event_with_duration_and_error() {
        let event = Event::for_run(
            Uuid::new_v4(),
            EventType::RunFailed,
            "Run failed".to_string(),
            StepStatus::Failed,
        )
        .with_duration(1500)
        .with_error("push rejected".to_string());

        assert_eq!(event.duration_ms, Some(1500));
        assert_eq!(event.error.as_deref(), Some("push rejected"));
        assert!(event.step_id.is_none());
    }
}
