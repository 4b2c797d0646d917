//! Publication gateway: external build/publish workflows.
//!
//! Triggering is fire-and-forget; completion is observed by polling with
//! bounded exponential backoff and an overall timeout. Polling is the only
//! place the engine waits on the outside world.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::ReleaseVersion;

/// Publication gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Workflow '{0}' is not configured")]
    UnknownWorkflow(String),

    #[error("Workflow '{workflow}' failed{}", .logs_url.as_ref().map(|u| format!(" (logs: {})", u)).unwrap_or_default())]
    WorkflowFailed {
        workflow: String,
        logs_url: Option<String>,
    },

    #[error("Workflow '{workflow}' did not finish within {elapsed:?}")]
    Timeout { workflow: String, elapsed: Duration },

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Unexpected response from CI ({status}): {body}")]
    UnexpectedResponse { status: u16, body: String },
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// What to trigger
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub workflow: String,

    /// Git ref the workflow builds (usually the release tag)
    pub git_ref: String,

    pub version: ReleaseVersion,

    /// Deduplicates repeated triggers of the same step
    pub idempotency_key: String,
}

/// Pollable reference to a triggered workflow run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowHandle {
    pub workflow: String,
    pub run_id: String,
    pub url: Option<String>,
}

/// Observed state of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowStatus {
    pub state: WorkflowState,
    pub logs_url: Option<String>,
}

/// External CI/build trigger surface
#[async_trait]
pub trait PublicationGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn trigger(&self, request: &TriggerRequest) -> Result<WorkflowHandle, GatewayError>;

    async fn poll(&self, handle: &WorkflowHandle) -> Result<WorkflowStatus, GatewayError>;
}

/// Polling schedule for triggered workflows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// First delay between polls in milliseconds
    #[serde(default = "default_initial_interval")]
    pub initial_interval_ms: u64,

    /// Upper bound on the delay between polls
    #[serde(default = "default_max_interval")]
    pub max_interval_ms: u64,

    #[serde(default = "default_poll_multiplier")]
    pub backoff_multiplier: f64,

    /// Overall time budget (default: 2 hours)
    #[serde(default = "default_poll_timeout")]
    pub timeout_ms: u64,
}

fn default_initial_interval() -> u64 {
    5_000
}
fn default_max_interval() -> u64 {
    60_000
}
fn default_poll_multiplier() -> f64 {
    2.0
}
fn default_poll_timeout() -> u64 {
    2 * 60 * 60 * 1000
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval(),
            max_interval_ms: default_max_interval(),
            backoff_multiplier: default_poll_multiplier(),
            timeout_ms: default_poll_timeout(),
        }
    }
}

impl PollPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay before poll number `poll` (1-indexed)
    pub fn interval_for_poll(&self, poll: u32) -> Duration {
        let raw = self.initial_interval_ms as f64 * self.backoff_multiplier.powi(poll.saturating_sub(1) as i32);
        Duration::from_millis(raw.min(self.max_interval_ms as f64) as u64)
    }
}

/// Poll `handle` until it finishes or the policy's timeout elapses
pub async fn wait_for_completion(
    gateway: &dyn PublicationGateway,
    handle: &WorkflowHandle,
    policy: &PollPolicy,
) -> Result<WorkflowStatus, GatewayError> {
    let started = Instant::now();
    let deadline = started + policy.timeout();
    let mut poll = 0u32;

    loop {
        poll += 1;
        match gateway.poll(handle).await {
            Ok(status) => match status.state {
                WorkflowState::Succeeded => {
                    info!(workflow = %handle.workflow, run = %handle.run_id, polls = poll, "Workflow succeeded");
                    return Ok(status);
                }
                WorkflowState::Failed => {
                    return Err(GatewayError::WorkflowFailed {
                        workflow: handle.workflow.clone(),
                        logs_url: status.logs_url,
                    });
                }
                WorkflowState::Pending => {
                    debug!(workflow = %handle.workflow, poll, "Workflow still pending");
                }
            },
            // A flaky poll is not a failed workflow; keep polling until the deadline
            Err(GatewayError::Transport(e)) => {
                warn!(workflow = %handle.workflow, poll, error = %e, "Poll failed");
            }
            Err(e) => return Err(e),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(GatewayError::Timeout {
                workflow: handle.workflow.clone(),
                elapsed: now - started,
            });
        }

        let wait = policy.interval_for_poll(poll).min(deadline - now);
        tokio::time::sleep(wait).await;
    }
}

/// Gateway for a CI service exposing workflow dispatch over HTTP
///
/// `POST {base}/workflows/{name}/dispatches` returns `{"id", "html_url"}`;
/// `GET {base}/runs/{id}` returns `{"status", "conclusion", "logs_url"}`.
pub struct HttpGateway {
    base_url: String,
    token: Option<String>,
    workflows: Vec<String>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct DispatchPayload<'a> {
    #[serde(rename = "ref")]
    git_ref: &'a str,
    inputs: DispatchInputs,
}

#[derive(Debug, Serialize)]
struct DispatchInputs {
    version: String,
}

#[derive(Debug, Deserialize)]
struct DispatchResponse {
    id: serde_json::Value,
    #[serde(default)]
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    status: String,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    logs_url: Option<String>,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>, token: Option<String>, workflows: Vec<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            workflows,
            client: reqwest::Client::new(),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl PublicationGateway for HttpGateway {
    fn name(&self) -> &str {
        "http"
    }

    async fn trigger(&self, request: &TriggerRequest) -> Result<WorkflowHandle, GatewayError> {
        if !self.workflows.iter().any(|w| w == &request.workflow) {
            return Err(GatewayError::UnknownWorkflow(request.workflow.clone()));
        }

        let url = format!("{}/workflows/{}/dispatches", self.base_url, request.workflow);
        let payload = DispatchPayload {
            git_ref: &request.git_ref,
            inputs: DispatchInputs {
                version: request.version.to_string(),
            },
        };

        let response = self
            .authorize(self.client.post(&url))
            .header("Idempotency-Key", &request.idempotency_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.is_server_error() {
                return Err(GatewayError::Transport(format!("{}: {}", status, body)));
            }
            return Err(GatewayError::UnexpectedResponse {
                status: status.as_u16(),
                body,
            });
        }

        let dispatched: DispatchResponse = response.json().await?;
        let run_id = match dispatched.id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };

        info!(workflow = %request.workflow, %run_id, "Workflow triggered");
        Ok(WorkflowHandle {
            workflow: request.workflow.clone(),
            run_id,
            url: dispatched.html_url,
        })
    }

    async fn poll(&self, handle: &WorkflowHandle) -> Result<WorkflowStatus, GatewayError> {
        let url = format!("{}/runs/{}", self.base_url, handle.run_id);
        let response = self.authorize(self.client.get(&url)).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Transport(format!("{}: {}", status, body)));
        }

        let run: RunResponse = response.json().await?;
        Ok(WorkflowStatus {
            state: map_run_state(&run.status, run.conclusion.as_deref()),
            logs_url: run.logs_url,
        })
    }
}

fn map_run_state(status: &str, conclusion: Option<&str>) -> WorkflowState {
    if status != "completed" {
        return WorkflowState::Pending;
    }
    match conclusion {
        Some("success") | Some("skipped") => WorkflowState::Succeeded,
        _ => WorkflowState::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedGateway {
        pending_polls: u32,
        final_state: WorkflowState,
        polls: AtomicU32,
    }

    #[async_trait]
    impl PublicationGateway for ScriptedGateway {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn trigger(&self, request: &TriggerRequest) -> Result<WorkflowHandle, GatewayError> {
            Ok(WorkflowHandle {
                workflow: request.workflow.clone(),
                run_id: "1".to_string(),
                url: None,
            })
        }

        async fn poll(&self, _handle: &WorkflowHandle) -> Result<WorkflowStatus, GatewayError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            let state = if n <= self.pending_polls {
                WorkflowState::Pending
            } else {
                self.final_state
            };
            Ok(WorkflowStatus {
                state,
                logs_url: Some("https://ci.example/logs/1".to_string()),
            })
        }
    }

    fn handle() -> WorkflowHandle {
        WorkflowHandle {
            workflow: "release".to_string(),
            run_id: "1".to_string(),
            url: None,
        }
    }

    fn fast_policy(timeout_ms: u64) -> PollPolicy {
        PollPolicy {
            initial_interval_ms: 1,
            max_interval_ms: 2,
            backoff_multiplier: 2.0,
            timeout_ms,
        }
    }

    #[test]
    fn test_poll_intervals_back_off_and_cap() {
        let policy = PollPolicy {
            initial_interval_ms: 1000,
            max_interval_ms: 5000,
            backoff_multiplier: 2.0,
            timeout_ms: 60_000,
        };
        assert_eq!(policy.interval_for_poll(1), Duration::from_millis(1000));
        assert_eq!(policy.interval_for_poll(3), Duration::from_millis(4000));
        assert_eq!(policy.interval_for_poll(4), Duration::from_millis(5000));
    }

    #[test]
    fn test_default_timeout_is_two_hours() {
        assert_eq!(PollPolicy::default().timeout(), Duration::from_secs(7200));
    }

    #[test]
    fn test_run_state_mapping() {
        assert_eq!(map_run_state("in_progress", None), WorkflowState::Pending);
        assert_eq!(map_run_state("completed", Some("success")), WorkflowState::Succeeded);
        assert_eq!(map_run_state("completed", Some("failure")), WorkflowState::Failed);
    }

    #[tokio::test]
    async fn test_wait_until_success() {
        let gateway = ScriptedGateway {
            pending_polls: 3,
            final_state: WorkflowState::Succeeded,
            polls: AtomicU32::new(0),
        };
        let status = wait_for_completion(&gateway, &handle(), &fast_policy(5_000))
            .await
            .unwrap();
        assert_eq!(status.state, WorkflowState::Succeeded);
        assert_eq!(gateway.polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_failed_workflow_reports_logs() {
        let gateway = ScriptedGateway {
            pending_polls: 0,
            final_state: WorkflowState::Failed,
            polls: AtomicU32::new(0),
        };
        let err = wait_for_completion(&gateway, &handle(), &fast_policy(5_000))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("https://ci.example/logs/1"));
    }

    #[tokio::test]
    async fn test_times_out_when_never_finished() {
        let gateway = ScriptedGateway {
            pending_polls: u32::MAX,
            final_state: WorkflowState::Succeeded,
            polls: AtomicU32::new(0),
        };
        let err = wait_for_completion(&gateway, &handle(), &fast_policy(20))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { ref workflow, .. } if workflow == "release"));
    }
}
