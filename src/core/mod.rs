//! Core release orchestration.
//!
//! This module contains:
//! - Graph: step definitions and dependency validation
//! - Checklist: the patch-release step graph
//! - Executor: adapter calls behind each step action
//! - Orchestrator: run lifecycle, retries and failure propagation
//! - Ledger: released versions per release line
//! - RunStore: run snapshots and audit log on disk
//! - Artifacts: change collection and release file rendering

pub mod artifacts;
pub mod checklist;
pub mod error;
pub mod executor;
pub mod graph;
pub mod ledger;
pub mod orchestrator;
pub mod retry;
pub mod run_store;

// Re-export commonly used types
pub use artifacts::{collect_changes, render, RenderedFiles};
pub use checklist::{release_checklist, ChecklistSettings};
pub use error::{GraphError, OrchestratorError, StepError};
pub use executor::{ReleaseExecutor, StepContext, StepExecutor, StepOutcome};
pub use graph::{Step, StepAction, StepGraph};
pub use ledger::{LedgerError, LedgerStore, VersionLedger};
pub use orchestrator::{ExecutionOptions, Orchestrator};
pub use retry::RetryPolicy;
pub use run_store::{generate_idempotency_key, hash_input, RunStore, StoreError};
