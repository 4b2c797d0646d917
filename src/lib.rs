//! release-engine - resumable, auditable patch-release orchestrator
//!
//! Turns the manual patch-release checklist (validate version, prepare
//! branch, cherry-pick, changelog, tag, push, publish) into a graph of
//! idempotent steps executed by an orchestrator that persists its state
//! after every transition.
//!
//! # Architecture
//!
//! - A release is a `ReleaseRun` aggregate: the frozen-at-tag manifest plus
//!   one execution record per step
//! - Runs are persisted with compare-and-set on a revision; every transition
//!   is also appended to a per-run audit log
//! - Interrupted runs resume from their persisted state; step actions tolerate
//!   being re-invoked
//!
//! # Modules
//!
//! - `adapters`: Version control and CI integrations
//! - `core`: Step graph, orchestrator, ledger, run store, artifact rendering
//! - `domain`: Data structures (version, manifest, run, events)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Prepare and execute a patch release
//! release prepare 0.19.4 --cherry-pick 1a2b3c4d
//!
//! # Check run status
//! release status <run-id>
//!
//! # Resume an interrupted run
//! release resume <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{Orchestrator, OrchestratorError, StepGraph};
pub use domain::{ReleaseManifest, ReleaseRun, ReleaseVersion, RunStatus, StepStatus};
