//! Domain types for the release engine.
//!
//! This module contains the core data structures:
//! - Version: release versions and their ordering
//! - Change: merged changes collected for the changelog
//! - Manifest: the release manifest aggregate
//! - Run: release run state and step execution records
//! - Events: audit log entries

pub mod change;
pub mod events;
pub mod manifest;
pub mod run;
pub mod version;

// Re-export commonly used types
pub use change::ChangeRecord;
pub use events::{Event, EventType};
pub use manifest::{ManifestFrozen, ReleaseManifest};
pub use run::{ReleaseRun, RunStatus, SkipReason, StepExecutionRecord, StepStatus};
pub use version::{ReleaseVersion, VersionParseError};
