//! Adapter interfaces for external systems.
//!
//! Adapters wrap the two outside surfaces the engine touches: version control
//! (the repository) and CI/build workflows (the publication gateway). The
//! engine only ever talks to them through these traits.

pub mod publication;
pub mod repository;

pub use publication::{
    wait_for_completion, GatewayError, HttpGateway, PollPolicy, PublicationGateway,
    TriggerRequest, WorkflowHandle, WorkflowState, WorkflowStatus,
};
pub use repository::{
    CherryPickOutcome, CommitInfo, GitRepository, RepositoryAdapter, RepositoryError,
};
