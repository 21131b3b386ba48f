// Domain Layer - Pure data and state transitions

pub mod error;
pub mod job;
pub mod manifest;
pub mod repository;
pub mod result;
pub mod state;

// Re-exports
pub use error::DomainError;
pub use job::{Job, JobId, JobState};
pub use manifest::{Manifest, RunCounters, RunOptions};
pub use repository::{
    validate_slug, Issue, MetadataItem, Project, PullRequest, RepoSlug, Repository, Stream,
};
pub use result::{BackupStats, FailureKind, JobError, JobOutcome, JobResult};
pub use state::{FailureRecord, FetchMode, IncrementalState, RepoState, STATE_VERSION};
