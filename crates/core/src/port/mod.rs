// Port Layer - Interfaces for external collaborators

pub mod git_backend;
pub mod id_provider; // For deterministic testing
pub mod metadata_client;
pub mod storage;
pub mod time_provider;

// Re-exports
pub use git_backend::{
    classify_failure, GitBackend, GitError, GitOperation, GitOutput, GitRequest,
};
pub use id_provider::IdProvider;
pub use metadata_client::{ApiError, MetadataClient};
pub use storage::{Storage, StorageError};
pub use time_provider::TimeProvider;
