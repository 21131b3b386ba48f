// Application Layer - Use Cases and Business Logic

pub mod backup;
pub mod git_sync;
pub mod layout;
pub mod orchestrator;
pub mod rate_limiter;
pub mod retry;
pub mod state_tracker;
pub mod worker;

// Re-exports
pub use backup::{BackupSettings, BackupTask};
pub use git_sync::{GitSynchronizer, SyncOutcome};
pub use layout::BackupLayout;
pub use orchestrator::{BackupOrchestrator, FailedRepo, RunReport};
pub use rate_limiter::{RateLimiter, ThrottleDecision};
pub use retry::{RetryDecision, RetryPolicy};
pub use state_tracker::StateTracker;
pub use worker::{cancel_channel, CancelSender, CancelToken, JobHandler, WorkerPool};
