// Job outcomes reported by the worker pool

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::job::JobId;
use super::repository::RepoSlug;

/// Failure classification at the job boundary.
///
/// Every fault raised while backing up one repository is converted into
/// one of these before it leaves the worker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("cancelled")]
    Cancelled,

    #[error("timed out: {0}")]
    Timeout(String),

    /// Network hiccups, throttling ceilings, git implementation defects
    #[error("{0}")]
    Transient(String),

    /// Authentication failure, repository not found, bad configuration
    #[error("{0}")]
    Permanent(String),

    /// Unexpected runtime fault caught at the job boundary
    #[error("panicked: {0}")]
    Panicked(String),
}

impl JobError {
    pub fn kind(&self) -> FailureKind {
        match self {
            JobError::Cancelled => FailureKind::Cancelled,
            JobError::Timeout(_) => FailureKind::Timeout,
            JobError::Transient(_) => FailureKind::Transient,
            JobError::Permanent(_) => FailureKind::Permanent,
            JobError::Panicked(_) => FailureKind::Panic,
        }
    }

    /// Whether the scheduler may attempt the job again
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Timeout(_) | JobError::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Cancelled,
    Timeout,
    Transient,
    Permanent,
    Panic,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Cancelled => "cancelled",
            FailureKind::Timeout => "timeout",
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
            FailureKind::Panic => "panic",
        };
        f.write_str(s)
    }
}

/// Per-repository counters produced by a successful job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupStats {
    pub pull_requests: u64,
    pub issues: u64,
    pub comments: u64,
    pub git_synced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

/// Terminal outcome of one job, produced exactly once per job
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: JobId,
    pub repo: RepoSlug,
    pub outcome: JobOutcome,
    pub stats: BackupStats,
    /// Attempts actually started
    pub attempts: u32,
    pub error: Option<JobError>,
    pub finished_at: i64,
}

impl JobResult {
    pub fn succeeded(
        job_id: JobId,
        repo: RepoSlug,
        stats: BackupStats,
        attempts: u32,
        finished_at: i64,
    ) -> Self {
        Self {
            job_id,
            repo,
            outcome: JobOutcome::Succeeded,
            stats,
            attempts,
            error: None,
            finished_at,
        }
    }

    pub fn failed(
        job_id: JobId,
        repo: RepoSlug,
        error: JobError,
        attempts: u32,
        finished_at: i64,
    ) -> Self {
        Self {
            job_id,
            repo,
            outcome: JobOutcome::Failed,
            stats: BackupStats::default(),
            attempts,
            error: Some(error),
            finished_at,
        }
    }

    pub fn cancelled(job_id: JobId, repo: RepoSlug, attempts: u32, finished_at: i64) -> Self {
        Self {
            job_id,
            repo,
            outcome: JobOutcome::Cancelled,
            stats: BackupStats::default(),
            attempts,
            error: Some(JobError::Cancelled),
            finished_at,
        }
    }
}
