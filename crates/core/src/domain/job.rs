// Job Domain Model

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::error::{DomainError, Result};
use super::repository::Repository;

/// Job ID (UUID v4), doubles as the trace id in logs
pub type JobId = String;

/// Job lifecycle:
/// `Queued -> Running -> {Succeeded | Retrying -> Queued | Failed | Cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Retrying,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "QUEUED"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::Succeeded => write!(f, "SUCCEEDED"),
            JobState::Retrying => write!(f, "RETRYING"),
            JobState::Failed => write!(f, "FAILED"),
            JobState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// One unit of per-repository backup work.
///
/// A job is owned by exactly one party at a time (the queue, or the worker
/// running it), so none of its fields need synchronization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub repo: Repository,
    /// Local destination of the git mirror
    pub dest_path: PathBuf,

    pub state: JobState,
    /// Current attempt, starting at 1
    pub attempt: u32,
    /// Retries allowed after the first attempt
    pub max_retries: u32,

    pub created_at: i64, // epoch ms
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

impl Job {
    /// Create a new queued job
    ///
    /// # Arguments
    ///
    /// * `id` - Unique trace id (injected, not generated)
    /// * `created_at` - Creation timestamp in epoch ms (injected, not system time)
    /// * `repo` - Repository to back up
    /// * `dest_path` - Local mirror destination
    /// * `max_retries` - Retries after the first attempt
    pub fn new(
        id: impl Into<String>,
        created_at: i64,
        repo: Repository,
        dest_path: impl Into<PathBuf>,
        max_retries: u32,
    ) -> Self {
        Self {
            id: id.into(),
            repo,
            dest_path: dest_path.into(),
            state: JobState::Queued,
            attempt: 1,
            max_retries,
            created_at,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn slug(&self) -> &str {
        &self.repo.slug
    }

    /// Whether another attempt is allowed after the current one
    pub fn has_retries_left(&self) -> bool {
        self.attempt <= self.max_retries
    }

    /// Queued -> Running
    pub fn start(&mut self, now_millis: i64) -> Result<()> {
        self.transition(&[JobState::Queued], JobState::Running)?;
        self.started_at = Some(now_millis);
        Ok(())
    }

    /// Running -> Succeeded
    pub fn succeed(&mut self, now_millis: i64) -> Result<()> {
        self.transition(&[JobState::Running], JobState::Succeeded)?;
        self.finished_at = Some(now_millis);
        Ok(())
    }

    /// Running -> Retrying, bumping the attempt counter
    pub fn begin_retry(&mut self) -> Result<()> {
        if !self.has_retries_left() {
            return Err(DomainError::ValidationError(format!(
                "job {} exhausted {} retries",
                self.id, self.max_retries
            )));
        }
        self.transition(&[JobState::Running], JobState::Retrying)?;
        self.attempt += 1;
        Ok(())
    }

    /// Retrying -> Queued
    pub fn requeue(&mut self) -> Result<()> {
        self.transition(&[JobState::Retrying], JobState::Queued)?;
        self.started_at = None;
        Ok(())
    }

    /// Running -> Failed
    pub fn fail(&mut self, now_millis: i64) -> Result<()> {
        self.transition(&[JobState::Running], JobState::Failed)?;
        self.finished_at = Some(now_millis);
        Ok(())
    }

    /// Queued | Running | Retrying -> Cancelled
    pub fn cancel(&mut self, now_millis: i64) -> Result<()> {
        self.transition(
            &[JobState::Queued, JobState::Running, JobState::Retrying],
            JobState::Cancelled,
        )?;
        self.finished_at = Some(now_millis);
        Ok(())
    }

    fn transition(&mut self, from: &[JobState], to: JobState) -> Result<()> {
        if !from.contains(&self.state) {
            return Err(DomainError::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::job;
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut job = job("api", 2);
        job.start(10).unwrap();
        assert_eq!(job.state, JobState::Running);
        job.succeed(20).unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.finished_at, Some(20));
        assert!(job.state.is_terminal());
    }

    #[test]
    fn test_retry_cycle_increments_attempt() {
        let mut job = job("api", 1);
        job.start(10).unwrap();
        job.begin_retry().unwrap();
        assert_eq!(job.state, JobState::Retrying);
        assert_eq!(job.attempt, 2);
        job.requeue().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert!(job.started_at.is_none());

        // Second attempt is the last one allowed
        job.start(30).unwrap();
        assert!(!job.has_retries_left());
        assert!(job.begin_retry().is_err());
        job.fail(40).unwrap();
        assert_eq!(job.state, JobState::Failed);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut job = job("api", 0);
        let err = job.succeed(10).unwrap_err();
        assert!(err.to_string().contains("QUEUED -> SUCCEEDED"));
    }

    #[test]
    fn test_cancel_from_queued_and_not_from_terminal() {
        let mut queued = job("a", 0);
        queued.cancel(5).unwrap();
        assert_eq!(queued.state, JobState::Cancelled);

        let mut done = job("b", 0);
        done.start(1).unwrap();
        done.succeed(2).unwrap();
        assert!(done.cancel(3).is_err());
    }
}
