// Job-level retry policy
//
// Distinct from the rate limiter's API-level retries: this decides whether a
// whole repository backup is attempted again after it failed.
use crate::domain::{Job, JobError};
use std::time::Duration;
use tracing::{info, warn};

/// Retry decision result
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue the job after the delay
    Retry(Duration),
    /// Do not retry, the job has failed permanently
    Fail,
}

/// Linear backoff: attempt N waits `base_delay * N` before re-queuing
pub struct RetryPolicy {
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration) -> Self {
        Self { base_delay }
    }

    /// Determine whether a failed job should run again
    ///
    /// Cancellations, non-retryable failures, and jobs whose attempt count
    /// has reached the ceiling all fail.
    pub fn decide(&self, job: &Job, error: &JobError) -> RetryDecision {
        if matches!(error, JobError::Cancelled) {
            return RetryDecision::Fail;
        }

        if !error.is_retryable() {
            info!(
                job_id = %job.id,
                repo = %job.slug(),
                kind = %error.kind(),
                "Failure is not retryable"
            );
            return RetryDecision::Fail;
        }

        if !job.has_retries_left() {
            warn!(
                job_id = %job.id,
                repo = %job.slug(),
                attempt = job.attempt,
                max_retries = job.max_retries,
                "Max retry attempts reached"
            );
            return RetryDecision::Fail;
        }

        let delay = self.delay_for(job.attempt);
        info!(
            job_id = %job.id,
            repo = %job.slug(),
            attempt = job.attempt,
            max_retries = job.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Scheduling retry"
        );
        RetryDecision::Retry(delay)
    }

    /// Delay applied after the given (1-based) attempt failed
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.max(1))
    }
}
