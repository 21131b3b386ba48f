// Lock-free pool counters, for stall diagnosis only

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct WorkerPoolStats {
    jobs_submitted: AtomicU64,
    jobs_processed: AtomicU64,
    jobs_retried: AtomicU64,
    results_queued: AtomicU64,
    results_read: AtomicU64,
    active_workers: AtomicUsize,
    last_activity_ms: AtomicI64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_processed: u64,
    pub jobs_retried: u64,
    pub results_queued: u64,
    pub results_read: u64,
    pub active_workers: usize,
    pub last_activity_ms: i64,
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "submitted={} processed={} retried={} results_queued={} results_read={} \
             results_pending={} active_workers={} last_activity_ms={}",
            self.jobs_submitted,
            self.jobs_processed,
            self.jobs_retried,
            self.results_queued,
            self.results_read,
            self.results_queued.saturating_sub(self.results_read),
            self.active_workers,
            self.last_activity_ms
        )
    }
}

impl WorkerPoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn job_submitted(&self, now_ms: i64) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
        self.touch(now_ms);
    }

    pub(crate) fn job_processed(&self, now_ms: i64) {
        self.jobs_processed.fetch_add(1, Ordering::Relaxed);
        self.touch(now_ms);
    }

    pub(crate) fn job_retried(&self, now_ms: i64) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
        self.touch(now_ms);
    }

    pub(crate) fn result_queued(&self, now_ms: i64) {
        self.results_queued.fetch_add(1, Ordering::Relaxed);
        self.touch(now_ms);
    }

    /// Called by the consumer for each result it drains
    pub fn result_read(&self) {
        self.results_read.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn worker_stopped(&self) {
        self.active_workers.fetch_sub(1, Ordering::Relaxed);
    }

    fn touch(&self, now_ms: i64) {
        self.last_activity_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_processed: self.jobs_processed.load(Ordering::Relaxed),
            jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
            results_queued: self.results_queued.load(Ordering::Relaxed),
            results_read: self.results_read.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::Relaxed),
            last_activity_ms: self.last_activity_ms.load(Ordering::Relaxed),
        }
    }
}
