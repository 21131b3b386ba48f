// Worker Pool - fixed set of workers draining a bounded job queue

mod cancel;
pub mod constants;
mod panic_guard;
mod stats;

pub use cancel::{cancel_channel, CancelSender, CancelToken};
pub use panic_guard::{
    execute_guarded, execute_guarded_async, panic_message, PanicGuardResult,
};
pub use stats::{StatsSnapshot, WorkerPoolStats};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::application::retry::{RetryDecision, RetryPolicy};
use crate::domain::{BackupStats, Job, JobError, JobResult, JobState};
use crate::error::{AppError, Result};
use crate::port::TimeProvider;

/// Work function executed for every job attempt
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one attempt of `job`. Implementations observe `cancel` at every
    /// suspension point and return `JobError::Cancelled` when it fires.
    async fn execute(&self, job: &Job, cancel: CancelToken) -> std::result::Result<BackupStats, JobError>;
}

/// State shared by the pool handle and its workers
struct Shared {
    handler: Arc<dyn JobHandler>,
    retry_policy: Arc<RetryPolicy>,
    time_provider: Arc<dyn TimeProvider>,
    stats: Arc<WorkerPoolStats>,
    queue_tx: mpsc::Sender<Job>,
    queue_rx: Mutex<mpsc::Receiver<Job>>,
    /// Jobs submitted that have not produced their terminal result yet
    outstanding: AtomicUsize,
    closed: AtomicBool,
    drained_tx: watch::Sender<bool>,
}

impl Shared {
    fn now(&self) -> i64 {
        self.time_provider.now_millis()
    }

    /// A job produced its terminal result
    fn finish_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 && self.closed.load(Ordering::SeqCst) {
            self.drained_tx.send_replace(true);
        }
    }

    async fn emit(&self, results: &mpsc::Sender<JobResult>, result: JobResult) {
        debug!(
            job_id = %result.job_id,
            repo = %result.repo,
            outcome = ?result.outcome,
            attempts = result.attempts,
            "Job finished"
        );
        if results.send(result).await.is_err() {
            warn!("Result receiver dropped, discarding result");
        } else {
            self.stats.result_queued(self.now());
        }
        self.finish_one();
    }

    async fn emit_cancelled(&self, results: &mpsc::Sender<JobResult>, mut job: Job) {
        let now = self.now();
        let attempts = attempts_started(&job);
        if let Err(e) = job.cancel(now) {
            warn!(job_id = %job.id, error = %e, "Unexpected job state on cancel");
        }
        info!(job_id = %job.id, repo = %job.slug(), "Job cancelled");
        let result = JobResult::cancelled(job.id.clone(), job.repo.slug.clone(), attempts, now);
        self.emit(results, result).await;
    }
}

/// Attempts that actually started. A retrying or re-queued job has already
/// bumped its counter for an attempt that has not begun.
fn attempts_started(job: &Job) -> u32 {
    if job.state == JobState::Retrying || job.started_at.is_none() {
        job.attempt.saturating_sub(1)
    } else {
        job.attempt
    }
}

/// Resolve once the pool is closed and every job is terminal
async fn wait_drained(drained: &mut watch::Receiver<bool>) {
    loop {
        let done = *drained.borrow_and_update();
        if done {
            return;
        }
        if drained.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Fixed-size pool of concurrent workers.
///
/// Lifecycle: `new` -> `take_results` -> `start` -> `submit`* -> `close` -> `wait`.
/// Every submitted job yields exactly one `JobResult`, in completion order.
pub struct WorkerPool {
    shared: Arc<Shared>,
    results_tx: Option<mpsc::Sender<JobResult>>,
    results_rx: Option<mpsc::Receiver<JobResult>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Create a pool whose queue and result buffers hold `capacity` entries.
    ///
    /// Size `capacity` for the worst case (`jobs * (max_retries + 1)`) so a
    /// slow result consumer never stalls the workers.
    pub fn new(
        handler: Arc<dyn JobHandler>,
        retry_policy: Arc<RetryPolicy>,
        time_provider: Arc<dyn TimeProvider>,
        capacity: usize,
    ) -> Self {
        let capacity = capacity.max(1);
        let (queue_tx, queue_rx) = mpsc::channel(capacity);
        let (results_tx, results_rx) = mpsc::channel(capacity);
        let (drained_tx, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                handler,
                retry_policy,
                time_provider,
                stats: Arc::new(WorkerPoolStats::new()),
                queue_tx,
                queue_rx: Mutex::new(queue_rx),
                outstanding: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                drained_tx,
            }),
            results_tx: Some(results_tx),
            results_rx: Some(results_rx),
            workers: Vec::new(),
        }
    }

    /// Result stream; ends once `wait` has returned
    pub fn take_results(&mut self) -> Option<mpsc::Receiver<JobResult>> {
        self.results_rx.take()
    }

    pub fn stats(&self) -> Arc<WorkerPoolStats> {
        Arc::clone(&self.shared.stats)
    }

    /// Launch `worker_count` workers (at least one)
    pub fn start(&mut self, cancel: CancelToken, worker_count: usize) {
        let Some(results_tx) = self.results_tx.as_ref() else {
            warn!("Worker pool already finished, not starting");
            return;
        };
        let worker_count = worker_count.max(1);
        info!(workers = worker_count, "Starting worker pool");

        for worker_id in 0..worker_count {
            let shared = Arc::clone(&self.shared);
            let results = results_tx.clone();
            let cancel = cancel.clone();
            let drained = self.shared.drained_tx.subscribe();
            self.workers.push(tokio::spawn(async move {
                run_worker(worker_id, shared, results, cancel, drained).await;
            }));
        }
    }

    /// Enqueue one job; waits only while the queue is at capacity
    pub async fn submit(&self, job: Job) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(AppError::Internal(format!(
                "job {} submitted after close",
                job.id
            )));
        }
        if job.state != JobState::Queued {
            return Err(AppError::Validation(format!(
                "job {} is {}, expected QUEUED",
                job.id, job.state
            )));
        }

        let job_id = job.id.clone();
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.shared.queue_tx.send(job).await.is_err() {
            self.shared.finish_one();
            return Err(AppError::Internal(format!("job queue closed, {} dropped", job_id)));
        }
        self.shared.stats.job_submitted(self.shared.now());
        Ok(())
    }

    /// No further submissions; workers exit once every job is terminal
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        if self.shared.outstanding.load(Ordering::SeqCst) == 0 {
            self.shared.drained_tx.send_replace(true);
        }
    }

    /// Wait for all workers to exit.
    ///
    /// Jobs still queued at this point were abandoned by a cancellation and
    /// are reported as cancelled without starting. The result stream ends
    /// when this returns.
    pub async fn wait(mut self) {
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task terminated abnormally");
            }
        }

        if let Some(results) = self.results_tx.take() {
            let mut abandoned = Vec::new();
            {
                let mut rx = self.shared.queue_rx.lock().await;
                while let Ok(job) = rx.try_recv() {
                    abandoned.push(job);
                }
            }
            if !abandoned.is_empty() {
                info!(count = abandoned.len(), "Abandoning queued jobs");
            }
            for job in abandoned {
                self.shared.emit_cancelled(&results, job).await;
            }
        }

        info!(stats = %self.shared.stats.snapshot(), "Worker pool drained");
    }
}

async fn run_worker(
    worker_id: usize,
    shared: Arc<Shared>,
    results: mpsc::Sender<JobResult>,
    mut cancel: CancelToken,
    mut drained: watch::Receiver<bool>,
) {
    shared.stats.worker_started();
    debug!(worker_id = worker_id, "Worker started");

    loop {
        let job = {
            let mut rx = shared.queue_rx.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                _ = wait_drained(&mut drained) => None,
                job = rx.recv() => job,
            }
        };

        match job {
            Some(job) => process_job(&shared, &results, &cancel, job).await,
            None => break,
        }
    }

    shared.stats.worker_stopped();
    debug!(worker_id = worker_id, "Worker stopped");
}

async fn process_job(
    shared: &Arc<Shared>,
    results: &mpsc::Sender<JobResult>,
    cancel: &CancelToken,
    mut job: Job,
) {
    if cancel.is_cancelled() {
        shared.emit_cancelled(results, job).await;
        return;
    }

    if let Err(e) = job.start(shared.now()) {
        error!(job_id = %job.id, error = %e, "Cannot start job");
        let result = JobResult::failed(
            job.id.clone(),
            job.repo.slug.clone(),
            JobError::Permanent(e.to_string()),
            attempts_started(&job),
            shared.now(),
        );
        shared.emit(results, result).await;
        return;
    }

    info!(
        job_id = %job.id,
        repo = %job.slug(),
        attempt = job.attempt,
        "Processing job"
    );

    // Separate task: a panic in the work function unwinds there, not here
    let handler = Arc::clone(&shared.handler);
    let job_for_exec = job.clone();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { handler.execute(&job_for_exec, token).await });

    let outcome = match handle.await {
        Ok(outcome) => outcome,
        Err(join_err) if join_err.is_panic() => {
            let msg = panic_message(join_err.into_panic().as_ref());
            error!(job_id = %job.id, repo = %job.slug(), panic_msg = %msg, "Job panicked");
            Err(JobError::Panicked(msg))
        }
        Err(join_err) => {
            warn!(job_id = %job.id, error = %join_err, "Job task aborted");
            Err(JobError::Cancelled)
        }
    };
    shared.stats.job_processed(shared.now());

    let error = match outcome {
        Ok(stats) => {
            let now = shared.now();
            if let Err(e) = job.succeed(now) {
                warn!(job_id = %job.id, error = %e, "Unexpected job state on success");
            }
            info!(
                job_id = %job.id,
                repo = %job.slug(),
                attempt = job.attempt,
                pull_requests = stats.pull_requests,
                issues = stats.issues,
                "Job succeeded"
            );
            let result = JobResult::succeeded(job.id.clone(), job.repo.slug.clone(), stats, job.attempt, now);
            shared.emit(results, result).await;
            return;
        }
        Err(error) => error,
    };

    if matches!(error, JobError::Cancelled) || cancel.is_cancelled() {
        shared.emit_cancelled(results, job).await;
        return;
    }

    match shared.retry_policy.decide(&job, &error) {
        RetryDecision::Retry(delay) => {
            if let Err(e) = job.begin_retry() {
                warn!(job_id = %job.id, error = %e, "Cannot schedule retry");
                fail_job(shared, results, job, error).await;
                return;
            }
            shared.stats.job_retried(shared.now());
            warn!(
                job_id = %job.id,
                repo = %job.slug(),
                next_attempt = job.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Job failed, will retry"
            );

            if cancel.run_until_cancelled(tokio::time::sleep(delay)).await.is_none() {
                shared.emit_cancelled(results, job).await;
                return;
            }
            if let Err(e) = job.requeue() {
                warn!(job_id = %job.id, error = %e, "Cannot re-queue job");
                fail_job(shared, results, job, error).await;
                return;
            }
            requeue(shared, results, cancel, job, error).await;
        }
        RetryDecision::Fail => fail_job(shared, results, job, error).await,
    }
}

async fn requeue(
    shared: &Arc<Shared>,
    results: &mpsc::Sender<JobResult>,
    cancel: &CancelToken,
    job: Job,
    error: JobError,
) {
    let job = match shared.queue_tx.try_send(job) {
        Ok(()) => return,
        Err(mpsc::error::TrySendError::Full(job)) => {
            warn!(
                job_id = %job.id,
                stats = %shared.stats.snapshot(),
                "Job queue full while re-queuing, waiting"
            );
            job
        }
        Err(mpsc::error::TrySendError::Closed(job)) => {
            fail_job(shared, results, job, error).await;
            return;
        }
    };

    let mut cancelled = cancel.clone();
    tokio::select! {
        biased;
        _ = cancelled.cancelled() => {}
        permit = shared.queue_tx.reserve() => {
            if let Ok(permit) = permit {
                permit.send(job);
                return;
            }
        }
    }
    shared.emit_cancelled(results, job).await;
}

async fn fail_job(shared: &Arc<Shared>, results: &mpsc::Sender<JobResult>, mut job: Job, error: JobError) {
    let now = shared.now();
    let attempts = attempts_started(&job);
    if job.state == JobState::Running {
        if let Err(e) = job.fail(now) {
            warn!(job_id = %job.id, error = %e, "Unexpected job state on failure");
        }
    }
    error!(
        job_id = %job.id,
        repo = %job.slug(),
        attempts = attempts,
        kind = %error.kind(),
        error = %error,
        "Job failed"
    );
    let result = JobResult::failed(job.id.clone(), job.repo.slug.clone(), error, attempts, now);
    shared.emit(results, result).await;
}
