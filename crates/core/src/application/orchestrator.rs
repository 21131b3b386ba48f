// Backup Orchestrator - top-level driver of one run
// Preconditions, workspace enumeration, one job per repository through the
// worker pool, incremental state bookkeeping, then the manifest.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::application::backup::{BackupSettings, BackupTask};
use crate::application::git_sync::GitSynchronizer;
use crate::application::layout::BackupLayout;
use crate::application::retry::RetryPolicy;
use crate::application::state_tracker::StateTracker;
use crate::application::worker::{CancelToken, StatsSnapshot, WorkerPool, WorkerPoolStats};
use crate::config::BackupConfig;
use crate::domain::{
    FailureRecord, Job, JobError, JobOutcome, JobResult, Manifest, RepoSlug, Repository,
    RunCounters, RunOptions,
};
use crate::error::{AppError, Result};
use crate::port::{ApiError, IdProvider, MetadataClient, Storage, TimeProvider};

/// A repository that ended the run failed
#[derive(Debug, Clone)]
pub struct FailedRepo {
    pub slug: RepoSlug,
    pub error: JobError,
    pub attempts: u32,
}

/// Outcome of `BackupOrchestrator::run`
#[derive(Debug, Clone)]
pub struct RunReport {
    pub manifest: Manifest,
    pub cancelled: bool,
    pub failures: Vec<FailedRepo>,
    pub pool_stats: StatsSnapshot,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

pub struct BackupOrchestrator {
    config: BackupConfig,
    client: Arc<dyn MetadataClient>,
    storage: Arc<dyn Storage>,
    git: Arc<GitSynchronizer>,
    time_provider: Arc<dyn TimeProvider>,
    id_provider: Arc<dyn IdProvider>,
}

impl BackupOrchestrator {
    pub fn new(
        config: BackupConfig,
        client: Arc<dyn MetadataClient>,
        storage: Arc<dyn Storage>,
        git: Arc<GitSynchronizer>,
        time_provider: Arc<dyn TimeProvider>,
        id_provider: Arc<dyn IdProvider>,
    ) -> Self {
        Self {
            config,
            client,
            storage,
            git,
            time_provider,
            id_provider,
        }
    }

    fn layout(&self) -> BackupLayout {
        BackupLayout::new(self.config.workspace.clone())
    }

    async fn load_state(&self) -> Result<StateTracker> {
        StateTracker::load(self.config.state_path(), &self.config.workspace).await
    }

    /// Run one backup of the configured workspace.
    ///
    /// Fatal conditions (unwritable storage, corrupt state, failed
    /// enumeration) return `Err` before anything is written. Per-repository
    /// failures do not: they land in the report and the failure ledger.
    pub async fn run(&self, options: RunOptions, cancel: CancelToken) -> Result<RunReport> {
        let workspace = self.config.workspace.as_str();
        let layout = self.layout();

        if !options.dry_run {
            self.storage
                .ensure_writable()
                .await
                .map_err(|e| AppError::StorageUnavailable(e.to_string()))?;
        }
        let state = Arc::new(self.load_state().await?);
        let had_previous = state.has_previous_backup();
        let incremental = had_previous && !options.full;
        let started_at = self.time_provider.now();

        info!(
            workspace = %workspace,
            incremental = incremental,
            dry_run = options.dry_run,
            retry_failed = options.retry_failed,
            "Starting backup run"
        );

        let projects = enumerate(&cancel, self.client.fetch_projects(workspace)).await?;
        let repositories = enumerate(&cancel, self.client.fetch_repositories(workspace)).await?;
        if !options.dry_run {
            for project in &projects {
                let bytes = serde_json::to_vec_pretty(&project.raw)?;
                self.storage.write(&layout.project(&project.key), &bytes).await?;
            }
        }

        let targets = select_targets(repositories, &options, &self.config, &state.failed_slugs());
        info!(
            projects = projects.len(),
            repositories = targets.len(),
            "Workspace enumerated"
        );

        let jobs: Vec<Job> = targets
            .into_iter()
            .map(|repo| {
                let dest = self.storage.local_path(&layout.mirror(&repo.slug));
                Job::new(
                    self.id_provider.generate_id(),
                    self.time_provider.now_millis(),
                    repo,
                    dest,
                    self.config.workers.max_job_retries,
                )
            })
            .collect();

        let task = Arc::new(BackupTask::new(
            layout.clone(),
            BackupSettings::new(&options, &self.config.backup),
            Arc::clone(&self.client),
            Arc::clone(&self.storage),
            Arc::clone(&state),
            Arc::clone(&self.git),
            Arc::clone(&self.time_provider),
        ));
        let retry_policy = Arc::new(RetryPolicy::new(self.config.workers.retry_base_delay()));
        let capacity = jobs.len().max(1) * (self.config.workers.max_job_retries as usize + 1);

        let mut pool = WorkerPool::new(task, retry_policy, Arc::clone(&self.time_provider), capacity);
        let pool_stats = pool.stats();
        let results = pool
            .take_results()
            .ok_or_else(|| AppError::Internal("result stream already taken".to_string()))?;
        pool.start(cancel.clone(), self.config.workers.git_workers);
        for job in jobs {
            pool.submit(job).await?;
        }
        pool.close();

        let (_, (mut counters, failures)) = tokio::join!(
            pool.wait(),
            self.collect(results, &state, &pool_stats, options.dry_run)
        );
        counters.projects = projects.len() as u64;

        let cancelled = cancel.is_cancelled();
        let completed_at = self.time_provider.now();
        let manifest = Manifest {
            workspace: workspace.to_string(),
            started_at,
            completed_at,
            counters,
            options: options.clone(),
            incremental,
            tool_version: crate::VERSION.to_string(),
        };

        if !options.dry_run {
            if !cancelled {
                if incremental {
                    state.mark_incremental_backup(completed_at);
                } else {
                    state.mark_full_backup(completed_at);
                }
            }
            state.save().await?;

            if !cancelled {
                let bytes = serde_json::to_vec_pretty(&manifest)?;
                self.storage.write(&layout.manifest(), &bytes).await?;
            }
        }

        let pool_stats = pool_stats.snapshot();
        info!(
            workspace = %workspace,
            repositories = counters.repositories,
            pull_requests = counters.pull_requests,
            issues = counters.issues,
            failures = counters.failures,
            cancelled = cancelled,
            stats = %pool_stats,
            "Backup run finished"
        );

        Ok(RunReport {
            manifest,
            cancelled,
            failures,
            pool_stats,
        })
    }

    /// Apply results to the state as they arrive, checkpointing periodically
    async fn collect(
        &self,
        mut results: mpsc::Receiver<JobResult>,
        state: &StateTracker,
        stats: &WorkerPoolStats,
        dry_run: bool,
    ) -> (RunCounters, Vec<FailedRepo>) {
        let mut counters = RunCounters::default();
        let mut failures = Vec::new();
        let mut seen = 0usize;

        while let Some(result) = results.recv().await {
            stats.result_read();
            seen += 1;

            match result.outcome {
                JobOutcome::Succeeded => {
                    counters.repositories += 1;
                    counters.pull_requests += result.stats.pull_requests;
                    counters.issues += result.stats.issues;
                    counters.comments += result.stats.comments;
                    if state.clear_failure(&result.repo) {
                        info!(repo = %result.repo, "Previously failed repository recovered");
                    }
                }
                JobOutcome::Failed => {
                    counters.failures += 1;
                    let error = result
                        .error
                        .unwrap_or_else(|| JobError::Transient("unknown failure".to_string()));
                    state.record_failure(&result.repo, &error, result.attempts, self.time_provider.now());
                    failures.push(FailedRepo {
                        slug: result.repo,
                        error,
                        attempts: result.attempts,
                    });
                }
                JobOutcome::Cancelled => counters.cancelled += 1,
            }

            if !dry_run && seen % self.config.backup.checkpoint_every.max(1) == 0 {
                if let Err(e) = state.save().await {
                    warn!(error = %e, "State checkpoint failed");
                }
            }
        }

        failures.sort_by(|a, b| a.slug.cmp(&b.slug));
        (counters, failures)
    }

    pub async fn list_failures(&self) -> Result<Vec<(RepoSlug, FailureRecord)>> {
        Ok(self.load_state().await?.list_failures())
    }

    /// Empty the failure ledger without running; returns the number cleared
    pub async fn clear_failures(&self) -> Result<usize> {
        let state = self.load_state().await?;
        let cleared = state.clear_all_failures();
        if cleared > 0 {
            state.save().await?;
        }
        Ok(cleared)
    }
}

/// Drive one enumeration call; failure here is fatal to the run
async fn enumerate<T, F>(cancel: &CancelToken, call: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, ApiError>>,
{
    match cancel.run_until_cancelled(call).await {
        None => Err(AppError::Cancelled),
        Some(Ok(value)) => Ok(value),
        Some(Err(e)) => {
            error!(error = %e, "Workspace enumeration failed");
            Err(e.into())
        }
    }
}

/// Repositories this run backs up.
///
/// In retry-failed mode the ledger is the include-set. Otherwise the run's
/// include list wins over the configured one. Excludes from both apply.
pub fn select_targets(
    repositories: Vec<Repository>,
    options: &RunOptions,
    config: &BackupConfig,
    failed: &[RepoSlug],
) -> Vec<Repository> {
    let include: Option<BTreeSet<&str>> = if options.retry_failed {
        Some(failed.iter().map(String::as_str).collect())
    } else if !options.include.is_empty() {
        Some(options.include.iter().map(String::as_str).collect())
    } else if !config.backup.include.is_empty() {
        Some(config.backup.include.iter().map(String::as_str).collect())
    } else {
        None
    };
    let exclude: BTreeSet<&str> = options
        .exclude
        .iter()
        .chain(config.backup.exclude.iter())
        .map(String::as_str)
        .collect();

    repositories
        .into_iter()
        .filter(|repo| include.as_ref().map_or(true, |set| set.contains(repo.slug.as_str())))
        .filter(|repo| !exclude.contains(repo.slug.as_str()))
        .collect()
}
