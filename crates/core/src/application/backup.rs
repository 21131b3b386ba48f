// Backup Task - the work function the worker pool runs per repository
// One attempt writes the repository document, then pull requests and issues
// (full or incremental per stream), then synchronizes the git mirror.
// Every remote call races the cancellation signal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use crate::application::git_sync::GitSynchronizer;
use crate::application::layout::BackupLayout;
use crate::application::state_tracker::StateTracker;
use crate::application::worker::{CancelToken, JobHandler};
use crate::config::BackupOptions;
use crate::domain::{
    validate_slug, BackupStats, FetchMode, Job, JobError, MetadataItem, RunOptions, Stream,
};
use crate::port::{ApiError, MetadataClient, Storage, TimeProvider};

/// Effective per-run switches of the backup task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackupSettings {
    pub full: bool,
    pub dry_run: bool,
    pub skip_git: bool,
    pub include_pr_comments: bool,
    pub include_pr_activity: bool,
    pub include_issue_comments: bool,
}

impl BackupSettings {
    pub fn new(run: &RunOptions, backup: &BackupOptions) -> Self {
        Self {
            full: run.full,
            dry_run: run.dry_run,
            skip_git: run.skip_git || backup.skip_git,
            include_pr_comments: backup.include_pr_comments,
            include_pr_activity: backup.include_pr_activity,
            include_issue_comments: backup.include_issue_comments,
        }
    }
}

/// Items and comments processed for one stream
#[derive(Debug, Default, Clone, Copy)]
struct StreamCount {
    items: u64,
    comments: u64,
}

pub struct BackupTask {
    layout: BackupLayout,
    settings: BackupSettings,
    client: Arc<dyn MetadataClient>,
    storage: Arc<dyn Storage>,
    state: Arc<StateTracker>,
    git: Arc<GitSynchronizer>,
    time_provider: Arc<dyn TimeProvider>,
}

impl BackupTask {
    pub fn new(
        layout: BackupLayout,
        settings: BackupSettings,
        client: Arc<dyn MetadataClient>,
        storage: Arc<dyn Storage>,
        state: Arc<StateTracker>,
        git: Arc<GitSynchronizer>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            layout,
            settings,
            client,
            storage,
            state,
            git,
            time_provider,
        }
    }

    fn workspace(&self) -> &str {
        self.layout.workspace()
    }

    /// Drive one API call unless cancellation fires first
    async fn remote<T, F>(
        &self,
        cancel: &CancelToken,
        call: F,
    ) -> Result<Result<T, ApiError>, JobError>
    where
        F: Future<Output = Result<T, ApiError>>,
    {
        cancel.run_until_cancelled(call).await.ok_or(JobError::Cancelled)
    }

    async fn write_json(&self, path: &str, value: &serde_json::Value) -> Result<(), JobError> {
        if self.settings.dry_run {
            return Ok(());
        }
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| JobError::Permanent(format!("cannot encode {}: {}", path, e)))?;
        self.storage.write(path, &bytes).await?;
        Ok(())
    }

    /// Record stream progress: the newest `updated_on` seen, or the fetch
    /// start time when nothing was returned
    fn advance(
        &self,
        slug: &str,
        stream: Stream,
        newest: Option<DateTime<Utc>>,
        fetch_started: DateTime<Utc>,
    ) {
        if self.settings.dry_run {
            return;
        }
        let at = newest.unwrap_or(fetch_started);
        self.state.set_last_updated(slug, stream, at);
        debug!(repo = %slug, stream = %stream, at = %at, "Stream timestamp advanced");
    }

    async fn backup_pull_requests(&self, slug: &str, cancel: &CancelToken) -> Result<StreamCount, JobError> {
        let mode = self.state.fetch_mode(slug, Stream::PullRequests, self.settings.full);
        let fetch_started = self.time_provider.now();

        let prs = self
            .remote(cancel, self.client.fetch_pull_requests(self.workspace(), slug, mode.since()))
            .await??;
        let prs = only_newer(prs, &mode);

        let mut count = StreamCount::default();
        for pr in &prs {
            self.write_json(&self.layout.pull_request(slug, pr.id), &pr.raw).await?;
            count.items += 1;

            if self.settings.include_pr_comments {
                let comments = self
                    .remote(cancel, self.client.fetch_pull_request_comments(self.workspace(), slug, pr.id))
                    .await??;
                count.comments += comments.len() as u64;
                self.write_json(
                    &self.layout.pull_request_comments(slug, pr.id),
                    &serde_json::Value::Array(comments),
                )
                .await?;
            }

            if self.settings.include_pr_activity {
                let activity = self
                    .remote(cancel, self.client.fetch_pull_request_activity(self.workspace(), slug, pr.id))
                    .await??;
                self.write_json(
                    &self.layout.pull_request_activity(slug, pr.id),
                    &serde_json::Value::Array(activity),
                )
                .await?;
            }
        }

        self.advance(slug, Stream::PullRequests, newest(&prs), fetch_started);
        info!(
            repo = %slug,
            incremental = mode.is_incremental(),
            pull_requests = count.items,
            comments = count.comments,
            "Pull requests backed up"
        );
        Ok(count)
    }

    async fn backup_issues(&self, slug: &str, cancel: &CancelToken) -> Result<StreamCount, JobError> {
        let mode = self.state.fetch_mode(slug, Stream::Issues, self.settings.full);
        let fetch_started = self.time_provider.now();

        let issues = match self
            .remote(cancel, self.client.fetch_issues(self.workspace(), slug, mode.since()))
            .await?
        {
            Ok(issues) => issues,
            Err(ApiError::NotFound(_)) => {
                debug!(repo = %slug, "Issue tracker disabled");
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        let issues = only_newer(issues, &mode);

        let mut count = StreamCount::default();
        for issue in &issues {
            self.write_json(&self.layout.issue(slug, issue.id), &issue.raw).await?;
            count.items += 1;

            if self.settings.include_issue_comments {
                let comments = self
                    .remote(cancel, self.client.fetch_issue_comments(self.workspace(), slug, issue.id))
                    .await??;
                count.comments += comments.len() as u64;
                self.write_json(
                    &self.layout.issue_comments(slug, issue.id),
                    &serde_json::Value::Array(comments),
                )
                .await?;
            }
        }

        self.advance(slug, Stream::Issues, newest(&issues), fetch_started);
        info!(
            repo = %slug,
            incremental = mode.is_incremental(),
            issues = count.items,
            comments = count.comments,
            "Issues backed up"
        );
        Ok(count)
    }
}

#[async_trait]
impl JobHandler for BackupTask {
    async fn execute(&self, job: &Job, cancel: CancelToken) -> Result<BackupStats, JobError> {
        let slug = job.slug();
        validate_slug(slug).map_err(|e| JobError::Permanent(e.to_string()))?;
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        self.write_json(&self.layout.repository(slug), &job.repo.raw).await?;

        let prs = self.backup_pull_requests(slug, &cancel).await?;
        let issues = self.backup_issues(slug, &cancel).await?;

        let mut stats = BackupStats {
            pull_requests: prs.items,
            issues: issues.items,
            comments: prs.comments + issues.comments,
            git_synced: false,
        };

        if !self.settings.skip_git && !self.settings.dry_run {
            if cancel.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            let outcome = self
                .git
                .synchronize(&job.repo.clone_url, &job.dest_path, cancel.clone())
                .await?;
            if let Some(head) = outcome.head {
                self.state.set_last_commit(slug, head);
            }
            stats.git_synced = true;
        }

        if !self.settings.dry_run {
            self.state.mark_backed_up(slug, self.time_provider.now());
        }
        Ok(stats)
    }
}

/// Drop anything not updated strictly after `since`
fn only_newer<T: MetadataItem>(items: Vec<T>, mode: &FetchMode) -> Vec<T> {
    match mode.since() {
        Some(since) => items.into_iter().filter(|i| i.updated_on() > since).collect(),
        None => items,
    }
}

fn newest<T: MetadataItem>(items: &[T]) -> Option<DateTime<Utc>> {
    items.iter().map(|i| i.updated_on()).max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::fixtures::repo;
    use crate::domain::{IncrementalState, Issue, PullRequest};
    use crate::port::git_backend::mocks::{MockGitBackend, MockGitBehavior};
    use crate::port::metadata_client::mocks::MockMetadataClient;
    use crate::port::storage::mocks::MemoryStorage;
    use crate::port::time_provider::mocks::FixedTimeProvider;
    use crate::port::GitError;
    use chrono::TimeZone;
    use std::time::Duration;
    use tempfile::TempDir;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn pr(id: u64, updated: i64) -> PullRequest {
        PullRequest {
            id,
            title: format!("PR {}", id),
            updated_on: ts(updated),
            raw: serde_json::json!({ "id": id }),
        }
    }

    fn issue(id: u64, updated: i64) -> Issue {
        Issue {
            id,
            title: format!("Issue {}", id),
            updated_on: ts(updated),
            raw: serde_json::json!({ "id": id }),
        }
    }

    fn all_on() -> BackupSettings {
        BackupSettings {
            include_pr_comments: true,
            include_pr_activity: true,
            include_issue_comments: true,
            ..Default::default()
        }
    }

    struct Harness {
        dir: TempDir,
        client: Arc<MockMetadataClient>,
        storage: Arc<MemoryStorage>,
        state: Arc<StateTracker>,
        git: Arc<MockGitBackend>,
        clock: Arc<FixedTimeProvider>,
    }

    impl Harness {
        fn new(client: MockMetadataClient) -> Self {
            Self::with_git(client, MockGitBackend::new_success())
        }

        fn with_git(client: MockMetadataClient, git: MockGitBackend) -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                client: Arc::new(client),
                storage: Arc::new(MemoryStorage::new()),
                state: Arc::new(StateTracker::new("unused", IncrementalState::new("acme"))),
                git: Arc::new(git),
                clock: Arc::new(FixedTimeProvider::new(ts(10_000))),
            }
        }

        fn task(&self, settings: BackupSettings) -> BackupTask {
            BackupTask::new(
                BackupLayout::new("acme"),
                settings,
                self.client.clone(),
                self.storage.clone(),
                self.state.clone(),
                Arc::new(GitSynchronizer::new(self.git.clone(), None, Duration::from_secs(30))),
                self.clock.clone(),
            )
        }

        fn job(&self, slug: &str) -> Job {
            Job::new(
                format!("job-{}", slug),
                0,
                repo(slug),
                self.dir.path().join(slug),
                2,
            )
        }
    }

    #[tokio::test]
    async fn test_full_backup_writes_metadata_and_mirror() {
        let client = MockMetadataClient::new()
            .with_pull_requests("api", vec![pr(1, 100), pr(2, 300)])
            .with_issues("api", vec![issue(5, 200)])
            .with_comments(vec![serde_json::json!({"id": 1}), serde_json::json!({"id": 2})]);
        let h = Harness::new(client);

        let stats = h
            .task(all_on())
            .execute(&h.job("api"), CancelToken::never())
            .await
            .unwrap();

        assert_eq!(stats.pull_requests, 2);
        assert_eq!(stats.issues, 1);
        assert_eq!(stats.comments, 6);
        assert!(stats.git_synced);

        let paths = h.storage.paths();
        for expected in [
            "acme/repositories/api/repository.json",
            "acme/repositories/api/pull_requests/1.json",
            "acme/repositories/api/pull_requests/2/comments.json",
            "acme/repositories/api/pull_requests/2/activity.json",
            "acme/repositories/api/issues/5.json",
            "acme/repositories/api/issues/5/comments.json",
        ] {
            assert!(paths.iter().any(|p| p == expected), "missing {}", expected);
        }

        let state = h.state.repository("api").unwrap();
        assert_eq!(state.last_pr_updated, Some(ts(300)));
        assert_eq!(state.last_issue_updated, Some(ts(200)));
        assert_eq!(state.last_backed_up, Some(ts(10_000)));
        assert!(state.last_commit.is_some());
        assert!(h.dir.path().join("api").join("HEAD").exists());
    }

    #[tokio::test]
    async fn test_incremental_fetches_only_newer_items() {
        let client = MockMetadataClient::new().with_pull_requests("api", vec![pr(1, 100), pr(2, 300)]);
        let h = Harness::new(client);
        h.state.set_last_pr_updated("api", ts(200));

        let stats = h
            .task(BackupSettings::default())
            .execute(&h.job("api"), CancelToken::never())
            .await
            .unwrap();

        assert_eq!(stats.pull_requests, 1);
        assert_eq!(h.client.since_seen("api", "pull_requests"), Some(Some(ts(200))));
        // Issues had no timestamp, so that stream ran full
        assert_eq!(h.client.since_seen("api", "issues"), Some(None));
        assert!(h.storage.get_json("acme/repositories/api/pull_requests/2.json").is_some());
        assert!(h.storage.get_json("acme/repositories/api/pull_requests/1.json").is_none());
        assert_eq!(h.state.last_pr_updated("api"), Some(ts(300)));
    }

    #[tokio::test]
    async fn test_forced_full_ignores_timestamps() {
        let client = MockMetadataClient::new().with_pull_requests("api", vec![pr(1, 100)]);
        let h = Harness::new(client);
        h.state.set_last_pr_updated("api", ts(200));

        let settings = BackupSettings {
            full: true,
            ..Default::default()
        };
        let stats = h.task(settings).execute(&h.job("api"), CancelToken::never()).await.unwrap();

        assert_eq!(stats.pull_requests, 1);
        assert_eq!(h.client.since_seen("api", "pull_requests"), Some(None));
    }

    #[tokio::test]
    async fn test_zero_results_advance_both_streams_to_fetch_start() {
        let h = Harness::new(MockMetadataClient::new());

        h.task(BackupSettings::default())
            .execute(&h.job("quiet"), CancelToken::never())
            .await
            .unwrap();

        assert_eq!(h.state.last_pr_updated("quiet"), Some(ts(10_000)));
        assert_eq!(h.state.last_issue_updated("quiet"), Some(ts(10_000)));
        assert_eq!(
            h.state.fetch_mode("quiet", Stream::Issues, false),
            FetchMode::Incremental { since: ts(10_000) }
        );
    }

    #[tokio::test]
    async fn test_disabled_issue_tracker_is_not_a_failure() {
        let client = MockMetadataClient::new()
            .with_pull_requests("api", vec![pr(1, 100)])
            .without_issue_tracker("api");
        let h = Harness::new(client);

        let stats = h
            .task(BackupSettings::default())
            .execute(&h.job("api"), CancelToken::never())
            .await
            .unwrap();
        assert_eq!(stats.issues, 0);
        assert_eq!(stats.pull_requests, 1);
    }

    #[tokio::test]
    async fn test_dry_run_counts_without_side_effects() {
        let client = MockMetadataClient::new()
            .with_pull_requests("api", vec![pr(1, 100), pr(2, 300)])
            .with_issues("api", vec![issue(5, 200)]);
        let h = Harness::new(client);

        let settings = BackupSettings {
            dry_run: true,
            ..Default::default()
        };
        let stats = h.task(settings).execute(&h.job("api"), CancelToken::never()).await.unwrap();

        assert_eq!(stats.pull_requests, 2);
        assert_eq!(stats.issues, 1);
        assert!(!stats.git_synced);
        assert!(h.storage.paths().is_empty());
        assert_eq!(h.git.call_count(), 0);
        assert!(h.state.repository("api").is_none());
    }

    #[tokio::test]
    async fn test_skip_git_leaves_mirror_alone() {
        let h = Harness::new(MockMetadataClient::new());
        let settings = BackupSettings {
            skip_git: true,
            ..Default::default()
        };
        let stats = h.task(settings).execute(&h.job("api"), CancelToken::never()).await.unwrap();
        assert!(!stats.git_synced);
        assert_eq!(h.git.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_job_does_nothing() {
        let h = Harness::new(MockMetadataClient::new());
        let (sender, token) = crate::application::worker::cancel_channel();
        sender.cancel();

        let err = h
            .task(BackupSettings::default())
            .execute(&h.job("api"), token)
            .await
            .unwrap_err();
        assert_eq!(err, JobError::Cancelled);
        assert!(h.storage.paths().is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_classified() {
        let client = MockMetadataClient::new()
            .fail_repository("locked", ApiError::Unauthorized("bad app password".into()));
        let h = Harness::new(client);
        let err = h
            .task(BackupSettings::default())
            .execute(&h.job("locked"), CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Permanent(_)));

        let git = MockGitBackend::new(
            "libgit2",
            MockGitBehavior::Fail(GitError::Remote("connection reset".into())),
        );
        let h = Harness::with_git(MockMetadataClient::new(), git);
        let err = h
            .task(BackupSettings::default())
            .execute(&h.job("api"), CancelToken::never())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        // Metadata progress survives a git failure
        assert!(h.state.last_pr_updated("api").is_some());
    }

    #[tokio::test]
    async fn test_invalid_slug_is_permanent() {
        let h = Harness::new(MockMetadataClient::new());
        let mut job = h.job("api");
        job.repo.slug = "../etc".to_string();
        let err = h
            .task(BackupSettings::default())
            .execute(&job, CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Permanent(_)));
    }
}
