// Metadata API Port
// Workspace enumeration and per-repository metadata streams

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{Issue, JobError, Project, PullRequest, Repository};

/// Errors surfaced by the metadata API client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Rate limited: gave up after {attempts} throttled attempts")]
    Throttled { attempts: u32 },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

impl ApiError {
    /// Whether a later attempt of the same call may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Throttled { .. } | ApiError::Transport(_) => true,
            ApiError::Status { status, .. } => *status >= 500,
            ApiError::Unauthorized(_) | ApiError::NotFound(_) | ApiError::Decode(_) => false,
        }
    }
}

impl From<ApiError> for JobError {
    fn from(err: ApiError) -> Self {
        if err.is_retryable() {
            JobError::Transient(err.to_string())
        } else {
            JobError::Permanent(err.to_string())
        }
    }
}

/// Remote metadata API.
///
/// Every list call follows continuation links until exhausted. Calls with a
/// `since` timestamp return only items updated strictly after it.
#[async_trait]
pub trait MetadataClient: Send + Sync {
    async fn fetch_projects(&self, workspace: &str) -> Result<Vec<Project>, ApiError>;

    async fn fetch_repositories(&self, workspace: &str) -> Result<Vec<Repository>, ApiError>;

    async fn fetch_pull_requests(
        &self,
        workspace: &str,
        slug: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PullRequest>, ApiError>;

    /// `ApiError::NotFound` means the repository has no issue tracker
    async fn fetch_issues(
        &self,
        workspace: &str,
        slug: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Issue>, ApiError>;

    async fn fetch_pull_request_comments(
        &self,
        workspace: &str,
        slug: &str,
        pr_id: u64,
    ) -> Result<Vec<serde_json::Value>, ApiError>;

    async fn fetch_pull_request_activity(
        &self,
        workspace: &str,
        slug: &str,
        pr_id: u64,
    ) -> Result<Vec<serde_json::Value>, ApiError>;

    async fn fetch_issue_comments(
        &self,
        workspace: &str,
        slug: &str,
        issue_id: u64,
    ) -> Result<Vec<serde_json::Value>, ApiError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockData {
        projects: Vec<Project>,
        repositories: Vec<Repository>,
        pull_requests: HashMap<String, Vec<PullRequest>>,
        issues: HashMap<String, Vec<Issue>>,
        comments: Vec<serde_json::Value>,
        failures: HashMap<String, ApiError>,
        issues_disabled: Vec<String>,
        repositories_error: Option<ApiError>,
        calls: Vec<String>,
        since_seen: HashMap<String, Option<DateTime<Utc>>>,
    }

    /// In-memory metadata API with scripted failures
    #[derive(Default)]
    pub struct MockMetadataClient {
        data: Mutex<MockData>,
    }

    impl MockMetadataClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_project(self, project: Project) -> Self {
            self.data.lock().unwrap().projects.push(project);
            self
        }

        pub fn with_repository(self, repo: Repository) -> Self {
            self.data.lock().unwrap().repositories.push(repo);
            self
        }

        pub fn with_pull_requests(self, slug: &str, prs: Vec<PullRequest>) -> Self {
            self.data
                .lock()
                .unwrap()
                .pull_requests
                .insert(slug.to_string(), prs);
            self
        }

        pub fn with_issues(self, slug: &str, issues: Vec<Issue>) -> Self {
            self.data
                .lock()
                .unwrap()
                .issues
                .insert(slug.to_string(), issues);
            self
        }

        /// Comments returned for every PR/issue comment or activity call
        pub fn with_comments(self, comments: Vec<serde_json::Value>) -> Self {
            self.data.lock().unwrap().comments = comments;
            self
        }

        /// Every per-repository call for `slug` fails with `err`
        pub fn fail_repository(self, slug: &str, err: ApiError) -> Self {
            self.data
                .lock()
                .unwrap()
                .failures
                .insert(slug.to_string(), err);
            self
        }

        /// `fetch_issues` for `slug` answers 404 (no issue tracker)
        pub fn without_issue_tracker(self, slug: &str) -> Self {
            self.data
                .lock()
                .unwrap()
                .issues_disabled
                .push(slug.to_string());
            self
        }

        pub fn fail_enumeration(self, err: ApiError) -> Self {
            self.data.lock().unwrap().repositories_error = Some(err);
            self
        }

        pub fn set_pull_requests(&self, slug: &str, prs: Vec<PullRequest>) {
            self.data
                .lock()
                .unwrap()
                .pull_requests
                .insert(slug.to_string(), prs);
        }

        pub fn calls(&self) -> Vec<String> {
            self.data.lock().unwrap().calls.clone()
        }

        /// `since` passed on the last call for `slug`/`stream`
        pub fn since_seen(&self, slug: &str, stream: &str) -> Option<Option<DateTime<Utc>>> {
            self.data
                .lock()
                .unwrap()
                .since_seen
                .get(&format!("{}/{}", slug, stream))
                .copied()
        }

        fn record(&self, call: String) {
            self.data.lock().unwrap().calls.push(call);
        }

        fn failure_for(&self, slug: &str) -> Option<ApiError> {
            self.data.lock().unwrap().failures.get(slug).cloned()
        }
    }

    #[async_trait]
    impl MetadataClient for MockMetadataClient {
        async fn fetch_projects(&self, workspace: &str) -> Result<Vec<Project>, ApiError> {
            self.record(format!("projects:{}", workspace));
            Ok(self.data.lock().unwrap().projects.clone())
        }

        async fn fetch_repositories(&self, workspace: &str) -> Result<Vec<Repository>, ApiError> {
            self.record(format!("repositories:{}", workspace));
            let data = self.data.lock().unwrap();
            if let Some(err) = &data.repositories_error {
                return Err(err.clone());
            }
            Ok(data.repositories.clone())
        }

        async fn fetch_pull_requests(
            &self,
            _workspace: &str,
            slug: &str,
            since: Option<DateTime<Utc>>,
        ) -> Result<Vec<PullRequest>, ApiError> {
            self.record(format!("pull_requests:{}", slug));
            if let Some(err) = self.failure_for(slug) {
                return Err(err);
            }
            let mut data = self.data.lock().unwrap();
            data.since_seen
                .insert(format!("{}/pull_requests", slug), since);
            let prs = data.pull_requests.get(slug).cloned().unwrap_or_default();
            Ok(prs
                .into_iter()
                .filter(|pr| since.map_or(true, |s| pr.updated_on > s))
                .collect())
        }

        async fn fetch_issues(
            &self,
            _workspace: &str,
            slug: &str,
            since: Option<DateTime<Utc>>,
        ) -> Result<Vec<Issue>, ApiError> {
            self.record(format!("issues:{}", slug));
            if let Some(err) = self.failure_for(slug) {
                return Err(err);
            }
            let mut data = self.data.lock().unwrap();
            if data.issues_disabled.iter().any(|s| s == slug) {
                return Err(ApiError::NotFound(format!("{}/issues", slug)));
            }
            data.since_seen.insert(format!("{}/issues", slug), since);
            let issues = data.issues.get(slug).cloned().unwrap_or_default();
            Ok(issues
                .into_iter()
                .filter(|issue| since.map_or(true, |s| issue.updated_on > s))
                .collect())
        }

        async fn fetch_pull_request_comments(
            &self,
            _workspace: &str,
            slug: &str,
            pr_id: u64,
        ) -> Result<Vec<serde_json::Value>, ApiError> {
            self.record(format!("pr_comments:{}#{}", slug, pr_id));
            Ok(self.data.lock().unwrap().comments.clone())
        }

        async fn fetch_pull_request_activity(
            &self,
            _workspace: &str,
            slug: &str,
            pr_id: u64,
        ) -> Result<Vec<serde_json::Value>, ApiError> {
            self.record(format!("pr_activity:{}#{}", slug, pr_id));
            Ok(self.data.lock().unwrap().comments.clone())
        }

        async fn fetch_issue_comments(
            &self,
            _workspace: &str,
            slug: &str,
            issue_id: u64,
        ) -> Result<Vec<serde_json::Value>, ApiError> {
            self.record(format!("issue_comments:{}#{}", slug, issue_id));
            Ok(self.data.lock().unwrap().comments.clone())
        }
    }
}
