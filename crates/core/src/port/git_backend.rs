// Git Backend Port
// Two interchangeable implementations (in-process library, external executable)
// sit behind this trait; the synchronizer chooses between them.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::application::worker::CancelToken;
use crate::domain::JobError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitOperation {
    Clone,
    Fetch,
}

impl std::fmt::Display for GitOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitOperation::Clone => write!(f, "clone"),
            GitOperation::Fetch => write!(f, "fetch"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GitError {
    #[error("git {operation} timed out after {}s", .after.as_secs())]
    Timeout {
        operation: GitOperation,
        after: Duration,
    },

    #[error("git operation cancelled")]
    Cancelled,

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Repository not found: {0}")]
    NotFound(String),

    /// Network or server-side failure reported by the remote
    #[error("Remote error: {0}")]
    Remote(String),

    /// Defect of the git implementation itself (corrupt pack, early EOF,
    /// invalid internal reference, recovered panic)
    #[error("Git implementation error: {0}")]
    Implementation(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("git backend unavailable: {0}")]
    Unavailable(String),

    #[error("all git backends failed (primary: {primary}; fallback: {fallback})")]
    Exhausted {
        primary: Box<GitError>,
        fallback: Box<GitError>,
    },
}

impl GitError {
    /// Only implementation defects are worth repeating with the other backend
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(self, GitError::Implementation(_))
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            GitError::Timeout { .. } => true,
            GitError::Exhausted { fallback, .. } => fallback.is_timeout(),
            _ => false,
        }
    }
}

impl From<GitError> for JobError {
    fn from(err: GitError) -> Self {
        let message = err.to_string();
        let decisive = match &err {
            GitError::Exhausted { fallback, .. } => fallback.as_ref(),
            other => other,
        };
        match decisive {
            GitError::Timeout { .. } => JobError::Timeout(message),
            GitError::Cancelled => JobError::Cancelled,
            GitError::Auth(_) | GitError::NotFound(_) => JobError::Permanent(message),
            _ => JobError::Transient(message),
        }
    }
}

/// Classify a git failure from its message text.
///
/// Shared by both backends: libgit2 messages and `git` stderr use the same
/// vocabulary for the cases that matter here.
pub fn classify_failure(message: &str) -> GitError {
    let lower = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&[
        "authentication",
        "could not read username",
        "could not read password",
        "invalid credentials",
        "permission denied",
        "status code: 401",
        "status code: 403",
        "403 forbidden",
        "401 unauthorized",
    ]) {
        return GitError::Auth(message.trim().to_string());
    }

    if has(&[
        "packfile",
        "pack-objects",
        "index-pack",
        "early eof",
        "unexpected eof",
        "unexpected end",
        "invalid pack",
        "bad object",
        "missing object",
        "corrupt",
        "zlib",
        "invalid reference",
        "reference is not valid",
        "null pointer",
        "nil pointer",
        "object not found",
        "reference '",
    ]) {
        return GitError::Implementation(message.trim().to_string());
    }

    // Only remote-side phrasings; "not found" alone also covers local objects
    let missing_repository = lower.contains("repository '") && lower.contains("not found");
    if missing_repository
        || has(&[
            "repository not found",
            "does not appear to be a git repository",
            "could not find repository",
            "status code: 404",
            "404 not found",
        ])
    {
        return GitError::NotFound(message.trim().to_string());
    }

    GitError::Remote(message.trim().to_string())
}

/// One clone or fetch request
#[derive(Clone)]
pub struct GitRequest {
    pub remote_url: String,
    pub local_path: PathBuf,
    /// Absolute deadline for the whole operation
    pub deadline: tokio::time::Instant,
    pub cancel: CancelToken,
}

impl GitRequest {
    pub fn remaining(&self) -> Duration {
        self.deadline
            .saturating_duration_since(tokio::time::Instant::now())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitOutput {
    /// Resolved HEAD after the operation, when the backend can report it
    pub head: Option<String>,
}

/// Git implementation
#[async_trait]
pub trait GitBackend: Send + Sync {
    /// Short name for logs ("libgit2", "git-cli")
    fn name(&self) -> &'static str;

    /// Create a bare mirror clone at `request.local_path` (which does not exist)
    async fn clone_mirror(&self, request: &GitRequest) -> Result<GitOutput, GitError>;

    /// Fetch all refs into an existing mirror, pruning stale ones
    async fn fetch_mirror(&self, request: &GitRequest) -> Result<GitOutput, GitError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Mock backend behavior
    #[derive(Debug, Clone)]
    pub enum MockGitBehavior {
        /// Succeed and write the mirror marker
        Success,
        /// Fail with the given error
        Fail(GitError),
        /// Panic with message (for fault isolation testing)
        Panic(String),
        /// Report a timeout without waiting
        Timeout,
        /// Block until the deadline passes or cancellation fires
        Hang,
    }

    /// Scripted git backend
    pub struct MockGitBackend {
        name: &'static str,
        default: MockGitBehavior,
        per_url: Mutex<HashMap<String, MockGitBehavior>>,
        calls: Mutex<Vec<(GitOperation, String)>>,
    }

    impl MockGitBackend {
        pub fn new(name: &'static str, default: MockGitBehavior) -> Self {
            Self {
                name,
                default,
                per_url: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn new_success() -> Self {
            Self::new("mock", MockGitBehavior::Success)
        }

        /// Override the behavior for remotes whose URL contains `needle`
        pub fn with_behavior_for(self, needle: &str, behavior: MockGitBehavior) -> Self {
            self.per_url
                .lock()
                .unwrap()
                .insert(needle.to_string(), behavior);
            self
        }

        pub fn calls(&self) -> Vec<(GitOperation, String)> {
            self.calls.lock().unwrap().clone()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn behavior_for(&self, url: &str) -> MockGitBehavior {
            self.per_url
                .lock()
                .unwrap()
                .iter()
                .find(|(needle, _)| url.contains(needle.as_str()))
                .map(|(_, b)| b.clone())
                .unwrap_or_else(|| self.default.clone())
        }

        async fn run(
            &self,
            operation: GitOperation,
            request: &GitRequest,
        ) -> Result<GitOutput, GitError> {
            self.calls
                .lock()
                .unwrap()
                .push((operation, request.remote_url.clone()));

            match self.behavior_for(&request.remote_url) {
                MockGitBehavior::Success => {
                    if tokio::fs::create_dir_all(&request.local_path).await.is_ok() {
                        let _ = tokio::fs::write(
                            request.local_path.join("HEAD"),
                            b"ref: refs/heads/main\n",
                        )
                        .await;
                    }
                    Ok(GitOutput {
                        head: Some("0123456789abcdef0123456789abcdef01234567".to_string()),
                    })
                }
                MockGitBehavior::Fail(err) => Err(err),
                MockGitBehavior::Panic(msg) => panic!("{}", msg),
                MockGitBehavior::Timeout => Err(GitError::Timeout {
                    operation,
                    after: Duration::ZERO,
                }),
                MockGitBehavior::Hang => {
                    let mut cancel = request.cancel.clone();
                    tokio::select! {
                        _ = tokio::time::sleep_until(request.deadline) => Err(GitError::Timeout {
                            operation,
                            after: Duration::ZERO,
                        }),
                        _ = cancel.cancelled() => Err(GitError::Cancelled),
                    }
                }
            }
        }
    }

    #[async_trait]
    impl GitBackend for MockGitBackend {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn clone_mirror(&self, request: &GitRequest) -> Result<GitOutput, GitError> {
            self.run(GitOperation::Clone, request).await
        }

        async fn fetch_mirror(&self, request: &GitRequest) -> Result<GitOutput, GitError> {
            self.run(GitOperation::Fetch, request).await
        }
    }
}
