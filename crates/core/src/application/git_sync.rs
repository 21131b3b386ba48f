// Git Synchronizer - one local bare mirror per repository
// NotPresent -> clone(mirror) -> Present, Present -> fetch(prune) -> Present.
// Present means the completion marker written after a successful clone.
// An implementation defect in the primary backend (corrupt pack, early EOF,
// invalid internal reference, panic) repeats the operation on the fallback;
// timeouts, cancellations and remote errors are returned as-is.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::application::worker::constants::{BACKEND_STOP_GRACE, MIRROR_MARKER_FILE};
use crate::application::worker::{execute_guarded_async, CancelToken, PanicGuardResult};
use crate::port::{GitBackend, GitError, GitOperation, GitOutput, GitRequest};

/// Lock files a crashed fetch can leave behind in a bare repository
const STALE_LOCK_FILES: &[&str] = &["config.lock", "packed-refs.lock", "shallow.lock", "HEAD.lock"];

/// What a successful synchronization did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub operation: GitOperation,
    /// Backend that completed the operation
    pub backend: &'static str,
    pub used_fallback: bool,
    pub head: Option<String>,
}

/// How a backend attempt ended from the synchronizer's point of view
enum Settled {
    Finished(PanicGuardResult<Result<GitOutput, GitError>>),
    Cancelled,
    Overdue,
}

pub struct GitSynchronizer {
    primary: Arc<dyn GitBackend>,
    fallback: Option<Arc<dyn GitBackend>>,
    timeout: Duration,
}

impl GitSynchronizer {
    pub fn new(
        primary: Arc<dyn GitBackend>,
        fallback: Option<Arc<dyn GitBackend>>,
        timeout: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether `local_path` holds a mirror whose clone completed
    pub async fn is_present(local_path: &Path) -> bool {
        tokio::fs::try_exists(local_path.join(MIRROR_MARKER_FILE))
            .await
            .unwrap_or(false)
    }

    /// Clone `remote_url` into `local_path` if absent, otherwise fetch.
    ///
    /// The whole call, fallback included, shares one deadline of
    /// `self.timeout` from now.
    pub async fn synchronize(
        &self,
        remote_url: &str,
        local_path: &Path,
        cancel: CancelToken,
    ) -> Result<SyncOutcome, GitError> {
        if cancel.is_cancelled() {
            return Err(GitError::Cancelled);
        }

        let operation = if Self::is_present(local_path).await {
            GitOperation::Fetch
        } else {
            // Anything without the marker is an interrupted clone
            discard_partial(GitOperation::Clone, local_path).await?;
            GitOperation::Clone
        };

        let request = GitRequest {
            remote_url: remote_url.to_string(),
            local_path: PathBuf::from(local_path),
            deadline: Instant::now() + self.timeout,
            cancel,
        };

        debug!(
            path = %local_path.display(),
            operation = %operation,
            backend = self.primary.name(),
            "Synchronizing mirror"
        );

        let primary_err = match self.attempt(&self.primary, operation, &request).await {
            Ok(output) => return self.finish(operation, &self.primary, false, output, local_path).await,
            Err(err) => err,
        };

        let fallback = match &self.fallback {
            Some(fallback) if primary_err.is_fallback_eligible() => fallback,
            _ => return Err(primary_err),
        };
        if request.cancel.is_cancelled() {
            return Err(GitError::Cancelled);
        }

        warn!(
            path = %local_path.display(),
            operation = %operation,
            primary = self.primary.name(),
            fallback = fallback.name(),
            error = %primary_err,
            "Primary git backend failed, retrying with fallback"
        );
        discard_partial(operation, local_path).await?;

        match self.attempt(fallback, operation, &request).await {
            Ok(output) => self.finish(operation, fallback, true, output, local_path).await,
            Err(fallback_err) => Err(GitError::Exhausted {
                primary: Box::new(primary_err),
                fallback: Box::new(fallback_err),
            }),
        }
    }

    /// One backend attempt. A failed clone is always discarded and any
    /// timeout is reported against the synchronizer's budget.
    async fn attempt(
        &self,
        backend: &Arc<dyn GitBackend>,
        operation: GitOperation,
        request: &GitRequest,
    ) -> Result<GitOutput, GitError> {
        let err = match self.settle(backend, operation, request).await {
            Ok(output) => return Ok(output),
            Err(err) => err,
        };

        if operation == GitOperation::Clone {
            if let Err(e) = discard_partial(operation, &request.local_path).await {
                warn!(error = %e, "Failed to discard partial clone");
            }
        }
        match err {
            GitError::Timeout { operation, .. } => Err(GitError::Timeout {
                operation,
                after: self.timeout,
            }),
            other => Err(other),
        }
    }

    /// Run the backend with panics converted into implementation errors.
    ///
    /// The backend enforces the request deadline and cancellation itself.
    /// Once either passes it gets `BACKEND_STOP_GRACE` to wind down before
    /// it is dropped.
    async fn settle(
        &self,
        backend: &Arc<dyn GitBackend>,
        operation: GitOperation,
        request: &GitRequest,
    ) -> Result<GitOutput, GitError> {
        let work = execute_guarded_async(async {
            match operation {
                GitOperation::Clone => backend.clone_mirror(request).await,
                GitOperation::Fetch => backend.fetch_mirror(request).await,
            }
        });
        tokio::pin!(work);

        let mut cancel = request.cancel.clone();
        let settled = tokio::select! {
            guarded = &mut work => Settled::Finished(guarded),
            _ = cancel.cancelled() => Settled::Cancelled,
            _ = tokio::time::sleep_until(request.deadline + BACKEND_STOP_GRACE) => Settled::Overdue,
        };

        match settled {
            Settled::Finished(PanicGuardResult::Success(result)) => result,
            Settled::Finished(PanicGuardResult::Panicked(msg)) => Err(GitError::Implementation(
                format!("{} panicked: {}", backend.name(), msg),
            )),
            Settled::Cancelled => {
                if tokio::time::timeout(BACKEND_STOP_GRACE, &mut work).await.is_err() {
                    warn!(backend = backend.name(), "Git backend did not stop after cancellation");
                }
                Err(GitError::Cancelled)
            }
            Settled::Overdue => {
                warn!(backend = backend.name(), "Git backend overran its deadline");
                Err(GitError::Timeout {
                    operation,
                    after: self.timeout,
                })
            }
        }
    }

    /// Mark a fresh clone complete and report the outcome
    async fn finish(
        &self,
        operation: GitOperation,
        backend: &Arc<dyn GitBackend>,
        used_fallback: bool,
        output: GitOutput,
        local_path: &Path,
    ) -> Result<SyncOutcome, GitError> {
        if operation == GitOperation::Clone {
            let marker = local_path.join(MIRROR_MARKER_FILE);
            tokio::fs::write(&marker, crate::VERSION.as_bytes())
                .await
                .map_err(|e| GitError::Io(format!("cannot write {}: {}", marker.display(), e)))?;
        }

        info!(
            operation = %operation,
            backend = backend.name(),
            used_fallback = used_fallback,
            head = output.head.as_deref().unwrap_or("-"),
            "Mirror synchronized"
        );
        Ok(SyncOutcome {
            operation,
            backend: backend.name(),
            used_fallback,
            head: output.head,
        })
    }
}

/// Clone: remove the destination entirely. Fetch: drop stale lock files and
/// keep the objects already present.
async fn discard_partial(operation: GitOperation, local_path: &Path) -> Result<(), GitError> {
    match operation {
        GitOperation::Clone => match tokio::fs::remove_dir_all(local_path).await {
            Ok(()) => {
                debug!(path = %local_path.display(), "Discarded partial clone");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GitError::Io(format!(
                "cannot remove {}: {}",
                local_path.display(),
                e
            ))),
        },
        GitOperation::Fetch => {
            for name in STALE_LOCK_FILES {
                let _ = tokio::fs::remove_file(local_path.join(name)).await;
            }
            Ok(())
        }
    }
}
