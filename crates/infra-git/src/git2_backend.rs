// In-process git backend (libgit2)
// Blocking libgit2 calls run on the blocking pool behind a panic guard, so a
// defect inside the library surfaces as GitError::Implementation.
use async_trait::async_trait;
use git2::build::RepoBuilder;
use git2::{
    Cred, CredentialType, ErrorClass, ErrorCode, FetchOptions, FetchPrune, RemoteCallbacks,
    Repository,
};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::debug;

use bitvault_core::application::worker::{execute_guarded, CancelToken};
use bitvault_core::config::Credentials;
use bitvault_core::port::{
    classify_failure, GitBackend, GitError, GitOperation, GitOutput, GitRequest,
};

use crate::MIRROR_REFSPEC;

const ORIGIN: &str = "origin";

/// libgit2-backed mirror clone/fetch
pub struct Git2Backend {
    credentials: Option<Credentials>,
}

impl Git2Backend {
    pub fn new(credentials: Option<Credentials>) -> Self {
        Self { credentials }
    }

    async fn run(
        &self,
        operation: GitOperation,
        request: &GitRequest,
    ) -> Result<GitOutput, GitError> {
        let transfer = Transfer {
            operation,
            remote_url: request.remote_url.clone(),
            local_path: request.local_path.clone(),
            deadline: request.deadline.into_std(),
            cancel: request.cancel.clone(),
            credentials: self.credentials.clone(),
        };

        debug!(
            operation = %operation,
            path = %request.local_path.display(),
            "Starting libgit2 transfer"
        );

        let joined = tokio::task::spawn_blocking(move || {
            execute_guarded(|| match transfer.operation {
                GitOperation::Clone => transfer.clone_mirror(),
                GitOperation::Fetch => transfer.fetch_mirror(),
            })
        })
        .await;

        match joined {
            Ok(guarded) => guarded
                .into_result(|msg| GitError::Implementation(format!("libgit2 panicked: {}", msg)))
                .and_then(|outcome| outcome),
            Err(e) => Err(GitError::Implementation(format!(
                "libgit2 worker failed: {}",
                e
            ))),
        }
    }
}

#[async_trait]
impl GitBackend for Git2Backend {
    fn name(&self) -> &'static str {
        "libgit2"
    }

    async fn clone_mirror(&self, request: &GitRequest) -> Result<GitOutput, GitError> {
        self.run(GitOperation::Clone, request).await
    }

    async fn fetch_mirror(&self, request: &GitRequest) -> Result<GitOutput, GitError> {
        self.run(GitOperation::Fetch, request).await
    }
}

/// One blocking transfer, owned by the blocking thread
struct Transfer {
    operation: GitOperation,
    remote_url: String,
    local_path: PathBuf,
    deadline: Instant,
    cancel: CancelToken,
    credentials: Option<Credentials>,
}

impl Transfer {
    /// Cancellation or an expired deadline; checked from libgit2 callbacks
    fn interrupted(&self) -> Option<GitError> {
        if self.cancel.is_cancelled() {
            Some(GitError::Cancelled)
        } else if Instant::now() >= self.deadline {
            // The synchronizer reports its own configured timeout
            Some(GitError::Timeout {
                operation: self.operation,
                after: Duration::ZERO,
            })
        } else {
            None
        }
    }

    fn fetch_options(&self) -> FetchOptions<'_> {
        let mut callbacks = RemoteCallbacks::new();

        // libgit2 re-invokes the callback after a rejection; answer once
        let mut credential_attempts = 0u32;
        callbacks.credentials(move |_url, username_from_url, allowed| {
            credential_attempts += 1;
            if credential_attempts > 1 {
                return Err(git2::Error::from_str(
                    "authentication failed: credentials rejected by remote",
                ));
            }
            match &self.credentials {
                Some(creds) if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) => {
                    let (user, pass) = creds.git_userpass();
                    Cred::userpass_plaintext(user, pass)
                }
                _ => Err(git2::Error::from_str(&format!(
                    "authentication required for {}",
                    username_from_url.unwrap_or("remote")
                ))),
            }
        });
        callbacks.transfer_progress(|_progress| self.interrupted().is_none());
        callbacks.sideband_progress(|_data| self.interrupted().is_none());

        let mut options = FetchOptions::new();
        options.remote_callbacks(callbacks).prune(FetchPrune::On);
        options
    }

    fn clone_mirror(&self) -> Result<GitOutput, GitError> {
        if let Some(err) = self.interrupted() {
            return Err(err);
        }

        let repo = RepoBuilder::new()
            .bare(true)
            .remote_create(|repo, name, url| repo.remote_with_fetch(name, url, MIRROR_REFSPEC))
            .fetch_options(self.fetch_options())
            .clone(&self.remote_url, &self.local_path)
            .map_err(|e| self.map_error(e))?;

        repo.config()
            .and_then(|mut config| config.set_bool("remote.origin.mirror", true))
            .map_err(|e| self.map_error(e))?;

        Ok(GitOutput {
            head: resolve_head(&repo),
        })
    }

    fn fetch_mirror(&self) -> Result<GitOutput, GitError> {
        if let Some(err) = self.interrupted() {
            return Err(err);
        }

        let repo = Repository::open_bare(&self.local_path).map_err(|e| self.map_error(e))?;

        let mut remote = match repo.find_remote(ORIGIN) {
            Ok(remote) if remote.url() == Some(self.remote_url.as_str()) => remote,
            Ok(_) => {
                repo.remote_set_url(ORIGIN, &self.remote_url)
                    .map_err(|e| self.map_error(e))?;
                repo.find_remote(ORIGIN).map_err(|e| self.map_error(e))?
            }
            Err(e) if e.code() == ErrorCode::NotFound => repo
                .remote_with_fetch(ORIGIN, &self.remote_url, MIRROR_REFSPEC)
                .map_err(|e| self.map_error(e))?,
            Err(e) => return Err(self.map_error(e)),
        };

        remote
            .fetch(
                &[MIRROR_REFSPEC],
                Some(&mut self.fetch_options()),
                Some("bitvault: mirror fetch"),
            )
            .map_err(|e| self.map_error(e))?;
        drop(remote);

        Ok(GitOutput {
            head: resolve_head(&repo),
        })
    }

    fn map_error(&self, err: git2::Error) -> GitError {
        // Aborted from a callback
        if err.code() == ErrorCode::User {
            if let Some(interrupt) = self.interrupted() {
                return interrupt;
            }
        }
        map_git2_error(&err)
    }
}

fn map_git2_error(err: &git2::Error) -> GitError {
    let message = err.message().to_string();
    match (err.code(), err.class()) {
        (ErrorCode::Auth, _) => GitError::Auth(message),
        (ErrorCode::HashsumMismatch, _) => GitError::Implementation(message),
        // A ref libgit2 itself wrote and then could not find
        (_, ErrorClass::Reference) => GitError::Implementation(message),
        (_, ErrorClass::Zlib | ErrorClass::Odb | ErrorClass::Indexer | ErrorClass::Object) => {
            GitError::Implementation(message)
        }
        (_, ErrorClass::Os | ErrorClass::Filesystem) => GitError::Io(message),
        _ => classify_failure(&message),
    }
}

/// Commit id HEAD resolves to; `None` for an empty repository
fn resolve_head(repo: &Repository) -> Option<String> {
    repo.head()
        .ok()
        .and_then(|head| head.target())
        .map(|oid| oid.to_string())
}
