// Incremental State Tracker
//
// Shared by every worker. Each accessor holds the lock for exactly one map
// operation; persistence clones the state first and does its I/O unlocked.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::domain::{
    FailureRecord, FetchMode, IncrementalState, JobError, RepoSlug, RepoState, Stream,
    STATE_VERSION,
};
use crate::error::{AppError, Result};

pub struct StateTracker {
    path: PathBuf,
    state: Mutex<IncrementalState>,
    /// Serializes concurrent saves (checkpoint vs. final) on the temp file
    save_lock: tokio::sync::Mutex<()>,
}

impl StateTracker {
    /// Wrap an already-loaded state
    pub fn new(path: impl Into<PathBuf>, state: IncrementalState) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(state),
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Load the state file, or start fresh when it does not exist.
    ///
    /// A file that exists but cannot be parsed, carries a newer format
    /// version, or belongs to another workspace is `AppError::StateCorrupt`.
    pub async fn load(path: impl Into<PathBuf>, workspace: &str) -> Result<Self> {
        let path = path.into();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No previous state, starting fresh");
                return Ok(Self::new(path, IncrementalState::new(workspace)));
            }
            Err(e) => {
                return Err(AppError::StateCorrupt {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })
            }
        };

        let corrupt = |reason: String| AppError::StateCorrupt {
            path: path.display().to_string(),
            reason,
        };

        let state: IncrementalState =
            serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;

        if state.version > STATE_VERSION {
            return Err(corrupt(format!(
                "unsupported state version {} (this build reads up to {})",
                state.version, STATE_VERSION
            )));
        }
        if state.workspace != workspace {
            return Err(corrupt(format!(
                "state belongs to workspace '{}', not '{}'",
                state.workspace, workspace
            )));
        }

        info!(
            path = %path.display(),
            repositories = state.repositories.len(),
            failures = state.failures.len(),
            "Loaded incremental state"
        );
        Ok(Self::new(path, state))
    }

    /// Persist the full state atomically (temp file + rename)
    pub async fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        let bytes = serde_json::to_vec_pretty(&self.snapshot())?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = temp_path(&self.path);
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(path = %self.path.display(), bytes = bytes.len(), "State saved");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, IncrementalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> IncrementalState {
        self.lock().clone()
    }

    /// Whether any full or incremental run has ever completed
    pub fn has_previous_backup(&self) -> bool {
        let state = self.lock();
        state.last_full_backup.is_some() || state.last_incremental_backup.is_some()
    }

    pub fn last_updated(&self, slug: &str, stream: Stream) -> Option<DateTime<Utc>> {
        let state = self.lock();
        let repo = state.repositories.get(slug)?;
        match stream {
            Stream::PullRequests => repo.last_pr_updated,
            Stream::Issues => repo.last_issue_updated,
        }
    }

    pub fn set_last_updated(&self, slug: &str, stream: Stream, at: DateTime<Utc>) {
        let mut state = self.lock();
        let repo = state.repositories.entry(slug.to_string()).or_default();
        match stream {
            Stream::PullRequests => repo.last_pr_updated = Some(at),
            Stream::Issues => repo.last_issue_updated = Some(at),
        }
    }

    pub fn last_pr_updated(&self, slug: &str) -> Option<DateTime<Utc>> {
        self.last_updated(slug, Stream::PullRequests)
    }

    pub fn set_last_pr_updated(&self, slug: &str, at: DateTime<Utc>) {
        self.set_last_updated(slug, Stream::PullRequests, at)
    }

    pub fn last_issue_updated(&self, slug: &str) -> Option<DateTime<Utc>> {
        self.last_updated(slug, Stream::Issues)
    }

    pub fn set_last_issue_updated(&self, slug: &str, at: DateTime<Utc>) {
        self.set_last_updated(slug, Stream::Issues, at)
    }

    pub fn last_commit(&self, slug: &str) -> Option<String> {
        self.lock()
            .repositories
            .get(slug)
            .and_then(|r| r.last_commit.clone())
    }

    pub fn set_last_commit(&self, slug: &str, commit: impl Into<String>) {
        let mut state = self.lock();
        state
            .repositories
            .entry(slug.to_string())
            .or_default()
            .last_commit = Some(commit.into());
    }

    pub fn mark_backed_up(&self, slug: &str, at: DateTime<Utc>) {
        let mut state = self.lock();
        state
            .repositories
            .entry(slug.to_string())
            .or_default()
            .last_backed_up = Some(at);
    }

    pub fn repository(&self, slug: &str) -> Option<RepoState> {
        self.lock().repositories.get(slug).cloned()
    }

    pub fn mark_full_backup(&self, at: DateTime<Utc>) {
        self.lock().last_full_backup = Some(at);
    }

    pub fn mark_incremental_backup(&self, at: DateTime<Utc>) {
        self.lock().last_incremental_backup = Some(at);
    }

    /// Incremental when not forced full and the stream has a recorded
    /// timestamp; full otherwise
    pub fn fetch_mode(&self, slug: &str, stream: Stream, force_full: bool) -> FetchMode {
        if force_full {
            return FetchMode::Full;
        }
        match self.last_updated(slug, stream) {
            Some(since) => FetchMode::Incremental { since },
            None => FetchMode::Full,
        }
    }

    /// Upsert the ledger entry for `slug`
    pub fn record_failure(&self, slug: &str, error: &JobError, attempts: u32, at: DateTime<Utc>) {
        let mut state = self.lock();
        state.failures.insert(
            slug.to_string(),
            FailureRecord {
                error: error.to_string(),
                kind: Some(error.kind()),
                failed_at: at,
                attempts,
            },
        );
    }

    /// Remove the ledger entry for `slug`; true if one existed
    pub fn clear_failure(&self, slug: &str) -> bool {
        self.lock().failures.remove(slug).is_some()
    }

    /// Ledger entries ordered by slug
    pub fn list_failures(&self) -> Vec<(RepoSlug, FailureRecord)> {
        self.lock()
            .failures
            .iter()
            .map(|(slug, record)| (slug.clone(), record.clone()))
            .collect()
    }

    pub fn failed_slugs(&self) -> Vec<RepoSlug> {
        self.lock().failures.keys().cloned().collect()
    }

    /// Empty the ledger; returns how many entries were removed
    pub fn clear_all_failures(&self) -> usize {
        let mut state = self.lock();
        let count = state.failures.len();
        state.failures.clear();
        if count > 0 {
            warn!(count = count, "Failure ledger cleared");
        }
        count
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
