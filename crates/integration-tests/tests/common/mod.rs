//! Shared fixtures: a workspace on disk, scripted API and git backends.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use bitvault_core::application::{BackupOrchestrator, GitSynchronizer, StateTracker};
use bitvault_core::config::BackupConfig;
use bitvault_core::domain::{Project, PullRequest, Repository};
use bitvault_core::port::git_backend::mocks::MockGitBackend;
use bitvault_core::port::id_provider::mocks::SequentialIdProvider;
use bitvault_core::port::metadata_client::mocks::MockMetadataClient;
use bitvault_core::port::time_provider::mocks::FixedTimeProvider;
use bitvault_infra_fs::LocalStorage;

pub const WORKSPACE: &str = "acme";

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn repo(slug: &str) -> Repository {
    Repository {
        slug: slug.to_string(),
        full_name: format!("{}/{}", WORKSPACE, slug),
        project_key: Some("CORE".to_string()),
        clone_url: format!("https://bitbucket.org/{}/{}.git", WORKSPACE, slug),
        is_private: true,
        updated_on: None,
        raw: serde_json::json!({ "slug": slug, "full_name": format!("{}/{}", WORKSPACE, slug) }),
    }
}

pub fn pr(id: u64, updated: DateTime<Utc>) -> PullRequest {
    PullRequest {
        id,
        title: format!("PR {}", id),
        updated_on: updated,
        raw: serde_json::json!({ "id": id, "updated_on": updated.to_rfc3339() }),
    }
}

pub fn client(slugs: &[&str]) -> MockMetadataClient {
    let mut client = MockMetadataClient::new().with_project(Project {
        key: "CORE".to_string(),
        name: "Core".to_string(),
        raw: serde_json::json!({ "key": "CORE", "name": "Core" }),
    });
    for slug in slugs {
        client = client.with_repository(repo(slug));
    }
    client
}

/// A backup destination in a temp directory plus the handles tests inspect
pub struct Harness {
    pub dir: TempDir,
    pub config: BackupConfig,
    pub client: Arc<MockMetadataClient>,
    pub git: Arc<MockGitBackend>,
    pub clock: Arc<FixedTimeProvider>,
}

impl Harness {
    pub fn new(client: MockMetadataClient, git: MockGitBackend) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = BackupConfig {
            workspace: WORKSPACE.to_string(),
            storage_root: dir.path().to_path_buf(),
            ..Default::default()
        };
        config.workers.git_workers = 2;
        config.workers.max_job_retries = 2;
        config.workers.retry_base_delay_ms = 1;

        Self {
            dir,
            config,
            client: Arc::new(client),
            git: Arc::new(git),
            clock: Arc::new(FixedTimeProvider::new(ts(10_000))),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn orchestrator(&self) -> BackupOrchestrator {
        self.orchestrator_with_storage(LocalStorage::new(self.root()))
    }

    pub fn orchestrator_with_storage(&self, storage: LocalStorage) -> BackupOrchestrator {
        BackupOrchestrator::new(
            self.config.clone(),
            self.client.clone(),
            Arc::new(storage),
            Arc::new(GitSynchronizer::new(
                self.git.clone(),
                None,
                Duration::from_secs(30),
            )),
            self.clock.clone(),
            Arc::new(SequentialIdProvider::default()),
        )
    }

    pub async fn state(&self) -> StateTracker {
        StateTracker::load(self.config.state_path(), WORKSPACE)
            .await
            .unwrap()
    }

    pub fn read_json(&self, rel: &str) -> serde_json::Value {
        let bytes = std::fs::read(self.path(rel)).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Git calls made against `slug`'s remote
    pub fn git_calls_for(&self, slug: &str) -> usize {
        let url = format!("https://bitbucket.org/{}/{}.git", WORKSPACE, slug);
        self.git.calls().iter().filter(|(_, u)| *u == url).count()
    }
}
