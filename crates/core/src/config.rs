// Backup configuration
// Deserialized from the layered sources assembled by the binary (defaults,
// config file, BITVAULT__* environment, flags). Every section has a Default
// so partial files are accepted.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::application::worker::constants::{DEFAULT_RETRY_BASE_DELAY, DEFAULT_WORKER_COUNT};
use crate::error::{AppError, Result};

pub const DEFAULT_API_BASE_URL: &str = "https://api.bitbucket.org/2.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub workspace: String,
    pub storage_root: PathBuf,
    pub api_base_url: String,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub workers: WorkerConfig,
    pub backup: BackupOptions,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            workspace: String::new(),
            storage_root: PathBuf::from("./backups"),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            workers: WorkerConfig::default(),
            backup: BackupOptions::default(),
        }
    }
}

impl BackupConfig {
    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.workspace.trim().is_empty() {
            return Err(AppError::Config("workspace must be set".to_string()));
        }
        if self.workers.git_workers == 0 {
            return Err(AppError::Config("workers.git_workers must be > 0".to_string()));
        }
        self.rate_limit.validate()?;
        if self.backup.checkpoint_every == 0 {
            return Err(AppError::Config(
                "backup.checkpoint_every must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Deterministic location of the persisted state for this workspace
    pub fn state_path(&self) -> PathBuf {
        self.storage_root
            .join(&self.workspace)
            .join(".bitvault-state.json")
    }
}

/// Credentials for the API and for git over HTTPS
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub username: Option<String>,
    pub app_password: Option<String>,
    /// Bearer token (workspace/repository access token); wins over app password
    pub token: Option<String>,
}

impl AuthConfig {
    pub fn credentials(&self) -> Option<Credentials> {
        if let Some(token) = &self.token {
            return Some(Credentials::Bearer(token.clone()));
        }
        match (&self.username, &self.app_password) {
            (Some(u), Some(p)) => Some(Credentials::Basic {
                username: u.clone(),
                password: p.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { username: String, password: String },
    Bearer(String),
}

impl Credentials {
    /// User/password pair for git over HTTPS
    pub fn git_userpass(&self) -> (&str, &str) {
        match self {
            Credentials::Basic { username, password } => (username, password),
            Credentials::Bearer(token) => ("x-token-auth", token),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            Credentials::Bearer(_) => f.debug_tuple("Bearer").field(&"***").finish(),
        }
    }
}

/// Token bucket and throttling backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_hour: u32,
    pub burst_size: u32,
    /// API-level retries after a throttling response
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_hour: 1000,
            burst_size: 10,
            max_retries: 5,
            base_backoff_ms: 1000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 60_000,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.requests_per_hour == 0 {
            return Err(AppError::Config(
                "rate_limit.requests_per_hour must be > 0".to_string(),
            ));
        }
        if self.burst_size == 0 {
            return Err(AppError::Config("rate_limit.burst_size must be > 0".to_string()));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(AppError::Config(
                "rate_limit.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }

    /// Tokens accrued per second
    pub fn refill_per_sec(&self) -> f64 {
        f64::from(self.requests_per_hour) / 3600.0
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub git_workers: usize,
    /// Job-level retries after the first attempt (distinct from rate_limit.max_retries)
    pub max_job_retries: u32,
    pub retry_base_delay_ms: u64,
    pub git_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            git_workers: DEFAULT_WORKER_COUNT,
            max_job_retries: 2,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY.as_millis() as u64,
            git_timeout_secs: 1800,
        }
    }
}

impl WorkerConfig {
    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupOptions {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub include_pr_comments: bool,
    pub include_pr_activity: bool,
    pub include_issue_comments: bool,
    pub skip_git: bool,
    /// Persist state after this many job results
    pub checkpoint_every: usize,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            include_pr_comments: true,
            include_pr_activity: true,
            include_issue_comments: true,
            skip_git: false,
            checkpoint_every: 25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: BackupConfig = serde_json::from_str(
            r#"{"workspace":"acme","rate_limit":{"requests_per_hour":3600}}"#,
        )
        .unwrap();
        assert_eq!(config.rate_limit.requests_per_hour, 3600);
        assert_eq!(config.rate_limit.burst_size, 10);
        assert_eq!(config.workers.git_workers, 4);
        assert!((config.rate_limit.refill_per_sec() - 1.0).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = BackupConfig::default();
        assert!(config.validate().unwrap_err().to_string().contains("workspace"));

        let mut config = BackupConfig {
            workspace: "acme".into(),
            ..Default::default()
        };
        config.workers.git_workers = 0;
        assert!(config.validate().is_err());

        let mut config = BackupConfig {
            workspace: "acme".into(),
            ..Default::default()
        };
        config.rate_limit.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_token_wins_over_app_password() {
        let auth = AuthConfig {
            username: Some("ci-bot".into()),
            app_password: Some("secret".into()),
            token: Some("tok".into()),
        };
        assert_eq!(auth.credentials(), Some(Credentials::Bearer("tok".into())));
        assert_eq!(
            auth.credentials().unwrap().git_userpass(),
            ("x-token-auth", "tok")
        );
    }

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let creds = Credentials::Basic {
            username: "ci-bot".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("ci-bot"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_state_path_is_per_workspace() {
        let config = BackupConfig {
            workspace: "acme".into(),
            storage_root: PathBuf::from("/srv/backups"),
            ..Default::default()
        };
        assert_eq!(
            config.state_path(),
            PathBuf::from("/srv/backups/acme/.bitvault-state.json")
        );
    }
}
