// Remote workspace resources (repositories, projects, pull requests, issues)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{DomainError, Result};

/// Repository slug, unique within a workspace
pub type RepoSlug = String;

/// Maximum slug length accepted by the remote
const MAX_SLUG_LEN: usize = 128;

/// Repository as enumerated from the workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub slug: RepoSlug,
    pub full_name: String,
    pub project_key: Option<String>,
    /// HTTPS clone URL (credentials are supplied separately)
    pub clone_url: String,
    pub is_private: bool,
    pub updated_on: Option<DateTime<Utc>>,
    /// Document as returned by the API, persisted verbatim
    pub raw: serde_json::Value,
}

/// Project grouping inside a workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub key: String,
    pub name: String,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: u64,
    pub title: String,
    pub updated_on: DateTime<Utc>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: u64,
    pub title: String,
    pub updated_on: DateTime<Utc>,
    pub raw: serde_json::Value,
}

/// Common view over incrementally fetched metadata streams
pub trait MetadataItem {
    fn item_id(&self) -> u64;
    fn updated_on(&self) -> DateTime<Utc>;
    fn raw(&self) -> &serde_json::Value;
}

impl MetadataItem for PullRequest {
    fn item_id(&self) -> u64 {
        self.id
    }

    fn updated_on(&self) -> DateTime<Utc> {
        self.updated_on
    }

    fn raw(&self) -> &serde_json::Value {
        &self.raw
    }
}

impl MetadataItem for Issue {
    fn item_id(&self) -> u64 {
        self.id
    }

    fn updated_on(&self) -> DateTime<Utc> {
        self.updated_on
    }

    fn raw(&self) -> &serde_json::Value {
        &self.raw
    }
}

/// Metadata stream tracked by the incremental state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    PullRequests,
    Issues,
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stream::PullRequests => write!(f, "pull_requests"),
            Stream::Issues => write!(f, "issues"),
        }
    }
}

/// Validate a repository slug before it is used to build storage paths
pub fn validate_slug(slug: &str) -> Result<()> {
    if slug.is_empty() {
        return Err(DomainError::InvalidSlug("slug cannot be empty".to_string()));
    }
    if slug.len() > MAX_SLUG_LEN {
        return Err(DomainError::InvalidSlug(format!(
            "slug too long (max {} chars)",
            MAX_SLUG_LEN
        )));
    }
    if slug == "." || slug == ".." {
        return Err(DomainError::InvalidSlug(format!("reserved slug: {}", slug)));
    }
    if !slug
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(DomainError::InvalidSlug(format!(
            "slug must be alphanumeric, '-', '_' or '.': {}",
            slug
        )));
    }
    Ok(())
}
