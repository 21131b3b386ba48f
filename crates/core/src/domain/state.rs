// Persisted incremental backup state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::repository::RepoSlug;
use super::result::FailureKind;

/// Current on-disk format version
pub const STATE_VERSION: u32 = 1;

/// Versioned record of what previous runs have backed up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrementalState {
    pub version: u32,
    pub workspace: String,
    pub last_full_backup: Option<DateTime<Utc>>,
    pub last_incremental_backup: Option<DateTime<Utc>>,
    #[serde(default)]
    pub repositories: BTreeMap<RepoSlug, RepoState>,
    /// Failure ledger
    #[serde(default)]
    pub failures: BTreeMap<RepoSlug, FailureRecord>,
}

impl IncrementalState {
    pub fn new(workspace: impl Into<String>) -> Self {
        Self {
            version: STATE_VERSION,
            workspace: workspace.into(),
            last_full_backup: None,
            last_incremental_backup: None,
            repositories: BTreeMap::new(),
            failures: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoState {
    /// Resolved HEAD of the mirror after the last successful sync
    pub last_commit: Option<String>,
    pub last_pr_updated: Option<DateTime<Utc>>,
    pub last_issue_updated: Option<DateTime<Utc>>,
    pub last_backed_up: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
    pub failed_at: DateTime<Utc>,
    pub attempts: u32,
}

/// How a metadata stream is fetched for one repository
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Full,
    /// Only items updated strictly after `since`
    Incremental { since: DateTime<Utc> },
}

impl FetchMode {
    pub fn since(&self) -> Option<DateTime<Utc>> {
        match self {
            FetchMode::Full => None,
            FetchMode::Incremental { since } => Some(*since),
        }
    }

    pub fn is_incremental(&self) -> bool {
        matches!(self, FetchMode::Incremental { .. })
    }
}
