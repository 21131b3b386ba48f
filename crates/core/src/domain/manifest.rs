// Run options and the manifest written at the end of a completed run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Effective options of one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Ignore recorded timestamps and fetch everything
    pub full: bool,
    /// Enumerate and count without writing anything
    pub dry_run: bool,
    /// Only back up repositories present in the failure ledger
    pub retry_failed: bool,
    /// Metadata only, no git mirroring
    pub skip_git: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub projects: u64,
    pub repositories: u64,
    pub pull_requests: u64,
    pub issues: u64,
    pub comments: u64,
    pub failures: u64,
    pub cancelled: u64,
}

/// Write-only summary artifact of a completed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub workspace: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub counters: RunCounters,
    pub options: RunOptions,
    /// Whether this run was incremental for at least one stream
    pub incremental: bool,
    pub tool_version: String,
}
