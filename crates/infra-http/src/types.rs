//! Wire shapes of the Bitbucket Cloud 2.0 API.
//!
//! Only the fields the engine indexes on are typed; every document is also
//! kept verbatim as `serde_json::Value`.

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// One page of a paginated collection
#[derive(Debug, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub values: Vec<serde_json::Value>,
    /// Absolute URL of the next page; absent on the last page
    pub next: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiRepository {
    pub slug: String,
    pub full_name: String,
    #[serde(default)]
    pub is_private: bool,
    pub updated_on: Option<DateTime<Utc>>,
    pub project: Option<ApiProjectRef>,
    #[serde(default)]
    pub links: ApiLinks,
}

#[derive(Debug, Deserialize)]
pub struct ApiProjectRef {
    pub key: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiLinks {
    #[serde(default)]
    pub clone: Vec<ApiCloneLink>,
}

#[derive(Debug, Deserialize)]
pub struct ApiCloneLink {
    pub name: String,
    pub href: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiProject {
    pub key: String,
    #[serde(default)]
    pub name: String,
}

/// Pull request or issue
#[derive(Debug, Deserialize)]
pub struct ApiItem {
    pub id: u64,
    #[serde(default)]
    pub title: String,
    pub updated_on: DateTime<Utc>,
}
