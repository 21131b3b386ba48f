//! API documents to domain types.

use bitvault_core::domain::{Issue, Project, PullRequest, Repository};
use bitvault_core::port::ApiError;
use serde::de::DeserializeOwned;

use super::types::{ApiItem, ApiProject, ApiRepository};

fn decode<T: DeserializeOwned>(kind: &str, value: &serde_json::Value) -> Result<T, ApiError> {
    T::deserialize(value).map_err(|e| ApiError::Decode(format!("{}: {}", kind, e)))
}

pub fn to_repository(value: serde_json::Value) -> Result<Repository, ApiError> {
    let api: ApiRepository = decode("repository", &value)?;

    let clone_url = api
        .links
        .clone
        .iter()
        .find(|link| link.name == "https")
        .map(|link| strip_userinfo(&link.href))
        .unwrap_or_else(|| format!("https://bitbucket.org/{}.git", api.full_name));

    Ok(Repository {
        slug: api.slug,
        full_name: api.full_name,
        project_key: api.project.map(|p| p.key),
        clone_url,
        is_private: api.is_private,
        updated_on: api.updated_on,
        raw: value,
    })
}

pub fn to_project(value: serde_json::Value) -> Result<Project, ApiError> {
    let api: ApiProject = decode("project", &value)?;
    Ok(Project {
        key: api.key,
        name: api.name,
        raw: value,
    })
}

pub fn to_pull_request(value: serde_json::Value) -> Result<PullRequest, ApiError> {
    let api: ApiItem = decode("pull request", &value)?;
    Ok(PullRequest {
        id: api.id,
        title: api.title,
        updated_on: api.updated_on,
        raw: value,
    })
}

pub fn to_issue(value: serde_json::Value) -> Result<Issue, ApiError> {
    let api: ApiItem = decode("issue", &value)?;
    Ok(Issue {
        id: api.id,
        title: api.title,
        updated_on: api.updated_on,
        raw: value,
    })
}

/// Clone links carry the requesting user (`https://user@bitbucket.org/...`);
/// credentials are supplied to git separately
fn strip_userinfo(href: &str) -> String {
    match reqwest::Url::parse(href) {
        Ok(mut url) => {
            let _ = url.set_username("");
            let _ = url.set_password(None);
            url.to_string()
        }
        Err(_) => href.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_repository_prefers_https_clone_link() {
        let repo = to_repository(json!({
            "slug": "api",
            "full_name": "acme/api",
            "is_private": true,
            "updated_on": "2024-03-01T12:00:00.000000+00:00",
            "project": {"key": "CORE"},
            "links": {"clone": [
                {"name": "ssh", "href": "git@bitbucket.org:acme/api.git"},
                {"name": "https", "href": "https://ci-bot@bitbucket.org/acme/api.git"}
            ]}
        }))
        .unwrap();

        assert_eq!(repo.clone_url, "https://bitbucket.org/acme/api.git");
        assert_eq!(repo.project_key.as_deref(), Some("CORE"));
        assert!(repo.is_private);
        assert_eq!(repo.raw["slug"], "api");
    }

    #[test]
    fn test_repository_without_links_uses_full_name() {
        let repo = to_repository(json!({"slug": "tools", "full_name": "acme/tools"})).unwrap();
        assert_eq!(repo.clone_url, "https://bitbucket.org/acme/tools.git");
        assert_eq!(repo.updated_on, None);
    }

    #[test]
    fn test_item_missing_timestamp_is_decode_error() {
        let err = to_pull_request(json!({"id": 3, "title": "x"})).unwrap_err();
        assert!(matches!(err, ApiError::Decode(ref m) if m.starts_with("pull request")));
    }
}
