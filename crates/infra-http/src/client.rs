//! Bitbucket Cloud 2.0 REST client.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use bitvault_core::application::RateLimiter;
use bitvault_core::config::Credentials;
use bitvault_core::domain::{Issue, Project, PullRequest, Repository};
use bitvault_core::port::{ApiError, MetadataClient};

use super::convert::{to_issue, to_project, to_pull_request, to_repository};
use super::transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
use super::types::Page;

/// Largest page the API serves
const PAGE_LEN: &str = "100";

/// Pull request states requested explicitly (the API defaults to OPEN only)
const PR_STATES: [&str; 4] = ["OPEN", "MERGED", "DECLINED", "SUPERSEDED"];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest error body kept in `ApiError::Status`
const MAX_ERROR_BODY: usize = 512;

/// Metadata client for one Bitbucket Cloud API endpoint.
///
/// Every request first takes a token from the shared [`RateLimiter`]; a 429
/// response is handed back to the limiter, which decides whether and how
/// long to back off.
#[derive(Clone)]
pub struct BitbucketClient {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    credentials: Option<Credentials>,
    limiter: Arc<RateLimiter>,
}

impl BitbucketClient {
    pub fn new(
        base_url: &str,
        credentials: Option<Credentials>,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, ApiError> {
        let transport = ReqwestTransport::with_timeout(REQUEST_TIMEOUT)
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(Self::new_with_transport(
            base_url,
            credentials,
            limiter,
            Arc::new(transport),
        ))
    }

    pub fn new_with_transport(
        base_url: &str,
        credentials: Option<Credentials>,
        limiter: Arc<RateLimiter>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            limiter,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL of the first page of `path`
    pub(crate) fn endpoint(&self, path: &str, query: &[(&str, String)]) -> Result<String, ApiError> {
        let raw = format!("{}{}", self.base_url, path);
        let mut url = reqwest::Url::parse(&raw)
            .map_err(|e| ApiError::Transport(format!("invalid URL {}: {}", raw, e)))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("pagelen", PAGE_LEN);
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url.to_string())
    }

    fn headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![("Accept".to_string(), "application/json".to_string())];
        match &self.credentials {
            Some(Credentials::Basic { username, password }) => {
                let encoded = STANDARD.encode(format!("{}:{}", username, password));
                headers.push(("Authorization".to_string(), format!("Basic {}", encoded)));
            }
            Some(Credentials::Bearer(token)) => {
                headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
            }
            None => {}
        }
        headers
    }

    /// One GET, paced by the limiter and repeated while throttled
    async fn get(&self, url: &str) -> Result<HttpResponse, ApiError> {
        loop {
            self.limiter.acquire().await;

            let request = HttpRequest {
                url: url.to_string(),
                headers: self.headers(),
            };
            let response = self
                .transport
                .get(request)
                .await
                .map_err(|e| ApiError::Transport(e.to_string()))?;

            if response.status == 429 {
                let retry_after = response
                    .header("retry-after")
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                let decision = self.limiter.on_throttled(retry_after);
                if !decision.retry {
                    return Err(ApiError::Throttled {
                        attempts: decision.failures,
                    });
                }
                warn!(
                    url = %url,
                    failures = decision.failures,
                    backoff_ms = decision.backoff.as_millis() as u64,
                    "Throttled by API, backing off"
                );
                tokio::time::sleep(decision.backoff).await;
                continue;
            }

            self.limiter.on_success();
            return check_status(response, url);
        }
    }

    /// Follow `next` links until the collection is exhausted
    async fn get_all(&self, first: String) -> Result<Vec<serde_json::Value>, ApiError> {
        let mut values = Vec::new();
        let mut next = Some(first);
        let mut pages = 0u32;

        while let Some(url) = next.take() {
            let response = self.get(&url).await?;
            let page: Page = serde_json::from_slice(&response.body)
                .map_err(|e| ApiError::Decode(format!("page {}: {}", url, e)))?;
            pages += 1;
            values.extend(page.values);
            next = page.next.filter(|n| *n != url);
        }

        debug!(pages, items = values.len(), "Collection fetched");
        Ok(values)
    }

    fn repository_path(workspace: &str, slug: &str) -> String {
        format!("/repositories/{}/{}", workspace, slug)
    }
}

fn updated_after(since: DateTime<Utc>) -> (&'static str, String) {
    (
        "q",
        format!(
            "updated_on > \"{}\"",
            since.to_rfc3339_opts(SecondsFormat::Millis, true)
        ),
    )
}

fn check_status(response: HttpResponse, url: &str) -> Result<HttpResponse, ApiError> {
    if response.is_success() {
        return Ok(response);
    }
    let mut message = String::from_utf8_lossy(&response.body).to_string();
    if message.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    match response.status {
        401 | 403 => Err(ApiError::Unauthorized(format!("{}: {}", url, message))),
        404 => Err(ApiError::NotFound(url.to_string())),
        status => Err(ApiError::Status { status, message }),
    }
}

#[async_trait]
impl MetadataClient for BitbucketClient {
    async fn fetch_projects(&self, workspace: &str) -> Result<Vec<Project>, ApiError> {
        let url = self.endpoint(&format!("/workspaces/{}/projects", workspace), &[])?;
        self.get_all(url).await?.into_iter().map(to_project).collect()
    }

    async fn fetch_repositories(&self, workspace: &str) -> Result<Vec<Repository>, ApiError> {
        let url = self.endpoint(&format!("/repositories/{}", workspace), &[])?;
        self.get_all(url)
            .await?
            .into_iter()
            .map(to_repository)
            .collect()
    }

    async fn fetch_pull_requests(
        &self,
        workspace: &str,
        slug: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PullRequest>, ApiError> {
        let mut query: Vec<(&str, String)> =
            PR_STATES.iter().map(|s| ("state", s.to_string())).collect();
        query.extend(since.map(updated_after));

        let url = self.endpoint(
            &format!("{}/pullrequests", Self::repository_path(workspace, slug)),
            &query,
        )?;
        self.get_all(url)
            .await?
            .into_iter()
            .map(to_pull_request)
            .collect()
    }

    async fn fetch_issues(
        &self,
        workspace: &str,
        slug: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Issue>, ApiError> {
        let query: Vec<(&str, String)> = since.map(updated_after).into_iter().collect();
        let url = self.endpoint(
            &format!("{}/issues", Self::repository_path(workspace, slug)),
            &query,
        )?;
        self.get_all(url).await?.into_iter().map(to_issue).collect()
    }

    async fn fetch_pull_request_comments(
        &self,
        workspace: &str,
        slug: &str,
        pr_id: u64,
    ) -> Result<Vec<serde_json::Value>, ApiError> {
        let url = self.endpoint(
            &format!(
                "{}/pullrequests/{}/comments",
                Self::repository_path(workspace, slug),
                pr_id
            ),
            &[],
        )?;
        self.get_all(url).await
    }

    async fn fetch_pull_request_activity(
        &self,
        workspace: &str,
        slug: &str,
        pr_id: u64,
    ) -> Result<Vec<serde_json::Value>, ApiError> {
        let url = self.endpoint(
            &format!(
                "{}/pullrequests/{}/activity",
                Self::repository_path(workspace, slug),
                pr_id
            ),
            &[],
        )?;
        self.get_all(url).await
    }

    async fn fetch_issue_comments(
        &self,
        workspace: &str,
        slug: &str,
        issue_id: u64,
    ) -> Result<Vec<serde_json::Value>, ApiError> {
        let url = self.endpoint(
            &format!(
                "{}/issues/{}/comments",
                Self::repository_path(workspace, slug),
                issue_id
            ),
            &[],
        )?;
        self.get_all(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use bitvault_core::config::RateLimitConfig;
    use chrono::TimeZone;
    use serde_json::json;

    const BASE: &str = "https://api.bitbucket.test/2.0";

    fn limiter(max_retries: u32) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(RateLimitConfig {
            requests_per_hour: 36_000,
            burst_size: 100,
            max_retries,
            base_backoff_ms: 1000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
        }))
    }

    fn client(transport: &MockTransport, credentials: Option<Credentials>) -> BitbucketClient {
        BitbucketClient::new_with_transport(
            BASE,
            credentials,
            limiter(3),
            Arc::new(transport.clone()),
        )
    }

    fn repo_json(slug: &str) -> serde_json::Value {
        json!({
            "slug": slug,
            "full_name": format!("acme/{}", slug),
            "links": {"clone": [{"name": "https", "href": format!("https://u@bitbucket.org/acme/{}.git", slug)}]}
        })
    }

    #[tokio::test]
    async fn test_pagination_follows_next_links() {
        let transport = MockTransport::new();
        let client = client(&transport, None);
        let first = client.endpoint("/repositories/acme", &[]).unwrap();
        let second = format!("{}/repositories/acme?page=2", BASE);

        transport.push_json(
            first.as_str(),
            200,
            json!({"values": [repo_json("api")], "next": second}),
        );
        transport.push_json(second.as_str(), 200, json!({"values": [repo_json("web")]}));

        let repos = client.fetch_repositories("acme").await.unwrap();

        let slugs: Vec<_> = repos.iter().map(|r| r.slug.as_str()).collect();
        assert_eq!(slugs, vec!["api", "web"]);
        assert_eq!(repos[0].clone_url, "https://bitbucket.org/acme/api.git");
        assert!(first.contains("pagelen=100"));
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_incremental_filter_and_pr_states() {
        let transport = MockTransport::new();
        let client = client(&transport, None);
        let since = Utc.with_ymd_and_hms(2024, 1, 5, 10, 0, 0).unwrap();

        let mut query: Vec<(&str, String)> =
            PR_STATES.iter().map(|s| ("state", s.to_string())).collect();
        query.push(updated_after(since));
        let url = client
            .endpoint("/repositories/acme/api/pullrequests", &query)
            .unwrap();
        transport.push_json(
            url.as_str(),
            200,
            json!({"values": [{"id": 7, "title": "Fix", "updated_on": "2024-01-06T09:00:00+00:00"}]}),
        );

        let prs = client
            .fetch_pull_requests("acme", "api", Some(since))
            .await
            .unwrap();

        assert_eq!(prs.len(), 1);
        assert_eq!(prs[0].id, 7);
        let sent = &transport.requests()[0].url;
        assert!(sent.contains("state=MERGED"));
        assert!(sent.contains("state=SUPERSEDED"));
        assert!(sent.contains("q=updated_on+%3E+%222024-01-05T10%3A00%3A00.000Z%22"));
    }

    #[tokio::test]
    async fn test_full_fetch_sends_no_filter() {
        let transport = MockTransport::new();
        let client = client(&transport, None);
        let url = client.endpoint("/repositories/acme/api/issues", &[]).unwrap();
        transport.push_json(url.as_str(), 200, json!({"values": []}));

        let issues = client.fetch_issues("acme", "api", None).await.unwrap();

        assert!(issues.is_empty());
        assert!(!transport.requests()[0].url.contains("q="));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_then_success_honours_retry_after() {
        let transport = MockTransport::new();
        let client = client(&transport, None);
        let url = client.endpoint("/workspaces/acme/projects", &[]).unwrap();

        transport.push_response(
            url.as_str(),
            HttpResponse {
                status: 429,
                headers: vec![("Retry-After".into(), "7".into())],
                body: Vec::new(),
            },
        );
        transport.push_json(
            url.as_str(),
            200,
            json!({"values": [{"key": "CORE", "name": "Core"}]}),
        );

        let started = tokio::time::Instant::now();
        let projects = client.fetch_projects("acme").await.unwrap();

        assert_eq!(projects[0].key, "CORE");
        assert!(started.elapsed() >= Duration::from_secs(7));
        assert_eq!(client.limiter.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_throttle_retries() {
        let transport = MockTransport::new();
        let client = client(&transport, None);
        let url = client.endpoint("/repositories/acme", &[]).unwrap();
        for _ in 0..4 {
            transport.push_response(
                url.as_str(),
                HttpResponse {
                    status: 429,
                    headers: Vec::new(),
                    body: Vec::new(),
                },
            );
        }

        let err = client.fetch_repositories("acme").await.unwrap_err();

        assert_eq!(err, ApiError::Throttled { attempts: 4 });
        assert!(err.is_retryable());
        assert_eq!(transport.requests().len(), 4);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let transport = MockTransport::new();
        let client = client(&transport, None);

        let issues = client.endpoint("/repositories/acme/api/issues", &[]).unwrap();
        transport.push_json(issues.as_str(), 404, json!({"error": {"message": "no tracker"}}));
        let err = client.fetch_issues("acme", "api", None).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));

        let repos = client.endpoint("/repositories/acme", &[]).unwrap();
        transport.push_json(repos.as_str(), 401, json!({"error": {"message": "bad creds"}}));
        let err = client.fetch_repositories("acme").await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(ref m) if m.contains("bad creds")));

        transport.push_json(repos.as_str(), 502, json!({}));
        let err = client.fetch_repositories("acme").await.unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 502, .. }));
        assert!(err.is_retryable());

        transport.push_transport_error(repos.as_str(), "connection reset");
        let err = client.fetch_repositories("acme").await.unwrap_err();
        assert!(matches!(err, ApiError::Transport(ref m) if m.contains("connection reset")));
    }

    #[tokio::test]
    async fn test_auth_headers() {
        let transport = MockTransport::new();
        let basic = client(
            &transport,
            Some(Credentials::Basic {
                username: "ci-bot".into(),
                password: "secret".into(),
            }),
        );
        let url = basic
            .endpoint("/repositories/acme/api/pullrequests/7/comments", &[])
            .unwrap();
        transport.push_json(url.as_str(), 200, json!({"values": [{"id": 1}]}));
        basic
            .fetch_pull_request_comments("acme", "api", 7)
            .await
            .unwrap();

        let bearer = client(&transport, Some(Credentials::Bearer("tok".into())));
        transport.push_json(url.as_str(), 200, json!({"values": []}));
        bearer
            .fetch_pull_request_comments("acme", "api", 7)
            .await
            .unwrap();

        let requests = transport.requests();
        let auth = |i: usize| {
            crate::transport::header_get(&requests[i].headers, "authorization").map(String::from)
        };
        assert_eq!(auth(0).as_deref(), Some("Basic Y2ktYm90OnNlY3JldA=="));
        assert_eq!(auth(1).as_deref(), Some("Bearer tok"));
    }
}
