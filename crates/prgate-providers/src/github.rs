//! GitHub adapter: commit statuses, contents and issue comments.
//!
//! Summary comments are only ever edited when the authenticated account
//! wrote them. A 403 on a comment endpoint is a per-comment permission
//! problem and is reported as `Rejected`; only 401 stays fatal there.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prgate_core::{
    CodeHost, CommitStatus, ProviderError, ProviderResult, RepositorySlug, StatusState,
};
use reqwest::{Client, Method, RequestBuilder, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::http;

const PROVIDER: &str = "github";
const API_VERSION: &str = "2022-11-28";
const PAGE_SIZE: usize = 100;
const JSON_MEDIA_TYPE: &str = "application/vnd.github+json";
const RAW_MEDIA_TYPE: &str = "application/vnd.github.raw";

/// GitHub connection settings.
#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub api_url: String,
    pub token: String,
    /// Login the token authenticates as. Looked up with `GET /user` when unset.
    pub username: Option<String>,
    pub timeout: Duration,
}

impl GitHubConfig {
    pub const DEFAULT_API_URL: &'static str = "https://api.github.com";

    pub fn new(token: impl Into<String>) -> Self {
        Self {
            api_url: Self::DEFAULT_API_URL.to_string(),
            token: token.into(),
            username: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }
}

/// [`CodeHost`] backed by the GitHub REST API.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    base_url: Url,
    token: String,
    login: Arc<OnceCell<String>>,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct CombinedStatus {
    #[serde(default)]
    statuses: Vec<StatusEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StatusEntry {
    state: StatusState,
    context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IssueComment {
    id: u64,
    #[serde(default)]
    body: String,
    user: Option<Account>,
}

#[derive(Debug, Deserialize)]
struct Account {
    login: String,
}

impl IssueComment {
    fn written_by(&self, login: &str) -> bool {
        self.user
            .as_ref()
            .is_some_and(|user| user.login.eq_ignore_ascii_case(login))
    }
}

#[derive(Debug, Serialize)]
struct CommentBody<'a> {
    body: &'a str,
}

impl GitHubClient {
    pub fn new(config: GitHubConfig) -> ProviderResult<Self> {
        Ok(Self {
            base_url: http::parse_base_url(PROVIDER, &config.api_url)?,
            token: config.token,
            login: Arc::new(OnceCell::new_with(config.username)),
            client: http::build_client(PROVIDER, config.timeout)?,
        })
    }

    fn api(
        &self,
        method: Method,
        segments: &[&str],
        accept: &'static str,
    ) -> ProviderResult<RequestBuilder> {
        let url = http::endpoint(PROVIDER, &self.base_url, segments)?;
        Ok(self
            .client
            .request(method, url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, accept)
            .header("X-GitHub-Api-Version", API_VERSION))
    }

    fn request(
        &self,
        method: Method,
        repository: &RepositorySlug,
        segments: &[&str],
        accept: &'static str,
    ) -> ProviderResult<RequestBuilder> {
        let mut path = vec!["repos", repository.owner(), repository.name()];
        path.extend_from_slice(segments);
        self.api(method, &path, accept)
    }

    /// Login of the authenticated account, fetched once.
    async fn login(&self) -> ProviderResult<&str> {
        let login = self
            .login
            .get_or_try_init(|| async {
                let request = self.api(Method::GET, &["user"], JSON_MEDIA_TYPE)?;
                let response = http::send_scoped(PROVIDER, request).await?;
                let account: Account = http::json(PROVIDER, response).await?;
                debug!(login = %account.login, "Resolved authenticated GitHub account");
                Ok::<_, ProviderError>(account.login)
            })
            .await?;
        Ok(login.as_str())
    }

    /// Find our comment by marker, paging through the PR's comments.
    async fn find_comment(
        &self,
        repository: &RepositorySlug,
        pull_request: &str,
        marker: &str,
    ) -> ProviderResult<Option<u64>> {
        let login = self.login().await?;
        let mut page = 1usize;
        loop {
            let request = self
                .request(
                    Method::GET,
                    repository,
                    &["issues", pull_request, "comments"],
                    JSON_MEDIA_TYPE,
                )?
                .query(&[("per_page", PAGE_SIZE), ("page", page)]);
            let response = http::send_scoped(PROVIDER, request).await?;
            let comments: Vec<IssueComment> = http::json(PROVIDER, response).await?;

            let ours = comments
                .iter()
                .find(|c| c.written_by(login) && c.body.contains(marker));
            if let Some(found) = ours {
                return Ok(Some(found.id));
            }
            if comments.len() < PAGE_SIZE {
                return Ok(None);
            }
            page += 1;
        }
    }
}

#[async_trait]
impl CodeHost for GitHubClient {
    async fn get_commit_status(
        &self,
        repository: &RepositorySlug,
        sha: &str,
        context: &str,
    ) -> ProviderResult<Option<CommitStatus>> {
        let request = self
            .request(Method::GET, repository, &["commits", sha, "status"], JSON_MEDIA_TYPE)?
            .query(&[("per_page", PAGE_SIZE)]);
        let Some(response) = http::send_optional(PROVIDER, request).await? else {
            return Ok(None);
        };
        let combined: CombinedStatus = http::json(PROVIDER, response).await?;

        // newest first, one entry per context
        Ok(combined
            .statuses
            .into_iter()
            .find(|s| s.context == context)
            .map(|s| CommitStatus {
                state: s.state,
                context: s.context,
                description: s.description,
                target_url: s.target_url,
            }))
    }

    async fn publish_commit_status(
        &self,
        repository: &RepositorySlug,
        sha: &str,
        status: &CommitStatus,
    ) -> ProviderResult<()> {
        let body = StatusEntry {
            state: status.state,
            context: status.context.clone(),
            description: status.description.clone(),
            target_url: status.target_url.clone(),
        };
        let request = self
            .request(Method::POST, repository, &["statuses", sha], JSON_MEDIA_TYPE)?
            .json(&body);
        http::send(PROVIDER, request).await?;
        debug!(
            repository = %repository,
            sha = %sha,
            state = %status.state,
            "Created commit status"
        );
        Ok(())
    }

    async fn fetch_file(
        &self,
        repository: &RepositorySlug,
        git_ref: &str,
        path: &str,
    ) -> ProviderResult<Option<Vec<u8>>> {
        let request = self
            .request(Method::GET, repository, &["contents", path], RAW_MEDIA_TYPE)?
            .query(&[("ref", git_ref)]);
        let Some(response) = http::send_optional(PROVIDER, request).await? else {
            return Ok(None);
        };
        let bytes = response.bytes().await.map_err(|e| {
            ProviderError::transient(PROVIDER, format!("failed to read {path}: {e}"))
        })?;
        Ok(Some(bytes.to_vec()))
    }

    async fn submodule_revision(
        &self,
        repository: &RepositorySlug,
        git_ref: &str,
        path: &str,
    ) -> ProviderResult<Option<String>> {
        let request = self
            .request(Method::GET, repository, &["contents", path], JSON_MEDIA_TYPE)?
            .query(&[("ref", git_ref)]);
        let Some(response) = http::send_optional(PROVIDER, request).await? else {
            return Ok(None);
        };
        // a directory lists its entries as an array
        let entry: serde_json::Value = http::json(PROVIDER, response).await?;
        if entry["type"] != "submodule" {
            return Ok(None);
        }
        match entry["sha"].as_str() {
            Some(sha) => Ok(Some(sha.to_string())),
            None => Err(ProviderError::malformed(
                PROVIDER,
                format!("submodule {path} without sha"),
            )),
        }
    }

    async fn upsert_comment(
        &self,
        repository: &RepositorySlug,
        pull_request: u64,
        marker: &str,
        body: &str,
    ) -> ProviderResult<()> {
        let number = pull_request.to_string();
        let payload = CommentBody { body };

        let request = match self.find_comment(repository, &number, marker).await? {
            Some(id) => {
                let id = id.to_string();
                self.request(
                    Method::PATCH,
                    repository,
                    &["issues", "comments", id.as_str()],
                    JSON_MEDIA_TYPE,
                )?
                .json(&payload)
            }
            None => self
                .request(
                    Method::POST,
                    repository,
                    &["issues", number.as_str(), "comments"],
                    JSON_MEDIA_TYPE,
                )?
                .json(&payload),
        };
        http::send_scoped(PROVIDER, request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_status_deserializes() {
        let raw = r#"{
            "state": "failure",
            "sha": "abc1234",
            "total_count": 2,
            "statuses": [
                {
                    "state": "failure",
                    "context": "prgate/integrity",
                    "description": "1 of 2 failed [cfg:0123456789ab]",
                    "target_url": null
                },
                {
                    "state": "success",
                    "context": "ci/circleci: build",
                    "description": "ok",
                    "target_url": "https://ci"
                }
            ]
        }"#;
        let combined: CombinedStatus = serde_json::from_str(raw).unwrap();
        assert_eq!(combined.statuses.len(), 2);
        assert_eq!(combined.statuses[0].state, StatusState::Failure);
        assert_eq!(combined.statuses[0].target_url, None);
    }

    #[test]
    fn test_comment_author_matching() {
        let raw = r#"[
            {"id": 1, "body": "<!-- prgate -->", "user": {"login": "Prgate-Bot"}},
            {"id": 2, "body": "<!-- prgate -->", "user": {"login": "mallory"}},
            {"id": 3, "body": "<!-- prgate -->", "user": null}
        ]"#;
        let comments: Vec<IssueComment> = serde_json::from_str(raw).unwrap();
        assert!(comments[0].written_by("prgate-bot"));
        assert!(!comments[1].written_by("prgate-bot"));
        assert!(!comments[2].written_by("prgate-bot"));
    }

    #[test]
    fn test_status_payload_omits_missing_fields() {
        let entry = StatusEntry {
            state: StatusState::Success,
            context: "prgate/integrity".to_string(),
            description: None,
            target_url: None,
        };
        assert_eq!(
            serde_json::to_string(&entry).unwrap(),
            r#"{"state":"success","context":"prgate/integrity"}"#
        );
    }
}
