//! CircleCI adapter: API v2 for pipelines and workflows, v1.1 for job PRs.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prgate_core::{
    CiProvider, ExecutionFilter, ExecutionPage, PipelineExecution, ProviderError, ProviderResult,
    RepositorySlug, TriggerSource,
};
use reqwest::{Client, RequestBuilder, Url};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::http;

const PROVIDER: &str = "circleci";

/// CircleCI connection settings.
#[derive(Debug, Clone)]
pub struct CircleCiConfig {
    /// API root, without the version (`https://circleci.com/api`).
    pub api_url: String,
    pub token: String,
    /// VCS type prefix of project slugs (`gh` for GitHub).
    pub vcs: String,
    pub timeout: Duration,
}

impl CircleCiConfig {
    pub const DEFAULT_API_URL: &'static str = "https://circleci.com/api";

    pub fn new(token: impl Into<String>) -> Self {
        Self {
            api_url: Self::DEFAULT_API_URL.to_string(),
            token: token.into(),
            vcs: "gh".to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }
}

/// [`CiProvider`] backed by the CircleCI REST API.
///
/// Each listed pipeline is enriched with its first workflow's name and, for
/// builds that are not `pull/N` branches, with the pull requests CircleCI
/// associates to the workflow's first job. A pipeline whose enrichment is
/// rejected or undecodable is still listed, without workflow or PR data.
#[derive(Debug, Clone)]
pub struct CircleCiClient {
    base_url: Url,
    token: String,
    vcs: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct PipelineList {
    items: Vec<Pipeline>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Pipeline {
    id: String,
    number: u64,
    created_at: DateTime<Utc>,
    #[serde(default)]
    trigger: Trigger,
    #[serde(default)]
    vcs: Vcs,
}

#[derive(Debug, Default, Deserialize)]
struct Trigger {
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Default, Deserialize)]
struct Vcs {
    #[serde(default)]
    revision: String,
    branch: Option<String>,
    origin_repository_url: Option<String>,
    target_repository_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Items<T> {
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Workflow {
    id: String,
    name: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct PipelineConfig {
    compiled: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WorkflowDetail {
    pipeline_id: String,
}

#[derive(Debug, Deserialize)]
struct Job {
    job_number: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct JobDetail {
    #[serde(default)]
    pull_requests: Vec<JobPullRequest>,
}

#[derive(Debug, Deserialize)]
struct JobPullRequest {
    url: String,
}

impl CircleCiClient {
    pub fn new(config: CircleCiConfig) -> ProviderResult<Self> {
        Ok(Self {
            base_url: http::parse_base_url(PROVIDER, &config.api_url)?,
            token: config.token,
            vcs: config.vcs,
            client: http::build_client(PROVIDER, config.timeout)?,
        })
    }

    fn v2(&self, segments: &[&str]) -> ProviderResult<RequestBuilder> {
        let mut path = vec!["v2"];
        path.extend_from_slice(segments);
        let url = http::endpoint(PROVIDER, &self.base_url, &path)?;
        Ok(self
            .client
            .get(url)
            .header("Circle-Token", self.token.as_str())
            .header(reqwest::header::ACCEPT, "application/json"))
    }

    fn v1(&self, segments: &[&str]) -> ProviderResult<RequestBuilder> {
        let mut path = vec!["v1.1"];
        path.extend_from_slice(segments);
        let url = http::endpoint(PROVIDER, &self.base_url, &path)?;
        Ok(self
            .client
            .get(url)
            .basic_auth(&self.token, Some(""))
            .header(reqwest::header::ACCEPT, "application/json"))
    }

    async fn workflows(&self, pipeline_id: &str) -> ProviderResult<Vec<Workflow>> {
        let request = self.v2(&["pipeline", pipeline_id, "workflow"])?;
        let response = http::send(PROVIDER, request).await?;
        Ok(http::json::<Items<Workflow>>(PROVIDER, response).await?.items)
    }

    /// Pull request URLs CircleCI attached to the first job of a workflow.
    async fn workflow_pull_requests(
        &self,
        repository: &RepositorySlug,
        workflow_id: &str,
    ) -> ProviderResult<Vec<String>> {
        let request = self.v2(&["workflow", workflow_id, "job"])?;
        let response = http::send(PROVIDER, request).await?;
        let jobs = http::json::<Items<Job>>(PROVIDER, response).await?.items;

        let Some(job_number) = jobs.first().and_then(|job| job.job_number) else {
            return Ok(Vec::new());
        };

        let job_number = job_number.to_string();
        let request = self.v1(&[
            "project",
            self.vcs.as_str(),
            repository.owner(),
            repository.name(),
            job_number.as_str(),
        ])?;
        let response = http::send(PROVIDER, request).await?;
        let detail: JobDetail = http::json(PROVIDER, response).await?;
        Ok(detail.pull_requests.into_iter().map(|pr| pr.url).collect())
    }

    /// First workflow name and associated PR URLs of a pipeline.
    async fn enrich(
        &self,
        repository: &RepositorySlug,
        pipeline_id: &str,
        trigger: TriggerSource,
    ) -> ProviderResult<(Option<String>, Vec<String>)> {
        if trigger == TriggerSource::Scheduled {
            return Ok((None, Vec::new()));
        }
        let workflows = self.workflows(pipeline_id).await?;
        let Some(first) = workflows.first() else {
            return Ok((None, Vec::new()));
        };
        let pull_request_refs = if trigger == TriggerSource::PullRequest {
            Vec::new()
        } else {
            self.workflow_pull_requests(repository, &first.id).await?
        };
        Ok((Some(first.name.clone()), pull_request_refs))
    }

    async fn to_execution(
        &self,
        repository: &RepositorySlug,
        pipeline: Pipeline,
    ) -> ProviderResult<PipelineExecution> {
        let trigger = trigger_source(&pipeline.trigger.kind, pipeline.vcs.branch.as_deref());

        let (workflow_name, pull_request_refs) =
            match self.enrich(repository, &pipeline.id, trigger).await {
                Ok(enriched) => enriched,
                Err(err) if err.is_fatal() || err.is_transient() => return Err(err),
                Err(err) => {
                    warn!(
                        repository = %repository,
                        pipeline = %pipeline.id,
                        error = %err,
                        "Could not enrich pipeline, listing it without workflow data"
                    );
                    (None, Vec::new())
                }
            };

        Ok(PipelineExecution {
            id: pipeline.id,
            number: pipeline.number,
            repository: repository.clone(),
            commit_sha: pipeline.vcs.revision,
            trigger,
            branch: pipeline.vcs.branch,
            base_branch: None,
            workflow_name,
            pull_request_refs,
            origin_repository_url: pipeline.vcs.origin_repository_url,
            target_repository_url: pipeline.vcs.target_repository_url,
            created_at: pipeline.created_at,
        })
    }
}

fn trigger_source(kind: &str, branch: Option<&str>) -> TriggerSource {
    match kind {
        "schedule" | "scheduled_pipeline" => TriggerSource::Scheduled,
        "api" | "explicit" => TriggerSource::Api,
        _ if branch.is_some_and(|b| b.starts_with("pull/")) => TriggerSource::PullRequest,
        _ => TriggerSource::Branch,
    }
}

#[async_trait]
impl CiProvider for CircleCiClient {
    async fn list_executions(
        &self,
        repository: &RepositorySlug,
        page_token: Option<&str>,
    ) -> ProviderResult<ExecutionPage> {
        let mut request = self.v2(&[
            "project",
            self.vcs.as_str(),
            repository.owner(),
            repository.name(),
            "pipeline",
        ])?;
        if let Some(token) = page_token {
            request = request.query(&[("page-token", token)]);
        }

        let response = http::send(PROVIDER, request).await?;
        let page: PipelineList = http::json(PROVIDER, response).await?;
        debug!(
            repository = %repository,
            items = page.items.len(),
            has_next = page.next_page_token.is_some(),
            "Fetched CircleCI pipelines"
        );

        let mut items = Vec::with_capacity(page.items.len());
        for pipeline in page.items {
            items.push(self.to_execution(repository, pipeline).await?);
        }

        Ok(ExecutionPage {
            items,
            next_page_token: page.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn resolve_workflow_execution(&self, workflow_id: &str) -> ProviderResult<String> {
        let request = self.v2(&["workflow", workflow_id])?;
        let response = http::send(PROVIDER, request).await?;
        let detail: WorkflowDetail = http::json(PROVIDER, response).await?;
        if detail.pipeline_id.is_empty() {
            return Err(ProviderError::malformed(PROVIDER, "workflow without pipeline_id"));
        }
        Ok(detail.pipeline_id)
    }

    async fn find_execution(
        &self,
        repository: &RepositorySlug,
        filter: &ExecutionFilter,
    ) -> ProviderResult<Option<String>> {
        let mut page_token: Option<String> = None;
        for _ in 0..filter.max_pages.max(1) {
            let mut request = self.v2(&[
                "project",
                self.vcs.as_str(),
                repository.owner(),
                repository.name(),
                "pipeline",
            ])?;
            request = match &page_token {
                Some(token) => request.query(&[("page-token", token.as_str())]),
                None => request.query(&[("branch", filter.branch.as_str())]),
            };
            let response = http::send(PROVIDER, request).await?;
            let page: PipelineList = http::json(PROVIDER, response).await?;

            for pipeline in &page.items {
                // the branch parameter is dropped when following a page token
                if pipeline.vcs.branch.as_deref() != Some(filter.branch.as_str()) {
                    continue;
                }
                let workflows = self.workflows(&pipeline.id).await?;
                let runs: Vec<(&str, bool)> = workflows
                    .iter()
                    .map(|w| (w.name.as_str(), w.status == "success"))
                    .collect();
                if filter.matches(&runs) {
                    debug!(
                        repository = %repository,
                        branch = %filter.branch,
                        pipeline = %pipeline.id,
                        "Found matching pipeline"
                    );
                    return Ok(Some(pipeline.id.clone()));
                }
            }

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(None)
    }

    async fn compiled_config(&self, execution_id: &str) -> ProviderResult<Option<String>> {
        let request = self.v2(&["pipeline", execution_id, "config"])?;
        let Some(response) = http::send_optional(PROVIDER, request).await? else {
            return Ok(None);
        };
        let config: PipelineConfig = http::json(PROVIDER, response).await?;
        Ok(config.compiled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_source_mapping() {
        assert_eq!(trigger_source("schedule", None), TriggerSource::Scheduled);
        assert_eq!(
            trigger_source("scheduled_pipeline", Some("master")),
            TriggerSource::Scheduled
        );
        assert_eq!(trigger_source("api", Some("pull/3")), TriggerSource::Api);
        assert_eq!(trigger_source("webhook", Some("pull/3")), TriggerSource::PullRequest);
        assert_eq!(trigger_source("webhook", Some("feature")), TriggerSource::Branch);
        assert_eq!(trigger_source("", None), TriggerSource::Branch);
    }

    #[test]
    fn test_pipeline_deserializes_from_api_shape() {
        let raw = r#"{
            "items": [{
                "id": "5034460f-c7c4-4c43-9457-de07e2029e7b",
                "number": 812,
                "state": "created",
                "created_at": "2024-01-01T12:00:00.000Z",
                "trigger": {"type": "webhook", "actor": {"login": "octo"}},
                "vcs": {
                    "revision": "abc1234",
                    "branch": "pull/42",
                    "origin_repository_url": "https://github.com/contributor/repo",
                    "target_repository_url": "https://github.com/octo/repo"
                }
            }],
            "next_page_token": "token-2"
        }"#;
        let page: PipelineList = serde_json::from_str(raw).unwrap();
        assert_eq!(page.items[0].number, 812);
        assert_eq!(page.items[0].vcs.branch.as_deref(), Some("pull/42"));
        assert_eq!(page.next_page_token.as_deref(), Some("token-2"));
    }

    #[test]
    fn test_workflow_status_defaults_when_absent() {
        let raw = r#"{"items": [
            {"id": "wf-1", "name": "scheduler", "status": "success"},
            {"id": "wf-2", "name": "build"}
        ]}"#;
        let workflows: Items<Workflow> = serde_json::from_str(raw).unwrap();
        assert_eq!(workflows.items[0].status, "success");
        assert_eq!(workflows.items[1].status, "");
    }

    #[test]
    fn test_client_rejects_invalid_url() {
        let config = CircleCiConfig::new("token").with_api_url("not a url");
        assert!(CircleCiClient::new(config).is_err());
    }
}
