//! Provider traits and the execution listing facade.
//!
//! These traits define the only boundary between the scheduler core and the
//! outside world:
//! - `CiProvider`: pipeline executions (read-only)
//! - `CodeHost`: file contents, commit statuses, PR comments
//! - `ReviewTrigger`: the downstream review bot
//!
//! HTTP implementations live in `prgate-providers`; in-memory fakes are in
//! the [`fakes`](crate::fakes) module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ProviderError, ProviderResult, ReviewError};
use crate::model::{CommitStatus, PipelineExecution, PullRequestContext, RepositorySlug};
use crate::retry::RetryPolicy;

/// One page of pipeline executions, in provider order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPage {
    pub items: Vec<PipelineExecution>,
    pub next_page_token: Option<String>,
}

/// Read-only access to the CI provider.
#[async_trait]
pub trait CiProvider: Send + Sync {
    /// Fetch one page of recent executions for a repository.
    async fn list_executions(
        &self,
        repository: &RepositorySlug,
        page_token: Option<&str>,
    ) -> ProviderResult<ExecutionPage>;

    /// Map a CI workflow id to the id of the pipeline execution that owns it.
    async fn resolve_workflow_execution(&self, workflow_id: &str) -> ProviderResult<String>;

    /// Id of the newest execution matching `filter`, if any.
    async fn find_execution(
        &self,
        repository: &RepositorySlug,
        filter: &ExecutionFilter,
    ) -> ProviderResult<Option<String>>;

    /// Compiled pipeline configuration of an execution. `Ok(None)` when the
    /// provider has no configuration for it.
    async fn compiled_config(&self, execution_id: &str) -> ProviderResult<Option<String>>;
}

/// Access to the code-hosting provider.
#[async_trait]
pub trait CodeHost: Send + Sync {
    /// Latest status posted under `context` on `sha`, if any.
    async fn get_commit_status(
        &self,
        repository: &RepositorySlug,
        sha: &str,
        context: &str,
    ) -> ProviderResult<Option<CommitStatus>>;

    async fn publish_commit_status(
        &self,
        repository: &RepositorySlug,
        sha: &str,
        status: &CommitStatus,
    ) -> ProviderResult<()>;

    /// File content at `git_ref`. `Ok(None)` when the file does not exist.
    async fn fetch_file(
        &self,
        repository: &RepositorySlug,
        git_ref: &str,
        path: &str,
    ) -> ProviderResult<Option<Vec<u8>>>;

    /// Commit the submodule at `path` points to at `git_ref`. `Ok(None)` when
    /// `path` does not exist or is not a submodule.
    async fn submodule_revision(
        &self,
        repository: &RepositorySlug,
        git_ref: &str,
        path: &str,
    ) -> ProviderResult<Option<String>>;

    /// Edit the PR comment containing `marker`, or create it.
    async fn upsert_comment(
        &self,
        repository: &RepositorySlug,
        pull_request: u64,
        marker: &str,
        body: &str,
    ) -> ProviderResult<()>;
}

/// Downstream review bot invocation.
#[async_trait]
pub trait ReviewTrigger: Send + Sync {
    async fn trigger(&self, pull_request: &PullRequestContext) -> Result<(), ReviewError>;
}

/// Selects one execution on a branch by the workflows it ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFilter {
    pub branch: String,
    /// Every one of these workflows must be part of the execution.
    #[serde(default)]
    pub containing_workflows: Vec<String>,
    /// None of these workflows may be part of the execution.
    #[serde(default)]
    pub excluding_workflows: Vec<String>,
    /// Require the checked workflows to have succeeded: the
    /// `containing_workflows` when given, every workflow otherwise.
    #[serde(default)]
    pub successful_only: bool,
    /// Pages scanned before giving up.
    pub max_pages: usize,
}

impl ExecutionFilter {
    pub fn on_branch(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            containing_workflows: Vec::new(),
            excluding_workflows: Vec::new(),
            successful_only: false,
            max_pages: 1,
        }
    }

    /// Whether an execution running `workflows` (name, succeeded) matches.
    pub fn matches(&self, workflows: &[(&str, bool)]) -> bool {
        let ran = |name: &str| workflows.iter().any(|(w, _)| *w == name);
        if !self.containing_workflows.iter().all(|name| ran(name)) {
            return false;
        }
        if self.excluding_workflows.iter().any(|name| ran(name)) {
            return false;
        }
        if !self.successful_only {
            return true;
        }
        workflows
            .iter()
            .filter(|(name, _)| {
                self.containing_workflows.is_empty()
                    || self.containing_workflows.iter().any(|c| c == name)
            })
            .all(|(_, succeeded)| *succeeded)
    }
}

/// Bounds for a single listing of recent executions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionQuery {
    /// Stop when this execution id is reached (exclusive).
    pub since: Option<String>,
    /// Drop this execution and everything newer (exclusive).
    pub until: Option<String>,
    /// Ignore executions created before this instant.
    pub not_before: Option<DateTime<Utc>>,
    /// Hard cap on the number of pages requested.
    pub max_pages: usize,
}

impl Default for ExecutionQuery {
    fn default() -> Self {
        Self {
            since: None,
            until: None,
            not_before: None,
            max_pages: 20,
        }
    }
}

struct PageCursor {
    token: Option<String>,
    pages: usize,
    done: bool,
}

/// Lazily page through recent executions, newest first.
///
/// Each page request goes through `retry`. Paging stops at the `since`
/// cursor, after a page made only of executions older than `not_before`,
/// when the provider has no more pages, or after `max_pages`.
pub fn execution_stream<'a>(
    ci: &'a dyn CiProvider,
    repository: &'a RepositorySlug,
    query: &'a ExecutionQuery,
    retry: &'a RetryPolicy,
) -> BoxStream<'a, ProviderResult<PipelineExecution>> {
    let cursor = PageCursor {
        token: None,
        pages: 0,
        done: false,
    };

    stream::try_unfold(cursor, move |mut cursor| async move {
        if cursor.done || cursor.pages >= query.max_pages {
            return Ok(None);
        }

        let page = retry
            .run("list_executions", || {
                ci.list_executions(repository, cursor.token.as_deref())
            })
            .await?;
        cursor.pages += 1;

        let fetched = page.items.len();
        let mut items = Vec::with_capacity(fetched);
        let mut too_old = 0;
        for execution in page.items {
            if query.since.as_deref() == Some(execution.id.as_str()) {
                cursor.done = true;
                break;
            }
            if query.not_before.is_some_and(|cutoff| execution.created_at < cutoff) {
                too_old += 1;
                continue;
            }
            items.push(execution);
        }
        if fetched > 0 && too_old == fetched {
            cursor.done = true;
        }

        match page.next_page_token {
            Some(token) if !cursor.done => cursor.token = Some(token),
            _ => cursor.done = true,
        }

        debug!(
            repository = %repository,
            page = cursor.pages,
            fetched = fetched,
            kept = items.len(),
            "Fetched execution page"
        );

        let items = stream::iter(items.into_iter().map(Ok::<_, ProviderError>));
        Ok::<_, ProviderError>(Some((items, cursor)))
    })
    .try_flatten()
    .boxed()
}

/// List recent executions oldest-to-newest, bounded by `query.until`.
pub async fn list_recent_executions(
    ci: &dyn CiProvider,
    repository: &RepositorySlug,
    query: &ExecutionQuery,
    retry: &RetryPolicy,
) -> ProviderResult<Vec<PipelineExecution>> {
    let mut executions: Vec<PipelineExecution> =
        execution_stream(ci, repository, query, retry).try_collect().await?;

    executions.sort_by_key(|e| e.ordering_key());
    executions.dedup_by(|a, b| a.id == b.id);

    if let Some(until) = query.until.as_deref() {
        if let Some(position) = executions.iter().position(|e| e.id == until) {
            executions.truncate(position);
        }
    }

    Ok(executions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{execution, FakeCiProvider};
    use chrono::Duration;

    fn repo() -> RepositorySlug {
        RepositorySlug::new("octo", "repo")
    }

    fn provider_with(numbers: &[u64], page_size: usize) -> FakeCiProvider {
        let executions = numbers
            .iter()
            .map(|n| execution(*n, &format!("{:040x}", n), Some("pull/1")))
            .collect();
        FakeCiProvider::new(executions).with_page_size(page_size)
    }

    #[tokio::test]
    async fn test_lists_all_pages_oldest_first() {
        let ci = provider_with(&[1, 2, 3, 4, 5], 2);
        let query = ExecutionQuery::default();
        let got = list_recent_executions(&ci, &repo(), &query, &RetryPolicy::none())
            .await
            .unwrap();

        let numbers: Vec<u64> = got.iter().map(|e| e.number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        assert_eq!(ci.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_since_cursor_stops_paging() {
        let ci = provider_with(&[1, 2, 3, 4, 5], 2);
        let query = ExecutionQuery {
            since: Some("pipeline-3".to_string()),
            ..ExecutionQuery::default()
        };
        let got = list_recent_executions(&ci, &repo(), &query, &RetryPolicy::none())
            .await
            .unwrap();

        let numbers: Vec<u64> = got.iter().map(|e| e.number).collect();
        assert_eq!(numbers, vec![4, 5]);
        assert_eq!(ci.list_calls(), 2);
    }

    #[tokio::test]
    async fn test_until_bound_excludes_newer() {
        let ci = provider_with(&[1, 2, 3, 4, 5], 10);
        let query = ExecutionQuery {
            until: Some("pipeline-4".to_string()),
            ..ExecutionQuery::default()
        };
        let got = list_recent_executions(&ci, &repo(), &query, &RetryPolicy::none())
            .await
            .unwrap();

        let numbers: Vec<u64> = got.iter().map(|e| e.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_unknown_until_bound_keeps_everything() {
        let ci = provider_with(&[1, 2, 3], 10);
        let query = ExecutionQuery {
            until: Some("pipeline-99".to_string()),
            ..ExecutionQuery::default()
        };
        let got = list_recent_executions(&ci, &repo(), &query, &RetryPolicy::none())
            .await
            .unwrap();
        assert_eq!(got.len(), 3);
    }

    #[tokio::test]
    async fn test_not_before_cutoff_stops_on_old_page() {
        let ci = provider_with(&[1, 2, 3, 4, 5, 6], 2);
        // fakes timestamp execution N at epoch + N minutes
        let cutoff = crate::fakes::base_time() + Duration::minutes(4);
        let query = ExecutionQuery {
            not_before: Some(cutoff),
            ..ExecutionQuery::default()
        };
        let got = list_recent_executions(&ci, &repo(), &query, &RetryPolicy::none())
            .await
            .unwrap();

        let numbers: Vec<u64> = got.iter().map(|e| e.number).collect();
        assert_eq!(numbers, vec![4, 5, 6]);
        assert_eq!(ci.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_max_pages_caps_requests() {
        let ci = provider_with(&[1, 2, 3, 4, 5, 6], 2);
        let query = ExecutionQuery {
            max_pages: 1,
            ..ExecutionQuery::default()
        };
        let got = list_recent_executions(&ci, &repo(), &query, &RetryPolicy::none())
            .await
            .unwrap();

        let numbers: Vec<u64> = got.iter().map(|e| e.number).collect();
        assert_eq!(numbers, vec![5, 6]);
        assert_eq!(ci.list_calls(), 1);
    }

    #[test]
    fn test_execution_filter_matching() {
        let scheduler = ExecutionFilter {
            containing_workflows: vec!["scheduler".to_string()],
            successful_only: true,
            ..ExecutionFilter::on_branch("master")
        };
        assert!(scheduler.matches(&[("scheduler", true), ("build", false)]));
        assert!(!scheduler.matches(&[("scheduler", false)]));
        assert!(!scheduler.matches(&[("build", true)]));

        let reference = ExecutionFilter {
            excluding_workflows: vec!["scheduler".to_string()],
            ..ExecutionFilter::on_branch("master")
        };
        assert!(reference.matches(&[("build", false)]));
        assert!(!reference.matches(&[("build", true), ("scheduler", true)]));

        let all_green = ExecutionFilter {
            successful_only: true,
            ..ExecutionFilter::on_branch("master")
        };
        assert!(!all_green.matches(&[("build", true), ("lint", false)]));
    }

    #[tokio::test]
    async fn test_fatal_error_surfaces() {
        let ci = provider_with(&[1, 2], 10);
        ci.fail_next_lists(vec![ProviderError::fatal_auth("circleci", "invalid token")]);
        let query = ExecutionQuery::default();
        let err = list_recent_executions(&ci, &repo(), &query, &RetryPolicy::default())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
