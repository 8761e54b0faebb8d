//! In-memory fakes for the provider traits (testing only)
//!
//! Provides `FakeCiProvider`, `FakeCodeHost` and `RecordingReviewTrigger`
//! that satisfy the trait contracts without any network access. Failures can
//! be scripted per operation to exercise retry and error paths, and latency
//! can be injected to exercise deadlines.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::error::{ProviderError, ProviderResult, ReviewError};
use crate::model::{
    CommitStatus, PipelineExecution, PullRequestContext, RepositorySlug, TriggerSource,
};
use crate::provider::{CiProvider, CodeHost, ExecutionFilter, ExecutionPage, ReviewTrigger};

/// Fixed origin for fake timestamps.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

/// Build a PR-style execution on `octo/repo`.
///
/// Execution `n` gets id `pipeline-n` and is created `n` minutes after
/// [`base_time`]. A `pull/N` branch marks the execution as coming from a fork.
pub fn execution(number: u64, sha: &str, branch: Option<&str>) -> PipelineExecution {
    let forked = branch.is_some_and(|b| b.starts_with("pull/"));
    PipelineExecution {
        id: format!("pipeline-{number}"),
        number,
        repository: RepositorySlug::new("octo", "repo"),
        commit_sha: sha.to_string(),
        trigger: if forked {
            TriggerSource::PullRequest
        } else {
            TriggerSource::Branch
        },
        branch: branch.map(str::to_string),
        base_branch: None,
        workflow_name: Some("build".to_string()),
        pull_request_refs: Vec::new(),
        origin_repository_url: Some(if forked {
            "https://github.com/contributor/repo".to_string()
        } else {
            "https://github.com/octo/repo".to_string()
        }),
        target_repository_url: Some("https://github.com/octo/repo".to_string()),
        created_at: base_time() + Duration::minutes(number as i64),
    }
}

// ---------------------------------------------------------------------------
// FakeCiProvider
// ---------------------------------------------------------------------------

/// CI provider serving a fixed list of executions in pages.
#[derive(Debug)]
pub struct FakeCiProvider {
    executions: Vec<PipelineExecution>,
    page_size: usize,
    workflows: HashMap<String, String>,
    workflow_runs: HashMap<String, Vec<(String, bool)>>,
    compiled: HashMap<String, String>,
    list_failures: Mutex<VecDeque<ProviderError>>,
    repository_failures: Mutex<HashMap<String, ProviderError>>,
    find_failures: Mutex<VecDeque<ProviderError>>,
    list_calls: AtomicUsize,
}

impl FakeCiProvider {
    /// Serve `executions` newest first, like CircleCI does.
    pub fn new(mut executions: Vec<PipelineExecution>) -> Self {
        executions.sort_by(|a, b| b.number.cmp(&a.number));
        Self::in_provider_order(executions)
    }

    /// Serve `executions` exactly in the given order.
    pub fn in_provider_order(executions: Vec<PipelineExecution>) -> Self {
        Self {
            executions,
            page_size: 100,
            workflows: HashMap::new(),
            workflow_runs: HashMap::new(),
            compiled: HashMap::new(),
            list_failures: Mutex::new(VecDeque::new()),
            repository_failures: Mutex::new(HashMap::new()),
            find_failures: Mutex::new(VecDeque::new()),
            list_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_workflow(mut self, workflow_id: &str, execution_id: &str) -> Self {
        self.workflows
            .insert(workflow_id.to_string(), execution_id.to_string());
        self
    }

    /// Workflows an execution ran, as `(name, succeeded)`. Executions
    /// without an entry ran their `workflow_name` successfully.
    pub fn with_workflow_runs(mut self, execution_id: &str, runs: &[(&str, bool)]) -> Self {
        self.workflow_runs.insert(
            execution_id.to_string(),
            runs.iter().map(|(n, ok)| (n.to_string(), *ok)).collect(),
        );
        self
    }

    pub fn with_compiled_config(mut self, execution_id: &str, config: &str) -> Self {
        self.compiled
            .insert(execution_id.to_string(), config.to_string());
        self
    }

    /// Make the next list calls fail with these errors, in order.
    pub fn fail_next_lists(&self, errors: Vec<ProviderError>) {
        self.list_failures.lock().unwrap().extend(errors);
    }

    /// Every list call for `repository` fails with `error`.
    pub fn fail_repository(&self, repository: &RepositorySlug, error: ProviderError) {
        self.repository_failures
            .lock()
            .unwrap()
            .insert(repository.to_string(), error);
    }

    pub fn fail_next_finds(&self, errors: Vec<ProviderError>) {
        self.find_failures.lock().unwrap().extend(errors);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CiProvider for FakeCiProvider {
    async fn list_executions(
        &self,
        repository: &RepositorySlug,
        page_token: Option<&str>,
    ) -> ProviderResult<ExecutionPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.list_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        if let Some(err) = self.repository_failures.lock().unwrap().get(&repository.to_string()) {
            return Err(err.clone());
        }

        let offset = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| ProviderError::rejected("fake-ci", 400, "bad page token"))?,
            None => 0,
        };

        let matching: Vec<&PipelineExecution> = self
            .executions
            .iter()
            .filter(|e| &e.repository == repository)
            .collect();
        let end = (offset + self.page_size).min(matching.len());
        let items = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|e| (*e).clone())
            .collect();
        let next_page_token = (end < matching.len()).then(|| end.to_string());

        Ok(ExecutionPage {
            items,
            next_page_token,
        })
    }

    async fn resolve_workflow_execution(&self, workflow_id: &str) -> ProviderResult<String> {
        self.workflows
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| ProviderError::rejected("fake-ci", 404, "workflow not found"))
    }

    async fn find_execution(
        &self,
        repository: &RepositorySlug,
        filter: &ExecutionFilter,
    ) -> ProviderResult<Option<String>> {
        if let Some(err) = self.find_failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let scanned = self.page_size.saturating_mul(filter.max_pages);
        let found = self
            .executions
            .iter()
            .filter(|e| &e.repository == repository)
            .take(scanned)
            .filter(|e| e.branch.as_deref() == Some(filter.branch.as_str()))
            .find(|e| {
                let runs: Vec<(&str, bool)> = match self.workflow_runs.get(&e.id) {
                    Some(runs) => runs.iter().map(|(n, ok)| (n.as_str(), *ok)).collect(),
                    None => e.workflow_name.iter().map(|n| (n.as_str(), true)).collect(),
                };
                filter.matches(&runs)
            });
        Ok(found.map(|e| e.id.clone()))
    }

    async fn compiled_config(&self, execution_id: &str) -> ProviderResult<Option<String>> {
        Ok(self.compiled.get(execution_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// FakeCodeHost
// ---------------------------------------------------------------------------

/// A status write observed by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedStatus {
    pub repository: RepositorySlug,
    pub sha: String,
    pub status: CommitStatus,
}

type StatusKey = (String, String, String);

/// Code host backed by in-memory maps.
#[derive(Debug, Default)]
pub struct FakeCodeHost {
    files: Mutex<HashMap<(String, String), Vec<u8>>>,
    submodules: Mutex<HashMap<(String, String), String>>,
    statuses: Mutex<HashMap<StatusKey, CommitStatus>>,
    published: Mutex<Vec<PublishedStatus>>,
    comments: Mutex<HashMap<(u64, String), String>>,
    comment_writes: AtomicUsize,
    status_reads: AtomicUsize,
    status_failures: Mutex<VecDeque<ProviderError>>,
    publish_failures: Mutex<VecDeque<ProviderError>>,
    file_failures: Mutex<HashMap<String, ProviderError>>,
    comment_failures: Mutex<VecDeque<ProviderError>>,
    file_latency: Option<StdDuration>,
    publish_latency: Option<StdDuration>,
}

impl FakeCodeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `content` as `path` at `git_ref`.
    pub fn with_file(self, git_ref: &str, path: &str, content: &str) -> Self {
        self.put_file(git_ref, path, content.as_bytes());
        self
    }

    pub fn put_file(&self, git_ref: &str, path: &str, content: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert((git_ref.to_string(), path.to_string()), content.to_vec());
    }

    /// Record `path` at `git_ref` as a submodule pinned to `revision`.
    pub fn with_submodule(self, git_ref: &str, path: &str, revision: &str) -> Self {
        self.submodules.lock().unwrap().insert(
            (git_ref.to_string(), path.to_string()),
            revision.to_string(),
        );
        self
    }

    /// Every file read takes `latency` (tokio time).
    pub fn with_file_latency(mut self, latency: StdDuration) -> Self {
        self.file_latency = Some(latency);
        self
    }

    /// Every status write takes `latency` (tokio time) before it lands.
    pub fn with_publish_latency(mut self, latency: StdDuration) -> Self {
        self.publish_latency = Some(latency);
        self
    }

    /// Seed an existing status, as if posted by an earlier run.
    pub fn put_status(&self, repository: &RepositorySlug, sha: &str, status: CommitStatus) {
        self.statuses.lock().unwrap().insert(
            (repository.to_string(), sha.to_string(), status.context.clone()),
            status,
        );
    }

    pub fn fail_next_status_reads(&self, errors: Vec<ProviderError>) {
        self.status_failures.lock().unwrap().extend(errors);
    }

    pub fn fail_next_publishes(&self, errors: Vec<ProviderError>) {
        self.publish_failures.lock().unwrap().extend(errors);
    }

    pub fn fail_next_comments(&self, errors: Vec<ProviderError>) {
        self.comment_failures.lock().unwrap().extend(errors);
    }

    /// Every read of `path` fails with `error`.
    pub fn fail_file(&self, path: &str, error: ProviderError) {
        self.file_failures
            .lock()
            .unwrap()
            .insert(path.to_string(), error);
    }

    /// All successful status writes, in order.
    pub fn published(&self) -> Vec<PublishedStatus> {
        self.published.lock().unwrap().clone()
    }

    pub fn status(
        &self,
        repository: &RepositorySlug,
        sha: &str,
        context: &str,
    ) -> Option<CommitStatus> {
        self.statuses
            .lock()
            .unwrap()
            .get(&(repository.to_string(), sha.to_string(), context.to_string()))
            .cloned()
    }

    pub fn comment(&self, pull_request: u64, marker: &str) -> Option<String> {
        self.comments
            .lock()
            .unwrap()
            .get(&(pull_request, marker.to_string()))
            .cloned()
    }

    pub fn comment_writes(&self) -> usize {
        self.comment_writes.load(Ordering::SeqCst)
    }

    pub fn status_reads(&self) -> usize {
        self.status_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CodeHost for FakeCodeHost {
    async fn get_commit_status(
        &self,
        repository: &RepositorySlug,
        sha: &str,
        context: &str,
    ) -> ProviderResult<Option<CommitStatus>> {
        self.status_reads.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.status_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self.status(repository, sha, context))
    }

    async fn publish_commit_status(
        &self,
        repository: &RepositorySlug,
        sha: &str,
        status: &CommitStatus,
    ) -> ProviderResult<()> {
        if let Some(latency) = self.publish_latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(err) = self.publish_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.put_status(repository, sha, status.clone());
        self.published.lock().unwrap().push(PublishedStatus {
            repository: repository.clone(),
            sha: sha.to_string(),
            status: status.clone(),
        });
        Ok(())
    }

    async fn fetch_file(
        &self,
        _repository: &RepositorySlug,
        git_ref: &str,
        path: &str,
    ) -> ProviderResult<Option<Vec<u8>>> {
        if let Some(latency) = self.file_latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(err) = self.file_failures.lock().unwrap().get(path) {
            return Err(err.clone());
        }
        Ok(self
            .files
            .lock()
            .unwrap()
            .get(&(git_ref.to_string(), path.to_string()))
            .cloned())
    }

    async fn submodule_revision(
        &self,
        _repository: &RepositorySlug,
        git_ref: &str,
        path: &str,
    ) -> ProviderResult<Option<String>> {
        if let Some(err) = self.file_failures.lock().unwrap().get(path) {
            return Err(err.clone());
        }
        Ok(self
            .submodules
            .lock()
            .unwrap()
            .get(&(git_ref.to_string(), path.to_string()))
            .cloned())
    }

    async fn upsert_comment(
        &self,
        _repository: &RepositorySlug,
        pull_request: u64,
        marker: &str,
        body: &str,
    ) -> ProviderResult<()> {
        self.comment_writes.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.comment_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.comments
            .lock()
            .unwrap()
            .insert((pull_request, marker.to_string()), body.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingReviewTrigger
// ---------------------------------------------------------------------------

/// Review trigger that records which PR heads it was asked to review.
#[derive(Debug, Default)]
pub struct RecordingReviewTrigger {
    triggered: Mutex<Vec<(u64, String)>>,
    fail: bool,
}

impl RecordingReviewTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// A trigger whose every invocation fails.
    pub fn failing() -> Self {
        Self {
            triggered: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    /// `(pr number, head sha)` pairs, in invocation order.
    pub fn triggered(&self) -> Vec<(u64, String)> {
        self.triggered.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReviewTrigger for RecordingReviewTrigger {
    async fn trigger(&self, pull_request: &PullRequestContext) -> Result<(), ReviewError> {
        self.triggered
            .lock()
            .unwrap()
            .push((pull_request.number, pull_request.head_sha.clone()));
        if self.fail {
            return Err(ReviewError::Exit { code: 1 });
        }
        Ok(())
    }
}
