//! Pipeline classification: which executions belong to a pull request.
//!
//! Classification never fails. An execution that is not PR-relevant, or whose
//! metadata is ambiguous or malformed, yields a [`SkipReason`] and is ignored.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{PipelineExecution, PullRequestContext, RepositorySlug, TriggerSource};

/// Classifier settings for one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Branch pull requests must target (the reference branch).
    pub target_branch: String,
    /// Workflows whose executions are never PR builds (e.g. the scheduler).
    pub ignored_workflows: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            target_branch: "master".to_string(),
            ignored_workflows: vec!["scheduler".to_string()],
        }
    }
}

/// Why an execution was not classified as a pull request build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Scheduled,
    IgnoredWorkflow(String),
    ForeignRepository(RepositorySlug),
    InvalidCommit(String),
    NotPullRequest,
    MalformedReference(String),
    AmbiguousPullRequest(Vec<u64>),
    OtherTargetBranch(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Scheduled => write!(f, "scheduled execution"),
            SkipReason::IgnoredWorkflow(name) => write!(f, "ignored workflow '{name}'"),
            SkipReason::ForeignRepository(repo) => write!(f, "belongs to {repo}"),
            SkipReason::InvalidCommit(sha) => write!(f, "invalid commit sha '{sha}'"),
            SkipReason::NotPullRequest => write!(f, "no pull request reference"),
            SkipReason::MalformedReference(r) => {
                write!(f, "malformed pull request reference '{r}'")
            }
            SkipReason::AmbiguousPullRequest(prs) => {
                write!(f, "references several pull requests {prs:?}")
            }
            SkipReason::OtherTargetBranch(b) => write!(f, "targets branch '{b}'"),
        }
    }
}

/// Decides whether an execution is a trackable pull request build.
#[derive(Debug, Clone)]
pub struct PipelineClassifier {
    repository: RepositorySlug,
    config: ClassifierConfig,
}

impl PipelineClassifier {
    pub fn new(repository: RepositorySlug, config: ClassifierConfig) -> Self {
        Self { repository, config }
    }

    /// Classify an execution, logging the skip reason at debug level.
    pub fn classify(&self, execution: &PipelineExecution) -> Option<PullRequestContext> {
        match self.inspect(execution) {
            Ok(context) => Some(context),
            Err(reason) => {
                debug!(
                    repository = %self.repository,
                    execution = %execution.id,
                    number = execution.number,
                    reason = %reason,
                    "Skipping execution"
                );
                None
            }
        }
    }

    /// Classify an execution, returning why it was skipped.
    pub fn inspect(&self, execution: &PipelineExecution) -> Result<PullRequestContext, SkipReason> {
        if execution.trigger == TriggerSource::Scheduled {
            return Err(SkipReason::Scheduled);
        }

        if let Some(workflow) = execution.workflow_name.as_deref() {
            if self.config.ignored_workflows.iter().any(|w| w == workflow) {
                return Err(SkipReason::IgnoredWorkflow(workflow.to_string()));
            }
        }

        if execution.repository != self.repository {
            return Err(SkipReason::ForeignRepository(execution.repository.clone()));
        }

        if !is_commit_sha(&execution.commit_sha) {
            return Err(SkipReason::InvalidCommit(execution.commit_sha.clone()));
        }

        let number = pull_request_number(execution)?;

        if let Some(base) = execution.base_branch.as_deref() {
            if base != self.config.target_branch {
                return Err(SkipReason::OtherTargetBranch(base.to_string()));
            }
        }

        let from_fork = match (
            execution.origin_repository_url.as_deref(),
            execution.target_repository_url.as_deref(),
        ) {
            (Some(origin), Some(target)) => normalize_url(origin) != normalize_url(target),
            _ => false,
        };

        Ok(PullRequestContext {
            number,
            head_sha: execution.commit_sha.to_ascii_lowercase(),
            base_branch: execution
                .base_branch
                .clone()
                .unwrap_or_else(|| self.config.target_branch.clone()),
            repository: self.repository.clone(),
            from_fork,
            execution_id: execution.id.clone(),
            execution_number: execution.number,
            created_at: execution.created_at,
        })
    }
}

fn is_commit_sha(sha: &str) -> bool {
    (4..=40).contains(&sha.len()) && sha.chars().all(|c| c.is_ascii_hexdigit())
}

fn normalize_url(url: &str) -> String {
    url.trim_end_matches('/')
        .trim_end_matches(".git")
        .to_ascii_lowercase()
}

/// Collect PR numbers from the `pull/N` branch and the provider's PR refs.
fn pull_request_number(execution: &PipelineExecution) -> Result<u64, SkipReason> {
    let mut numbers = BTreeSet::new();

    if let Some(branch) = execution.branch.as_deref() {
        if branch.starts_with("pull/") {
            numbers.insert(parse_pull_ref(branch)?);
        }
    }
    for reference in &execution.pull_request_refs {
        numbers.insert(parse_pull_ref(reference)?);
    }

    match numbers.len() {
        0 => Err(SkipReason::NotPullRequest),
        1 => Ok(numbers.into_iter().next().unwrap_or_default()),
        _ => Err(SkipReason::AmbiguousPullRequest(numbers.into_iter().collect())),
    }
}

/// Parse `pull/42`, `.../pull/42` or `.../pull/42/files`.
fn parse_pull_ref(reference: &str) -> Result<u64, SkipReason> {
    let malformed = || SkipReason::MalformedReference(reference.to_string());
    let (_, tail) = reference.rsplit_once("pull/").ok_or_else(malformed)?;
    let digits = tail.split('/').next().unwrap_or_default();
    match digits.parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(malformed()),
    }
}
