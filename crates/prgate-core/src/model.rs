//! Data model shared by every stage of the scheduler.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Repository identifier in `owner/name` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepositorySlug {
    owner: String,
    name: String,
}

impl RepositorySlug {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for RepositorySlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepositorySlug {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty() => {
                Ok(Self::new(owner, name))
            }
            _ => Err(format!("invalid repository '{s}', expected owner/name")),
        }
    }
}

impl TryFrom<String> for RepositorySlug {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RepositorySlug> for String {
    fn from(slug: RepositorySlug) -> Self {
        slug.to_string()
    }
}

/// What caused the CI provider to start a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    PullRequest,
    Branch,
    Scheduled,
    Api,
}

/// One pipeline run as reported by the CI provider. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineExecution {
    /// Provider identifier (opaque).
    pub id: String,

    /// Monotonic per-project pipeline number.
    pub number: u64,

    pub repository: RepositorySlug,

    /// Commit the pipeline ran on. May be empty if the provider omitted it.
    pub commit_sha: String,

    pub trigger: TriggerSource,

    /// Branch the pipeline ran for (`pull/N` for forked PRs).
    pub branch: Option<String>,

    /// Branch the PR targets, when the provider knows it.
    pub base_branch: Option<String>,

    pub workflow_name: Option<String>,

    /// Raw PR references attached by the provider (URLs or `pull/N`).
    #[serde(default)]
    pub pull_request_refs: Vec<String>,

    pub origin_repository_url: Option<String>,
    pub target_repository_url: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl PipelineExecution {
    /// Explicit processing order; provider list order is never trusted.
    pub fn ordering_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.number)
    }
}

/// A pipeline execution recognised as belonging to a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestContext {
    pub number: u64,
    pub head_sha: String,
    pub base_branch: String,
    pub repository: RepositorySlug,

    /// The head lives in a fork of the target repository.
    pub from_fork: bool,

    pub execution_id: String,
    pub execution_number: u64,
    pub created_at: DateTime<Utc>,
}

impl PullRequestContext {
    pub fn ordering_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.execution_number)
    }
}

/// State of a commit status entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Pending,
    Success,
    Failure,
    Error,
}

impl StatusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusState::Pending => "pending",
            StatusState::Success => "success",
            StatusState::Failure => "failure",
            StatusState::Error => "error",
        }
    }

    /// Whether the status records a finished evaluation.
    pub fn is_final(&self) -> bool {
        !matches!(self, StatusState::Pending)
    }
}

impl fmt::Display for StatusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named status marker attached to a commit on the code host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatus {
    pub state: StatusState,
    pub context: String,
    pub description: Option<String>,
    pub target_url: Option<String>,
}
