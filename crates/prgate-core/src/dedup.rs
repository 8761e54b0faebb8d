//! Dedup decisions and the per-run watermark.
//!
//! The code host is the only durable state: a commit that already carries a
//! final status under our context, tagged with the current configuration
//! fingerprint, has been reported and is skipped. Nothing is stored locally.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checks::ConfigFingerprint;
use crate::error::ProviderResult;
use crate::model::{CommitStatus, PullRequestContext, RepositorySlug};
use crate::provider::CodeHost;
use crate::retry::RetryPolicy;

/// Why a pull request head has to be evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessReason {
    /// No status under our context.
    NoStatus,
    /// A pending status, e.g. left behind by an interrupted run.
    Pending,
    /// A final status carrying another (or no) configuration fingerprint.
    StaleFingerprint,
}

/// Outcome of a dedup lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupDecision {
    Process(ProcessReason),
    /// The commit carries a final status for the current configuration.
    AlreadyReported(CommitStatus),
    /// The commit was already handled earlier in this run.
    HandledThisRun,
}

impl DedupDecision {
    pub fn should_process(&self) -> bool {
        matches!(self, DedupDecision::Process(_))
    }
}

/// Classify an existing status against the current fingerprint.
pub fn decide(existing: Option<&CommitStatus>, fingerprint: &ConfigFingerprint) -> DedupDecision {
    let Some(status) = existing else {
        return DedupDecision::Process(ProcessReason::NoStatus);
    };
    if !status.state.is_final() {
        return DedupDecision::Process(ProcessReason::Pending);
    }

    let current = status
        .description
        .as_deref()
        .and_then(ConfigFingerprint::extract)
        .is_some_and(|embedded| fingerprint.matches(embedded));

    if current {
        DedupDecision::AlreadyReported(status.clone())
    } else {
        DedupDecision::Process(ProcessReason::StaleFingerprint)
    }
}

/// Highest execution whose commit is known to carry a fresh status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub execution_id: String,
    pub execution_number: u64,
    pub created_at: DateTime<Utc>,
}

impl Watermark {
    fn ordering_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.execution_number)
    }
}

impl From<&PullRequestContext> for Watermark {
    fn from(pr: &PullRequestContext) -> Self {
        Self {
            execution_id: pr.execution_id.clone(),
            execution_number: pr.execution_number,
            created_at: pr.created_at,
        }
    }
}

/// Per-repository dedup state for one run.
pub struct DedupTracker<'a> {
    host: &'a dyn CodeHost,
    repository: &'a RepositorySlug,
    context: &'a str,
    fingerprint: &'a ConfigFingerprint,
    retry: &'a RetryPolicy,
    handled: HashSet<String>,
    watermark: Option<Watermark>,
}

impl<'a> DedupTracker<'a> {
    pub fn new(
        host: &'a dyn CodeHost,
        repository: &'a RepositorySlug,
        context: &'a str,
        fingerprint: &'a ConfigFingerprint,
        retry: &'a RetryPolicy,
    ) -> Self {
        Self {
            host,
            repository,
            context,
            fingerprint,
            retry,
            handled: HashSet::new(),
            watermark: None,
        }
    }

    /// Decide whether `pr` needs evaluation.
    ///
    /// Call immediately before processing the PR so that statuses written by
    /// a concurrent run are observed.
    pub async fn check(&mut self, pr: &PullRequestContext) -> ProviderResult<DedupDecision> {
        if self.handled.contains(&pr.head_sha) {
            return Ok(DedupDecision::HandledThisRun);
        }

        let host = self.host;
        let repository = self.repository;
        let context = self.context;
        let existing = self
            .retry
            .run("get_commit_status", || {
                host.get_commit_status(repository, &pr.head_sha, context)
            })
            .await?;

        let decision = decide(existing.as_ref(), self.fingerprint);
        debug!(
            repository = %self.repository,
            pr = pr.number,
            sha = %pr.head_sha,
            decision = ?decision,
            "Dedup decision"
        );

        if let DedupDecision::AlreadyReported(_) = decision {
            self.mark_reported(pr);
        }
        Ok(decision)
    }

    /// Record that `pr`'s head now carries a fresh status.
    pub fn mark_reported(&mut self, pr: &PullRequestContext) {
        self.handled.insert(pr.head_sha.clone());
        let candidate = Watermark::from(pr);
        let advance = self
            .watermark
            .as_ref()
            .map_or(true, |current| candidate.ordering_key() > current.ordering_key());
        if advance {
            self.watermark = Some(candidate);
        }
    }

    /// Record that `pr`'s head was attempted, without advancing the watermark.
    pub fn mark_attempted(&mut self, pr: &PullRequestContext) {
        self.handled.insert(pr.head_sha.clone());
    }

    pub fn watermark(&self) -> Option<&Watermark> {
        self.watermark.as_ref()
    }

    pub fn into_watermark(self) -> Option<Watermark> {
        self.watermark
    }
}
