//! One reconciliation pass over the configured repositories.
//!
//! Per repository the scheduler moves through
//! `Fetch -> Classify -> Filter -> Process -> Done`, where `Process` handles
//! pull request heads one at a time in chronological order
//! (dedup, checks, publish, review). A repository ends in `Errored` when its
//! executions cannot be listed, which does not affect the other repositories.
//! A credentials failure anywhere aborts the whole run: every repository
//! stops at its next checkpoint and ends in `Aborted`.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::checks::{evaluate_commit, CheckSet, RepoSnapshot, RunVerdict};
use crate::classifier::{ClassifierConfig, PipelineClassifier};
use crate::dedup::{DedupDecision, DedupTracker, Watermark};
use crate::error::{ProviderError, ProviderResult};
use crate::model::{PullRequestContext, RepositorySlug};
use crate::provider::{
    list_recent_executions, CiProvider, CodeHost, ExecutionFilter, ExecutionQuery, ReviewTrigger,
};
use crate::reporter::{ReportConfig, Reporter};
use crate::retry::RetryPolicy;
use crate::telemetry;

/// Where the newest execution to consider comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum UpperBound {
    /// Consider everything the provider returns.
    #[default]
    Unbounded,
    /// Stop before this execution id.
    Execution(String),
    /// Stop before the execution owning this CI workflow (the scheduler's own run).
    Workflow(String),
}

/// Scheduler settings for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub repositories: Vec<RepositorySlug>,
    pub classifier: ClassifierConfig,
    pub report: ReportConfig,
    pub retry: RetryPolicy,
    pub upper_bound: UpperBound,
    /// Lower cursor: listing stops at the newest execution matching this
    /// filter, typically the last successful scheduler run.
    pub cursor: Option<ExecutionFilter>,
    /// Ignore executions older than this many hours.
    pub lookback_hours: Option<u64>,
    pub max_pages: usize,
    /// Wall-clock budget for the whole run.
    pub timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            repositories: Vec::new(),
            classifier: ClassifierConfig::default(),
            report: ReportConfig::default(),
            retry: RetryPolicy::default(),
            upper_bound: UpperBound::default(),
            cursor: None,
            lookback_hours: None,
            max_pages: ExecutionQuery::default().max_pages,
            timeout: None,
        }
    }
}

/// Per-repository state. `Done`, `Errored` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Fetch,
    Classify,
    Filter,
    Process,
    Done,
    Errored,
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Errored | RunState::Aborted)
    }
}

/// What happened to one pull request head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrOutcome {
    /// A final status for the current configuration already existed.
    AlreadyReported,
    Passed,
    Failed,
    /// Checks ran but the status could not be written; retried next run.
    PublishFailed,
    /// The existing status could not be read.
    Errored,
    /// Not finished before the deadline.
    Abandoned,
}

/// Result of the review trigger for a PR head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ReviewRecord {
    Triggered,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrReport {
    pub number: u64,
    pub head_sha: String,
    pub execution_id: String,
    pub outcome: PrOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<RunVerdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PrReport {
    fn new(pr: &PullRequestContext, outcome: PrOutcome) -> Self {
        Self {
            number: pr.number,
            head_sha: pr.head_sha.clone(),
            execution_id: pr.execution_id.clone(),
            outcome,
            verdict: None,
            review: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryReport {
    pub repository: RepositorySlug,
    pub state: RunState,
    /// Executions returned by the CI provider within the bounds.
    pub executions: usize,
    /// Executions the classifier rejected.
    pub skipped: usize,
    pub pull_requests: Vec<PrReport>,
    pub watermark: Option<Watermark>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RepositoryReport {
    fn new(repository: RepositorySlug) -> Self {
        Self {
            repository,
            state: RunState::Fetch,
            executions: 0,
            skipped: 0,
            pull_requests: Vec::new(),
            watermark: None,
            error: None,
        }
    }

    fn transition(&mut self, state: RunState) {
        debug!(
            repository = %self.repository,
            from = ?self.state,
            to = ?state,
            "State transition"
        );
        self.state = state;
    }

    fn finish(mut self, state: RunState, error: Option<&ProviderError>) -> Self {
        self.transition(state);
        self.error = error.map(ToString::to_string);
        self
    }

    pub fn count(&self, outcome: PrOutcome) -> usize {
        self.pull_requests
            .iter()
            .filter(|pr| pr.outcome == outcome)
            .count()
    }
}

/// Everything one invocation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fingerprint: String,
    pub repositories: Vec<RepositoryReport>,
}

impl RunSummary {
    pub fn count(&self, outcome: PrOutcome) -> usize {
        self.repositories.iter().map(|r| r.count(outcome)).sum()
    }

    /// Whether anything prevented the run from completing its work.
    pub fn has_errors(&self) -> bool {
        self.repositories.iter().any(|r| r.state != RunState::Done)
            || self.count(PrOutcome::PublishFailed) > 0
            || self.count(PrOutcome::Errored) > 0
            || self.count(PrOutcome::Abandoned) > 0
    }

    /// `0` success or nothing to do, `1` a PR failed its checks, `2` scheduler
    /// error.
    pub fn exit_code(&self) -> u8 {
        if self.has_errors() {
            2
        } else if self.count(PrOutcome::Failed) > 0 {
            1
        } else {
            0
        }
    }
}

/// Why PR processing stopped early.
enum Interrupt {
    Deadline,
    Fatal(ProviderError),
}

impl From<ProviderError> for Interrupt {
    fn from(err: ProviderError) -> Self {
        Interrupt::Fatal(err)
    }
}

/// First credentials failure of the run, shared by every repository.
#[derive(Debug, Default)]
struct AbortSignal(OnceLock<ProviderError>);

impl AbortSignal {
    fn trigger(&self, err: &ProviderError) {
        if self.0.set(err.clone()).is_ok() {
            warn!(error = %err, "Credentials rejected, aborting the run");
        }
    }

    fn cause(&self) -> Option<&ProviderError> {
        self.0.get()
    }

    fn check(&self) -> Result<(), Interrupt> {
        match self.cause() {
            Some(err) => Err(Interrupt::Fatal(err.clone())),
            None => Ok(()),
        }
    }
}

async fn within<F: Future>(deadline: Option<Instant>, future: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, future).await.ok(),
        None => Some(future.await),
    }
}

/// Drives reconciliation passes.
pub struct Scheduler {
    ci: Arc<dyn CiProvider>,
    host: Arc<dyn CodeHost>,
    review: Option<Arc<dyn ReviewTrigger>>,
    checks: Arc<CheckSet>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        ci: Arc<dyn CiProvider>,
        host: Arc<dyn CodeHost>,
        checks: Arc<CheckSet>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            ci,
            host,
            review: None,
            checks,
            config,
        }
    }

    pub fn with_review_trigger(mut self, review: Arc<dyn ReviewTrigger>) -> Self {
        self.review = Some(review);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run one full pass over every configured repository.
    pub async fn run(&self) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("prgate.run", run_id = %run_id);

        async {
            let fingerprint = self.checks.fingerprint();
            let repository_count = self.config.repositories.len();
            telemetry::emit_run_started(&run_id, repository_count, fingerprint.short());

            let deadline = self.config.timeout.map(|timeout| Instant::now() + timeout);
            let abort = AbortSignal::default();

            let repositories = match self.resolve_upper_bound().await {
                Ok(until) => {
                    join_all(self.config.repositories.iter().map(|repository| {
                        self.run_repository(repository, until.as_deref(), deadline, &abort)
                    }))
                    .await
                }
                Err(err) => self
                    .config
                    .repositories
                    .iter()
                    .map(|repository| {
                        RepositoryReport::new(repository.clone())
                            .finish(RunState::Aborted, Some(&err))
                    })
                    .collect(),
            };

            let summary = RunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                fingerprint: fingerprint.to_string(),
                repositories,
            };
            telemetry::emit_run_finished(&summary);
            summary
        }
        .instrument(span)
        .await
    }

    /// Only a fatal error is returned; anything else drops the bound.
    async fn resolve_upper_bound(&self) -> ProviderResult<Option<String>> {
        match &self.config.upper_bound {
            UpperBound::Unbounded => Ok(None),
            UpperBound::Execution(id) => Ok(Some(id.clone())),
            UpperBound::Workflow(workflow_id) => {
                let ci = self.ci.as_ref();
                match self
                    .config
                    .retry
                    .run("resolve_workflow_execution", || {
                        ci.resolve_workflow_execution(workflow_id)
                    })
                    .await
                {
                    Ok(id) => {
                        info!(workflow = %workflow_id, execution = %id, "Resolved upper bound");
                        Ok(Some(id))
                    }
                    Err(err) if err.is_fatal() => Err(err),
                    Err(err) => {
                        warn!(
                            workflow = %workflow_id,
                            error = %err,
                            "Could not resolve upper bound, ignoring it"
                        );
                        Ok(None)
                    }
                }
            }
        }
    }

    /// Id of the execution listing stops at. Only a fatal error is
    /// returned; anything else lists without a cursor.
    async fn resolve_cursor(&self, repository: &RepositorySlug) -> ProviderResult<Option<String>> {
        let Some(filter) = &self.config.cursor else {
            return Ok(None);
        };
        let ci = self.ci.as_ref();
        match self
            .config
            .retry
            .run("find_execution", || ci.find_execution(repository, filter))
            .await
        {
            Ok(Some(id)) => {
                info!(branch = %filter.branch, execution = %id, "Resolved lower cursor");
                Ok(Some(id))
            }
            Ok(None) => {
                info!(branch = %filter.branch, "No cursor execution found, listing everything");
                Ok(None)
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!(
                    branch = %filter.branch,
                    error = %err,
                    "Could not resolve lower cursor, ignoring it"
                );
                Ok(None)
            }
        }
    }

    async fn run_repository(
        &self,
        repository: &RepositorySlug,
        until: Option<&str>,
        deadline: Option<Instant>,
        abort: &AbortSignal,
    ) -> RepositoryReport {
        let span = info_span!("repository", repository = %repository);
        let report = self
            .reconcile(repository, until, deadline, abort)
            .instrument(span)
            .await;
        telemetry::emit_repository_finished(&report);
        report
    }

    async fn reconcile(
        &self,
        repository: &RepositorySlug,
        until: Option<&str>,
        deadline: Option<Instant>,
        abort: &AbortSignal,
    ) -> RepositoryReport {
        let mut report = RepositoryReport::new(repository.clone());
        if let Some(err) = abort.cause() {
            return report.finish(RunState::Aborted, Some(err));
        }

        let fetched = within(deadline, async {
            let query = ExecutionQuery {
                since: self.resolve_cursor(repository).await?,
                until: until.map(str::to_string),
                not_before: self
                    .config
                    .lookback_hours
                    .map(|hours| Utc::now() - chrono::Duration::hours(hours as i64)),
                max_pages: self.config.max_pages,
            };
            list_recent_executions(self.ci.as_ref(), repository, &query, &self.config.retry).await
        })
        .await;
        let executions = match fetched {
            None => {
                report.error = Some("deadline exceeded while listing executions".to_string());
                report.transition(RunState::Errored);
                return report;
            }
            Some(Err(err)) if err.is_fatal() => {
                abort.trigger(&err);
                return report.finish(RunState::Aborted, Some(&err));
            }
            Some(Err(err)) => return report.finish(RunState::Errored, Some(&err)),
            Some(Ok(executions)) => executions,
        };
        if let Some(err) = abort.cause() {
            return report.finish(RunState::Aborted, Some(err));
        }
        report.executions = executions.len();

        report.transition(RunState::Classify);
        let classifier =
            PipelineClassifier::new(repository.clone(), self.config.classifier.clone());
        let candidates: Vec<PullRequestContext> =
            executions.iter().filter_map(|e| classifier.classify(e)).collect();
        report.skipped = executions.len() - candidates.len();

        report.transition(RunState::Filter);
        let (pull_requests, latest_heads) = filter_candidates(candidates);
        info!(
            executions = report.executions,
            skipped = report.skipped,
            pull_requests = pull_requests.len(),
            "Executions classified"
        );

        report.transition(RunState::Process);
        let fingerprint = self.checks.fingerprint();
        let mut tracker = DedupTracker::new(
            self.host.as_ref(),
            repository,
            &self.config.report.status_context,
            fingerprint,
            &self.config.retry,
        );
        let reporter = Reporter::new(
            self.host.as_ref(),
            &self.config.report,
            fingerprint,
            &self.config.retry,
        );

        let mut fatal = None;
        for (index, pr) in pull_requests.iter().enumerate() {
            let latest = latest_heads.get(&pr.number) == Some(&pr.head_sha);
            let processed = match abort.check() {
                Ok(()) => {
                    self.process_pull_request(pr, latest, &mut tracker, &reporter, deadline, abort)
                        .await
                }
                Err(interrupt) => Err(interrupt),
            };
            match processed {
                Ok(Some(pr_report)) => report.pull_requests.push(pr_report),
                Ok(None) => {}
                Err(Interrupt::Deadline) => {
                    let remaining = pull_requests.len() - index;
                    warn!(remaining = remaining, "Deadline reached, abandoning");
                    report.pull_requests.extend(
                        pull_requests[index..]
                            .iter()
                            .map(|pr| PrReport::new(pr, PrOutcome::Abandoned)),
                    );
                    break;
                }
                Err(Interrupt::Fatal(err)) => {
                    abort.trigger(&err);
                    fatal = Some(err);
                    break;
                }
            }
        }

        report.watermark = tracker.into_watermark();
        match fatal {
            Some(err) => report.finish(RunState::Aborted, Some(&err)),
            None => report.finish(RunState::Done, None),
        }
    }

    /// `Ok(None)` when the head was already handled earlier in this run.
    async fn process_pull_request(
        &self,
        pr: &PullRequestContext,
        latest: bool,
        tracker: &mut DedupTracker<'_>,
        reporter: &Reporter<'_>,
        deadline: Option<Instant>,
        abort: &AbortSignal,
    ) -> Result<Option<PrReport>, Interrupt> {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(Interrupt::Deadline);
        }

        let decision = within(deadline, tracker.check(pr))
            .await
            .ok_or(Interrupt::Deadline)?;
        let decision = match decision {
            Ok(decision) => decision,
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => {
                warn!(
                    pr = pr.number,
                    sha = %pr.head_sha,
                    error = %err,
                    "Could not read commit status"
                );
                tracker.mark_attempted(pr);
                let mut pr_report = PrReport::new(pr, PrOutcome::Errored);
                pr_report.error = Some(err.to_string());
                return Ok(Some(pr_report));
            }
        };

        match decision {
            DedupDecision::HandledThisRun => return Ok(None),
            DedupDecision::AlreadyReported(_) => {
                return Ok(Some(PrReport::new(pr, PrOutcome::AlreadyReported)));
            }
            DedupDecision::Process(reason) => {
                info!(pr = pr.number, sha = %pr.head_sha, reason = ?reason, "Running checks");
            }
        }

        let mut snapshot = RepoSnapshot::new(
            self.host.as_ref(),
            &pr.repository,
            pr.head_sha.clone(),
            &self.config.retry,
        )
        .with_pipeline(self.ci.as_ref(), pr.execution_id.clone());
        let verdict = within(deadline, evaluate_commit(&self.checks, &mut snapshot))
            .await
            .ok_or(Interrupt::Deadline)??;

        // last point where the PR can be dropped; a started publish runs to completion
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(Interrupt::Deadline);
        }
        abort.check()?;
        let published = reporter.publish(pr, &verdict).await;

        let mut pr_report = PrReport::new(
            pr,
            if verdict.passed {
                PrOutcome::Passed
            } else {
                PrOutcome::Failed
            },
        );
        match published {
            Ok(_) => tracker.mark_reported(pr),
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => {
                warn!(
                    pr = pr.number,
                    sha = %pr.head_sha,
                    error = %err,
                    "Could not publish commit status"
                );
                tracker.mark_attempted(pr);
                pr_report.outcome = PrOutcome::PublishFailed;
                pr_report.error = Some(err.to_string());
                pr_report.verdict = Some(verdict);
                return Ok(Some(pr_report));
            }
        }

        if verdict.passed && latest && self.config.report.review_policy.applies_to(pr) {
            pr_report.review = self.trigger_review(pr, deadline).await;
        }
        pr_report.verdict = Some(verdict);
        Ok(Some(pr_report))
    }

    async fn trigger_review(
        &self,
        pr: &PullRequestContext,
        deadline: Option<Instant>,
    ) -> Option<ReviewRecord> {
        let review = self.review.as_ref()?;
        let record = match within(deadline, review.trigger(pr)).await {
            Some(Ok(())) => {
                info!(pr = pr.number, sha = %pr.head_sha, "Review triggered");
                ReviewRecord::Triggered
            }
            Some(Err(err)) => {
                warn!(pr = pr.number, sha = %pr.head_sha, error = %err, "Review trigger failed");
                ReviewRecord::Failed {
                    error: err.to_string(),
                }
            }
            None => ReviewRecord::Failed {
                error: "deadline exceeded".to_string(),
            },
        };
        Some(record)
    }
}

/// Drop repeated heads (keeping the oldest execution) and find the newest
/// head of every PR. Input and output are in chronological order.
fn filter_candidates(
    candidates: Vec<PullRequestContext>,
) -> (Vec<PullRequestContext>, HashMap<u64, String>) {
    let mut latest_heads = HashMap::new();
    let mut seen = HashSet::new();
    let mut pull_requests = Vec::with_capacity(candidates.len());

    for pr in candidates {
        latest_heads.insert(pr.number, pr.head_sha.clone());
        if seen.insert(pr.head_sha.clone()) {
            pull_requests.push(pr);
        }
    }
    (pull_requests, latest_heads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::execution;

    fn contexts(specs: &[(u64, &str, &str)]) -> Vec<PullRequestContext> {
        let classifier = PipelineClassifier::new(
            RepositorySlug::new("octo", "repo"),
            ClassifierConfig::default(),
        );
        specs
            .iter()
            .map(|(n, sha, branch)| {
                classifier
                    .classify(&execution(*n, sha, Some(branch)))
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_filter_drops_repeated_heads_and_tracks_latest() {
        let candidates = contexts(&[
            (1, "aaaaaaa", "pull/1"),
            (2, "bbbbbbb", "pull/2"),
            (3, "aaaaaaa", "pull/1"),
            (4, "ccccccc", "pull/1"),
        ]);
        let (prs, latest) = filter_candidates(candidates);

        let numbers: Vec<u64> = prs.iter().map(|p| p.execution_number).collect();
        assert_eq!(numbers, vec![1, 2, 4]);
        assert_eq!(latest[&1], "ccccccc");
        assert_eq!(latest[&2], "bbbbbbb");
    }

    fn summary_with(outcomes: &[PrOutcome], state: RunState) -> RunSummary {
        let mut repository = RepositoryReport::new(RepositorySlug::new("octo", "repo"));
        repository.state = state;
        let pr = &contexts(&[(1, "aaaaaaa", "pull/1")])[0];
        repository.pull_requests = outcomes.iter().map(|o| PrReport::new(pr, *o)).collect();
        RunSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            fingerprint: String::new(),
            repositories: vec![repository],
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(summary_with(&[], RunState::Done).exit_code(), 0);
        let passed = [PrOutcome::Passed, PrOutcome::AlreadyReported];
        assert_eq!(summary_with(&passed, RunState::Done).exit_code(), 0);
        assert_eq!(
            summary_with(&[PrOutcome::Passed, PrOutcome::Failed], RunState::Done).exit_code(),
            1
        );
        let unpublished = [PrOutcome::Failed, PrOutcome::PublishFailed];
        assert_eq!(summary_with(&unpublished, RunState::Done).exit_code(), 2);
        assert_eq!(summary_with(&[PrOutcome::Abandoned], RunState::Done).exit_code(), 2);
        assert_eq!(summary_with(&[], RunState::Errored).exit_code(), 2);
        assert_eq!(summary_with(&[], RunState::Aborted).exit_code(), 2);
    }

    #[test]
    fn test_terminal_states() {
        assert!(RunState::Done.is_terminal());
        assert!(RunState::Aborted.is_terminal());
        assert!(!RunState::Process.is_terminal());
    }

    #[test]
    fn test_summary_serializes_outcomes_snake_case() {
        let summary = summary_with(&[PrOutcome::PublishFailed], RunState::Done);
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"outcome\":\"publish_failed\""));
        assert!(json.contains("\"state\":\"done\""));
    }
}
