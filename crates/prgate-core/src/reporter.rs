//! Verdict publication: commit status and optional PR summary comment.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::checks::{CheckOutcome, ConfigFingerprint, RunVerdict};
use crate::error::ProviderResult;
use crate::model::{CommitStatus, PullRequestContext, StatusState};
use crate::provider::CodeHost;
use crate::retry::RetryPolicy;
use crate::review::ReviewPolicy;

/// Maximum length GitHub accepts for a status description.
pub const MAX_DESCRIPTION_CHARS: usize = 140;

/// How verdicts are reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Commit status context owned by the scheduler.
    pub status_context: String,
    /// Link attached to every status (e.g. the scheduler's CI job).
    pub target_url: Option<String>,
    /// Also upsert a Markdown summary comment on the PR.
    pub summary_comment: bool,
    pub review_policy: ReviewPolicy,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            status_context: "prgate/integrity".to_string(),
            target_url: None,
            summary_comment: false,
            review_policy: ReviewPolicy::default(),
        }
    }
}

impl ReportConfig {
    /// Hidden marker identifying our summary comment.
    pub fn comment_marker(&self) -> String {
        format!("<!-- prgate:{} -->", self.status_context)
    }
}

/// Build the commit status for a verdict.
///
/// The description always ends with the fingerprint tag and never exceeds
/// [`MAX_DESCRIPTION_CHARS`] characters.
pub fn render_status(
    config: &ReportConfig,
    verdict: &RunVerdict,
    fingerprint: &ConfigFingerprint,
) -> CommitStatus {
    let total = verdict.results.len();
    let summary = if verdict.passed {
        format!("All {total} integrity checks passed")
    } else {
        let failing = verdict.failing_checks();
        format!(
            "{} of {total} integrity checks failed: {}",
            failing.len(),
            failing.join(", ")
        )
    };

    let tag = fingerprint.tag();
    let budget = MAX_DESCRIPTION_CHARS - tag.chars().count() - 1;
    let summary = if summary.chars().count() > budget {
        let kept: String = summary.chars().take(budget - 3).collect();
        format!("{}...", kept.trim_end())
    } else {
        summary
    };

    CommitStatus {
        state: if verdict.passed {
            StatusState::Success
        } else {
            StatusState::Failure
        },
        context: config.status_context.clone(),
        description: Some(format!("{summary} {tag}")),
        target_url: config.target_url.clone(),
    }
}

/// Render the Markdown summary comment for a PR head.
pub fn render_comment(
    config: &ReportConfig,
    pull_request: &PullRequestContext,
    verdict: &RunVerdict,
    fingerprint: &ConfigFingerprint,
) -> String {
    let mut body = String::new();
    body.push_str(&config.comment_marker());
    body.push('\n');

    if verdict.passed {
        body.push_str(&format!(
            "✅ All integrity checks passed for {}.\n",
            pull_request.head_sha
        ));
    } else {
        body.push_str(&format!(
            "⚠️ Some integrity checks failed for {}. If you did not make these changes, \
             **please rebase on the `{}` branch**.\n",
            pull_request.head_sha, pull_request.base_branch
        ));
    }

    body.push_str("\n| Check | Result | Details |\n|---|---|---|\n");
    for result in &verdict.results {
        let icon = match result.outcome {
            CheckOutcome::Pass => "✅",
            CheckOutcome::Fail => "❌",
            CheckOutcome::Error => "⚠️",
        };
        body.push_str(&format!(
            "| {} | {icon} {} | {} |\n",
            escape_cell(&result.name),
            result.outcome,
            escape_cell(&result.message)
        ));
    }

    body.push_str(&format!(
        "\n<sub>Configuration `{}`</sub>\n",
        fingerprint.short()
    ));
    body
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

/// Publishes verdicts to the code host.
pub struct Reporter<'a> {
    host: &'a dyn CodeHost,
    config: &'a ReportConfig,
    fingerprint: &'a ConfigFingerprint,
    retry: &'a RetryPolicy,
}

impl<'a> Reporter<'a> {
    pub fn new(
        host: &'a dyn CodeHost,
        config: &'a ReportConfig,
        fingerprint: &'a ConfigFingerprint,
        retry: &'a RetryPolicy,
    ) -> Self {
        Self {
            host,
            config,
            fingerprint,
            retry,
        }
    }

    /// Upsert the summary comment (when enabled), then publish the status.
    ///
    /// The status is written last: it is the dedup record, so a crash before
    /// it leaves the commit eligible for the next run. A non-fatal comment
    /// failure is logged and does not prevent the status.
    pub async fn publish(
        &self,
        pull_request: &PullRequestContext,
        verdict: &RunVerdict,
    ) -> ProviderResult<CommitStatus> {
        let repository = &pull_request.repository;
        let host = self.host;

        if self.config.summary_comment {
            let marker = self.config.comment_marker();
            let body = render_comment(self.config, pull_request, verdict, self.fingerprint);
            let written = self
                .retry
                .run("upsert_comment", || {
                    host.upsert_comment(repository, pull_request.number, &marker, &body)
                })
                .await;
            match written {
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => warn!(
                    repository = %repository,
                    pr = pull_request.number,
                    sha = %pull_request.head_sha,
                    error = %err,
                    "Failed to write summary comment"
                ),
                Ok(()) => {}
            }
        }

        let status = render_status(self.config, verdict, self.fingerprint);
        self.retry
            .run("publish_commit_status", || {
                host.publish_commit_status(repository, &pull_request.head_sha, &status)
            })
            .await?;

        info!(
            repository = %repository,
            pr = pull_request.number,
            sha = %pull_request.head_sha,
            state = %status.state,
            "Published commit status"
        );
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::{CheckConfig, CheckDefinition, CheckKind, CheckResult};
    use crate::classifier::{ClassifierConfig, PipelineClassifier};
    use crate::error::ProviderError;
    use crate::fakes::{execution, FakeCodeHost};
    use crate::model::RepositorySlug;
    use serde_json::json;

    fn fingerprint() -> ConfigFingerprint {
        CheckConfig::new(vec![CheckDefinition::new(
            "files",
            CheckKind::RequiredFiles,
            json!(["LICENSE"]),
        )])
        .compile()
        .unwrap()
        .fingerprint()
        .clone()
    }

    fn pull_request() -> PullRequestContext {
        PipelineClassifier::new(RepositorySlug::new("octo", "repo"), ClassifierConfig::default())
            .classify(&execution(1, "abc1234", Some("pull/42")))
            .unwrap()
    }

    fn failing_verdict() -> RunVerdict {
        RunVerdict::from_results(vec![
            CheckResult::pass("required files exist", "all 2 files present"),
            CheckResult::fail("content pattern", "VERSION did not match pattern"),
        ])
    }

    #[test]
    fn test_render_failure_status() {
        let fp = fingerprint();
        let status = render_status(&ReportConfig::default(), &failing_verdict(), &fp);
        assert_eq!(status.state, StatusState::Failure);
        assert_eq!(status.context, "prgate/integrity");
        let description = status.description.unwrap();
        assert!(description.starts_with("1 of 2 integrity checks failed: content pattern"));
        assert!(description.ends_with(&fp.tag()));
    }

    #[test]
    fn test_render_success_status() {
        let verdict = RunVerdict::from_results(vec![CheckResult::pass("a", "ok")]);
        let status = render_status(&ReportConfig::default(), &verdict, &fingerprint());
        assert_eq!(status.state, StatusState::Success);
    }

    #[test]
    fn test_long_description_truncated_keeping_tag() {
        let fp = fingerprint();
        let results = (0..40)
            .map(|i| CheckResult::fail(format!("a rather long check name {i}"), "no"))
            .collect();
        let verdict = RunVerdict::from_results(results);
        let status = render_status(&ReportConfig::default(), &verdict, &fp);
        let description = status.description.unwrap();
        assert!(description.chars().count() <= MAX_DESCRIPTION_CHARS);
        assert!(description.contains("..."));
        assert_eq!(ConfigFingerprint::extract(&description), Some(fp.short()));
    }

    #[test]
    fn test_render_comment_table() {
        let config = ReportConfig::default();
        let body = render_comment(&config, &pull_request(), &failing_verdict(), &fingerprint());
        assert!(body.starts_with("<!-- prgate:prgate/integrity -->"));
        assert!(body.contains("please rebase on the `master` branch"));
        assert!(body.contains("| content pattern | ❌ fail | VERSION did not match pattern |"));
    }

    #[tokio::test]
    async fn test_publish_writes_comment_then_status() {
        let host = FakeCodeHost::new();
        let config = ReportConfig {
            summary_comment: true,
            target_url: Some("https://ci.example/job/1".to_string()),
            ..ReportConfig::default()
        };
        let fp = fingerprint();
        let retry = RetryPolicy::none();
        let pr = pull_request();

        let status = Reporter::new(&host, &config, &fp, &retry)
            .publish(&pr, &failing_verdict())
            .await
            .unwrap();

        assert_eq!(host.published().len(), 1);
        assert_eq!(host.published()[0].status, status);
        assert_eq!(status.target_url.as_deref(), Some("https://ci.example/job/1"));
        assert!(host.comment(42, &config.comment_marker()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_retries_then_fails() {
        let host = FakeCodeHost::new();
        host.fail_next_publishes(vec![
            ProviderError::transient("github", "502"),
            ProviderError::transient("github", "502"),
            ProviderError::transient("github", "502"),
        ]);
        let config = ReportConfig::default();
        let fp = fingerprint();
        let retry = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };

        let err = Reporter::new(&host, &config, &fp, &retry)
            .publish(&pull_request(), &failing_verdict())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(host.published().is_empty());
        assert_eq!(host.comment_writes(), 0);
    }

    #[tokio::test]
    async fn test_rejected_comment_still_publishes_status() {
        let host = FakeCodeHost::new();
        host.fail_next_comments(vec![ProviderError::rejected(
            "github",
            403,
            "Must have admin rights to Repository.",
        )]);
        let config = ReportConfig {
            summary_comment: true,
            ..ReportConfig::default()
        };
        let fp = fingerprint();
        let retry = RetryPolicy::none();

        Reporter::new(&host, &config, &fp, &retry)
            .publish(&pull_request(), &failing_verdict())
            .await
            .unwrap();
        assert_eq!(host.published().len(), 1);
        assert!(host.comment(42, &config.comment_marker()).is_none());
    }

    #[tokio::test]
    async fn test_revoked_token_on_comment_is_fatal() {
        let host = FakeCodeHost::new();
        host.fail_next_comments(vec![ProviderError::fatal_auth("github", "Bad credentials")]);
        let config = ReportConfig {
            summary_comment: true,
            ..ReportConfig::default()
        };
        let fp = fingerprint();
        let retry = RetryPolicy::none();

        let err = Reporter::new(&host, &config, &fp, &retry)
            .publish(&pull_request(), &failing_verdict())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(host.published().is_empty());
    }
}
