//! Downstream review bot invocation.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ReviewError;
use crate::model::PullRequestContext;
use crate::provider::ReviewTrigger;

/// Which pull requests get the review bot after a passing verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewPolicy {
    Never,
    /// Only PRs opened from forks. Internal PRs get the bot from their own CI.
    #[default]
    ForksOnly,
    Always,
}

impl ReviewPolicy {
    pub fn applies_to(&self, pull_request: &PullRequestContext) -> bool {
        match self {
            ReviewPolicy::Never => false,
            ReviewPolicy::ForksOnly => pull_request.from_fork,
            ReviewPolicy::Always => true,
        }
    }
}

impl std::str::FromStr for ReviewPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "never" => Ok(ReviewPolicy::Never),
            "forks_only" | "forks-only" => Ok(ReviewPolicy::ForksOnly),
            "always" => Ok(ReviewPolicy::Always),
            other => Err(format!(
                "unknown review policy '{other}' (expected never, forks_only or always)"
            )),
        }
    }
}

/// Runs an external command for each pull request to review.
///
/// The command inherits the scheduler's environment minus the CI provider's
/// own variables, plus:
/// - `PRGATE_PR_NUMBER`
/// - `PRGATE_HEAD_SHA`
/// - `PRGATE_REPOSITORY`
/// - `PRGATE_BASE_BRANCH`
/// - `PRGATE_FROM_FORK` (`true`/`false`)
#[derive(Debug, Clone)]
pub struct CommandReviewTrigger {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandReviewTrigger {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Build from a whitespace-separated command line.
    pub fn from_command_line(command: &str, timeout: Duration) -> Result<Self, ReviewError> {
        let mut words = command.split_whitespace().map(str::to_string);
        let program = words.next().ok_or(ReviewError::EmptyCommand)?;
        Ok(Self::new(program, words.collect(), timeout))
    }

    fn command(&self, pull_request: &PullRequestContext) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Keep the bot from mistaking this process for the PR's own CI job.
        for (key, _) in std::env::vars_os() {
            if let Some(key) = key.to_str() {
                if key.starts_with("CIRCLE") || key == "CI" {
                    command.env_remove(key);
                }
            }
        }

        command
            .env("PRGATE_PR_NUMBER", pull_request.number.to_string())
            .env("PRGATE_HEAD_SHA", &pull_request.head_sha)
            .env("PRGATE_REPOSITORY", pull_request.repository.to_string())
            .env("PRGATE_BASE_BRANCH", &pull_request.base_branch)
            .env("PRGATE_FROM_FORK", pull_request.from_fork.to_string());
        command
    }
}

#[async_trait]
impl ReviewTrigger for CommandReviewTrigger {
    async fn trigger(&self, pull_request: &PullRequestContext) -> Result<(), ReviewError> {
        debug!(
            program = %self.program,
            pr = pull_request.number,
            sha = %pull_request.head_sha,
            "Running review command"
        );

        let child = self.command(pull_request).spawn()?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ReviewError::Timeout {
                secs: self.timeout.as_secs(),
            })??;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(
            pr = pull_request.number,
            sha = %pull_request.head_sha,
            stderr = %stderr.trim(),
            "Review command failed"
        );
        Err(ReviewError::Exit {
            code: output.status.code().unwrap_or(-1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ClassifierConfig, PipelineClassifier};
    use crate::fakes::execution;
    use crate::model::RepositorySlug;

    fn pull_request(branch: &str) -> PullRequestContext {
        let mut exec = execution(1, "abc1234", Some(branch));
        if !branch.starts_with("pull/") {
            exec.pull_request_refs = vec!["https://github.com/octo/repo/pull/42".to_string()];
        }
        PipelineClassifier::new(RepositorySlug::new("octo", "repo"), ClassifierConfig::default())
            .classify(&exec)
            .expect("pr execution")
    }

    fn sh(script: &str) -> CommandReviewTrigger {
        CommandReviewTrigger::new(
            "sh",
            vec!["-c".to_string(), script.to_string()],
            Duration::from_secs(10),
        )
    }

    #[test]
    fn test_policy_applies() {
        let fork = pull_request("pull/42");
        let internal = pull_request("feature");
        assert!(fork.from_fork);
        assert!(!internal.from_fork);

        assert!(!ReviewPolicy::Never.applies_to(&fork));
        assert!(ReviewPolicy::ForksOnly.applies_to(&fork));
        assert!(!ReviewPolicy::ForksOnly.applies_to(&internal));
        assert!(ReviewPolicy::Always.applies_to(&internal));
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("forks-only".parse::<ReviewPolicy>(), Ok(ReviewPolicy::ForksOnly));
        assert_eq!("ALWAYS".parse::<ReviewPolicy>(), Ok(ReviewPolicy::Always));
        assert!("sometimes".parse::<ReviewPolicy>().is_err());
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(matches!(
            CommandReviewTrigger::from_command_line("   ", Duration::from_secs(1)),
            Err(ReviewError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn test_command_success() {
        let trigger =
            CommandReviewTrigger::from_command_line("true", Duration::from_secs(10)).unwrap();
        trigger.trigger(&pull_request("pull/42")).await.unwrap();
    }

    #[tokio::test]
    async fn test_command_failure_reports_exit_code() {
        let err = sh("exit 3").trigger(&pull_request("pull/42")).await.unwrap_err();
        assert!(matches!(err, ReviewError::Exit { code: 3 }));
    }

    #[tokio::test]
    async fn test_command_receives_pull_request_env() {
        let trigger = sh(
            r#"test "$PRGATE_PR_NUMBER" = 42 \
                && test "$PRGATE_HEAD_SHA" = abc1234 \
                && test "$PRGATE_REPOSITORY" = octo/repo \
                && test "$PRGATE_FROM_FORK" = true"#,
        );
        trigger.trigger(&pull_request("pull/42")).await.unwrap();
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let trigger = CommandReviewTrigger::new(
            "sleep",
            vec!["5".to_string()],
            Duration::from_millis(100),
        );
        let err = trigger.trigger(&pull_request("pull/42")).await.unwrap_err();
        assert!(matches!(err, ReviewError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let trigger = CommandReviewTrigger::new(
            "/nonexistent/review-bot",
            Vec::new(),
            Duration::from_secs(1),
        );
        let err = trigger.trigger(&pull_request("pull/42")).await.unwrap_err();
        assert!(matches!(err, ReviewError::Spawn(_)));
    }
}
