//! prgate - pull request integrity gate
//!
//! Reconciles recent CircleCI pipelines with GitHub commit statuses: every
//! new pull request head is checked against the configured integrity checks
//! and gets a commit status describing the verdict.
//!
//! ## Commands
//!
//! - `run`: one reconciliation pass over the configured repositories
//! - `fingerprint`: validate the check configuration and print its fingerprint
//! - `check`: evaluate one commit and print the verdict without publishing
//!
//! Settings come from flags, the environment, or a `.env` file.
//!
//! ## Exit codes
//!
//! `0` nothing failed, `1` a pull request failed a check, `2` scheduler or
//! configuration error.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::BoolishValueParser;
use clap::{Args, Parser, Subcommand};
use prgate_core::checks::RepoSnapshot;
use prgate_core::reporter::render_status;
use prgate_core::{
    telemetry, CheckConfig, CheckOutcome, CheckSet, ClassifierConfig, CommandReviewTrigger,
    ExecutionFilter, PrOutcome, ReportConfig, RepositorySlug, RetryPolicy, ReviewPolicy,
    RunSummary, RunVerdict, Scheduler, SchedulerConfig, UpperBound,
};
use prgate_providers::{CircleCiClient, CircleCiConfig, GitHubClient, GitHubConfig};
use tracing::{error, info, Level};

#[derive(Parser, Debug)]
#[command(name = "prgate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Pull request integrity checks reported as commit statuses", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Check configuration file (.json or .toml)
    #[arg(
        long = "config",
        global = true,
        env = "SCHEDULER_CONFIG_FILE",
        default_value = "config.json"
    )]
    config_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one reconciliation pass
    Run(RunArgs),

    /// Validate the check configuration and print its fingerprint
    Fingerprint,

    /// Evaluate the checks against one commit without publishing
    Check(CheckArgs),
}

/// Code host settings shared by `run` and `check`.
#[derive(Args, Debug)]
struct HostArgs {
    /// Repositories to reconcile, as owner/name (comma-separated)
    #[arg(long, env = "REPOSITORY", value_delimiter = ',', required = true)]
    repository: Vec<RepositorySlug>,

    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: String,

    #[arg(long, env = "GITHUB_API_URL", default_value = GitHubConfig::DEFAULT_API_URL)]
    github_api_url: String,

    /// Account the token belongs to; only its comments are edited
    #[arg(long, env = "GITHUB_USERNAME")]
    github_username: Option<String>,

    /// Branch pull requests must target
    #[arg(long, env = "REFERENCE_BRANCH", default_value = "master")]
    reference_branch: String,

    /// Commit status context owned by prgate
    #[arg(long, env = "PRGATE_STATUS_CONTEXT", default_value = "prgate/integrity")]
    status_context: String,
}

impl HostArgs {
    fn github(&self) -> Result<GitHubClient> {
        let mut config = GitHubConfig::new(&self.github_token).with_api_url(&self.github_api_url);
        if let Some(username) = self.github_username.as_deref().filter(|u| !u.trim().is_empty()) {
            config = config.with_username(username.trim());
        }
        GitHubClient::new(config).context("Failed to create GitHub client")
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    host: HostArgs,

    #[arg(long, env = "CIRCLECI_API_TOKEN", hide_env_values = true)]
    circleci_token: String,

    #[arg(long, env = "CIRCLECI_API_URL", default_value = CircleCiConfig::DEFAULT_API_URL)]
    circleci_api_url: String,

    /// CI workflow running this scheduler; its pipeline is the upper bound
    #[arg(long, env = "CIRCLE_WORKFLOW_ID")]
    workflow_id: Option<String>,

    /// Explicit upper bound pipeline id (wins over --workflow-id)
    #[arg(long, env = "PRGATE_UPPER_BOUND")]
    upper_bound: Option<String>,

    /// Workflows that are never pull request builds (comma-separated)
    #[arg(
        long,
        env = "SCHEDULER_WORKFLOW",
        value_delimiter = ',',
        default_value = "scheduler"
    )]
    ignored_workflow: Vec<String>,

    /// Branch the scheduler itself runs on; its last green run is the lower bound
    #[arg(long, env = "SCHEDULER_BRANCH", default_value = "master")]
    scheduler_branch: String,

    /// List every recent pipeline instead of stopping at the last scheduler run
    #[arg(long)]
    full_scan: bool,

    /// Wall-clock budget for the whole run
    #[arg(long, env = "PRGATE_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// Ignore pipelines older than this many hours
    #[arg(long, env = "PRGATE_LOOKBACK_HOURS")]
    lookback_hours: Option<u64>,

    /// Maximum pipeline pages fetched per repository
    #[arg(long, env = "PRGATE_MAX_PAGES", default_value_t = 20)]
    max_pages: usize,

    /// Command run for pull requests that pass (the review bot)
    #[arg(long, env = "PRGATE_REVIEW_COMMAND")]
    review_command: Option<String>,

    /// Which passing pull requests get the review command
    #[arg(long, env = "PRGATE_REVIEW_POLICY", default_value = "forks_only")]
    review_policy: ReviewPolicy,

    #[arg(long, env = "PRGATE_REVIEW_TIMEOUT_SECS", default_value_t = 600)]
    review_timeout_secs: u64,

    /// Also upsert a summary comment on each checked pull request
    #[arg(
        long,
        env = "PRGATE_SUMMARY_COMMENT",
        value_parser = BoolishValueParser::new()
    )]
    summary_comment: bool,

    /// Link attached to published statuses
    #[arg(long, env = "CIRCLE_BUILD_URL")]
    target_url: Option<String>,

    /// Write the run summary as JSON to this path
    #[arg(long)]
    report: Option<PathBuf>,
}

impl RunArgs {
    fn upper_bound(&self) -> UpperBound {
        let non_empty = |value: &Option<String>| value.clone().filter(|v| !v.trim().is_empty());
        match (non_empty(&self.upper_bound), non_empty(&self.workflow_id)) {
            (Some(id), _) => UpperBound::Execution(id),
            (None, Some(workflow)) => UpperBound::Workflow(workflow),
            (None, None) => UpperBound::Unbounded,
        }
    }

    /// Last successful run of the scheduler workflow on its own branch.
    fn cursor(&self) -> Option<ExecutionFilter> {
        if self.full_scan {
            return None;
        }
        let workflow = self.ignored_workflow.first()?;
        Some(ExecutionFilter {
            containing_workflows: vec![workflow.clone()],
            successful_only: true,
            ..ExecutionFilter::on_branch(&self.scheduler_branch)
        })
    }

    fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            repositories: self.host.repository.clone(),
            classifier: ClassifierConfig {
                target_branch: self.host.reference_branch.clone(),
                ignored_workflows: self.ignored_workflow.clone(),
            },
            report: ReportConfig {
                status_context: self.host.status_context.clone(),
                target_url: self.target_url.clone(),
                summary_comment: self.summary_comment,
                review_policy: self.review_policy,
            },
            retry: RetryPolicy::default(),
            upper_bound: self.upper_bound(),
            cursor: self.cursor(),
            lookback_hours: self.lookback_hours,
            max_pages: self.max_pages,
            timeout: self.timeout_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Commit to evaluate
    sha: String,

    /// Pull request the commit belongs to (for display only)
    #[arg(long)]
    pull_request: Option<u64>,

    /// CircleCI pipeline built from the commit, for configuration checks
    #[arg(long, requires = "circleci_token")]
    pipeline: Option<String>,

    #[arg(long, env = "CIRCLECI_API_TOKEN", hide_env_values = true)]
    circleci_token: Option<String>,

    #[arg(long, env = "CIRCLECI_API_URL", default_value = CircleCiConfig::DEFAULT_API_URL)]
    circleci_api_url: String,

    #[command(flatten)]
    host: HostArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    // .env must be loaded before clap reads env fallbacks
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    telemetry::init_tracing(cli.json, level);

    match execute(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "prgate failed");
            ExitCode::from(2)
        }
    }
}

async fn execute(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli.config_file)?;
    let checks = config
        .compile()
        .with_context(|| format!("Invalid check configuration {}", cli.config_file.display()))?;

    match cli.command {
        Commands::Run(args) => cmd_run(checks, &args).await,
        Commands::Fingerprint => {
            cmd_fingerprint(&config, &checks);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check(args) => cmd_check(&checks, &args).await,
    }
}

fn load_config(path: &Path) -> Result<CheckConfig> {
    CheckConfig::load(path)
        .with_context(|| format!("Failed to load check configuration {}", path.display()))
}

async fn cmd_run(checks: CheckSet, args: &RunArgs) -> Result<ExitCode> {
    let config = args.scheduler_config();
    let ci = CircleCiClient::new(
        CircleCiConfig::new(&args.circleci_token).with_api_url(&args.circleci_api_url),
    )
    .context("Failed to create CircleCI client")?;
    let host = args.host.github()?;

    let mut scheduler = Scheduler::new(Arc::new(ci), Arc::new(host), Arc::new(checks), config);
    if let Some(command) = args.review_command.as_deref().filter(|c| !c.trim().is_empty()) {
        let trigger = CommandReviewTrigger::from_command_line(
            command,
            Duration::from_secs(args.review_timeout_secs),
        )
        .context("Invalid review command")?;
        scheduler = scheduler.with_review_trigger(Arc::new(trigger));
    }

    let summary = scheduler.run().await;

    if let Some(path) = &args.report {
        write_report(path, &summary)?;
        info!(path = %path.display(), "Wrote run report");
    }
    print_summary(&summary);

    Ok(ExitCode::from(summary.exit_code()))
}

fn write_report(path: &Path, summary: &RunSummary) -> Result<()> {
    let json = serde_json::to_string_pretty(summary).context("Failed to serialize run report")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write run report {}", path.display()))
}

fn print_summary(summary: &RunSummary) {
    println!("Run {} (config {})", summary.run_id, summary.fingerprint);
    for report in &summary.repositories {
        println!(
            "  {}: {:?}, {} pipelines, {} skipped, {} pull requests",
            report.repository,
            report.state,
            report.executions,
            report.skipped,
            report.pull_requests.len()
        );
        if let Some(err) = &report.error {
            println!("    error: {err}");
        }
        for pr in &report.pull_requests {
            println!(
                "    #{} {} {:?}{}",
                pr.number,
                pr.head_sha,
                pr.outcome,
                pr.error
                    .as_deref()
                    .map(|e| format!(" ({e})"))
                    .unwrap_or_default()
            );
        }
    }
    println!(
        "Summary: {} passed, {} failed, {} already reported",
        summary.count(PrOutcome::Passed),
        summary.count(PrOutcome::Failed),
        summary.count(PrOutcome::AlreadyReported)
    );
}

fn cmd_fingerprint(config: &CheckConfig, checks: &CheckSet) {
    println!("Fingerprint: {}", checks.fingerprint());
    println!("Version: {}", config.version);
    println!("Checks ({}):", checks.len());
    for definition in &config.checks {
        println!("  - {} ({})", definition.name, definition.kind.as_str());
    }
}

async fn cmd_check(checks: &CheckSet, args: &CheckArgs) -> Result<ExitCode> {
    let repository = args
        .host
        .repository
        .first()
        .context("No repository configured")?;
    let host = args.host.github()?;
    let ci = match &args.circleci_token {
        Some(token) => Some(
            CircleCiClient::new(CircleCiConfig::new(token).with_api_url(&args.circleci_api_url))
                .context("Failed to create CircleCI client")?,
        ),
        None => None,
    };
    let retry = RetryPolicy::default();

    let mut snapshot = RepoSnapshot::new(&host, repository, args.sha.as_str(), &retry);
    if let (Some(ci), Some(pipeline)) = (&ci, &args.pipeline) {
        snapshot = snapshot.with_pipeline(ci, pipeline.as_str());
    }
    let verdict = prgate_core::checks::evaluate_commit(checks, &mut snapshot)
        .await
        .with_context(|| format!("Failed to evaluate {}@{}", repository, args.sha))?;

    match args.pull_request {
        Some(number) => println!("{repository}#{number} @ {}", args.sha),
        None => println!("{repository} @ {}", args.sha),
    }
    print_verdict(&verdict);

    let report = ReportConfig {
        status_context: args.host.status_context.clone(),
        ..ReportConfig::default()
    };
    let status = render_status(&report, &verdict, checks.fingerprint());
    println!(
        "Status: {} \"{}\"",
        status.state,
        status.description.unwrap_or_default()
    );

    Ok(if verdict.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn print_verdict(verdict: &RunVerdict) {
    for result in &verdict.results {
        let mark = match result.outcome {
            CheckOutcome::Pass => "✓",
            CheckOutcome::Fail => "✗",
            CheckOutcome::Error => "!",
        };
        println!("  {mark} {}: {}", result.name, result.message);
    }
    println!(
        "Summary: {}/{} checks passed",
        verdict.passed_count(),
        verdict.results.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [&str; 5] = [
        "--repository",
        "octo/repo,octo/other",
        "--github-token",
        "gh",
        "--circleci-token",
    ];

    fn run_args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["prgate", "run"];
        argv.extend_from_slice(&REQUIRED);
        argv.push("cci");
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Run(args) => args,
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn test_run_parses_repository_list() {
        let args = run_args(&[]);
        assert_eq!(
            args.host.repository,
            vec![RepositorySlug::new("octo", "repo"), RepositorySlug::new("octo", "other")]
        );
    }

    #[test]
    fn test_rejects_malformed_repository() {
        let result = Cli::try_parse_from([
            "prgate",
            "run",
            "--repository",
            "not-a-slug",
            "--github-token",
            "gh",
            "--circleci-token",
            "cci",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_explicit_upper_bound_wins_over_workflow() {
        let args = run_args(&["--workflow-id", "wf-1", "--upper-bound", "pipe-7"]);
        assert_eq!(args.upper_bound(), UpperBound::Execution("pipe-7".to_string()));

        let args = run_args(&["--workflow-id", "wf-1"]);
        assert_eq!(args.upper_bound(), UpperBound::Workflow("wf-1".to_string()));

        let args = run_args(&["--workflow-id", " "]);
        assert_eq!(args.upper_bound(), UpperBound::Unbounded);
    }

    #[test]
    fn test_scheduler_config_from_args() {
        let args = run_args(&[
            "--reference-branch",
            "main",
            "--ignored-workflow",
            "scheduler,nightly",
            "--timeout-secs",
            "300",
            "--lookback-hours",
            "48",
            "--review-policy",
            "always",
            "--summary-comment",
            "--target-url",
            "https://ci.example/job/1",
        ]);
        let config = args.scheduler_config();

        assert_eq!(config.classifier.target_branch, "main");
        assert_eq!(config.classifier.ignored_workflows, vec!["scheduler", "nightly"]);
        assert_eq!(config.timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.lookback_hours, Some(48));
        assert_eq!(config.max_pages, 20);
        assert_eq!(config.report.review_policy, ReviewPolicy::Always);
        assert!(config.report.summary_comment);
        assert_eq!(config.report.target_url.as_deref(), Some("https://ci.example/job/1"));
        assert_eq!(config.report.status_context, "prgate/integrity");

        let cursor = config.cursor.unwrap();
        assert_eq!(cursor.branch, "master");
        assert_eq!(cursor.containing_workflows, vec!["scheduler"]);
        assert!(cursor.successful_only);
    }

    #[test]
    fn test_full_scan_drops_cursor() {
        let args = run_args(&["--scheduler-branch", "main"]);
        assert_eq!(args.cursor().unwrap().branch, "main");

        let args = run_args(&["--full-scan"]);
        assert_eq!(args.scheduler_config().cursor, None);
    }

    #[test]
    fn test_github_username_parses() {
        let args = run_args(&["--github-username", "prgate-bot"]);
        assert_eq!(args.host.github_username.as_deref(), Some("prgate-bot"));
        assert!(args.host.github().is_ok());
    }

    #[test]
    fn test_check_command_parses() {
        let cli = Cli::try_parse_from([
            "prgate",
            "--config",
            "checks.toml",
            "check",
            "abc1234",
            "--pull-request",
            "42",
            "--repository",
            "octo/repo",
            "--github-token",
            "gh",
        ])
        .unwrap();
        assert_eq!(cli.config_file, PathBuf::from("checks.toml"));
        match cli.command {
            Commands::Check(args) => {
                assert_eq!(args.sha, "abc1234");
                assert_eq!(args.pull_request, Some(42));
                assert_eq!(args.pipeline, None);
            }
            other => panic!("expected check, got {other:?}"),
        }
    }

    #[test]
    fn test_check_pipeline_requires_circleci_token() {
        let base = [
            "prgate",
            "check",
            "abc1234",
            "--pipeline",
            "pipe-9",
            "--repository",
            "octo/repo",
            "--github-token",
            "gh",
        ];
        if std::env::var_os("CIRCLECI_API_TOKEN").is_none() {
            assert!(Cli::try_parse_from(base).is_err());
        }

        let mut argv = base.to_vec();
        argv.extend_from_slice(&["--circleci-token", "cci"]);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Check(args) => assert_eq!(args.pipeline.as_deref(), Some("pipe-9")),
            other => panic!("expected check, got {other:?}"),
        }
    }

    #[test]
    fn test_report_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let summary = RunSummary {
            run_id: uuid::Uuid::new_v4(),
            started_at: chrono::Utc::now(),
            finished_at: chrono::Utc::now(),
            fingerprint: "0123456789ab".to_string(),
            repositories: Vec::new(),
        };

        write_report(&path, &summary).unwrap();
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["fingerprint"], "0123456789ab");
    }
}
