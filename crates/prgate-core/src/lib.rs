//! prgate core: the pull request integrity scheduler.
//!
//! A stateless batch job that reconciles recent CI pipeline executions with
//! commit statuses on the code host.
//!
//! ## Key Components
//!
//! - `provider`: `CiProvider` / `CodeHost` / `ReviewTrigger` traits and paging
//! - `classifier`: which executions are pull request builds
//! - `dedup`: skip commits already reported for the current configuration
//! - `checks`: integrity check configuration, execution and verdicts
//! - `reporter` / `review`: commit status, summary comment, review bot
//! - `orchestrator`: one reconciliation pass and its summary

pub mod checks;
pub mod classifier;
pub mod dedup;
mod error;
pub mod fakes;
pub mod model;
pub mod orchestrator;
pub mod provider;
pub mod reporter;
pub mod retry;
pub mod review;
pub mod telemetry;

pub use checks::{
    CheckConfig, CheckDefinition, CheckKind, CheckOutcome, CheckResult, CheckSet,
    ConfigFingerprint, RunVerdict,
};
pub use classifier::{ClassifierConfig, PipelineClassifier, SkipReason};
pub use dedup::{DedupDecision, DedupTracker, ProcessReason, Watermark};
pub use error::{CheckError, ConfigError, ProviderError, ProviderResult, ReviewError};
pub use model::{
    CommitStatus, PipelineExecution, PullRequestContext, RepositorySlug, StatusState,
    TriggerSource,
};
pub use orchestrator::{
    PrOutcome, PrReport, RepositoryReport, ReviewRecord, RunState, RunSummary, Scheduler,
    SchedulerConfig, UpperBound,
};
pub use provider::{
    execution_stream, list_recent_executions, CiProvider, CodeHost, ExecutionFilter,
    ExecutionPage, ExecutionQuery, ReviewTrigger,
};
pub use reporter::{ReportConfig, Reporter};
pub use retry::RetryPolicy;
pub use review::{CommandReviewTrigger, ReviewPolicy};
