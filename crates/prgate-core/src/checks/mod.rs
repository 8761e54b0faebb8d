//! Integrity checks: configuration, execution and results.

pub mod definition;
pub mod result;
pub mod runner;

pub use definition::{
    Check, CheckConfig, CheckDefinition, CheckKind, CheckSet, CompiledCheck, ConfigFingerprint,
    DocumentFormat,
};
pub use result::{CheckOutcome, CheckResult, RunVerdict};
pub use runner::{evaluate_commit, run_checks, RepoSnapshot};
