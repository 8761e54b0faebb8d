//! Check results and the aggregated run verdict.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of a single check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckOutcome {
    Pass,
    Fail,
    /// The check could not be evaluated. Counts as a failure in the verdict.
    Error,
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckOutcome::Pass => write!(f, "pass"),
            CheckOutcome::Fail => write!(f, "fail"),
            CheckOutcome::Error => write!(f, "error"),
        }
    }
}

/// Result of one check against one commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckResult {
    /// Check name from the configuration.
    pub name: String,

    pub outcome: CheckOutcome,

    /// Human-readable explanation.
    pub message: String,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcome: CheckOutcome::Pass,
            message: message.into(),
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcome: CheckOutcome::Fail,
            message: message.into(),
        }
    }

    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcome: CheckOutcome::Error,
            message: message.into(),
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome == CheckOutcome::Pass
    }
}

/// Aggregated verdict for one commit: passes iff every check passed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunVerdict {
    pub passed: bool,

    /// Results in configuration order.
    pub results: Vec<CheckResult>,
}

impl RunVerdict {
    pub fn from_results(results: Vec<CheckResult>) -> Self {
        let passed = results.iter().all(CheckResult::passed);
        Self { passed, results }
    }

    pub fn passed_count(&self) -> usize {
        self.results.iter().filter(|r| r.passed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == CheckOutcome::Fail)
            .count()
    }

    pub fn errored_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == CheckOutcome::Error)
            .count()
    }

    /// Names of the checks that did not pass.
    pub fn failing_checks(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| !r.passed())
            .map(|r| r.name.clone())
            .collect()
    }
}
