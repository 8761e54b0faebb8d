//! Error taxonomy for prgate.
//!
//! Errors are scoped to the unit that produced them: a provider call, a
//! single check, the review trigger, or configuration loading. Only
//! [`ProviderError::FatalAuth`] and [`ConfigError`] stop a run.

use std::path::PathBuf;

/// Errors returned by the CI and code-hosting provider adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Rate limit, 5xx or network failure. Retried with backoff.
    #[error("transient {provider} error: {message}")]
    Transient { provider: String, message: String },

    /// Credentials were rejected. Aborts the run.
    #[error("{provider} rejected the credentials: {message}")]
    FatalAuth { provider: String, message: String },

    /// Any other non-success response.
    #[error("{provider} rejected the request (status {status}): {message}")]
    Rejected {
        provider: String,
        status: u16,
        message: String,
    },

    /// Response body could not be decoded.
    #[error("malformed {provider} response: {message}")]
    Malformed { provider: String, message: String },
}

impl ProviderError {
    pub fn transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn fatal_auth(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FatalAuth {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn rejected(provider: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            provider: provider.into(),
            status,
            message: message.into(),
        }
    }

    pub fn malformed(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Malformed {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Whether the call may succeed if retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Whether the whole run must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalAuth { .. })
    }
}

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// A single check could not be evaluated.
///
/// Recorded as outcome `error` on the check result; never aborts the run
/// unless it wraps a fatal provider error.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("{path} is not valid UTF-8")]
    Content { path: String },

    #[error("{path} could not be parsed as {format}: {reason}")]
    Parse {
        path: String,
        format: &'static str,
        reason: String,
    },

    /// The data the check compares against could not be located.
    #[error("{0}")]
    Unavailable(String),
}

/// Errors raised while loading or compiling the check configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("unsupported configuration format: {0} (expected .json or .toml)")]
    UnsupportedFormat(String),

    #[error("duplicate check name: {0}")]
    DuplicateName(String),

    #[error("check '{check}' has invalid params: {reason}")]
    InvalidParams { check: String, reason: String },

    #[error("check '{check}' has an invalid pattern: {source}")]
    InvalidPattern {
        check: String,
        #[source]
        source: regex::Error,
    },

    #[error("check '{check}' has an invalid sha256 digest: {digest}")]
    InvalidDigest { check: String, digest: String },
}

/// Errors raised by the downstream review trigger.
#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("review command is empty")]
    EmptyCommand,

    #[error("failed to spawn review command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("review command exited with code {code}")]
    Exit { code: i32 },

    #[error("review command timed out after {secs} seconds")]
    Timeout { secs: u64 },
}
