//! HTTP adapters behind the prgate provider traits.
//!
//! - [`CircleCiClient`] implements `CiProvider` (pipelines, workflows, job PRs)
//! - [`GitHubClient`] implements `CodeHost` (statuses, contents, comments)
//!
//! Both map HTTP failures onto `ProviderError`: 401 and non-rate-limit 403
//! are fatal, 429/5xx/rate-limited 403 and network errors are transient,
//! everything else is rejected.

mod circleci;
mod github;
mod http;

pub use circleci::{CircleCiClient, CircleCiConfig};
pub use github::{GitHubClient, GitHubConfig};
