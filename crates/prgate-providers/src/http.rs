//! Shared HTTP plumbing: URL building and response classification.

use std::time::Duration;

use prgate_core::{ProviderError, ProviderResult};
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;

const USER_AGENT: &str = concat!("prgate/", env!("CARGO_PKG_VERSION"));

/// Build the shared reqwest client.
pub(crate) fn build_client(provider: &'static str, timeout: Duration) -> ProviderResult<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|e| {
            ProviderError::malformed(provider, format!("failed to build HTTP client: {e}"))
        })
}

/// `base` followed by `segments`, each percent-encoded.
///
/// A segment containing `/` is split, so file paths can be passed whole.
pub(crate) fn endpoint(
    provider: &'static str,
    base: &Url,
    segments: &[&str],
) -> ProviderResult<Url> {
    let mut url = base.clone();
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| ProviderError::malformed(provider, format!("invalid base URL {base}")))?;
        path.pop_if_empty();
        for segment in segments {
            path.extend(segment.split('/').filter(|s| !s.is_empty()));
        }
    }
    Ok(url)
}

pub(crate) fn parse_base_url(provider: &'static str, raw: &str) -> ProviderResult<Url> {
    Url::parse(raw)
        .map_err(|e| ProviderError::malformed(provider, format!("invalid base URL {raw}: {e}")))
}

/// What a 403 without rate limiting means for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Forbidden {
    /// The token is not allowed to do what the run needs.
    Fatal,
    /// The token lacks a permission on this one resource.
    Scoped,
}

/// Send a request and map transport failures and error statuses.
pub(crate) async fn send(
    provider: &'static str,
    request: RequestBuilder,
) -> ProviderResult<Response> {
    dispatch(provider, request, Forbidden::Fatal).await
}

/// Like [`send`], but a 403 is [`Forbidden::Scoped`].
pub(crate) async fn send_scoped(
    provider: &'static str,
    request: RequestBuilder,
) -> ProviderResult<Response> {
    dispatch(provider, request, Forbidden::Scoped).await
}

async fn dispatch(
    provider: &'static str,
    request: RequestBuilder,
    forbidden: Forbidden,
) -> ProviderResult<Response> {
    let response = request
        .send()
        .await
        .map_err(|e| transport_error(provider, e))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let rate_limited = is_rate_limited(response.headers());
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(status_error(provider, status, rate_limited, forbidden, body))
}

/// Like [`send`], but a 404 becomes `Ok(None)`.
pub(crate) async fn send_optional(
    provider: &'static str,
    request: RequestBuilder,
) -> ProviderResult<Option<Response>> {
    match send(provider, request).await {
        Ok(response) => Ok(Some(response)),
        Err(ProviderError::Rejected { status: 404, .. }) => Ok(None),
        Err(err) => Err(err),
    }
}

pub(crate) async fn json<T: DeserializeOwned>(
    provider: &'static str,
    response: Response,
) -> ProviderResult<T> {
    response.json().await.map_err(|e| {
        ProviderError::malformed(provider, format!("failed to parse JSON response: {e}"))
    })
}

fn is_rate_limited(headers: &HeaderMap) -> bool {
    let remaining_zero = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "0");
    remaining_zero || headers.contains_key(reqwest::header::RETRY_AFTER)
}

/// Map a non-success status to the provider error taxonomy.
pub(crate) fn status_error(
    provider: &'static str,
    status: StatusCode,
    rate_limited: bool,
    forbidden: Forbidden,
    body: String,
) -> ProviderError {
    match status {
        StatusCode::UNAUTHORIZED => ProviderError::fatal_auth(provider, body),
        StatusCode::FORBIDDEN if rate_limited => {
            ProviderError::transient(provider, format!("rate limited: {body}"))
        }
        StatusCode::FORBIDDEN if forbidden == Forbidden::Fatal => {
            ProviderError::fatal_auth(provider, body)
        }
        StatusCode::TOO_MANY_REQUESTS => {
            ProviderError::transient(provider, format!("rate limited: {body}"))
        }
        s if s.is_server_error() => ProviderError::transient(provider, format!("{s}: {body}")),
        s => ProviderError::rejected(provider, s.as_u16(), body),
    }
}

fn transport_error(provider: &'static str, err: reqwest::Error) -> ProviderError {
    if err.is_decode() {
        ProviderError::malformed(provider, err.to_string())
    } else if err.is_builder() {
        ProviderError::rejected(provider, 0, err.to_string())
    } else {
        // connect, timeout, interrupted body
        ProviderError::transient(provider, err.to_string())
    }
}
