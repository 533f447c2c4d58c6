//! HTTP retry helpers for transient errors.
//!
//! Every catalog call goes through [`send_json`] or [`send_bytes`] instead of
//! calling `reqwest::RequestBuilder::send()` directly, so each request gets
//! bounded retry with exponential backoff for transient failures (timeouts,
//! connection resets, server errors, rate limiting).
//!
//! # Usage
//!
//! ```ignore
//! use crate::retry;
//!
//! // GET with query params → JSON
//! let body = retry::send_json(|| client.get(&url).query(&params), &policy).await?;
//!
//! // GET → raw bytes (CSV downloads)
//! let bytes = retry::send_bytes(|| client.get(&url), &policy).await?;
//! ```
//!
//! HTTP 4xx (other than 429) and bodies that are not valid JSON are
//! permanent and surface immediately.

use std::time::Duration;

use serde::Deserialize;

/// Default number of retry attempts after the first request.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry. Doubles on each further retry
/// (2s, 4s, 8s).
pub const DEFAULT_BASE_DELAY_MS: u64 = 2_000;

/// Maximum length of the response body preview included in error logs.
const BODY_PREVIEW_LEN: usize = 500;

/// Errors raised by the transport layer, before they are classified into a
/// [`crate::SourceError`] by the caller.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The request could not be sent or the body could not be read.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Status {
        /// Response status.
        status: reqwest::StatusCode,
        /// Request URL.
        url: String,
    },

    /// The response body was not valid JSON.
    #[error("invalid JSON from {url}: {source}")]
    Json {
        /// Request URL.
        url: String,
        /// Parse failure.
        #[source]
        source: serde_json::Error,
    },
}

/// How many times, and how patiently, transient failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `0` disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// Sends an HTTP request and parses the response body as JSON.
///
/// The `build_request` closure is called on each attempt to construct a
/// fresh [`reqwest::RequestBuilder`] (since builders are consumed by
/// `.send()`).
///
/// # Errors
///
/// Returns [`TransportError`] if the request fails after all retries, the
/// server returns a non-retryable status code, or the body is not JSON.
#[allow(clippy::future_not_send)]
pub async fn send_json<F>(
    build_request: F,
    policy: &RetryPolicy,
) -> Result<serde_json::Value, TransportError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let (url, bytes) = fetch_body(&build_request, policy).await?;

    serde_json::from_slice(&bytes).map_err(|source| {
        let text = String::from_utf8_lossy(&bytes);
        let preview: String = text.chars().take(BODY_PREVIEW_LEN).collect();
        log::error!(
            "JSON parse failed, not retrying.\n  \
             url: {url}\n  \
             received: {} bytes\n  \
             parse error: {source}\n  \
             body preview: {preview}",
            bytes.len(),
        );
        TransportError::Json { url, source }
    })
}

/// Sends an HTTP request and returns the full response body.
///
/// A body that fails mid-read (connection reset while streaming) counts as
/// a transient failure and re-issues the whole request.
///
/// # Errors
///
/// Returns [`TransportError`] if the request fails after all retries or the
/// server returns a non-retryable status code.
#[allow(clippy::future_not_send)]
pub async fn send_bytes<F>(build_request: F, policy: &RetryPolicy) -> Result<Vec<u8>, TransportError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let (_, bytes) = fetch_body(&build_request, policy).await?;
    Ok(bytes)
}

/// Sends the request and reads the whole body, returning the final URL
/// alongside it.
#[allow(clippy::future_not_send)]
async fn fetch_body<F>(
    build_request: &F,
    policy: &RetryPolicy,
) -> Result<(String, Vec<u8>), TransportError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut body_attempt = 0;

    loop {
        let response = send_inner(build_request, policy).await?;
        let url = response.url().to_string();
        let status = response.status();

        match response.bytes().await {
            Ok(bytes) => {
                log::debug!("Received {} bytes from {url}", bytes.len());
                return Ok((url, bytes.to_vec()));
            }
            Err(e) if body_attempt < policy.max_retries => {
                body_attempt += 1;
                let delay = policy.delay_for(body_attempt);
                log::warn!(
                    "Response body read failed (body retry {body_attempt}/{}), \
                     re-fetching in {delay:?}...\n  \
                     url: {url}\n  \
                     status: {status}\n  \
                     error: {e}",
                    policy.max_retries,
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                log::error!(
                    "Response body read failed after {} retries, giving up.\n  \
                     url: {url}\n  \
                     status: {status}\n  \
                     error: {e}",
                    policy.max_retries,
                );
                return Err(TransportError::Http(e));
            }
        }
    }
}

/// Core retry loop shared by [`send_json`] and [`send_bytes`].
///
/// Sends the request built by `build_request`, retrying on transient
/// errors up to `policy.max_retries` times with exponential backoff.
/// Returns the successful [`reqwest::Response`] (status 2xx or 3xx).
#[allow(clippy::future_not_send)]
async fn send_inner<F>(
    build_request: &F,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, TransportError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let max_retries = policy.max_retries;
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            let delay = policy.delay_for(attempt);
            log::warn!("  retry {attempt}/{max_retries} in {delay:?}...");
            tokio::time::sleep(delay).await;
        }

        match build_request().send().await {
            Err(e) => {
                if is_transient(&e) && attempt < max_retries {
                    log::warn!("  transient error: {e}");
                    attempt += 1;
                    continue;
                }
                return Err(TransportError::Http(e));
            }
            Ok(response) => {
                let status = response.status();

                if is_retryable_status(status) {
                    if attempt < max_retries {
                        log::warn!("  HTTP {status} from {}", response.url());
                        attempt += 1;
                        continue;
                    }
                    log::error!("HTTP {status} after {max_retries} retries, giving up");
                    return Err(TransportError::Status {
                        status,
                        url: response.url().to_string(),
                    });
                }

                // Remaining 4xx are permanent.
                if status.is_client_error() {
                    return Err(TransportError::Status {
                        status,
                        url: response.url().to_string(),
                    });
                }

                return Ok(response);
            }
        }
    }
}

/// 429 and 5xx are worth another attempt.
fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Returns `true` if the error is likely transient and worth retrying.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_body() || e.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub_server::{StubResponse, StubServer};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: 1,
        }
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay_ms: 2_000,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let server = StubServer::sequence(vec![
            StubResponse::status(503, "busy"),
            StubResponse::status(502, "bad gateway"),
            StubResponse::json(r#"{"ok": true}"#),
        ])
        .await;
        let client = reqwest::Client::new();
        let url = server.url("/anything");

        let body = send_json(|| client.get(&url), &fast_policy(3))
            .await
            .unwrap();

        assert_eq!(body["ok"], true);
        assert_eq!(server.hits().len(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let server = StubServer::sequence(vec![StubResponse::status(500, "boom"); 5]).await;
        let client = reqwest::Client::new();
        let url = server.url("/anything");

        let err = send_bytes(|| client.get(&url), &fast_policy(2))
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Status { status, .. } if status.as_u16() == 500));
        assert_eq!(server.hits().len(), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = StubServer::sequence(vec![
            StubResponse::status(404, "missing"),
            StubResponse::json("{}"),
        ])
        .await;
        let client = reqwest::Client::new();
        let url = server.url("/missing");

        let err = send_json(|| client.get(&url), &fast_policy(3))
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Status { status, .. } if status.as_u16() == 404));
        assert_eq!(server.hits().len(), 1);
    }

    #[tokio::test]
    async fn malformed_json_is_not_retried() {
        let server = StubServer::sequence(vec![
            StubResponse::json("{not json"),
            StubResponse::json("{}"),
        ])
        .await;
        let client = reqwest::Client::new();
        let url = server.url("/garbled");

        let err = send_json(|| client.get(&url), &fast_policy(3))
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Json { .. }));
        assert_eq!(server.hits().len(), 1);
    }
}
