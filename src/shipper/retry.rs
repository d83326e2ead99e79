//! # Retry client
//!
//! Used by the telemetry shipper and other worker-to-control-plane calls.
//! Backoff sleeps race against both the client's long-lived cancellation
//! and the individual request's own, so a short request deadline aborts a
//! long backoff promptly instead of waiting it out (spec.md §4.10, §9).

use reqwest::{Client, Method, Response};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_response_bytes: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            max_response_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug)]
pub enum RetryError {
    Cancelled,
    Transport(String),
    /// A non-retryable response (2xx or 4xx) came back; not an error by
    /// itself — carries the body truncated to the cap.
    Response { status: u16, body: Vec<u8> },
}

/// `true` for status codes the retry client will retry: 5xx and transport
/// errors. 2xx/4xx are returned to the caller as-is.
fn is_retryable_status(status: u16) -> bool {
    (500..600).contains(&status)
}

/// POST `body` to `url`, retrying on 5xx/transport errors up to
/// `config.max_retries` additional attempts with doubling backoff capped at
/// `config.max_backoff`. `client_token` is the shipper's long-lived
/// cancellation; `request_token` is this call's own (may be the same token).
pub async fn post_with_retry(
    http: &Client,
    url: &str,
    body: Vec<u8>,
    config: &RetryConfig,
    client_token: &CancellationToken,
    request_token: &CancellationToken,
) -> Result<(u16, Vec<u8>), RetryError> {
    let mut backoff = config.initial_backoff;
    let mut attempt = 0u32;

    loop {
        if client_token.is_cancelled() || request_token.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let result = http
            .request(Method::POST, url)
            .header("Content-Type", "application/json")
            .body(body.clone())
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                let capped = read_capped(response, config.max_response_bytes).await;
                if is_retryable_status(status) && attempt < config.max_retries {
                    attempt += 1;
                    if !sleep_cancellable(backoff, client_token, request_token).await {
                        return Err(RetryError::Cancelled);
                    }
                    backoff = (backoff * 2).min(config.max_backoff);
                    continue;
                }
                return Ok((status, capped));
            }
            Err(err) => {
                if attempt < config.max_retries {
                    attempt += 1;
                    if !sleep_cancellable(backoff, client_token, request_token).await {
                        return Err(RetryError::Cancelled);
                    }
                    backoff = (backoff * 2).min(config.max_backoff);
                    continue;
                }
                return Err(RetryError::Transport(err.to_string()));
            }
        }
    }
}

async fn read_capped(response: Response, cap: usize) -> Vec<u8> {
    match response.bytes().await {
        Ok(bytes) => {
            if bytes.len() > cap {
                tracing::warn!(total = bytes.len(), cap, "response body truncated");
                bytes[..cap].to_vec()
            } else {
                bytes.to_vec()
            }
        }
        Err(_) => Vec::new(),
    }
}

/// Returns `false` if either token cancelled before the sleep elapsed.
async fn sleep_cancellable(
    duration: Duration,
    client_token: &CancellationToken,
    request_token: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = client_token.cancelled() => false,
        _ = request_token.cancelled() => false,
    }
}
