//! # Connection — one worker's transport session to the upstream service
//!
//! Holds session continuation state (session token, last-event-id), issues
//! MCP-style operations, and produces an [`OperationOutcome`] per call.
//! DNS/TCP/TLS sub-phase timestamps require a custom low-level connector;
//! this connection records what `reqwest`'s public API exposes (E2E,
//! TTFB, download) and leaves the sub-millisecond phases at zero when a
//! connection is reused, matching the "all zero... except TTFB and
//! Download" invariant in spec.md §3 — see DESIGN.md for the scope note.

use crate::ids::RunId;
use crate::transport::dialer::{redirect_allowed, safe_resolver, DialerConfig, RedirectPolicy};
use crate::transport::errors::{ErrorKind, OperationError};
use crate::transport::jsonrpc::{check_tool_result, validate_response, JsonRpcRequest, JsonRpcResponse};
use crate::transport::outcome::{OperationOutcome, PhaseTiming, StreamSignals};
use crate::transport::sse::{is_resumable_event_id, next_with_stall, spawn_reader};
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub request_timeout: Duration,
    pub stream_stall_timeout: Duration,
    pub redirect_policy: RedirectPolicy,
    pub redirect_allowlist: Vec<String>,
    pub max_response_bytes: u64,
    pub dialer: DialerConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            stream_stall_timeout: Duration::from_secs(15),
            redirect_policy: RedirectPolicy::Deny,
            redirect_allowlist: Vec::new(),
            max_response_bytes: 100 * 1024 * 1024,
            dialer: DialerConfig::default(),
        }
    }
}

pub struct Connection {
    http: Client,
    base_url: String,
    config: TransportConfig,
    session_token: Mutex<Option<String>>,
    last_event_id: Mutex<Option<String>>,
    request_counter: AtomicU64,
}

impl Connection {
    pub fn new(base_url: impl Into<String>, config: TransportConfig) -> Self {
        Self {
            http: Client::builder()
                .timeout(config.request_timeout)
                .redirect(reqwest::redirect::Policy::none())
                .dns_resolver(safe_resolver(config.dialer.clone()))
                .build()
                .expect("reqwest client builds with a static config"),
            base_url: base_url.into(),
            config,
            session_token: Mutex::new(None),
            last_event_id: Mutex::new(None),
            request_counter: AtomicU64::new(0),
        }
    }

    pub fn session_token(&self) -> Option<String> {
        self.session_token.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn last_event_id(&self) -> Option<String> {
        self.last_event_id.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn next_request_id(&self) -> String {
        let n = self.request_counter.fetch_add(1, Ordering::SeqCst);
        format!("req_{n}")
    }

    /// Execute one JSON-RPC call and build the resulting `OperationOutcome`.
    /// `include_last_event_id` opts the request into resuming a prior
    /// stream (spec.md §4.5: "included only when explicitly opted in").
    ///
    /// `reqwest`'s own redirect follower is disabled on this client (see
    /// [`Self::new`]) so that 3xx hops can be filtered through
    /// [`RedirectPolicy`] before they are taken — the loop below is this
    /// client's only redirect-following code path.
    pub async fn call(
        &self,
        run_id: RunId,
        stage_id: String,
        worker_id: crate::ids::WorkerId,
        operation: &str,
        tool_name: Option<&str>,
        params: Value,
        include_last_event_id: bool,
    ) -> OperationOutcome {
        let started = Instant::now();
        let request_id = self.next_request_id();
        let request = JsonRpcRequest::call(request_id.clone(), operation, params);

        let mut url = format!("{}/mcp", self.base_url);
        let mut hops = 0u8;
        let response = loop {
            let mut builder = self
                .http
                .post(&url)
                .header("Content-Type", "application/json")
                .header("Accept", "application/json, text/event-stream");
            if let Some(token) = self.session_token() {
                builder = builder.header("X-Session-Token", token);
            }
            if include_last_event_id {
                if let Some(id) = self.last_event_id() {
                    builder = builder.header("Last-Event-ID", id);
                }
            }

            let response = match builder.json(&request).send().await {
                Ok(resp) => resp,
                Err(err) => {
                    return self.error_outcome(
                        run_id,
                        stage_id,
                        worker_id,
                        operation,
                        tool_name,
                        started,
                        classify_reqwest_error(&err),
                    );
                }
            };

            if !response.status().is_redirection() {
                break response;
            }

            let Some(location) = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
            else {
                break response;
            };
            let Ok(from) = url::Url::parse(&url) else {
                break response;
            };
            let Ok(to) = from.join(&location) else {
                return self.error_outcome(
                    run_id,
                    stage_id,
                    worker_id,
                    operation,
                    tool_name,
                    started,
                    OperationError::new(ErrorKind::Http, "invalid_redirect", "redirect Location header was not a valid URL"),
                );
            };
            if hops >= crate::transport::dialer::MAX_REDIRECT_HOPS {
                return self.error_outcome(
                    run_id,
                    stage_id,
                    worker_id,
                    operation,
                    tool_name,
                    started,
                    OperationError::new(ErrorKind::Http, "too_many_redirects", format!("exceeded {} redirect hops", crate::transport::dialer::MAX_REDIRECT_HOPS)),
                );
            }
            if !self.would_allow_redirect(&from, &to) {
                return self.error_outcome(
                    run_id,
                    stage_id,
                    worker_id,
                    operation,
                    tool_name,
                    started,
                    OperationError::new(ErrorKind::Http, "redirect_denied", format!("redirect to {to} denied by redirect policy")),
                );
            }
            hops += 1;
            url = to.to_string();
        };

        if let Some(token) = response.headers().get("X-Session-Token") {
            if let Ok(token) = token.to_str() {
                *self.session_token.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.to_string());
            }
        }

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if let Some(error) = OperationError::from_http_status(status.as_u16()) {
            return self.error_outcome(run_id, stage_id, worker_id, operation, tool_name, started, error);
        }

        if content_type.starts_with("text/event-stream") {
            self.consume_sse(run_id, stage_id, worker_id, operation, tool_name, started, &request_id, response)
                .await
        } else {
            self.consume_json(run_id, stage_id, worker_id, operation, tool_name, started, &request_id, status, response)
                .await
        }
    }

    /// Send a JSON-RPC notification (no `id`, no response body expected —
    /// e.g. `initialized`). Per spec.md §4.5, 200/202/204 all count as
    /// success for notifications; any other status or a transport error
    /// produces a failing [`OperationOutcome`] the same way `call` does.
    /// There is no redirect-following here: a notification that gets
    /// redirected is treated as a server error rather than re-POSTed,
    /// since notifications carry no response to correlate after a hop.
    pub async fn notify(
        &self,
        run_id: RunId,
        stage_id: String,
        worker_id: crate::ids::WorkerId,
        operation: &str,
        params: Value,
    ) -> OperationOutcome {
        let started = Instant::now();
        let request = JsonRpcRequest::notification(operation, params);
        let url = format!("{}/mcp", self.base_url);

        let mut builder = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream");
        if let Some(token) = self.session_token() {
            builder = builder.header("X-Session-Token", token);
        }

        let response = match builder.json(&request).send().await {
            Ok(resp) => resp,
            Err(err) => {
                return self.error_outcome(
                    run_id,
                    stage_id,
                    worker_id,
                    operation,
                    None,
                    started,
                    classify_reqwest_error(&err),
                );
            }
        };

        let status = response.status();
        let latency_ms = started.elapsed().as_millis() as i64;
        match status.as_u16() {
            200 | 202 | 204 => {
                let mut outcome = OperationOutcome::success(run_id, stage_id, worker_id, operation, latency_ms);
                outcome.http_status = Some(status.as_u16());
                outcome
            }
            other => self.error_outcome(
                run_id,
                stage_id,
                worker_id,
                operation,
                None,
                started,
                OperationError::from_http_status(other)
                    .unwrap_or_else(|| OperationError::new(ErrorKind::Http, other.to_string(), "notification failed")),
            ),
        }
    }

    async fn consume_json(
        &self,
        run_id: RunId,
        stage_id: String,
        worker_id: crate::ids::WorkerId,
        operation: &str,
        tool_name: Option<&str>,
        started: Instant,
        request_id: &str,
        status: StatusCode,
        response: reqwest::Response,
    ) -> OperationOutcome {
        let bytes = match read_capped(response, self.config.max_response_bytes).await {
            Ok(b) => b,
            Err(err) => {
                return self.error_outcome(
                    run_id,
                    stage_id,
                    worker_id,
                    operation,
                    tool_name,
                    started,
                    classify_reqwest_error(&err),
                );
            }
        };
        let parsed: Result<JsonRpcResponse, _> = serde_json::from_slice(&bytes);
        let latency_ms = started.elapsed().as_millis() as i64;
        let mut outcome = OperationOutcome::success(run_id, stage_id, worker_id, operation, latency_ms);
        outcome.tool_name = tool_name.map(String::from);
        outcome.http_status = Some(status.as_u16());
        outcome.bytes_in = bytes.len() as u64;
        outcome.phase_timing = Some(PhaseTiming {
            e2e_ms: latency_ms.max(0) as u64,
            ttfb_ms: latency_ms.max(0) as u64,
            ..Default::default()
        });

        let rpc_response = match parsed {
            Ok(r) => r,
            Err(_) => {
                outcome.ok = false;
                outcome.error = Some(OperationError::new(ErrorKind::Protocol, "invalid_json", "response body was not valid JSON-RPC"));
                return outcome;
            }
        };

        match validate_response(&rpc_response, request_id) {
            Ok(result) => {
                if let Some(code) = rpc_response.error.as_ref().map(|e| e.code) {
                    outcome.jsonrpc_error_code = Some(code);
                }
                if let Some(tool_error) = check_tool_result(&result) {
                    outcome.ok = false;
                    outcome.error = Some(tool_error);
                } else {
                    outcome.result = Some(result);
                }
            }
            Err(err) => {
                if let Some(code) = &rpc_response.error {
                    outcome.jsonrpc_error_code = Some(code.code);
                }
                outcome.ok = false;
                outcome.error = Some(err);
            }
        }
        outcome
    }

    async fn consume_sse(
        &self,
        run_id: RunId,
        stage_id: String,
        worker_id: crate::ids::WorkerId,
        operation: &str,
        tool_name: Option<&str>,
        started: Instant,
        request_id: &str,
        response: reqwest::Response,
    ) -> OperationOutcome {
        let stream = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        let reader = tokio_util::io::StreamReader::new(stream);
        let mut rx = spawn_reader(reader);

        let mut signals = StreamSignals {
            is_streaming: true,
            ..Default::default()
        };
        let mut first_event_at: Option<Instant> = None;
        let mut last_event_at = started;
        let mut gap_sum_ms = 0u64;
        let mut gap_samples = Vec::new();
        let mut matched_result: Option<Result<Value, OperationError>> = None;
        let mut ended_normally = false;

        loop {
            match next_with_stall(&mut rx, self.config.stream_stall_timeout).await {
                Some(crate::transport::sse::SseItem::Stall { duration_ms }) => {
                    signals.stall_count += 1;
                    signals.stalled = true;
                    signals.total_stall_seconds += duration_ms as f64 / 1000.0;
                    signals.stall_duration_ms = duration_ms;
                    matched_result = Some(Err(OperationError::timeout("stream_stall")));
                    break;
                }
                Some(crate::transport::sse::SseItem::Event(event)) => {
                    signals.events_count += 1;
                    let now = Instant::now();
                    if first_event_at.is_none() {
                        first_event_at = Some(now);
                    } else {
                        let gap_ms = now.duration_since(last_event_at).as_millis() as u64;
                        signals
                            .gap_histogram
                            .record(gap_ms, &mut gap_sum_ms, &mut gap_samples);
                    }
                    last_event_at = now;

                    if let Some(id) = &event.id {
                        if is_resumable_event_id(id) {
                            *self.last_event_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(id.clone());
                        }
                    }

                    if event.data.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<JsonRpcResponse>(&event.data) {
                        Ok(parsed) if parsed.id.is_some() => {
                            match validate_response(&parsed, request_id) {
                                Ok(result) => {
                                    ended_normally = true;
                                    matched_result = Some(Ok(result));
                                    break;
                                }
                                Err(err) => {
                                    ended_normally = true;
                                    matched_result = Some(Err(err));
                                    break;
                                }
                            }
                        }
                        Ok(_notification) => continue,
                        Err(_) => {
                            matched_result = Some(Err(OperationError::new(
                                ErrorKind::Protocol,
                                "invalid_json",
                                "SSE event data was not valid JSON-RPC",
                            )));
                            break;
                        }
                    }
                }
                None => break,
            }
        }

        signals.gap_histogram.finalize(gap_sum_ms, &gap_samples);
        signals.ended_normally = ended_normally;
        if let Some(first) = first_event_at {
            let connect_ms = first.duration_since(started).as_millis() as u64;
            signals.stream_connect_ms = connect_ms;
            signals.time_to_first_event_ms = connect_ms;
        }

        let latency_ms = started.elapsed().as_millis() as i64;
        let mut outcome = OperationOutcome::success(run_id, stage_id, worker_id, operation, latency_ms);
        outcome.tool_name = tool_name.map(String::from);
        outcome.http_status = Some(200);
        outcome.stream_signals = Some(signals);

        match matched_result {
            Some(Ok(result)) => {
                if let Some(tool_error) = check_tool_result(&result) {
                    outcome.ok = false;
                    outcome.error = Some(tool_error);
                } else {
                    outcome.result = Some(result);
                }
            }
            Some(Err(err)) => {
                outcome.ok = false;
                outcome.error = Some(err);
            }
            None => {
                outcome.ok = false;
                outcome.error = Some(OperationError::new(
                    ErrorKind::Connect,
                    "sse_disconnect",
                    "stream ended before a matching response arrived",
                ));
            }
        }
        outcome
    }

    fn error_outcome(
        &self,
        run_id: RunId,
        stage_id: String,
        worker_id: crate::ids::WorkerId,
        operation: &str,
        tool_name: Option<&str>,
        started: Instant,
        error: OperationError,
    ) -> OperationOutcome {
        let latency_ms = started.elapsed().as_millis() as i64;
        let mut outcome = OperationOutcome::failure(run_id, stage_id, worker_id, operation, latency_ms, error);
        outcome.tool_name = tool_name.map(String::from);
        outcome
    }

    /// `true` if `redirect_policy` would allow a hop from `from` to `to`,
    /// with the hard 3-hop cap applied by the caller that tracks hop count.
    pub fn would_allow_redirect(&self, from: &url::Url, to: &url::Url) -> bool {
        redirect_allowed(self.config.redirect_policy, from, to, &self.config.redirect_allowlist)
    }
}

/// Read a response body as a stream of chunks, stopping (and truncating)
/// once `cap` bytes have been accumulated rather than buffering the whole
/// body first — unlike the shipper's `read_capped`, which caps a much
/// smaller 64 KiB ceiling after the fact, a 100 MB JSON-RPC response cap
/// is worth enforcing before the bytes are fully in memory.
async fn read_capped(mut response: reqwest::Response, cap: u64) -> Result<Vec<u8>, reqwest::Error> {
    let mut buf = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        buf.extend_from_slice(&chunk);
        if buf.len() as u64 >= cap {
            buf.truncate(cap as usize);
            break;
        }
    }
    Ok(buf)
}

fn classify_reqwest_error(err: &reqwest::Error) -> OperationError {
    if err.is_timeout() {
        OperationError::timeout("request_timeout")
    } else if err.is_connect() {
        OperationError::connect(err.to_string())
    } else if err.is_decode() {
        OperationError::new(ErrorKind::Protocol, "decode_failed", err.to_string())
    } else {
        OperationError::new(ErrorKind::Unknown, "unknown", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_cap_constant_matches_spec() {
        assert_eq!(crate::transport::dialer::MAX_REDIRECT_HOPS, 3);
    }

    #[test]
    fn new_connection_has_no_session_token_or_last_event_id() {
        let conn = Connection::new("https://example.test", TransportConfig::default());
        assert!(conn.session_token().is_none());
        assert!(conn.last_event_id().is_none());
    }

    #[test]
    fn request_ids_are_monotonically_distinct() {
        let conn = Connection::new("https://example.test", TransportConfig::default());
        let a = conn.next_request_id();
        let b = conn.next_request_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn read_capped_truncates_body_larger_than_cap() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let body = "x".repeat(1000);
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let response = reqwest::get(server.uri()).await.unwrap();
        let capped = read_capped(response, 100).await.unwrap();
        assert_eq!(capped.len(), 100);
    }

    #[tokio::test]
    async fn read_capped_returns_full_body_under_cap() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("short"))
            .mount(&server)
            .await;

        let response = reqwest::get(server.uri()).await.unwrap();
        let capped = read_capped(response, 100).await.unwrap();
        assert_eq!(capped, b"short");
    }

    fn loopback_allowed_config() -> TransportConfig {
        TransportConfig {
            dialer: crate::transport::dialer::DialerConfig {
                allow_private_ranges: true,
                allow_loopback: true,
            },
            ..TransportConfig::default()
        }
    }

    #[tokio::test]
    async fn redirect_denied_by_default_policy_fails_the_call() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(307).insert_header("Location", "/mcp2"))
            .mount(&server)
            .await;

        let conn = Connection::new(server.uri(), loopback_allowed_config());
        let outcome = conn
            .call(
                crate::ids::RunId::new(),
                "s".into(),
                crate::ids::WorkerId::new(),
                "ping",
                None,
                serde_json::json!({}),
                false,
            )
            .await;
        assert!(!outcome.ok);
        assert_eq!(outcome.error.unwrap().code, "redirect_denied");
    }

    #[tokio::test]
    async fn redirect_followed_under_same_origin_policy() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(307).insert_header("Location", "/mcp2"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mcp2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": "req_0",
                "result": {"pong": true},
            })))
            .mount(&server)
            .await;

        let mut config = loopback_allowed_config();
        config.redirect_policy = RedirectPolicy::SameOrigin;
        let conn = Connection::new(server.uri(), config);
        let outcome = conn
            .call(
                crate::ids::RunId::new(),
                "s".into(),
                crate::ids::WorkerId::new(),
                "ping",
                None,
                serde_json::json!({}),
                false,
            )
            .await;
        assert!(outcome.ok, "{:?}", outcome.error);
    }

    #[tokio::test]
    async fn loopback_host_is_refused_by_the_safe_dialer() {
        // The safe dialer's blocked-range check runs inside the DNS resolver
        // hook, so a loopback target fails during connect rather than ever
        // reaching the application layer.
        let conn = Connection::new("http://localhost:1", TransportConfig::default());
        let outcome = conn
            .call(
                crate::ids::RunId::new(),
                "s".into(),
                crate::ids::WorkerId::new(),
                "ping",
                None,
                serde_json::json!({}),
                false,
            )
            .await;
        assert!(!outcome.ok);
    }

    #[tokio::test]
    async fn notify_succeeds_on_204_with_no_body() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let conn = Connection::new(server.uri(), loopback_allowed_config());
        let outcome = conn
            .notify(
                crate::ids::RunId::new(),
                "s".into(),
                crate::ids::WorkerId::new(),
                "initialized",
                serde_json::json!({}),
            )
            .await;
        assert!(outcome.ok, "{:?}", outcome.error);
        assert_eq!(outcome.http_status, Some(204));
    }

    #[tokio::test]
    async fn notify_fails_on_5xx() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let conn = Connection::new(server.uri(), loopback_allowed_config());
        let outcome = conn
            .notify(
                crate::ids::RunId::new(),
                "s".into(),
                crate::ids::WorkerId::new(),
                "initialized",
                serde_json::json!({}),
            )
            .await;
        assert!(!outcome.ok);
    }
}
