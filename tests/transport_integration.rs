//! Integration tests driving [`loadcore::transport::Connection`] against a
//! mocked upstream service, covering the JSON and SSE response paths plus
//! the telemetry-side scenarios S4-S6 (spec.md §8).

use loadcore::ids::{RunId, WorkerId};
use loadcore::telemetry::{
    combined_knee, extract_top_signatures, Comparator, Condition, ErrorLog, Evaluator, Metric,
    TimeSeriesPoint,
};
use loadcore::transport::dialer::DialerConfig;
use loadcore::transport::{Connection, TransportConfig};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// `wiremock::MockServer` binds to loopback; the safe dialer blocks
/// loopback by default (spec.md §4.5), so these tests opt back in
/// explicitly rather than relaxing the crate's production default.
fn local_test_config() -> TransportConfig {
    TransportConfig {
        dialer: DialerConfig {
            allow_private_ranges: true,
            allow_loopback: true,
        },
        ..TransportConfig::default()
    }
}

/// A plain JSON-RPC response over HTTP is parsed into a successful outcome
/// carrying the upstream result.
#[tokio::test]
async fn json_rpc_call_over_http_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": "req_0",
            "result": {"tools": []}
        })))
        .mount(&server)
        .await;

    let conn = Connection::new(server.uri(), local_test_config());
    let outcome = conn
        .call(
            RunId::new(),
            "steady".into(),
            WorkerId::new(),
            "tools/list",
            None,
            json!({}),
            false,
        )
        .await;

    assert!(outcome.ok, "expected success, got {:?}", outcome.error);
    assert_eq!(outcome.http_status, Some(200));
    assert!(outcome.result.is_some());
}

/// A JSON-RPC error object surfaces as a failed outcome with the error
/// code preserved, not as a Rust-level error.
#[tokio::test]
async fn json_rpc_error_object_surfaces_as_failed_outcome() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": "req_0",
            "error": {"code": -32601, "message": "method not found"}
        })))
        .mount(&server)
        .await;

    let conn = Connection::new(server.uri(), local_test_config());
    let outcome = conn
        .call(
            RunId::new(),
            "steady".into(),
            WorkerId::new(),
            "tools/call",
            Some("fetch"),
            json!({}),
            false,
        )
        .await;

    assert!(!outcome.ok);
    assert_eq!(outcome.jsonrpc_error_code, Some(-32601));
}

/// A gateway 502 maps to a Gateway-attributed failure, never a panic or a
/// propagated Rust error.
#[tokio::test]
async fn http_5xx_maps_to_failed_outcome() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let conn = Connection::new(server.uri(), local_test_config());
    let outcome = conn
        .call(RunId::new(), "steady".into(), WorkerId::new(), "tools/list", None, json!({}), false)
        .await;

    assert!(!outcome.ok);
    assert_eq!(outcome.http_status, Some(502));
}

/// An SSE response carrying one JSON-RPC result event is consumed as a
/// streaming outcome with a matching result and `ended_normally`.
#[tokio::test]
async fn sse_stream_with_matching_response_ends_normally() {
    let server = MockServer::start().await;
    let body = "event: message\r\ndata: {\"jsonrpc\":\"2.0\",\"id\":\"req_0\",\"result\":{\"ok\":true}}\r\n\r\n";
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let conn = Connection::new(server.uri(), local_test_config());
    let outcome = conn
        .call(RunId::new(), "steady".into(), WorkerId::new(), "tools/call", Some("fetch"), json!({}), false)
        .await;

    assert!(outcome.ok, "expected success, got {:?}", outcome.error);
    let signals = outcome.stream_signals.expect("streaming outcome");
    assert!(signals.is_streaming);
    assert!(signals.ended_normally);
    assert_eq!(signals.events_count, 1);
}

/// S4: repeated connection-refused errors against different peer IPs
/// coalesce to a single error signature once normalized.
#[test]
fn s4_connection_refused_coalesces_to_one_signature() {
    let logs: Vec<ErrorLog> = (0..5)
        .map(|i| ErrorLog {
            timestamp_ms: 1000 + i,
            operation: "tools/call".into(),
            tool_name: Some("fetch".into()),
            error_type: format!("connection refused to 10.0.0.{i}:443"),
        })
        .collect();
    let signatures = extract_top_signatures(&logs, 10);
    assert_eq!(signatures.len(), 1);
    assert_eq!(signatures[0].count, 5);
}

/// S5: when both an error-rate breach and a latency knee are present in
/// the same series, the combined detector reports the error-rate knee.
#[test]
fn s5_combined_knee_prefers_error_rate_over_latency() {
    let points = vec![
        TimeSeriesPoint { load_level: 10.0, timestamp_ms: 0, latency_p95: 110.0, latency_p99: 120.0, error_rate: 0.001, throughput: 100.0 },
        TimeSeriesPoint { load_level: 20.0, timestamp_ms: 1, latency_p95: 115.0, latency_p99: 125.0, error_rate: 0.002, throughput: 200.0 },
        TimeSeriesPoint { load_level: 30.0, timestamp_ms: 2, latency_p95: 120.0, latency_p99: 130.0, error_rate: 0.03, throughput: 300.0 },
        TimeSeriesPoint { load_level: 40.0, timestamp_ms: 3, latency_p95: 280.0, latency_p99: 300.0, error_rate: 0.08, throughput: 150.0 },
        TimeSeriesPoint { load_level: 50.0, timestamp_ms: 4, latency_p95: 460.0, latency_p99: 500.0, error_rate: 0.15, throughput: 100.0 },
    ];
    let result = combined_knee(&points, &Default::default());
    assert!(result.detected);
    assert_eq!(result.metric, "error_rate");
    assert_eq!(result.load_level, 40.0);
    assert_eq!(result.analysis_details, "error rate threshold exceeded");
}

/// S6: a stop condition with `sustain_windows: 2` only fires once the
/// breach has held for two consecutive evaluations.
#[test]
fn s6_requires_two_consecutive_breaches_before_firing() {
    use loadcore::transport::OperationOutcome;

    let condition = Condition {
        id: "err-rate".into(),
        metric: Metric::ErrorRate,
        comparator: Comparator::Gt,
        threshold: 0.3,
        window_ms: 5000,
        sustain_windows: 2,
        scope: None,
    };
    let mut evaluator = Evaluator::new(vec![condition], vec![]);

    let mut outcomes = Vec::new();
    let make = |ok: bool| {
        let mut o = OperationOutcome::success(RunId::new(), "s".into(), WorkerId::new(), "tools/call", 10);
        o.ok = ok;
        if !ok {
            o.error = Some(loadcore::transport::OperationError::timeout("request_timeout"));
        }
        o
    };
    for _ in 0..6 {
        outcomes.push(make(false));
    }
    for _ in 0..4 {
        outcomes.push(make(true));
    }

    assert!(evaluator.evaluate(&outcomes, 3000, None, None).is_none());
    let trigger = evaluator.evaluate(&outcomes, 3100, None, None);
    assert!(trigger.is_some());
    assert!(trigger.unwrap().observed >= 0.5);
}
