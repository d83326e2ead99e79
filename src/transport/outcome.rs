//! # OperationOutcome and its nested telemetry shapes
//!
//! The unit of telemetry the transport layer produces, the aggregator
//! consumes, and the shipper ships. Every field here is plain data —
//! serializable, defensively cloned across lock boundaries (spec.md §3, §5).

use crate::ids::{RunId, StageId, WorkerId};
use crate::transport::errors::OperationError;
use serde::{Deserialize, Serialize};

/// Fixed gap-histogram buckets (ms), ascending: `<10, 10-50, 50-100,
/// 100-500, 500-1000, >=1000`.
pub const GAP_BUCKET_EDGES: [u64; 5] = [10, 50, 100, 500, 1000];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GapHistogram {
    pub buckets: [u64; 6],
    pub min_ms: Option<u64>,
    pub max_ms: Option<u64>,
    pub avg_ms: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

impl GapHistogram {
    /// Bucket a single inter-event gap and fold it into min/max/running
    /// state. `finalize` must be called once all gaps are recorded to
    /// compute the percentiles.
    pub fn record(&mut self, gap_ms: u64, sum_ms: &mut u64, samples: &mut Vec<u64>) {
        let idx = GAP_BUCKET_EDGES
            .iter()
            .position(|edge| gap_ms < *edge)
            .unwrap_or(GAP_BUCKET_EDGES.len());
        self.buckets[idx] += 1;
        self.min_ms = Some(self.min_ms.map_or(gap_ms, |m| m.min(gap_ms)));
        self.max_ms = Some(self.max_ms.map_or(gap_ms, |m| m.max(gap_ms)));
        *sum_ms += gap_ms;
        samples.push(gap_ms);
    }

    pub fn finalize(&mut self, sum_ms: u64, samples: &[u64]) {
        let n = samples.len();
        if n == 0 {
            return;
        }
        self.avg_ms = sum_ms as f64 / n as f64;
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        self.p50_ms = crate::telemetry::aggregator::percentile(&sorted, 50.0);
        self.p95_ms = crate::telemetry::aggregator::percentile(&sorted, 95.0);
        self.p99_ms = crate::telemetry::aggregator::percentile(&sorted, 99.0);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub dns_ms: u64,
    pub tcp_connect_ms: u64,
    pub tls_handshake_ms: u64,
    pub ttfb_ms: u64,
    pub download_ms: u64,
    pub e2e_ms: u64,
    pub connection_reused: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamSignals {
    pub is_streaming: bool,
    pub events_count: u64,
    pub ended_normally: bool,
    pub stalled: bool,
    pub stall_duration_ms: u64,
    pub stream_connect_ms: u64,
    pub time_to_first_event_ms: u64,
    pub stall_count: u64,
    pub total_stall_seconds: f64,
    pub gap_histogram: GapHistogram,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub op_id: String,
    pub run_id: RunId,
    pub execution_id: String,
    pub stage_id: StageId,
    pub vuid: u64,
    pub worker_id: WorkerId,
    pub session_id: Option<String>,
    pub operation: String,
    pub tool_name: Option<String>,
    pub timestamp_ms: i64,
    pub latency_ms: i64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub transport_id: String,
    pub ok: bool,
    pub error: Option<OperationError>,
    pub http_status: Option<u16>,
    pub jsonrpc_error_code: Option<i64>,
    pub phase_timing: Option<PhaseTiming>,
    pub stream_signals: Option<StreamSignals>,
    pub result: Option<serde_json::Value>,
}

impl OperationOutcome {
    /// `OK == error.is_none()` is an invariant (spec.md §3) — construct via
    /// this helper rather than setting both fields by hand.
    pub fn success(
        run_id: RunId,
        stage_id: StageId,
        worker_id: WorkerId,
        operation: impl Into<String>,
        latency_ms: i64,
    ) -> Self {
        Self {
            op_id: uuid::Uuid::new_v4().to_string(),
            run_id,
            execution_id: uuid::Uuid::new_v4().to_string(),
            stage_id,
            vuid: 0,
            worker_id,
            session_id: None,
            operation: operation.into(),
            tool_name: None,
            timestamp_ms: 0,
            latency_ms,
            bytes_in: 0,
            bytes_out: 0,
            transport_id: String::new(),
            ok: true,
            error: None,
            http_status: Some(200),
            jsonrpc_error_code: None,
            phase_timing: None,
            stream_signals: None,
            result: None,
        }
    }

    pub fn failure(
        run_id: RunId,
        stage_id: StageId,
        worker_id: WorkerId,
        operation: impl Into<String>,
        latency_ms: i64,
        error: OperationError,
    ) -> Self {
        let mut outcome = Self::success(run_id, stage_id, worker_id, operation, latency_ms);
        outcome.ok = false;
        outcome.error = Some(error);
        outcome
    }
}
