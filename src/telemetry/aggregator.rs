//! # Telemetry aggregator
//!
//! Accepts a stream of [`OperationOutcome`]s plus worker-health and churn
//! samples, and computes [`AggregatedMetrics`] on demand. One instance per
//! run (spec.md §3 ownership: "an Aggregator instance owns its own samples").

use crate::transport::outcome::OperationOutcome;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::RwLock;

/// Percentile of an integer multiset: sort ascending, index =
/// `floor(p/100 * n)` clamped to `[0, n-1]`. Does not mutate `values`.
/// `p=0` picks the minimum, `p>=100` picks the maximum. Empty input is 0.
pub fn percentile(values: &[u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let n = sorted.len();
    let idx = ((p / 100.0) * n as f64).floor() as i64;
    let idx = idx.clamp(0, n as i64 - 1) as usize;
    sorted[idx]
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerHealthSample {
    pub worker_id: String,
    pub timestamp_ms: i64,
    pub cpu_percent: f64,
    pub mem_bytes: u64,
    pub active_vus: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChurnSample {
    pub timestamp_ms: i64,
    pub created: u64,
    pub destroyed: u64,
    pub reconnects: u64,
    pub active_sessions: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMode {
    Sticky,
    RoundRobin,
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpStats {
    pub total_ops: u64,
    pub success_ops: u64,
    pub failure_ops: u64,
    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,
    pub latency_p99_ms: u64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReportMetrics {
    pub mode: String,
    pub unique_session_count: u64,
    pub ops_per_session: f64,
    pub sessions_created: u64,
    pub sessions_evicted: u64,
    pub reconnects: u64,
    /// Historically identical to `ops_per_session` — spec-unresolved, see DESIGN.md.
    pub reuse_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealthMetrics {
    pub peak_cpu_percent: f64,
    pub peak_memory_mb: f64,
    pub avg_active_vus: f64,
    pub worker_count: u64,
    pub saturation_detected: bool,
    pub saturation_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChurnMetrics {
    pub created: u64,
    pub destroyed: u64,
    pub reconnects: u64,
    pub active_sessions: u64,
    pub churn_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    pub global: OpStats,
    pub rps: f64,
    pub by_operation: std::collections::BTreeMap<String, OpStats>,
    pub by_tool: std::collections::BTreeMap<String, OpStats>,
    pub session: Option<SessionReportMetrics>,
    pub worker_health: Option<WorkerHealthMetrics>,
    pub churn: Option<ChurnMetrics>,
}

/// Canonicalize underscore-form operation names to slash form
/// (`tools_list` -> `tools/list`) before bucketing (spec.md §4.6).
pub fn normalize_operation_name(name: &str) -> String {
    match name {
        "tools_list" => "tools/list".to_string(),
        "tools_call" => "tools/call".to_string(),
        "resources_list" => "resources/list".to_string(),
        "resources_read" => "resources/read".to_string(),
        "prompts_list" => "prompts/list".to_string(),
        "prompts_get" => "prompts/get".to_string(),
        other => other.to_string(),
    }
}

struct AggregatorState {
    operations: Vec<OperationOutcome>,
    worker_health: Vec<WorkerHealthSample>,
    churn: Vec<ChurnSample>,
    workers_seen: HashSet<String>,
    start_time_ms: Option<i64>,
    end_time_ms: Option<i64>,
    session_mode: Option<SessionMode>,
    max_vus_config: u64,
}

impl AggregatorState {
    fn new() -> Self {
        Self {
            operations: Vec::new(),
            worker_health: Vec::new(),
            churn: Vec::new(),
            workers_seen: HashSet::new(),
            start_time_ms: None,
            end_time_ms: None,
            session_mode: None,
            max_vus_config: 0,
        }
    }
}

pub struct Aggregator {
    inner: RwLock<AggregatorState>,
    /// Publishes every `compute()` result so a reporter can observe live
    /// progress without polling `compute()` on a tight loop. Additive: it
    /// does not change `compute()`'s synchronous return contract.
    snapshot_tx: tokio::sync::watch::Sender<AggregatedMetrics>,
}

impl Aggregator {
    pub fn new() -> Self {
        let (snapshot_tx, _rx) = tokio::sync::watch::channel(AggregatedMetrics::default());
        Self {
            inner: RwLock::new(AggregatorState::new()),
            snapshot_tx,
        }
    }

    /// Subscribe to a live feed of every future `compute()` result.
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<AggregatedMetrics> {
        self.snapshot_tx.subscribe()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, AggregatorState> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, AggregatorState> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_operation(&self, outcome: OperationOutcome) {
        let mut state = self.write();
        state.workers_seen.insert(outcome.worker_id.to_string());
        state.operations.push(outcome);
    }

    pub fn add_worker_health(&self, sample: WorkerHealthSample) {
        let mut state = self.write();
        state.workers_seen.insert(sample.worker_id.clone());
        state.worker_health.push(sample);
    }

    pub fn add_churn_sample(&self, sample: ChurnSample) {
        self.write().churn.push(sample);
    }

    pub fn set_time_range(&self, start_ms: i64, end_ms: i64) {
        let mut state = self.write();
        state.start_time_ms = Some(start_ms);
        state.end_time_ms = Some(end_ms);
    }

    pub fn set_session_info(&self, mode: SessionMode) {
        self.write().session_mode = Some(mode);
    }

    pub fn set_max_vus_config(&self, max_vus: u64) {
        self.write().max_vus_config = max_vus;
    }

    pub fn reset(&self) {
        let mut state = self.write();
        *state = AggregatorState::new();
    }

    fn stats_for<'a>(outcomes: impl Iterator<Item = &'a OperationOutcome>) -> OpStats {
        let mut latencies = Vec::new();
        let mut total = 0u64;
        let mut failures = 0u64;
        for outcome in outcomes {
            total += 1;
            if !outcome.ok {
                failures += 1;
            }
            latencies.push(outcome.latency_ms.max(0) as u64);
        }
        let success = total - failures;
        OpStats {
            total_ops: total,
            success_ops: success,
            failure_ops: failures,
            latency_p50_ms: percentile(&latencies, 50.0),
            latency_p95_ms: percentile(&latencies, 95.0),
            latency_p99_ms: percentile(&latencies, 99.0),
            error_rate: if total > 0 {
                failures as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    /// Consistent snapshot: takes the read lock once, reflecting every write
    /// that happened-before this call.
    pub fn compute(&self) -> AggregatedMetrics {
        let state = self.read();

        let global = Self::stats_for(state.operations.iter());
        let rps = match (state.start_time_ms, state.end_time_ms) {
            (Some(start), Some(end)) if end > start => {
                global.total_ops as f64 / ((end - start) as f64 / 1000.0)
            }
            _ => 0.0,
        };

        let mut by_operation = std::collections::BTreeMap::new();
        let mut names: HashSet<String> = HashSet::new();
        for outcome in &state.operations {
            names.insert(normalize_operation_name(&outcome.operation));
        }
        for name in &names {
            let stats = Self::stats_for(state.operations.iter().filter(|o| {
                normalize_operation_name(&o.operation) == *name
            }));
            by_operation.insert(name.clone(), stats);
        }

        let mut by_tool = std::collections::BTreeMap::new();
        let mut tools: HashSet<String> = HashSet::new();
        for outcome in &state.operations {
            let normalized = normalize_operation_name(&outcome.operation);
            if normalized == "tools/call" {
                if let Some(tool) = &outcome.tool_name {
                    if !tool.is_empty() {
                        tools.insert(tool.clone());
                    }
                }
            }
        }
        for tool in &tools {
            let stats = Self::stats_for(state.operations.iter().filter(|o| {
                normalize_operation_name(&o.operation) == "tools/call"
                    && o.tool_name.as_deref() == Some(tool.as_str())
            }));
            by_tool.insert(tool.clone(), stats);
        }

        let any_session_evidence = state
            .operations
            .iter()
            .any(|o| o.session_id.as_ref().is_some_and(|s| !s.is_empty()));
        let session = if state.session_mode.is_some() || any_session_evidence {
            let unique: HashSet<&str> = state
                .operations
                .iter()
                .filter_map(|o| o.session_id.as_deref())
                .collect();
            let unique_count = unique.len() as u64;
            let ops_per_session = if unique_count > 0 {
                global.total_ops as f64 / unique_count as f64
            } else {
                0.0
            };
            let mode_str = match state.session_mode {
                Some(SessionMode::Sticky) => "sticky",
                Some(SessionMode::RoundRobin) => "round_robin",
                Some(SessionMode::Unknown) | None => "unknown",
            };
            Some(SessionReportMetrics {
                mode: mode_str.to_string(),
                unique_session_count: unique_count,
                ops_per_session,
                sessions_created: state.churn.iter().map(|c| c.created).sum(),
                sessions_evicted: state.churn.iter().map(|c| c.destroyed).sum(),
                reconnects: state.churn.iter().map(|c| c.reconnects).sum(),
                reuse_rate: ops_per_session,
            })
        } else {
            None
        };

        let worker_health = if !state.worker_health.is_empty() {
            let peak_cpu = state
                .worker_health
                .iter()
                .map(|s| s.cpu_percent)
                .fold(f64::MIN, f64::max);
            let peak_mem_mb = state
                .worker_health
                .iter()
                .map(|s| s.mem_bytes as f64 / 1_048_576.0)
                .fold(f64::MIN, f64::max);
            let avg_active_vus = state
                .worker_health
                .iter()
                .map(|s| s.active_vus as f64)
                .sum::<f64>()
                / state.worker_health.len() as f64;

            let cpu_saturated = peak_cpu >= 80.0;
            let vu_saturated = state.max_vus_config > 0
                && state
                    .worker_health
                    .iter()
                    .any(|s| s.active_vus >= state.max_vus_config);
            let mut reasons = Vec::new();
            if cpu_saturated {
                reasons.push(format!("peak CPU {peak_cpu:.1}% >= 80%"));
            }
            if vu_saturated {
                reasons.push("active VUs reached configured max".to_string());
            }

            Some(WorkerHealthMetrics {
                peak_cpu_percent: peak_cpu,
                peak_memory_mb: peak_mem_mb,
                avg_active_vus,
                worker_count: state.workers_seen.len() as u64,
                saturation_detected: cpu_saturated || vu_saturated,
                saturation_reason: reasons.join("; "),
            })
        } else {
            None
        };

        let churn = if !state.churn.is_empty() {
            let created: u64 = state.churn.iter().map(|c| c.created).sum();
            let destroyed: u64 = state.churn.iter().map(|c| c.destroyed).sum();
            let reconnects: u64 = state.churn.iter().map(|c| c.reconnects).sum();
            let active_sessions = state.churn.last().map(|c| c.active_sessions).unwrap_or(0);
            let duration_sec = match (state.start_time_ms, state.end_time_ms) {
                (Some(start), Some(end)) if end > start => (end - start) as f64 / 1000.0,
                _ => 0.0,
            };
            let churn_rate = if duration_sec > 0.0 {
                (created + destroyed) as f64 / duration_sec
            } else {
                0.0
            };
            Some(ChurnMetrics {
                created,
                destroyed,
                reconnects,
                active_sessions,
                churn_rate,
            })
        } else {
            None
        };

        let metrics = AggregatedMetrics {
            global,
            rps,
            by_operation,
            by_tool,
            session,
            worker_health,
            churn,
        };
        self.snapshot_tx.send_replace(metrics.clone());
        metrics
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}
