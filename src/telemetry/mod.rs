//! # Telemetry and stop-condition core
//!
//! Aggregation, error-signature extraction, knee-point detection, and the
//! sliding-window stop-condition evaluator. See spec.md §4.6-§4.9.

pub mod aggregator;
pub mod knee;
pub mod signatures;
pub mod stop_condition;

pub use aggregator::{Aggregator, AggregatedMetrics, percentile};
pub use knee::{combined_knee, KneeConfig, KneeResult, TimeSeriesPoint};
pub use signatures::{extract_top_signatures, ErrorLog, ErrorSignature};
pub use stop_condition::{
    Comparator, Condition, EvaluationSource, Evaluator, EvaluatorRunner, Metric, OnTrigger,
    StreamingCondition, Trigger,
};
