//! # Knee-point detector
//!
//! Identifies the load level at which a monitored metric changes regime:
//! max-curvature for latency series, threshold-crossing for error rate.
//! See spec.md §4.8.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy)]
pub struct TimeSeriesPoint {
    pub load_level: f64,
    pub timestamp_ms: i64,
    pub latency_p95: f64,
    pub latency_p99: f64,
    pub error_rate: f64,
    pub throughput: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct KneeConfig {
    pub min_data_points: usize,
    pub change_ratio_threshold: f64,
    pub error_rate_threshold: f64,
}

impl Default for KneeConfig {
    fn default() -> Self {
        Self {
            min_data_points: 5,
            change_ratio_threshold: 1.5,
            error_rate_threshold: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KneeResult {
    pub detected: bool,
    pub load_level: f64,
    pub metric_value: f64,
    pub metric: String,
    pub change_ratio: f64,
    pub significance: f64,
    pub analysis_details: String,
}

impl KneeResult {
    fn not_detected(metric: &str) -> Self {
        Self {
            detected: false,
            load_level: 0.0,
            metric_value: 0.0,
            metric: metric.to_string(),
            change_ratio: 0.0,
            significance: 0.0,
            analysis_details: "insufficient evidence".to_string(),
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Latency knee over a chosen metric series (P95 or P99). `select` extracts
/// that metric from a point.
fn latency_knee(points: &[TimeSeriesPoint], config: &KneeConfig, metric_name: &str, select: impl Fn(&TimeSeriesPoint) -> f64) -> KneeResult {
    if points.len() < config.min_data_points {
        return KneeResult::not_detected(metric_name);
    }

    let mut sorted: Vec<&TimeSeriesPoint> = points.iter().collect();
    sorted.sort_by(|a, b| a.load_level.partial_cmp(&b.load_level).unwrap());

    let values: Vec<f64> = sorted.iter().map(|p| select(p)).collect();
    let min = values.iter().cloned().fold(f64::MAX, f64::min);
    let max = values.iter().cloned().fold(f64::MIN, f64::max);
    if max - min < 1.0 {
        return KneeResult::not_detected(metric_name);
    }
    let normalized: Vec<f64> = values.iter().map(|v| (v - min) / (max - min)).collect();

    let n = normalized.len();
    let mut max_curvature = 0.0f64;
    let mut knee_idx = 0usize;
    for i in 1..n - 1 {
        let d1 = normalized[i] - normalized[i - 1];
        let d2 = normalized[i + 1] - normalized[i];
        let mag1 = (1.0f64 + d1 * d1).sqrt();
        let mag2 = (1.0f64 + d2 * d2).sqrt();
        // cross product of (1, d1) and (1, d2): 1*d2 - d1*1
        let cross_product = (1.0 * d2 - d1 * 1.0).abs();
        let curvature = if mag1 * mag2 > 0.0 {
            cross_product / (mag1 * mag2)
        } else {
            0.0
        };
        if curvature > max_curvature {
            max_curvature = curvature;
            knee_idx = i;
        }
    }

    if max_curvature < 0.1 {
        return KneeResult::not_detected(metric_name);
    }

    let before_mean = mean(&values[0..knee_idx]).max(1.0);
    let after_mean = mean(&values[knee_idx..n]);
    let change_ratio = after_mean / before_mean;
    if change_ratio < config.change_ratio_threshold {
        return KneeResult::not_detected(metric_name);
    }

    let overall_stddev = stddev(&values);
    let significance = if overall_stddev < 1.0 {
        0.0
    } else {
        (values[knee_idx] - mean(&values)).abs() / overall_stddev
    };

    KneeResult {
        detected: true,
        load_level: sorted[knee_idx].load_level,
        metric_value: values[knee_idx],
        metric: metric_name.to_string(),
        change_ratio,
        significance,
        analysis_details: format!("{metric_name} curvature knee at load {}", sorted[knee_idx].load_level),
    }
}

/// First point whose error rate crosses `config.error_rate_threshold`.
fn error_rate_knee(points: &[TimeSeriesPoint], config: &KneeConfig) -> KneeResult {
    let mut sorted: Vec<&TimeSeriesPoint> = points.iter().collect();
    sorted.sort_by(|a, b| a.load_level.partial_cmp(&b.load_level).unwrap());

    for (i, point) in sorted.iter().enumerate() {
        if point.error_rate >= config.error_rate_threshold {
            let previous = if i > 0 { sorted[i - 1].error_rate } else { 0.0 };
            let change_ratio = if previous > 0.0 {
                point.error_rate / previous
            } else {
                f64::INFINITY
            };
            return KneeResult {
                detected: true,
                load_level: point.load_level,
                metric_value: point.error_rate,
                metric: "error_rate".to_string(),
                change_ratio,
                significance: point.error_rate / config.error_rate_threshold,
                analysis_details: "error rate threshold exceeded".to_string(),
            };
        }
    }
    KneeResult::not_detected("error_rate")
}

/// Error-rate knee takes precedence; falls back to P99 latency knee;
/// otherwise not-detected with metric="combined".
pub fn combined_knee(points: &[TimeSeriesPoint], config: &KneeConfig) -> KneeResult {
    let err_knee = error_rate_knee(points, config);
    if err_knee.detected {
        return err_knee;
    }
    let lat_knee = latency_knee(points, config, "latency_p99_ms", |p| p.latency_p99);
    if lat_knee.detected {
        return lat_knee;
    }
    KneeResult::not_detected("combined")
}

pub fn p95_latency_knee(points: &[TimeSeriesPoint], config: &KneeConfig) -> KneeResult {
    latency_knee(points, config, "latency_p95_ms", |p| p.latency_p95)
}

pub fn p99_latency_knee(points: &[TimeSeriesPoint], config: &KneeConfig) -> KneeResult {
    latency_knee(points, config, "latency_p99_ms", |p| p.latency_p99)
}
