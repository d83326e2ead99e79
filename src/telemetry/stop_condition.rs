//! # Stop-condition evaluator
//!
//! Evaluates a set of [`Condition`]s against a sliding window of recent
//! telemetry and fires at most one [`Trigger`] per run. Single-threaded by
//! construction: exactly one evaluate pass at a time per run (spec.md §4.9,
//! §5).

use crate::telemetry::aggregator::percentile;
use crate::transport::outcome::OperationOutcome;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metric {
    ErrorRate,
    LatencyP50Ms,
    LatencyP95Ms,
    LatencyP99Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    Gt,
    Ge,
    Lt,
    Le,
}

impl Comparator {
    fn compare(self, observed: f64, threshold: f64) -> bool {
        match self {
            Comparator::Gt => observed > threshold,
            Comparator::Ge => observed >= threshold,
            Comparator::Lt => observed < threshold,
            Comparator::Le => observed <= threshold,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub id: String,
    pub metric: Metric,
    pub comparator: Comparator,
    pub threshold: f64,
    pub window_ms: i64,
    pub sustain_windows: u32,
    pub scope: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StreamingCondition {
    pub id: String,
    pub max_stall_seconds: Option<f64>,
    pub min_events_per_second: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub condition_id: String,
    pub observed: f64,
    pub window_ms: i64,
    pub total_ops: u64,
    pub failed_ops: u64,
    pub latency_p99: u64,
    pub timestamp_ms: i64,
}

struct BufferedOutcome {
    recorded_at_ms: i64,
    outcome: OperationOutcome,
}

/// Tracks rolling buffer state and per-condition sustain counters across
/// repeated `evaluate` calls.
pub struct Evaluator {
    conditions: Vec<Condition>,
    streaming: Vec<StreamingCondition>,
    buffer: Vec<BufferedOutcome>,
    sustain_counters: HashMap<String, u32>,
    last_seen_len: usize,
    /// Latched once a `Trigger` has fired — spec.md §4.9 caps a run at "at
    /// most one Trigger"; once set, `evaluate` returns `None` forever.
    fired: bool,
}

impl Evaluator {
    pub fn new(conditions: Vec<Condition>, streaming: Vec<StreamingCondition>) -> Self {
        Self {
            conditions,
            streaming,
            buffer: Vec::new(),
            sustain_counters: HashMap::new(),
            last_seen_len: 0,
            fired: false,
        }
    }

    fn max_window_ms(&self) -> i64 {
        self.conditions
            .iter()
            .map(|c| c.window_ms)
            .max()
            .unwrap_or(0)
    }

    /// One evaluation pass. `outcomes` is the full current outcomes list
    /// from the telemetry provider; `now_ms` is the current monotonic
    /// timestamp; stall/events-per-second readings are supplied by the
    /// caller since they are not derivable from `OperationOutcome` alone.
    pub fn evaluate(
        &mut self,
        outcomes: &[OperationOutcome],
        now_ms: i64,
        stream_stall_seconds: Option<f64>,
        events_per_second: Option<f64>,
    ) -> Option<Trigger> {
        if self.fired {
            return None;
        }
        if outcomes.len() < self.last_seen_len {
            self.buffer.clear();
            self.sustain_counters.clear();
            self.last_seen_len = 0;
        }
        let newly_appeared = &outcomes[self.last_seen_len.min(outcomes.len())..];
        for outcome in newly_appeared {
            self.buffer.push(BufferedOutcome {
                recorded_at_ms: now_ms,
                outcome: outcome.clone(),
            });
        }
        self.last_seen_len = outcomes.len();

        let max_window = self.max_window_ms();
        self.buffer.retain(|b| now_ms - b.recorded_at_ms <= max_window);

        // Streaming conditions take precedence and are checked first; stall
        // wins over min-events if both fire in the same tick.
        for cond in &self.streaming {
            if let (Some(max_stall), Some(observed_stall)) =
                (cond.max_stall_seconds, stream_stall_seconds)
            {
                if observed_stall > max_stall {
                    self.fired = true;
                    return Some(Trigger {
                        condition_id: cond.id.clone(),
                        observed: observed_stall,
                        window_ms: 0,
                        total_ops: 0,
                        failed_ops: 0,
                        latency_p99: 0,
                        timestamp_ms: now_ms,
                    });
                }
            }
        }
        for cond in &self.streaming {
            if let (Some(min_eps), Some(observed_eps)) =
                (cond.min_events_per_second, events_per_second)
            {
                if observed_eps < min_eps {
                    self.fired = true;
                    return Some(Trigger {
                        condition_id: cond.id.clone(),
                        observed: observed_eps,
                        window_ms: 0,
                        total_ops: 0,
                        failed_ops: 0,
                        latency_p99: 0,
                        timestamp_ms: now_ms,
                    });
                }
            }
        }

        for cond in &self.conditions {
            if cond.window_ms <= 0 {
                continue;
            }
            let window_entries: Vec<&OperationOutcome> = self
                .buffer
                .iter()
                .filter(|b| now_ms - b.recorded_at_ms <= cond.window_ms)
                .map(|b| &b.outcome)
                .collect();

            let total_ops = window_entries.len() as u64;
            if total_ops == 0 {
                self.sustain_counters.insert(cond.id.clone(), 0);
                continue;
            }
            let failed_ops = window_entries.iter().filter(|o| !o.ok).count() as u64;
            let latencies: Vec<u64> = window_entries
                .iter()
                .map(|o| o.latency_ms.max(0) as u64)
                .collect();
            let latency_p99 = percentile(&latencies, 99.0);

            let observed = match cond.metric {
                Metric::ErrorRate => failed_ops as f64 / total_ops as f64,
                Metric::LatencyP50Ms => percentile(&latencies, 50.0) as f64,
                Metric::LatencyP95Ms => percentile(&latencies, 95.0) as f64,
                Metric::LatencyP99Ms => latency_p99 as f64,
            };

            if cond.comparator.compare(observed, cond.threshold) {
                let counter = self.sustain_counters.entry(cond.id.clone()).or_insert(0);
                *counter += 1;
                if *counter >= cond.sustain_windows.max(1) {
                    self.fired = true;
                    return Some(Trigger {
                        condition_id: cond.id.clone(),
                        observed,
                        window_ms: cond.window_ms,
                        total_ops,
                        failed_ops,
                        latency_p99,
                        timestamp_ms: now_ms,
                    });
                }
            } else {
                self.sustain_counters.insert(cond.id.clone(), 0);
            }
        }
        None
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Pulled by the runner on each poll tick to feed [`Evaluator::evaluate`].
/// A control plane implements this over whatever it already uses to track
/// a run's outcomes (e.g. the Aggregator's buffered operations).
pub trait EvaluationSource: Send + Sync {
    fn outcomes(&self) -> Vec<OperationOutcome>;
    fn stream_stall_seconds(&self) -> Option<f64> {
        None
    }
    fn events_per_second(&self) -> Option<f64> {
        None
    }
}

pub type OnTrigger = Arc<dyn Fn(Trigger) + Send + Sync>;

/// Drives an [`Evaluator`] on its own scheduling task, polling `source` at
/// `poll_interval` (spec.md §5: the stop-condition evaluator is one of the
/// long-running duties with a dedicated stop signal, Start/Stop idempotent,
/// Stop blocking until the task has exited). Single-threaded by
/// construction: the poll loop is the only caller of `evaluate`, so there
/// is exactly one evaluate pass in flight at a time (spec.md §5).
pub struct EvaluatorRunner {
    evaluator: Mutex<Evaluator>,
    source: Arc<dyn EvaluationSource>,
    poll_interval: Duration,
    on_trigger: Option<OnTrigger>,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EvaluatorRunner {
    pub fn new(
        evaluator: Evaluator,
        source: Arc<dyn EvaluationSource>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            evaluator: Mutex::new(evaluator),
            source,
            poll_interval,
            on_trigger: None,
            token: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn with_on_trigger(mut self, callback: OnTrigger) -> Self {
        self.on_trigger = Some(callback);
        self
    }

    /// One poll-and-evaluate pass. Exposed standalone for deterministic
    /// tests and for callers that manage their own scheduling loop. Returns
    /// `true` once a `Trigger` has fired, so a caller driving its own loop
    /// knows to stop polling (spec.md §4.9: "exits the loop").
    pub async fn tick(&self) -> bool {
        let outcomes = self.source.outcomes();
        let stall = self.source.stream_stall_seconds();
        let eps = self.source.events_per_second();
        let mut evaluator = self.evaluator.lock().await;
        if let Some(trigger) = evaluator.evaluate(&outcomes, now_ms(), stall, eps) {
            drop(evaluator);
            if let Some(callback) = &self.on_trigger {
                callback(trigger);
            }
            true
        } else {
            false
        }
    }

    /// Idempotent: calling `start` while already running is a no-op. The
    /// background loop exits on its own once a `Trigger` fires, not only on
    /// cancellation — spec.md §4.9 caps a run at one `Trigger`, after which
    /// "the loop" is required to exit.
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }
        let this = Arc::clone(self);
        let token = self.token.clone();
        let interval = self.poll_interval;
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if this.tick().await {
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Idempotent: blocks until the background task has fully exited.
    pub async fn stop(&self) {
        self.token.cancel();
        let mut handle = self.handle.lock().await;
        if let Some(h) = handle.take() {
            let _ = h.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{RunId, WorkerId};

    fn outcome(ok: bool) -> OperationOutcome {
        let mut o = OperationOutcome::success(RunId::new(), "s".into(), WorkerId::new(), "ping", 5);
        if !ok {
            o.ok = false;
        }
        o
    }

    fn error_rate_condition() -> Condition {
        Condition {
            id: "c1".into(),
            metric: Metric::ErrorRate,
            comparator: Comparator::Ge,
            threshold: 0.5,
            window_ms: 1000,
            sustain_windows: 2,
            scope: None,
        }
    }

    // ── S6: sustain-window firing from spec.md §8 ───────────────────

    #[test]
    fn s6_requires_two_consecutive_breaches_before_firing() {
        let mut evaluator = Evaluator::new(vec![error_rate_condition()], vec![]);
        let outcomes = vec![outcome(true), outcome(false)];

        let first = evaluator.evaluate(&outcomes, 3000, None, None);
        assert!(first.is_none());

        let second = evaluator.evaluate(&outcomes, 3100, None, None);
        let trigger = second.expect("second breach should fire");
        assert!(trigger.observed >= 0.5);
    }

    #[test]
    fn unmet_condition_resets_sustain_counter() {
        // Short window relative to the tick spacing so each tick's buffer
        // only reflects that tick's newly-appeared outcomes.
        let mut condition = error_rate_condition();
        condition.window_ms = 50;
        let mut evaluator = Evaluator::new(vec![condition], vec![]);

        // `outcomes` is the full cumulative list pulled from the telemetry
        // provider each tick, as the evaluator's contract requires.
        let mut outcomes = vec![outcome(false), outcome(false)];
        assert!(evaluator.evaluate(&outcomes, 0, None, None).is_none());

        outcomes.push(outcome(true));
        outcomes.push(outcome(true));
        assert!(evaluator.evaluate(&outcomes, 100, None, None).is_none());

        outcomes.push(outcome(false));
        outcomes.push(outcome(false));
        // Counter was reset by the healthy tick, so this breach alone
        // should not fire yet even though it is the second breaching window.
        assert!(evaluator.evaluate(&outcomes, 200, None, None).is_none());
    }

    #[test]
    fn reset_shrinking_outcomes_clears_buffer_and_counters() {
        let mut evaluator = Evaluator::new(vec![error_rate_condition()], vec![]);
        let many = vec![outcome(false), outcome(false), outcome(false)];
        evaluator.evaluate(&many, 1000, None, None);
        let fewer = vec![outcome(false)];
        // Shrinking signals a Reset on the telemetry provider.
        let result = evaluator.evaluate(&fewer, 1100, None, None);
        assert!(result.is_none());
    }

    #[test]
    fn zero_total_ops_resets_counter_without_firing() {
        let mut evaluator = Evaluator::new(vec![error_rate_condition()], vec![]);
        let result = evaluator.evaluate(&[], 1000, None, None);
        assert!(result.is_none());
    }

    struct FixedSource {
        outcomes: Vec<OperationOutcome>,
    }

    impl EvaluationSource for FixedSource {
        fn outcomes(&self) -> Vec<OperationOutcome> {
            self.outcomes.clone()
        }
    }

    #[tokio::test]
    async fn runner_start_stop_is_idempotent_and_stop_blocks_until_exit() {
        let source = Arc::new(FixedSource { outcomes: vec![] });
        let runner = Arc::new(EvaluatorRunner::new(
            Evaluator::new(vec![error_rate_condition()], vec![]),
            source,
            Duration::from_millis(5),
        ));
        runner.start().await;
        runner.start().await;
        runner.stop().await;
        runner.stop().await;
    }

    #[tokio::test]
    async fn runner_fires_on_trigger_once_sustain_windows_are_met() {
        let source = Arc::new(FixedSource {
            outcomes: vec![outcome(false), outcome(false)],
        });
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let runner = Arc::new(
            EvaluatorRunner::new(
                Evaluator::new(vec![error_rate_condition()], vec![]),
                source,
                Duration::from_millis(5),
            )
            .with_on_trigger(Arc::new(move |_trigger| {
                fired2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })),
        );
        runner.tick().await;
        runner.tick().await;
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst) >= 1);
    }

    #[test]
    fn stall_condition_takes_precedence_over_min_events() {
        let streaming = vec![
            StreamingCondition {
                id: "stall".into(),
                max_stall_seconds: Some(5.0),
                min_events_per_second: None,
            },
            StreamingCondition {
                id: "eps".into(),
                max_stall_seconds: None,
                min_events_per_second: Some(10.0),
            },
        ];
        let mut evaluator = Evaluator::new(vec![], streaming);
        let trigger = evaluator
            .evaluate(&[], 1000, Some(6.0), Some(1.0))
            .expect("should fire");
        assert_eq!(trigger.condition_id, "stall");
    }
}
