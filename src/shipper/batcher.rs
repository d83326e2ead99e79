//! # Worker telemetry shipper
//!
//! Ships [`OperationOutcome`]s from a worker to the control plane without
//! ever stalling VU execution: a bounded channel drops on full (counted),
//! a single shipping task batches per run and flushes on size or a timer
//! (spec.md §4.10).

use crate::ids::RunId;
use crate::shipper::retry::{post_with_retry, RetryConfig};
use crate::transport::outcome::OperationOutcome;
use reqwest::Client;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ShipperConfig {
    pub channel_capacity: usize,
    pub batch_size: usize,
    pub flush_interval: std::time::Duration,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 10_000,
            batch_size: 100,
            flush_interval: std::time::Duration::from_secs(1),
        }
    }
}

#[derive(Serialize)]
struct TelemetryBody<'a> {
    run_id: &'a str,
    operations: &'a [OperationOutcome],
}

struct ShipMessage {
    run_id: RunId,
    outcome: OperationOutcome,
}

/// Drop-on-full health counters, read without blocking the hot path.
#[derive(Default)]
pub struct ShipperStats {
    pub dropped: AtomicU64,
    pub shipped: AtomicU64,
}

pub struct TelemetryShipper {
    control_plane_url: String,
    worker_id: String,
    tx: mpsc::Sender<ShipMessage>,
    stats: Arc<ShipperStats>,
    token: CancellationToken,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    config: ShipperConfig,
}

impl TelemetryShipper {
    /// Spawns the background shipping task immediately — unlike the other
    /// long-running duties, the shipper has no separate `start()`: its
    /// channel must exist before the first `ship()` call.
    pub fn new(control_plane_url: impl Into<String>, worker_id: impl Into<String>, config: ShipperConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let stats = Arc::new(ShipperStats::default());
        let token = CancellationToken::new();

        let shipper = Arc::new(Self {
            control_plane_url: control_plane_url.into(),
            worker_id: worker_id.into(),
            tx,
            stats: Arc::clone(&stats),
            token: token.clone(),
            handle: std::sync::Mutex::new(None),
            config: config.clone(),
        });

        let task_url = shipper.control_plane_url.clone();
        let task_worker_id = shipper.worker_id.clone();
        let task_stats = Arc::clone(&stats);
        let task_token = token.clone();
        let task_config = config.clone();
        let http = Client::new();

        let handle = tokio::spawn(Self::run_shipping_task(
            rx,
            task_url,
            task_worker_id,
            task_stats,
            task_token,
            task_config,
            http,
        ));

        *shipper.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        shipper
    }

    /// Never blocks. Drops the item and increments the drop counter if the
    /// channel is full.
    pub fn ship(&self, run_id: RunId, outcome: OperationOutcome) {
        match self.tx.try_send(ShipMessage { run_id, outcome }) {
            Ok(()) => {}
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn stats(&self) -> (u64, u64) {
        (
            self.stats.dropped.load(Ordering::Relaxed),
            self.stats.shipped.load(Ordering::Relaxed),
        )
    }

    /// Cancel the shipping task, stop the flush timer, drain and flush
    /// remaining items, then return.
    pub async fn close(&self) {
        self.token.cancel();
        let taken = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(h) = taken {
            let _ = h.await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_shipping_task(
        mut rx: mpsc::Receiver<ShipMessage>,
        control_plane_url: String,
        worker_id: String,
        stats: Arc<ShipperStats>,
        token: CancellationToken,
        config: ShipperConfig,
        http: Client,
    ) {
        let mut buffers: HashMap<String, Vec<OperationOutcome>> = HashMap::new();
        let mut ticker = tokio::time::interval(config.flush_interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    Self::flush_all(&http, &control_plane_url, &worker_id, &mut buffers, &stats).await;
                }
                msg = rx.recv() => {
                    match msg {
                        Some(ShipMessage { run_id, outcome }) => {
                            let buf = buffers.entry(run_id.to_string()).or_default();
                            buf.push(outcome);
                            if buf.len() >= config.batch_size {
                                let batch = std::mem::take(buf);
                                Self::flush_one(&http, &control_plane_url, &worker_id, &run_id.to_string(), batch, &stats).await;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        // Drain whatever is left in the channel without blocking further,
        // then flush everything buffered.
        while let Ok(ShipMessage { run_id, outcome }) = rx.try_recv() {
            buffers.entry(run_id.to_string()).or_default().push(outcome);
        }
        Self::flush_all(&http, &control_plane_url, &worker_id, &mut buffers, &stats).await;
    }

    async fn flush_all(
        http: &Client,
        control_plane_url: &str,
        worker_id: &str,
        buffers: &mut HashMap<String, Vec<OperationOutcome>>,
        stats: &Arc<ShipperStats>,
    ) {
        let run_ids: Vec<String> = buffers.keys().cloned().collect();
        for run_id in run_ids {
            if let Some(batch) = buffers.remove(&run_id) {
                if !batch.is_empty() {
                    Self::flush_one(http, control_plane_url, worker_id, &run_id, batch, stats).await;
                }
            }
        }
    }

    async fn flush_one(
        http: &Client,
        control_plane_url: &str,
        worker_id: &str,
        run_id: &str,
        batch: Vec<OperationOutcome>,
        stats: &Arc<ShipperStats>,
    ) {
        let body = TelemetryBody {
            run_id,
            operations: &batch,
        };
        let Ok(encoded) = serde_json::to_vec(&body) else {
            return;
        };
        let posted = batch.len() as u64;
        let url = format!("{control_plane_url}/workers/{worker_id}/telemetry");
        let token = CancellationToken::new();
        match post_with_retry(http, &url, encoded, &RetryConfig::default(), &token, &token).await {
            Ok((status, body)) if (200..300).contains(&status) => {
                stats.shipped.fetch_add(posted, Ordering::Relaxed);
                // A mismatch against the posted count is logged, never
                // retried (spec.md §6) — the batch has already landed.
                match serde_json::from_slice::<crate::contract::TelemetryIngestResponse>(&body) {
                    Ok(resp) if resp.accepted != posted => {
                        tracing::warn!(
                            run_id,
                            posted,
                            accepted = resp.accepted,
                            "telemetry accepted count mismatch"
                        );
                    }
                    _ => {}
                }
            }
            _ => {
                // Non-2xx or transport error: logged, batch dropped, no
                // dead-lettering in core scope (spec.md §4.10).
                tracing::warn!(run_id, count = posted, "telemetry batch dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::WorkerId;

    fn outcome() -> OperationOutcome {
        OperationOutcome::success(RunId::new(), "s".into(), WorkerId::new(), "ping", 1)
    }

    #[tokio::test]
    async fn ship_never_blocks_and_counts_drops_when_full() {
        let shipper = TelemetryShipper::new(
            "http://127.0.0.1:0",
            "wkr_test",
            ShipperConfig {
                channel_capacity: 1,
                batch_size: 100,
                flush_interval: std::time::Duration::from_secs(60),
            },
        );
        let run_id = RunId::new();
        for _ in 0..10 {
            shipper.ship(run_id.clone(), outcome());
        }
        let (dropped, _shipped) = shipper.stats();
        assert!(dropped > 0);
        shipper.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let shipper = TelemetryShipper::new("http://127.0.0.1:0", "wkr_test", ShipperConfig::default());
        shipper.close().await;
        shipper.close().await;
    }

    /// A mismatched `accepted` count is logged (spec.md §6) but the batch
    /// still counts as shipped — it already landed at the control plane.
    #[tokio::test]
    async fn shipped_count_reflects_posted_batch_even_on_accepted_mismatch() {
        use wiremock::matchers::{method, path_regex};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/workers/.*/telemetry$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"accepted": 1})))
            .mount(&server)
            .await;

        let shipper = TelemetryShipper::new(
            server.uri(),
            "wkr_test",
            ShipperConfig {
                channel_capacity: 10,
                batch_size: 3,
                flush_interval: std::time::Duration::from_millis(20),
            },
        );
        let run_id = RunId::new();
        shipper.ship(run_id.clone(), outcome());
        shipper.ship(run_id.clone(), outcome());
        shipper.ship(run_id, outcome());

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let (_dropped, shipped) = shipper.stats();
        assert_eq!(shipped, 3);
        shipper.close().await;
    }
}
