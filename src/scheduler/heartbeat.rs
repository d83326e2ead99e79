//! # HeartbeatMonitor — failure detection by heartbeat age
//!
//! Runs a background tick loop (cooperatively cancelled via
//! [`CancellationToken`]) that scans the [`Registry`] for workers whose last
//! heartbeat is older than the configured timeout, evicts them, and revokes
//! their leases. Declaring a worker dead is strict: age exactly equal to the
//! timeout is still alive (spec.md §4.4, mirrors the registry's strict `>`
//! saturation-entry comparisons in [`crate::scheduler::registry`]).
//!
//! Eviction order is a contract callers may depend on:
//! 1. snapshot the run IDs the worker was serving via `list_worker_run_ids`
//! 2. `revoke_worker_leases`
//! 3. `remove_worker`
//! 4. invoke `on_worker_lost`
//!
//! followed unconditionally by an `expire_leases()` sweep, so a lease that
//! expired on its own TTL (no worker loss involved) is cleaned up on the same
//! cadence.

use crate::scheduler::lease::LeaseManager;
use crate::scheduler::registry::Registry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatMonitorConfig {
    /// A worker is declared dead once `now - last_heartbeat > timeout`.
    pub timeout: Duration,
    /// How often the monitor scans the registry.
    pub interval: Duration,
}

impl Default for HeartbeatMonitorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            interval: Duration::from_secs(10),
        }
    }
}

/// Callback invoked once per worker declared dead, after its leases are
/// revoked and it has been removed from the registry.
pub type OnWorkerLost = Arc<dyn Fn(&str, &[String]) + Send + Sync>;

pub struct HeartbeatMonitor {
    registry: Registry,
    leases: LeaseManager,
    config: HeartbeatMonitorConfig,
    on_worker_lost: Option<OnWorkerLost>,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    pub fn new(registry: Registry, leases: LeaseManager, config: HeartbeatMonitorConfig) -> Self {
        Self {
            registry,
            leases,
            config,
            on_worker_lost: None,
            token: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn with_on_worker_lost(mut self, callback: OnWorkerLost) -> Self {
        self.on_worker_lost = Some(callback);
        self
    }

    /// One scan-and-evict pass. Exposed standalone so tests and callers that
    /// manage their own scheduling loop can drive it deterministically.
    pub fn tick(&self) {
        let Ok(workers) = self.registry.list_workers() else {
            return;
        };
        let now = Instant::now();
        for worker in workers {
            let age = now.saturating_duration_since(worker.last_heartbeat);
            if age <= self.config.timeout {
                continue;
            }
            let run_ids: Vec<String> = self
                .leases
                .list_worker_run_ids(&worker.worker_id)
                .map(|ids| ids.into_iter().map(|r| r.to_string()).collect())
                .unwrap_or_default();

            let _ = self.leases.revoke_worker_leases(&worker.worker_id);
            let _ = self.registry.remove_worker(&worker.worker_id);

            if let Some(callback) = &self.on_worker_lost {
                callback(worker.worker_id.as_str(), &run_ids);
            }
        }
        let _ = self.leases.expire_leases();
    }

    /// Idempotent: calling `start` while already running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }
        let this = Arc::clone(self);
        let token = self.token.clone();
        let interval = self.config.interval;
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => this.tick(),
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
