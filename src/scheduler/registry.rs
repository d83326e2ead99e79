//! # Worker Registry — authoritative worker membership and health
//!
//! Tracks every worker currently registered with the control plane: its
//! declared capacity, its last-observed health sample, and the capacity the
//! allocator is actually allowed to hand out (`EffectiveCapacity`), which is
//! derived from the raw health sample via a hysteretic saturation rule so a
//! worker that briefly spikes to 91% CPU doesn't flap in and out of the pool.
//!
//! ## Data Flow
//!
//! ```text
//! Worker → Register() → WorkerInfo stored, EffectiveCapacity = Capacity
//! Worker → Heartbeat(Health) → LastHeartbeat updated, saturation recomputed
//! Allocator → ListWorkers() → reads EffectiveCapacity to bin-pack VUs
//! HeartbeatMonitor → RemoveWorker() → dead worker pruned
//! ```

use crate::error::{CoreError, CoreResult};
use crate::ids::WorkerId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Declared or observed capacity limits for a worker.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Capacity {
    pub max_vus: u64,
    pub max_concurrent_ops: u64,
    pub max_rps: u64,
}

/// Static identity of the machine a worker runs on.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    pub ip: String,
    pub platform: String,
}

/// The most recent health sample reported by a worker's heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Health {
    pub cpu_percent: f64,
    pub mem_bytes: u64,
    pub active_vus: u64,
    pub active_sessions: u64,
    pub in_flight_ops: u64,
    pub queue_depth: u64,
}

/// Identity and live state of a single registered worker.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub worker_id: WorkerId,
    pub host: HostInfo,
    pub capacity: Capacity,
    pub effective_capacity: Capacity,
    pub saturated: bool,
    pub registered_at: Instant,
    pub last_heartbeat: Instant,
    pub health: Option<Health>,
}

/// Enter saturated when CPU > 90% or VUs at/above declared max; exit only
/// once CPU has dropped below 80% *and* VUs are below the declared max. At
/// the exact boundary values the previous state is preserved — this
/// asymmetry is what produces the 10-point hysteresis band (spec.md §4.1).
fn recompute_saturation(currently_saturated: bool, capacity: Capacity, health: Health) -> bool {
    let enter = health.cpu_percent > 90.0 || health.active_vus >= capacity.max_vus;
    let exit = health.cpu_percent < 80.0 && health.active_vus < capacity.max_vus;
    if enter {
        true
    } else if exit {
        false
    } else {
        currently_saturated
    }
}

fn effective_capacity_for(capacity: Capacity, saturated: bool) -> Capacity {
    if saturated {
        Capacity {
            max_vus: 0,
            max_concurrent_ops: capacity.max_concurrent_ops,
            max_rps: capacity.max_rps,
        }
    } else {
        capacity
    }
}

struct RegistryState {
    workers: HashMap<WorkerId, WorkerInfo>,
    closed: bool,
}

/// The authoritative, concurrency-safe set of registered workers.
///
/// A single `RwLock` guards the whole map — per spec.md §5 the critical
/// sections here are short enough that a single lock is the right choice
/// over finer-grained sharding.
pub struct Registry {
    inner: Arc<RwLock<RegistryState>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryState {
                workers: HashMap::new(),
                closed: false,
            })),
        }
    }

    fn lock_read(&self) -> std::sync::RwLockReadGuard<'_, RegistryState> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryState> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new worker. Mints a fresh [`WorkerId`]; the worker's
    /// initial `EffectiveCapacity` equals its declared capacity and it is
    /// not saturated until its first heartbeat with health says otherwise.
    pub fn register(&self, host: HostInfo, capacity: Capacity) -> CoreResult<WorkerId> {
        let mut state = self.lock_write();
        if state.closed {
            return Err(CoreError::RegistryClosed);
        }
        let worker_id = WorkerId::new();
        let now = Instant::now();
        state.workers.insert(
            worker_id.clone(),
            WorkerInfo {
                worker_id: worker_id.clone(),
                host,
                capacity,
                effective_capacity: capacity,
                saturated: false,
                registered_at: now,
                last_heartbeat: now,
                health: None,
            },
        );
        Ok(worker_id)
    }

    /// Record a heartbeat. If `health` is supplied, it replaces the prior
    /// sample and the saturation rule is recomputed.
    pub fn heartbeat(&self, worker_id: &WorkerId, health: Option<Health>) -> CoreResult<()> {
        let mut state = self.lock_write();
        if state.closed {
            return Err(CoreError::RegistryClosed);
        }
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| CoreError::WorkerNotFound(worker_id.to_string()))?;
        worker.last_heartbeat = Instant::now();
        if let Some(health) = health {
            worker.saturated = recompute_saturation(worker.saturated, worker.capacity, health);
            worker.effective_capacity = effective_capacity_for(worker.capacity, worker.saturated);
            worker.health = Some(health);
        }
        Ok(())
    }

    /// Defensive deep copy of a single worker's state.
    pub fn get_worker(&self, worker_id: &WorkerId) -> CoreResult<WorkerInfo> {
        let state = self.lock_read();
        if state.closed {
            return Err(CoreError::RegistryClosed);
        }
        state
            .workers
            .get(worker_id)
            .cloned()
            .ok_or_else(|| CoreError::WorkerNotFound(worker_id.to_string()))
    }

    /// Defensive deep copies of every registered worker, in insertion-stable
    /// order (sorted by ID for determinism in tests/allocator ties).
    pub fn list_workers(&self) -> CoreResult<Vec<WorkerInfo>> {
        let state = self.lock_read();
        if state.closed {
            return Err(CoreError::RegistryClosed);
        }
        let mut workers: Vec<_> = state.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        Ok(workers)
    }

    pub fn remove_worker(&self, worker_id: &WorkerId) -> CoreResult<()> {
        let mut state = self.lock_write();
        if state.closed {
            return Err(CoreError::RegistryClosed);
        }
        state
            .workers
            .remove(worker_id)
            .map(|_| ())
            .ok_or_else(|| CoreError::WorkerNotFound(worker_id.to_string()))
    }

    pub fn worker_count(&self) -> usize {
        self.lock_read().workers.len()
    }

    /// Idempotent. Once closed, all other operations return `RegistryClosed`.
    pub fn close(&self) {
        self.lock_write().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock_read().closed
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Registry {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostInfo {
        HostInfo {
            hostname: "host1".into(),
            ip: "10.0.0.1".into(),
            platform: "linux".into(),
        }
    }

    fn cap(max_vus: u64) -> Capacity {
        Capacity {
            max_vus,
            max_concurrent_ops: max_vus * 4,
            max_rps: max_vus * 10,
        }
    }

    // ── Registration and lifecycle ──────────────────────────────────

    #[test]
    fn register_then_get_returns_worker() {
        let reg = Registry::new();
        let id = reg.register(host(), cap(100)).unwrap();
        let w = reg.get_worker(&id).unwrap();
        assert_eq!(w.capacity.max_vus, 100);
        assert_eq!(w.effective_capacity.max_vus, 100);
        assert!(!w.saturated);
        assert!(w.health.is_none());
    }

    #[test]
    fn get_worker_unknown_id_fails() {
        let reg = Registry::new();
        let err = reg.get_worker(&WorkerId::new()).unwrap_err();
        assert!(matches!(err, CoreError::WorkerNotFound(_)));
    }

    #[test]
    fn remove_worker_then_get_fails() {
        let reg = Registry::new();
        let id = reg.register(host(), cap(10)).unwrap();
        reg.remove_worker(&id).unwrap();
        assert!(reg.get_worker(&id).is_err());
    }

    #[test]
    fn remove_unknown_worker_fails() {
        let reg = Registry::new();
        assert!(reg.remove_worker(&WorkerId::new()).is_err());
    }

    #[test]
    fn close_is_idempotent_and_rejects_later_ops() {
        let reg = Registry::new();
        reg.close();
        reg.close();
        assert!(matches!(
            reg.register(host(), cap(1)),
            Err(CoreError::RegistryClosed)
        ));
    }

    #[test]
    fn list_workers_returns_defensive_copies() {
        let reg = Registry::new();
        let id = reg.register(host(), cap(50)).unwrap();
        let mut workers = reg.list_workers().unwrap();
        workers[0].capacity.max_vus = 9999;
        // Mutating the returned copy must not affect registry state.
        let w = reg.get_worker(&id).unwrap();
        assert_eq!(w.capacity.max_vus, 50);
    }

    // ── Worker count invariant (spec.md §8) ─────────────────────────

    #[test]
    fn worker_count_equals_registered_minus_removed() {
        let reg = Registry::new();
        let a = reg.register(host(), cap(10)).unwrap();
        let _b = reg.register(host(), cap(10)).unwrap();
        let _c = reg.register(host(), cap(10)).unwrap();
        assert_eq!(reg.worker_count(), 3);
        reg.remove_worker(&a).unwrap();
        assert_eq!(reg.worker_count(), 2);
    }

    // ── Saturation hysteresis (spec.md §8 boundary scenario) ────────

    #[test]
    fn saturation_hysteresis_traversal() {
        let reg = Registry::new();
        let id = reg.register(host(), cap(10)).unwrap();
        let sample = |cpu: f64, vus: u64| Health {
            cpu_percent: cpu,
            mem_bytes: 0,
            active_vus: vus,
            active_sessions: 0,
            in_flight_ops: 0,
            queue_depth: 0,
        };

        // CPU traversal 85 -> 90 -> 91 -> 85 -> 80 -> 79 yields (F,F,T,T,T,F)
        reg.heartbeat(&id, Some(sample(85.0, 0))).unwrap();
        assert!(!reg.get_worker(&id).unwrap().saturated);

        reg.heartbeat(&id, Some(sample(90.0, 0))).unwrap();
        assert!(!reg.get_worker(&id).unwrap().saturated, "exactly 90 preserves state");

        reg.heartbeat(&id, Some(sample(91.0, 0))).unwrap();
        assert!(reg.get_worker(&id).unwrap().saturated);

        reg.heartbeat(&id, Some(sample(85.0, 0))).unwrap();
        assert!(reg.get_worker(&id).unwrap().saturated, "85 is in the hysteresis band");

        reg.heartbeat(&id, Some(sample(80.0, 0))).unwrap();
        assert!(reg.get_worker(&id).unwrap().saturated, "exactly 80 preserves state");

        reg.heartbeat(&id, Some(sample(79.0, 0))).unwrap();
        assert!(!reg.get_worker(&id).unwrap().saturated);
    }

    #[test]
    fn saturated_worker_has_zero_effective_vus() {
        let reg = Registry::new();
        let id = reg.register(host(), cap(10)).unwrap();
        reg.heartbeat(
            &id,
            Some(Health {
                cpu_percent: 95.0,
                mem_bytes: 0,
                active_vus: 0,
                active_sessions: 0,
                in_flight_ops: 0,
                queue_depth: 0,
            }),
        )
        .unwrap();
        let w = reg.get_worker(&id).unwrap();
        assert!(w.saturated);
        assert_eq!(w.effective_capacity.max_vus, 0);
    }

    #[test]
    fn active_vus_at_max_triggers_saturation() {
        let reg = Registry::new();
        let id = reg.register(host(), cap(10)).unwrap();
        reg.heartbeat(
            &id,
            Some(Health {
                cpu_percent: 0.0,
                mem_bytes: 0,
                active_vus: 10,
                active_sessions: 0,
                in_flight_ops: 0,
                queue_depth: 0,
            }),
        )
        .unwrap();
        assert!(reg.get_worker(&id).unwrap().saturated);
    }

    #[test]
    fn heartbeat_without_health_only_updates_timestamp() {
        let reg = Registry::new();
        let id = reg.register(host(), cap(10)).unwrap();
        reg.heartbeat(&id, None).unwrap();
        let w = reg.get_worker(&id).unwrap();
        assert!(w.health.is_none());
        assert!(!w.saturated);
    }

    #[test]
    fn heartbeat_unknown_worker_fails() {
        let reg = Registry::new();
        assert!(matches!(
            reg.heartbeat(&WorkerId::new(), None),
            Err(CoreError::WorkerNotFound(_))
        ));
    }
}
