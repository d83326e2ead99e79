//! # LeaseManager — custody of time-bounded VU-range grants
//!
//! A [`Lease`] binds a worker to an [`Assignment`] (spec.md §4.2) for a
//! bounded time. The manager enforces that active leases for the same
//! `(RunID, StageID)` never overlap in VUID space, and sweeps expired or
//! operator-revoked leases.
//!
//! ## Data Flow
//!
//! ```text
//! Allocator → Assignment → LeaseManager::issue_lease() → Lease{active}
//! Worker → renew_lease() every < TTL → ExpiresAt pushed forward
//! HeartbeatMonitor → revoke_worker_leases() on worker loss
//! Evaluator → revoke_leases_by_run() on stop-condition trigger
//! ```

use crate::error::{CoreError, CoreResult};
use crate::ids::{LeaseId, RunId, StageId, WorkerId};
use crate::scheduler::allocator::{ranges_overlap, Assignment};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Active,
    Revoked,
    Expired,
}

#[derive(Debug, Clone)]
pub struct Lease {
    pub lease_id: LeaseId,
    pub worker_id: WorkerId,
    pub assignment: Assignment,
    pub state: LeaseState,
    pub issued_at: Instant,
    pub expires_at: Instant,
    pub revoked_at: Option<Instant>,
}

struct ManagerState {
    leases: HashMap<LeaseId, Lease>,
    closed: bool,
}

/// Custodian of all leases issued by one control plane. TTL is fixed per
/// manager instance (spec.md does not ask for per-lease TTL overrides).
pub struct LeaseManager {
    inner: Arc<RwLock<ManagerState>>,
    ttl: Duration,
}

impl LeaseManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ManagerState {
                leases: HashMap::new(),
                closed: false,
            })),
            ttl,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ManagerState> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ManagerState> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Issue a lease for `assignment` to `worker_id`. Fails with
    /// [`CoreError::VUIDRangeOverlap`] if any currently-active lease for the
    /// same `(run_id, stage_id)` overlaps the requested VUID range.
    pub fn issue_lease(&self, worker_id: WorkerId, assignment: Assignment) -> CoreResult<LeaseId> {
        let mut state = self.write();
        if state.closed {
            return Err(CoreError::LeaseManagerClosed);
        }
        for lease in state.leases.values() {
            if lease.state != LeaseState::Active {
                continue;
            }
            if lease.assignment.run_id != assignment.run_id
                || lease.assignment.stage_id != assignment.stage_id
            {
                continue;
            }
            if ranges_overlap(&lease.assignment.vuid_range, &assignment.vuid_range) {
                return Err(CoreError::VUIDRangeOverlap);
            }
        }

        let lease_id = LeaseId::new();
        let now = Instant::now();
        state.leases.insert(
            lease_id.clone(),
            Lease {
                lease_id: lease_id.clone(),
                worker_id,
                assignment,
                state: LeaseState::Active,
                issued_at: now,
                expires_at: now + self.ttl,
                revoked_at: None,
            },
        );
        Ok(lease_id)
    }

    /// Push `expires_at` forward by one TTL. Only valid on an active lease.
    pub fn renew_lease(&self, lease_id: &LeaseId) -> CoreResult<()> {
        let mut state = self.write();
        if state.closed {
            return Err(CoreError::LeaseManagerClosed);
        }
        let lease = state
            .leases
            .get_mut(lease_id)
            .ok_or_else(|| CoreError::LeaseNotFound(lease_id.to_string()))?;
        match lease.state {
            LeaseState::Active => {
                lease.expires_at = Instant::now() + self.ttl;
                Ok(())
            }
            LeaseState::Revoked => Err(CoreError::LeaseRevoked(lease_id.to_string())),
            LeaseState::Expired => Err(CoreError::LeaseExpired(lease_id.to_string())),
        }
    }

    /// Idempotent: revoking an already-revoked lease is a no-op and leaves
    /// `revoked_at` untouched.
    pub fn revoke_lease(&self, lease_id: &LeaseId) -> CoreResult<()> {
        let mut state = self.write();
        if state.closed {
            return Err(CoreError::LeaseManagerClosed);
        }
        let lease = state
            .leases
            .get_mut(lease_id)
            .ok_or_else(|| CoreError::LeaseNotFound(lease_id.to_string()))?;
        if lease.state == LeaseState::Active {
            lease.state = LeaseState::Revoked;
            lease.revoked_at = Some(Instant::now());
        }
        Ok(())
    }

    /// Sweep every active lease held by `worker_id` to revoked.
    pub fn revoke_worker_leases(&self, worker_id: &WorkerId) -> CoreResult<usize> {
        let mut state = self.write();
        if state.closed {
            return Err(CoreError::LeaseManagerClosed);
        }
        let now = Instant::now();
        let mut count = 0;
        for lease in state.leases.values_mut() {
            if lease.state == LeaseState::Active && &lease.worker_id == worker_id {
                lease.state = LeaseState::Revoked;
                lease.revoked_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn revoke_leases_by_run(&self, run_id: &RunId) -> CoreResult<usize> {
        let mut state = self.write();
        if state.closed {
            return Err(CoreError::LeaseManagerClosed);
        }
        let now = Instant::now();
        let mut count = 0;
        for lease in state.leases.values_mut() {
            if lease.state == LeaseState::Active && &lease.assignment.run_id == run_id {
                lease.state = LeaseState::Revoked;
                lease.revoked_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn revoke_leases_by_run_and_stage(
        &self,
        run_id: &RunId,
        stage_id: &StageId,
    ) -> CoreResult<usize> {
        let mut state = self.write();
        if state.closed {
            return Err(CoreError::LeaseManagerClosed);
        }
        let now = Instant::now();
        let mut count = 0;
        for lease in state.leases.values_mut() {
            if lease.state == LeaseState::Active
                && &lease.assignment.run_id == run_id
                && &lease.assignment.stage_id == stage_id
            {
                lease.state = LeaseState::Revoked;
                lease.revoked_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn get_lease(&self, lease_id: &LeaseId) -> CoreResult<Lease> {
        let state = self.read();
        if state.closed {
            return Err(CoreError::LeaseManagerClosed);
        }
        state
            .leases
            .get(lease_id)
            .cloned()
            .ok_or_else(|| CoreError::LeaseNotFound(lease_id.to_string()))
    }

    pub fn list_leases(&self, run_id: &RunId) -> CoreResult<Vec<Lease>> {
        let state = self.read();
        if state.closed {
            return Err(CoreError::LeaseManagerClosed);
        }
        Ok(state
            .leases
            .values()
            .filter(|l| &l.assignment.run_id == run_id)
            .cloned()
            .collect())
    }

    pub fn list_worker_run_ids(&self, worker_id: &WorkerId) -> CoreResult<Vec<RunId>> {
        let state = self.read();
        if state.closed {
            return Err(CoreError::LeaseManagerClosed);
        }
        let mut run_ids: Vec<RunId> = state
            .leases
            .values()
            .filter(|l| l.state == LeaseState::Active && &l.worker_id == worker_id)
            .map(|l| l.assignment.run_id.clone())
            .collect();
        run_ids.sort();
        run_ids.dedup();
        Ok(run_ids)
    }

    /// One sweep: transition every active lease whose `expires_at` is in the
    /// past to expired. Returns the IDs transitioned this call.
    pub fn expire_leases(&self) -> CoreResult<Vec<LeaseId>> {
        let mut state = self.write();
        if state.closed {
            return Err(CoreError::LeaseManagerClosed);
        }
        let now = Instant::now();
        let mut expired = Vec::new();
        for lease in state.leases.values_mut() {
            if lease.state == LeaseState::Active && now > lease.expires_at {
                lease.state = LeaseState::Expired;
                expired.push(lease.lease_id.clone());
            }
        }
        Ok(expired)
    }

    /// Idempotent. Clears the internal map; later mutating calls fail
    /// `LeaseManagerClosed`.
    pub fn close(&self) {
        let mut state = self.write();
        state.leases.clear();
        state.closed = true;
    }
}

impl Clone for LeaseManager {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            ttl: self.ttl,
        }
    }
}
