//! # Allocator — descending-capacity bin-pack of VUs across workers
//!
//! Pure computation: given a target VU count and a candidate worker set, it
//! produces contiguous, non-overlapping [`Assignment`]s covering `[0, N)`.
//! It never talks to the [`LeaseManager`](crate::scheduler::lease::LeaseManager) —
//! issuing a lease for the assignment is the caller's job.

use crate::error::{CoreError, CoreResult};
use crate::ids::{RunId, StageId, WorkerId};
use crate::scheduler::registry::Registry;
use std::collections::HashSet;
use std::ops::Range;

/// A contiguous slice of the VU ID space delegated to one worker for one
/// stage of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub run_id: RunId,
    pub stage_id: StageId,
    pub worker_id: WorkerId,
    pub vuid_range: Range<u64>,
}

/// Half-open interval overlap: `[a,b) ∩ [c,d) ≠ ∅ iff a<d ∧ c<b`. An empty
/// range (`start >= end`) never overlaps anything. Shared by the allocator's
/// own invariants and the lease manager's non-overlap check (spec.md §9).
pub fn ranges_overlap(a: &Range<u64>, b: &Range<u64>) -> bool {
    if a.start >= a.end || b.start >= b.end {
        return false;
    }
    a.start < b.end && b.start < a.end
}

pub struct Allocator;

impl Allocator {
    /// Bin-pack `target_vus` across `candidates`, descending by each
    /// candidate's current `EffectiveCapacity.max_vus`. Saturated workers
    /// (effective capacity 0) contribute nothing and are effectively
    /// skipped. Returns assignments whose ranges are contiguous, strictly
    /// increasing and cover exactly `[0, target_vus)`.
    pub fn allocate(
        registry: &Registry,
        run_id: RunId,
        stage_id: StageId,
        target_vus: u64,
        candidates: &[WorkerId],
    ) -> CoreResult<Vec<Assignment>> {
        if target_vus == 0 {
            return Err(CoreError::InvalidTargetVUs(0));
        }
        if candidates.is_empty() {
            return Err(CoreError::NoWorkersAvailable);
        }

        let mut capacities = Vec::with_capacity(candidates.len());
        let mut total: u64 = 0;
        for worker_id in candidates {
            let worker = registry
                .get_worker(worker_id)
                .map_err(|_| CoreError::WorkerNotInRegistry(worker_id.to_string()))?;
            let max_vus = worker.effective_capacity.max_vus;
            total += max_vus;
            capacities.push((worker_id.clone(), max_vus));
        }

        if total < target_vus {
            return Err(CoreError::InsufficientCapacity {
                needed: target_vus,
                available: total,
            });
        }

        // Descending by capacity; ties broken by original (registration)
        // order via a stable sort, so the first worker to register wins ties.
        capacities.sort_by(|a, b| b.1.cmp(&a.1));

        let mut assignments = Vec::new();
        let mut cursor = 0u64;
        let mut remaining = target_vus;
        for (worker_id, max_vus) in capacities {
            if remaining == 0 {
                break;
            }
            if max_vus == 0 {
                continue;
            }
            let grant = max_vus.min(remaining);
            assignments.push(Assignment {
                run_id: run_id.clone(),
                stage_id: stage_id.clone(),
                worker_id,
                vuid_range: cursor..cursor + grant,
            });
            cursor += grant;
            remaining -= grant;
        }
        Ok(assignments)
    }

    /// Recompute assignments for all registered workers minus an explicit
    /// exclude set — used when reallocating after a worker is lost.
    pub fn reallocate(
        registry: &Registry,
        run_id: RunId,
        stage_id: StageId,
        target_vus: u64,
        exclude: &HashSet<WorkerId>,
    ) -> CoreResult<Vec<Assignment>> {
        let all = registry.list_workers().map_err(|_| CoreError::NoWorkersAvailable)?;
        let candidates: Vec<WorkerId> = all
            .into_iter()
            .map(|w| w.worker_id)
            .filter(|id| !exclude.contains(id))
            .collect();
        Self::allocate(registry, run_id, stage_id, target_vus, &candidates)
    }
}
