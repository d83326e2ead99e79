//! # Core error taxonomy
//!
//! Fallible core operations (registry, lease manager, allocator) return
//! [`CoreError`] rather than `anyhow::Error` — these are data the caller
//! is expected to match on (e.g. `InvalidTargetVUs` vs `InsufficientCapacity`),
//! not opaque failures to log and forget.
//!
//! Per-operation transport/application errors (DNS failures, JSON-RPC error
//! codes, tool errors, ...) are a different concern: they never propagate as
//! Rust errors across component boundaries. They are carried as data inside
//! an [`crate::transport::outcome::OperationOutcome`]. See [`crate::transport::errors`].

use thiserror::Error;

/// Errors returned by the scheduling core (registry, allocator, lease manager).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// The registry has been closed; no further mutations are accepted.
    #[error("registry is closed")]
    RegistryClosed,

    /// The lease manager has been closed; no further mutations are accepted.
    #[error("lease manager is closed")]
    LeaseManagerClosed,

    /// No worker with this ID is known to the registry.
    #[error("worker {0} not found")]
    WorkerNotFound(String),

    /// The allocator was given a worker ID that isn't in the registry.
    #[error("worker {0} not in registry")]
    WorkerNotInRegistry(String),

    /// Target VU count for an allocation was <= 0.
    #[error("invalid target VU count: {0}")]
    InvalidTargetVUs(i64),

    /// The candidate worker set was empty after exclusions.
    #[error("no workers available for allocation")]
    NoWorkersAvailable,

    /// Total effective capacity across candidates is less than the target.
    #[error("insufficient capacity: need {needed}, have {available}")]
    InsufficientCapacity { needed: u64, available: u64 },

    /// A lease was issued that overlaps an existing active lease's VUID range.
    #[error("VUID range overlaps an existing active lease")]
    VUIDRangeOverlap,

    /// No lease with this ID is known.
    #[error("lease {0} not found")]
    LeaseNotFound(String),

    /// The lease is already revoked.
    #[error("lease {0} already revoked")]
    LeaseRevoked(String),

    /// The lease has expired.
    #[error("lease {0} expired")]
    LeaseExpired(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
