//! # Scheduling core
//!
//! Worker registry, bin-pack allocator, lease custody and heartbeat-based
//! failure detection. See spec.md §4.

pub mod allocator;
pub mod heartbeat;
pub mod lease;
pub mod registry;

pub use allocator::{ranges_overlap, Allocator, Assignment};
pub use heartbeat::{HeartbeatMonitor, HeartbeatMonitorConfig, OnWorkerLost};
pub use lease::{Lease, LeaseManager, LeaseState};
pub use registry::{Capacity, Health, HostInfo, Registry, WorkerInfo};
