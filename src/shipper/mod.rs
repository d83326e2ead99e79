//! # Worker telemetry shipping
//!
//! Bounded, drop-on-full batcher plus a cancellable retry client shared
//! with other worker-to-control-plane calls. See spec.md §4.10.

pub mod batcher;
pub mod retry;

pub use batcher::{ShipperConfig, ShipperStats, TelemetryShipper};
pub use retry::{post_with_retry, RetryConfig, RetryError};
