//! # loadcore
//!
//! The engineering-heavy substrate of a distributed load-generation
//! harness: a scheduling core (worker registry, VU allocator, leases,
//! heartbeat-based failure detection), a transport core (HTTP + SSE +
//! JSON-RPC against an MCP-style upstream service), a telemetry and
//! stop-condition core, and a worker telemetry shipper.
//!
//! CLI argument parsing, config file loading, report rendering, and the
//! scenario DSL are external collaborators layered on top of this crate.

pub mod app;
pub mod contract;
pub mod error;
pub mod ids;
pub mod scheduler;
pub mod shipper;
pub mod telemetry;
pub mod transport;

pub use error::{CoreError, CoreResult};
