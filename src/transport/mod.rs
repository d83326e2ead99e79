//! # Transport core: HTTP + SSE + JSON-RPC
//!
//! Issues MCP-style operations against the upstream service and captures
//! detailed per-request telemetry. See spec.md §4.5.

pub mod client;
pub mod dialer;
pub mod errors;
pub mod jsonrpc;
pub mod outcome;
pub mod sse;

pub use client::{Connection, TransportConfig};
pub use dialer::{is_blocked_ip, redirect_allowed, DialerConfig, RedirectPolicy, MAX_REDIRECT_HOPS};
pub use errors::{attribute, Attribution, ErrorKind, FailureBucket, OperationError};
pub use jsonrpc::{JsonRpcRequest, JsonRpcResponse};
pub use outcome::{GapHistogram, OperationOutcome, PhaseTiming, StreamSignals};
