//! # External interface contract
//!
//! Wire shapes for the HTTP endpoints workers call against the control
//! plane. The core only defines these shapes; request routing, auth, and
//! persistence are external collaborators (spec.md §1, §6).

use crate::ids::{LeaseId, WorkerId};
use crate::scheduler::registry::{Capacity, Health, HostInfo};
use crate::transport::outcome::OperationOutcome;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerRequest {
    pub host: HostInfo,
    pub capacity: Capacity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerResponse {
    pub worker_id: WorkerId,
    /// Sent back on subsequent calls as the `X-Worker-Token` header.
    pub worker_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_id: WorkerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<Health>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewLeaseRequest {
    pub lease_id: LeaseId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryIngestRequest {
    pub run_id: String,
    pub operations: Vec<OperationOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryIngestResponse {
    /// Should equal the posted operation count; a mismatch is logged, not
    /// retried (spec.md §6).
    pub accepted: u64,
}

pub const WORKER_TOKEN_HEADER: &str = "X-Worker-Token";
pub const SESSION_TOKEN_HEADER: &str = "X-Session-Token";
pub const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";
