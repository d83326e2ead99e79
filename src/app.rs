//! # Control-plane HTTP surface
//!
//! The axum router workers call against (spec.md §6): worker registration,
//! heartbeats, lease renewal, and telemetry ingestion. Kept separate from
//! `main.rs` so integration tests can build and drive the router directly
//! with `tower::ServiceExt::oneshot`, without binding a TCP listener.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::contract::{
    HeartbeatRequest, RegisterWorkerRequest, RegisterWorkerResponse, RenewLeaseRequest,
    TelemetryIngestRequest, TelemetryIngestResponse,
};
use crate::scheduler::{LeaseManager, Registry};
use crate::telemetry::Aggregator;

pub struct AppState {
    pub registry: Registry,
    pub leases: LeaseManager,
    pub aggregator: Aggregator,
}

async fn register_worker(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterWorkerRequest>,
) -> Result<Json<RegisterWorkerResponse>, StatusCode> {
    let worker_id = state
        .registry
        .register(req.host, req.capacity)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(RegisterWorkerResponse {
        worker_token: worker_id.to_string(),
        worker_id,
    }))
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HeartbeatRequest>,
) -> StatusCode {
    match state.registry.heartbeat(&req.worker_id, req.health) {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(_) => StatusCode::NOT_FOUND,
    }
}

async fn renew_lease(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RenewLeaseRequest>,
) -> StatusCode {
    match state.leases.renew_lease(&req.lease_id) {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(_) => StatusCode::GONE,
    }
}

async fn ingest_telemetry(
    State(state): State<Arc<AppState>>,
    Path(_worker_id): Path<String>,
    Json(req): Json<TelemetryIngestRequest>,
) -> Json<TelemetryIngestResponse> {
    let accepted = req.operations.len() as u64;
    for outcome in req.operations {
        state.aggregator.add_operation(outcome);
    }
    Json(TelemetryIngestResponse { accepted })
}

/// Body size cap and request timeout applied to every route, not just
/// telemetry ingestion (spec.md §6) — a slow or oversized request on any
/// worker-facing route should fail the same way.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/workers/register", post(register_worker))
        .route("/workers/heartbeat", post(heartbeat))
        .route("/leases/renew", post(renew_lease))
        .route("/workers/{worker_id}/telemetry", post(ingest_telemetry))
        .route("/healthz", get(|| async { StatusCode::OK }))
        .with_state(state)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(CatchPanicLayer::new())
        .layer(RequestBodyLimitLayer::new(8 * 1024 * 1024))
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(30)))
}
