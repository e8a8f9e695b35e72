//! Worker API endpoints.
//!
//! Called by workers to join the pool, report liveness, and leave; called by
//! operators to inspect pool state. Worker ids are minted server-side at
//! registration, so a restarted worker always re-enters as a new identity.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use swb_id::WorkerId;
use tracing::info;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::registry::{
    Capabilities, HeartbeatUpdate, NewWorker, RegistryStats, ServiceDescriptor, Tier, WorkerView,
};
use crate::state::AppState;

/// Create worker routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(register_worker))
        .route("/", get(list_workers))
        .route("/stats", get(worker_stats))
        .route("/{worker_id}", get(get_worker).delete(unregister_worker))
        .route("/{worker_id}/heartbeat", post(heartbeat))
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Request to register a worker.
#[derive(Debug, Deserialize)]
pub struct RegisterWorkerRequest {
    /// Hardware capabilities used for tier classification.
    #[serde(default)]
    pub capabilities: Capabilities,

    /// Services this worker provides. At least one is required.
    pub services: Vec<ServiceDescriptor>,

    /// HTTP endpoint requests are forwarded to.
    pub endpoint: String,

    /// Advertised IP address, informational.
    #[serde(default)]
    pub ip_address: Option<String>,

    /// Whether the worker volunteers for the heartbeat-leader role.
    #[serde(default)]
    pub wants_heartbeat_leadership: bool,
}

/// Response for a successful registration.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct RegisterWorkerResponse {
    /// Server-minted worker id.
    pub worker_id: WorkerId,

    /// Assigned capability tier.
    pub tier: Tier,

    /// Interval at which the worker should send heartbeats.
    pub heartbeat_interval_seconds: u64,

    /// Whether this worker was granted the heartbeat-leader role.
    pub leadership_granted: bool,

    /// Number of distinct services registered.
    pub services_registered_count: usize,
}

/// Request for a worker heartbeat. All fields are optional; an empty body is
/// a pure liveness signal.
#[derive(Debug, Default, Deserialize)]
pub struct WorkerHeartbeatRequest {
    /// Self-reported status, e.g. "healthy" or "draining".
    #[serde(default)]
    pub status: Option<String>,

    /// Current load in [0, 1].
    #[serde(default)]
    pub current_load: Option<f64>,

    /// Available memory in bytes.
    #[serde(default)]
    pub available_memory: Option<u64>,
}

/// Response for heartbeat.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct WorkerHeartbeatResponse {
    /// Whether the heartbeat was accepted.
    pub accepted: bool,

    /// Interval at which the worker should keep sending heartbeats.
    pub heartbeat_interval_seconds: u64,
}

/// Response for listing workers.
#[derive(Debug, Serialize)]
pub struct ListWorkersResponse {
    /// List of workers with derived status.
    pub items: Vec<WorkerView>,

    /// Total number of registered workers.
    pub count: usize,
}

// =============================================================================
// Handlers
// =============================================================================

/// Register a worker and mint its id.
async fn register_worker(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(request): Json<RegisterWorkerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let registered = state
        .registry()
        .register(NewWorker {
            capabilities: request.capabilities,
            services: request.services,
            endpoint: request.endpoint,
            ip_address: request.ip_address,
            wants_heartbeat_leadership: request.wants_heartbeat_leadership,
        })
        .await
        .map_err(|e| ApiError::from_registry(e, &ctx.request_id))?;

    info!(
        request_id = %ctx.request_id,
        worker_id = %registered.worker_id,
        "Worker registration accepted"
    );

    Ok((
        StatusCode::CREATED,
        Json(RegisterWorkerResponse {
            worker_id: registered.worker_id,
            tier: registered.tier,
            heartbeat_interval_seconds: registered.heartbeat_interval.as_secs(),
            leadership_granted: registered.leadership_granted,
            services_registered_count: registered.services_registered,
        }),
    ))
}

/// Record a heartbeat for a worker.
async fn heartbeat(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(worker_id): Path<String>,
    Json(request): Json<WorkerHeartbeatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let worker_id = parse_worker_id(&worker_id, &ctx)?;

    state
        .registry()
        .heartbeat(
            worker_id,
            HeartbeatUpdate {
                status: request.status,
                current_load: request.current_load,
                available_memory: request.available_memory,
            },
        )
        .await
        .map_err(|e| ApiError::from_registry(e, &ctx.request_id))?;

    Ok(Json(WorkerHeartbeatResponse {
        accepted: true,
        heartbeat_interval_seconds: state.registry().heartbeat_interval().as_secs(),
    }))
}

/// Remove a worker from the pool. Idempotent.
async fn unregister_worker(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(worker_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let worker_id = parse_worker_id(&worker_id, &ctx)?;

    state
        .registry()
        .unregister(worker_id)
        .await
        .map_err(|e| ApiError::from_registry(e, &ctx.request_id))?;

    info!(request_id = %ctx.request_id, worker_id = %worker_id, "Worker unregistered");
    Ok(StatusCode::NO_CONTENT)
}

/// Get a single worker with derived status.
async fn get_worker(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(worker_id): Path<String>,
) -> Result<Json<WorkerView>, ApiError> {
    let worker_id = parse_worker_id(&worker_id, &ctx)?;

    match state.registry().get(worker_id).await {
        Some(view) => Ok(Json(view)),
        None => Err(ApiError::not_found(
            "worker_not_found",
            format!("Worker {worker_id} is not registered"),
        )
        .with_request_id(&ctx.request_id)),
    }
}

/// List all registered workers with derived status.
async fn list_workers(State(state): State<AppState>) -> Json<ListWorkersResponse> {
    let items = state.registry().list().await;
    let count = items.len();
    Json(ListWorkersResponse { items, count })
}

/// Aggregate pool statistics.
async fn worker_stats(State(state): State<AppState>) -> Json<RegistryStats> {
    Json(state.registry().stats().await)
}

fn parse_worker_id(raw: &str, ctx: &RequestContext) -> Result<WorkerId, ApiError> {
    raw.parse().map_err(|_| {
        ApiError::bad_request("invalid_worker_id", format!("'{raw}' is not a worker id"))
            .with_request_id(&ctx.request_id)
    })
}
