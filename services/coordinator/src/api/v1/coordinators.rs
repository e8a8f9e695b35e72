//! Regional coordinator endpoints.
//!
//! Coordinators in other regions register themselves here and discover peers
//! through the bootstrap endpoint. Bootstrap responses are cacheable for the
//! activity window, so churn inside the window is invisible to peers.

use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use swb_id::CoordinatorId;
use tracing::info;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::coordinators::{CoordinatorError, CoordinatorRecord, RegisterCoordinator, SeedNode};
use crate::state::AppState;

/// How long bootstrap responses may be cached, matching the activity window.
const BOOTSTRAP_TTL_SECONDS: u64 = 300;

/// Create coordinator routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(register_coordinator))
        .route("/", get(list_coordinators))
        .route("/bootstrap", get(bootstrap))
}

/// Request to register a regional coordinator.
#[derive(Debug, Deserialize)]
pub struct RegisterCoordinatorRequest {
    /// Stable id for this coordinator. Minted when absent; supplying the
    /// same id again refreshes the existing entry.
    #[serde(default)]
    pub coordinator_id: Option<CoordinatorId>,

    /// Endpoint peers reach this coordinator at.
    pub endpoint: String,

    /// Deployment location label, e.g. "eu-central".
    pub location: String,

    /// Port for the peer discovery protocol, if exposed.
    #[serde(default)]
    pub discovery_port: Option<u16>,
}

/// Response for listing coordinators.
#[derive(Debug, Serialize)]
pub struct ListCoordinatorsResponse {
    pub items: Vec<CoordinatorRecord>,
    pub count: usize,
}

/// Response for the bootstrap endpoint.
#[derive(Debug, Serialize)]
pub struct BootstrapResponse {
    /// Seed nodes for peer discovery.
    pub seeds: Vec<SeedNode>,

    /// How long this response may be cached.
    pub ttl_seconds: u64,

    pub count: usize,
}

/// Register or refresh a regional coordinator.
async fn register_coordinator(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(request): Json<RegisterCoordinatorRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.endpoint.trim().is_empty() {
        return Err(ApiError::bad_request(
            "invalid_coordinator_registration",
            "endpoint must not be empty",
        )
        .with_request_id(&ctx.request_id));
    }

    let record = state
        .coordinators()
        .register(RegisterCoordinator {
            id: request.coordinator_id.unwrap_or_default(),
            endpoint: request.endpoint,
            location: request.location,
            discovery_port: request.discovery_port,
        })
        .await
        .map_err(|e| coordinator_error(e, &ctx.request_id))?;

    info!(
        request_id = %ctx.request_id,
        coordinator_id = %record.id,
        location = %record.location,
        "Coordinator registration accepted"
    );
    Ok((StatusCode::CREATED, Json(record)))
}

/// List active coordinators.
pub(super) async fn list_coordinators(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<Json<ListCoordinatorsResponse>, ApiError> {
    let items = state
        .coordinators()
        .list()
        .await
        .map_err(|e| coordinator_error(e, &ctx.request_id))?;
    let count = items.len();
    Ok(Json(ListCoordinatorsResponse { items, count }))
}

/// Seed nodes for peer discovery, cacheable for the activity window.
async fn bootstrap(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let seeds = state
        .coordinators()
        .bootstrap_seeds()
        .await
        .map_err(|e| coordinator_error(e, &ctx.request_id))?;
    let count = seeds.len();

    let mut response = Json(BootstrapResponse {
        seeds,
        ttl_seconds: BOOTSTRAP_TTL_SECONDS,
        count,
    })
    .into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("max-age=300"),
    );
    Ok(response)
}

fn coordinator_error(err: CoordinatorError, request_id: &str) -> ApiError {
    match err {
        CoordinatorError::Closed => ApiError::service_unavailable(
            "coordinator_registry_unavailable",
            "Coordinator registry is shutting down",
        ),
        CoordinatorError::Store(e) => {
            ApiError::internal("store_error", format!("Store operation failed: {e}"))
        }
    }
    .with_request_id(request_id)
}
