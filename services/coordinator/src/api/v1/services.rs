//! Service directory and invocation endpoints.
//!
//! `GET /v1/services` lists the directory with health counts. The invoke
//! routes accept any method and forward the request body, headers, and query
//! string to a healthy worker for the named service.

use axum::{
    body::Body,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, Method, Response},
    routing::{any, get},
    Json, Router,
};
use bytes::Bytes;
use serde::Serialize;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::proxy::ProxyRequest;
use crate::registry::ServiceStatus;
use crate::state::AppState;

/// Create service routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_services))
        .route("/{name}/invoke", any(invoke_root))
        .route("/{name}/invoke/{*path}", any(invoke_path))
}

/// Response for listing services.
#[derive(Debug, Serialize)]
pub struct ListServicesResponse {
    /// Directory entries with provider counts.
    pub items: Vec<ServiceStatus>,

    /// Number of directory entries.
    pub count: usize,
}

/// List the service directory with per-service health counts.
async fn list_services(State(state): State<AppState>) -> Json<ListServicesResponse> {
    let items = state.registry().service_overview().await;
    let count = items.len();
    Json(ListServicesResponse { items, count })
}

/// Invoke a service at its root path.
async fn invoke_root(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response<Body>, ApiError> {
    forward(state, ctx, name, String::new(), query, method, headers, body).await
}

/// Invoke a service at a sub-path.
#[allow(clippy::too_many_arguments)]
async fn invoke_path(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((name, path)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response<Body>, ApiError> {
    forward(state, ctx, name, path, query, method, headers, body).await
}

#[allow(clippy::too_many_arguments)]
async fn forward(
    state: AppState,
    ctx: RequestContext,
    service: String,
    path: String,
    query: Option<String>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response<Body>, ApiError> {
    let upstream = state
        .proxy()
        .invoke(
            state.registry(),
            ProxyRequest {
                service,
                path,
                query,
                method,
                headers,
                body,
            },
        )
        .await
        .map_err(|e| ApiError::from_proxy(e, &ctx.request_id))?;

    let mut response = Response::builder()
        .status(upstream.status)
        .body(Body::from(upstream.body))
        .map_err(|e| {
            ApiError::internal("response_build_failed", e.to_string())
                .with_request_id(&ctx.request_id)
        })?;
    *response.headers_mut() = upstream.headers;
    Ok(response)
}
