//! API v1 routes.

mod coordinators;
mod services;
mod workers;

use axum::{routing::get, Router};

use crate::state::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/workers", workers::routes())
        .nest("/services", services::routes())
        .nest("/coordinators", coordinators::routes())
        // Axum does not match trailing slashes against nested "/" routes.
        .route("/coordinators/", get(coordinators::list_coordinators))
}
