//! Health Check Endpoints
//!
//! This module defines the health check endpoints for the randomness server.
//!
//! - `/health` – general health check
//! - `/health/ready` – readiness check, `503` until every instance has a live key
//! - `/health/live` – liveness check
//!
//! The endpoints include a `Cache-Control: no-cache` header to prevent caching of responses.
use axum::{
    Router,
    extract::State,
    http::{HeaderValue, StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use tower_http::set_header::SetResponseHeaderLayer;

use crate::{AppState, services::instance_registry::InstanceRegistry};

/// Create a router containing the health endpoints.
///
/// All endpoints have `Cache-Control: no-cache` set.
pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
        .route("/health/live", get(live))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "healthy")
}

async fn ready(State(registry): State<InstanceRegistry>) -> impl IntoResponse {
    if registry.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}

async fn live() -> impl IntoResponse {
    (StatusCode::OK, "live")
}
