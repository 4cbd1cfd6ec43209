//! Info Endpoints
//!
//! - `/` – identifies the service
//! - `/info` and `/instances/{instance}/info` – public key and epoch of an instance
//! - `/instances` – available instances
//! - `/version` – cargo package name, cargo package version, and the git hash of the build
//!
//! The endpoints include a `Cache-Control: no-cache` header to prevent caching of responses.
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use randsrv_types::api::{InfoResponse, ListInstancesResponse};
use tower_http::set_header::SetResponseHeaderLayer;

use crate::{AppState, services::randomness::RandomnessService};

use super::errors::ApiResult;

/// Create a router containing the info endpoints.
///
/// All endpoints have `Cache-Control: no-cache` set.
pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .route("/info", get(default_instance_info))
        .route("/instances", get(list_instances))
        .route("/instances/{instance}/info", get(instance_info))
        .route("/version", get(version))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ))
}

async fn root() -> impl IntoResponse {
    (StatusCode::OK, "STAR randomness server")
}

async fn default_instance_info(
    State(service): State<RandomnessService>,
) -> ApiResult<Json<InfoResponse>> {
    let instance = service.default_instance().to_owned();
    Ok(Json(service.info(&instance)?))
}

async fn instance_info(
    State(service): State<RandomnessService>,
    Path(instance): Path<String>,
) -> ApiResult<Json<InfoResponse>> {
    Ok(Json(service.info(&instance)?))
}

async fn list_instances(State(service): State<RandomnessService>) -> Json<ListInstancesResponse> {
    Json(service.list_instances())
}

/// Responds with cargo package name, cargo package version, and the git hash of the repository that was used to build the binary
async fn version() -> impl IntoResponse {
    (StatusCode::OK, crate::version_info())
}
