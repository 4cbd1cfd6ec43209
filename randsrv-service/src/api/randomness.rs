//! Randomness Endpoints
//!
//! - `POST /randomness` – evaluates points with the default instance
//! - `POST /instances/{instance}/randomness` – evaluates points with a named instance
//!
//! Points are base64 encoded unless the client asks for `?encoding=hex`. The
//! response uses the encoding of the request.
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State, rejection::QueryRejection},
    routing::post,
};
use randsrv_types::api::{EncodingQuery, RandomnessResponse};

use crate::{AppState, services::randomness::RandomnessService};

use super::errors::{ApiErrors, ApiResult};

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/randomness", post(default_instance_randomness))
        .route(
            "/instances/{instance}/randomness",
            post(instance_randomness),
        )
}

async fn default_instance_randomness(
    State(service): State<RandomnessService>,
    query: Result<Query<EncodingQuery>, QueryRejection>,
    body: Bytes,
) -> ApiResult<Json<RandomnessResponse>> {
    let query = encoding_query(query)?;
    let instance = service.default_instance().to_owned();
    Ok(Json(service.evaluate(&instance, &body, query.encoding)?))
}

async fn instance_randomness(
    State(service): State<RandomnessService>,
    Path(instance): Path<String>,
    query: Result<Query<EncodingQuery>, QueryRejection>,
    body: Bytes,
) -> ApiResult<Json<RandomnessResponse>> {
    let query = encoding_query(query)?;
    Ok(Json(service.evaluate(&instance, &body, query.encoding)?))
}

// axum answers a bad query with plain text, keep the JSON error body instead
fn encoding_query(
    query: Result<Query<EncodingQuery>, QueryRejection>,
) -> Result<EncodingQuery, ApiErrors> {
    query
        .map(|Query(query)| query)
        .map_err(|err| ApiErrors::BadRequest(err.body_text()))
}
