//! Key Sync Endpoint
//!
//! Served by the leader on the internal listener only.
//!
//! - `GET /sync/instances/{instance}/state` – bincode encoded key state of an instance
use axum::{
    Router,
    extract::{Path, State},
    http::header,
    response::IntoResponse,
    routing::get,
};
use eyre::Context as _;

use crate::services::instance_registry::InstanceRegistry;

use super::errors::{ApiErrors, ApiResult};

pub(crate) fn routes() -> Router<InstanceRegistry> {
    Router::new().route("/sync/instances/{instance}/state", get(key_state))
}

async fn key_state(
    State(registry): State<InstanceRegistry>,
    Path(instance): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let oprf_instance = registry
        .get(&instance)
        .ok_or_else(|| ApiErrors::NotFound(format!("instance '{instance}' not found")))?;
    let bytes = {
        let live = oprf_instance.read_key().ok_or_else(|| {
            ApiErrors::ServiceUnavailable(format!("instance '{instance}' is not ready"))
        })?;
        bincode::serialize(&live.handle.export(oprf_instance.schedule(), live.elapsed))
            .context("while serializing key state")?
    };
    tracing::debug!("exported key state of instance {instance}");
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    ))
}
