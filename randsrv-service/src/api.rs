//! API module for the randomness server.
//!
//! This module defines all HTTP endpoints of the server and organizes them into submodules:
//!
//! - [`errors`] – Defines API error types and conversions from internal service errors.
//! - [`health`] – Provides health endpoints (`/health`).
//! - [`info`] – Info about instances and the deployment (`/info`, `/instances`, `/version`).
//! - [`randomness`] – Point evaluation (`/randomness`).
//! - [`sync`] – Key state export for followers, internal listener only.

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::{AppState, services::instance_registry::InstanceRegistry};

pub(crate) mod errors;
pub(crate) mod health;
pub(crate) mod info;
pub(crate) mod randomness;
pub(crate) mod sync;

/// Builds the public API router.
pub(crate) fn routes(app_state: AppState) -> Router {
    Router::new()
        .merge(randomness::routes())
        .merge(info::routes())
        .merge(health::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Builds the router of the internal listener.
///
/// Only the leader serves it. It must never be merged into the public router.
pub(crate) fn internal_routes(registry: InstanceRegistry) -> Router {
    sync::routes()
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

#[cfg(test)]
mod tests;
