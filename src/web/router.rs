//! Route definitions for the inbound endpoint.

use axum::{
    routing::{get, post},
    Router,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use super::server::ServerState;
use super::submit::submit;

/// Largest accepted envelope body.
const MAX_ENVELOPE_BYTES: usize = 1024 * 1024;

const MAX_CONCURRENT_REQUESTS: usize = 256;

/// Create the app router.
pub(crate) fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/submit", post(submit))
        .route("/health", get(health_check))
        .layer(RequestBodyLimitLayer::new(MAX_ENVELOPE_BYTES))
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "OK"
}
