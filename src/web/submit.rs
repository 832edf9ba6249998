//! `POST /submit`: inbound envelopes for the agents behind this endpoint.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tokio::sync::oneshot;

use super::server::ServerState;
use crate::context::SyncReply;
use crate::protocol::{
    unix_now, Envelope, IncomingMessage, CONNECTION_HEADER, ENVELOPE_VERSION, SYNC_CONNECTION,
};

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn is_sync(headers: &HeaderMap) -> bool {
    headers
        .get(CONNECTION_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case(SYNC_CONNECTION))
}

/// Accept one envelope. With the sync header the response carries the
/// handler's reply envelope (`204` when it sends none).
pub(crate) async fn submit(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let envelope: Envelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => return error(StatusCode::BAD_REQUEST, format!("invalid envelope: {}", e)),
    };

    if envelope.version != ENVELOPE_VERSION {
        return error(
            StatusCode::BAD_REQUEST,
            format!("unsupported envelope version {}", envelope.version),
        );
    }

    let Some(runtime) = state.get(&envelope.target) else {
        tracing::debug!(target_agent = %envelope.target, "Envelope for unknown agent");
        return error(StatusCode::NOT_FOUND, "unknown target");
    };

    if envelope.is_expired(unix_now()) {
        tracing::warn!(agent = %runtime.name, sender = %envelope.sender, "Dropping expired envelope");
        return error(StatusCode::BAD_REQUEST, "envelope expired");
    }

    match &envelope.signature {
        Some(_) if !envelope.verify() => {
            tracing::warn!(agent = %runtime.name, sender = %envelope.sender, "Invalid envelope signature");
            return error(StatusCode::UNAUTHORIZED, "invalid signature");
        }
        None if !runtime.protocols.allows_unverified(&envelope.schema_digest) => {
            return error(StatusCode::UNAUTHORIZED, "unsigned envelope");
        }
        _ => {}
    }

    let message = match IncomingMessage::from_envelope(&envelope) {
        Ok(message) => message,
        Err(e) => return error(StatusCode::BAD_REQUEST, e.to_string()),
    };

    if !is_sync(&headers) {
        if !runtime.deliver(message, None) {
            return error(StatusCode::SERVICE_UNAVAILABLE, "agent is not running");
        }
        return (StatusCode::OK, Json(json!({}))).into_response();
    }

    let (tx, rx) = oneshot::channel();
    if !runtime.deliver(message, Some(SyncReply::new(tx))) {
        return error(StatusCode::SERVICE_UNAVAILABLE, "agent is not running");
    }
    match tokio::time::timeout(state.response_timeout, rx).await {
        Ok(Ok(reply)) => (StatusCode::OK, Json(reply)).into_response(),
        Ok(Err(_)) => StatusCode::NO_CONTENT.into_response(),
        Err(_) => error(StatusCode::GATEWAY_TIMEOUT, "timed out waiting for response"),
    }
}
