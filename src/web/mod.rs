//! Inbound HTTP endpoint (Axum).

pub(crate) mod router;
pub(crate) mod server;
pub(crate) mod submit;

pub(crate) use server::{serve, ServerState};
