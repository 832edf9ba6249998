//! Error types for uagents.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid seed: {0}")]
    InvalidSeed(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Payload error: {0}")]
    Payload(String),

    #[error("Invalid signature: {0}")]
    SignatureInvalid(String),

    #[error("No route to {0}")]
    Resolution(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Incomplete protocol: {0}")]
    IncompleteProtocol(String),

    #[error("Role violation: {0}")]
    RoleViolation(String),

    #[error("Dialogue error: {0}")]
    Dialogue(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}
