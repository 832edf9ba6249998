//! Delivery status and inbound message types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::envelope::Envelope;
use crate::error::Result;

/// Header marking a request that expects the reply envelope inline.
pub const CONNECTION_HEADER: &str = "x-uagents-connection";
pub const SYNC_CONNECTION: &str = "sync";

/// Outcome of a send.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Handed off, delivery not yet confirmed
    Sent,
    /// Accepted by a local sink or a remote endpoint
    Delivered,
    /// No route, transport error or rejected
    Failed,
}

/// Delivery report returned by every send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MsgStatus {
    pub status: DeliveryStatus,
    pub detail: String,
    pub destination: String,
    pub endpoint: String,
    pub session: Uuid,
}

impl MsgStatus {
    pub fn sent(destination: impl Into<String>, session: Uuid, detail: impl Into<String>) -> Self {
        Self {
            status: DeliveryStatus::Sent,
            detail: detail.into(),
            destination: destination.into(),
            endpoint: String::new(),
            session,
        }
    }

    pub fn delivered(
        destination: impl Into<String>,
        endpoint: impl Into<String>,
        session: Uuid,
    ) -> Self {
        Self {
            status: DeliveryStatus::Delivered,
            detail: "Message successfully delivered".to_string(),
            destination: destination.into(),
            endpoint: endpoint.into(),
            session,
        }
    }

    pub fn failed(destination: impl Into<String>, session: Uuid, detail: impl Into<String>) -> Self {
        Self {
            status: DeliveryStatus::Failed,
            detail: detail.into(),
            destination: destination.into(),
            endpoint: String::new(),
            session,
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.status == DeliveryStatus::Delivered
    }

    pub fn is_failed(&self) -> bool {
        self.status == DeliveryStatus::Failed
    }
}

/// A message handed to an agent, from a local sink or the inbound endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub sender: String,
    pub schema_digest: String,
    /// JSON text of the payload
    pub payload: String,
    pub session: Uuid,
    pub protocol_digest: Option<String>,
    /// Whether the sender is authenticated (signed, or in-process)
    pub verified: bool,
}

impl IncomingMessage {
    /// A trusted in-process message.
    pub fn local(
        sender: impl Into<String>,
        schema_digest: impl Into<String>,
        payload: impl Into<String>,
        session: Uuid,
    ) -> Self {
        Self {
            sender: sender.into(),
            schema_digest: schema_digest.into(),
            payload: payload.into(),
            session,
            protocol_digest: None,
            verified: true,
        }
    }

    /// Decode an envelope. A missing payload becomes an empty JSON object.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        let payload = envelope
            .decode_payload()?
            .unwrap_or_else(|| "{}".to_string());
        Ok(Self {
            sender: envelope.sender.clone(),
            schema_digest: envelope.schema_digest.clone(),
            payload,
            session: envelope.session,
            protocol_digest: envelope.protocol_digest.clone(),
            verified: envelope.verify(),
        })
    }
}
