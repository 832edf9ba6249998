//! Signed, addressed envelopes: the unit transmitted between agents.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identity::{verify_digest, Identity};
use crate::model::{schema_digest, Model};

/// Current wire format version.
pub const ENVELOPE_VERSION: u32 = 1;

/// Wire envelope carrying one base64-encoded JSON message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Wire format version
    pub version: u32,
    /// Sender agent address
    pub sender: String,
    /// Target agent address
    pub target: String,
    /// Session correlating a request/response pair or a dialogue run
    pub session: Uuid,
    /// Digest of the model the payload decodes to
    pub schema_digest: String,
    /// Digest of the protocol the message belongs to
    #[serde(default)]
    pub protocol_digest: Option<String>,
    /// Base64 of the JSON payload; absent for zero-payload messages
    #[serde(default)]
    pub payload: Option<String>,
    /// Expiry (unix seconds)
    #[serde(default)]
    pub expires: Option<u64>,
    /// Sender signature over `digest()`
    #[serde(default)]
    pub signature: Option<String>,
}

impl Envelope {
    pub fn new(
        sender: impl Into<String>,
        target: impl Into<String>,
        session: Uuid,
        schema_digest: impl Into<String>,
    ) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            sender: sender.into(),
            target: target.into(),
            session,
            schema_digest: schema_digest.into(),
            protocol_digest: None,
            payload: None,
            expires: None,
            signature: None,
        }
    }

    /// Build an unsigned envelope carrying `message`.
    pub fn for_message<M: Model>(
        sender: impl Into<String>,
        target: impl Into<String>,
        session: Uuid,
        message: &M,
    ) -> Result<Self> {
        let mut envelope = Self::new(sender, target, session, schema_digest::<M>()?);
        envelope.encode_payload(message)?;
        Ok(envelope)
    }

    /// Serialize `value` to JSON and store it base64-encoded.
    pub fn encode_payload<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.set_payload_json(&json);
        Ok(())
    }

    /// Store an already serialized JSON payload.
    pub fn set_payload_json(&mut self, json: &str) {
        self.payload = Some(B64.encode(json.as_bytes()));
    }

    /// The JSON text of the payload, or `None` when there is none.
    pub fn decode_payload(&self) -> Result<Option<String>> {
        let Some(encoded) = &self.payload else {
            return Ok(None);
        };
        let bytes = B64
            .decode(encoded)
            .map_err(|e| Error::Payload(format!("invalid base64: {}", e)))?;
        let json = String::from_utf8(bytes)
            .map_err(|e| Error::Payload(format!("payload is not UTF-8: {}", e)))?;
        Ok(Some(json))
    }

    /// Decode the payload into a typed value.
    pub fn decode_payload_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match self.decode_payload()? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// SHA-256 over sender, target, session, schema digest, payload and
    /// expiry, in that order. Variable-length fields carry a big-endian
    /// `u64` length prefix and optional fields a presence byte, so bytes
    /// cannot migrate between neighbouring fields.
    pub fn digest(&self) -> [u8; 32] {
        fn field(hasher: &mut Sha256, bytes: &[u8]) {
            hasher.update((bytes.len() as u64).to_be_bytes());
            hasher.update(bytes);
        }

        let mut hasher = Sha256::new();
        field(&mut hasher, self.sender.as_bytes());
        field(&mut hasher, self.target.as_bytes());
        hasher.update(self.session.as_bytes());
        field(&mut hasher, self.schema_digest.as_bytes());
        match &self.payload {
            Some(payload) => {
                hasher.update([1u8]);
                field(&mut hasher, payload.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        match self.expires {
            Some(expires) => {
                hasher.update([1u8]);
                hasher.update(expires.to_be_bytes());
            }
            None => hasher.update([0u8]),
        }
        hasher.finalize().into()
    }

    pub fn sign(&mut self, identity: &Identity) {
        self.signature = Some(identity.sign_digest(&self.digest()));
    }

    /// True only when a signature is present and matches `sender`.
    pub fn verify(&self) -> bool {
        match &self.signature {
            Some(signature) => verify_digest(&self.sender, &self.digest(), signature),
            None => false,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self.expires, Some(expires) if expires < now)
    }
}

/// Builder for creating envelopes with fluent API.
pub struct EnvelopeBuilder {
    sender: String,
    target: Option<String>,
    session: Option<Uuid>,
    schema_digest: Option<String>,
    protocol_digest: Option<String>,
    payload_json: Option<String>,
    ttl_seconds: Option<u64>,
}

impl EnvelopeBuilder {
    /// Start building an envelope from an agent.
    pub fn from(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            target: None,
            session: None,
            schema_digest: None,
            protocol_digest: None,
            payload_json: None,
            ttl_seconds: None,
        }
    }

    pub fn to(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn session(mut self, session: Uuid) -> Self {
        self.session = Some(session);
        self
    }

    pub fn schema_digest(mut self, digest: impl Into<String>) -> Self {
        self.schema_digest = Some(digest.into());
        self
    }

    pub fn protocol_digest(mut self, digest: Option<String>) -> Self {
        self.protocol_digest = digest;
        self
    }

    /// Set the payload from JSON text.
    pub fn payload_json(mut self, json: impl Into<String>) -> Self {
        self.payload_json = Some(json.into());
        self
    }

    /// Expire `seconds` from now.
    pub fn ttl(mut self, seconds: u64) -> Self {
        self.ttl_seconds = Some(seconds);
        self
    }

    /// Build the envelope. A missing session gets a fresh one.
    pub fn build(self) -> Result<Envelope> {
        let target = self
            .target
            .ok_or_else(|| Error::Other("envelope target is required".to_string()))?;
        let schema_digest = self
            .schema_digest
            .ok_or_else(|| Error::Other("envelope schema digest is required".to_string()))?;

        let mut envelope = Envelope::new(
            self.sender,
            target,
            self.session.unwrap_or_else(Uuid::new_v4),
            schema_digest,
        );
        envelope.protocol_digest = self.protocol_digest;
        if let Some(json) = &self.payload_json {
            envelope.set_payload_json(json);
        }
        envelope.expires = self.ttl_seconds.map(|ttl| unix_now() + ttl);
        Ok(envelope)
    }

    /// Build and sign in one step.
    pub fn sign(self, identity: &Identity) -> Result<Envelope> {
        let mut envelope = self.build()?;
        envelope.sign(identity);
        Ok(envelope)
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
