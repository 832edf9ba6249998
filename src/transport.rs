//! Outbound HTTP delivery of envelopes.

use reqwest::{Client, StatusCode};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::model::Model;
use crate::protocol::{Envelope, EnvelopeBuilder, CONNECTION_HEADER, SYNC_CONNECTION};
use crate::resolver::Resolver;

/// Default lifetime of envelopes built here.
const SYNC_ENVELOPE_TTL_SECS: u64 = 30;

/// POSTs envelopes to agent endpoints.
#[derive(Clone, Debug)]
pub struct Transport {
    client: Client,
}

impl Transport {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Try `endpoints` in order; the first 2xx wins and its URL is returned.
    pub async fn send_envelope(&self, endpoints: &[String], envelope: &Envelope) -> Result<String> {
        if endpoints.is_empty() {
            return Err(Error::Resolution(envelope.target.clone()));
        }

        let mut errors = Vec::new();
        for endpoint in endpoints {
            match self.client.post(endpoint).json(envelope).send().await {
                Ok(response) if response.status().is_success() => return Ok(endpoint.clone()),
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    tracing::debug!(%endpoint, %status, "Endpoint rejected envelope");
                    errors.push(format!("{}: {} {}", endpoint, status, body.trim()));
                }
                Err(e) => {
                    tracing::debug!(%endpoint, "Endpoint unreachable: {}", e);
                    errors.push(format!("{}: {}", endpoint, e));
                }
            }
        }
        Err(Error::Transport(errors.join("; ")))
    }

    /// POST with the sync header and return the inline reply, if any.
    pub async fn send_sync_envelope(
        &self,
        endpoints: &[String],
        envelope: &Envelope,
    ) -> Result<Option<Envelope>> {
        let endpoint = endpoints
            .first()
            .ok_or_else(|| Error::Resolution(envelope.target.clone()))?;

        let response = self
            .client
            .post(endpoint)
            .header(CONNECTION_HEADER, SYNC_CONNECTION)
            .json(envelope)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{}: {}", endpoint, e)))?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => {
                let reply = response
                    .json::<Envelope>()
                    .await
                    .map_err(|e| Error::Transport(format!("invalid reply envelope: {}", e)))?;
                Ok(Some(reply))
            }
            StatusCode::GATEWAY_TIMEOUT => Err(Error::Timeout(format!(
                "{} did not answer in time",
                envelope.target
            ))),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(Error::Transport(format!("{}: {} {}", endpoint, status, body.trim())))
            }
        }
    }
}

/// Query an agent without running one: send a signed message with the sync
/// header and return its verified reply envelope, if it produced one.
///
/// Without an identity a throwaway one signs the request.
pub async fn send_sync_message<M: Model>(
    destination: &str,
    message: &M,
    resolver: &dyn Resolver,
    identity: Option<&Identity>,
    timeout: Duration,
) -> Result<Option<Envelope>> {
    let resolution = resolver.resolve(destination).await;
    if !resolution.is_routable() {
        return Err(Error::Resolution(destination.to_string()));
    }

    let ephemeral;
    let identity = match identity {
        Some(identity) => identity,
        None => {
            ephemeral = Identity::generate();
            &ephemeral
        }
    };

    let envelope = EnvelopeBuilder::from(identity.address())
        .to(resolution.address.as_deref().unwrap_or(destination))
        .session(Uuid::new_v4())
        .schema_digest(M::schema_digest()?)
        .payload_json(serde_json::to_string(message)?)
        .ttl(SYNC_ENVELOPE_TTL_SECS)
        .sign(identity)?;

    let reply = Transport::new(timeout)
        .send_sync_envelope(&resolution.endpoints, &envelope)
        .await?;

    match reply {
        Some(reply) if !reply.verify() => Err(Error::SignatureInvalid(format!(
            "reply from {} failed verification",
            reply.sender
        ))),
        reply => Ok(reply),
    }
}
