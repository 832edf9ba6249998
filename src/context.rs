//! Per-message execution handle given to handlers.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::agent::runtime::AgentRuntime;
use crate::identity::{is_valid_address, normalize_address};
use crate::model::Model;
use crate::protocol::{Envelope, EnvelopeBuilder, EnvelopeRecord, IncomingMessage, MsgStatus};
use crate::storage::KeyValueStore;

/// One-shot slot for the reply to a synchronous inbound request.
#[derive(Clone, Debug)]
pub(crate) struct SyncReply {
    slot: Arc<Mutex<Option<oneshot::Sender<Envelope>>>>,
}

impl SyncReply {
    pub(crate) fn new(tx: oneshot::Sender<Envelope>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(tx))),
        }
    }

    fn take(&self) -> Option<oneshot::Sender<Envelope>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// The message being handled, when there is one.
#[derive(Clone)]
struct Origin {
    sender: String,
    schema_digest: String,
    replies: Option<BTreeSet<String>>,
    sync_reply: Option<SyncReply>,
}

/// Handle for sending messages and reaching agent storage.
///
/// Contexts are cheap to clone. Each is bound to one session: the session
/// of the message being handled, or a fresh one for intervals and contexts
/// created from the agent.
#[derive(Clone)]
pub struct Context {
    runtime: Arc<AgentRuntime>,
    session: Uuid,
    origin: Option<Origin>,
}

impl Context {
    pub(crate) fn new(runtime: Arc<AgentRuntime>, session: Uuid) -> Self {
        Self {
            runtime,
            session,
            origin: None,
        }
    }

    pub(crate) fn for_message(
        runtime: Arc<AgentRuntime>,
        message: &IncomingMessage,
        replies: Option<BTreeSet<String>>,
        sync_reply: Option<SyncReply>,
    ) -> Self {
        Self {
            runtime,
            session: message.session,
            origin: Some(Origin {
                sender: normalize_address(&message.sender).to_string(),
                schema_digest: message.schema_digest.clone(),
                replies,
                sync_reply,
            }),
        }
    }

    pub fn address(&self) -> &str {
        self.runtime.address()
    }

    pub fn name(&self) -> &str {
        &self.runtime.name
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    /// Sender of the message being handled.
    pub fn sender(&self) -> Option<&str> {
        self.origin.as_ref().map(|o| o.sender.as_str())
    }

    pub fn storage(&self) -> &dyn KeyValueStore {
        self.runtime.storage.as_ref()
    }

    /// Same agent, different session.
    pub fn with_session(&self, session: Uuid) -> Self {
        Self {
            runtime: Arc::clone(&self.runtime),
            session,
            origin: None,
        }
    }

    /// Send a typed message. Failures come back as a `Failed` status.
    pub async fn send<M: Model>(&self, destination: &str, message: &M) -> MsgStatus {
        let schema_digest = match M::schema_digest() {
            Ok(digest) => digest,
            Err(e) => return MsgStatus::failed(destination, self.session, e.to_string()),
        };
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(e) => return MsgStatus::failed(destination, self.session, e.to_string()),
        };
        self.send_raw(destination, &schema_digest, &payload).await
    }

    /// Send an already-encoded JSON payload of the model `schema_digest`.
    pub async fn send_raw(&self, destination: &str, schema_digest: &str, payload: &str) -> MsgStatus {
        let destination = normalize_address(destination);
        let session = self.session;
        let replying = self.origin.as_ref().filter(|o| o.sender == destination);

        if let Some(origin) = replying {
            if let Some(allowed) = &origin.replies {
                if !allowed.contains(schema_digest) {
                    tracing::warn!(
                        agent = %self.runtime.name,
                        %destination,
                        schema_digest,
                        "Reply type not allowed for {}",
                        origin.schema_digest
                    );
                    return MsgStatus::failed(
                        destination,
                        session,
                        format!(
                            "{} is not a valid reply to {}",
                            schema_digest, origin.schema_digest
                        ),
                    );
                }
            }
        }

        if let Err(e) = self
            .runtime
            .protocols
            .check_outbound(self.storage(), session, schema_digest)
        {
            tracing::warn!(agent = %self.runtime.name, %destination, %session, "{}", e);
            return MsgStatus::failed(destination, session, e.to_string());
        }
        let protocol_digest = self.runtime.protocols.protocol_digest_for(schema_digest);

        if let Some(slot) = replying.and_then(|o| o.sync_reply.as_ref()).and_then(SyncReply::take) {
            let envelope = match self.envelope(destination, schema_digest, protocol_digest, payload) {
                Ok(envelope) => envelope,
                Err(status) => return status,
            };
            self.runtime
                .dispatcher
                .record(EnvelopeRecord::from_envelope(&envelope));
            return match slot.send(envelope) {
                Ok(()) => MsgStatus::sent(destination, session, "Reply returned on sync connection"),
                Err(_) => MsgStatus::failed(destination, session, "sync connection closed"),
            };
        }

        if self.runtime.dispatcher.contains(destination) {
            let mut message =
                IncomingMessage::local(self.address(), schema_digest, payload, session);
            message.protocol_digest = protocol_digest;
            self.runtime.dispatcher.dispatch(destination, message).await;
            tracing::debug!(agent = %self.runtime.name, %destination, %session, "Delivered locally");
            return MsgStatus::delivered(destination, "local", session);
        }

        let resolution = self.runtime.resolver.resolve(destination).await;
        if !resolution.is_routable() {
            tracing::warn!(agent = %self.runtime.name, %destination, "No route to destination");
            return MsgStatus::failed(destination, session, "no route");
        }
        let target = resolution.address.as_deref().unwrap_or(destination);

        let envelope = match self.envelope(target, schema_digest, protocol_digest, payload) {
            Ok(envelope) => envelope,
            Err(status) => return status,
        };
        self.runtime
            .dispatcher
            .record(EnvelopeRecord::from_envelope(&envelope));

        match self
            .runtime
            .transport
            .send_envelope(&resolution.endpoints, &envelope)
            .await
        {
            Ok(endpoint) => {
                tracing::debug!(agent = %self.runtime.name, %destination, %endpoint, "Sent envelope");
                MsgStatus::delivered(destination, endpoint, session)
            }
            Err(e) => {
                tracing::warn!(agent = %self.runtime.name, %destination, "Send failed: {}", e);
                MsgStatus::failed(destination, session, e.to_string())
            }
        }
    }

    fn envelope(
        &self,
        target: &str,
        schema_digest: &str,
        protocol_digest: Option<String>,
        payload: &str,
    ) -> std::result::Result<Envelope, MsgStatus> {
        EnvelopeBuilder::from(self.address())
            .to(target)
            .session(self.session)
            .schema_digest(schema_digest)
            .protocol_digest(protocol_digest)
            .payload_json(payload)
            .ttl(self.runtime.settings.envelope_expiry_secs)
            .sign(&self.runtime.identity)
            .map_err(|e| MsgStatus::failed(target, self.session, e.to_string()))
    }

    /// Send `message` and wait up to `timeout` for a reply of type `R` from
    /// the destination in this session. Other messages in the session reach
    /// the handlers as usual. A timeout yields `(None, Failed)`; the waiter
    /// is always cleaned up.
    pub async fn send_and_receive<M: Model, R: Model>(
        &self,
        destination: &str,
        message: &M,
        timeout: Duration,
    ) -> (Option<R>, MsgStatus) {
        let session = self.session;
        let expected = match R::schema_digest() {
            Ok(digest) => digest,
            Err(e) => return (None, MsgStatus::failed(destination, session, e.to_string())),
        };
        let peer = self.peer_address(destination).await;
        let Some(response) = self.runtime.expect_response(&peer, session, &expected) else {
            return (
                None,
                MsgStatus::failed(&peer, session, "a request to this agent is already pending in this session"),
            );
        };

        let status = self.send(&peer, message).await;
        if status.is_failed() {
            self.runtime.cancel_response(&peer, session);
            return (None, status);
        }

        let reply = match tokio::time::timeout(timeout, response).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return (None, MsgStatus::failed(&peer, session, "response channel closed"));
            }
            Err(_) => {
                self.runtime.cancel_response(&peer, session);
                tracing::warn!(agent = %self.runtime.name, destination = %peer, %session, "Timed out waiting for response");
                return (
                    None,
                    MsgStatus::failed(&peer, session, format!("no response within {:?}", timeout)),
                );
            }
        };

        match serde_json::from_str::<R>(&reply.payload) {
            Ok(value) => (Some(value), status),
            Err(e) => (
                None,
                MsgStatus::failed(&peer, session, format!("invalid response payload: {}", e)),
            ),
        }
    }

    /// The agent address replies from `destination` will carry. Names are
    /// resolved first.
    async fn peer_address(&self, destination: &str) -> String {
        let destination = normalize_address(destination);
        if is_valid_address(destination) {
            return destination.to_string();
        }
        self.runtime
            .resolver
            .resolve(destination)
            .await
            .address
            .unwrap_or_else(|| destination.to_string())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("agent", &self.runtime.name)
            .field("session", &self.session)
            .field("sender", &self.sender())
            .finish()
    }
}
