//! Shared per-agent state and the inbound processing path.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::scheduler::IntervalTask;
use crate::config::AgentSettings;
use crate::context::{Context, SyncReply};
use crate::core::dialogue::TransitionGuard;
use crate::core::protocol::{MessageHandler, Protocol};
use crate::core::{Dispatcher, Sink};
use crate::error::{Error, Result};
use crate::identity::{normalize_address, Identity};
use crate::protocol::IncomingMessage;
use crate::resolver::Resolver;
use crate::storage::KeyValueStore;
use crate::transport::Transport;

/// A message waiting in an agent's inbox.
pub(crate) struct Inbound {
    pub(crate) message: IncomingMessage,
    pub(crate) reply: Option<SyncReply>,
}

/// Where a handled schema digest leads.
#[derive(Clone)]
pub(crate) struct Route {
    pub(crate) protocol: String,
    pub(crate) func: MessageHandler,
    pub(crate) allow_unverified: bool,
    pub(crate) replies: Option<BTreeSet<String>>,
}

#[derive(Default)]
struct TableInner {
    routes: HashMap<String, Route>,
    /// schema digest -> protocol digest, for every model of every protocol
    models: HashMap<String, String>,
    guards: Vec<Arc<dyn TransitionGuard>>,
    /// canonical name -> protocol digest
    protocols: BTreeMap<String, String>,
}

/// The protocols included into one agent.
#[derive(Default)]
pub(crate) struct ProtocolTable {
    inner: RwLock<TableInner>,
}

impl ProtocolTable {
    /// Add `protocol`'s handlers. Fails when a message type is already
    /// handled by another included protocol. Returns its interval tasks.
    pub(crate) fn include(&self, protocol: &mut Protocol) -> Result<Vec<IntervalTask>> {
        protocol.verify_complete()?;

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let name = protocol.canonical_name();
        if let Some(existing) = protocol
            .handlers()
            .keys()
            .find_map(|digest| inner.routes.get(digest))
        {
            return Err(Error::ProtocolViolation(format!(
                "{} handles a message already handled by {}",
                name, existing.protocol
            )));
        }

        for (digest, handler) in protocol.handlers() {
            inner.routes.insert(
                digest.clone(),
                Route {
                    protocol: name.clone(),
                    func: Arc::clone(&handler.func),
                    allow_unverified: handler.allow_unverified,
                    replies: protocol.replies_for(digest),
                },
            );
        }
        for model in protocol.models() {
            inner
                .models
                .entry(model.digest.clone())
                .or_insert_with(|| protocol.digest().to_string());
        }
        if let Some(guard) = protocol.guard() {
            inner.guards.push(guard);
        }
        inner.protocols.insert(name, protocol.digest().to_string());

        Ok(protocol.take_intervals())
    }

    pub(crate) fn route(&self, schema_digest: &str) -> Option<Route> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .routes
            .get(schema_digest)
            .cloned()
    }

    pub(crate) fn allows_unverified(&self, schema_digest: &str) -> bool {
        self.route(schema_digest).is_some_and(|r| r.allow_unverified)
    }

    pub(crate) fn protocol_digest_for(&self, schema_digest: &str) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .models
            .get(schema_digest)
            .cloned()
    }

    /// Run dialogue guards for an outgoing message.
    pub(crate) fn check_outbound(
        &self,
        store: &dyn KeyValueStore,
        session: Uuid,
        schema_digest: &str,
    ) -> Result<()> {
        let guards: Vec<Arc<dyn TransitionGuard>> = self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .guards
            .iter()
            .filter(|g| g.handles(schema_digest))
            .cloned()
            .collect();
        for guard in guards {
            guard.outbound(store, session, schema_digest)?;
        }
        Ok(())
    }

    /// Digests of every included protocol, sorted.
    pub(crate) fn digests(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let digests: BTreeSet<String> = inner.protocols.values().cloned().collect();
        digests.into_iter().collect()
    }
}

/// Everything a running agent shares with its contexts and endpoint.
pub(crate) struct AgentRuntime {
    pub(crate) name: String,
    pub(crate) identity: Identity,
    pub(crate) storage: Arc<dyn KeyValueStore>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) resolver: Arc<dyn Resolver>,
    pub(crate) transport: Transport,
    pub(crate) settings: AgentSettings,
    pub(crate) protocols: ProtocolTable,
    inbox: mpsc::UnboundedSender<Inbound>,
    pending: Mutex<HashMap<(String, Uuid), Waiter>>,
}

/// A `send_and_receive` waiting for one model from one peer.
struct Waiter {
    schema_digest: String,
    tx: oneshot::Sender<IncomingMessage>,
}

impl AgentRuntime {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        identity: Identity,
        storage: Arc<dyn KeyValueStore>,
        dispatcher: Arc<Dispatcher>,
        resolver: Arc<dyn Resolver>,
        transport: Transport,
        settings: AgentSettings,
        inbox: mpsc::UnboundedSender<Inbound>,
    ) -> Self {
        Self {
            name,
            identity,
            storage,
            dispatcher,
            resolver,
            transport,
            settings,
            protocols: ProtocolTable::default(),
            inbox,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn address(&self) -> &str {
        self.identity.address()
    }

    /// Wait for the next verified `schema_digest` message from `peer` in
    /// `session`. Only one waiter per peer and session is allowed.
    pub(crate) fn expect_response(
        &self,
        peer: &str,
        session: Uuid,
        schema_digest: &str,
    ) -> Option<oneshot::Receiver<IncomingMessage>> {
        let key = (normalize_address(peer).to_string(), session);
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.contains_key(&key) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(
            key,
            Waiter {
                schema_digest: schema_digest.to_string(),
                tx,
            },
        );
        Some(rx)
    }

    pub(crate) fn cancel_response(&self, peer: &str, session: Uuid) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(normalize_address(peer).to_string(), session));
    }

    /// The waiter this message answers, if any. Messages from another
    /// sender or of another model leave the waiter in place.
    fn take_waiter(&self, message: &IncomingMessage) -> Option<oneshot::Sender<IncomingMessage>> {
        if !message.verified {
            return None;
        }
        let key = (normalize_address(&message.sender).to_string(), message.session);
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.get(&key) {
            Some(waiter) if waiter.schema_digest == message.schema_digest => {
                pending.remove(&key).map(|w| w.tx)
            }
            _ => None,
        }
    }

    /// Hand a message to a matching `send_and_receive` or queue it for the
    /// handlers. Returns false when the agent is no longer running.
    pub(crate) fn deliver(&self, message: IncomingMessage, reply: Option<SyncReply>) -> bool {
        let message = match self.take_waiter(&message) {
            Some(tx) => match tx.send(message) {
                Ok(()) => return true,
                Err(message) => message,
            },
            None => message,
        };

        if self.inbox.send(Inbound { message, reply }).is_err() {
            tracing::warn!(agent = %self.name, "Inbox closed, dropping message");
            return false;
        }
        true
    }

    /// Run the handler for one inbound message. Handler errors and panics
    /// are logged and never reach the caller.
    pub(crate) async fn process(self: &Arc<Self>, inbound: Inbound) {
        let Inbound { message, reply } = inbound;
        let Some(route) = self.protocols.route(&message.schema_digest) else {
            tracing::warn!(
                agent = %self.name,
                sender = %message.sender,
                schema_digest = %message.schema_digest,
                "No handler for message, dropping"
            );
            return;
        };
        if !message.verified && !route.allow_unverified {
            tracing::warn!(
                agent = %self.name,
                sender = %message.sender,
                schema_digest = %message.schema_digest,
                "Unverified message for a verified handler, dropping"
            );
            return;
        }

        tracing::debug!(
            agent = %self.name,
            sender = %message.sender,
            session = %message.session,
            protocol = %route.protocol,
            "Handling message"
        );
        let ctx = Context::for_message(Arc::clone(self), &message, route.replies, reply);
        let task = tokio::spawn((route.func)(ctx, message.sender, message.payload));
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(
                    agent = %self.name,
                    session = %message.session,
                    "Handler failed: {:#}",
                    e
                );
            }
            Err(e) if e.is_panic() => {
                tracing::error!(
                    agent = %self.name,
                    session = %message.session,
                    "Handler panicked"
                );
            }
            Err(_) => {
                tracing::debug!(agent = %self.name, "Handler cancelled");
            }
        }
    }
}

/// Consume the inbox, one tokio task per message.
pub(crate) async fn run_inbox(runtime: Arc<AgentRuntime>, mut inbox: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(inbound) = inbox.recv().await {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move { runtime.process(inbound).await });
    }
}

/// Dispatcher sink feeding an agent's inbox.
pub(crate) struct AgentSink {
    runtime: Weak<AgentRuntime>,
}

impl AgentSink {
    pub(crate) fn new(runtime: &Arc<AgentRuntime>) -> Self {
        Self {
            runtime: Arc::downgrade(runtime),
        }
    }
}

#[async_trait]
impl Sink for AgentSink {
    async fn handle_message(&self, message: IncomingMessage) {
        match self.runtime.upgrade() {
            Some(runtime) => {
                runtime.deliver(message, None);
            }
            None => tracing::debug!("Local sink outlived its agent"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MessageSet;
    use crate::model::Model;
    use crate::resolver::RulesBasedResolver;
    use crate::storage::MemoryStore;
    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Serialize, Deserialize, JsonSchema)]
    struct Ping {
        n: u32,
    }
    impl Model for Ping {}

    fn runtime() -> (Arc<AgentRuntime>, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let runtime = AgentRuntime::new(
            "tester".to_string(),
            Identity::from_seed("runtime tests", 0).unwrap(),
            Arc::new(MemoryStore::new()),
            Arc::new(Dispatcher::new()),
            Arc::new(RulesBasedResolver::new(HashMap::new())),
            Transport::new(Duration::from_secs(1)),
            AgentSettings::default(),
            tx,
        );
        (Arc::new(runtime), rx)
    }

    fn ping_protocol(name: &str) -> Protocol {
        let mut protocol = Protocol::new(name, "1");
        protocol
            .on_message(MessageSet::empty(), |_ctx, _s, _m: Ping| async { Ok(()) })
            .unwrap();
        protocol
    }

    #[test]
    fn test_include_rejects_overlapping_handlers() {
        let table = ProtocolTable::default();
        table.include(&mut ping_protocol("one")).unwrap();
        assert!(matches!(
            table.include(&mut ping_protocol("two")),
            Err(Error::ProtocolViolation(_))
        ));

        let digest = Ping::schema_digest().unwrap();
        assert_eq!(table.route(&digest).unwrap().protocol, "one:1");
        assert_eq!(table.digests().len(), 1);
        assert!(!table.allows_unverified(&digest));
    }

    #[tokio::test]
    async fn test_pending_response_takes_priority() {
        let (runtime, mut rx) = runtime();
        let session = Uuid::new_v4();
        let waiter = runtime.expect_response("agent1peer", session, "model:00").unwrap();
        assert!(runtime.expect_response("agent1peer", session, "model:00").is_none());

        let message = IncomingMessage::local("agent1peer", "model:00", "{}", session);
        assert!(runtime.deliver(message.clone(), None));
        assert_eq!(waiter.await.unwrap(), message);
        assert!(rx.try_recv().is_err());

        assert!(runtime.deliver(message, None));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_waiter_ignores_other_models_and_senders() {
        let (runtime, mut rx) = runtime();
        let session = Uuid::new_v4();
        let mut waiter = runtime.expect_response("agent1peer", session, "model:00").unwrap();

        let ack = IncomingMessage::local("agent1peer", "model:ack", "{}", session);
        assert!(runtime.deliver(ack.clone(), None));
        assert_eq!(rx.try_recv().unwrap().message, ack);

        let intruder = IncomingMessage::local("agent1other", "model:00", "{}", session);
        assert!(runtime.deliver(intruder.clone(), None));
        assert_eq!(rx.try_recv().unwrap().message, intruder);
        assert!(waiter.try_recv().is_err());

        let other_session = IncomingMessage::local("agent1peer", "model:00", "{}", Uuid::new_v4());
        assert!(runtime.deliver(other_session, None));
        assert!(rx.try_recv().is_ok());

        let response = IncomingMessage::local("agent1peer", "model:00", "{\"ok\":true}", session);
        assert!(runtime.deliver(response.clone(), None));
        assert_eq!(waiter.await.unwrap(), response);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unverified_message_cannot_answer_a_waiter() {
        let (runtime, mut rx) = runtime();
        let session = Uuid::new_v4();
        let _waiter = runtime.expect_response("agent1peer", session, "model:00").unwrap();

        let mut message = IncomingMessage::local("agent1peer", "model:00", "{}", session);
        message.verified = false;
        runtime.deliver(message, None);
        assert!(rx.try_recv().is_ok());

        runtime.cancel_response("agent1peer", session);
        assert!(runtime.expect_response("agent1peer", session, "model:00").is_some());
    }
}
