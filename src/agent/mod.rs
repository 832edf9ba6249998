//! Agents: an identity, its protocols and the loop that runs them.

pub mod bureau;
pub(crate) mod runtime;
pub mod scheduler;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{validate_settings, Settings};
use crate::context::Context;
use crate::core::{Dispatcher, MessageSet, Protocol, Sink};
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::model::Model;
use crate::protocol::{unix_now, EnvelopeHistory};
use crate::registration::{AgentEndpoint, AgentRegistration};
use crate::resolver::{AlmanacApi, GlobalResolver, HttpAlmanacClient, NameService, Resolver, RulesBasedResolver};
use crate::storage::{JsonFileStore, KeyValueStore, MemoryStore};
use crate::transport::Transport;
use crate::web::{serve, ServerState};

pub use bureau::Bureau;
pub use scheduler::IntervalTask;

use runtime::{run_inbox, AgentRuntime, AgentSink, Inbound};

/// Name and version of the protocol holding handlers added directly to an agent.
const DEFAULT_PROTOCOL: (&str, &str) = ("default", "0.1.0");

/// Builder for `Agent`. Anything left unset comes from `Settings`.
pub struct AgentBuilder {
    name: String,
    seed: Option<String>,
    index: u32,
    identity: Option<Identity>,
    port: Option<u16>,
    endpoint: Option<String>,
    resolver: Option<Arc<dyn Resolver>>,
    dispatcher: Option<Arc<Dispatcher>>,
    storage: Option<Arc<dyn KeyValueStore>>,
    almanac: Option<Arc<dyn AlmanacApi>>,
    name_service: Option<Arc<dyn NameService>>,
    settings: Settings,
}

impl AgentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seed: None,
            index: 0,
            identity: None,
            port: None,
            endpoint: None,
            resolver: None,
            dispatcher: None,
            storage: None,
            almanac: None,
            name_service: None,
            settings: Settings::default(),
        }
    }

    /// Derive the identity from a seed phrase.
    pub fn seed(mut self, seed: impl Into<String>) -> Self {
        self.seed = Some(seed.into());
        self
    }

    pub fn index(mut self, index: u32) -> Self {
        self.index = index;
        self
    }

    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Serve the inbound endpoint on this port when run.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Public URL advertised in the Almanac.
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = Some(url.into());
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn KeyValueStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn almanac(mut self, almanac: Arc<dyn AlmanacApi>) -> Self {
        self.almanac = Some(almanac);
        self
    }

    pub fn name_service(mut self, names: Arc<dyn NameService>) -> Self {
        self.name_service = Some(names);
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Result<Agent> {
        let settings = self.settings;
        validate_settings(&settings)?;

        let identity = match (self.identity, self.seed) {
            (Some(identity), _) => identity,
            (None, Some(seed)) => Identity::from_seed(&seed, self.index)?,
            (None, None) => Identity::generate(),
        };

        let storage: Arc<dyn KeyValueStore> = match (self.storage, &settings.storage.dir) {
            (Some(storage), _) => storage,
            (None, Some(dir)) => Arc::new(JsonFileStore::for_agent(dir, &self.name, identity.address())?),
            (None, None) => Arc::new(MemoryStore::new()),
        };

        let dispatcher = match self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => Arc::new(Dispatcher::with_history(history_for(&settings))),
        };

        let almanac: Option<Arc<dyn AlmanacApi>> = match (self.almanac, &settings.almanac.api_url) {
            (Some(almanac), _) => Some(almanac),
            (None, Some(url)) => Some(Arc::new(HttpAlmanacClient::new(
                url.clone(),
                settings.network.http_timeout(),
            ))),
            (None, None) => None,
        };

        let resolver: Arc<dyn Resolver> = match (self.resolver, &almanac) {
            (Some(resolver), _) => resolver,
            (None, Some(almanac)) => {
                let global = GlobalResolver::new(Arc::clone(almanac), settings.network.max_endpoints);
                match self.name_service {
                    Some(names) => Arc::new(global.with_name_service(names)),
                    None => Arc::new(global),
                }
            }
            (None, None) => Arc::new(RulesBasedResolver::new(HashMap::new())),
        };

        let port = self.port.or(settings.network.port);
        let endpoint = self
            .endpoint
            .or_else(|| port.map(|port| format!("http://127.0.0.1:{}/submit", port)));

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let runtime = Arc::new(AgentRuntime::new(
            self.name,
            identity,
            storage,
            dispatcher,
            resolver,
            Transport::new(settings.network.http_timeout()),
            settings.agent.clone(),
            inbox_tx,
        ));
        let sink: Arc<dyn Sink> = Arc::new(AgentSink::new(&runtime));

        tracing::debug!(agent = %runtime.name, address = %runtime.address(), "Built agent");
        Ok(Agent {
            runtime,
            sink,
            inbox: Some(inbox_rx),
            default_protocol: Protocol::new(DEFAULT_PROTOCOL.0, DEFAULT_PROTOCOL.1),
            intervals: Vec::new(),
            almanac,
            endpoint,
            host: settings.network.host,
            port,
        })
    }
}

/// The dispatcher history `settings` ask for. A log file that cannot be
/// opened is reported and skipped.
pub(crate) fn history_for(settings: &Settings) -> EnvelopeHistory {
    let capacity = settings.agent.history_capacity;
    let Some(path) = &settings.agent.history_log else {
        return EnvelopeHistory::new(capacity);
    };
    EnvelopeHistory::new(capacity)
        .with_log_file(path)
        .unwrap_or_else(|e| {
            tracing::warn!("Envelope history log {} disabled: {}", path.display(), e);
            EnvelopeHistory::new(capacity)
        })
}

/// An addressable identity with message handlers and periodic tasks.
pub struct Agent {
    runtime: Arc<AgentRuntime>,
    sink: Arc<dyn Sink>,
    inbox: Option<mpsc::UnboundedReceiver<Inbound>>,
    default_protocol: Protocol,
    intervals: Vec<IntervalTask>,
    almanac: Option<Arc<dyn AlmanacApi>>,
    endpoint: Option<String>,
    host: String,
    port: Option<u16>,
}

/// Tasks of a started agent.
pub(crate) struct RunningAgent {
    address: String,
    sink: Arc<dyn Sink>,
    dispatcher: Arc<Dispatcher>,
    handles: Vec<JoinHandle<()>>,
}

impl RunningAgent {
    pub(crate) fn stop(self) {
        self.dispatcher.unregister(&self.address, &self.sink);
        for handle in self.handles {
            handle.abort();
        }
    }
}

impl Agent {
    pub fn builder(name: impl Into<String>) -> AgentBuilder {
        AgentBuilder::new(name)
    }

    pub fn address(&self) -> &str {
        self.runtime.address()
    }

    pub fn name(&self) -> &str {
        &self.runtime.name
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn storage(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.runtime.storage)
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.runtime.dispatcher)
    }

    /// A context in a fresh session, for sending outside of handlers.
    pub fn context(&self) -> Context {
        Context::new(Arc::clone(&self.runtime), Uuid::new_v4())
    }

    /// Digests of the included protocols.
    pub fn protocol_digests(&self) -> Vec<String> {
        self.runtime.protocols.digests()
    }

    /// Wire a protocol (or dialogue) into this agent. Role-bound protocols
    /// must handle every message of their role.
    pub fn include(&mut self, protocol: impl Into<Protocol>) -> Result<&mut Self> {
        let mut protocol = protocol.into();
        let intervals = self.runtime.protocols.include(&mut protocol)?;
        tracing::info!(
            agent = %self.runtime.name,
            protocol = %protocol.canonical_name(),
            digest = %protocol.digest(),
            "Included protocol"
        );
        self.intervals.extend(intervals);
        Ok(self)
    }

    /// Handle `M` directly on the agent.
    pub fn on_message<M, F, Fut>(&mut self, replies: MessageSet, handler: F) -> Result<&mut Self>
    where
        M: Model,
        F: Fn(Context, String, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.default_protocol.on_message(replies, handler)?;
        Ok(self)
    }

    pub fn on_interval<F, Fut>(&mut self, period: Duration, handler: F) -> Result<&mut Self>
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.intervals.push(IntervalTask::new(period, handler)?);
        Ok(self)
    }

    /// Sign and submit this agent's endpoint and protocols to the Almanac.
    pub async fn register(&self) -> Result<AgentRegistration> {
        let almanac = self
            .almanac
            .as_ref()
            .ok_or_else(|| Error::Config("no almanac configured".to_string()))?;
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| Error::Config("agent has no endpoint to register".to_string()))?;

        let mut registration = AgentRegistration::new(
            self.address(),
            vec![AgentEndpoint::new(endpoint.clone(), 1)],
            self.protocol_digests(),
            unix_now(),
        );
        registration.sign(&self.runtime.identity);
        almanac.register(&registration).await?;

        tracing::info!(agent = %self.runtime.name, %endpoint, "Registered in almanac");
        Ok(registration)
    }

    pub(crate) fn runtime(&self) -> Arc<AgentRuntime> {
        Arc::clone(&self.runtime)
    }

    /// Include pending direct handlers, attach to the dispatcher and spawn
    /// the inbox loop and interval tasks.
    pub(crate) fn start(&mut self) -> Result<RunningAgent> {
        if !self.default_protocol.is_empty() {
            let mut protocol = std::mem::replace(
                &mut self.default_protocol,
                Protocol::new(DEFAULT_PROTOCOL.0, DEFAULT_PROTOCOL.1),
            );
            self.intervals
                .extend(self.runtime.protocols.include(&mut protocol)?);
        }

        let inbox = self
            .inbox
            .take()
            .ok_or_else(|| Error::Config(format!("agent {} already started", self.runtime.name)))?;

        self.runtime
            .dispatcher
            .register(self.address(), Arc::clone(&self.sink));

        let mut handles = vec![tokio::spawn(run_inbox(Arc::clone(&self.runtime), inbox))];
        for task in self.intervals.drain(..) {
            handles.push(scheduler::spawn_interval(Arc::clone(&self.runtime), task));
        }

        tracing::info!(agent = %self.runtime.name, address = %self.address(), "Agent started");
        Ok(RunningAgent {
            address: self.address().to_string(),
            sink: Arc::clone(&self.sink),
            dispatcher: Arc::clone(&self.runtime.dispatcher),
            handles,
        })
    }

    /// Run until `shutdown` completes, serving the inbound endpoint when a
    /// port is configured and registering with the Almanac when one is set.
    pub async fn run_until<F: Future<Output = ()>>(mut self, shutdown: F) -> Result<()> {
        let mut running = self.start()?;

        if let Some(port) = self.port {
            let state = ServerState::new(self.runtime.settings.response_timeout());
            state.insert(self.runtime());
            let host = self.host.clone();
            running.handles.push(tokio::spawn(async move {
                if let Err(e) = serve(&host, port, state).await {
                    tracing::error!("Inbound endpoint failed: {}", e);
                }
            }));
        }

        if self.almanac.is_some() {
            if let Err(e) = self.register().await {
                tracing::warn!(agent = %self.runtime.name, "Almanac registration failed: {}", e);
            }
        }

        shutdown.await;
        tracing::info!(agent = %self.runtime.name, "Agent stopping");
        running.stop();
        Ok(())
    }

    /// Run until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.runtime.name)
            .field("address", &self.address())
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Dialogue, DialogueGraph, ProtocolSpecification};
    use crate::protocol::DeliveryStatus;
    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::sync::mpsc::unbounded_channel;

    #[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
    struct Message {
        text: String,
    }
    impl Model for Message {}

    #[derive(Debug, Serialize, Deserialize, JsonSchema)]
    struct Request {
        query: String,
    }
    impl Model for Request {}

    #[derive(Debug, Serialize, Deserialize, JsonSchema)]
    struct Response {
        answer: String,
    }
    impl Model for Response {}

    #[derive(Debug, Serialize, Deserialize, JsonSchema)]
    struct Ack {
        received: bool,
    }
    impl Model for Ack {}

    #[derive(Debug, Serialize, Deserialize, JsonSchema)]
    struct StartChat {}
    impl Model for StartChat {}

    #[derive(Debug, Serialize, Deserialize, JsonSchema)]
    struct ChitChat {
        line: String,
    }
    impl Model for ChitChat {}

    #[derive(Debug, Serialize, Deserialize, JsonSchema)]
    struct EndChat {
        reason: String,
    }
    impl Model for EndChat {}

    fn local_agent(name: &str, dispatcher: &Arc<Dispatcher>) -> Agent {
        Agent::builder(name)
            .seed(format!("agent tests {}", name))
            .dispatcher(Arc::clone(dispatcher))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_send_and_receive_locally() {
        let dispatcher = Arc::new(Dispatcher::new());
        let mut alice = local_agent("alice", &dispatcher);
        let mut bob = local_agent("bob", &dispatcher);
        bob.on_message(
            MessageSet::of::<Response>(),
            |ctx: Context, sender: String, msg: Request| async move {
                let answer = Response {
                    answer: msg.query.to_uppercase(),
                };
                ctx.send(&sender, &answer).await;
                Ok(())
            },
        )
        .unwrap();

        let running = [alice.start().unwrap(), bob.start().unwrap()];
        let (answer, status) = alice
            .context()
            .send_and_receive::<Request, Response>(
                bob.address(),
                &Request { query: "ping".into() },
                Duration::from_secs(2),
            )
            .await;

        assert!(status.is_delivered(), "{:?}", status);
        assert_eq!(answer.unwrap().answer, "PING");
        assert!(dispatcher.history().len() >= 2);
        running.into_iter().for_each(RunningAgent::stop);
    }

    #[tokio::test]
    async fn test_send_and_receive_waits_for_matching_reply() {
        let dispatcher = Arc::new(Dispatcher::new());
        let mut alice = local_agent("alice", &dispatcher);
        let mut bob = local_agent("bob", &dispatcher);
        let carol = local_agent("carol", &dispatcher);
        let (ack_tx, mut ack_rx) = unbounded_channel();

        alice
            .on_message(MessageSet::empty(), move |_ctx: Context, sender: String, msg: Ack| {
                let ack_tx = ack_tx.clone();
                async move {
                    let _ = ack_tx.send((sender, msg.received));
                    Ok(())
                }
            })
            .unwrap();

        let ctx = alice.context();
        let intruder = carol.context().with_session(ctx.session());
        let alice_addr = alice.address().to_string();
        bob.on_message(
            MessageSet::of::<Ack>().and::<Response>(),
            move |ctx: Context, sender: String, msg: Request| {
                let intruder = intruder.clone();
                let alice_addr = alice_addr.clone();
                async move {
                    intruder
                        .send(&alice_addr, &Response { answer: "forged".into() })
                        .await;
                    ctx.send(&sender, &Ack { received: true }).await;
                    ctx.send(&sender, &Response { answer: msg.query }).await;
                    Ok(())
                }
            },
        )
        .unwrap();

        let running = [alice.start().unwrap(), bob.start().unwrap()];
        let (answer, status) = ctx
            .send_and_receive::<Request, Response>(
                bob.address(),
                &Request { query: "real".into() },
                Duration::from_secs(2),
            )
            .await;

        assert!(status.is_delivered(), "{:?}", status);
        assert_eq!(answer.unwrap().answer, "real");

        let (ack_sender, received) = tokio::time::timeout(Duration::from_secs(2), ack_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack_sender, bob.address());
        assert!(received);
        running.into_iter().for_each(RunningAgent::stop);
    }

    #[tokio::test]
    async fn test_send_and_receive_times_out() {
        let dispatcher = Arc::new(Dispatcher::new());
        let mut alice = local_agent("alice", &dispatcher);
        let mut silent = local_agent("silent", &dispatcher);
        silent
            .on_message(MessageSet::empty(), |_ctx, _sender, _msg: Message| async { Ok(()) })
            .unwrap();

        let running = [alice.start().unwrap(), silent.start().unwrap()];
        let ctx = alice.context();
        let timeout = Duration::from_millis(300);
        let started = Instant::now();
        let (reply, status) = ctx
            .send_and_receive::<Message, Message>(
                silent.address(),
                &Message { text: "anyone?".into() },
                timeout,
            )
            .await;
        let elapsed = started.elapsed();

        assert!(reply.is_none());
        assert_eq!(status.status, DeliveryStatus::Failed);
        assert!(elapsed >= timeout, "returned early after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "returned late after {:?}", elapsed);

        let (_, retry) = ctx
            .send_and_receive::<Message, Message>(
                silent.address(),
                &Message { text: "again?".into() },
                Duration::from_millis(50),
            )
            .await;
        assert!(!retry.detail.contains("already pending"));
        running.into_iter().for_each(RunningAgent::stop);
    }

    #[tokio::test]
    async fn test_unroutable_destination_fails() {
        let agent = Agent::builder("lonely").build().unwrap();
        let status = agent
            .context()
            .send(Identity::generate().address(), &Message { text: "hi".into() })
            .await;
        assert!(status.is_failed());
        assert_eq!(status.detail, "no route");
    }

    #[test]
    fn test_include_rejects_incomplete_role() {
        let mut agent = Agent::builder("server").build().unwrap();

        let mut plain = Protocol::new("lookup", "1.0.0");
        plain
            .on_message(MessageSet::of::<Response>(), |_ctx, _s, _m: Request| async { Ok(()) })
            .unwrap();
        agent.include(plain).unwrap();
        assert_eq!(agent.protocol_digests().len(), 1);

        let spec = ProtocolSpecification::new("strict-lookup", "1.0.0")
            .interaction::<Request>(MessageSet::of::<Response>())
            .unwrap()
            .interaction::<Response>(MessageSet::empty())
            .unwrap()
            .role("server", MessageSet::of::<Request>())
            .unwrap();
        let incomplete = Protocol::from_spec(spec, Some("server")).unwrap();

        let mut other = Agent::builder("other").build().unwrap();
        assert!(matches!(
            other.include(incomplete),
            Err(Error::IncompleteProtocol(_))
        ));
        assert!(other.protocol_digests().is_empty());
    }

    #[tokio::test]
    async fn test_disallowed_reply_is_not_sent() {
        let dispatcher = Arc::new(Dispatcher::new());
        let mut alice = local_agent("alice", &dispatcher);
        let mut bob = local_agent("bob", &dispatcher);
        let (tx, mut rx) = unbounded_channel();

        bob.on_message(
            MessageSet::of::<Response>(),
            move |ctx: Context, sender: String, _msg: Request| {
                let tx = tx.clone();
                async move {
                    let status = ctx
                        .send(&sender, &Message { text: "not a response".into() })
                        .await;
                    let _ = tx.send(status);
                    Ok(())
                }
            },
        )
        .unwrap();

        let running = [alice.start().unwrap(), bob.start().unwrap()];
        alice
            .context()
            .send(bob.address(), &Request { query: "q".into() })
            .await;

        let status = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(status.is_failed());
        assert!(status.detail.contains("not a valid reply"));
        running.into_iter().for_each(RunningAgent::stop);
    }

    fn chat_graph() -> DialogueGraph {
        let mut builder = DialogueGraph::builder();
        builder.initial_node("idle", "No conversation yet");
        let chatting = builder.node("chatting", "Exchanging messages");
        let ended = builder.terminal_node("ended", "Conversation over");
        builder
            .edge::<StartChat>("start", "Open a conversation", None, chatting)
            .unwrap();
        builder
            .edge::<ChitChat>("chat", "Say something", Some(chatting), chatting)
            .unwrap();
        builder
            .edge::<EndChat>("end", "Close the conversation", Some(chatting), ended)
            .unwrap();
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_chit_chat_dialogue() {
        crate::logging::init_test();
        let dispatcher = Arc::new(Dispatcher::new());
        let mut alice = local_agent("alice", &dispatcher);
        let mut bob = local_agent("bob", &dispatcher);
        let (done_tx, mut done_rx) = unbounded_channel();

        let mut bob_chat = Dialogue::new("chit-chat", "0.1.0", chat_graph()).unwrap();
        bob_chat
            .on_start_dialogue(|ctx: Context, sender: String, _msg: StartChat| async move {
                ctx.send(&sender, &ChitChat { line: "hi".into() }).await;
                Ok(())
            })
            .unwrap()
            .on_continue_dialogue(|ctx: Context, sender: String, msg: ChitChat| async move {
                ctx.send(&sender, &ChitChat { line: format!("{}!", msg.line) }).await;
                Ok(())
            })
            .unwrap()
            .on_end_session(move |ctx: Context, _sender: String, msg: EndChat| {
                let done_tx = done_tx.clone();
                async move {
                    let _ = done_tx.send((ctx.session(), msg.reason));
                    Ok(())
                }
            })
            .unwrap();
        let bob_tracker = bob_chat.tracker();

        let lines = Arc::new(AtomicUsize::new(0));
        let mut alice_chat = Dialogue::new("chit-chat", "0.1.0", chat_graph()).unwrap();
        let counter = Arc::clone(&lines);
        alice_chat
            .on_continue_dialogue(move |ctx: Context, sender: String, msg: ChitChat| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 1 {
                        ctx.send(&sender, &ChitChat { line: msg.line }).await;
                    } else {
                        ctx.send(&sender, &EndChat { reason: "bye".into() }).await;
                    }
                    Ok(())
                }
            })
            .unwrap();
        let alice_tracker = alice_chat.tracker();
        assert_eq!(alice_chat.digest(), bob_chat.digest());

        alice.include(alice_chat).unwrap();
        bob.include(bob_chat).unwrap();
        let running = [alice.start().unwrap(), bob.start().unwrap()];

        let ctx = alice.context();
        let status = ctx.send(bob.address(), &StartChat {}).await;
        assert!(status.is_delivered());

        let (session, reason) = tokio::time::timeout(Duration::from_secs(2), done_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session, ctx.session());
        assert_eq!(reason, "bye");
        assert_eq!(lines.load(Ordering::SeqCst), 2);

        let alice_store = alice.storage();
        let bob_store = bob.storage();
        assert!(alice_tracker.is_concluded(alice_store.as_ref(), session));
        assert!(bob_tracker.is_concluded(bob_store.as_ref(), session));

        let late = ctx.send(bob.address(), &ChitChat { line: "wait".into() }).await;
        assert!(late.is_failed());
        running.into_iter().for_each(RunningAgent::stop);
    }

    #[tokio::test]
    async fn test_register_with_almanac() {
        let almanac = Arc::new(crate::resolver::InMemoryAlmanac::new());
        let mut agent = Agent::builder("listed")
            .seed("agent tests listed")
            .endpoint("http://agents.example:8000/submit")
            .almanac(almanac.clone())
            .build()
            .unwrap();
        let mut lookup = Protocol::new("lookup", "1.0.0");
        lookup
            .on_message(MessageSet::of::<Response>(), |_ctx, _s, _m: Request| async { Ok(()) })
            .unwrap();
        agent.include(lookup).unwrap();

        let registration = agent.register().await.unwrap();
        assert!(registration.verify());

        let record = almanac.get_record(agent.address()).await.unwrap().unwrap();
        assert_eq!(record.endpoints[0].url, "http://agents.example:8000/submit");
        assert_eq!(record.protocols, agent.protocol_digests());
    }

    #[tokio::test]
    async fn test_register_requires_almanac() {
        let agent = Agent::builder("unlisted").port(8001).build().unwrap();
        assert!(matches!(agent.register().await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_intervals_fire_until_stopped() {
        let mut agent = Agent::builder("ticker").build().unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        agent
            .on_interval(Duration::from_millis(40), move |ctx: Context| {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    ctx.storage().set("ticks", serde_json::json!(n))?;
                    Ok(())
                }
            })
            .unwrap();
        assert!(agent.on_interval(Duration::ZERO, |_ctx| async { Ok(()) }).is_err());

        let running = agent.start().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        running.stop();

        let fired = ticks.load(Ordering::SeqCst);
        assert!(fired >= 2, "only {} ticks", fired);
        assert!(agent.storage().get("ticks").is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(ticks.load(Ordering::SeqCst) <= fired + 1);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let mut agent = Agent::builder("once").build().unwrap();
        let running = agent.start().unwrap();
        assert!(matches!(agent.start(), Err(Error::Config(_))));
        running.stop();
    }

    #[tokio::test]
    async fn test_dialogue_drops_out_of_order_message() {
        let dispatcher = Arc::new(Dispatcher::new());
        let alice = local_agent("alice", &dispatcher);
        let mut bob = local_agent("bob", &dispatcher);
        let (done_tx, mut done_rx) = unbounded_channel();

        let mut chat = Dialogue::new("chit-chat", "0.1.0", chat_graph()).unwrap();
        chat.on_start_dialogue(|_ctx: Context, _sender: String, _msg: StartChat| async { Ok(()) })
            .unwrap()
            .on_end_session(move |_ctx: Context, _sender: String, msg: EndChat| {
                let done_tx = done_tx.clone();
                async move {
                    let _ = done_tx.send(msg.reason);
                    Ok(())
                }
            })
            .unwrap();
        let tracker = chat.tracker();
        bob.include(chat).unwrap();
        let running = bob.start().unwrap();

        let ctx = alice.context();
        let store = bob.storage();
        let status = ctx.send(bob.address(), &EndChat { reason: "too early".into() }).await;
        assert!(status.is_delivered());
        assert!(tokio::time::timeout(Duration::from_millis(200), done_rx.recv())
            .await
            .is_err());
        assert_eq!(tracker.session_state(store.as_ref(), ctx.session()), None);

        ctx.send(bob.address(), &StartChat {}).await;
        for _ in 0..100 {
            if tracker.session_state(store.as_ref(), ctx.session()).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            tracker.session_state(store.as_ref(), ctx.session()).as_deref(),
            Some("chatting")
        );

        ctx.send(bob.address(), &EndChat { reason: "done".into() }).await;
        let reason = tokio::time::timeout(Duration::from_secs(2), done_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, "done");
        assert!(tracker.is_concluded(store.as_ref(), ctx.session()));
        running.stop();
    }
}
