//! Dialogues: protocols constrained by a per-session state machine.
//!
//! The graph is an immutable arena of nodes and edges. The only mutable
//! state is the current node of each session, kept in the agent's
//! key-value store under `dialogue:<name>:<session>`.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

use super::protocol::{typed_handler, HandlerFuture, MessageHandler, Protocol};
use super::spec::{MessageSet, ProtocolSpecification};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::model::{Model, ModelInfo};
use crate::storage::KeyValueStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(usize);

/// A dialogue state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub description: String,
    pub initial: bool,
    pub terminal: bool,
}

/// A named transition triggered by one message type. `parent = None` marks
/// an edge that may open a new session.
#[derive(Debug, Clone)]
pub struct Edge {
    pub name: String,
    pub description: String,
    pub parent: Option<NodeId>,
    pub child: NodeId,
    pub model: ModelInfo,
}

#[derive(Debug, Clone)]
pub struct DialogueGraph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
}

#[derive(Debug, Default)]
pub struct DialogueGraphBuilder {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
}

impl DialogueGraphBuilder {
    fn push_node(&mut self, name: &str, description: &str, initial: bool, terminal: bool) -> NodeId {
        self.nodes.push(Node {
            name: name.to_string(),
            description: description.to_string(),
            initial,
            terminal,
        });
        NodeId(self.nodes.len() - 1)
    }

    pub fn node(&mut self, name: &str, description: &str) -> NodeId {
        self.push_node(name, description, false, false)
    }

    pub fn initial_node(&mut self, name: &str, description: &str) -> NodeId {
        self.push_node(name, description, true, false)
    }

    pub fn terminal_node(&mut self, name: &str, description: &str) -> NodeId {
        self.push_node(name, description, false, true)
    }

    /// Add a transition from `parent` to `child` triggered by `M`.
    pub fn edge<M: Model>(
        &mut self,
        name: &str,
        description: &str,
        parent: Option<NodeId>,
        child: NodeId,
    ) -> Result<EdgeId> {
        self.edges.push(Edge {
            name: name.to_string(),
            description: description.to_string(),
            parent,
            child,
            model: ModelInfo::of::<M>()?,
        });
        Ok(EdgeId(self.edges.len() - 1))
    }

    pub fn build(self) -> Result<DialogueGraph> {
        let graph = DialogueGraph {
            nodes: self.nodes,
            edges: self.edges,
        };
        graph.validate()?;
        Ok(graph)
    }
}

impl DialogueGraph {
    pub fn builder() -> DialogueGraphBuilder {
        DialogueGraphBuilder::default()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(id.0)
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.name == name).map(NodeId)
    }

    pub fn edge_id(&self, name: &str) -> Option<EdgeId> {
        self.edges.iter().position(|e| e.name == name).map(EdgeId)
    }

    pub fn initial(&self) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.initial).map(NodeId)
    }

    /// Edges that may fire from `state`. A session without state may take
    /// a starting edge or any edge leaving the initial node.
    pub fn legal_edges(&self, state: Option<NodeId>) -> impl Iterator<Item = (EdgeId, &Edge)> {
        let initial = self.initial();
        self.edges
            .iter()
            .enumerate()
            .filter(move |(_, edge)| match state {
                Some(state) => edge.parent == Some(state),
                None => edge.parent.is_none() || edge.parent == initial,
            })
            .map(|(i, edge)| (EdgeId(i), edge))
    }

    pub fn transition(&self, state: Option<NodeId>, schema_digest: &str) -> Option<EdgeId> {
        self.legal_edges(state)
            .find(|(_, edge)| edge.model.digest == schema_digest)
            .map(|(id, _)| id)
    }

    pub fn contains_model(&self, schema_digest: &str) -> bool {
        self.edges.iter().any(|e| e.model.digest == schema_digest)
    }

    fn validate(&self) -> Result<()> {
        let initial = self.nodes.iter().filter(|n| n.initial).count();
        if initial != 1 {
            return Err(Error::Dialogue(format!(
                "expected exactly one initial node, found {}",
                initial
            )));
        }

        let mut names = HashSet::new();
        if let Some(node) = self.nodes.iter().find(|n| !names.insert(n.name.as_str())) {
            return Err(Error::Dialogue(format!("duplicate node '{}'", node.name)));
        }
        let mut names = HashSet::new();
        if let Some(edge) = self.edges.iter().find(|e| !names.insert(e.name.as_str())) {
            return Err(Error::Dialogue(format!("duplicate edge '{}'", edge.name)));
        }

        for edge in &self.edges {
            let parent = match edge.parent {
                Some(parent) => Some(self.node(parent).ok_or_else(|| {
                    Error::Dialogue(format!("edge '{}' has an unknown parent", edge.name))
                })?),
                None => None,
            };
            if self.node(edge.child).is_none() {
                return Err(Error::Dialogue(format!(
                    "edge '{}' has an unknown child",
                    edge.name
                )));
            }
            if let Some(parent) = parent.filter(|p| p.terminal) {
                return Err(Error::Dialogue(format!(
                    "edge '{}' leaves terminal node '{}'",
                    edge.name, parent.name
                )));
            }
        }

        let states = std::iter::once(None).chain((0..self.nodes.len()).map(|i| Some(NodeId(i))));
        for state in states {
            let mut seen = HashSet::new();
            for (_, edge) in self.legal_edges(state) {
                if !seen.insert(edge.model.digest.as_str()) {
                    return Err(Error::Dialogue(format!(
                        "edge '{}' makes the transition on {} ambiguous",
                        edge.name, edge.model.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// The interaction graph: each message may be answered by the messages
    /// of the edges leaving the state it leads to.
    fn specification(&self, name: &str, version: &str) -> ProtocolSpecification {
        let mut spec = ProtocolSpecification::new(name, version);
        for edge in &self.edges {
            let replies = self
                .legal_edges(Some(edge.child))
                .map(|(_, e)| e.model.clone())
                .collect();
            spec = spec.with_interaction(edge.model.clone(), replies);
        }
        spec
    }
}

/// Hook the runtime calls before a protocol message leaves the agent.
pub(crate) trait TransitionGuard: Send + Sync {
    fn handles(&self, schema_digest: &str) -> bool;

    fn outbound(&self, store: &dyn KeyValueStore, session: Uuid, schema_digest: &str) -> Result<()>;
}

struct DialogueCore {
    name: String,
    graph: DialogueGraph,
    handlers: RwLock<HashMap<EdgeId, MessageHandler>>,
    transition: Mutex<()>,
}

impl DialogueCore {
    fn state_key(&self, session: Uuid) -> String {
        format!("dialogue:{}:{}", self.name, session)
    }

    fn state(&self, store: &dyn KeyValueStore, session: Uuid) -> Result<Option<NodeId>> {
        match store.get(&self.state_key(session)) {
            Some(Value::String(name)) => self.graph.node_id(&name).map(Some).ok_or_else(|| {
                Error::Dialogue(format!(
                    "session {} is in unknown state '{}' of dialogue {}",
                    session, name, self.name
                ))
            }),
            Some(_) => Err(Error::Dialogue(format!(
                "session {} has a malformed state record",
                session
            ))),
            None => Ok(None),
        }
    }

    fn advance(&self, store: &dyn KeyValueStore, session: Uuid, schema_digest: &str) -> Result<EdgeId> {
        let _lock = self.transition.lock().unwrap_or_else(|e| e.into_inner());
        let state = self.state(store, session)?;
        let edge_id = self.graph.transition(state, schema_digest).ok_or_else(|| {
            let state = state
                .and_then(|s| self.graph.node(s))
                .map(|n| n.name.as_str())
                .unwrap_or("<new session>");
            Error::ProtocolViolation(format!(
                "{} is not a legal transition from '{}' in dialogue {} (session {})",
                schema_digest, state, self.name, session
            ))
        })?;

        let child = self
            .graph
            .edge(edge_id)
            .and_then(|e| self.graph.node(e.child))
            .ok_or_else(|| Error::Dialogue(format!("dangling edge in dialogue {}", self.name)))?;
        store.set(&self.state_key(session), Value::String(child.name.clone()))?;
        tracing::debug!(
            dialogue = %self.name,
            %session,
            state = %child.name,
            "Dialogue transition"
        );
        Ok(edge_id)
    }

    fn handler(&self, edge: EdgeId) -> Option<MessageHandler> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&edge)
            .cloned()
    }
}

impl TransitionGuard for DialogueCore {
    fn handles(&self, schema_digest: &str) -> bool {
        self.graph.contains_model(schema_digest)
    }

    fn outbound(&self, store: &dyn KeyValueStore, session: Uuid, schema_digest: &str) -> Result<()> {
        self.advance(store, session, schema_digest).map(|_| ())
    }
}

/// Read and reset session state of a dialogue after it has been included
/// into an agent.
#[derive(Clone)]
pub struct DialogueTracker {
    core: Arc<DialogueCore>,
}

impl DialogueTracker {
    /// Check `schema_digest` against the session's state and advance it.
    /// Returns the name of the new state.
    pub fn apply(&self, store: &dyn KeyValueStore, session: Uuid, schema_digest: &str) -> Result<String> {
        let edge = self.core.advance(store, session, schema_digest)?;
        self.core
            .graph
            .edge(edge)
            .and_then(|e| self.core.graph.node(e.child))
            .map(|n| n.name.clone())
            .ok_or_else(|| Error::Dialogue(format!("dangling edge in dialogue {}", self.core.name)))
    }

    pub fn session_state(&self, store: &dyn KeyValueStore, session: Uuid) -> Option<String> {
        match self.core.state(store, session) {
            Ok(state) => state
                .and_then(|s| self.core.graph.node(s))
                .map(|n| n.name.clone()),
            Err(e) => {
                tracing::warn!(dialogue = %self.core.name, %session, "{}", e);
                None
            }
        }
    }

    /// Whether the session has reached a terminal node.
    pub fn is_concluded(&self, store: &dyn KeyValueStore, session: Uuid) -> bool {
        matches!(
            self.core.state(store, session),
            Ok(Some(state)) if self.core.graph.node(state).is_some_and(|n| n.terminal)
        )
    }

    pub fn reset_session(&self, store: &dyn KeyValueStore, session: Uuid) -> Result<()> {
        store.remove(&self.core.state_key(session))
    }
}

/// A protocol whose messages must follow a `DialogueGraph` within each
/// session. Every edge model is routed through the state machine; messages
/// that do not match a legal edge are rejected before any handler runs.
pub struct Dialogue {
    tracker: DialogueTracker,
    protocol: Protocol,
}

impl Dialogue {
    pub fn new(name: impl Into<String>, version: impl Into<String>, graph: DialogueGraph) -> Result<Self> {
        let name = name.into();
        let version = version.into();
        let spec = graph.specification(&name, &version);
        let mut protocol = Protocol::from_spec(spec, None)?;

        let core = Arc::new(DialogueCore {
            name: name.clone(),
            graph,
            handlers: RwLock::new(HashMap::new()),
            transition: Mutex::new(()),
        });

        let mut routed = HashSet::new();
        for edge in &core.graph.edges {
            if routed.insert(edge.model.digest.clone()) {
                let route = route_through(Arc::clone(&core), edge.model.digest.clone());
                protocol.register(edge.model.clone(), MessageSet::empty(), route, false)?;
            }
        }
        protocol.set_guard(core.clone());

        Ok(Self {
            tracker: DialogueTracker { core },
            protocol,
        })
    }

    pub fn name(&self) -> &str {
        &self.tracker.core.name
    }

    pub fn graph(&self) -> &DialogueGraph {
        &self.tracker.core.graph
    }

    pub fn digest(&self) -> &str {
        self.protocol.digest()
    }

    pub fn tracker(&self) -> DialogueTracker {
        self.tracker.clone()
    }

    /// Handle the edge named `edge`, which must be triggered by `M`.
    pub fn on_transition<M, F, Fut>(&mut self, edge: &str, handler: F) -> Result<&mut Self>
    where
        M: Model,
        F: Fn(Context, String, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self
            .graph()
            .edge_id(edge)
            .ok_or_else(|| Error::Dialogue(format!("no edge '{}' in dialogue {}", edge, self.name())))?;
        self.bind::<M>(vec![id], typed_handler(handler))?;
        Ok(self)
    }

    /// Handle `M` when it opens a session.
    pub fn on_start_dialogue<M, F, Fut>(&mut self, handler: F) -> Result<&mut Self>
    where
        M: Model,
        F: Fn(Context, String, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let initial = self.graph().initial();
        let edges = self.edges_where(|e| e.parent.is_none() || e.parent == initial);
        self.bind_all::<M>(edges, typed_handler(handler), "starting")?;
        Ok(self)
    }

    /// Handle `M` on self-loop edges, which may repeat any number of times.
    pub fn on_continue_dialogue<M, F, Fut>(&mut self, handler: F) -> Result<&mut Self>
    where
        M: Model,
        F: Fn(Context, String, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let edges = self.edges_where(|e| e.parent == Some(e.child));
        self.bind_all::<M>(edges, typed_handler(handler), "continuing")?;
        Ok(self)
    }

    /// Handle `M` on edges into a terminal node.
    pub fn on_end_session<M, F, Fut>(&mut self, handler: F) -> Result<&mut Self>
    where
        M: Model,
        F: Fn(Context, String, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let edges = self.edges_where(|e| self.graph().node(e.child).is_some_and(|n| n.terminal));
        self.bind_all::<M>(edges, typed_handler(handler), "ending")?;
        Ok(self)
    }

    pub fn apply(&self, store: &dyn KeyValueStore, session: Uuid, schema_digest: &str) -> Result<String> {
        self.tracker.apply(store, session, schema_digest)
    }

    pub fn session_state(&self, store: &dyn KeyValueStore, session: Uuid) -> Option<String> {
        self.tracker.session_state(store, session)
    }

    pub fn is_concluded(&self, store: &dyn KeyValueStore, session: Uuid) -> bool {
        self.tracker.is_concluded(store, session)
    }

    pub fn reset_session(&self, store: &dyn KeyValueStore, session: Uuid) -> Result<()> {
        self.tracker.reset_session(store, session)
    }

    fn edges_where(&self, filter: impl Fn(&Edge) -> bool) -> Vec<EdgeId> {
        self.graph()
            .edges
            .iter()
            .enumerate()
            .filter(|(_, e)| filter(e))
            .map(|(i, _)| EdgeId(i))
            .collect()
    }

    fn bind_all<M: Model>(&mut self, edges: Vec<EdgeId>, handler: MessageHandler, kind: &str) -> Result<()> {
        let digest = M::schema_digest()?;
        let edges: Vec<EdgeId> = edges
            .into_iter()
            .filter(|id| self.graph().edge(*id).is_some_and(|e| e.model.digest == digest))
            .collect();
        if edges.is_empty() {
            return Err(Error::Dialogue(format!(
                "dialogue {} has no {} edge for {}",
                self.name(),
                kind,
                M::schema_name()
            )));
        }
        self.bind::<M>(edges, handler)
    }

    fn bind<M: Model>(&mut self, edges: Vec<EdgeId>, handler: MessageHandler) -> Result<()> {
        let digest = M::schema_digest()?;
        let mut handlers = self
            .tracker
            .core
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        for id in edges {
            let edge = self
                .tracker
                .core
                .graph
                .edge(id)
                .ok_or_else(|| Error::Dialogue(format!("unknown edge in dialogue {}", self.tracker.core.name)))?;
            if edge.model.digest != digest {
                return Err(Error::Dialogue(format!(
                    "edge '{}' is triggered by {}, not {}",
                    edge.name,
                    edge.model.name,
                    M::schema_name()
                )));
            }
            if handlers.insert(id, Arc::clone(&handler)).is_some() {
                tracing::warn!(dialogue = %self.tracker.core.name, edge = %edge.name, "Replacing existing edge handler");
            }
        }
        Ok(())
    }
}

impl From<Dialogue> for Protocol {
    fn from(dialogue: Dialogue) -> Self {
        dialogue.protocol
    }
}

/// Protocol-level handler for one message type: advance the session, then
/// run whichever edge handler the transition selected.
fn route_through(core: Arc<DialogueCore>, schema_digest: String) -> MessageHandler {
    Arc::new(move |ctx: Context, sender: String, payload: String| -> HandlerFuture {
        let core = Arc::clone(&core);
        let schema_digest = schema_digest.clone();
        Box::pin(async move {
            let edge = core.advance(ctx.storage(), ctx.session(), &schema_digest)?;
            match core.handler(edge) {
                Some(handler) => handler(ctx, sender, payload).await,
                None => {
                    tracing::debug!(dialogue = %core.name, "Transition has no handler");
                    Ok(())
                }
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, JsonSchema)]
    struct First {
        step: u32,
    }
    impl Model for First {}

    #[derive(Serialize, Deserialize, JsonSchema)]
    struct Second {
        note: String,
    }
    impl Model for Second {}

    fn abc() -> DialogueGraph {
        let mut builder = DialogueGraph::builder();
        let a = builder.initial_node("a", "start");
        let b = builder.node("b", "middle");
        let c = builder.terminal_node("c", "done");
        builder.edge::<First>("a_to_b", "", Some(a), b).unwrap();
        builder.edge::<Second>("b_to_c", "", Some(b), c).unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn test_out_of_order_message_rejected() {
        let dialogue = Dialogue::new("abc", "0.1.0", abc()).unwrap();
        let store = MemoryStore::new();
        let session = Uuid::new_v4();
        let first = First::schema_digest().unwrap();
        let second = Second::schema_digest().unwrap();

        assert!(matches!(
            dialogue.apply(&store, session, &second),
            Err(Error::ProtocolViolation(_))
        ));
        assert_eq!(dialogue.session_state(&store, session), None);

        assert_eq!(dialogue.apply(&store, session, &first).unwrap(), "b");
        assert!(!dialogue.is_concluded(&store, session));
        assert_eq!(dialogue.apply(&store, session, &second).unwrap(), "c");
        assert_eq!(dialogue.session_state(&store, session).as_deref(), Some("c"));
        assert!(dialogue.is_concluded(&store, session));

        assert!(dialogue.apply(&store, session, &first).is_err());
        dialogue.reset_session(&store, session).unwrap();
        assert_eq!(dialogue.session_state(&store, session), None);
    }

    #[test]
    fn test_sessions_are_independent() {
        let dialogue = Dialogue::new("abc", "0.1.0", abc()).unwrap();
        let store = MemoryStore::new();
        let (one, two) = (Uuid::new_v4(), Uuid::new_v4());
        let first = First::schema_digest().unwrap();

        dialogue.apply(&store, one, &first).unwrap();
        assert_eq!(dialogue.session_state(&store, one).as_deref(), Some("b"));
        assert_eq!(dialogue.session_state(&store, two), None);
        dialogue.apply(&store, two, &first).unwrap();
    }

    #[test]
    fn test_starting_edge_without_parent() {
        let mut builder = DialogueGraph::builder();
        builder.initial_node("idle", "");
        let open = builder.node("open", "");
        builder.edge::<First>("open", "", None, open).unwrap();
        builder.edge::<Second>("chat", "", Some(open), open).unwrap();
        let dialogue = Dialogue::new("loop", "1", builder.build().unwrap()).unwrap();

        let store = MemoryStore::new();
        let session = Uuid::new_v4();
        let second = Second::schema_digest().unwrap();
        dialogue
            .apply(&store, session, &First::schema_digest().unwrap())
            .unwrap();
        for _ in 0..3 {
            assert_eq!(dialogue.apply(&store, session, &second).unwrap(), "open");
        }
    }

    #[test]
    fn test_graph_validation() {
        let mut builder = DialogueGraph::builder();
        builder.node("a", "");
        assert!(matches!(builder.build(), Err(Error::Dialogue(_))));

        let mut builder = DialogueGraph::builder();
        let a = builder.initial_node("a", "");
        let end = builder.terminal_node("end", "");
        builder.edge::<First>("finish", "", Some(a), end).unwrap();
        builder.edge::<Second>("after", "", Some(end), a).unwrap();
        assert!(builder.build().is_err());

        let mut builder = DialogueGraph::builder();
        let a = builder.initial_node("a", "");
        let b = builder.node("b", "");
        builder.edge::<First>("x", "", Some(a), b).unwrap();
        builder.edge::<First>("y", "", Some(a), a).unwrap();
        assert!(builder.build().is_err());

        let mut builder = DialogueGraph::builder();
        let a = builder.initial_node("a", "");
        builder.edge::<First>("x", "", Some(a), a).unwrap();
        builder.edge::<Second>("x", "", Some(a), a).unwrap();
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_protocol_digest_follows_graph() {
        let dialogue = Dialogue::new("abc", "0.1.0", abc()).unwrap();
        let expected = ProtocolSpecification::new("abc", "0.1.0")
            .interaction::<First>(MessageSet::of::<Second>())
            .unwrap()
            .interaction::<Second>(MessageSet::empty())
            .unwrap()
            .digest();
        assert_eq!(dialogue.digest(), expected);

        let protocol: Protocol = dialogue.into();
        assert!(protocol.has_handler(&First::schema_digest().unwrap()));
        assert!(protocol.has_handler(&Second::schema_digest().unwrap()));
        assert!(protocol.guard().is_some());
    }

    #[test]
    fn test_handler_binding_checks_model() {
        let mut dialogue = Dialogue::new("abc", "0.1.0", abc()).unwrap();
        assert!(dialogue
            .on_transition("a_to_b", |_ctx, _s, _m: First| async { Ok(()) })
            .is_ok());
        assert!(dialogue
            .on_transition("a_to_b", |_ctx, _s, _m: Second| async { Ok(()) })
            .is_err());
        assert!(dialogue
            .on_transition("missing", |_ctx, _s, _m: First| async { Ok(()) })
            .is_err());
        assert!(dialogue
            .on_start_dialogue(|_ctx, _s, _m: First| async { Ok(()) })
            .is_ok());
        assert!(dialogue
            .on_end_session(|_ctx, _s, _m: Second| async { Ok(()) })
            .is_ok());
        assert!(dialogue
            .on_continue_dialogue(|_ctx, _s, _m: First| async { Ok(()) })
            .is_err());
    }
}
