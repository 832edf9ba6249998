//! Core module - local dispatch, protocols and dialogues.
//!
//! - Dispatcher: in-process routing between co-hosted agents
//! - Protocol: handler bundles with a structural digest
//! - ProtocolSpecification: declared interaction graphs and roles
//! - Dialogue: per-session state machines over a protocol

pub mod dialogue;
pub mod dispatcher;
pub mod protocol;
pub mod spec;

pub use dialogue::{Dialogue, DialogueGraph, DialogueGraphBuilder, DialogueTracker, Edge, EdgeId, Node, NodeId};
pub use dispatcher::{Dispatcher, Sink};
pub use protocol::{HandlerFuture, IntervalHandler, Manifest, MessageHandler, Protocol};
pub use spec::{MessageSet, ProtocolSpecification};
