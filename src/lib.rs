//! uagents: autonomous agents exchanging signed, typed messages.
//!
//! An [`Agent`] owns an [`Identity`], includes [`Protocol`]s (or
//! [`Dialogue`]s) and runs their handlers; a [`Bureau`] hosts several agents
//! behind one endpoint.

pub mod agent;
pub mod cli;
pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod identity;
pub mod logging;
pub mod model;
pub mod protocol;
pub mod registration;
pub mod resolver;
pub mod storage;
pub mod transport;
pub(crate) mod web;

pub use agent::{Agent, AgentBuilder, Bureau, IntervalTask};
pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use context::Context;
pub use core::{
    Dialogue, DialogueGraph, DialogueTracker, Dispatcher, MessageSet, Protocol,
    ProtocolSpecification,
};
pub use error::{Error, Result};
pub use identity::Identity;
pub use model::{Model, ModelInfo};
pub use protocol::{DeliveryStatus, Envelope, EnvelopeBuilder, MsgStatus};
pub use registration::{AgentEndpoint, AgentRegistration};
pub use resolver::{AlmanacApi, InMemoryAlmanac, Resolver, RulesBasedResolver};
pub use storage::{KeyValueStore, MemoryStore};
pub use transport::send_sync_message;
