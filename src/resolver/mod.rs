//! Mapping agent addresses and names to network endpoints.

pub mod almanac;
pub mod name_service;
pub mod rules;
pub mod sampling;

use async_trait::async_trait;

pub use almanac::{AgentRecord, AlmanacApi, AlmanacResolver, HttpAlmanacClient, InMemoryAlmanac};
pub use name_service::{GlobalResolver, InMemoryNameService, NameService, NameServiceResolver};
pub use rules::RulesBasedResolver;
pub use sampling::weighted_random_sample;

/// Default number of endpoints sampled per resolution.
pub const DEFAULT_MAX_ENDPOINTS: usize = 1;

/// Result of resolving a destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Agent address the destination maps to, when known
    pub address: Option<String>,
    /// Candidate endpoints, in preference order
    pub endpoints: Vec<String>,
}

impl Resolution {
    pub fn unresolved() -> Self {
        Self::default()
    }

    pub fn is_routable(&self) -> bool {
        !self.endpoints.is_empty()
    }
}

/// Endpoint resolution. An empty endpoint list means "no route" and is not
/// an error.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, destination: &str) -> Resolution;
}
