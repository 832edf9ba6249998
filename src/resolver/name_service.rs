//! `name.domain` resolution and the combined global resolver.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use super::almanac::{AlmanacApi, AlmanacResolver};
use super::{Resolution, Resolver};
use crate::error::Result;
use crate::identity::{is_valid_address, normalize_address};

/// Maps human-readable names to agent addresses.
#[async_trait]
pub trait NameService: Send + Sync {
    async fn lookup(&self, name: &str) -> Result<Option<String>>;
}

#[derive(Debug, Default)]
pub struct InMemoryNameService {
    names: RwLock<HashMap<String, String>>,
}

impl InMemoryNameService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, address: impl Into<String>) {
        self.names
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into().to_lowercase(), address.into());
    }
}

#[async_trait]
impl NameService for InMemoryNameService {
    async fn lookup(&self, name: &str) -> Result<Option<String>> {
        let names = self.names.read().unwrap_or_else(|e| e.into_inner());
        Ok(names.get(&name.to_lowercase()).cloned())
    }
}

fn name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9-]*(\.[a-zA-Z0-9][a-zA-Z0-9-]*)+$").ok())
        .as_ref()
}

/// Whether `identifier` looks like `name.domain` rather than an address.
pub fn is_name(identifier: &str) -> bool {
    let identifier = normalize_address(identifier);
    !is_valid_address(identifier) && name_pattern().is_some_and(|re| re.is_match(identifier))
}

/// Resolves a name to an address, then the address to endpoints.
#[derive(Clone)]
pub struct NameServiceResolver {
    names: Arc<dyn NameService>,
    almanac: AlmanacResolver,
}

impl NameServiceResolver {
    pub fn new(names: Arc<dyn NameService>, almanac: AlmanacResolver) -> Self {
        Self { names, almanac }
    }
}

#[async_trait]
impl Resolver for NameServiceResolver {
    async fn resolve(&self, destination: &str) -> Resolution {
        let name = normalize_address(destination);
        match self.names.lookup(name).await {
            Ok(Some(address)) => {
                tracing::debug!(name, %address, "Resolved name");
                self.almanac.resolve(&address).await
            }
            Ok(None) => {
                tracing::debug!(name, "Name not registered");
                Resolution::unresolved()
            }
            Err(e) => {
                tracing::warn!(name, "Name lookup failed: {}", e);
                Resolution::unresolved()
            }
        }
    }
}

/// Routes raw addresses to the Almanac and names through the name service.
#[derive(Clone)]
pub struct GlobalResolver {
    almanac: AlmanacResolver,
    names: Option<NameServiceResolver>,
}

impl GlobalResolver {
    pub fn new(almanac: Arc<dyn AlmanacApi>, max_endpoints: usize) -> Self {
        Self {
            almanac: AlmanacResolver::new(almanac).with_max_endpoints(max_endpoints),
            names: None,
        }
    }

    pub fn with_name_service(mut self, names: Arc<dyn NameService>) -> Self {
        self.names = Some(NameServiceResolver::new(names, self.almanac.clone()));
        self
    }
}

#[async_trait]
impl Resolver for GlobalResolver {
    async fn resolve(&self, destination: &str) -> Resolution {
        let identifier = normalize_address(destination);
        if is_valid_address(identifier) {
            return self.almanac.resolve(identifier).await;
        }
        match &self.names {
            Some(names) if is_name(identifier) => names.resolve(identifier).await,
            _ => {
                tracing::debug!(destination, "Destination is neither an address nor a known name");
                Resolution::unresolved()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::registration::{AgentEndpoint, AgentRegistration};
    use crate::resolver::InMemoryAlmanac;

    async fn registered_agent(almanac: &InMemoryAlmanac, seed: &str, url: &str) -> Identity {
        let id = Identity::from_seed(seed, 0).unwrap();
        let mut registration = AgentRegistration::new(
            id.address(),
            vec![AgentEndpoint::new(url, 1)],
            Vec::new(),
            1,
        );
        registration.sign(&id);
        almanac.register(&registration).await.unwrap();
        id
    }

    #[test]
    fn test_is_name() {
        assert!(is_name("alice.agent"));
        assert!(is_name("agent://bob.fetch.ai"));
        assert!(!is_name("alice"));
        assert!(!is_name("-bad.agent"));
        assert!(!is_name(Identity::generate().address()));
    }

    #[tokio::test]
    async fn test_name_resolves_through_almanac() {
        let almanac = Arc::new(InMemoryAlmanac::new());
        let id = registered_agent(&almanac, "named", "http://named/submit").await;
        let names = Arc::new(InMemoryNameService::new());
        names.register("Named.Agent", id.address());

        let resolver = GlobalResolver::new(almanac, 1).with_name_service(names);
        let resolution = resolver.resolve("named.agent").await;
        assert_eq!(resolution.address.as_deref(), Some(id.address()));
        assert_eq!(resolution.endpoints, vec!["http://named/submit".to_string()]);

        assert!(!resolver.resolve("unknown.agent").await.is_routable());
    }

    #[tokio::test]
    async fn test_global_resolver_routes_addresses() {
        let almanac = Arc::new(InMemoryAlmanac::new());
        let id = registered_agent(&almanac, "direct", "http://direct/submit").await;

        let resolver = GlobalResolver::new(almanac, 2);
        let resolution = resolver.resolve(&format!("test://{}", id.address())).await;
        assert_eq!(resolution.endpoints, vec!["http://direct/submit".to_string()]);

        assert!(!resolver.resolve("some.name").await.is_routable());
        assert!(!resolver.resolve("garbage").await.is_routable());
    }
}
