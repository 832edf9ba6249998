//! Fixed routing table resolver for tests and static topologies.

use async_trait::async_trait;
use std::collections::HashMap;

use super::{Resolution, Resolver};
use crate::identity::normalize_address;

/// Resolves destinations through a static destination -> endpoints table.
#[derive(Debug, Clone, Default)]
pub struct RulesBasedResolver {
    rules: HashMap<String, Vec<String>>,
}

impl RulesBasedResolver {
    /// One endpoint per destination.
    pub fn new(rules: HashMap<String, String>) -> Self {
        Self {
            rules: rules.into_iter().map(|(k, v)| (k, vec![v])).collect(),
        }
    }

    pub fn with_endpoints(rules: HashMap<String, Vec<String>>) -> Self {
        Self { rules }
    }

    pub fn insert(&mut self, destination: impl Into<String>, endpoint: impl Into<String>) {
        self.rules
            .entry(destination.into())
            .or_default()
            .push(endpoint.into());
    }
}

#[async_trait]
impl Resolver for RulesBasedResolver {
    async fn resolve(&self, destination: &str) -> Resolution {
        let endpoints = self
            .rules
            .get(destination)
            .or_else(|| self.rules.get(normalize_address(destination)))
            .cloned()
            .unwrap_or_default();

        if endpoints.is_empty() {
            tracing::debug!(destination, "No rule for destination");
            return Resolution::unresolved();
        }
        Resolution {
            address: Some(normalize_address(destination).to_string()),
            endpoints,
        }
    }
}
