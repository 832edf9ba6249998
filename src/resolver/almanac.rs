//! Almanac collaborator: the external registry of agent endpoints.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use super::sampling::weighted_random_sample;
use super::{Resolution, Resolver, DEFAULT_MAX_ENDPOINTS};
use crate::error::{Error, Result};
use crate::identity::normalize_address;
use crate::registration::{AgentEndpoint, AgentRegistration};

/// What the Almanac knows about one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub endpoints: Vec<AgentEndpoint>,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub sequence: u64,
}

impl From<&AgentRegistration> for AgentRecord {
    fn from(registration: &AgentRegistration) -> Self {
        Self {
            address: registration.agent_address.clone(),
            endpoints: registration.endpoints.clone(),
            protocols: registration.protocols.clone(),
            sequence: registration.sequence,
        }
    }
}

/// Lookup and registration against an Almanac.
#[async_trait]
pub trait AlmanacApi: Send + Sync {
    /// The record for `address`, or `None` when it is not registered.
    async fn get_record(&self, address: &str) -> Result<Option<AgentRecord>>;

    async fn register(&self, registration: &AgentRegistration) -> Result<()>;
}

/// Process-local Almanac, used by tests and single-host deployments.
#[derive(Debug, Default)]
pub struct InMemoryAlmanac {
    records: RwLock<HashMap<String, AgentRecord>>,
}

impl InMemoryAlmanac {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AlmanacApi for InMemoryAlmanac {
    async fn get_record(&self, address: &str) -> Result<Option<AgentRecord>> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(normalize_address(address)).cloned())
    }

    async fn register(&self, registration: &AgentRegistration) -> Result<()> {
        if !registration.verify() {
            return Err(Error::SignatureInvalid(format!(
                "registration for {} is not signed by that address",
                registration.agent_address
            )));
        }

        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = records.get(&registration.agent_address) {
            if registration.sequence <= existing.sequence {
                return Err(Error::ProtocolViolation(format!(
                    "stale registration sequence {} (current {})",
                    registration.sequence, existing.sequence
                )));
            }
        }
        records.insert(
            registration.agent_address.clone(),
            AgentRecord::from(registration),
        );
        tracing::debug!(agent = %registration.agent_address, "Registered agent in almanac");
        Ok(())
    }
}

/// HTTP client for a remote Almanac service.
pub struct HttpAlmanacClient {
    client: Client,
    base_url: String,
}

impl HttpAlmanacClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl AlmanacApi for HttpAlmanacClient {
    async fn get_record(&self, address: &str) -> Result<Option<AgentRecord>> {
        let address = normalize_address(address);
        let response = self
            .client
            .get(format!("{}/v1/almanac/agents/{}", self.base_url, address))
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "almanac lookup failed: {}",
                response.status()
            )));
        }

        let mut record: AgentRecord = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("invalid almanac record: {}", e)))?;
        if record.address.is_empty() {
            record.address = address.to_string();
        }
        Ok(Some(record))
    }

    async fn register(&self, registration: &AgentRegistration) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/v1/almanac/agents", self.base_url))
            .json(registration)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!(
                "almanac registration failed: {} {}",
                status, body
            )));
        }
        Ok(())
    }
}

/// Resolves addresses to a weighted sample of their registered endpoints.
#[derive(Clone)]
pub struct AlmanacResolver {
    almanac: Arc<dyn AlmanacApi>,
    max_endpoints: usize,
}

impl AlmanacResolver {
    pub fn new(almanac: Arc<dyn AlmanacApi>) -> Self {
        Self {
            almanac,
            max_endpoints: DEFAULT_MAX_ENDPOINTS,
        }
    }

    pub fn with_max_endpoints(mut self, max_endpoints: usize) -> Self {
        self.max_endpoints = max_endpoints.max(1);
        self
    }
}

fn select_endpoints(record: &AgentRecord, k: usize) -> Vec<String> {
    let urls: Vec<String> = record.endpoints.iter().map(|e| e.url.clone()).collect();
    let weights: Vec<f64> = record.endpoints.iter().map(|e| e.weight as f64).collect();
    weighted_random_sample(&urls, Some(&weights), k, &mut rand::thread_rng())
}

#[async_trait]
impl Resolver for AlmanacResolver {
    async fn resolve(&self, destination: &str) -> Resolution {
        let address = normalize_address(destination);
        match self.almanac.get_record(address).await {
            Ok(Some(record)) => {
                let endpoints = select_endpoints(&record, self.max_endpoints);
                if endpoints.is_empty() {
                    tracing::debug!(destination = address, "Almanac record has no endpoints");
                }
                Resolution {
                    address: Some(address.to_string()),
                    endpoints,
                }
            }
            Ok(None) => {
                tracing::debug!(destination = address, "Address not registered in almanac");
                Resolution::unresolved()
            }
            Err(e) => {
                tracing::warn!(destination = address, "Almanac lookup failed: {}", e);
                Resolution::unresolved()
            }
        }
    }
}
