//! Inbound HTTP server using Axum.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use super::router::create_router;
use crate::agent::runtime::AgentRuntime;
use crate::error::{Error, Result};
use crate::identity::normalize_address;

/// Agents reachable through one endpoint, keyed by address.
#[derive(Clone)]
pub(crate) struct ServerState {
    agents: Arc<RwLock<HashMap<String, Arc<AgentRuntime>>>>,
    pub(crate) response_timeout: Duration,
}

impl ServerState {
    pub(crate) fn new(response_timeout: Duration) -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            response_timeout,
        }
    }

    pub(crate) fn insert(&self, runtime: Arc<AgentRuntime>) {
        self.agents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(runtime.address().to_string(), runtime);
    }

    pub(crate) fn get(&self, address: &str) -> Option<Arc<AgentRuntime>> {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(normalize_address(address))
            .cloned()
    }
}

/// Serve `/submit` and `/health` on `host:port` until the task is aborted.
pub(crate) async fn serve(host: &str, port: u16, state: ServerState) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| Error::Config(format!("Invalid address {}:{}: {}", host, port, e)))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening for envelopes on {}", addr);

    axum::serve(listener, create_router(state)).await?;
    Ok(())
}
