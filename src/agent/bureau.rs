//! Bureau: several agents in one process, sharing a dispatcher and one
//! inbound endpoint.

use std::future::Future;
use std::sync::Arc;

use super::{history_for, Agent, AgentBuilder};
use crate::config::Settings;
use crate::core::Dispatcher;
use crate::error::{Error, Result};
use crate::web::{serve, ServerState};

pub struct Bureau {
    agents: Vec<Agent>,
    dispatcher: Arc<Dispatcher>,
    settings: Settings,
    port: Option<u16>,
}

impl Bureau {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        Self {
            agents: Vec::new(),
            dispatcher: Arc::new(Dispatcher::with_history(history_for(&settings))),
            port: settings.network.port,
            settings,
        }
    }

    /// Serve every hosted agent on this port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// A builder for an agent hosted here: shared dispatcher and settings,
    /// endpoint on the bureau's port.
    pub fn agent_builder(&self, name: impl Into<String>) -> AgentBuilder {
        let builder = AgentBuilder::new(name)
            .settings(self.settings.clone())
            .dispatcher(self.dispatcher());
        match self.port {
            Some(port) => builder.endpoint(format!("http://127.0.0.1:{}/submit", port)),
            None => builder,
        }
    }

    /// Host `agent`. It must have been built on this bureau's dispatcher.
    pub fn add(&mut self, agent: Agent) -> Result<()> {
        if !Arc::ptr_eq(&agent.runtime.dispatcher, &self.dispatcher) {
            return Err(Error::Config(format!(
                "agent {} does not use this bureau's dispatcher",
                agent.name()
            )));
        }
        tracing::debug!(agent = %agent.name(), "Added agent to bureau");
        self.agents.push(agent);
        Ok(())
    }

    pub fn addresses(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.address().to_string()).collect()
    }

    /// Start every agent and run until `shutdown` completes.
    pub async fn run_until<F: Future<Output = ()>>(mut self, shutdown: F) -> Result<()> {
        let state = ServerState::new(self.settings.agent.response_timeout());
        let mut running = Vec::with_capacity(self.agents.len());
        for agent in &mut self.agents {
            running.push(agent.start()?);
            state.insert(agent.runtime());
        }

        let server = self.port.map(|port| {
            let host = self.settings.network.host.clone();
            tokio::spawn(async move {
                if let Err(e) = serve(&host, port, state).await {
                    tracing::error!("Bureau endpoint failed: {}", e);
                }
            })
        });

        for agent in &self.agents {
            if agent.almanac.is_some() {
                if let Err(e) = agent.register().await {
                    tracing::warn!(agent = %agent.name(), "Almanac registration failed: {}", e);
                }
            }
        }

        tracing::info!(agents = self.agents.len(), "Bureau running");
        shutdown.await;

        if let Some(server) = server {
            server.abort();
        }
        for agent in running {
            agent.stop();
        }
        tracing::info!("Bureau stopped");
        Ok(())
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    }
}

impl Default for Bureau {
    fn default() -> Self {
        Self::new()
    }
}
