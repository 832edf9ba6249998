//! Configuration loading for uagents.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Get the uagents home directory (~/.uagents).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".uagents"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.uagents/settings.json
pub fn load_settings() -> Result<Settings> {
    let path = get_settings_path()?;

    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}",
            path.display()
        )));
    }

    load_settings_from(&path)
}

/// Load and validate settings from an explicit path.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    let content = std::fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&content)?;

    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Load settings or return default if not found.
pub fn load_settings_or_default() -> Settings {
    load_settings().unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
        Settings::default()
    })
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    let agent = &settings.agent;
    if agent.envelope_expiry_secs == 0 {
        return Err(Error::Config(
            "agent.envelope_expiry_secs must be greater than zero".to_string(),
        ));
    }
    if agent.response_timeout_secs == 0 {
        return Err(Error::Config(
            "agent.response_timeout_secs must be greater than zero".to_string(),
        ));
    }
    if agent.history_capacity == 0 {
        return Err(Error::Config(
            "agent.history_capacity must be greater than zero".to_string(),
        ));
    }
    if settings.network.http_timeout_secs == 0 {
        return Err(Error::Config(
            "network.http_timeout_secs must be greater than zero".to_string(),
        ));
    }
    if settings.network.max_endpoints == 0 {
        return Err(Error::Config(
            "network.max_endpoints must be at least 1".to_string(),
        ));
    }
    if let Some(url) = settings.almanac.api_url.as_deref() {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "almanac.api_url '{}' must be an http(s) URL",
                url
            )));
        }
    }
    Ok(())
}

/// Per-agent runtime behaviour.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AgentSettings {
    /// Lifetime of outbound envelopes, in seconds.
    #[serde(default = "default_envelope_expiry_secs")]
    pub envelope_expiry_secs: u64,
    /// How long a synchronous inbound request waits for the handler's reply.
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Optional JSONL file receiving a copy of every history record.
    #[serde(default)]
    pub history_log: Option<PathBuf>,
}

fn default_envelope_expiry_secs() -> u64 {
    30
}

fn default_response_timeout_secs() -> u64 {
    30
}

fn default_history_capacity() -> usize {
    1000
}

impl AgentSettings {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            envelope_expiry_secs: default_envelope_expiry_secs(),
            response_timeout_secs: default_response_timeout_secs(),
            history_capacity: default_history_capacity(),
            history_log: None,
        }
    }
}

/// Network configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NetworkSettings {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: Option<u16>,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    /// Upper bound on endpoints sampled per resolution.
    #[serde(default = "default_max_endpoints")]
    pub max_endpoints: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_timeout_secs() -> u64 {
    10
}

fn default_max_endpoints() -> usize {
    3
}

impl NetworkSettings {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            http_timeout_secs: default_http_timeout_secs(),
            max_endpoints: default_max_endpoints(),
        }
    }
}

/// Storage configuration. Without a directory agents keep state in memory.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct StorageSettings {
    pub dir: Option<PathBuf>,
}

/// Almanac configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct AlmanacSettings {
    pub api_url: Option<String>,
}

/// Main settings structure.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub almanac: AlmanacSettings,
}
