//! Configuration loading
//!
//! Layers, lowest priority first: embedded defaults, an optional TOML file,
//! then `CONCLAVE_*` environment variables (`__` separates nested keys).

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::error::Result;
use crate::orchestrator::OrchestratorSettings;

/// Embedded default configuration
pub const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// File picked up from the working directory when no path is given
pub const LOCAL_CONFIG: &str = "conclave";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConclaveConfig {
    #[serde(default)]
    pub log: LogConfig,
    pub orchestrator: OrchestratorConfig,
    pub agent: AgentDefaults,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    /// JSONL file backing the message log; in-memory when unset
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrchestratorConfig {
    pub name: String,
    pub liveness_timeout_ms: u64,
    pub sweep_interval_ms: u64,
}

impl OrchestratorConfig {
    pub fn settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            name: self.name.clone(),
            liveness_timeout: Duration::from_millis(self.liveness_timeout_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms.max(1)),
        }
    }
}

/// Settings shared by every agent runtime
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentDefaults {
    pub heartbeat_interval_ms: u64,
    pub command_timeout_secs: u64,
    pub shell: String,
}

impl AgentDefaults {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

/// One agent to start with the session
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Program that performs this agent's operations
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ConclaveConfig {
    /// Load defaults, then `path` (or `./conclave.toml` if present), then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(LOCAL_CONFIG).required(false),
        };

        let config = Config::builder()
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
            .add_source(file)
            .add_source(
                Environment::with_prefix("CONCLAVE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Configured agents, or one echo agent per built-in role
    pub fn agent_roster(&self) -> Vec<AgentConfig> {
        if !self.agents.is_empty() {
            return self.agents.clone();
        }
        ["research", "coding", "testing"]
            .into_iter()
            .map(|role| AgentConfig {
                name: format!("{role}-agent"),
                role: role.to_string(),
                capabilities: Vec::new(),
                program: Some("echo".to_string()),
                args: Vec::new(),
            })
            .collect()
    }

    /// Parse a TOML document layered over the defaults
    pub fn from_toml(toml: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
