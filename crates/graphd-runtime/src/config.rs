//! Configuration loading and validation.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> SocketAddr {
    "127.0.0.1:8080".parse().expect("static listen address")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Aggregate document path; absent means in-memory only.
    #[serde(default = "default_state_path")]
    pub path: Option<PathBuf>,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
            flush_interval_secs: default_flush_interval(),
        }
    }
}

fn default_state_path() -> Option<PathBuf> {
    Some(PathBuf::from("graphd-state.json"))
}

fn default_flush_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            grace_period_secs: default_grace_period(),
        }
    }
}

fn default_workers() -> usize {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_grace_period() -> u64 {
    30
}

/// A graph the server expects to find in the registry at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSpec {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphdConfig {
    pub version: u32,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub graphs: Vec<GraphSpec>,
}

impl Default for GraphdConfig {
    fn default() -> Self {
        Self {
            version: 1,
            server: ServerConfig::default(),
            state: StateConfig::default(),
            executor: ExecutorSection::default(),
            graphs: Vec::new(),
        }
    }
}

/// Load the full graphd configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<GraphdConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: GraphdConfig = serde_yaml::from_str(&content)?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &GraphdConfig) -> Result<(), ConfigError> {
    if config.version == 0 {
        return Err(ConfigError::Invalid(
            "version must be greater than 0".to_string(),
        ));
    }
    if config.executor.workers == 0 {
        return Err(ConfigError::Invalid(
            "executor.workers must be > 0".to_string(),
        ));
    }
    if config.executor.max_attempts == 0 {
        return Err(ConfigError::Invalid(
            "executor.max_attempts must be > 0".to_string(),
        ));
    }
    if config.state.flush_interval_secs == 0 {
        return Err(ConfigError::Invalid(
            "state.flush_interval_secs must be > 0".to_string(),
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for graph in &config.graphs {
        if graph.id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "graphs[].id must not be empty".to_string(),
            ));
        }
        if !seen.insert(graph.id.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate graph id '{}'",
                graph.id
            )));
        }
    }
    Ok(())
}
