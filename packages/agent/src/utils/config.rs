// packages/agent/src/utils/config.rs
//! Agent configuration
//!
//! Configuration is layered, lowest priority first:
//!
//! 1. Built-in defaults
//! 2. `config/agent.{yaml,toml,json}` (or the file named by `WORKFLOW_AGENT_CONFIG`)
//! 3. Environment variables, e.g. `WORKFLOW_AGENT__CLAIM__MAX_ATTEMPTS=128`
//!
//! The agent identity is read once from `WORKFLOW_AGENT_NAME` and
//! `WORKFLOW_AGENT_NAMESPACE`, which win over every other layer.

use crate::resources::{QualifiedName, DEFAULT_NAMESPACE};
use crate::utils::errors::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable holding the agent name
pub const AGENT_NAME_ENV: &str = "WORKFLOW_AGENT_NAME";

/// Environment variable holding the agent namespace
pub const AGENT_NAMESPACE_ENV: &str = "WORKFLOW_AGENT_NAMESPACE";

/// Environment variable pointing at an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "WORKFLOW_AGENT_CONFIG";

const DEFAULT_CONFIG_FILE: &str = "config/agent";

/// Top-level agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentIdentityConfig,
    pub controller: ControllerConfig,
    pub claim: ClaimConfig,
    pub process_manager: ProcessManagerConfig,
    pub store: StoreConfig,
    pub observability: ObservabilityConfig,
}

/// Identity of this agent instance and instance-watch scope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentIdentityConfig {
    /// Name of the `WorkflowAgent` resource describing this agent
    pub name: String,

    /// Namespace of the `WorkflowAgent` resource
    pub namespace: String,

    /// Restrict the instance watch to one namespace (all namespaces when unset)
    pub watch_namespace: Option<String>,

    /// Number of instances reconciled concurrently during the startup replay
    pub replay_concurrency: usize,
}

impl Default for AgentIdentityConfig {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            watch_namespace: None,
            replay_concurrency: 8,
        }
    }
}

impl AgentIdentityConfig {
    pub fn qualified_name(&self) -> QualifiedName {
        QualifiedName::new(&self.namespace, &self.name)
    }
}

/// Watch/reconcile controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Periodic re-list interval in seconds (0 disables resync)
    pub resync_interval_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_interval_secs: 300,
        }
    }
}

impl ControllerConfig {
    pub fn resync_interval(&self) -> Option<Duration> {
        match self.resync_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Retry policy for conditional writes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimConfig {
    /// Maximum number of conflicting write attempts before giving up
    pub max_attempts: u32,

    /// Base backoff between attempts in milliseconds
    pub backoff_base_ms: u64,

    /// Upper bound for the backoff in milliseconds
    pub backoff_max_ms: u64,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            max_attempts: 64,
            backoff_base_ms: 5,
            backoff_max_ms: 250,
        }
    }
}

/// Process manager backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessManagerConfig {
    /// Registered backend identifier
    pub backend: String,

    /// Working directory for spawned processes
    pub working_directory: Option<PathBuf>,

    /// Time given to a process between SIGTERM and SIGKILL
    pub stop_grace_period_secs: u64,

    /// Number of output lines retained per process
    pub log_capacity: usize,

    /// Minimum delay before retrying an instance whose process failed to start
    pub start_retry_backoff_ms: u64,
}

impl Default for ProcessManagerConfig {
    fn default() -> Self {
        Self {
            backend: "native".to_string(),
            working_directory: None,
            stop_grace_period_secs: 5,
            log_capacity: 1000,
            start_retry_backoff_ms: 5000,
        }
    }
}

impl ProcessManagerConfig {
    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }

    pub fn start_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.start_retry_backoff_ms)
    }
}

/// Resource store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// YAML document loaded into the store at startup
    pub seed_path: Option<PathBuf>,
}

/// Logging and metrics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default `EnvFilter` directive, overridden by `RUST_LOG`
    pub log_filter: String,

    /// `pretty` or `json`
    pub log_format: LogFormat,

    /// Prometheus exporter listen address (disabled when unset)
    pub metrics_listen: Option<SocketAddr>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: "info,workflow_agent=debug".to_string(),
            log_format: LogFormat::Pretty,
            metrics_listen: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl AgentConfig {
    /// Load configuration from defaults, file and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).ok();
        let mut config = Self::load_from(path.as_deref())?;
        config.apply_identity_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an explicit file (or the default location)
    pub fn load_from(path: Option<&str>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::with_name(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("WORKFLOW_AGENT")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Override the identity from `WORKFLOW_AGENT_NAME` / `WORKFLOW_AGENT_NAMESPACE`
    pub fn apply_identity_env(&mut self) {
        if let Some(name) = non_empty_env(AGENT_NAME_ENV) {
            self.agent.name = name;
        }
        if let Some(namespace) = non_empty_env(AGENT_NAMESPACE_ENV) {
            self.agent.namespace = namespace;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.name.trim().is_empty() {
            return Err(AgentError::ConfigError("agent name must not be empty".into()));
        }
        if self.agent.namespace.trim().is_empty() {
            return Err(AgentError::ConfigError(
                "agent namespace must not be empty".into(),
            ));
        }
        if self.agent.replay_concurrency == 0 {
            return Err(AgentError::ConfigError(
                "replay_concurrency must be at least 1".into(),
            ));
        }
        if self.claim.max_attempts == 0 {
            return Err(AgentError::ConfigError(
                "claim.max_attempts must be at least 1".into(),
            ));
        }
        if self.process_manager.backend.trim().is_empty() {
            return Err(AgentError::ConfigError(
                "process_manager.backend must not be empty".into(),
            ));
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn default_agent_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "workflow-agent".to_string())
}
