// packages/agent/src/utils/errors.rs
//! Error types for the workflow agent

use thiserror::Error;

/// Agent error type
#[derive(Error, Debug)]
pub enum AgentError {
    /// A conditional write was rejected because the resource changed underneath it
    #[error("Conflict writing {kind} '{name}': resource version {version} is stale")]
    Conflict {
        kind: &'static str,
        name: String,
        version: u64,
    },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    /// The resource store can no longer be reached or its watch stream ended
    #[error("Resource store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    #[error("Expression error: {0}")]
    ExpressionError(String),

    #[error("Failed to spawn process: {0}")]
    ProcessSpawnFailed(String),

    #[error("Process error: {0}")]
    ProcessError(String),

    #[error("No process manager backend registered under '{0}'")]
    BackendNotFound(String),

    #[error("Gave up writing {kind} '{name}' after {attempts} conflicting attempts")]
    RetriesExhausted {
        kind: &'static str,
        name: String,
        attempts: u32,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Whether the error is a stale-version rejection that a re-fetch can resolve
    pub fn is_conflict(&self) -> bool {
        matches!(self, AgentError::Conflict { .. })
    }

    /// Whether the error should bring the whole agent down
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::StoreUnavailable(_) | AgentError::BackendNotFound(_)
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_classification() {
        let err = AgentError::Conflict {
            kind: "WorkflowInstance",
            name: "wf.default".to_string(),
            version: 3,
        };
        assert!(err.is_conflict());
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("wf.default"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(AgentError::StoreUnavailable("closed".into()).is_fatal());
        assert!(AgentError::BackendNotFound("docker".into()).is_fatal());
        assert!(!AgentError::Cancelled.is_fatal());
    }
}
