// packages/agent/src/runtime/registry.rs
//! Startup-time registry of process manager backends
//!
//! Backends register a factory under an identifier; the agent resolves the
//! configured backend exactly once at startup. An unknown backend is fatal.

use crate::runtime::native::{NativeProcessManager, NATIVE_BACKEND};
use crate::runtime::process_manager::ProcessManager;
use crate::utils::config::ProcessManagerConfig;
use crate::utils::errors::{AgentError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Builds a process manager from its configuration
pub type ProcessManagerFactory = fn(&ProcessManagerConfig) -> Result<Arc<dyn ProcessManager>>;

/// Backend identifier → factory
pub struct ProcessManagerRegistry {
    factories: BTreeMap<String, ProcessManagerFactory>,
}

impl ProcessManagerRegistry {
    /// Registry without any backend
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the built-in backends
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(NATIVE_BACKEND, NativeProcessManager::factory);
        registry
    }

    /// Register a backend, replacing any previous factory with the same id
    pub fn register(&mut self, backend: impl Into<String>, factory: ProcessManagerFactory) {
        self.factories.insert(backend.into(), factory);
    }

    pub fn backends(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build the process manager selected by `config.backend`
    pub fn resolve(&self, config: &ProcessManagerConfig) -> Result<Arc<dyn ProcessManager>> {
        let factory = self.factories.get(&config.backend).ok_or_else(|| {
            AgentError::BackendNotFound(format!(
                "'{}' (available: {})",
                config.backend,
                self.backends().join(", ")
            ))
        })?;
        let manager = factory(config)?;
        info!("Using process manager backend '{}'", config.backend);
        Ok(manager)
    }
}

impl Default for ProcessManagerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_backend_is_built_in() {
        let registry = ProcessManagerRegistry::default();
        assert_eq!(registry.backends(), vec!["native"]);

        let manager = registry.resolve(&ProcessManagerConfig::default()).unwrap();
        assert_eq!(manager.backend(), "native");
    }

    #[test]
    fn test_unknown_backend_is_fatal() {
        let registry = ProcessManagerRegistry::default();
        let config = ProcessManagerConfig {
            backend: "docker".into(),
            ..Default::default()
        };
        let err = registry.resolve(&config).err().unwrap();
        assert!(matches!(err, AgentError::BackendNotFound(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_custom_backend_registration() {
        fn aliased(config: &ProcessManagerConfig) -> Result<Arc<dyn ProcessManager>> {
            NativeProcessManager::factory(config)
        }

        let mut registry = ProcessManagerRegistry::empty();
        assert!(registry.resolve(&ProcessManagerConfig::default()).is_err());

        registry.register("local", aliased);
        let config = ProcessManagerConfig {
            backend: "local".into(),
            ..Default::default()
        };
        assert!(registry.resolve(&config).is_ok());
    }
}
