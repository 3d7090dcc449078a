// packages/agent/src/agent/process_table.rs
//! Locally tracked processes, keyed by instance

use crate::resources::QualifiedName;
use crate::runtime::Process;
use dashmap::DashMap;
use std::sync::Arc;

/// Instance → process map with atomic per-key updates
#[derive(Default)]
pub struct ProcessTable {
    processes: DashMap<QualifiedName, Arc<dyn Process>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, instance: &QualifiedName) -> Option<Arc<dyn Process>> {
        self.processes.get(instance).map(|p| Arc::clone(p.value()))
    }

    pub fn contains(&self, instance: &QualifiedName) -> bool {
        self.processes.contains_key(instance)
    }

    /// Track `process` for `instance`, returning the process it displaced
    ///
    /// The caller owns the displaced process and must stop it.
    pub fn insert_or_replace(
        &self,
        instance: QualifiedName,
        process: Arc<dyn Process>,
    ) -> Option<Arc<dyn Process>> {
        let displaced = self.processes.insert(instance, process);
        self.record_size();
        displaced
    }

    /// Stop tracking `instance`
    pub fn remove(&self, instance: &QualifiedName) -> Option<Arc<dyn Process>> {
        let removed = self.processes.remove(instance).map(|(_, p)| p);
        self.record_size();
        removed
    }

    /// Remove `instance` only if it is still tracked with the process `id`
    pub fn remove_if_current(&self, instance: &QualifiedName, id: &str) -> Option<Arc<dyn Process>> {
        let removed = self
            .processes
            .remove_if(instance, |_, p| p.id() == id)
            .map(|(_, p)| p);
        self.record_size();
        removed
    }

    /// Remove and return every tracked process
    pub fn drain(&self) -> Vec<(QualifiedName, Arc<dyn Process>)> {
        let keys: Vec<QualifiedName> = self.processes.iter().map(|e| e.key().clone()).collect();
        let drained = keys
            .into_iter()
            .filter_map(|key| self.processes.remove(&key))
            .collect();
        self.record_size();
        drained
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    fn record_size(&self) {
        metrics::gauge!("workflow_agent_tracked_processes").set(self.processes.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ExitSignal, ProcessPhase};
    use crate::utils::errors::Result;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct Stub {
        id: String,
        exit: ExitSignal,
    }

    fn stub(id: &str) -> Arc<dyn Process> {
        let (_, exit) = ExitSignal::channel();
        Arc::new(Stub {
            id: id.to_string(),
            exit,
        })
    }

    #[async_trait]
    impl Process for Stub {
        fn id(&self) -> &str {
            &self.id
        }

        fn phase(&self) -> ProcessPhase {
            ProcessPhase::Pending
        }

        fn exit_code(&self) -> Option<i64> {
            None
        }

        fn exited(&self) -> ExitSignal {
            self.exit.clone()
        }

        async fn start(&self, _cancel: &CancellationToken) -> Result<()> {
            Ok(())
        }

        async fn stop(&self, _cancel: &CancellationToken) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_insert_or_replace_returns_displaced() {
        let table = ProcessTable::new();
        let key = QualifiedName::new("default", "wf");

        assert!(table.insert_or_replace(key.clone(), stub("p-1")).is_none());
        let displaced = table.insert_or_replace(key.clone(), stub("p-2")).unwrap();
        assert_eq!(displaced.id(), "p-1");
        assert_eq!(table.get(&key).unwrap().id(), "p-2");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_if_current() {
        let table = ProcessTable::new();
        let key = QualifiedName::new("default", "wf");
        table.insert_or_replace(key.clone(), stub("p-2"));

        assert!(table.remove_if_current(&key, "p-1").is_none());
        assert!(table.contains(&key));
        assert_eq!(table.remove_if_current(&key, "p-2").unwrap().id(), "p-2");
        assert!(table.is_empty());
    }

    #[test]
    fn test_drain() {
        let table = ProcessTable::new();
        table.insert_or_replace(QualifiedName::new("default", "a"), stub("p-1"));
        table.insert_or_replace(QualifiedName::new("default", "b"), stub("p-2"));

        let mut drained: Vec<String> = table.drain().into_iter().map(|(k, _)| k.name).collect();
        drained.sort();
        assert_eq!(drained, vec!["a", "b"]);
        assert!(table.is_empty());
    }
}
