// packages/agent/src/store/seed.rs
//! Startup seeding of the resource store
//!
//! A seed document is YAML with two optional lists:
//!
//! ```yaml
//! agents:
//!   - metadata: { name: agent-1, namespace: default }
//!     spec:
//!       processRules:
//!         - name: r1
//!           supportedLanguages: ["greet:1.0.0"]
//!           process: { target: echo }
//! instances:
//!   - metadata:
//!       name: wf
//!       labels: { "workflow-agent.io/dsl": "greet:1.0.0" }
//!     spec: { workflow: "greeter.default:1.0.0", key: k-1, instantiationType: manual }
//! ```
//!
//! Resources that already exist are left untouched.

use crate::resources::{Resource, WorkflowAgent, WorkflowInstance};
use crate::store::ResourceStore;
use crate::utils::errors::{AgentError, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Default, Deserialize)]
pub struct SeedDocument {
    #[serde(default)]
    pub agents: Vec<WorkflowAgent>,

    #[serde(default)]
    pub instances: Vec<WorkflowInstance>,
}

/// Counts of what a seed run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub created: usize,
    pub skipped: usize,
}

impl SeedDocument {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let document: SeedDocument = serde_yaml::from_str(yaml)?;
        for agent in &document.agents {
            agent.validate()?;
        }
        for instance in &document.instances {
            instance.validate()?;
        }
        Ok(document)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let yaml = tokio::fs::read_to_string(path).await?;
        Self::from_yaml(&yaml)
    }

    /// Create every resource of the document that does not exist yet
    pub async fn apply<S: ResourceStore>(self, store: &S) -> Result<SeedReport> {
        let mut report = SeedReport::default();
        for agent in self.agents {
            create_if_missing(store, agent, &mut report).await?;
        }
        for mut instance in self.instances {
            // instances always start unclaimed
            instance.status = None;
            create_if_missing(store, instance, &mut report).await?;
        }
        info!(
            "Seeded resource store: {} created, {} already present",
            report.created, report.skipped
        );
        Ok(report)
    }
}

async fn create_if_missing<S: ResourceStore, R: Resource>(
    store: &S,
    mut resource: R,
    report: &mut SeedReport,
) -> Result<()> {
    resource.metadata_mut().resource_version = 0;
    let name = resource.qualified_name();
    match store.create(resource).await {
        Ok(_) => {
            debug!("Seeded {} '{}'", R::KIND, name);
            report.created += 1;
            Ok(())
        }
        Err(AgentError::AlreadyExists { .. }) => {
            debug!("{} '{}' already exists, not seeding", R::KIND, name);
            report.skipped += 1;
            Ok(())
        }
        Err(e) => Err(e),
    }
}
