// packages/agent/src/resources/mod.rs
//! Resource model shared with the resource store
//!
//! Every resource is a `{ metadata, spec, status? }` document. The store
//! versions each write through `metadata.resourceVersion`; the agent never
//! interprets the version beyond handing it back on conditional writes.
//!
//! - **WorkflowInstance**: a unit of work, claimed and executed by one agent
//! - **WorkflowAgent**: the capability descriptor of one agent
//! - **LabelSelector**: declarative label matching used by rules and watches

pub mod agent;
pub mod instance;
pub mod selector;

pub use agent::{ProcessConfiguration, ProcessRule, WorkflowAgent, WorkflowAgentSpec};
pub use instance::{
    ProblemDetails, WorkflowInstance, WorkflowInstancePhase, WorkflowInstanceRuntime,
    WorkflowInstanceSpec, WorkflowInstanceStatus, WorkflowInstantiationType,
    WorkflowVersionReference,
};
pub use selector::{LabelSelectionOperator, LabelSelector};

use crate::utils::errors::{AgentError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Namespace used when none is specified
pub const DEFAULT_NAMESPACE: &str = "default";

/// Reserved label recording the qualified name of the owning agent
pub const AGENT_LABEL: &str = "workflow-agent.io/agent";

/// Reserved label carrying the instance's workflow-language reference
pub const DSL_LABEL: &str = "workflow-agent.io/dsl";

/// Labels attached to a resource
pub type Labels = BTreeMap<String, String>;

/// Namespace + name pair uniquely identifying a resource of a given kind
///
/// Rendered as `name.namespace`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedName {
    pub namespace: String,
    pub name: String,
}

impl QualifiedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.namespace)
    }
}

impl FromStr for QualifiedName {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((name, namespace))
                if !name.is_empty() && !namespace.is_empty() && !namespace.contains('.') =>
            {
                Ok(Self::new(namespace, name))
            }
            _ => Err(AgentError::InvalidResource(format!(
                "'{}' is not a valid qualified name",
                s
            ))),
        }
    }
}

/// Metadata common to every resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    pub name: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: Labels,

    /// Version assigned by the store on every write
    #[serde(default)]
    pub resource_version: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl ResourceMetadata {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels: Labels::new(),
            resource_version: 0,
            creation_timestamp: None,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn qualified_name(&self) -> QualifiedName {
        QualifiedName::new(&self.namespace, &self.name)
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

/// A typed resource managed by the store
pub trait Resource:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Kind name, unique per resource type
    const KIND: &'static str;

    fn metadata(&self) -> &ResourceMetadata;

    fn metadata_mut(&mut self) -> &mut ResourceMetadata;

    fn qualified_name(&self) -> QualifiedName {
        self.metadata().qualified_name()
    }

    fn labels(&self) -> &Labels {
        &self.metadata().labels
    }

    fn resource_version(&self) -> u64 {
        self.metadata().resource_version
    }
}
