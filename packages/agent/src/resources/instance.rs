// packages/agent/src/resources/instance.rs
//! Workflow instances
//!
//! A `WorkflowInstance` is created externally in the `pending` phase without
//! a status. Exactly one agent claims it (ownership label + `status.agent`),
//! records one runtime session per process it starts, and tears the process
//! down once the instance reaches a terminal phase.

use crate::resources::{Resource, ResourceMetadata, AGENT_LABEL, DSL_LABEL};
use crate::utils::errors::{AgentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A unit of work executed by an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub metadata: ResourceMetadata,

    pub spec: WorkflowInstanceSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkflowInstanceStatus>,
}

impl Resource for WorkflowInstance {
    const KIND: &'static str = "WorkflowInstance";

    fn metadata(&self) -> &ResourceMetadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ResourceMetadata {
        &mut self.metadata
    }
}

impl WorkflowInstance {
    pub fn new(metadata: ResourceMetadata, spec: WorkflowInstanceSpec) -> Self {
        Self {
            metadata,
            spec,
            status: None,
        }
    }

    /// Qualified name of the owning agent, read from the ownership label
    pub fn owner(&self) -> Option<&str> {
        self.metadata.labels.get(AGENT_LABEL).map(String::as_str)
    }

    pub fn is_managed_by(&self, agent: &str) -> bool {
        self.owner() == Some(agent)
    }

    /// Workflow-language reference the instance must be executed with
    pub fn language(&self) -> Option<&str> {
        self.metadata.labels.get(DSL_LABEL).map(String::as_str)
    }

    /// Current phase; an instance without status is still pending
    pub fn phase(&self) -> WorkflowInstancePhase {
        self.status
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or(WorkflowInstancePhase::Pending)
    }

    /// The runtime session that has not been closed yet, if any
    pub fn open_runtime(&self) -> Option<&WorkflowInstanceRuntime> {
        self.status
            .as_ref()
            .and_then(|s| s.runtimes.iter().find(|r| r.is_open()))
    }

    pub fn open_runtime_count(&self) -> usize {
        self.status
            .as_ref()
            .map(|s| s.runtimes.iter().filter(|r| r.is_open()).count())
            .unwrap_or(0)
    }

    pub fn validate(&self) -> Result<()> {
        self.spec.validate()
    }
}

/// Immutable part of a workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstanceSpec {
    /// Workflow version to run
    pub workflow: WorkflowVersionReference,

    /// Caller-supplied key
    pub key: String,

    pub instantiation_type: WorkflowInstantiationType,

    /// Qualified name of the parent instance, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    /// Reference to the input data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_data: Option<String>,
}

impl WorkflowInstanceSpec {
    pub fn new(
        workflow: WorkflowVersionReference,
        key: impl Into<String>,
        instantiation_type: WorkflowInstantiationType,
    ) -> Self {
        Self {
            workflow,
            key: key.into(),
            instantiation_type,
            parent: None,
            input_data: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.key.len() < 3
            || self.key.len() > 63
            || !self.key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(AgentError::InvalidResource(format!(
                "'{}' is not a valid workflow instance key",
                self.key
            )));
        }
        if let Some(parent) = &self.parent {
            parent.parse::<crate::resources::QualifiedName>()?;
        }
        Ok(())
    }
}

/// How a workflow instance came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowInstantiationType {
    Manual,
    Parent,
    Trigger,
    Schedule,
}

/// `name.namespace:version` reference to a workflow version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkflowVersionReference {
    pub name: String,
    pub namespace: String,
    pub version: String,
}

impl WorkflowVersionReference {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for WorkflowVersionReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.name, self.namespace, self.version)
    }
}

impl FromStr for WorkflowVersionReference {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            AgentError::InvalidResource(format!(
                "'{}' is not a valid workflow version reference",
                s
            ))
        };
        let (qualified_name, version) = s.split_once(':').ok_or_else(invalid)?;
        let (name, namespace) = qualified_name.split_once('.').ok_or_else(invalid)?;
        if name.is_empty()
            || namespace.is_empty()
            || version.is_empty()
            || namespace.contains('.')
            || version.contains(':')
        {
            return Err(invalid());
        }
        Ok(Self::new(name, namespace, version))
    }
}

impl TryFrom<String> for WorkflowVersionReference {
    type Error = AgentError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<WorkflowVersionReference> for String {
    fn from(value: WorkflowVersionReference) -> Self {
        value.to_string()
    }
}

/// Phase of a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowInstancePhase {
    #[default]
    Pending,
    Running,
    Suspended,
    Faulted,
    Cancelled,
    Completed,
}

impl WorkflowInstancePhase {
    /// Phases after which the agent no longer runs a process for the instance
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowInstancePhase::Suspended
                | WorkflowInstancePhase::Faulted
                | WorkflowInstancePhase::Cancelled
                | WorkflowInstancePhase::Completed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowInstancePhase::Pending => "pending",
            WorkflowInstancePhase::Running => "running",
            WorkflowInstancePhase::Suspended => "suspended",
            WorkflowInstancePhase::Faulted => "faulted",
            WorkflowInstancePhase::Cancelled => "cancelled",
            WorkflowInstancePhase::Completed => "completed",
        }
    }
}

impl fmt::Display for WorkflowInstancePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable part of a workflow instance
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstanceStatus {
    pub phase: WorkflowInstancePhase,

    /// Qualified name of the agent that claimed the instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,

    /// Execution sessions, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runtimes: Vec<WorkflowInstanceRuntime>,

    /// Activity records, owned by the executing process
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub activities: Vec<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProblemDetails>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data: Option<String>,
}

impl WorkflowInstanceStatus {
    /// Initial status written by the agent that claims the instance
    pub fn claimed_by(agent: impl Into<String>) -> Self {
        Self {
            phase: WorkflowInstancePhase::Pending,
            agent: Some(agent.into()),
            ..Default::default()
        }
    }

    /// Set the end timestamp of every open session, returning how many were closed
    pub fn close_open_runtimes(&mut self, at: DateTime<Utc>) -> usize {
        let mut closed = 0;
        for runtime in self.runtimes.iter_mut().filter(|r| r.is_open()) {
            runtime.ended_at = Some(at);
            closed += 1;
        }
        closed
    }
}

/// Describes a problem that faulted an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: String,

    pub title: String,

    pub status: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One start/end-bounded execution session of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstanceRuntime {
    /// Qualified name of the agent that ran the process
    pub agent: String,

    pub process_id: String,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl WorkflowInstanceRuntime {
    pub fn new(agent: impl Into<String>, process_id: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            process_id: process_id.into(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceMetadata;

    fn instance() -> WorkflowInstance {
        WorkflowInstance::new(
            ResourceMetadata::new("default", "wf").with_label(DSL_LABEL, "greet:1.0.0"),
            WorkflowInstanceSpec::new(
                "greeter.default:1.0.0".parse().unwrap(),
                "key-1",
                WorkflowInstantiationType::Manual,
            ),
        )
    }

    #[test]
    fn test_version_reference_parse() {
        let reference: WorkflowVersionReference = "greeter.default:1.0.0".parse().unwrap();
        assert_eq!(reference.name, "greeter");
        assert_eq!(reference.namespace, "default");
        assert_eq!(reference.version, "1.0.0");
        assert_eq!(reference.to_string(), "greeter.default:1.0.0");

        assert!("greeter:1.0.0".parse::<WorkflowVersionReference>().is_err());
        assert!("greeter.default".parse::<WorkflowVersionReference>().is_err());
        assert!("greeter.default:".parse::<WorkflowVersionReference>().is_err());
    }

    #[test]
    fn test_instance_serialization_shape() {
        let json = serde_json::to_value(instance()).unwrap();
        assert_eq!(json["spec"]["workflow"], "greeter.default:1.0.0");
        assert_eq!(json["spec"]["instantiationType"], "manual");
        assert!(json.get("status").is_none());
    }

    #[test]
    fn test_phase_defaults_to_pending() {
        let wf = instance();
        assert_eq!(wf.phase(), WorkflowInstancePhase::Pending);
        assert_eq!(wf.language(), Some("greet:1.0.0"));
        assert!(wf.owner().is_none());
    }

    #[test]
    fn test_terminal_phases() {
        assert!(!WorkflowInstancePhase::Pending.is_terminal());
        assert!(!WorkflowInstancePhase::Running.is_terminal());
        assert!(WorkflowInstancePhase::Suspended.is_terminal());
        assert!(WorkflowInstancePhase::Faulted.is_terminal());
        assert!(WorkflowInstancePhase::Cancelled.is_terminal());
        assert!(WorkflowInstancePhase::Completed.is_terminal());
    }

    #[test]
    fn test_close_open_runtimes() {
        let mut wf = instance();
        let mut status = WorkflowInstanceStatus::claimed_by("agent.default");
        let mut closed = WorkflowInstanceRuntime::new("agent.default", "p-1");
        closed.ended_at = Some(Utc::now());
        status.runtimes.push(closed);
        status.runtimes.push(WorkflowInstanceRuntime::new("agent.default", "p-2"));
        wf.status = Some(status);

        assert_eq!(wf.open_runtime_count(), 1);
        assert_eq!(wf.open_runtime().unwrap().process_id, "p-2");

        let status = wf.status.as_mut().unwrap();
        assert_eq!(status.close_open_runtimes(Utc::now()), 1);
        assert_eq!(wf.open_runtime_count(), 0);
    }

    #[test]
    fn test_key_validation() {
        let mut wf = instance();
        assert!(wf.validate().is_ok());
        wf.spec.key = "a!".to_string();
        assert!(wf.validate().is_err());
    }
}
