// packages/agent/src/resources/agent.rs
//! Workflow agent descriptors

use crate::resources::{LabelSelector, Resource, ResourceMetadata};
use crate::utils::errors::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Declares the capabilities of one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowAgent {
    pub metadata: ResourceMetadata,

    pub spec: WorkflowAgentSpec,
}

impl Resource for WorkflowAgent {
    const KIND: &'static str = "WorkflowAgent";

    fn metadata(&self) -> &ResourceMetadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ResourceMetadata {
        &mut self.metadata
    }
}

impl WorkflowAgent {
    pub fn new(metadata: ResourceMetadata, process_rules: Vec<ProcessRule>) -> Self {
        Self {
            metadata,
            spec: WorkflowAgentSpec { process_rules },
        }
    }

    /// Every workflow-language reference covered by at least one rule
    pub fn supported_languages(&self) -> BTreeSet<String> {
        self.spec
            .process_rules
            .iter()
            .flat_map(|r| r.supported_languages.iter().cloned())
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        let agent = self.qualified_name();
        if self.spec.process_rules.is_empty() {
            return Err(AgentError::InvalidResource(format!(
                "agent '{}' declares no process rules",
                agent
            )));
        }

        let mut names = HashSet::new();
        for rule in &self.spec.process_rules {
            if !names.insert(rule.name.as_str()) {
                return Err(AgentError::InvalidResource(format!(
                    "agent '{}' declares process rule '{}' more than once",
                    agent, rule.name
                )));
            }
            rule.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowAgentSpec {
    /// Rules in priority order: the first applicable rule wins
    pub process_rules: Vec<ProcessRule>,
}

/// Maps workflow languages (and optionally labels) to a process configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRule {
    /// Unique within the agent
    pub name: String,

    /// Workflow-language references (`name:version`) the rule can execute
    pub supported_languages: Vec<String>,

    /// All selectors must match the instance labels; no selectors match everything
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selectors: Vec<LabelSelector>,

    pub process: ProcessConfiguration,
}

impl ProcessRule {
    pub fn new(
        name: impl Into<String>,
        supported_languages: impl IntoIterator<Item = impl Into<String>>,
        process: ProcessConfiguration,
    ) -> Self {
        Self {
            name: name.into(),
            supported_languages: supported_languages.into_iter().map(Into::into).collect(),
            selectors: Vec::new(),
            process,
        }
    }

    pub fn with_selector(mut self, selector: LabelSelector) -> Self {
        self.selectors.push(selector);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AgentError::InvalidResource(
                "process rule name must not be empty".into(),
            ));
        }
        if self.supported_languages.is_empty() {
            return Err(AgentError::InvalidResource(format!(
                "process rule '{}' supports no workflow language",
                self.name
            )));
        }
        if let Some(language) = self
            .supported_languages
            .iter()
            .find(|l| !is_language_reference(l))
        {
            return Err(AgentError::InvalidResource(format!(
                "process rule '{}': '{}' is not a valid workflow language reference",
                self.name, language
            )));
        }
        self.process.validate()
    }
}

/// `name:version` with no blank component
fn is_language_reference(value: &str) -> bool {
    match value.split_once(':') {
        Some((name, version)) => {
            !name.trim().is_empty() && !version.trim().is_empty() && !version.contains(':')
        }
        None => false,
    }
}

/// Describes the process to create for a matched instance
///
/// Every field may contain `${{ ... }}` runtime expressions, resolved by the
/// instance manager before the configuration reaches a process manager.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessConfiguration {
    /// Program (or image, or workload) to run
    pub target: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment_variables: BTreeMap<String, String>,
}

impl ProcessConfiguration {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Default::default()
        }
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = Some(entry_point.into());
        self
    }

    pub fn with_argument(mut self, argument: impl Into<String>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_variables.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.target.trim().is_empty() {
            return Err(AgentError::InvalidResource(
                "process target must not be empty".into(),
            ));
        }
        Ok(())
    }
}
