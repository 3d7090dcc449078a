// packages/agent/src/runtime/expressions.rs
//! `${{ path }}` placeholders in process configurations
//!
//! Placeholders are replaced by values taken from the instance being run
//! and the agent running it:
//!
//! | path                   | value                               |
//! |------------------------|-------------------------------------|
//! | `instance.name`        | instance name                       |
//! | `instance.namespace`   | instance namespace                  |
//! | `instance.qualifiedName` | `name.namespace`                  |
//! | `instance.key`         | instance key                        |
//! | `instance.workflow`    | `name.namespace:version`            |
//! | `instance.dsl`         | workflow-language reference label   |
//! | `agent.name`           | agent name                          |
//! | `agent.namespace`      | agent namespace                     |
//! | `agent.qualifiedName`  | `name.namespace`                    |

use crate::resources::{ProcessConfiguration, QualifiedName, Resource, WorkflowInstance};
use crate::utils::errors::{AgentError, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::BTreeMap;

static EXPRESSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{\{\s*([^}]*?)\s*\}\}").unwrap());

/// Environment variable carrying the qualified name of the instance
pub const INSTANCE_ENV: &str = "WORKFLOW_INSTANCE";

/// Environment variable carrying the qualified name of the agent
pub const AGENT_ENV: &str = "WORKFLOW_AGENT";

/// Values available to placeholders
#[derive(Debug, Clone, Default)]
pub struct ExpressionScope {
    values: BTreeMap<String, String>,
}

impl ExpressionScope {
    pub fn new(instance: &WorkflowInstance, agent: &QualifiedName) -> Self {
        let mut values = BTreeMap::new();
        let metadata = instance.metadata();
        values.insert("instance.name".into(), metadata.name.clone());
        values.insert("instance.namespace".into(), metadata.namespace.clone());
        values.insert("instance.qualifiedName".into(), instance.qualified_name().to_string());
        values.insert("instance.key".into(), instance.spec.key.clone());
        values.insert("instance.workflow".into(), instance.spec.workflow.to_string());
        if let Some(dsl) = instance.language() {
            values.insert("instance.dsl".into(), dsl.to_string());
        }
        values.insert("agent.name".into(), agent.name.clone());
        values.insert("agent.namespace".into(), agent.namespace.clone());
        values.insert("agent.qualifiedName".into(), agent.to_string());
        Self { values }
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.values.get(path).map(String::as_str)
    }

    /// Replace every placeholder of `input`
    pub fn evaluate(&self, input: &str) -> Result<String> {
        let mut missing = None;
        let output = EXPRESSION.replace_all(input, |captures: &Captures| {
            let path = &captures[1];
            match self.get(path) {
                Some(value) => value.to_string(),
                None => {
                    missing.get_or_insert_with(|| path.to_string());
                    String::new()
                }
            }
        });
        match missing {
            Some(path) => Err(AgentError::ExpressionError(format!(
                "unknown expression '{}' in '{}'",
                path, input
            ))),
            None => Ok(output.into_owned()),
        }
    }

    /// Resolve every placeholder of a process configuration
    pub fn resolve(&self, config: &ProcessConfiguration) -> Result<ProcessConfiguration> {
        let entry_point = match &config.entry_point {
            Some(entry_point) => Some(self.evaluate(entry_point)?),
            None => None,
        };
        let arguments = config
            .arguments
            .iter()
            .map(|argument| self.evaluate(argument))
            .collect::<Result<Vec<_>>>()?;
        let environment_variables = config
            .environment_variables
            .iter()
            .map(|(key, value)| Ok((key.clone(), self.evaluate(value)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(ProcessConfiguration {
            target: self.evaluate(&config.target)?,
            entry_point,
            arguments,
            environment_variables,
        })
    }
}

/// Resolve `config` for `instance` and add the agent-provided environment
pub fn prepare_configuration(
    config: &ProcessConfiguration,
    instance: &WorkflowInstance,
    agent: &QualifiedName,
) -> Result<ProcessConfiguration> {
    let mut resolved = ExpressionScope::new(instance, agent).resolve(config)?;
    resolved
        .environment_variables
        .insert(INSTANCE_ENV.to_string(), instance.qualified_name().to_string());
    resolved
        .environment_variables
        .insert(AGENT_ENV.to_string(), agent.to_string());
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{
        ResourceMetadata, WorkflowInstanceSpec, WorkflowInstantiationType, DSL_LABEL,
    };

    fn instance() -> WorkflowInstance {
        WorkflowInstance::new(
            ResourceMetadata::new("tenant-a", "wf").with_label(DSL_LABEL, "greet:1.0.0"),
            WorkflowInstanceSpec::new(
                "greeter.default:1.0.0".parse().unwrap(),
                "key-1",
                WorkflowInstantiationType::Manual,
            ),
        )
    }

    fn agent() -> QualifiedName {
        QualifiedName::new("default", "agent-1")
    }

    #[test]
    fn test_evaluate_placeholders() {
        let scope = ExpressionScope::new(&instance(), &agent());
        assert_eq!(
            scope.evaluate("run ${{ instance.qualifiedName }} as ${{agent.name}}").unwrap(),
            "run wf.tenant-a as agent-1"
        );
        assert_eq!(
            scope.evaluate("${{ instance.workflow }}/${{ instance.dsl }}").unwrap(),
            "greeter.default:1.0.0/greet:1.0.0"
        );
        assert_eq!(scope.evaluate("plain text").unwrap(), "plain text");
    }

    #[test]
    fn test_unknown_path_is_an_error() {
        let scope = ExpressionScope::new(&instance(), &agent());
        let err = scope.evaluate("${{ instance.secret }}").unwrap_err();
        assert!(matches!(err, AgentError::ExpressionError(ref m) if m.contains("instance.secret")));
    }

    #[test]
    fn test_prepare_configuration() {
        let config = ProcessConfiguration::new("runner")
            .with_entry_point("${{ instance.workflow }}")
            .with_argument("--key=${{ instance.key }}")
            .with_env("TENANT", "${{ instance.namespace }}");

        let resolved = prepare_configuration(&config, &instance(), &agent()).unwrap();
        assert_eq!(resolved.target, "runner");
        assert_eq!(resolved.entry_point.as_deref(), Some("greeter.default:1.0.0"));
        assert_eq!(resolved.arguments, vec!["--key=key-1".to_string()]);
        assert_eq!(resolved.environment_variables["TENANT"], "tenant-a");
        assert_eq!(resolved.environment_variables[INSTANCE_ENV], "wf.tenant-a");
        assert_eq!(resolved.environment_variables[AGENT_ENV], "agent-1.default");
    }
}
