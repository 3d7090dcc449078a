// packages/agent/src/agent/claim.rs
//! Claim arbitration between competing agents
//!
//! Ownership of an instance is recorded in its ownership label and decided by
//! a conditional `replace`: of all agents racing for an unclaimed instance,
//! exactly one write succeeds and every other agent re-fetches, sees the
//! winner's label and backs off.
//!
//! ```text
//! label == self ─────────────────────────► Owned
//! label == other ────────────────────────► LostRace(other)
//! no label ──► set label ──► replace ──ok─► Owned ──► initialize status
//!                               │
//!                           Conflict ──► re-fetch ──► (start over)
//! ```

use crate::resources::{QualifiedName, WorkflowInstance, WorkflowInstanceStatus, AGENT_LABEL};
use crate::store::{compare_and_swap, CasDecision, CasOutcome, ResourceStore, RetryPolicy, WriteTarget};
use crate::utils::errors::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Result of a claim attempt
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// This agent owns the instance; carries the freshest known version
    Owned(WorkflowInstance),
    /// Another agent owns the instance
    LostRace {
        owner: String,
        instance: WorkflowInstance,
    },
}

/// Claims instances on behalf of one agent
pub struct ClaimArbitrator<S: ResourceStore> {
    store: Arc<S>,
    agent: String,
    policy: RetryPolicy,
}

impl<S: ResourceStore> ClaimArbitrator<S> {
    pub fn new(store: Arc<S>, agent: &QualifiedName, policy: RetryPolicy) -> Self {
        Self {
            store,
            agent: agent.to_string(),
            policy,
        }
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Try to become the owner of `instance`
    pub async fn try_claim(
        &self,
        instance: WorkflowInstance,
        cancel: &CancellationToken,
    ) -> Result<ClaimOutcome> {
        let name = instance.metadata.qualified_name();
        let agent = self.agent.clone();

        let outcome = compare_and_swap(
            &*self.store,
            instance,
            WriteTarget::Resource,
            &self.policy,
            cancel,
            |mut current: WorkflowInstance| match current.owner().map(str::to_string) {
                Some(owner) if owner == agent => CasDecision::Skip(ClaimOutcome::Owned(current)),
                Some(owner) => CasDecision::Skip(ClaimOutcome::LostRace {
                    owner,
                    instance: current,
                }),
                None => {
                    current
                        .metadata
                        .labels
                        .insert(AGENT_LABEL.to_string(), agent.clone());
                    CasDecision::Write(current)
                }
            },
        )
        .await?;

        let claimed = match outcome {
            CasOutcome::Written(instance) => {
                info!("Claimed workflow instance '{}'", name);
                metrics::counter!("workflow_agent_claims_total", "outcome" => "claimed").increment(1);
                instance
            }
            CasOutcome::Unchanged(ClaimOutcome::Owned(instance)) => {
                debug!("Workflow instance '{}' is already owned by this agent", name);
                instance
            }
            CasOutcome::Unchanged(lost @ ClaimOutcome::LostRace { .. }) => {
                if let ClaimOutcome::LostRace { owner, .. } = &lost {
                    debug!("Workflow instance '{}' is owned by agent '{}'", name, owner);
                }
                metrics::counter!("workflow_agent_claims_total", "outcome" => "lost").increment(1);
                return Ok(lost);
            }
        };

        let initialized = self.initialize_status(claimed, cancel).await?;
        Ok(ClaimOutcome::Owned(initialized))
    }

    /// Record the owning agent in the status of a claimed instance, unless already recorded
    pub(crate) async fn initialize_status(
        &self,
        instance: WorkflowInstance,
        cancel: &CancellationToken,
    ) -> Result<WorkflowInstance> {
        let agent = self.agent.clone();
        let outcome = compare_and_swap(
            &*self.store,
            instance,
            WriteTarget::Status,
            &self.policy,
            cancel,
            |mut current: WorkflowInstance| {
                let initialized = current
                    .status
                    .as_ref()
                    .map_or(false, |status| status.agent.is_some());
                if initialized {
                    return CasDecision::Skip(current);
                }
                match current.status.as_mut() {
                    Some(status) => status.agent = Some(agent.clone()),
                    None => current.status = Some(WorkflowInstanceStatus::claimed_by(agent.clone())),
                }
                CasDecision::Write(current)
            },
        )
        .await?;

        Ok(match outcome {
            CasOutcome::Written(instance) | CasOutcome::Unchanged(instance) => instance,
        })
    }
}
