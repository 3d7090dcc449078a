// packages/agent/src/store/cas.rs
//! Compare-and-swap over a versioned resource
//!
//! Every cross-agent decision goes through this loop:
//!
//! ```text
//! current ──► decide(current) ──► Skip(value) ─────────────► Unchanged(value)
//!                  │
//!                  └─► Write(next) ──► store write ──► ok ──► Written(resource)
//!                                         │
//!                                      Conflict ──► re-fetch ──► decide again
//! ```
//!
//! A conflict means some other writer made progress, so the loop converges;
//! it is still bounded by [`RetryPolicy::max_attempts`] with a small jittered
//! backoff between attempts.

use crate::resources::Resource;
use crate::store::ResourceStore;
use crate::utils::config::ClaimConfig;
use crate::utils::errors::{AgentError, Result};
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Which part of the resource a write replaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    /// Metadata and spec (`replace`)
    Resource,
    /// Status only (`replace_status`)
    Status,
}

/// Outcome of inspecting the current version of a resource
#[derive(Debug)]
pub enum CasDecision<R, T> {
    /// Write this modified resource
    Write(R),
    /// Leave the resource alone and return the value
    Skip(T),
}

/// Outcome of a compare-and-swap loop
#[derive(Debug)]
pub enum CasOutcome<R, T> {
    Written(R),
    Unchanged(T),
}

/// Bounds for the conflict retry loop
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ClaimConfig::default())
    }
}

impl From<&ClaimConfig> for RetryPolicy {
    fn from(config: &ClaimConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }
}

impl RetryPolicy {
    /// Jittered exponential backoff for the given (1-based) attempt
    fn backoff(&self, attempt: u32) -> Duration {
        if self.backoff_base.is_zero() {
            return Duration::ZERO;
        }
        let exp = self
            .backoff_base
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let ceiling = exp.min(self.backoff_max).as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}

/// Run a compare-and-swap loop over the resource, starting from `current`
///
/// `decide` sees the freshest known version of the resource on every
/// attempt. The resource disappearing between attempts is reported as
/// [`AgentError::NotFound`].
pub async fn compare_and_swap<S, R, T, F>(
    store: &S,
    mut current: R,
    target: WriteTarget,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut decide: F,
) -> Result<CasOutcome<R, T>>
where
    S: ResourceStore,
    R: Resource,
    F: FnMut(R) -> CasDecision<R, T> + Send,
    T: Send,
{
    let name = current.qualified_name();

    for attempt in 1..=policy.max_attempts {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let next = match decide(current) {
            CasDecision::Skip(value) => return Ok(CasOutcome::Unchanged(value)),
            CasDecision::Write(next) => next,
        };

        let written = match target {
            WriteTarget::Resource => store.replace(next).await,
            WriteTarget::Status => store.replace_status(next).await,
        };

        match written {
            Ok(resource) => return Ok(CasOutcome::Written(resource)),
            Err(e) if e.is_conflict() => {
                debug!(
                    "Conflict writing {} '{}' (attempt {}/{}), re-fetching",
                    R::KIND,
                    name,
                    attempt,
                    policy.max_attempts
                );
                metrics::counter!("workflow_agent_write_conflicts_total", "kind" => R::KIND)
                    .increment(1);

                let delay = policy.backoff(attempt);
                if !delay.is_zero() {
                    trace!("Backing off {:?} before retrying", delay);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }

                current = store
                    .get::<R>(&name.name, &name.namespace)
                    .await?
                    .ok_or_else(|| AgentError::NotFound {
                        kind: R::KIND,
                        name: name.to_string(),
                    })?;
            }
            Err(e) => return Err(e),
        }
    }

    Err(AgentError::RetriesExhausted {
        kind: R::KIND,
        name: name.to_string(),
        attempts: policy.max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{
        ResourceMetadata, WorkflowInstance, WorkflowInstanceSpec, WorkflowInstantiationType,
    };
    use crate::store::MemoryStore;

    fn instance() -> WorkflowInstance {
        WorkflowInstance::new(
            ResourceMetadata::new("default", "wf"),
            WorkflowInstanceSpec::new(
                "greeter.default:1.0.0".parse().unwrap(),
                "key-1",
                WorkflowInstantiationType::Manual,
            ),
        )
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_retries_after_conflict_with_fresh_copy() {
        let store = MemoryStore::new();
        let stale = store.create(instance()).await.unwrap();

        // someone else writes first
        let mut other = stale.clone();
        other.metadata.labels.insert("other".into(), "1".into());
        store.replace(other).await.unwrap();

        let mut seen_other_label = false;
        let outcome = compare_and_swap(
            &store,
            stale,
            WriteTarget::Resource,
            &policy(4),
            &CancellationToken::new(),
            |mut current: WorkflowInstance| {
                seen_other_label |= current.metadata.labels.contains_key("other");
                current.metadata.labels.insert("mine".into(), "1".into());
                CasDecision::<_, ()>::Write(current)
            },
        )
        .await
        .unwrap();

        assert!(seen_other_label);
        match outcome {
            CasOutcome::Written(written) => {
                assert!(written.metadata.labels.contains_key("other"));
                assert!(written.metadata.labels.contains_key("mine"));
            }
            CasOutcome::Unchanged(_) => panic!("expected a write"),
        }
    }

    #[tokio::test]
    async fn test_skip_returns_value_without_writing() {
        let store = MemoryStore::new();
        let created = store.create(instance()).await.unwrap();
        let version = created.metadata.resource_version;

        let outcome = compare_and_swap(
            &store,
            created,
            WriteTarget::Status,
            &policy(4),
            &CancellationToken::new(),
            |_current: WorkflowInstance| CasDecision::Skip(42),
        )
        .await
        .unwrap();

        assert!(matches!(outcome, CasOutcome::Unchanged(42)));
        let stored: WorkflowInstance = store.get("wf", "default").await.unwrap().unwrap();
        assert_eq!(stored.metadata.resource_version, version);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let store = MemoryStore::new();
        let created = store.create(instance()).await.unwrap();

        // a decision that always writes a stale copy never succeeds
        let stale = created.clone();
        let mut bump = created.clone();
        bump.metadata.labels.insert("bump".into(), "1".into());
        store.replace(bump).await.unwrap();

        let result = compare_and_swap(
            &store,
            created,
            WriteTarget::Resource,
            &policy(3),
            &CancellationToken::new(),
            |_current: WorkflowInstance| CasDecision::<_, ()>::Write(stale.clone()),
        )
        .await;

        assert!(matches!(
            result,
            Err(AgentError::RetriesExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let store = MemoryStore::new();
        let created = store.create(instance()).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = compare_and_swap(
            &store,
            created,
            WriteTarget::Resource,
            &policy(3),
            &cancel,
            |current: WorkflowInstance| CasDecision::<_, ()>::Write(current),
        )
        .await;
        assert!(matches!(result, Err(AgentError::Cancelled)));
    }
}
