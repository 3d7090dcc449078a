// packages/agent/src/store/mod.rs
//! Resource store contract
//!
//! The store is the only state shared between agents. It is consumed, not
//! owned: the agent relies on CRUD + watch semantics and on conditional
//! writes that fail with [`AgentError::Conflict`] when the caller's resource
//! version is stale.
//!
//! - **ResourceStore**: the consumed contract
//! - **MemoryStore**: in-process reference implementation
//! - **cas**: reusable compare-and-swap loop over a versioned resource
//! - **ResourceMonitor**: keeps the latest value of one named resource
//! - **seed**: loads resources from a YAML document at startup
//!
//! [`AgentError::Conflict`]: crate::utils::errors::AgentError::Conflict

pub mod cas;
pub mod memory;
pub mod monitor;
pub mod seed;

pub use cas::{compare_and_swap, CasDecision, CasOutcome, RetryPolicy, WriteTarget};
pub use memory::MemoryStore;
pub use monitor::ResourceMonitor;

use crate::resources::{LabelSelector, Resource};
use crate::utils::errors::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Kind of change reported by a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchEventType {
    Created,
    Updated,
    Deleted,
}

/// A change to one resource
#[derive(Debug, Clone)]
pub struct WatchEvent<R> {
    pub event_type: WatchEventType,
    pub resource: R,
}

impl<R> WatchEvent<R> {
    pub fn new(event_type: WatchEventType, resource: R) -> Self {
        Self {
            event_type,
            resource,
        }
    }
}

/// Stream of watch events; it ends (or yields an error) when the store goes away
pub type WatchStream<R> = BoxStream<'static, Result<WatchEvent<R>>>;

/// Restricts `list` and `watch` to a namespace and/or a label selection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceFilter {
    pub namespace: Option<String>,
    pub label_selectors: Vec<LabelSelector>,
}

impl ResourceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            label_selectors: Vec::new(),
        }
    }

    pub fn with_selector(mut self, selector: LabelSelector) -> Self {
        self.label_selectors.push(selector);
        self
    }

    pub fn matches<R: Resource>(&self, resource: &R) -> bool {
        let metadata = resource.metadata();
        if let Some(namespace) = &self.namespace {
            if &metadata.namespace != namespace {
                return false;
            }
        }
        crate::resources::selector::selects_all(&self.label_selectors, &metadata.labels)
    }
}

/// Versioned resource store
///
/// `replace` writes metadata and spec and leaves the status untouched;
/// `replace_status` writes the status only. Both are conditional on the
/// resource version carried by the argument.
#[async_trait]
pub trait ResourceStore: Send + Sync + 'static {
    async fn get<R: Resource>(&self, name: &str, namespace: &str) -> Result<Option<R>>;

    async fn list<R: Resource>(&self, filter: &ResourceFilter) -> Result<Vec<R>>;

    async fn watch<R: Resource>(&self, filter: &ResourceFilter) -> Result<WatchStream<R>>;

    async fn create<R: Resource>(&self, resource: R) -> Result<R>;

    async fn replace<R: Resource>(&self, resource: R) -> Result<R>;

    async fn replace_status<R: Resource>(&self, resource: R) -> Result<R>;

    async fn delete<R: Resource>(&self, name: &str, namespace: &str) -> Result<Option<R>>;
}
