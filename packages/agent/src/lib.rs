// packages/agent/src/lib.rs
//! Workflow Agent Library
//!
//! An agent claims workflow instances from a shared, versioned resource
//! store and runs one process per claimed instance until the instance
//! reaches a terminal phase. Several agents can share one store; all
//! coordination between them goes through conditional writes.
//!
//! # Architecture
//!
//! - **resources**: workflow instances, agent descriptors, label selectors
//! - **store**: store contract, in-memory store, compare-and-swap, monitor, seeding
//! - **controller**: watch/reconcile engine with per-key ordering
//! - **runtime**: process contract, native backend, backend registry, expressions
//! - **agent**: rule matching, claim arbitration, instance manager
//! - **observability**: tracing and metrics setup
//! - **utils**: configuration and errors

// Public module exports
pub mod agent;
pub mod controller;
pub mod observability;
pub mod resources;
pub mod runtime;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use agent::{ClaimArbitrator, ClaimOutcome, WorkflowInstanceManager};
pub use resources::{WorkflowAgent, WorkflowInstance};
pub use runtime::{ProcessManager, ProcessManagerRegistry};
pub use store::{MemoryStore, ResourceStore};
pub use utils::config::AgentConfig;
pub use utils::errors::{AgentError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
