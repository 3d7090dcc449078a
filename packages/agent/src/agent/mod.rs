// packages/agent/src/agent/mod.rs
//! Workflow agent core
//!
//! - **rules**: picks the process rule for an instance
//! - **claim**: decides ownership of unclaimed instances
//! - **process_table**: processes this agent runs, keyed by instance
//! - **instance_manager**: the reconcile state machine tying it together
//!
//! # Architecture
//!
//! ```text
//!  WorkflowAgent ──► ResourceMonitor ─┐
//!                                     ▼
//!  WorkflowInstance ──► ResourceController ──► WorkflowInstanceManager
//!       events                                   │      │       │
//!                                          match_rule  claim  ProcessTable
//!                                                               │
//!                                                        ProcessManager
//! ```

pub mod claim;
pub mod instance_manager;
pub mod process_table;
pub mod rules;

pub use claim::{ClaimArbitrator, ClaimOutcome};
pub use instance_manager::{InstanceState, WorkflowInstanceManager};
pub use process_table::ProcessTable;
pub use rules::match_rule;
