// packages/agent/src/runtime/mod.rs
//! Process execution runtime
//!
//! - **Process**: contract of one running unit of work
//! - **Process Manager**: backend contract creating processes, signal helpers
//! - **Native**: OS process backend
//! - **Registry**: backend id → factory, resolved once at startup
//! - **Expressions**: `${{ path }}` resolution in process configurations
//!
//! # Architecture
//!
//! ```text
//!  ProcessRule.process ──► expressions ──► ProcessConfiguration (resolved)
//!                                                   │
//!  AgentConfig.process_manager ──► registry ──► ProcessManager (native, ...)
//!                                                   │
//!                                            create_process
//!                                                   │
//!                                                   ▼
//!                                      Process: pending ─start─► running
//!                                                   │              │
//!                                                   │       not-responding
//!                                                   └──stop/exit──► exited
//! ```

pub mod expressions;
pub mod native;
pub mod process;
pub mod process_manager;
pub mod registry;

// Re-export commonly used types
pub use expressions::{prepare_configuration, ExpressionScope};
pub use native::{NativeProcess, NativeProcessManager};
pub use process::{ExitSignal, Process, ProcessExit, ProcessPhase};
pub use process_manager::ProcessManager;
pub use registry::{ProcessManagerFactory, ProcessManagerRegistry};
