// packages/agent/src/utils/mod.rs
//! Shared utilities: configuration and error types

pub mod config;
pub mod errors;

pub use config::AgentConfig;
pub use errors::{AgentError, Result};
