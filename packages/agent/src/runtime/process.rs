// packages/agent/src/runtime/process.rs
//! Process contract
//!
//! A process is the unit of execution the agent runs for one workflow
//! instance. Backends decide what a process actually is; the instance
//! manager only sees this trait.

use crate::utils::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle phase of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessPhase {
    /// Created, not started
    Pending,
    Running,
    /// Started, alive, but not accepting work (stopped/traced)
    NotResponding,
    Exited,
}

impl ProcessPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessPhase::Pending => "pending",
            ProcessPhase::Running => "running",
            ProcessPhase::NotResponding => "not-responding",
            ProcessPhase::Exited => "exited",
        }
    }
}

impl fmt::Display for ProcessPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i64>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Completion notification of one process
///
/// Cloneable; every clone resolves once the process has exited.
#[derive(Debug, Clone)]
pub struct ExitSignal {
    receiver: watch::Receiver<Option<ProcessExit>>,
}

impl ExitSignal {
    pub fn new(receiver: watch::Receiver<Option<ProcessExit>>) -> Self {
        Self { receiver }
    }

    /// Create a signal together with the sender a backend records the exit on
    pub fn channel() -> (watch::Sender<Option<ProcessExit>>, Self) {
        let (sender, receiver) = watch::channel(None);
        (sender, Self::new(receiver))
    }

    /// Exit recorded so far, if any
    pub fn current(&self) -> Option<ProcessExit> {
        *self.receiver.borrow()
    }

    /// Resolve once the process exits
    ///
    /// Returns `None` if the backend went away without recording an exit.
    pub async fn wait(mut self) -> Option<ProcessExit> {
        let exit = match self.receiver.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => *exit,
            Err(_) => None,
        };
        exit.or_else(|| *self.receiver.borrow())
    }
}

/// A process managed by the agent
#[async_trait]
pub trait Process: Send + Sync + 'static {
    /// Identifier assigned at creation
    fn id(&self) -> &str;

    fn phase(&self) -> ProcessPhase;

    /// Exit code, once exited
    fn exit_code(&self) -> Option<i64>;

    /// Notification resolving when the process exits
    fn exited(&self) -> ExitSignal;

    async fn start(&self, cancel: &CancellationToken) -> Result<()>;

    async fn stop(&self, cancel: &CancellationToken) -> Result<()>;
}

impl fmt::Debug for dyn Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id())
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_phase_serialization() {
        assert_eq!(
            serde_json::to_value(ProcessPhase::NotResponding).unwrap(),
            "not-responding"
        );
        assert_eq!(ProcessPhase::Exited.to_string(), "exited");
    }

    #[tokio::test]
    async fn test_exit_signal_resolves_for_every_clone() {
        let (sender, signal) = ExitSignal::channel();
        let other = signal.clone();
        assert!(signal.current().is_none());

        let waiter = tokio::spawn(other.wait());
        sender.send_replace(Some(ProcessExit { code: Some(3) }));

        let exit = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, Some(ProcessExit { code: Some(3) }));
        assert_eq!(signal.wait().await, Some(ProcessExit { code: Some(3) }));
    }

    #[tokio::test]
    async fn test_exit_signal_without_exit_when_sender_dropped() {
        let (sender, signal) = ExitSignal::channel();
        drop(sender);
        assert_eq!(signal.wait().await, None);
    }

    #[tokio::test]
    async fn test_exit_signal_keeps_exit_recorded_before_sender_dropped() {
        let (sender, signal) = ExitSignal::channel();
        sender.send_replace(Some(ProcessExit { code: Some(0) }));
        drop(sender);
        assert_eq!(signal.current(), Some(ProcessExit { code: Some(0) }));
        assert!(signal.wait().await.is_some_and(|exit| exit.success()));
    }
}
