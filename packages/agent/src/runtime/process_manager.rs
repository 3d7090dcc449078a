// packages/agent/src/runtime/process_manager.rs
//! Process manager contract and signal helpers
//!
//! A process manager turns a [`ProcessConfiguration`] into a [`Process`].
//! Backends are selected by name through the
//! [`ProcessManagerRegistry`](crate::runtime::ProcessManagerRegistry).

use crate::resources::ProcessConfiguration;
use crate::runtime::process::Process;
use crate::utils::errors::{AgentError, Result};
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Creates processes for one backend
#[async_trait]
pub trait ProcessManager: Send + Sync + 'static {
    /// Backend identifier, e.g. `native`
    fn backend(&self) -> &str;

    /// Create a process in the `pending` phase
    async fn create_process(
        &self,
        config: &ProcessConfiguration,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Process>>;
}

/// Check whether a pid still accepts signals
pub fn is_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Terminate a pid: SIGTERM, wait up to `grace`, then SIGKILL
///
/// `exited` is polled while waiting so a process that honours SIGTERM is not
/// killed. Cancelling skips the rest of the grace period.
pub async fn terminate(
    pid: u32,
    grace: Duration,
    cancel: &CancellationToken,
    exited: impl Fn() -> bool,
) -> Result<()> {
    let pid = Pid::from_raw(pid as i32);

    debug!("Sending SIGTERM to PID {}", pid);
    kill(pid, Signal::SIGTERM)
        .map_err(|e| AgentError::ProcessError(format!("Failed to send SIGTERM: {}", e)))?;

    let deadline = tokio::time::Instant::now() + grace;
    while !exited() && tokio::time::Instant::now() < deadline {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
    }

    if !exited() && kill(pid, None).is_ok() {
        debug!("Process still alive, sending SIGKILL to PID {}", pid);
        kill(pid, Signal::SIGKILL)
            .map_err(|e| AgentError::ProcessError(format!("Failed to send SIGKILL: {}", e)))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_alive_for_own_pid() {
        assert!(is_alive(std::process::id()));
    }

    #[tokio::test]
    async fn test_terminate_kills_process_ignoring_sigterm() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; sleep 30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        // give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        terminate(pid, Duration::from_millis(200), &CancellationToken::new(), || false)
            .await
            .unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }
}
