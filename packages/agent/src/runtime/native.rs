// packages/agent/src/runtime/native.rs
//! Native OS process backend
//!
//! Runs the configured target as a child process:
//!
//! ```text
//! <target> [entry point] [arguments...]
//! ```
//!
//! with the configured environment variables added to the agent's own
//! environment. Output lines are kept in a bounded buffer per process and
//! traced at debug level.

use crate::resources::ProcessConfiguration;
use crate::runtime::process::{ExitSignal, Process, ProcessExit, ProcessPhase};
use crate::runtime::process_manager::{self, ProcessManager};
use crate::utils::config::ProcessManagerConfig;
use crate::utils::errors::{AgentError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Backend identifier
pub const NATIVE_BACKEND: &str = "native";

/// How long the exit waiter gives the output readers to drain
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Process manager spawning OS processes
pub struct NativeProcessManager {
    config: ProcessManagerConfig,
}

impl NativeProcessManager {
    pub fn new(config: ProcessManagerConfig) -> Self {
        Self { config }
    }

    /// Registry factory
    pub fn factory(config: &ProcessManagerConfig) -> Result<Arc<dyn ProcessManager>> {
        if let Some(dir) = &config.working_directory {
            if !dir.is_dir() {
                return Err(AgentError::ConfigError(format!(
                    "working directory {:?} does not exist",
                    dir
                )));
            }
        }
        Ok(Arc::new(Self::new(config.clone())))
    }

    /// Create a native process without erasing its type
    pub fn create_native(&self, config: &ProcessConfiguration) -> Result<NativeProcess> {
        config.validate()?;
        Ok(NativeProcess::new(
            Ulid::new().to_string(),
            config.clone(),
            self.config.working_directory.clone(),
            self.config.stop_grace_period(),
            self.config.log_capacity,
        ))
    }
}

#[async_trait]
impl ProcessManager for NativeProcessManager {
    fn backend(&self) -> &str {
        NATIVE_BACKEND
    }

    async fn create_process(
        &self,
        config: &ProcessConfiguration,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Process>> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let process = self.create_native(config)?;
        debug!("Created native process {} for target '{}'", process.id, config.target);
        Ok(Arc::new(process))
    }
}

#[derive(Debug, Default)]
struct NativeState {
    started: bool,
    pid: Option<u32>,
}

/// One OS process
pub struct NativeProcess {
    id: String,
    config: ProcessConfiguration,
    working_directory: Option<PathBuf>,
    grace_period: Duration,
    state: Mutex<NativeState>,
    exit_sender: Arc<watch::Sender<Option<ProcessExit>>>,
    exit: ExitSignal,
    logs: Arc<LogBuffer>,
}

impl NativeProcess {
    fn new(
        id: String,
        config: ProcessConfiguration,
        working_directory: Option<PathBuf>,
        grace_period: Duration,
        log_capacity: usize,
    ) -> Self {
        let (exit_sender, exit) = ExitSignal::channel();
        Self {
            id,
            config,
            working_directory,
            grace_period,
            state: Mutex::new(NativeState::default()),
            exit_sender: Arc::new(exit_sender),
            exit,
            logs: Arc::new(LogBuffer::new(log_capacity)),
        }
    }

    /// OS pid, once started
    pub fn pid(&self) -> Option<u32> {
        self.state.lock().pid
    }

    /// Captured output lines, oldest first
    pub fn logs(&self) -> Vec<String> {
        self.logs.lines()
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.config.target);
        if let Some(entry_point) = &self.config.entry_point {
            command.arg(entry_point);
        }
        command.args(&self.config.arguments);
        command.envs(&self.config.environment_variables);
        if let Some(dir) = &self.working_directory {
            command.current_dir(dir);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }

    fn is_responsive(pid: u32) -> bool {
        if !process_manager::is_alive(pid) {
            return false;
        }
        match read_proc_state(pid) {
            Some('T') | Some('t') => false,
            _ => true,
        }
    }
}

#[async_trait]
impl Process for NativeProcess {
    fn id(&self) -> &str {
        &self.id
    }

    fn phase(&self) -> ProcessPhase {
        let state = self.state.lock();
        if !state.started {
            return ProcessPhase::Pending;
        }
        if self.exit.current().is_some() {
            return ProcessPhase::Exited;
        }
        match state.pid {
            Some(pid) if !Self::is_responsive(pid) => ProcessPhase::NotResponding,
            Some(_) => ProcessPhase::Running,
            None => ProcessPhase::Exited,
        }
    }

    fn exit_code(&self) -> Option<i64> {
        self.exit.current().and_then(|exit| exit.code)
    }

    fn exited(&self) -> ExitSignal {
        self.exit.clone()
    }

    async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let mut child = {
            let mut state = self.state.lock();
            if state.started {
                return Err(AgentError::ProcessError(format!(
                    "process {} has already been started",
                    self.id
                )));
            }
            let child = self.command().spawn().map_err(|e| {
                AgentError::ProcessSpawnFailed(format!(
                    "Failed to spawn '{}': {}",
                    self.config.target, e
                ))
            })?;
            state.started = true;
            state.pid = child.id();
            child
        };

        info!(
            "Started process {} ('{}') with PID {:?}",
            self.id, self.config.target, child.id()
        );

        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(self.id.clone(), "stdout", stdout, Arc::clone(&self.logs)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(self.id.clone(), "stderr", stderr, Arc::clone(&self.logs)));
        }

        let id = self.id.clone();
        let exit_sender = Arc::clone(&self.exit_sender);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().map(i64::from),
                Err(e) => {
                    warn!("Failed to wait for process {}: {}", id, e);
                    None
                }
            };
            let drained = futures::future::join_all(readers);
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drained).await.is_err() {
                debug!("Output of process {} still open after exit", id);
            }
            debug!("Process {} exited with code {:?}", id, code);
            exit_sender.send_replace(Some(ProcessExit { code }));
        });

        Ok(())
    }

    async fn stop(&self, cancel: &CancellationToken) -> Result<()> {
        let pid = {
            let state = self.state.lock();
            if !state.started {
                debug!("Process {} was never started, nothing to stop", self.id);
                return Ok(());
            }
            state.pid
        };
        let pid = match pid {
            Some(pid) if self.exit.current().is_none() => pid,
            _ => return Ok(()),
        };

        info!("Stopping process {} (PID {})", self.id, pid);
        let exit = self.exit.clone();
        process_manager::terminate(pid, self.grace_period, cancel, || exit.current().is_some()).await?;

        // reap before reporting the process as stopped
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::timeout(self.grace_period.max(Duration::from_secs(1)), self.exit.clone().wait()) => {}
        }
        Ok(())
    }
}

/// Bounded ring of output lines
struct LogBuffer {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl LogBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }
}

fn spawn_reader<T>(id: String, stream: &'static str, reader: T, logs: Arc<LogBuffer>) -> JoinHandle<()>
where
    T: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("[{} {}] {}", id, stream, line);
            logs.push(line);
        }
    })
}

/// Scheduling state letter from `/proc/<pid>/stat`
fn read_proc_state(pid: u32) -> Option<char> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // the command name may contain spaces and parentheses
    let after_name = &stat[stat.rfind(')')? + 1..];
    after_name.trim_start().chars().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> NativeProcessManager {
        NativeProcessManager::new(ProcessManagerConfig {
            stop_grace_period_secs: 1,
            ..Default::default()
        })
    }

    async fn wait_exit(process: &NativeProcess) -> ProcessExit {
        tokio::time::timeout(Duration::from_secs(5), process.exited().wait())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_echo_runs_to_completion() {
        let config = ProcessConfiguration::new("echo")
            .with_entry_point("hello")
            .with_argument("world");
        let process = manager().create_native(&config).unwrap();
        assert_eq!(process.phase(), ProcessPhase::Pending);
        assert!(Ulid::from_string(process.id()).is_ok());

        process.start(&CancellationToken::new()).await.unwrap();
        let exit = wait_exit(&process).await;

        assert!(exit.success());
        assert_eq!(process.exit_code(), Some(0));
        assert_eq!(process.phase(), ProcessPhase::Exited);
        assert_eq!(process.logs(), vec!["hello world".to_string()]);
    }

    #[tokio::test]
    async fn test_environment_and_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = NativeProcessManager::new(ProcessManagerConfig {
            working_directory: Some(dir.path().to_path_buf()),
            ..Default::default()
        });
        let config = ProcessConfiguration::new("sh")
            .with_entry_point("-c")
            .with_argument("echo $GREETING; pwd")
            .with_env("GREETING", "hi");
        let process = manager.create_native(&config).unwrap();
        process.start(&CancellationToken::new()).await.unwrap();
        wait_exit(&process).await;

        let logs = process.logs();
        assert_eq!(logs[0], "hi");
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(PathBuf::from(&logs[1]).canonicalize().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_stop_terminates_running_process() {
        let config = ProcessConfiguration::new("sleep").with_argument("30");
        let process = manager().create_native(&config).unwrap();
        process.start(&CancellationToken::new()).await.unwrap();
        assert_eq!(process.phase(), ProcessPhase::Running);

        process.stop(&CancellationToken::new()).await.unwrap();
        assert_eq!(process.phase(), ProcessPhase::Exited);
        // killed by a signal: no exit code
        assert_eq!(process.exit_code(), None);
    }

    #[tokio::test]
    async fn test_missing_executable_fails_to_start() {
        let config = ProcessConfiguration::new("definitely-not-a-real-binary-4711");
        let process = manager().create_native(&config).unwrap();
        let result = process.start(&CancellationToken::new()).await;
        assert!(matches!(result, Err(AgentError::ProcessSpawnFailed(_))));
        assert_eq!(process.phase(), ProcessPhase::Pending);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let process = manager()
            .create_native(&ProcessConfiguration::new("true"))
            .unwrap();
        let cancel = CancellationToken::new();
        process.start(&cancel).await.unwrap();
        assert!(process.start(&cancel).await.is_err());
        wait_exit(&process).await;
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let process = manager()
            .create_native(&ProcessConfiguration::new("true"))
            .unwrap();
        process.stop(&CancellationToken::new()).await.unwrap();
        assert_eq!(process.phase(), ProcessPhase::Pending);
    }

    #[test]
    fn test_log_buffer_is_bounded() {
        let buffer = LogBuffer::new(2);
        buffer.push("a".into());
        buffer.push("b".into());
        buffer.push("c".into());
        assert_eq!(buffer.lines(), vec!["b".to_string(), "c".to_string()]);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_stopped_process_is_not_responding() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let process = manager()
            .create_native(&ProcessConfiguration::new("sleep").with_argument("30"))
            .unwrap();
        process.start(&CancellationToken::new()).await.unwrap();
        let pid = Pid::from_raw(process.pid().unwrap() as i32);

        kill(pid, Signal::SIGSTOP).unwrap();
        let mut phase = process.phase();
        for _ in 0..50 {
            if phase == ProcessPhase::NotResponding {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            phase = process.phase();
        }
        assert_eq!(phase, ProcessPhase::NotResponding);

        kill(pid, Signal::SIGCONT).unwrap();
        process.stop(&CancellationToken::new()).await.unwrap();
        assert_eq!(process.phase(), ProcessPhase::Exited);
    }
}
