// packages/agent/src/agent/instance_manager.rs
//! Workflow instance manager
//!
//! Drives every watched instance towards the state its phase and ownership
//! call for:
//!
//! ```text
//!                 rule matches, claim won
//!   unclaimed ──────────────────────────────► claimed-not-started
//!       │ no rule / claim lost                        │ create, record session,
//!       ▼                                             │ start
//!   (skipped)                                         ▼
//!                   close stale session       running-tracked
//!   running-untracked ──────────────────►  (run path again)   │ phase terminal
//!                                                             ▼
//!   foreign-owned: ignored                         terminal (stopped, untracked)
//! ```
//!
//! Every decision is re-derived from the freshest stored version of the
//! instance while holding a per-instance gate, so the controller's events
//! and the replays (startup, descriptor changes) never act on the same
//! instance concurrently.

use crate::agent::claim::{ClaimArbitrator, ClaimOutcome};
use crate::agent::process_table::ProcessTable;
use crate::agent::rules::match_rule;
use crate::controller::{ResourceCache, ResourceController, ResourceEventHandler};
use crate::resources::{
    LabelSelector, ProcessRule, QualifiedName, Resource, WorkflowAgent, WorkflowInstance,
    WorkflowInstancePhase, WorkflowInstanceRuntime, DSL_LABEL,
};
use crate::runtime::{prepare_configuration, Process, ProcessManager, ProcessPhase};
use crate::store::{
    compare_and_swap, CasDecision, CasOutcome, ResourceFilter, ResourceMonitor, ResourceStore,
    RetryPolicy, WriteTarget,
};
use crate::utils::config::AgentConfig;
use crate::utils::errors::{AgentError, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Where an instance stands from this agent's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Unclaimed,
    ForeignOwned,
    ClaimedNotStarted,
    RunningTracked,
    RunningUntracked,
    Terminal,
}

/// Owns the controller, the descriptor monitor and the reconcile logic
pub struct WorkflowInstanceManager<S: ResourceStore> {
    inner: Arc<ManagerInner<S>>,
    controller: ResourceController<WorkflowInstance, S>,
    monitor: ResourceMonitor<WorkflowAgent>,
    descriptor_changes: Mutex<watch::Receiver<WorkflowAgent>>,
    cancel: CancellationToken,
}

impl<S: ResourceStore> WorkflowInstanceManager<S> {
    /// Load the agent descriptor, subscribe to instances and replay every known instance
    pub async fn start(
        store: Arc<S>,
        process_manager: Arc<dyn ProcessManager>,
        config: &AgentConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let agent_id = config.agent.qualified_name();
        info!("Starting workflow instance manager for agent '{}'", agent_id);

        let monitor = ResourceMonitor::<WorkflowAgent>::start(
            Arc::clone(&store),
            &agent_id.name,
            &agent_id.namespace,
            cancel.child_token(),
        )
        .await?;
        let descriptor = monitor.current();
        descriptor.validate()?;
        info!(
            "Agent '{}' supports {:?}",
            agent_id,
            descriptor.supported_languages()
        );

        let inner = Arc::new(ManagerInner {
            store: Arc::clone(&store),
            arbitrator: ClaimArbitrator::new(
                Arc::clone(&store),
                &agent_id,
                RetryPolicy::from(&config.claim),
            ),
            policy: RetryPolicy::from(&config.claim),
            agent: agent_id.to_string(),
            agent_id,
            watch_namespace: config.agent.watch_namespace.clone(),
            replay_concurrency: config.agent.replay_concurrency.max(1),
            descriptor: RwLock::new(descriptor),
            process_manager,
            processes: ProcessTable::new(),
            gates: DashMap::new(),
            start_failures: DashMap::new(),
            start_retry_backoff: config.process_manager.start_retry_backoff(),
        });

        let controller = ResourceController::new(
            Arc::clone(&store),
            config.controller.clone(),
            cancel.child_token(),
        );
        let handler: Arc<dyn ResourceEventHandler<WorkflowInstance>> = inner.clone();
        controller.start(inner.instance_filter(), handler).await?;

        let known = controller.cache().values();
        info!("Replaying {} known workflow instances", known.len());
        inner.replay(known, &cancel).await?;

        let descriptor_changes = Mutex::new(monitor.subscribe());
        Ok(Self {
            inner,
            controller,
            monitor,
            descriptor_changes,
            cancel,
        })
    }

    pub fn agent_id(&self) -> &QualifiedName {
        &self.inner.agent_id
    }

    /// Locally tracked processes
    pub fn processes(&self) -> &ProcessTable {
        &self.inner.processes
    }

    /// Mirror of the watched instances
    pub fn instances(&self) -> ResourceCache<WorkflowInstance> {
        self.controller.cache()
    }

    /// Reconcile one instance outside of the event flow
    pub async fn reconcile(&self, instance: WorkflowInstance) -> Result<()> {
        self.inner.reconcile(instance, &self.cancel).await
    }

    /// Follow the agent descriptor until cancelled or the store goes away
    pub async fn run(&self) -> Result<()> {
        let mut changes = self.descriptor_changes.lock().await;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                result = self.controller.wait() => {
                    return match result {
                        Ok(()) if self.cancel.is_cancelled() => Ok(()),
                        Ok(()) => Err(AgentError::StoreUnavailable(
                            "instance controller stopped".into(),
                        )),
                        Err(e) => Err(e),
                    };
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        if self.cancel.is_cancelled() {
                            return Ok(());
                        }
                        return Err(AgentError::StoreUnavailable(format!(
                            "watch for agent '{}' ended",
                            self.monitor.name()
                        )));
                    }
                    let descriptor = changes.borrow_and_update().clone();
                    self.apply_descriptor(descriptor).await?;
                }
            }
        }
    }

    async fn apply_descriptor(&self, descriptor: WorkflowAgent) -> Result<()> {
        if let Err(e) = descriptor.validate() {
            error!("Ignoring invalid update of agent '{}': {}", self.inner.agent_id, e);
            return Ok(());
        }

        let previous = self.inner.descriptor.read().clone();
        if previous.spec == descriptor.spec {
            trace!("Agent '{}' changed without rule changes", self.inner.agent_id);
            *self.inner.descriptor.write() = descriptor;
            return Ok(());
        }

        let languages_changed = previous.supported_languages() != descriptor.supported_languages();
        info!("Process rules of agent '{}' changed, re-evaluating instances", self.inner.agent_id);
        *self.inner.descriptor.write() = descriptor;

        if languages_changed {
            self.controller.resubscribe(self.inner.instance_filter()).await?;
        }
        self.inner.replay(self.controller.cache().values(), &self.cancel).await
    }

    /// Stop watching and stop every tracked process
    pub async fn shutdown(&self) {
        info!("Shutting down workflow instance manager for agent '{}'", self.inner.agent_id);
        self.cancel.cancel();
        self.controller.stop().await;
        self.monitor.stop();

        // a fresh token: stopping must not be cut short by the shutdown itself
        let stop = CancellationToken::new();
        let tracked = self.inner.processes.drain();
        let stops = tracked.into_iter().map(|(instance, process)| {
            let stop = stop.clone();
            async move {
                if let Err(e) = process.stop(&stop).await {
                    error!("Failed to stop process {} of '{}': {}", process.id(), instance, e);
                }
            }
        });
        futures::future::join_all(stops).await;
    }
}

struct ManagerInner<S: ResourceStore> {
    store: Arc<S>,
    arbitrator: ClaimArbitrator<S>,
    policy: RetryPolicy,
    agent_id: QualifiedName,
    /// `agent_id` rendered, as stored in labels and status
    agent: String,
    watch_namespace: Option<String>,
    replay_concurrency: usize,
    descriptor: RwLock<WorkflowAgent>,
    process_manager: Arc<dyn ProcessManager>,
    processes: ProcessTable,
    gates: DashMap<QualifiedName, Arc<Mutex<()>>>,
    /// Last failed process creation or start per instance
    start_failures: DashMap<QualifiedName, Instant>,
    start_retry_backoff: Duration,
}

#[async_trait]
impl<S: ResourceStore> ResourceEventHandler<WorkflowInstance> for ManagerInner<S> {
    async fn on_created(&self, instance: WorkflowInstance, cancel: &CancellationToken) -> Result<()> {
        self.reconcile(instance, cancel).await
    }

    async fn on_updated(&self, instance: WorkflowInstance, cancel: &CancellationToken) -> Result<()> {
        self.reconcile(instance, cancel).await
    }

    async fn on_deleted(&self, instance: WorkflowInstance, cancel: &CancellationToken) -> Result<()> {
        let key = instance.qualified_name();
        let gate = self.gate(&key);
        let _guard = gate.lock().await;
        self.release(&key, cancel).await;
        self.forget(&key);
        Ok(())
    }

    async fn on_evicted(&self, instance: WorkflowInstance, _cancel: &CancellationToken) -> Result<()> {
        let key = instance.qualified_name();
        let gate = self.gate(&key);
        let _guard = gate.lock().await;
        if self.processes.contains(&key) {
            info!(
                "Workflow instance '{}' is no longer watched, its process keeps running until shutdown",
                key
            );
        }
        self.forget(&key);
        Ok(())
    }
}

impl<S: ResourceStore> ManagerInner<S> {
    fn instance_filter(&self) -> ResourceFilter {
        let languages = self.descriptor.read().supported_languages();
        ResourceFilter {
            namespace: self.watch_namespace.clone(),
            label_selectors: vec![LabelSelector::contains(DSL_LABEL, languages)],
        }
    }

    fn gate(&self, key: &QualifiedName) -> Arc<Mutex<()>> {
        Arc::clone(self.gates.entry(key.clone()).or_default().value())
    }

    /// Drop the per-instance bookkeeping of `key`
    fn forget(&self, key: &QualifiedName) {
        self.gates.remove(key);
        self.start_failures.remove(key);
    }

    fn matching_rule(&self, instance: &WorkflowInstance) -> Option<ProcessRule> {
        let descriptor = self.descriptor.read();
        match_rule(&descriptor, instance).cloned()
    }

    fn classify(&self, instance: &WorkflowInstance) -> InstanceState {
        match instance.owner() {
            None => return InstanceState::Unclaimed,
            Some(owner) if owner != self.agent => return InstanceState::ForeignOwned,
            Some(_) => {}
        }
        if instance.phase().is_terminal() {
            InstanceState::Terminal
        } else if self.processes.contains(&instance.qualified_name()) {
            InstanceState::RunningTracked
        } else if instance.phase() == WorkflowInstancePhase::Running
            || instance.open_runtime_count() > 0
        {
            InstanceState::RunningUntracked
        } else {
            InstanceState::ClaimedNotStarted
        }
    }

    /// Reconcile every instance, a bounded number at a time
    async fn replay(&self, instances: Vec<WorkflowInstance>, cancel: &CancellationToken) -> Result<()> {
        let mut results = futures::stream::iter(instances.into_iter().map(|instance| {
            let key = instance.qualified_name();
            async move { (key, self.reconcile(instance, cancel).await) }
        }))
        .buffer_unordered(self.replay_concurrency);

        while let Some((key, result)) = results.next().await {
            match result {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(AgentError::Cancelled) => {}
                Err(e) => error!("Failed to reconcile workflow instance '{}': {}", key, e),
            }
        }
        Ok(())
    }

    async fn reconcile(&self, instance: WorkflowInstance, cancel: &CancellationToken) -> Result<()> {
        let key = instance.qualified_name();
        let gate = self.gate(&key);
        let _guard = gate.lock().await;

        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let mut current = match self
            .store
            .get::<WorkflowInstance>(&key.name, &key.namespace)
            .await?
        {
            Some(current) => current,
            None => {
                debug!("Workflow instance '{}' no longer exists", key);
                self.release(&key, cancel).await;
                return Ok(());
            }
        };

        loop {
            let state = self.classify(&current);
            trace!("Workflow instance '{}' is {:?}", key, state);

            match state {
                InstanceState::ForeignOwned | InstanceState::RunningTracked => return Ok(()),
                InstanceState::Unclaimed => {
                    if self.matching_rule(&current).is_none() {
                        debug!("No process rule of agent '{}' applies to '{}', skipping", self.agent, key);
                        metrics::counter!("workflow_agent_unmatched_instances_total").increment(1);
                        return Ok(());
                    }
                    match self.arbitrator.try_claim(current, cancel).await? {
                        ClaimOutcome::Owned(owned) => current = owned,
                        ClaimOutcome::LostRace { .. } => return Ok(()),
                    }
                }
                InstanceState::Terminal => {
                    self.terminate(&key, current, cancel).await?;
                    return Ok(());
                }
                InstanceState::RunningUntracked => {
                    info!("Workflow instance '{}' is running without a local process, recovering", key);
                    current = self.close_sessions(current, None, cancel).await?;
                    return self.run(&key, current, cancel).await;
                }
                InstanceState::ClaimedNotStarted => {
                    return self.run(&key, current, cancel).await;
                }
            }
        }
    }

    /// Create, record and start the process of an owned instance
    async fn run(
        &self,
        key: &QualifiedName,
        instance: WorkflowInstance,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let rule = match self.matching_rule(&instance) {
            Some(rule) => rule,
            None => {
                warn!(
                    "No process rule of agent '{}' applies to owned instance '{}', not starting it",
                    self.agent, key
                );
                return Ok(());
            }
        };

        if let Some(failed_at) = self.start_failures.get(key).map(|e| *e.value()) {
            if failed_at.elapsed() < self.start_retry_backoff {
                debug!("Process of '{}' failed recently, not retrying yet", key);
                return Ok(());
            }
        }

        // an interrupted claim may have left the status without its agent
        let instance = if instance.status.as_ref().map_or(true, |s| s.agent.is_none()) {
            self.arbitrator.initialize_status(instance, cancel).await?
        } else {
            instance
        };

        let config = prepare_configuration(&rule.process, &instance, &self.agent_id)?;
        let process = match self.process_manager.create_process(&config, cancel).await {
            Ok(process) => process,
            Err(e) => {
                metrics::counter!("workflow_agent_process_failures_total", "stage" => "create").increment(1);
                self.start_failures.insert(key.clone(), Instant::now());
                return Err(e);
            }
        };
        let process_id = process.id().to_string();
        debug!("Created process {} for '{}' using rule '{}'", process_id, key, rule.name);

        if let Some(displaced) = self.processes.insert_or_replace(key.clone(), Arc::clone(&process)) {
            warn!("Replacing process {} of '{}'", displaced.id(), key);
            if let Err(e) = displaced.stop(cancel).await {
                error!("Failed to stop displaced process {}: {}", displaced.id(), e);
            }
        }

        let recorded = match self.record_session(instance, &process_id, cancel).await {
            Ok(Some(recorded)) => recorded,
            Ok(None) => {
                debug!("Workflow instance '{}' is no longer ours to run, not starting", key);
                self.processes.remove_if_current(key, &process_id);
                return Ok(());
            }
            Err(e) => {
                self.processes.remove_if_current(key, &process_id);
                return Err(e);
            }
        };

        if process.phase() == ProcessPhase::Pending {
            if let Err(e) = process.start(cancel).await {
                error!("Failed to start process {} for '{}': {}", process_id, key, e);
                metrics::counter!("workflow_agent_process_failures_total", "stage" => "start").increment(1);
                self.start_failures.insert(key.clone(), Instant::now());
                self.processes.remove_if_current(key, &process_id);
                if let Err(close) = self.close_sessions(recorded, Some(&process_id), cancel).await {
                    error!("Failed to close session of process {}: {}", process_id, close);
                }
                return Err(e);
            }
        }

        self.start_failures.remove(key);
        info!("Running workflow instance '{}' in process {}", key, process_id);
        metrics::counter!("workflow_agent_processes_started_total").increment(1);
        self.observe_exit(key.clone(), process, cancel.clone());
        Ok(())
    }

    /// Append a session for `process_id` and mark the instance running
    ///
    /// Returns `None` when the instance is no longer ours to run.
    async fn record_session(
        &self,
        instance: WorkflowInstance,
        process_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<WorkflowInstance>> {
        let agent = self.agent.clone();
        let outcome = compare_and_swap(
            &*self.store,
            instance,
            WriteTarget::Status,
            &self.policy,
            cancel,
            |mut current: WorkflowInstance| {
                if !current.is_managed_by(&agent) || current.phase().is_terminal() {
                    return CasDecision::Skip(());
                }
                let Some(status) = current.status.as_mut() else {
                    return CasDecision::Skip(());
                };
                status.close_open_runtimes(Utc::now());
                status
                    .runtimes
                    .push(WorkflowInstanceRuntime::new(agent.clone(), process_id));
                status.phase = WorkflowInstancePhase::Running;
                CasDecision::Write(current)
            },
        )
        .await?;

        Ok(match outcome {
            CasOutcome::Written(recorded) => Some(recorded),
            CasOutcome::Unchanged(()) => None,
        })
    }

    /// Close this agent's open sessions, optionally only the one of `process_id`
    ///
    /// A `running` instance left without an open session goes back to `pending`.
    async fn close_sessions(
        &self,
        instance: WorkflowInstance,
        process_id: Option<&str>,
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
                let now = Utc::now();
                let changed = match current.status.as_mut() {
                    Some(status) => {
                        let mut closed = 0;
                        for runtime in status.runtimes.iter_mut().filter(|r| {
                            r.is_open()
                                && r.agent == agent
                                && process_id.map_or(true, |id| r.process_id == id)
                        }) {
                            runtime.ended_at = Some(now);
                            closed += 1;
                        }
                        if closed > 0
                            && status.phase == WorkflowInstancePhase::Running
                            && status.runtimes.iter().all(|r| !r.is_open())
                        {
                            status.phase = WorkflowInstancePhase::Pending;
                        }
                        closed > 0
                    }
                    None => false,
                };
                if changed {
                    CasDecision::Write(current)
                } else {
                    CasDecision::Skip(current)
                }
            },
        )
        .await?;

        Ok(match outcome {
            CasOutcome::Written(instance) => {
                debug!("Closed stale session(s) of '{}'", instance.qualified_name());
                instance
            }
            CasOutcome::Unchanged(instance) => instance,
        })
    }

    /// Stop the tracked process of a finished instance and close its session
    async fn terminate(
        &self,
        key: &QualifiedName,
        instance: WorkflowInstance,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let process = match self.processes.remove(key) {
            Some(process) => process,
            None => {
                trace!("Workflow instance '{}' is {} and not tracked", key, instance.phase());
                return Ok(());
            }
        };

        info!(
            "Workflow instance '{}' is {}, stopping process {}",
            key,
            instance.phase(),
            process.id()
        );
        self.stop_process(key, &process, cancel).await;
        self.close_sessions(instance, Some(process.id()), cancel).await?;
        Ok(())
    }

    /// Stop tracking `key`, stopping its process if there is one
    async fn release(&self, key: &QualifiedName, cancel: &CancellationToken) {
        if let Some(process) = self.processes.remove(key) {
            info!("Workflow instance '{}' was deleted, stopping process {}", key, process.id());
            self.stop_process(key, &process, cancel).await;
        }
    }

    async fn stop_process(&self, key: &QualifiedName, process: &Arc<dyn Process>, cancel: &CancellationToken) {
        match process.stop(cancel).await {
            Ok(()) => {
                metrics::counter!("workflow_agent_processes_stopped_total").increment(1);
            }
            Err(e) => {
                error!("Failed to stop process {} of '{}': {}", process.id(), key, e);
                metrics::counter!("workflow_agent_process_failures_total", "stage" => "stop").increment(1);
            }
        }
    }

    fn observe_exit(&self, key: QualifiedName, process: Arc<dyn Process>, cancel: CancellationToken) {
        let exited = process.exited();
        let id = process.id().to_string();
        tokio::spawn(async move {
            let exit = tokio::select! {
                _ = cancel.cancelled() => return,
                exit = exited.wait() => exit,
            };
            match exit {
                Some(exit) if exit.success() => {
                    info!("Process {} of '{}' exited successfully", id, key);
                    metrics::counter!("workflow_agent_process_exits_total", "outcome" => "success").increment(1);
                }
                Some(exit) => {
                    warn!("Process {} of '{}' exited with code {:?}", id, key, exit.code);
                    metrics::counter!("workflow_agent_process_exits_total", "outcome" => "failure").increment(1);
                }
                None => debug!("Process {} of '{}' went away without an exit code", id, key),
            }
        });
    }
}
