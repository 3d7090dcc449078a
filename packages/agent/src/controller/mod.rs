// packages/agent/src/controller/mod.rs
//! Generic watch/reconcile controller
//!
//! A controller follows one resource kind in the store:
//!
//! 1. subscribe to the watch stream
//! 2. `list` to populate the in-memory mirror
//! 3. for every event: update the mirror, then hand the event to the
//!    per-key dispatcher which calls the [`ResourceEventHandler`]
//! 4. every resync interval: re-list, dispatch `updated` for everything
//!    listed and `deleted` for mirrored resources that disappeared
//!
//! Handler failures are logged and the event is considered handled. The
//! watch stream ending or failing is fatal and is reported through
//! [`ResourceController::wait`].

mod dispatcher;

use crate::resources::{QualifiedName, Resource};
use crate::store::{ResourceFilter, ResourceStore, WatchEvent, WatchEventType, WatchStream};
use crate::utils::config::ControllerConfig;
use crate::utils::errors::{AgentError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use dispatcher::KeyedDispatcher;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Callbacks invoked for the events of one resource kind
#[async_trait]
pub trait ResourceEventHandler<R: Resource>: Send + Sync + 'static {
    async fn on_created(&self, resource: R, cancel: &CancellationToken) -> Result<()> {
        let _ = (resource, cancel);
        Ok(())
    }

    async fn on_updated(&self, resource: R, cancel: &CancellationToken) -> Result<()> {
        let _ = (resource, cancel);
        Ok(())
    }

    async fn on_deleted(&self, resource: R, cancel: &CancellationToken) -> Result<()> {
        let _ = (resource, cancel);
        Ok(())
    }

    /// The resource still exists but no longer matches the subscription's filter
    async fn on_evicted(&self, resource: R, cancel: &CancellationToken) -> Result<()> {
        let _ = (resource, cancel);
        Ok(())
    }
}

/// Read view of a controller's in-memory mirror
#[derive(Clone)]
pub struct ResourceCache<R: Resource> {
    entries: Arc<DashMap<QualifiedName, R>>,
}

impl<R: Resource> ResourceCache<R> {
    fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    pub fn get(&self, name: &QualifiedName) -> Option<R> {
        self.entries.get(name).map(|r| r.value().clone())
    }

    pub fn contains(&self, name: &QualifiedName) -> bool {
        self.entries.contains_key(name)
    }

    /// Snapshot of every mirrored resource, ordered by qualified name
    pub fn values(&self) -> Vec<R> {
        let mut values: Vec<R> = self.entries.iter().map(|e| e.value().clone()).collect();
        values.sort_by_key(|r| r.qualified_name());
        values
    }

    pub fn keys(&self) -> HashSet<QualifiedName> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn apply(&self, event: &WatchEvent<R>) {
        let key = event.resource.qualified_name();
        match event.event_type {
            WatchEventType::Created | WatchEventType::Updated => {
                self.entries.insert(key, event.resource.clone());
            }
            WatchEventType::Deleted => {
                self.entries.remove(&key);
            }
        }
    }
}

struct Subscription {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Watch/reconcile engine for one resource kind
pub struct ResourceController<R: Resource, S: ResourceStore> {
    store: Arc<S>,
    config: ControllerConfig,
    cache: ResourceCache<R>,
    cancel: CancellationToken,
    dispatcher: Arc<Mutex<Option<KeyedDispatcher<R>>>>,
    subscription: parking_lot::Mutex<Option<Subscription>>,
    failures: mpsc::UnboundedSender<AgentError>,
    failure_rx: Mutex<mpsc::UnboundedReceiver<AgentError>>,
}

impl<R: Resource, S: ResourceStore> ResourceController<R, S> {
    pub fn new(store: Arc<S>, config: ControllerConfig, cancel: CancellationToken) -> Self {
        let (failures, failure_rx) = mpsc::unbounded_channel();
        Self {
            store,
            config,
            cache: ResourceCache::new(),
            cancel,
            dispatcher: Arc::new(Mutex::new(None)),
            subscription: parking_lot::Mutex::new(None),
            failures,
            failure_rx: Mutex::new(failure_rx),
        }
    }

    /// Shared handle on the in-memory mirror
    pub fn cache(&self) -> ResourceCache<R> {
        self.cache.clone()
    }

    /// Populate the mirror and start dispatching events to `handler`
    pub async fn start(
        &self,
        filter: ResourceFilter,
        handler: Arc<dyn ResourceEventHandler<R>>,
    ) -> Result<()> {
        {
            let mut dispatcher = self.dispatcher.lock().await;
            if dispatcher.is_none() {
                *dispatcher = Some(KeyedDispatcher::new(handler, self.cancel.clone()));
            }
        }
        self.subscribe(filter).await
    }

    /// Replace the current subscription with one using `filter`
    ///
    /// Event workers (and therefore per-key ordering) survive the switch.
    pub async fn resubscribe(&self, filter: ResourceFilter) -> Result<()> {
        if self.dispatcher.lock().await.is_none() {
            return Err(AgentError::ConfigError(format!(
                "{} controller has not been started",
                R::KIND
            )));
        }
        self.subscribe(filter).await
    }

    async fn subscribe(&self, filter: ResourceFilter) -> Result<()> {
        info!("Subscribing to {} resources ({:?})", R::KIND, filter);

        // watch first, then list: nothing written in between is missed
        let stream = self.store.watch::<R>(&filter).await?;
        let listed = self.store.list::<R>(&filter).await?;

        let listed_keys: HashSet<QualifiedName> = listed.iter().map(|r| r.qualified_name()).collect();
        let evicted: Vec<R> = self
            .cache
            .keys()
            .difference(&listed_keys)
            .filter_map(|key| self.cache.entries.remove(key).map(|(_, resource)| resource))
            .collect();
        for resource in listed {
            self.cache.entries.insert(resource.qualified_name(), resource);
        }
        debug!("Mirrored {} {} resources", self.cache.len(), R::KIND);

        if !evicted.is_empty() {
            if let Some(dispatcher) = self.dispatcher.lock().await.as_mut() {
                for resource in evicted {
                    dispatcher.evict(resource);
                }
                debug!(
                    "Evicted {} resources outside the new filter, {} event workers left",
                    R::KIND,
                    dispatcher.active_keys()
                );
            }
        }

        let cancel = self.cancel.child_token();
        let task = tokio::spawn(run_subscription(
            stream,
            filter,
            Arc::clone(&self.store),
            self.cache.clone(),
            Arc::clone(&self.dispatcher),
            self.config.resync_interval(),
            cancel.clone(),
            self.failures.clone(),
        ));

        if let Some(previous) = self.subscription.lock().replace(Subscription { cancel, task }) {
            previous.cancel.cancel();
        }
        Ok(())
    }

    /// Resolves when the controller is stopped (`Ok`) or its store goes away (`Err`)
    pub async fn wait(&self) -> Result<()> {
        let mut failures = self.failure_rx.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Ok(()),
            failure = failures.recv() => match failure {
                Some(e) => Err(e),
                None => Ok(()),
            },
        }
    }

    /// Stop the subscription and let queued events finish
    pub async fn stop(&self) {
        debug!("Stopping {} controller", R::KIND);
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.cancel.cancel();
            subscription.task.abort();
        }
        self.cancel.cancel();
        if let Some(dispatcher) = self.dispatcher.lock().await.take() {
            dispatcher.drain().await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_subscription<R: Resource, S: ResourceStore>(
    mut stream: WatchStream<R>,
    filter: ResourceFilter,
    store: Arc<S>,
    cache: ResourceCache<R>,
    dispatcher: Arc<Mutex<Option<KeyedDispatcher<R>>>>,
    resync_interval: Option<Duration>,
    cancel: CancellationToken,
    failures: mpsc::UnboundedSender<AgentError>,
) {
    let mut resync = resync_interval.map(|period| tokio::time::interval_at(Instant::now() + period, period));

    let result: Result<()> = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            _ = tick(&mut resync) => {
                if let Err(e) = resync_once(&*store, &filter, &cache, &dispatcher).await {
                    break Err(e);
                }
            }
            next = stream.next() => match next {
                Some(Ok(event)) => {
                    metrics::counter!(
                        "workflow_agent_controller_events_total",
                        "kind" => R::KIND,
                        "event" => event_label(event.event_type)
                    )
                    .increment(1);
                    cache.apply(&event);
                    dispatch(&dispatcher, event).await;
                }
                Some(Err(e)) => break Err(e),
                None => break Err(AgentError::StoreUnavailable(format!(
                    "{} watch stream ended",
                    R::KIND
                ))),
            },
        }
    };

    if let Err(e) = result {
        if !cancel.is_cancelled() {
            error!("{} subscription failed: {}", R::KIND, e);
            let _ = failures.send(e);
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}

async fn dispatch<R: Resource>(dispatcher: &Mutex<Option<KeyedDispatcher<R>>>, event: WatchEvent<R>) {
    if let Some(dispatcher) = dispatcher.lock().await.as_mut() {
        dispatcher.dispatch(event);
    }
}

async fn resync_once<R: Resource, S: ResourceStore>(
    store: &S,
    filter: &ResourceFilter,
    cache: &ResourceCache<R>,
    dispatcher: &Mutex<Option<KeyedDispatcher<R>>>,
) -> Result<()> {
    let listed = store.list::<R>(filter).await?;
    debug!("Resyncing {} {} resources", listed.len(), R::KIND);

    let listed_keys: HashSet<QualifiedName> = listed.iter().map(|r| r.qualified_name()).collect();
    let vanished: Vec<R> = cache
        .values()
        .into_iter()
        .filter(|r| !listed_keys.contains(&r.qualified_name()))
        .collect();

    let mut events: Vec<WatchEvent<R>> = vanished
        .into_iter()
        .map(|r| WatchEvent::new(WatchEventType::Deleted, r))
        .collect();
    events.extend(listed.into_iter().map(|r| WatchEvent::new(WatchEventType::Updated, r)));

    for event in events {
        cache.apply(&event);
        dispatch(dispatcher, event).await;
    }
    Ok(())
}

fn event_label(event_type: WatchEventType) -> &'static str {
    match event_type {
        WatchEventType::Created => "created",
        WatchEventType::Updated => "updated",
        WatchEventType::Deleted => "deleted",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{
        LabelSelector, ResourceMetadata, WorkflowInstance, WorkflowInstanceSpec,
        WorkflowInstantiationType,
    };
    use crate::store::MemoryStore;

    fn instance(name: &str) -> WorkflowInstance {
        WorkflowInstance::new(
            ResourceMetadata::new("default", name),
            WorkflowInstanceSpec::new(
                "greeter.default:1.0.0".parse().unwrap(),
                "key-1",
                WorkflowInstantiationType::Manual,
            ),
        )
    }

    /// Records `(event, name, label value)` per callback
    struct Recorder {
        seen: parking_lot::Mutex<Vec<(WatchEventType, String, Option<String>)>>,
        evicted: parking_lot::Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    impl Recorder {
        fn new(fail_on: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                seen: parking_lot::Mutex::new(Vec::new()),
                evicted: parking_lot::Mutex::new(Vec::new()),
                fail_on: fail_on.map(str::to_string),
            })
        }

        fn record(&self, event: WatchEventType, resource: &WorkflowInstance) -> Result<()> {
            self.seen.lock().push((
                event,
                resource.metadata.name.clone(),
                resource.metadata.labels.get("step").cloned(),
            ));
            if self.fail_on.as_deref() == Some(resource.metadata.name.as_str()) {
                return Err(AgentError::ProcessError("handler failure".into()));
            }
            Ok(())
        }

        fn events_for(&self, name: &str) -> Vec<(WatchEventType, Option<String>)> {
            self.seen
                .lock()
                .iter()
                .filter(|(_, n, _)| n == name)
                .map(|(e, _, step)| (*e, step.clone()))
                .collect()
        }
    }

    #[async_trait]
    impl ResourceEventHandler<WorkflowInstance> for Recorder {
        async fn on_created(&self, resource: WorkflowInstance, _cancel: &CancellationToken) -> Result<()> {
            self.record(WatchEventType::Created, &resource)
        }

        async fn on_updated(&self, resource: WorkflowInstance, _cancel: &CancellationToken) -> Result<()> {
            // slow handler: ordering must still hold
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.record(WatchEventType::Updated, &resource)
        }

        async fn on_deleted(&self, resource: WorkflowInstance, _cancel: &CancellationToken) -> Result<()> {
            self.record(WatchEventType::Deleted, &resource)
        }

        async fn on_evicted(&self, resource: WorkflowInstance, _cancel: &CancellationToken) -> Result<()> {
            self.evicted.lock().push(resource.metadata.name);
            Ok(())
        }
    }

    fn config(resync_interval_secs: u64) -> ControllerConfig {
        ControllerConfig { resync_interval_secs }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    async fn active_workers(controller: &ResourceController<WorkflowInstance, MemoryStore>) -> usize {
        controller
            .dispatcher
            .lock()
            .await
            .as_ref()
            .map_or(0, |dispatcher| dispatcher.active_keys())
    }

    #[tokio::test]
    async fn test_initial_list_populates_mirror() {
        let store = Arc::new(MemoryStore::new());
        store.create(instance("a")).await.unwrap();
        store.create(instance("b")).await.unwrap();

        let controller = ResourceController::<WorkflowInstance, _>::new(store, config(0), CancellationToken::new());
        let recorder = Recorder::new(None);
        controller.start(ResourceFilter::all(), recorder.clone()).await.unwrap();

        let cache = controller.cache();
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&QualifiedName::new("default", "a")));
        // the initial list is not dispatched
        assert!(recorder.seen.lock().is_empty());
        controller.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_per_key_order_is_preserved() {
        let store = Arc::new(MemoryStore::new());
        let controller =
            ResourceController::<WorkflowInstance, _>::new(store.clone(), config(0), CancellationToken::new());
        let recorder = Recorder::new(None);
        controller.start(ResourceFilter::all(), recorder.clone()).await.unwrap();

        for name in ["a", "b"] {
            let mut current = store.create(instance(name)).await.unwrap();
            for step in 0..5 {
                current.metadata.labels.insert("step".into(), step.to_string());
                current = store.replace(current).await.unwrap();
            }
        }

        eventually(|| recorder.seen.lock().len() == 12).await;
        for name in ["a", "b"] {
            let events = recorder.events_for(name);
            assert_eq!(events[0], (WatchEventType::Created, None));
            let steps: Vec<_> = events[1..].iter().map(|(_, s)| s.clone().unwrap()).collect();
            assert_eq!(steps, vec!["0", "1", "2", "3", "4"]);
        }
        let cached = controller.cache().get(&QualifiedName::new("default", "a")).unwrap();
        assert_eq!(cached.metadata.labels["step"], "4");
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_end_subscription() {
        let store = Arc::new(MemoryStore::new());
        let controller =
            ResourceController::<WorkflowInstance, _>::new(store.clone(), config(0), CancellationToken::new());
        let recorder = Recorder::new(Some("bad"));
        controller.start(ResourceFilter::all(), recorder.clone()).await.unwrap();

        store.create(instance("bad")).await.unwrap();
        store.create(instance("good")).await.unwrap();
        store.delete::<WorkflowInstance>("good", "default").await.unwrap();

        eventually(|| recorder.events_for("good").len() == 2).await;
        assert_eq!(recorder.events_for("bad").len(), 1);
        assert!(!controller.cache().contains(&QualifiedName::new("default", "good")));
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_store_close_is_reported_as_failure() {
        let store = Arc::new(MemoryStore::new());
        let controller =
            ResourceController::<WorkflowInstance, _>::new(store.clone(), config(0), CancellationToken::new());
        controller.start(ResourceFilter::all(), Recorder::new(None)).await.unwrap();

        store.close();
        let result = tokio::time::timeout(Duration::from_secs(1), controller.wait())
            .await
            .unwrap();
        assert!(matches!(result, Err(AgentError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_stop_resolves_wait() {
        let store = Arc::new(MemoryStore::new());
        let controller =
            ResourceController::<WorkflowInstance, _>::new(store, config(0), CancellationToken::new());
        controller.start(ResourceFilter::all(), Recorder::new(None)).await.unwrap();

        controller.stop().await;
        assert!(controller.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_resync_redispatches_and_detects_vanished() {
        let store = Arc::new(MemoryStore::new());
        store.create(instance("a")).await.unwrap();
        let controller =
            ResourceController::<WorkflowInstance, _>::new(store.clone(), config(1), CancellationToken::new());
        let recorder = Recorder::new(None);
        controller.start(ResourceFilter::all(), recorder.clone()).await.unwrap();

        // a resource the mirror knows but the store no longer has
        controller
            .cache
            .entries
            .insert(QualifiedName::new("default", "ghost"), instance("ghost"));

        tokio::time::timeout(Duration::from_secs(3), eventually(|| {
            !recorder.events_for("a").is_empty() && !recorder.events_for("ghost").is_empty()
        }))
        .await
        .unwrap();

        assert_eq!(recorder.events_for("a")[0].0, WatchEventType::Updated);
        assert_eq!(recorder.events_for("ghost")[0].0, WatchEventType::Deleted);
        assert!(!controller.cache().contains(&QualifiedName::new("default", "ghost")));
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_narrowed_filter_evicts_and_retires_workers() {
        let store = Arc::new(MemoryStore::new());
        let controller =
            ResourceController::<WorkflowInstance, _>::new(store.clone(), config(0), CancellationToken::new());
        let recorder = Recorder::new(None);
        controller.start(ResourceFilter::all(), recorder.clone()).await.unwrap();

        let mut gpu = instance("gpu");
        gpu.metadata.labels.insert("tier".into(), "gpu".into());
        store.create(gpu).await.unwrap();
        store.create(instance("cpu")).await.unwrap();
        eventually(|| recorder.seen.lock().len() == 2).await;
        assert_eq!(active_workers(&controller).await, 2);

        controller
            .resubscribe(ResourceFilter::all().with_selector(LabelSelector::equals("tier", "gpu")))
            .await
            .unwrap();

        let cache = controller.cache();
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&QualifiedName::new("default", "gpu")));
        assert_eq!(active_workers(&controller).await, 1);
        eventually(|| recorder.evicted.lock().clone() == vec!["cpu".to_string()]).await;
        // still stored, so no deleted event
        assert_eq!(recorder.events_for("cpu"), vec![(WatchEventType::Created, None)]);
        controller.stop().await;
    }
}
