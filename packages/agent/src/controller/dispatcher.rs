// packages/agent/src/controller/dispatcher.rs
//! Per-key event dispatch
//!
//! Each resource key gets its own worker task fed by an unbounded channel,
//! so events for one key are handled strictly in arrival order while
//! different keys proceed in parallel.
//!
//! ```text
//! watch ──► dispatcher ──► [wf-a] worker ──► handler
//!                     ├──► [wf-b] worker ──► handler
//!                     └──► [wf-c] worker ──► handler
//! ```
//!
//! A `deleted` event retires the key's worker once it has been queued, and
//! so does evicting a key that left the subscription's filter. A worker
//! spawned later for the same key first waits for the retired one, so a
//! delete followed by a re-create still runs in order.

use crate::controller::ResourceEventHandler;
use crate::resources::{QualifiedName, Resource};
use crate::store::{WatchEvent, WatchEventType};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

/// What a key's worker is asked to handle
enum Delivery<R> {
    Event(WatchEvent<R>),
    /// The resource is no longer covered by the subscription
    Evicted(R),
}

impl<R> Delivery<R> {
    fn label(&self) -> &'static str {
        match self {
            Delivery::Event(event) => super::event_label(event.event_type),
            Delivery::Evicted(_) => "evicted",
        }
    }
}

struct Worker<R> {
    sender: mpsc::UnboundedSender<Delivery<R>>,
    handle: JoinHandle<()>,
}

/// Routes events to one sequential worker per resource key
pub(crate) struct KeyedDispatcher<R: Resource> {
    handler: Arc<dyn ResourceEventHandler<R>>,
    cancel: CancellationToken,
    workers: HashMap<QualifiedName, Worker<R>>,
    retired: HashMap<QualifiedName, JoinHandle<()>>,
}

impl<R: Resource> KeyedDispatcher<R> {
    pub(crate) fn new(handler: Arc<dyn ResourceEventHandler<R>>, cancel: CancellationToken) -> Self {
        Self {
            handler,
            cancel,
            workers: HashMap::new(),
            retired: HashMap::new(),
        }
    }

    /// Number of keys with a live worker
    pub(crate) fn active_keys(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn dispatch(&mut self, event: WatchEvent<R>) {
        let key = event.resource.qualified_name();
        let retire = event.event_type == WatchEventType::Deleted;
        self.deliver(key, Delivery::Event(event), retire);
    }

    /// Hand the key its last delivery before its worker is retired
    pub(crate) fn evict(&mut self, resource: R) {
        let key = resource.qualified_name();
        self.deliver(key, Delivery::Evicted(resource), true);
    }

    fn deliver(&mut self, key: QualifiedName, delivery: Delivery<R>, retire: bool) {
        let mut pending = Some(delivery);
        while let Some(delivery) = pending.take() {
            let worker = match self.workers.remove(&key) {
                Some(worker) => worker,
                None => self.spawn_worker(&key),
            };
            match worker.sender.send(delivery) {
                Ok(()) => {
                    self.workers.insert(key.clone(), worker);
                }
                Err(mpsc::error::SendError(delivery)) => {
                    // the worker died (a handler panicked); start a fresh one
                    error!("Event worker for '{}' is gone, restarting it", key);
                    self.retired.insert(key.clone(), worker.handle);
                    pending = Some(delivery);
                }
            }
        }

        if retire {
            if let Some(worker) = self.workers.remove(&key) {
                trace!("Retiring event worker for '{}'", key);
                self.retired.insert(key, worker.handle);
            }
        }
        self.retired.retain(|_, handle| !handle.is_finished());
    }

    fn spawn_worker(&mut self, key: &QualifiedName) -> Worker<R> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let previous = self.retired.remove(key);
        let handle = tokio::spawn(run_worker(
            key.clone(),
            receiver,
            Arc::clone(&self.handler),
            self.cancel.clone(),
            previous,
        ));
        Worker { sender, handle }
    }

    /// Stop accepting events and wait for every queued event to be handled
    pub(crate) async fn drain(mut self) {
        let mut handles: Vec<JoinHandle<()>> = self.workers.drain().map(|(_, w)| w.handle).collect();
        handles.extend(self.retired.drain().map(|(_, h)| h));
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn run_worker<R: Resource>(
    key: QualifiedName,
    mut receiver: mpsc::UnboundedReceiver<Delivery<R>>,
    handler: Arc<dyn ResourceEventHandler<R>>,
    cancel: CancellationToken,
    previous: Option<JoinHandle<()>>,
) {
    if let Some(previous) = previous {
        let _ = previous.await;
    }

    while let Some(delivery) = receiver.recv().await {
        if cancel.is_cancelled() {
            break;
        }

        let label = delivery.label();
        let result = match delivery {
            Delivery::Event(event) => match event.event_type {
                WatchEventType::Created => handler.on_created(event.resource, &cancel).await,
                WatchEventType::Updated => handler.on_updated(event.resource, &cancel).await,
                WatchEventType::Deleted => handler.on_deleted(event.resource, &cancel).await,
            },
            Delivery::Evicted(resource) => handler.on_evicted(resource, &cancel).await,
        };

        if let Err(e) = result {
            // handled means handled: no redelivery
            error!("Failed to handle {} event for {} '{}': {}", label, R::KIND, key, e);
            metrics::counter!("workflow_agent_handler_failures_total", "kind" => R::KIND).increment(1);
        }
    }
}
