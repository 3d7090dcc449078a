// packages/agent/src/store/monitor.rs
//! Monitor for a single named resource

use crate::resources::{QualifiedName, Resource};
use crate::store::{ResourceFilter, ResourceStore, WatchEventType};
use crate::utils::errors::{AgentError, Result};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Keeps the latest known value of one resource
///
/// The value is never cleared: when the resource is deleted the last known
/// version is kept and a warning is logged. When the underlying watch ends
/// the monitor's change channel closes, which subscribers observe as an
/// error from `changed()`.
pub struct ResourceMonitor<R: Resource> {
    name: QualifiedName,
    current: watch::Receiver<R>,
    task: JoinHandle<()>,
}

impl<R: Resource> ResourceMonitor<R> {
    /// Fetch the resource and start following its changes
    pub async fn start<S: ResourceStore>(
        store: Arc<S>,
        name: &str,
        namespace: &str,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let qualified_name = QualifiedName::new(namespace, name);
        let filter = ResourceFilter::in_namespace(namespace);

        // subscribe before reading so no change is lost in between
        let mut events = store.watch::<R>(&filter).await?;
        let initial = store
            .get::<R>(name, namespace)
            .await?
            .ok_or_else(|| AgentError::NotFound {
                kind: R::KIND,
                name: qualified_name.to_string(),
            })?;

        let (sender, current) = watch::channel(initial);
        let watched = qualified_name.clone();

        let task = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = events.next() => next,
                };

                match next {
                    Some(Ok(event)) if event.resource.qualified_name() == watched => {
                        match event.event_type {
                            WatchEventType::Created | WatchEventType::Updated => {
                                debug!("{} '{}' changed", R::KIND, watched);
                                sender.send_replace(event.resource);
                            }
                            WatchEventType::Deleted => {
                                warn!(
                                    "{} '{}' was deleted, keeping last known version",
                                    R::KIND, watched
                                );
                            }
                        }
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!("Watch for {} '{}' failed: {}", R::KIND, watched, e);
                        break;
                    }
                    None => {
                        error!("Watch for {} '{}' ended", R::KIND, watched);
                        break;
                    }
                }
            }
            // dropping the sender closes every subscriber
        });

        Ok(Self {
            name: qualified_name,
            current,
            task,
        })
    }

    pub fn name(&self) -> &QualifiedName {
        &self.name
    }

    /// Latest known version of the resource
    pub fn current(&self) -> R {
        self.current.borrow().clone()
    }

    /// Receiver notified on every change
    pub fn subscribe(&self) -> watch::Receiver<R> {
        self.current.clone()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl<R: Resource> Drop for ResourceMonitor<R> {
    fn drop(&mut self) {
        self.task.abort();
    }
}
