// packages/agent/src/store/memory.rs
//! In-memory resource store
//!
//! Reference implementation of [`ResourceStore`] used by the agent binary
//! and by tests. Resources are kept as JSON documents keyed by kind and
//! qualified name. Every write takes a fresh version from a store-wide
//! counter, and watch events are published while the key's shard lock is
//! held, so per-key event order always equals write order.
//!
//! ```text
//! write ──► DashMap entry (shard lock) ──► version check ──► broadcast
//!                                                              │
//!                                         watch ◄── filter ◄───┘
//! ```

use crate::resources::{QualifiedName, Resource};
use crate::store::{ResourceFilter, ResourceStore, WatchEvent, WatchEventType, WatchStream};
use crate::utils::errors::{AgentError, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Default number of events buffered per watcher before it lags
const DEFAULT_EVENT_CAPACITY: usize = 4096;

type ObjectKey = (&'static str, QualifiedName);

#[derive(Debug, Clone)]
struct RawEvent {
    kind: &'static str,
    event_type: WatchEventType,
    value: Arc<Value>,
}

/// In-memory, versioned resource store
pub struct MemoryStore {
    /// Serialized resources
    objects: DashMap<ObjectKey, Value>,

    /// Last version handed out
    version: AtomicU64,

    /// Event fan-out to watchers
    events: broadcast::Sender<RawEvent>,

    /// Cancelled once the store is closed
    closed: CancellationToken,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            objects: DashMap::new(),
            version: AtomicU64::new(0),
            events,
            closed: CancellationToken::new(),
        }
    }

    /// Close the store: watch streams end and every later call fails
    pub fn close(&self) {
        debug!("Closing in-memory resource store");
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Number of stored resources of every kind
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(AgentError::StoreUnavailable("store is closed".into()));
        }
        Ok(())
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn publish(&self, kind: &'static str, event_type: WatchEventType, value: &Value) {
        trace!("Publishing {:?} event for {}", event_type, kind);
        // no receivers is fine
        let _ = self.events.send(RawEvent {
            kind,
            event_type,
            value: Arc::new(value.clone()),
        });
    }

    fn key<R: Resource>(resource: &R) -> ObjectKey {
        (R::KIND, resource.qualified_name())
    }

    fn decode<R: Resource>(value: &Value) -> Result<R> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Conditional write shared by `replace` and `replace_status`
    fn write<R: Resource>(&self, resource: R, merge: fn(&Value, Value) -> Value) -> Result<R> {
        self.ensure_open()?;
        let key = Self::key(&resource);
        let expected = resource.resource_version();
        let incoming = serde_json::to_value(&resource)?;

        match self.objects.entry(key) {
            Entry::Vacant(_) => Err(AgentError::NotFound {
                kind: R::KIND,
                name: resource.qualified_name().to_string(),
            }),
            Entry::Occupied(mut entry) => {
                let current = stored_version(entry.get());
                if current != expected {
                    return Err(AgentError::Conflict {
                        kind: R::KIND,
                        name: resource.qualified_name().to_string(),
                        version: expected,
                    });
                }

                let mut next = merge(entry.get(), incoming);
                set_version(&mut next, self.next_version());
                let written = Self::decode::<R>(&next)?;
                entry.insert(next.clone());
                self.publish(R::KIND, WatchEventType::Updated, &next);
                Ok(written)
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn stored_version(value: &Value) -> u64 {
    value["metadata"]["resourceVersion"].as_u64().unwrap_or(0)
}

fn set_version(value: &mut Value, version: u64) {
    if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.insert("resourceVersion".to_string(), Value::from(version));
    }
}

/// Keep the stored status, take everything else from the incoming document
fn merge_spec(current: &Value, mut incoming: Value) -> Value {
    if let Some(object) = incoming.as_object_mut() {
        match current.get("status") {
            Some(status) => {
                object.insert("status".to_string(), status.clone());
            }
            None => {
                object.remove("status");
            }
        }
    }
    incoming
}

/// Keep the stored document, take the status from the incoming one
fn merge_status(current: &Value, incoming: Value) -> Value {
    let mut next = current.clone();
    if let Some(object) = next.as_object_mut() {
        match incoming.get("status") {
            Some(status) => {
                object.insert("status".to_string(), status.clone());
            }
            None => {
                object.remove("status");
            }
        }
    }
    next
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get<R: Resource>(&self, name: &str, namespace: &str) -> Result<Option<R>> {
        self.ensure_open()?;
        let key = (R::KIND, QualifiedName::new(namespace, name));
        match self.objects.get(&key) {
            Some(value) => Ok(Some(Self::decode(value.value())?)),
            None => Ok(None),
        }
    }

    async fn list<R: Resource>(&self, filter: &ResourceFilter) -> Result<Vec<R>> {
        self.ensure_open()?;
        let mut resources = Vec::new();
        for entry in self.objects.iter().filter(|e| e.key().0 == R::KIND) {
            let resource: R = Self::decode(entry.value())?;
            if filter.matches(&resource) {
                resources.push(resource);
            }
        }
        resources.sort_by_key(|r| r.qualified_name());
        Ok(resources)
    }

    async fn watch<R: Resource>(&self, filter: &ResourceFilter) -> Result<WatchStream<R>> {
        self.ensure_open()?;
        let receiver = self.events.subscribe();
        let state = (receiver, self.closed.clone(), filter.clone());

        let stream = futures::stream::unfold(state, |(mut receiver, closed, filter)| async move {
            loop {
                let received = tokio::select! {
                    biased;
                    _ = closed.cancelled() => return None,
                    received = receiver.recv() => received,
                };

                match received {
                    Ok(raw) if raw.kind == R::KIND => {
                        let item = match serde_json::from_value::<R>((*raw.value).clone()) {
                            Ok(resource) if filter.matches(&resource) => {
                                Ok(WatchEvent::new(raw.event_type, resource))
                            }
                            Ok(_) => continue,
                            Err(e) => Err(AgentError::from(e)),
                        };
                        return Some((item, (receiver, closed, filter)));
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(missed)) => {
                        let err = AgentError::StoreUnavailable(format!(
                            "watch fell behind by {} events",
                            missed
                        ));
                        return Some((Err(err), (receiver, closed, filter)));
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn create<R: Resource>(&self, mut resource: R) -> Result<R> {
        self.ensure_open()?;
        let key = Self::key(&resource);
        let name = key.1.to_string();

        match self.objects.entry(key) {
            Entry::Occupied(_) => Err(AgentError::AlreadyExists { kind: R::KIND, name }),
            Entry::Vacant(entry) => {
                let metadata = resource.metadata_mut();
                metadata.resource_version = self.next_version();
                if metadata.creation_timestamp.is_none() {
                    metadata.creation_timestamp = Some(Utc::now());
                }
                let value = serde_json::to_value(&resource)?;
                entry.insert(value.clone());
                self.publish(R::KIND, WatchEventType::Created, &value);
                debug!("Created {} '{}'", R::KIND, name);
                Ok(resource)
            }
        }
    }

    async fn replace<R: Resource>(&self, resource: R) -> Result<R> {
        self.write(resource, merge_spec)
    }

    async fn replace_status<R: Resource>(&self, resource: R) -> Result<R> {
        self.write(resource, merge_status)
    }

    async fn delete<R: Resource>(&self, name: &str, namespace: &str) -> Result<Option<R>> {
        self.ensure_open()?;
        let key = (R::KIND, QualifiedName::new(namespace, name));
        match self.objects.entry(key) {
            Entry::Vacant(_) => Ok(None),
            Entry::Occupied(entry) => {
                let value = entry.remove();
                let resource = Self::decode::<R>(&value)?;
                self.publish(R::KIND, WatchEventType::Deleted, &value);
                debug!("Deleted {} '{}'", R::KIND, resource.qualified_name());
                Ok(Some(resource))
            }
        }
    }
}
