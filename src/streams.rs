//! Named push streams: schema-bound item stores whose every mutation is
//! fanned out to live subscribers. Streams are for user-facing updates, not
//! intra-flow data passing; that is what flow state is for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::step::StreamDecl;

/// Per-subscriber buffer. A subscriber that falls this far behind is dropped
/// rather than allowed to block the mutating handler.
const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream `{0}` is not declared")]
    Unknown(String),
    #[error("stream `{0}` is already declared")]
    Duplicate(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamOp {
    Set,
    Delete,
}

/// One change notification pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub stream: String,
    pub group_id: String,
    pub id: String,
    pub op: StreamOp,
    pub data: Option<Value>,
    pub at: DateTime<Utc>,
}

struct Subscriber {
    group_id: String,
    /// `None` subscribes the whole group feed.
    id: Option<String>,
    tx: mpsc::Sender<StreamEvent>,
}

struct StreamStore {
    decl: StreamDecl,
    items: DashMap<(String, String), Value>,
    subscribers: DashMap<u64, Subscriber>,
}

impl StreamStore {
    fn notify(&self, event: StreamEvent) {
        let mut dropped = Vec::new();
        for entry in self.subscribers.iter() {
            let sub = entry.value();
            if sub.group_id != event.group_id {
                continue;
            }
            if let Some(id) = &sub.id {
                if *id != event.id {
                    continue;
                }
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(stream = %event.stream, subscriber = *entry.key(),
                        "dropping slow stream subscriber");
                    dropped.push(*entry.key());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(*entry.key()),
            }
        }
        for key in dropped {
            self.subscribers.remove(&key);
        }
    }
}

/// Feed of one `(stream, group[, id])` scope. Dropping it ends the
/// subscription.
pub struct StreamSubscription {
    rx: mpsc::Receiver<StreamEvent>,
}

impl StreamSubscription {
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<StreamEvent> {
        self.rx.try_recv().ok()
    }
}

/// All declared streams and their live subscribers.
pub struct StreamRegistry {
    streams: DashMap<String, Arc<StreamStore>>,
    next_subscriber: AtomicU64,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self { streams: DashMap::new(), next_subscriber: AtomicU64::new(1) }
    }

    pub fn declare(&self, decl: StreamDecl) -> Result<(), StreamError> {
        let name = decl.name.clone();
        let store =
            Arc::new(StreamStore { decl, items: DashMap::new(), subscribers: DashMap::new() });
        if self.streams.insert(name.clone(), store).is_some() {
            return Err(StreamError::Duplicate(name));
        }
        debug!(stream = %name, "stream declared");
        Ok(())
    }

    pub fn declared(&self) -> Vec<String> {
        let mut names: Vec<String> = self.streams.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn schema(&self, stream: &str) -> Option<Value> {
        self.streams.get(stream).map(|s| s.decl.schema.clone())
    }

    fn store(&self, stream: &str) -> Result<Arc<StreamStore>, StreamError> {
        self.streams
            .get(stream)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| StreamError::Unknown(stream.to_string()))
    }

    pub fn get(&self, stream: &str, group_id: &str, id: &str) -> Result<Option<Value>, StreamError> {
        let store = self.store(stream)?;
        Ok(store.items.get(&(group_id.to_string(), id.to_string())).map(|v| v.value().clone()))
    }

    /// Store an item and push the new value to matching subscribers. Returns
    /// the stored value.
    pub fn set(
        &self,
        stream: &str,
        group_id: &str,
        id: &str,
        data: Value,
    ) -> Result<Value, StreamError> {
        let store = self.store(stream)?;
        store.items.insert((group_id.to_string(), id.to_string()), data.clone());
        store.notify(StreamEvent {
            stream: stream.to_string(),
            group_id: group_id.to_string(),
            id: id.to_string(),
            op: StreamOp::Set,
            data: Some(data.clone()),
            at: Utc::now(),
        });
        Ok(data)
    }

    pub fn delete(&self, stream: &str, group_id: &str, id: &str) -> Result<(), StreamError> {
        let store = self.store(stream)?;
        if store.items.remove(&(group_id.to_string(), id.to_string())).is_some() {
            store.notify(StreamEvent {
                stream: stream.to_string(),
                group_id: group_id.to_string(),
                id: id.to_string(),
                op: StreamOp::Delete,
                data: None,
                at: Utc::now(),
            });
        }
        Ok(())
    }

    /// All items of one group, ordered by item id.
    pub fn get_group(&self, stream: &str, group_id: &str) -> Result<Vec<Value>, StreamError> {
        let store = self.store(stream)?;
        let mut items: Vec<(String, Value)> = store
            .items
            .iter()
            .filter(|e| e.key().0 == group_id)
            .map(|e| (e.key().1.clone(), e.value().clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(items.into_iter().map(|(_, v)| v).collect())
    }

    /// Subscribe to a group feed (`id: None`) or a single item feed.
    pub fn subscribe(
        &self,
        stream: &str,
        group_id: &str,
        id: Option<&str>,
    ) -> Result<StreamSubscription, StreamError> {
        let store = self.store(stream)?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let key = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        store.subscribers.insert(
            key,
            Subscriber { group_id: group_id.to_string(), id: id.map(str::to_string), tx },
        );
        Ok(StreamSubscription { rx })
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry_with(name: &str) -> StreamRegistry {
        let registry = StreamRegistry::new();
        registry
            .declare(StreamDecl { name: name.into(), schema: json!({"type": "object"}) })
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn group_subscribers_see_every_mutation_in_scope() {
        let registry = registry_with("progress");
        let mut feed = registry.subscribe("progress", "run-1", None).unwrap();

        registry.set("progress", "run-1", "a", json!({"pct": 10})).unwrap();
        registry.set("progress", "run-2", "a", json!({"pct": 99})).unwrap();
        registry.delete("progress", "run-1", "a").unwrap();

        let first = feed.next().await.unwrap();
        assert_eq!(first.op, StreamOp::Set);
        assert_eq!(first.data, Some(json!({"pct": 10})));

        let second = feed.next().await.unwrap();
        assert_eq!(second.op, StreamOp::Delete);
        assert_eq!(second.id, "a");
        // nothing from run-2 leaked in
        assert!(feed.try_next().is_none());
    }

    #[tokio::test]
    async fn item_subscription_filters_by_id() {
        let registry = registry_with("scores");
        let mut feed = registry.subscribe("scores", "g", Some("42")).unwrap();
        registry.set("scores", "g", "41", json!(1)).unwrap();
        registry.set("scores", "g", "42", json!(2)).unwrap();
        let event = feed.next().await.unwrap();
        assert_eq!(event.id, "42");
        assert!(feed.try_next().is_none());
    }

    #[tokio::test]
    async fn slow_subscribers_are_dropped_not_blocked() {
        let registry = registry_with("firehose");
        let feed = registry.subscribe("firehose", "g", None).unwrap();
        // never drained: overflow the buffer and then some
        for i in 0..(SUBSCRIBER_BUFFER + 10) {
            registry.set("firehose", "g", "x", json!(i)).unwrap();
        }
        drop(feed);
        // mutations keep working with the subscriber gone
        registry.set("firehose", "g", "x", json!("still fine")).unwrap();
    }

    #[tokio::test]
    async fn set_returns_stored_value_and_get_group_orders_by_id() {
        let registry = registry_with("board");
        let stored = registry.set("board", "g", "b", json!("second")).unwrap();
        assert_eq!(stored, json!("second"));
        registry.set("board", "g", "a", json!("first")).unwrap();
        assert_eq!(
            registry.get_group("board", "g").unwrap(),
            vec![json!("first"), json!("second")]
        );
        assert_eq!(registry.get("board", "g", "a").unwrap(), Some(json!("first")));
        assert_eq!(registry.get("board", "g", "zz").unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_stream_is_an_error() {
        let registry = StreamRegistry::new();
        assert!(matches!(
            registry.set("nope", "g", "1", json!(1)),
            Err(StreamError::Unknown(_))
        ));
    }
}
