use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::time::sleep;

use super::{StateError, StateStore};

struct Entry {
    value: Value,
    written: Instant,
}

/// Process-local backend. With a TTL configured, stale scopes are dropped on
/// read and swept periodically.
pub struct InMemoryStateStore {
    groups: DashMap<String, BTreeMap<String, Entry>>,
    ttl: Option<Duration>,
}

impl InMemoryStateStore {
    pub fn new(ttl: Option<Duration>) -> Arc<Self> {
        let store = Arc::new(Self { groups: DashMap::new(), ttl });
        if let Some(ttl) = ttl {
            let weak = Arc::downgrade(&store);
            tokio::spawn(async move {
                let interval = ttl.max(Duration::from_millis(100)) / 2;
                loop {
                    sleep(interval).await;
                    match weak.upgrade() {
                        Some(store) => store.sweep(),
                        None => break,
                    }
                }
            });
        }
        store
    }

    fn expired(&self, entry: &Entry) -> bool {
        matches!(self.ttl, Some(ttl) if entry.written.elapsed() > ttl)
    }

    fn sweep(&self) {
        self.groups.retain(|_, entries| {
            entries.retain(|_, e| !self.expired(e));
            !entries.is_empty()
        });
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, trace_id: &str, key: &str) -> Result<Option<Value>, StateError> {
        let Some(mut entries) = self.groups.get_mut(trace_id) else {
            return Ok(None);
        };
        match entries.get(key) {
            Some(e) if self.expired(e) => {
                entries.remove(key);
                Ok(None)
            }
            Some(e) => Ok(Some(e.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, trace_id: &str, key: &str, value: Value) -> Result<(), StateError> {
        self.groups
            .entry(trace_id.to_string())
            .or_default()
            .insert(key.to_string(), Entry { value, written: Instant::now() });
        Ok(())
    }

    async fn delete(&self, trace_id: &str, key: &str) -> Result<(), StateError> {
        if let Some(mut entries) = self.groups.get_mut(trace_id) {
            entries.remove(key);
        }
        Ok(())
    }

    async fn clear(&self, trace_id: &str) -> Result<(), StateError> {
        self.groups.remove(trace_id);
        Ok(())
    }

    async fn get_group(&self, group_id: &str) -> Result<Vec<Value>, StateError> {
        let Some(entries) = self.groups.get(group_id) else {
            return Ok(Vec::new());
        };
        Ok(entries.values().filter(|e| !self.expired(e)).map(|e| e.value.clone()).collect())
    }

    fn name(&self) -> &'static str {
        "InMemoryStateStore"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let store = InMemoryStateStore::new(None);
        store.set("T1", "user", json!({"id": 7})).await.unwrap();
        assert_eq!(store.get("T1", "user").await.unwrap(), Some(json!({"id": 7})));
    }

    #[tokio::test]
    async fn delete_and_clear_are_idempotent() {
        let store = InMemoryStateStore::new(None);
        store.set("T1", "k", json!(1)).await.unwrap();
        store.delete("T1", "k").await.unwrap();
        store.delete("T1", "k").await.unwrap();
        assert_eq!(store.get("T1", "k").await.unwrap(), None);

        store.set("T1", "a", json!(1)).await.unwrap();
        store.clear("T1").await.unwrap();
        store.clear("T1").await.unwrap();
        assert_eq!(store.get("T1", "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn traces_are_isolated() {
        let store = InMemoryStateStore::new(None);
        store.set("T1", "user", json!("alice")).await.unwrap();
        store.set("T2", "user", json!("bob")).await.unwrap();
        assert_eq!(store.get("T1", "user").await.unwrap(), Some(json!("alice")));
        assert_eq!(store.get("T2", "user").await.unwrap(), Some(json!("bob")));
        store.clear("T2").await.unwrap();
        assert_eq!(store.get("T1", "user").await.unwrap(), Some(json!("alice")));
    }

    #[tokio::test]
    async fn get_group_returns_values_in_key_order() {
        let store = InMemoryStateStore::new(None);
        store.set("T1", "b", json!(2)).await.unwrap();
        store.set("T1", "a", json!(1)).await.unwrap();
        store.set("T2", "c", json!(3)).await.unwrap();
        assert_eq!(store.get_group("T1").await.unwrap(), vec![json!(1), json!(2)]);
        assert_eq!(store.get_group("missing").await.unwrap(), Vec::<Value>::new());
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let store = InMemoryStateStore::new(Some(Duration::from_millis(50)));
        store.set("T1", "k", json!(1)).await.unwrap();
        assert_eq!(store.get("T1", "k").await.unwrap(), Some(json!(1)));
        sleep(Duration::from_millis(120)).await;
        assert_eq!(store.get("T1", "k").await.unwrap(), None);
    }
}
