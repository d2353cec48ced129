//! Flow-scoped key/value state. Keys live under a `(trace_id, key)`
//! namespace; two concurrent flows never observe each other's entries.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{StateAdapter, StateBackendConfig};

mod file;
mod memory;
mod remote;

pub use file::FileStateStore;
pub use memory::InMemoryStateStore;
pub use remote::RedisStateStore;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state backend error: {0}")]
    Backend(String),
    #[error("state serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Contract: `get` returns `None` for absent keys, `set` is last-write-wins,
/// `delete` and `clear` are idempotent. No cross-key transactions; parallel
/// handlers racing on one key coordinate via distinct keys or not at all.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, trace_id: &str, key: &str) -> Result<Option<Value>, StateError>;
    async fn set(&self, trace_id: &str, key: &str, value: Value) -> Result<(), StateError>;
    async fn delete(&self, trace_id: &str, key: &str) -> Result<(), StateError>;
    async fn clear(&self, trace_id: &str) -> Result<(), StateError>;
    /// All values stored under one scope, ordered by key.
    async fn get_group(&self, group_id: &str) -> Result<Vec<Value>, StateError>;

    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStore").field("impl", &self.name()).finish()
    }
}

/// Build the configured backend.
pub async fn from_config(cfg: &StateBackendConfig) -> anyhow::Result<Arc<dyn StateStore>> {
    Ok(match cfg.adapter {
        StateAdapter::Memory => InMemoryStateStore::new(cfg.ttl_duration()),
        StateAdapter::File => {
            let path = cfg
                .path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("file state adapter requires `path`"))?;
            Arc::new(FileStateStore::open(path).await?)
        }
        StateAdapter::Remote => Arc::new(RedisStateStore::connect(cfg).await?),
    })
}
