use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde_json::Value;

use super::{StateError, StateStore};
use crate::config::StateBackendConfig;

/// Remote backend over a Redis-compatible hash store: one hash per trace
/// scope, JSON-encoded values, optional per-scope TTL refreshed on write.
pub struct RedisStateStore {
    conn: MultiplexedConnection,
    prefix: String,
    ttl: Option<u64>,
}

impl RedisStateStore {
    pub async fn connect(cfg: &StateBackendConfig) -> anyhow::Result<Self> {
        let host = cfg.host.clone().unwrap_or_else(|| "127.0.0.1".to_string());
        let port = cfg.port.unwrap_or(6379);
        let auth = cfg.password.as_ref().map(|p| format!(":{p}@")).unwrap_or_default();
        let db = cfg.db.unwrap_or(0);
        let url = format!("redis://{auth}{host}:{port}/{db}");
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn, prefix: "polystep:state".to_string(), ttl: cfg.ttl })
    }

    fn key(&self, trace_id: &str) -> String {
        format!("{}:{}", self.prefix, trace_id)
    }

    fn backend(e: redis::RedisError) -> StateError {
        StateError::Backend(e.to_string())
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn get(&self, trace_id: &str, key: &str) -> Result<Option<Value>, StateError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> =
            conn.hget(self.key(trace_id), key).await.map_err(Self::backend)?;
        Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    async fn set(&self, trace_id: &str, key: &str, value: Value) -> Result<(), StateError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(&value)?;
        let scope = self.key(trace_id);
        let _: () = conn.hset(&scope, key, payload).await.map_err(Self::backend)?;
        if let Some(ttl) = self.ttl {
            let _: () = conn.expire(&scope, ttl as i64).await.map_err(Self::backend)?;
        }
        Ok(())
    }

    async fn delete(&self, trace_id: &str, key: &str) -> Result<(), StateError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(self.key(trace_id), key).await.map_err(Self::backend)?;
        Ok(())
    }

    async fn clear(&self, trace_id: &str) -> Result<(), StateError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.key(trace_id)).await.map_err(Self::backend)?;
        Ok(())
    }

    async fn get_group(&self, group_id: &str) -> Result<Vec<Value>, StateError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.hvals(self.key(group_id)).await.map_err(Self::backend)?;
        raw.iter().map(|s| serde_json::from_str(s).map_err(StateError::from)).collect()
    }

    fn name(&self) -> &'static str {
        "RedisStateStore"
    }
}
