use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{StateError, StateStore};

/// Single-process persistent backend: the whole namespace is one JSON
/// document, flushed atomically via write-temp-then-rename on every
/// mutation. Suited to dev projects that must survive a restart.
pub struct FileStateStore {
    path: PathBuf,
    doc: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl FileStateStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let doc = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(StateError::Backend(e.to_string())),
        };
        Ok(Self { path, doc: RwLock::new(doc) })
    }

    async fn flush(&self, doc: &HashMap<String, BTreeMap<String, Value>>) -> Result<(), StateError> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        let tmp = match self.path.file_name() {
            Some(name) => {
                let mut tmp_name = name.to_os_string();
                tmp_name.push(".tmp");
                self.path.with_file_name(tmp_name)
            }
            None => return Err(StateError::Backend(format!("invalid state path {:?}", self.path))),
        };
        tokio::fs::write(&tmp, bytes).await.map_err(|e| StateError::Backend(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| StateError::Backend(e.to_string()))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, trace_id: &str, key: &str) -> Result<Option<Value>, StateError> {
        let doc = self.doc.read().await;
        Ok(doc.get(trace_id).and_then(|g| g.get(key)).cloned())
    }

    async fn set(&self, trace_id: &str, key: &str, value: Value) -> Result<(), StateError> {
        let mut doc = self.doc.write().await;
        doc.entry(trace_id.to_string()).or_default().insert(key.to_string(), value);
        self.flush(&doc).await
    }

    async fn delete(&self, trace_id: &str, key: &str) -> Result<(), StateError> {
        let mut doc = self.doc.write().await;
        let mut dirty = false;
        if let Some(group) = doc.get_mut(trace_id) {
            dirty = group.remove(key).is_some();
            if group.is_empty() {
                doc.remove(trace_id);
            }
        }
        if dirty {
            self.flush(&doc).await?;
        }
        Ok(())
    }

    async fn clear(&self, trace_id: &str) -> Result<(), StateError> {
        let mut doc = self.doc.write().await;
        if doc.remove(trace_id).is_some() {
            self.flush(&doc).await?;
        }
        Ok(())
    }

    async fn get_group(&self, group_id: &str) -> Result<Vec<Value>, StateError> {
        let doc = self.doc.read().await;
        Ok(doc.get(group_id).map(|g| g.values().cloned().collect()).unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "FileStateStore"
    }
}
