//! Result caching.
//!
//! Cached payloads are stored as serialized JSON under namespaced string keys,
//! `<ModelName>` or `<ModelName>:<customKey>`. Item-level writes suffix the
//! primary key so cached records coexist with cached listings, and every
//! mutation drops the whole namespace by prefix.

use crate::error::{QuerierError, QuerierResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Storage seam for cached query results.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> QuerierResult<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> QuerierResult<()>;
    /// Remove every key under the given prefix.
    async fn del_prefix(&self, prefix: &str) -> QuerierResult<()>;
}

/// Caching options attached to a query chain.
#[derive(Clone)]
pub struct CacheOptions {
    /// Custom key segment appended to the model-name namespace.
    pub key: Option<String>,
    pub lifetime: Duration,
    /// Backend override; falls back to the engine-wide default.
    pub backend: Option<Arc<dyn CacheBackend>>,
}

impl CacheOptions {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            key: None,
            lifetime,
            backend: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.backend = Some(backend);
        self
    }
}

impl std::fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheOptions")
            .field("key", &self.key)
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

/// One bound cache namespace: backend plus resolved key and lifetime.
pub(crate) struct CacheHandle {
    backend: Arc<dyn CacheBackend>,
    key: String,
    lifetime: Duration,
}

impl CacheHandle {
    pub(crate) fn new(
        model_name: &str,
        options: &CacheOptions,
        default_backend: Option<&Arc<dyn CacheBackend>>,
    ) -> QuerierResult<Self> {
        let backend = options
            .backend
            .as_ref()
            .or(default_backend)
            .cloned()
            .ok_or_else(|| QuerierError::Cache("no cache backend configured".to_string()))?;
        let key = match &options.key {
            Some(custom) => format!("{model_name}:{custom}"),
            None => model_name.to_string(),
        };
        Ok(Self {
            backend,
            key,
            lifetime: options.lifetime,
        })
    }

    /// Fetch the cached listing. Backend errors and unparseable payloads are
    /// logged and degrade to a miss.
    pub(crate) async fn get_listing(&self) -> Option<Value> {
        let raw = match self.backend.get(&self.key).await {
            Ok(raw) => raw?,
            Err(err) => {
                tracing::warn!(key = %self.key, error = %err, "cache read failed");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => {
                tracing::debug!(key = %self.key, "cache hit");
                Some(value)
            }
            Err(err) => {
                tracing::warn!(key = %self.key, error = %err, "cached payload unparseable");
                None
            }
        }
    }

    /// Store a listing result under the namespace key, stamped with the write
    /// time in epoch milliseconds.
    pub(crate) async fn put_listing(&self, result: &Value) -> QuerierResult<()> {
        let payload = serde_json::to_string(&stamped(result))?;
        self.backend.set(&self.key, payload, self.lifetime).await?;
        tracing::debug!(key = %self.key, "cache store");
        Ok(())
    }

    /// Store one record under an id-suffixed key.
    pub(crate) async fn put_item(&self, record: &Value, id: &Value) -> QuerierResult<()> {
        let key = format!("{}:{}", self.key, raw_id(id));
        let payload = serde_json::to_string(&stamped(record))?;
        self.backend.set(&key, payload, self.lifetime).await?;
        tracing::debug!(key = %key, "cache store");
        Ok(())
    }

    /// Drop every cached variant in this namespace.
    pub(crate) async fn invalidate(&self) -> QuerierResult<()> {
        self.backend.del_prefix(&self.key).await?;
        tracing::debug!(key = %self.key, "cache invalidated");
        Ok(())
    }
}

fn raw_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn stamped(value: &Value) -> Value {
    let mut value = value.clone();
    if let Value::Object(map) = &mut value {
        map.insert(
            "cachedAt".to_string(),
            Value::from(chrono::Utc::now().timestamp_millis()),
        );
    }
    value
}

struct MemoryEntry {
    payload: String,
    expires_at: Instant,
}

/// In-process [`CacheBackend`] with per-entry TTLs. Expired entries are
/// dropped lazily on read.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> QuerierResult<std::sync::MutexGuard<'_, HashMap<String, MemoryEntry>>> {
        self.entries
            .lock()
            .map_err(|_| QuerierError::Cache("cache mutex poisoned".to_string()))
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> QuerierResult<Option<String>> {
        let mut entries = self.lock()?;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.payload.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> QuerierResult<()> {
        self.lock()?.insert(
            key.to_string(),
            MemoryEntry {
                payload: value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn del_prefix(&self, prefix: &str) -> QuerierResult<()> {
        self.lock()?.retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let cache = MemoryCache::new();
        cache
            .set("User", "{}".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("User").await.unwrap(), Some("{}".to_string()));
        assert_eq!(cache.get("Group").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = MemoryCache::new();
        cache
            .set("User", "{}".to_string(), Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("User").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_del_prefix_clears_namespace() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(60);
        cache.set("User", "a".to_string(), ttl).await.unwrap();
        cache.set("User:1", "b".to_string(), ttl).await.unwrap();
        cache.set("Group", "c".to_string(), ttl).await.unwrap();
        cache.del_prefix("User").await.unwrap();
        assert_eq!(cache.get("User").await.unwrap(), None);
        assert_eq!(cache.get("User:1").await.unwrap(), None);
        assert_eq!(cache.get("Group").await.unwrap(), Some("c".to_string()));
    }

    #[tokio::test]
    async fn test_handle_stamps_and_reads_back() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryCache::new());
        let options = CacheOptions::new(Duration::from_secs(60)).with_key("list");
        let handle = CacheHandle::new("User", &options, Some(&backend)).unwrap();
        handle
            .put_listing(&json!({"items": [1, 2]}))
            .await
            .unwrap();
        let cached = handle.get_listing().await.unwrap();
        assert_eq!(cached["items"], json!([1, 2]));
        assert!(cached["cachedAt"].is_i64());
        handle.invalidate().await.unwrap();
        assert!(handle.get_listing().await.is_none());
    }

    #[tokio::test]
    async fn test_unparseable_payload_is_a_miss() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryCache::new());
        backend
            .set("User", "not json".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        let options = CacheOptions::new(Duration::from_secs(60));
        let handle = CacheHandle::new("User", &options, Some(&backend)).unwrap();
        assert!(handle.get_listing().await.is_none());
    }

    #[test]
    fn test_handle_requires_a_backend() {
        let options = CacheOptions::new(Duration::from_secs(60));
        assert!(CacheHandle::new("User", &options, None).is_err());
    }
}
