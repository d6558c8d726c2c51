//! Registry of cache instances with an explicit lifecycle
//!
//! Hosts that run many agent sessions keep one cache per session. The
//! registry is a plain object owned and passed by the caller, not a
//! process-wide global; `create`/`get`/`destroy` methods provide
//! per-session isolation.

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::orchestrator::TieredCache;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// Factory and lookup table for [`TieredCache`] instances
#[derive(Default)]
pub struct CacheRegistry {
    caches: RwLock<HashMap<String, Arc<TieredCache>>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache under a generated id
    pub async fn create(&self, config: CacheConfig) -> Result<(String, Arc<TieredCache>)> {
        let id = Uuid::new_v4().to_string();
        let cache = self.create_with_id(&id, config).await?;
        Ok((id, cache))
    }

    /// Create a cache under a caller-chosen id (typically a session id).
    /// Fails if the id is already taken.
    pub async fn create_with_id(&self, id: &str, config: CacheConfig) -> Result<Arc<TieredCache>> {
        {
            let caches = self.caches.read().await;
            if caches.contains_key(id) {
                return Err(CacheError::Config(format!(
                    "cache id already registered: {}",
                    id
                )));
            }
        }

        let cache = TieredCache::start(config).await?;
        let mut caches = self.caches.write().await;
        if caches.contains_key(id) {
            // Lost a race for the same id; shut the new instance down
            cache.shutdown().await;
            return Err(CacheError::Config(format!(
                "cache id already registered: {}",
                id
            )));
        }
        caches.insert(id.to_string(), Arc::clone(&cache));
        info!("registered cache {}", id);
        Ok(cache)
    }

    /// Look up a cache by id
    pub async fn get(&self, id: &str) -> Option<Arc<TieredCache>> {
        self.caches.read().await.get(id).cloned()
    }

    /// Shut down and deregister a cache. Returns whether the id existed.
    pub async fn destroy(&self, id: &str) -> bool {
        let cache = self.caches.write().await.remove(id);
        match cache {
            Some(cache) => {
                cache.shutdown().await;
                info!("destroyed cache {}", id);
                true
            }
            None => false,
        }
    }

    /// Shut down and deregister every cache, returning how many there were
    pub async fn destroy_all(&self) -> usize {
        let drained: Vec<(String, Arc<TieredCache>)> =
            self.caches.write().await.drain().collect();
        let count = drained.len();
        for (id, cache) in drained {
            cache.shutdown().await;
            info!("destroyed cache {}", id);
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.caches.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.caches.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_get_destroy() {
        let registry = CacheRegistry::new();
        let (id, _cache) = registry.create(CacheConfig::default()).await.unwrap();

        assert!(registry.get(&id).await.is_some());
        assert_eq!(registry.len().await, 1);

        assert!(registry.destroy(&id).await);
        assert!(registry.get(&id).await.is_none());
        assert!(!registry.destroy(&id).await);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let registry = CacheRegistry::new();
        registry
            .create_with_id("session-1", CacheConfig::default())
            .await
            .unwrap();

        let duplicate = registry
            .create_with_id("session-1", CacheConfig::default())
            .await;
        assert!(matches!(duplicate, Err(CacheError::Config(_))));
        assert_eq!(registry.len().await, 1);
        registry.destroy_all().await;
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        use crate::orchestrator::SetOptions;

        let registry = CacheRegistry::new();
        let a = registry
            .create_with_id("a", CacheConfig::default())
            .await
            .unwrap();
        let b = registry
            .create_with_id("b", CacheConfig::default())
            .await
            .unwrap();

        a.set("k", "from-a", SetOptions::default()).await.unwrap();

        let from_a: Option<String> = a.get("k", "default").await;
        let from_b: Option<String> = b.get("k", "default").await;
        assert_eq!(from_a.as_deref(), Some("from-a"));
        assert!(from_b.is_none());

        assert_eq!(registry.destroy_all().await, 2);
        assert!(registry.is_empty().await);
    }
}
