//! In-memory tier with score-based eviction and lazy TTL expiry
//!
//! One `MemoryTier` instance serves as the hot (L1) level and another as
//! the warm (L2) level. The tier is bounded by entry count and by
//! estimated bytes; when a write does not fit, the lowest-scoring live
//! entries are evicted in batches until room exists. A write that still
//! cannot fit returns `false` and the orchestrator decides whether to
//! spill it to a colder tier.

use crate::config::TierConfig;
use crate::entry::CacheEntry;
use crate::metrics::TierMetrics;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Bounded in-memory store with recency+frequency+importance eviction
pub struct MemoryTier {
    /// Tier label used in logs ("l1" / "l2")
    name: &'static str,

    config: TierConfig,

    store: Arc<RwLock<MemoryStore>>,
}

/// Internal storage, guarded by one lock per tier
struct MemoryStore {
    /// Main storage: qualified key -> entry
    entries: HashMap<String, CacheEntry>,

    /// Access order, least recently used at the front
    lru_queue: VecDeque<String>,

    /// Running total of estimated entry sizes
    current_size_bytes: usize,

    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl MemoryTier {
    /// Create a tier with the given label and configuration
    pub fn new(name: &'static str, config: TierConfig) -> Self {
        Self {
            name,
            config,
            store: Arc::new(RwLock::new(MemoryStore {
                entries: HashMap::new(),
                lru_queue: VecDeque::new(),
                current_size_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            })),
        }
    }

    /// Look up a qualified key. A hit refreshes the access stats and moves
    /// the key to the most-recently-used position; an entry past its TTL is
    /// dropped and reported as a miss.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut store = self.store.write().await;

        match store.entries.get(key).map(|e| e.is_expired()) {
            None => {
                store.misses += 1;
                None
            }
            Some(true) => {
                debug!("{}: entry expired: {}", self.name, key);
                store.misses += 1;
                store.expirations += 1;
                Self::remove_locked(&mut store, key);
                None
            }
            Some(false) => {
                let entry = store.entries.get_mut(key).map(|e| {
                    e.mark_accessed();
                    e.clone()
                });
                store.hits += 1;
                store.lru_queue.retain(|k| k != key);
                store.lru_queue.push_back(key.to_string());
                entry
            }
        }
    }

    /// Insert or replace an entry. Returns `false` when the tier cannot
    /// make room even after eviction; the entry is not stored in that case.
    pub async fn set(&self, entry: CacheEntry) -> bool {
        // An entry bigger than the whole tier can never fit; evicting for
        // it would only empty the tier for nothing.
        if entry.size_bytes > self.config.max_memory_bytes {
            warn!(
                "{}: entry {} ({} bytes) exceeds tier budget, rejecting",
                self.name, entry.key, entry.size_bytes
            );
            return false;
        }

        let mut store = self.store.write().await;
        let key = entry.key.clone();

        // Replacing counts as remove + insert so capacity checks stay uniform
        if store.entries.contains_key(&key) {
            Self::remove_locked(&mut store, &key);
        }

        while store.entries.len() + 1 > self.config.max_entries
            || store.current_size_bytes + entry.size_bytes > self.config.max_memory_bytes
        {
            if store.entries.is_empty() {
                break;
            }
            let victims = Self::lowest_scoring(&store, self.config.eviction_batch_size);
            for victim in victims {
                debug!("{}: evicting {}", self.name, victim);
                Self::remove_locked(&mut store, &victim);
                store.evictions += 1;
            }
        }

        if store.entries.len() + 1 > self.config.max_entries
            || store.current_size_bytes + entry.size_bytes > self.config.max_memory_bytes
        {
            return false;
        }

        store.current_size_bytes += entry.size_bytes;
        store.lru_queue.push_back(key.clone());
        store.entries.insert(key, entry);
        true
    }

    /// Remove a qualified key. Returns whether it was present.
    pub async fn delete(&self, key: &str) -> bool {
        let mut store = self.store.write().await;
        Self::remove_locked(&mut store, key)
    }

    /// Presence check without touching access stats. Expired entries
    /// report absent.
    pub async fn has(&self, key: &str) -> bool {
        let store = self.store.read().await;
        store.entries.get(key).map_or(false, |e| !e.is_expired())
    }

    /// All live entries
    pub async fn get_all(&self) -> Vec<CacheEntry> {
        let store = self.store.read().await;
        store
            .entries
            .values()
            .filter(|e| !e.is_expired())
            .cloned()
            .collect()
    }

    /// Live entries under one namespace
    pub async fn get_by_namespace(&self, namespace: &str) -> Vec<CacheEntry> {
        let store = self.store.read().await;
        store
            .entries
            .values()
            .filter(|e| e.namespace == namespace && !e.is_expired())
            .cloned()
            .collect()
    }

    /// Remove every entry under one namespace, returning the count removed
    pub async fn clear_namespace(&self, namespace: &str) -> usize {
        let mut store = self.store.write().await;
        let keys: Vec<String> = store
            .entries
            .values()
            .filter(|e| e.namespace == namespace)
            .map(|e| e.key.clone())
            .collect();

        for key in &keys {
            Self::remove_locked(&mut store, key);
        }
        keys.len()
    }

    /// Entries ranked weakest-first by eviction score
    pub async fn eviction_candidates(&self, limit: usize) -> Vec<CacheEntry> {
        let store = self.store.read().await;
        let now = Utc::now();
        let mut candidates: Vec<CacheEntry> = store
            .entries
            .values()
            .filter(|e| !e.is_expired())
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            a.eviction_score(now)
                .partial_cmp(&b.eviction_score(now))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(limit);
        candidates
    }

    /// Entries hot enough to move up a tier, busiest first
    pub async fn promotion_candidates(&self, threshold: u64) -> Vec<CacheEntry> {
        let store = self.store.read().await;
        let mut candidates: Vec<CacheEntry> = store
            .entries
            .values()
            .filter(|e| e.access_count >= threshold && !e.is_expired())
            .cloned()
            .collect();
        candidates.sort_by(|a, b| b.access_count.cmp(&a.access_count));
        candidates
    }

    /// Entries idle past `idle_threshold`, weakest first so the entries
    /// least worth keeping move down soonest
    pub async fn demotion_candidates(
        &self,
        idle_threshold: std::time::Duration,
        limit: usize,
    ) -> Vec<CacheEntry> {
        let store = self.store.read().await;
        let now = Utc::now();
        let mut candidates: Vec<CacheEntry> = store
            .entries
            .values()
            .filter(|e| !e.is_expired() && e.idle_time() > idle_threshold)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            a.eviction_score(now)
                .partial_cmp(&b.eviction_score(now))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(limit);
        candidates
    }

    /// Snapshot of the tier's counters and gauges
    pub async fn metrics(&self) -> TierMetrics {
        let store = self.store.read().await;
        let entries = store.entries.len();

        let avg_access_count = if entries > 0 {
            store.entries.values().map(|e| e.access_count).sum::<u64>() as f64 / entries as f64
        } else {
            0.0
        };

        let oldest_entry_age_secs = store
            .entries
            .values()
            .map(|e| e.age().as_secs_f64())
            .fold(0.0, f64::max);

        TierMetrics {
            entries,
            memory_bytes: store.current_size_bytes,
            hits: store.hits,
            misses: store.misses,
            evictions: store.evictions,
            expirations: store.expirations,
            avg_access_count,
            oldest_entry_age_secs,
        }
    }

    /// Number of resident entries (expired ones included until observed)
    pub async fn len(&self) -> usize {
        self.store.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.store.read().await.entries.is_empty()
    }

    fn remove_locked(store: &mut MemoryStore, key: &str) -> bool {
        if let Some(entry) = store.entries.remove(key) {
            store.lru_queue.retain(|k| k != key);
            store.current_size_bytes = store.current_size_bytes.saturating_sub(entry.size_bytes);
            true
        } else {
            false
        }
    }

    fn lowest_scoring(store: &MemoryStore, batch: usize) -> Vec<String> {
        let now = Utc::now();
        let mut scored: Vec<(String, f64)> = store
            .entries
            .values()
            .map(|e| (e.key.clone(), e.eviction_score(now)))
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(batch).map(|(k, _)| k).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::make_key;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    fn tier(max_entries: usize, max_memory_bytes: usize) -> MemoryTier {
        MemoryTier::new(
            "test",
            TierConfig {
                max_entries,
                max_memory_bytes,
                default_ttl: None,
                ttl_jitter: 0.0,
                eviction_batch_size: 1,
            },
        )
    }

    fn entry(key: &str, importance: f64, size: usize) -> CacheEntry {
        let mut e = CacheEntry::new(
            make_key(key, "ns"),
            "ns".to_string(),
            json!(key),
            None,
            importance,
            HashMap::new(),
        );
        e.size_bytes = size;
        e
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let tier = tier(10, 1024 * 1024);
        assert!(tier.set(entry("a", 0.5, 10)).await);

        let got = tier.get("ns:a").await.unwrap();
        assert_eq!(got.value, json!("a"));
        assert_eq!(got.access_count, 1);

        assert!(tier.get("ns:missing").await.is_none());

        let metrics = tier.metrics().await;
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
    }

    #[tokio::test]
    async fn test_lazy_ttl_expiry() {
        let tier = tier(10, 1024 * 1024);
        let mut e = entry("a", 0.5, 10);
        e.ttl = Some(Duration::from_millis(20));
        assert!(tier.set(e).await);

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(!tier.has("ns:a").await);
        assert!(tier.get("ns:a").await.is_none());
        assert_eq!(tier.len().await, 0);

        let metrics = tier.metrics().await;
        assert_eq!(metrics.expirations, 1);
    }

    #[tokio::test]
    async fn test_eviction_removes_lowest_score() {
        let tier = tier(2, 1024 * 1024);
        assert!(tier.set(entry("low", 0.0, 10)).await);
        assert!(tier.set(entry("high", 1.0, 10)).await);

        // Third insert forces one eviction; "low" has the weakest
        // recency+frequency+importance score
        assert!(tier.set(entry("new", 1.0, 10)).await);

        assert_eq!(tier.len().await, 2);
        assert!(!tier.has("ns:low").await);
        assert!(tier.has("ns:high").await);
        assert!(tier.has("ns:new").await);

        assert_eq!(tier.metrics().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_oversized_entry_rejected_without_eviction() {
        let tier = tier(100, 1000);
        assert!(tier.set(entry("resident", 0.5, 100)).await);

        // Can never fit, so nothing should be evicted for it
        assert!(!tier.set(entry("huge", 1.0, 5000)).await);
        assert!(tier.has("ns:resident").await);
        assert_eq!(tier.metrics().await.evictions, 0);
    }

    #[tokio::test]
    async fn test_memory_bound_eviction() {
        let tier = tier(100, 100);
        assert!(tier.set(entry("a", 0.1, 60)).await);
        assert!(tier.set(entry("b", 0.9, 60)).await);

        // "a" must go to make room for "b"
        assert_eq!(tier.len().await, 1);
        assert!(tier.has("ns:b").await);
    }

    #[tokio::test]
    async fn test_replace_updates_accounting() {
        let tier = tier(10, 1000);
        assert!(tier.set(entry("a", 0.5, 400)).await);
        assert!(tier.set(entry("a", 0.5, 100)).await);

        let metrics = tier.metrics().await;
        assert_eq!(metrics.entries, 1);
        assert_eq!(metrics.memory_bytes, 100);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let tier = tier(10, 1000);
        assert!(tier.set(entry("a", 0.5, 10)).await);
        assert!(tier.delete("ns:a").await);
        assert!(!tier.delete("ns:a").await);
    }

    #[tokio::test]
    async fn test_namespace_queries() {
        let tier = tier(10, 1024 * 1024);
        assert!(tier.set(entry("a", 0.5, 10)).await);
        assert!(tier.set(entry("b", 0.5, 10)).await);

        let mut other = CacheEntry::new(
            make_key("c", "other"),
            "other".to_string(),
            json!("c"),
            None,
            0.5,
            HashMap::new(),
        );
        other.size_bytes = 10;
        assert!(tier.set(other).await);

        assert_eq!(tier.get_by_namespace("ns").await.len(), 2);
        assert_eq!(tier.clear_namespace("ns").await, 2);
        assert_eq!(tier.len().await, 1);
        assert!(tier.has("other:c").await);
    }

    #[tokio::test]
    async fn test_promotion_candidates_ranked_by_access_count() {
        let tier = tier(10, 1024 * 1024);
        assert!(tier.set(entry("cold", 0.5, 10)).await);
        assert!(tier.set(entry("warm", 0.5, 10)).await);
        assert!(tier.set(entry("hot", 0.5, 10)).await);

        for _ in 0..2 {
            tier.get("ns:warm").await;
        }
        for _ in 0..5 {
            tier.get("ns:hot").await;
        }

        let candidates = tier.promotion_candidates(2).await;
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].key, "ns:hot");
        assert_eq!(candidates[1].key, "ns:warm");
    }

    #[tokio::test]
    async fn test_demotion_candidates_filter_and_order() {
        let tier = tier(10, 1024 * 1024);
        assert!(tier.set(entry("idle-low", 0.0, 10)).await);
        assert!(tier.set(entry("idle-high", 1.0, 10)).await);
        assert!(tier.set(entry("busy", 0.5, 10)).await);

        tokio::time::sleep(Duration::from_millis(30)).await;
        tier.get("ns:busy").await;

        let candidates = tier
            .demotion_candidates(Duration::from_millis(10), 20)
            .await;
        let keys: Vec<&str> = candidates.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["ns:idle-low", "ns:idle-high"]);

        let capped = tier.demotion_candidates(Duration::from_millis(10), 1).await;
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].key, "ns:idle-low");
    }

    #[tokio::test]
    async fn test_eviction_candidates_weakest_first() {
        let tier = tier(10, 1024 * 1024);
        assert!(tier.set(entry("weak", 0.0, 10)).await);
        assert!(tier.set(entry("strong", 1.0, 10)).await);

        let candidates = tier.eviction_candidates(10).await;
        assert_eq!(candidates[0].key, "ns:weak");
    }
}
