//! Cache entry model and key space shared by every tier

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Namespace used when the caller does not provide one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Size charged to an entry when serialization-based estimation fails
pub const FALLBACK_SIZE_BYTES: usize = 1024;

/// Join namespace and key into the qualified lookup key used identically
/// across all tiers. Namespace scoping always compares the entry's
/// namespace field; the prefix exists only to keep qualified keys unique
/// across namespaces.
pub fn make_key(key: &str, namespace: &str) -> String {
    format!("{}:{}", namespace, key)
}

/// A cached record. The same shape lives in the hot, warm, and cold tiers;
/// a qualified key resides in at most one tier at a time outside of an
/// in-flight promotion or demotion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Qualified key (`namespace:key`)
    pub key: String,

    /// Logical partition of the key space
    pub namespace: String,

    /// Opaque payload
    pub value: Value,

    /// When the entry was created; TTL is anchored here and is not
    /// refreshed by promotion or demotion
    pub created_at: DateTime<Utc>,

    /// Last access time, refreshed on every hit
    pub last_accessed_at: DateTime<Utc>,

    /// Number of hits this entry has served
    pub access_count: u64,

    /// Estimated payload footprint in bytes
    pub size_bytes: usize,

    /// Optional time-to-live; expired entries are treated as absent the
    /// moment they are next observed (lazy expiration, no sweep)
    pub ttl: Option<Duration>,

    /// Caller-declared importance in [0, 1]
    pub importance: f64,

    /// Opaque caller metadata
    pub metadata: HashMap<String, String>,
}

impl CacheEntry {
    /// Create a new entry. `key` must already be namespace-qualified
    /// (see [`make_key`]). Importance is clamped into [0, 1].
    pub fn new(
        key: String,
        namespace: String,
        value: Value,
        ttl: Option<Duration>,
        importance: f64,
        metadata: HashMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            key,
            namespace,
            value,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            size_bytes: 0,
            ttl,
            importance: importance.clamp(0.0, 1.0),
            metadata,
        }
    }

    /// Check whether the TTL has elapsed. Entries without a TTL never expire.
    pub fn is_expired(&self) -> bool {
        match self.ttl {
            Some(ttl) => match chrono::Duration::from_std(ttl) {
                Ok(ttl) => self
                    .created_at
                    .checked_add_signed(ttl)
                    .map_or(false, |expires_at| Utc::now() > expires_at),
                // TTL too large for chrono arithmetic: effectively unbounded
                Err(_) => false,
            },
            None => false,
        }
    }

    /// Mark the entry as accessed (updates access time and count)
    pub fn mark_accessed(&mut self) {
        self.last_accessed_at = Utc::now();
        self.access_count += 1;
    }

    /// Age since creation
    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Time since the last access
    pub fn idle_time(&self) -> Duration {
        (Utc::now() - self.last_accessed_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Combined recency/frequency/importance score. Ascending order = evict
    /// first; the weakest entries score lowest.
    ///
    /// `score = 0.4·recency + 0.3·frequency + 0.3·importance` with
    /// `recency = 1/(1 + idle_minutes)` and `frequency = ln(1 + access_count)`.
    pub fn eviction_score(&self, now: DateTime<Utc>) -> f64 {
        let idle_minutes = (now - self.last_accessed_at).num_milliseconds().max(0) as f64 / 60_000.0;
        let recency = 1.0 / (1.0 + idle_minutes);
        let frequency = (1.0 + self.access_count as f64).ln();
        0.4 * recency + 0.3 * frequency + 0.3 * self.importance
    }

    /// Ranking used by cache warming: important and recently created
    /// entries are loaded back into memory first.
    pub fn warming_score(&self, now: DateTime<Utc>) -> f64 {
        let age_minutes = (now - self.created_at).num_milliseconds().max(0) as f64 / 60_000.0;
        self.importance + 1.0 / (1.0 + age_minutes)
    }
}

/// Best-effort byte accounting for opaque payloads.
///
/// The default implementation serializes the value and measures it; callers
/// with cheaper knowledge of their payloads can inject their own estimator.
pub trait SizeEstimator: Send + Sync {
    fn estimate(&self, value: &Value) -> usize;
}

/// Default estimator: serialize to JSON and measure the byte length,
/// falling back to a fixed size so memory accounting degrades gracefully
/// rather than failing the write.
#[derive(Debug, Clone)]
pub struct JsonSizeEstimator {
    pub fallback_bytes: usize,
}

impl Default for JsonSizeEstimator {
    fn default() -> Self {
        Self {
            fallback_bytes: FALLBACK_SIZE_BYTES,
        }
    }
}

impl SizeEstimator for JsonSizeEstimator {
    fn estimate(&self, value: &Value) -> usize {
        serde_json::to_vec(value)
            .map(|bytes| bytes.len())
            .unwrap_or(self.fallback_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread::sleep;

    fn entry(key: &str, ttl: Option<Duration>, importance: f64) -> CacheEntry {
        CacheEntry::new(
            make_key(key, DEFAULT_NAMESPACE),
            DEFAULT_NAMESPACE.to_string(),
            json!("value"),
            ttl,
            importance,
            HashMap::new(),
        )
    }

    #[test]
    fn test_make_key() {
        assert_eq!(make_key("prompt-1", "contexts"), "contexts:prompt-1");
        assert_eq!(make_key("a:b", "ns"), "ns:a:b");
    }

    #[test]
    fn test_entry_creation() {
        let e = entry("k", None, 0.7);
        assert_eq!(e.key, "default:k");
        assert_eq!(e.access_count, 0);
        assert!(!e.is_expired());
        assert_eq!(e.importance, 0.7);
    }

    #[test]
    fn test_importance_clamped() {
        assert_eq!(entry("k", None, 1.7).importance, 1.0);
        assert_eq!(entry("k", None, -0.5).importance, 0.0);
    }

    #[test]
    fn test_ttl_expiration() {
        let e = entry("k", Some(Duration::from_millis(20)), 0.5);
        assert!(!e.is_expired());
        sleep(Duration::from_millis(40));
        assert!(e.is_expired());
    }

    #[test]
    fn test_no_ttl_never_expires() {
        let mut e = entry("k", None, 0.5);
        e.created_at = Utc::now() - chrono::Duration::days(365);
        assert!(!e.is_expired());
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let e = entry("k", Some(Duration::from_secs(u64::MAX)), 0.5);
        assert!(!e.is_expired());
    }

    #[test]
    fn test_mark_accessed() {
        let mut e = entry("k", None, 0.5);
        let before = e.last_accessed_at;
        sleep(Duration::from_millis(5));
        e.mark_accessed();
        assert_eq!(e.access_count, 1);
        assert!(e.last_accessed_at > before);
    }

    #[test]
    fn test_eviction_score_prefers_hot_entries() {
        let now = Utc::now();

        let mut idle = entry("idle", None, 0.5);
        idle.last_accessed_at = now - chrono::Duration::minutes(30);

        let mut hot = entry("hot", None, 0.5);
        hot.access_count = 10;
        hot.last_accessed_at = now;

        assert!(idle.eviction_score(now) < hot.eviction_score(now));
    }

    #[test]
    fn test_eviction_score_importance_breaks_ties() {
        let now = Utc::now();
        let low = entry("low", None, 0.0);
        let high = entry("high", None, 1.0);
        assert!(low.eviction_score(now) < high.eviction_score(now));
    }

    #[test]
    fn test_warming_score_prefers_fresh_important_entries() {
        let now = Utc::now();

        let fresh = entry("fresh", None, 0.9);
        let mut old = entry("old", None, 0.1);
        old.created_at = now - chrono::Duration::hours(6);

        assert!(fresh.warming_score(now) > old.warming_score(now));
    }

    #[test]
    fn test_size_estimator() {
        let estimator = JsonSizeEstimator::default();
        let size = estimator.estimate(&json!({"tokens": [1, 2, 3], "text": "hello"}));
        assert!(size > 0);

        let small = estimator.estimate(&json!("x"));
        assert!(small < size);
    }
}
