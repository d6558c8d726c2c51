//! Tier orchestrator: one get/set/delete surface over L1, L2, and L3
//!
//! Lookups walk the tiers hot to cold. Warm hits whose access count has
//! crossed the promotion threshold move up to L1; cold hits resurface in
//! L2 only, never straight to L1. A background sweep demotes idle entries
//! down the hierarchy, and shutdown flushes everything held in memory into
//! the persistent tier so nothing is lost across a restart.

use crate::config::CacheConfig;
use crate::entry::{make_key, CacheEntry, JsonSizeEstimator, SizeEstimator, DEFAULT_NAMESPACE};
use crate::error::{default_error_handler, CacheError, ErrorHandler, Result};
use crate::memory::MemoryTier;
use crate::metrics::CacheMetrics;
use crate::persistent::PersistentTier;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-cycle cap on L1 -> L2 demotions
const L1_DEMOTION_CAP: usize = 10;

/// Per-cycle cap on L2 -> L3 demotions
const L2_DEMOTION_CAP: usize = 20;

/// One level of the cache hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TierLevel {
    /// Hot in-memory tier (L1)
    Hot,

    /// Warm in-memory tier (L2)
    Warm,

    /// Cold persistent tier (L3)
    Cold,
}

impl fmt::Display for TierLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierLevel::Hot => write!(f, "l1"),
            TierLevel::Warm => write!(f, "l2"),
            TierLevel::Cold => write!(f, "l3"),
        }
    }
}

/// Per-write options for [`TieredCache::set`]
#[derive(Debug, Clone)]
pub struct SetOptions {
    /// Logical partition of the key space
    pub namespace: String,

    /// Overrides the target tier's default TTL
    pub ttl: Option<Duration>,

    /// Importance in [0, 1]; defaults to 0.5
    pub importance: Option<f64>,

    /// Target tier; defaults to the warm tier
    pub tier: Option<TierLevel>,

    /// Opaque caller metadata stored alongside the value
    pub metadata: HashMap<String, String>,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            ttl: None,
            importance: None,
            tier: None,
            metadata: HashMap::new(),
        }
    }
}

impl SetOptions {
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn importance(mut self, importance: f64) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn tier(mut self, tier: TierLevel) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
struct OrchestratorStats {
    lookups: u64,
    logical_hits: u64,
    promotions: u64,
    demotions: u64,
}

struct DemotionTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Hierarchical cache composing a hot tier, a warm tier, and an optional
/// persistent cold tier behind one API
pub struct TieredCache {
    config: CacheConfig,
    l1: MemoryTier,
    l2: MemoryTier,
    l3: Option<Arc<PersistentTier>>,
    estimator: Arc<dyn SizeEstimator>,
    error_handler: ErrorHandler,
    stats: RwLock<OrchestratorStats>,
    demotion_task: Mutex<Option<DemotionTask>>,
    shut_down: AtomicBool,
}

impl TieredCache {
    /// Build a cache with the default size estimator and error handler.
    /// The persistent tier is not initialized and no background sweep runs;
    /// use [`TieredCache::start`] for the fully wired instance.
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::with_hooks(
            config,
            Arc::new(JsonSizeEstimator::default()),
            default_error_handler(),
        )
    }

    /// Build a cache with a caller-supplied size estimator and error handler
    pub fn with_hooks(
        config: CacheConfig,
        estimator: Arc<dyn SizeEstimator>,
        error_handler: ErrorHandler,
    ) -> Result<Self> {
        config.validate()?;

        let l3 = if config.persistent.enabled {
            Some(Arc::new(PersistentTier::new(
                config.persistent.clone(),
                Arc::clone(&error_handler),
            )))
        } else {
            None
        };

        Ok(Self {
            l1: MemoryTier::new("l1", config.l1.clone()),
            l2: MemoryTier::new("l2", config.l2.clone()),
            l3,
            estimator,
            error_handler,
            stats: RwLock::new(OrchestratorStats::default()),
            demotion_task: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            config,
        })
    }

    /// Build, initialize the persistent tier, and start the background
    /// demotion sweep
    pub async fn start(config: CacheConfig) -> Result<Arc<Self>> {
        Self::start_with_hooks(
            config,
            Arc::new(JsonSizeEstimator::default()),
            default_error_handler(),
        )
        .await
    }

    pub async fn start_with_hooks(
        config: CacheConfig,
        estimator: Arc<dyn SizeEstimator>,
        error_handler: ErrorHandler,
    ) -> Result<Arc<Self>> {
        let cache = Arc::new(Self::with_hooks(config, estimator, error_handler)?);
        if let Some(l3) = &cache.l3 {
            l3.initialize().await?;
        }
        cache.spawn_demotion_task().await;
        info!(
            "tiered cache started (persistent tier {})",
            if cache.l3.is_some() { "enabled" } else { "disabled" }
        );
        Ok(cache)
    }

    /// Look up a value. Walks L1, then L2 (promoting hot entries up), then
    /// L3 (resurfacing hits into L2). Returns `None` on miss, expiry, or a
    /// payload that does not decode as `T`; lookups never fail loudly.
    pub async fn get<T: DeserializeOwned>(&self, key: &str, namespace: &str) -> Option<T> {
        if self.shut_down.load(Ordering::SeqCst) {
            return None;
        }

        let qualified = make_key(key, namespace);
        self.stats.write().await.lookups += 1;

        if let Some(entry) = self.l1.get(&qualified).await {
            self.stats.write().await.logical_hits += 1;
            return self.decode(entry);
        }

        if let Some(entry) = self.l2.get(&qualified).await {
            if entry.access_count >= self.config.promotion_threshold {
                // Set-before-delete: the entry is never in zero tiers
                if self.l1.set(entry.clone()).await {
                    self.l2.delete(&qualified).await;
                    self.stats.write().await.promotions += 1;
                    debug!("promoted {} to l1", qualified);
                }
            }
            self.stats.write().await.logical_hits += 1;
            return self.decode(entry);
        }

        if let Some(l3) = &self.l3 {
            if let Some(entry) = l3.get(&qualified).await {
                // Cold hits resurface in the warm tier only, never straight
                // to L1; the cold copy is dropped once L2 holds the entry
                if self.l2.set(entry.clone()).await {
                    l3.delete(&qualified).await;
                }
                self.stats.write().await.logical_hits += 1;
                return self.decode(entry);
            }
        }

        None
    }

    /// Store a value. The target in-memory tier may reject the write when
    /// eviction cannot make room, in which case it spills to the next
    /// colder tier; writes reaching L3 are always accepted into its
    /// write-behind buffer.
    pub async fn set<T: Serialize>(&self, key: &str, value: T, options: SetOptions) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(CacheError::ShutDown);
        }

        let value =
            serde_json::to_value(value).map_err(|e| CacheError::Serialization(e.to_string()))?;

        let target = options.tier.unwrap_or(TierLevel::Warm);
        let tier_config = match target {
            TierLevel::Hot => &self.config.l1,
            TierLevel::Warm | TierLevel::Cold => &self.config.l2,
        };
        let ttl = options.ttl.or_else(|| tier_config.default_ttl_with_jitter());

        let qualified = make_key(key, &options.namespace);
        let mut entry = CacheEntry::new(
            qualified.clone(),
            options.namespace,
            value,
            ttl,
            options.importance.unwrap_or(0.5),
            options.metadata,
        );
        entry.size_bytes = self.estimator.estimate(&entry.value);

        // A fresh write supersedes any copy elsewhere in the hierarchy
        self.l1.delete(&qualified).await;
        self.l2.delete(&qualified).await;
        if let Some(l3) = &self.l3 {
            l3.delete(&qualified).await;
        }

        match target {
            TierLevel::Hot => {
                if self.l1.set(entry.clone()).await {
                    return Ok(());
                }
                debug!("l1 rejected {}, spilling to l2", qualified);
                if self.l2.set(entry.clone()).await {
                    return Ok(());
                }
                self.spill_to_cold(entry).await
            }
            TierLevel::Warm => {
                if self.l2.set(entry.clone()).await {
                    return Ok(());
                }
                debug!("l2 rejected {}, spilling to l3", qualified);
                self.spill_to_cold(entry).await
            }
            TierLevel::Cold => match &self.l3 {
                Some(l3) => {
                    l3.set(entry).await;
                    Ok(())
                }
                None => {
                    warn!("cold tier disabled, storing {} in l2", qualified);
                    if self.l2.set(entry).await {
                        Ok(())
                    } else {
                        Err(CacheError::CapacityExhausted { tier: "l2" })
                    }
                }
            },
        }
    }

    /// Remove a key from every tier. Returns whether any tier held it.
    pub async fn delete(&self, key: &str, namespace: &str) -> bool {
        let qualified = make_key(key, namespace);
        let from_l1 = self.l1.delete(&qualified).await;
        let from_l2 = self.l2.delete(&qualified).await;
        let from_l3 = match &self.l3 {
            Some(l3) => l3.delete(&qualified).await,
            None => false,
        };
        from_l1 || from_l2 || from_l3
    }

    /// Presence check across all tiers, without touching access stats
    pub async fn has(&self, key: &str, namespace: &str) -> bool {
        let qualified = make_key(key, namespace);
        if self.l1.has(&qualified).await || self.l2.has(&qualified).await {
            return true;
        }
        match &self.l3 {
            Some(l3) => l3.has(&qualified).await,
            None => false,
        }
    }

    /// Entries under one namespace, merged across tiers and de-duplicated
    /// by key (hotter tiers win)
    pub async fn get_by_namespace(&self, namespace: &str) -> Vec<CacheEntry> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for entry in self.l1.get_by_namespace(namespace).await {
            if seen.insert(entry.key.clone()) {
                out.push(entry);
            }
        }
        for entry in self.l2.get_by_namespace(namespace).await {
            if seen.insert(entry.key.clone()) {
                out.push(entry);
            }
        }
        if let Some(l3) = &self.l3 {
            for entry in l3.get_all().await {
                if entry.namespace == namespace && seen.insert(entry.key.clone()) {
                    out.push(entry);
                }
            }
        }
        out
    }

    /// Remove every entry under one namespace across all tiers, returning
    /// the total removed
    pub async fn clear_namespace(&self, namespace: &str) -> usize {
        let mut removed = self.l1.clear_namespace(namespace).await;
        removed += self.l2.clear_namespace(namespace).await;
        if let Some(l3) = &self.l3 {
            removed += l3.clear_namespace(namespace).await;
        }
        info!("cleared {} entries from namespace {}", removed, namespace);
        removed
    }

    /// One demotion sweep: idle L1 entries move to L2, idle L2 entries move
    /// to L3 (or are dropped when the cold tier is disabled). Returns the
    /// number of entries demoted. The background task calls this on every
    /// tick; tests can call it directly instead of sleeping.
    pub async fn run_demotion_cycle(&self) -> usize {
        let mut demoted = 0;

        let l1_idle = self.config.demotion_interval / 2;
        for entry in self.l1.demotion_candidates(l1_idle, L1_DEMOTION_CAP).await {
            let key = entry.key.clone();
            // Set-before-delete so a rejected L2 insert loses nothing
            if self.l2.set(entry).await && self.l1.delete(&key).await {
                debug!("demoted {} to l2", key);
                demoted += 1;
            }
        }

        let l2_idle = self.config.demotion_interval;
        let candidates = self
            .l2
            .demotion_candidates(l2_idle, L2_DEMOTION_CAP)
            .await;
        match &self.l3 {
            Some(l3) => {
                for entry in candidates {
                    let key = entry.key.clone();
                    l3.set(entry).await;
                    if self.l2.delete(&key).await {
                        debug!("demoted {} to l3", key);
                        demoted += 1;
                    }
                }
            }
            None => {
                // No cold tier: idle warm entries simply age out
                for entry in candidates {
                    if self.l2.delete(&entry.key).await {
                        demoted += 1;
                    }
                }
            }
        }

        if demoted > 0 {
            self.stats.write().await.demotions += demoted as u64;
        }
        demoted
    }

    /// Pre-load the warm tier from the persistent tier. Candidates are
    /// ranked by `importance + 1/(1 + age_minutes)` and the top `limit`
    /// are inserted into L2. L3 keeps its copies: it remains the durable
    /// source of truth for warmed entries.
    pub async fn warm_from_persistent(
        &self,
        filter: Option<&(dyn Fn(&CacheEntry) -> bool + Send + Sync)>,
        limit: usize,
    ) -> usize {
        let Some(l3) = &self.l3 else {
            return 0;
        };

        let now = Utc::now();
        let mut candidates: Vec<CacheEntry> = l3
            .get_all()
            .await
            .into_iter()
            .filter(|e| filter.map_or(true, |f| f(e)))
            .collect();
        candidates.sort_by(|a, b| {
            b.warming_score(now)
                .partial_cmp(&a.warming_score(now))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(limit);

        let mut warmed = 0;
        for entry in candidates {
            if self.l1.has(&entry.key).await || self.l2.has(&entry.key).await {
                continue;
            }
            if self.l2.set(entry).await {
                warmed += 1;
            }
        }

        info!("warmed {} entries from persistent tier", warmed);
        warmed
    }

    /// Force a write-behind flush on the persistent tier. No-op when the
    /// cold tier is disabled.
    pub async fn flush(&self) -> usize {
        match &self.l3 {
            Some(l3) => l3.flush().await,
            None => 0,
        }
    }

    /// Snapshot of per-tier and orchestrator-level metrics
    pub async fn metrics(&self) -> CacheMetrics {
        let stats = self.stats.read().await.clone();
        CacheMetrics {
            l1: self.l1.metrics().await,
            l2: self.l2.metrics().await,
            l3: match &self.l3 {
                Some(l3) => Some(l3.metrics().await),
                None => None,
            },
            lookups: stats.lookups,
            logical_hits: stats.logical_hits,
            promotions: stats.promotions,
            demotions: stats.demotions,
        }
    }

    /// Stop background work, push every in-memory entry down into the
    /// persistent tier, and flush it. Idempotent; later `get`s miss and
    /// later `set`s fail with [`CacheError::ShutDown`].
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = self.demotion_task.lock().await.take() {
            let _ = task.stop.send(true);
            if let Err(err) = task.handle.await {
                warn!("demotion task did not stop cleanly: {}", err);
            }
        }

        if let Some(l3) = &self.l3 {
            for entry in self.l1.get_all().await {
                l3.set(entry).await;
            }
            for entry in self.l2.get_all().await {
                l3.set(entry).await;
            }
            l3.shutdown().await;
        }

        info!("tiered cache shut down");
    }

    async fn spill_to_cold(&self, entry: CacheEntry) -> Result<()> {
        match &self.l3 {
            Some(l3) => {
                l3.set(entry).await;
                Ok(())
            }
            // Both in-memory tiers rejected the write and there is no
            // colder tier to take it
            None => Err(CacheError::CapacityExhausted { tier: "l2" }),
        }
    }

    async fn spawn_demotion_task(self: &Arc<Self>) {
        let (stop, mut stop_rx) = watch::channel(false);
        let cache = Arc::downgrade(self);
        let interval = self.config.demotion_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else { break };
                        let demoted = cache.run_demotion_cycle().await;
                        if demoted > 0 {
                            debug!("demotion cycle moved {} entries", demoted);
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        *self.demotion_task.lock().await = Some(DemotionTask { stop, handle });
    }

    fn decode<T: DeserializeOwned>(&self, entry: CacheEntry) -> Option<T> {
        match serde_json::from_value(entry.value) {
            Ok(value) => Some(value),
            Err(err) => {
                (self.error_handler)(&CacheError::Serialization(err.to_string()));
                None
            }
        }
    }
}
