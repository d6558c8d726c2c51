//! # strata-cache
//!
//! A hierarchical in-process cache for LLM-agent platforms, used to avoid
//! recomputing expensive derived artifacts (compiled contexts, indexed
//! files, embeddings).
//!
//! ## Features
//!
//! - **Three tiers**: a hot in-memory tier (L1), a warm in-memory tier
//!   (L2), and an optional cold persistent tier (L3), unified behind one
//!   get/set/delete surface
//! - **Automatic migration**: frequently read entries are promoted toward
//!   L1, idle entries are demoted toward L3 by a background sweep
//! - **Score-based eviction**: bounded tiers evict by a combined
//!   recency/frequency/importance score
//! - **Lazy TTL expiration**: expired entries are treated as absent when
//!   next observed, with no proactive sweep
//! - **Write-behind persistence**: cold-tier writes land in a buffer and
//!   reach disk on a periodic flush; nothing on the write path blocks on
//!   file I/O
//! - **Namespaces**: independent listing and clearing per logical partition
//!
//! ## Architecture
//!
//! The orchestrator walks lookups hot to cold: L1, then L2 (promoting
//! entries whose access count crossed the promotion threshold), then L3
//! (resurfacing hits into L2 only). Shutdown flushes everything held in
//! memory down into the persistent tier so a restart loses nothing.
//!
//! ## Example
//!
//! ```no_run
//! use strata_cache::{CacheConfig, SetOptions, TieredCache};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = CacheConfig::builder()
//!         .promotion_threshold(3)
//!         .persistent_at("/var/cache/agent")
//!         .build();
//!
//!     let cache = TieredCache::start(config).await?;
//!
//!     cache
//!         .set(
//!             "prompt-9f3",
//!             "compiled context blob",
//!             SetOptions::default().namespace("contexts").importance(0.8),
//!         )
//!         .await?;
//!
//!     if let Some(blob) = cache.get::<String>("prompt-9f3", "contexts").await {
//!         println!("cache hit: {} bytes", blob.len());
//!     }
//!
//!     cache.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod entry;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod orchestrator;
pub mod persistent;
pub mod registry;

// Re-export main types for convenience
pub use config::{CacheConfig, CacheConfigBuilder, PersistentConfig, TierConfig};
pub use entry::{
    make_key, CacheEntry, JsonSizeEstimator, SizeEstimator, DEFAULT_NAMESPACE,
    FALLBACK_SIZE_BYTES,
};
pub use error::{default_error_handler, CacheError, ErrorHandler, Result};
pub use memory::MemoryTier;
pub use metrics::{CacheMetrics, TierMetrics};
pub use orchestrator::{SetOptions, TierLevel, TieredCache};
pub use persistent::PersistentTier;
pub use registry::CacheRegistry;
