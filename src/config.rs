//! Configuration for the tiered cache

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CacheError, Result};

/// Configuration for one in-memory tier (the hot and warm levels each get
/// their own instance).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Maximum number of entries held by the tier
    pub max_entries: usize,

    /// Maximum total estimated payload size in bytes
    pub max_memory_bytes: usize,

    /// TTL applied to writes that do not specify one; `None` means entries
    /// in this tier do not expire by default
    pub default_ttl: Option<Duration>,

    /// TTL jitter factor (0.0 - 1.0) applied to the default TTL.
    /// Spreads out expiry of entries written in a batch.
    pub ttl_jitter: f64,

    /// Number of entries removed per eviction round when the tier is full
    pub eviction_batch_size: usize,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            // 100 MB default
            max_memory_bytes: 100 * 1024 * 1024,
            // 1 hour default TTL
            default_ttl: Some(Duration::from_secs(3600)),
            ttl_jitter: 0.0,
            eviction_batch_size: 10,
        }
    }
}

impl TierConfig {
    /// Default TTL with jitter applied, for writes that did not specify one
    pub fn default_ttl_with_jitter(&self) -> Option<Duration> {
        let ttl = self.default_ttl?;
        if self.ttl_jitter == 0.0 {
            return Some(ttl);
        }

        let base_secs = ttl.as_secs_f64();
        let jitter_range = base_secs * self.ttl_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        Some(Duration::from_secs_f64((base_secs + jitter).max(0.001)))
    }

    fn validate(&self, tier: &str) -> Result<()> {
        if self.max_entries == 0 {
            return Err(CacheError::Config(format!(
                "{}: max_entries must be greater than 0",
                tier
            )));
        }
        if self.max_memory_bytes == 0 {
            return Err(CacheError::Config(format!(
                "{}: max_memory_bytes must be greater than 0",
                tier
            )));
        }
        if self.eviction_batch_size == 0 {
            return Err(CacheError::Config(format!(
                "{}: eviction_batch_size must be greater than 0",
                tier
            )));
        }
        if !(0.0..=1.0).contains(&self.ttl_jitter) {
            return Err(CacheError::Config(format!(
                "{}: ttl_jitter must be between 0.0 and 1.0",
                tier
            )));
        }
        if self.default_ttl == Some(Duration::ZERO) {
            return Err(CacheError::Config(format!(
                "{}: default_ttl must be greater than 0 when set",
                tier
            )));
        }
        Ok(())
    }
}

/// Configuration for the cold persistent tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentConfig {
    /// When false the cache runs as a pure two-level in-memory LRU
    pub enabled: bool,

    /// Directory holding one JSON record per key
    pub storage_location: PathBuf,

    /// Interval between write-behind flush cycles
    pub sync_interval: Duration,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            storage_location: PathBuf::from(".cache/strata"),
            sync_interval: Duration::from_secs(5),
        }
    }
}

impl PersistentConfig {
    fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.storage_location.as_os_str().is_empty() {
            return Err(CacheError::Config(
                "persistent: storage_location must not be empty".to_string(),
            ));
        }
        if self.sync_interval.is_zero() {
            return Err(CacheError::Config(
                "persistent: sync_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration for the tier orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Access-count trigger for promoting a warm entry into the hot tier
    pub promotion_threshold: u64,

    /// Interval of the background demotion sweep. L1 entries idle for more
    /// than half of it and L2 entries idle for more than the full interval
    /// become demotion candidates.
    pub demotion_interval: Duration,

    /// Hot tier (L1)
    pub l1: TierConfig,

    /// Warm tier (L2)
    pub l2: TierConfig,

    /// Cold tier (L3)
    pub persistent: PersistentConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            promotion_threshold: 3,
            demotion_interval: Duration::from_secs(60),
            l1: TierConfig {
                max_entries: 1_000,
                max_memory_bytes: 50 * 1024 * 1024,
                default_ttl: Some(Duration::from_secs(1800)),
                ttl_jitter: 0.0,
                eviction_batch_size: 10,
            },
            l2: TierConfig::default(),
            persistent: PersistentConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Create a new builder for the cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.promotion_threshold == 0 {
            return Err(CacheError::Config(
                "promotion_threshold must be greater than 0".to_string(),
            ));
        }
        if self.demotion_interval.is_zero() {
            return Err(CacheError::Config(
                "demotion_interval must be greater than 0".to_string(),
            ));
        }
        self.l1.validate("l1")?;
        self.l2.validate("l2")?;
        self.persistent.validate()?;
        Ok(())
    }
}

/// Preset configurations for common deployments
impl CacheConfig {
    /// Short TTLs and a small hot tier for rapidly changing artifacts
    /// (agent planning output, per-turn context)
    pub fn realtime() -> Self {
        Self {
            promotion_threshold: 2,
            demotion_interval: Duration::from_secs(30),
            l1: TierConfig {
                max_entries: 500,
                max_memory_bytes: 25 * 1024 * 1024,
                default_ttl: Some(Duration::from_secs(300)),
                ttl_jitter: 0.15,
                eviction_batch_size: 10,
            },
            l2: TierConfig {
                max_entries: 5_000,
                max_memory_bytes: 50 * 1024 * 1024,
                default_ttl: Some(Duration::from_secs(900)),
                ttl_jitter: 0.15,
                eviction_batch_size: 25,
            },
            persistent: PersistentConfig::default(),
        }
    }

    /// Memory-constrained environments
    pub fn small() -> Self {
        Self {
            l1: TierConfig {
                max_entries: 100,
                max_memory_bytes: 5 * 1024 * 1024,
                default_ttl: Some(Duration::from_secs(1800)),
                ttl_jitter: 0.1,
                eviction_batch_size: 5,
            },
            l2: TierConfig {
                max_entries: 1_000,
                max_memory_bytes: 10 * 1024 * 1024,
                default_ttl: Some(Duration::from_secs(3600)),
                ttl_jitter: 0.1,
                eviction_batch_size: 10,
            },
            ..Default::default()
        }
    }

    /// Large deployments caching compiled contexts and embeddings for many
    /// concurrent sessions; the persistent tier is expected to be enabled
    /// on top of this.
    pub fn large() -> Self {
        Self {
            promotion_threshold: 5,
            demotion_interval: Duration::from_secs(300),
            l1: TierConfig {
                max_entries: 10_000,
                max_memory_bytes: 512 * 1024 * 1024,
                default_ttl: Some(Duration::from_secs(3600)),
                ttl_jitter: 0.1,
                eviction_batch_size: 50,
            },
            l2: TierConfig {
                max_entries: 100_000,
                max_memory_bytes: 2 * 1024 * 1024 * 1024,
                default_ttl: Some(Duration::from_secs(12 * 3600)),
                ttl_jitter: 0.1,
                eviction_batch_size: 200,
            },
            persistent: PersistentConfig::default(),
        }
    }
}

/// Builder for the cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    promotion_threshold: Option<u64>,
    demotion_interval: Option<Duration>,
    l1: Option<TierConfig>,
    l2: Option<TierConfig>,
    persistent: Option<PersistentConfig>,
}

impl CacheConfigBuilder {
    /// Set the access-count trigger for L2 -> L1 promotion
    pub fn promotion_threshold(mut self, threshold: u64) -> Self {
        self.promotion_threshold = Some(threshold);
        self
    }

    /// Set the background demotion interval
    pub fn demotion_interval(mut self, interval: Duration) -> Self {
        self.demotion_interval = Some(interval);
        self
    }

    /// Configure the hot tier
    pub fn l1(mut self, config: TierConfig) -> Self {
        self.l1 = Some(config);
        self
    }

    /// Configure the warm tier
    pub fn l2(mut self, config: TierConfig) -> Self {
        self.l2 = Some(config);
        self
    }

    /// Configure the persistent tier
    pub fn persistent(mut self, config: PersistentConfig) -> Self {
        self.persistent = Some(config);
        self
    }

    /// Enable the persistent tier at the given location with default sync
    pub fn persistent_at(mut self, location: impl Into<PathBuf>) -> Self {
        self.persistent = Some(PersistentConfig {
            enabled: true,
            storage_location: location.into(),
            ..Default::default()
        });
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            promotion_threshold: self
                .promotion_threshold
                .unwrap_or(defaults.promotion_threshold),
            demotion_interval: self.demotion_interval.unwrap_or(defaults.demotion_interval),
            l1: self.l1.unwrap_or(defaults.l1),
            l2: self.l2.unwrap_or(defaults.l2),
            persistent: self.persistent.unwrap_or(defaults.persistent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.promotion_threshold, 3);
        assert_eq!(config.l1.max_entries, 1_000);
        assert_eq!(config.l2.max_entries, 10_000);
        assert!(!config.persistent.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::builder()
            .promotion_threshold(5)
            .demotion_interval(Duration::from_secs(120))
            .l1(TierConfig {
                max_entries: 42,
                ..Default::default()
            })
            .persistent_at("/tmp/cache")
            .build();

        assert_eq!(config.promotion_threshold, 5);
        assert_eq!(config.demotion_interval, Duration::from_secs(120));
        assert_eq!(config.l1.max_entries, 42);
        assert!(config.persistent.enabled);
        assert_eq!(config.persistent.storage_location, PathBuf::from("/tmp/cache"));
    }

    #[test]
    fn test_config_validation() {
        let mut config = CacheConfig::default();
        config.promotion_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.l1.max_entries = 0;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.l2.ttl_jitter = 1.5;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.persistent.enabled = true;
        config.persistent.sync_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_disabled_persistent_skips_validation() {
        let mut config = CacheConfig::default();
        config.persistent.enabled = false;
        config.persistent.storage_location = PathBuf::new();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ttl_with_jitter() {
        let config = TierConfig {
            default_ttl: Some(Duration::from_secs(3600)),
            ttl_jitter: 0.1,
            ..Default::default()
        };

        let ttl = config.default_ttl_with_jitter().unwrap();
        assert!(ttl.as_secs_f64() >= 3600.0 * 0.9);
        assert!(ttl.as_secs_f64() <= 3600.0 * 1.1);

        let no_jitter = TierConfig {
            default_ttl: Some(Duration::from_secs(60)),
            ttl_jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(
            no_jitter.default_ttl_with_jitter(),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_preset_configs() {
        assert!(CacheConfig::realtime().validate().is_ok());
        assert!(CacheConfig::small().validate().is_ok());
        assert!(CacheConfig::large().validate().is_ok());

        let small = CacheConfig::small();
        assert!(small.l1.max_entries < CacheConfig::default().l1.max_entries);
    }
}
