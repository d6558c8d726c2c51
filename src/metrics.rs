//! Metrics for individual tiers and the cache as a whole

use serde::{Deserialize, Serialize};
use std::fmt;

/// Counters and gauges for a single tier
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TierMetrics {
    /// Number of entries currently resident
    pub entries: usize,

    /// Estimated bytes held (for the cold tier: write-behind buffer only)
    pub memory_bytes: usize,

    /// Lookups served by this tier
    pub hits: u64,

    /// Lookups this tier could not serve
    pub misses: u64,

    /// Entries removed to free capacity
    pub evictions: u64,

    /// Entries dropped on observation because their TTL had elapsed
    pub expirations: u64,

    /// Mean access count across resident entries
    pub avg_access_count: f64,

    /// Age of the oldest resident entry in seconds (0 when empty)
    pub oldest_entry_age_secs: f64,
}

impl TierMetrics {
    /// Hit rate for lookups that reached this tier, as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Snapshot across all tiers plus orchestrator-level counters.
///
/// Per-tier hit/miss counters count every probe, so one logical lookup that
/// misses L1 and hits L2 contributes a miss and a hit. `lookups` and
/// `logical_hits` count each caller-facing `get` exactly once; use
/// [`CacheMetrics::overall_hit_rate`] for "fraction of requests served by
/// any tier".
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheMetrics {
    /// Hot tier
    pub l1: TierMetrics,

    /// Warm tier
    pub l2: TierMetrics,

    /// Cold tier, when enabled
    pub l3: Option<TierMetrics>,

    /// Caller-facing `get` calls
    pub lookups: u64,

    /// Caller-facing `get` calls served by any tier
    pub logical_hits: u64,

    /// Entries moved to a hotter tier
    pub promotions: u64,

    /// Entries moved to a colder tier (or dropped by the sweep when the
    /// cold tier is disabled)
    pub demotions: u64,
}

impl CacheMetrics {
    /// Fraction of logical requests served by any tier, as a percentage
    pub fn overall_hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            (self.logical_hits as f64 / self.lookups as f64) * 100.0
        }
    }

    /// Total resident entries across all tiers
    pub fn total_entries(&self) -> usize {
        self.l1.entries + self.l2.entries + self.l3.as_ref().map_or(0, |t| t.entries)
    }
}

impl fmt::Display for CacheMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheMetrics {{ lookups: {}, hit_rate: {:.2}%, l1: {}/{:.2}%, l2: {}/{:.2}%, l3: {}, promotions: {}, demotions: {} }}",
            self.lookups,
            self.overall_hit_rate(),
            self.l1.entries,
            self.l1.hit_rate(),
            self.l2.entries,
            self.l2.hit_rate(),
            self.l3
                .as_ref()
                .map_or("disabled".to_string(), |t| t.entries.to_string()),
            self.promotions,
            self.demotions,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_hit_rate() {
        let metrics = TierMetrics {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert_eq!(metrics.hit_rate(), 80.0);

        let empty = TierMetrics::default();
        assert_eq!(empty.hit_rate(), 0.0);
    }

    #[test]
    fn test_overall_hit_rate_counts_logical_lookups() {
        // One lookup that missed L1 and hit L2: per-tier counters see one
        // miss and one hit, the logical counters see one served request.
        let metrics = CacheMetrics {
            l1: TierMetrics {
                misses: 1,
                ..Default::default()
            },
            l2: TierMetrics {
                hits: 1,
                ..Default::default()
            },
            lookups: 1,
            logical_hits: 1,
            ..Default::default()
        };

        assert_eq!(metrics.overall_hit_rate(), 100.0);
        assert_eq!(metrics.l1.hit_rate(), 0.0);
        assert_eq!(metrics.l2.hit_rate(), 100.0);
    }

    #[test]
    fn test_total_entries() {
        let metrics = CacheMetrics {
            l1: TierMetrics {
                entries: 2,
                ..Default::default()
            },
            l2: TierMetrics {
                entries: 3,
                ..Default::default()
            },
            l3: Some(TierMetrics {
                entries: 5,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(metrics.total_entries(), 10);
    }

    #[test]
    fn test_display() {
        let metrics = CacheMetrics::default();
        let display = format!("{}", metrics);
        assert!(display.contains("lookups: 0"));
        assert!(display.contains("l3: disabled"));
    }
}
