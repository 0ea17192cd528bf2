//! Scan result cache keyed by content identity.
//!
//! The key is `{sha256}:{size}:{mtime_ticks}`, see
//! [`identity::cache_key`](crate::identity::cache_key), so any content,
//! size, or last-write change is a miss. Reads return deep clones; nothing
//! downstream can mutate a cached entry.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::config::CacheConfig;
use crate::result::AggregatedResult;

struct CacheEntry {
    result: AggregatedResult,
    inserted_at: Instant,
}

/// Bounded TTL cache of aggregated scan results.
///
/// # Thread Safety
///
/// Backed by a concurrent map; readers never block writers for long and
/// always clone out.
pub struct ScanCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
}

impl ScanCache {
    /// Creates a cache from configuration.
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::from_secs(config.ttl_minutes * 60),
            max_entries: config.max_entries.max(1),
        }
    }

    /// Returns a clone of the cached result if present and unexpired.
    #[must_use]
    pub fn try_get(&self, key: &str) -> Option<AggregatedResult> {
        let entry = self.entries.get(key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.result.clone())
    }

    /// Stores a result, trimming the cache back inside its bound.
    ///
    /// Trimming first drops expired entries, then the oldest by insertion
    /// time until the bound holds.
    pub fn store(&self, key: impl Into<String>, result: AggregatedResult) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                result,
                inserted_at: Instant::now(),
            },
        );
        if self.entries.len() > self.max_entries {
            self.trim();
        }
    }

    /// Current entry count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    fn trim(&self) {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.inserted_at.elapsed() <= self.ttl);

        if self.entries.len() > self.max_entries {
            let mut by_age: Vec<(String, Instant)> = self
                .entries
                .iter()
                .map(|e| (e.key().clone(), e.value().inserted_at))
                .collect();
            by_age.sort_by_key(|(_, at)| *at);

            let excess = self.entries.len() - self.max_entries;
            for (key, _) in by_age.into_iter().take(excess) {
                self.entries.remove(&key);
            }
        }
        debug!(before, after = self.entries.len(), "scan cache trimmed");
    }
}
