//! Local prevalence store: how often this host has seen each content hash.
//!
//! The reputation engine records one sighting per scan and scores off the
//! snapshot returned by that same update, so concurrent scans of one file
//! cannot double-count against the decision that reads them.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, VigilError};
use crate::persist;

/// Sighting record for one content hash.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrevalenceEntry {
    /// First time this hash was seen on the host.
    pub first_seen: DateTime<Utc>,
    /// Most recent sighting.
    pub last_seen: DateTime<Utc>,
    /// Total sightings.
    pub seen_count: u64,
}

impl PrevalenceEntry {
    /// True if this sighting is the first ever for the hash.
    #[must_use]
    pub fn is_first_sighting(&self) -> bool {
        self.seen_count == 1
    }

    /// True if the hash has been common on this host: present for more
    /// than `days` days with more than `min_count` sightings.
    #[must_use]
    pub fn is_established(&self, days: i64, min_count: u64) -> bool {
        self.seen_count > min_count && Utc::now() - self.first_seen > chrono::Duration::days(days)
    }
}

/// Concurrent prevalence map keyed by content SHA-256, with optional JSON
/// persistence.
pub struct PrevalenceStore {
    entries: DashMap<String, PrevalenceEntry>,
    path: Option<PathBuf>,
}

impl PrevalenceStore {
    /// Creates an in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            path: None,
        }
    }

    /// Opens a store backed by a JSON file, loading existing entries.
    /// A missing file is an empty store; a corrupt file is logged and
    /// replaced on the next save.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = DashMap::new();
        if path.exists() {
            match persist::read_json::<Vec<(String, PrevalenceEntry)>>(&path) {
                Ok(loaded) => {
                    for (hash, entry) in loaded {
                        entries.insert(hash, entry);
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "prevalence store unreadable, starting empty"),
            }
        }
        Self {
            entries,
            path: Some(path),
        }
    }

    /// Records one sighting and returns the post-update snapshot.
    ///
    /// This is the increment the reputation engine's contract requires:
    /// exactly one per scan, atomic with the read that scores it.
    pub fn record(&self, sha256: &str) -> PrevalenceEntry {
        let now = Utc::now();
        let mut entry = self
            .entries
            .entry(sha256.to_lowercase())
            .or_insert(PrevalenceEntry {
                first_seen: now,
                last_seen: now,
                seen_count: 0,
            });
        entry.seen_count += 1;
        entry.last_seen = now;
        *entry
    }

    /// Returns the current snapshot without recording a sighting.
    #[must_use]
    pub fn get(&self, sha256: &str) -> Option<PrevalenceEntry> {
        self.entries.get(&sha256.to_lowercase()).map(|e| *e)
    }

    /// Number of tracked hashes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persists the store to its backing file, if it has one.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Persistence`]; the in-memory state is intact
    /// and the caller may retry.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot: Vec<(String, PrevalenceEntry)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        persist::write_json_atomic(path, &snapshot).map_err(|e| VigilError::Persistence {
            store: "prevalence".into(),
            detail: e.to_string(),
        })
    }
}

impl Default for PrevalenceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_first_record_is_first_sighting() {
        let store = PrevalenceStore::new();
        let entry = store.record("abc123");
        assert!(entry.is_first_sighting());
        assert_eq!(entry.seen_count, 1);
    }

    #[test]
    fn test_repeat_records_accumulate() {
        let store = PrevalenceStore::new();
        store.record("abc123");
        store.record("abc123");
        let entry = store.record("abc123");
        assert_eq!(entry.seen_count, 3);
        assert!(!entry.is_first_sighting());
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let store = PrevalenceStore::new();
        store.record("ABCD");
        let entry = store.record("abcd");
        assert_eq!(entry.seen_count, 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_does_not_record() {
        let store = PrevalenceStore::new();
        store.record("x");
        let _ = store.get("x");
        assert_eq!(store.get("x").unwrap().seen_count, 1);
    }

    #[test]
    fn test_established_needs_age_and_count() {
        let store = PrevalenceStore::new();
        for _ in 0..10 {
            store.record("h");
        }
        // Plenty of sightings but first seen just now.
        assert!(!store.get("h").unwrap().is_established(7, 5));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prevalence.json");

        let store = PrevalenceStore::open(&path);
        store.record("h1");
        store.record("h1");
        store.record("h2");
        store.save().unwrap();

        let reloaded = PrevalenceStore::open(&path);
        assert_eq!(reloaded.get("h1").unwrap().seen_count, 2);
        assert_eq!(reloaded.get("h2").unwrap().seen_count, 1);
    }

    #[test]
    fn test_concurrent_records_do_not_lose_counts() {
        use std::sync::Arc;
        let store = Arc::new(PrevalenceStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    store.record("shared");
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.get("shared").unwrap().seen_count, 800);
    }
}
