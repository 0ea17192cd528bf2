//! Shared scan counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Totals across real-time and on-demand scanning.
#[derive(Debug, Default)]
pub struct ScanStats {
    files_scanned: AtomicU64,
    threats_found: AtomicU64,
}

impl ScanStats {
    /// Records one scanned file.
    pub fn record_scan(&self) {
        self.files_scanned.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one detected threat.
    pub fn record_threat(&self) {
        self.threats_found.fetch_add(1, Ordering::Relaxed);
    }

    /// Files scanned so far.
    #[must_use]
    pub fn files_scanned(&self) -> u64 {
        self.files_scanned.load(Ordering::Relaxed)
    }

    /// Threats found so far.
    #[must_use]
    pub fn threats_found(&self) -> u64 {
        self.threats_found.load(Ordering::Relaxed)
    }
}
