//! Per-path event coalescing.
//!
//! Editors, compilers, and droppers alike touch a file several times in
//! quick succession; scanning each touch wastes the worker pool. The
//! coalescer holds the latest event per path and releases it once the
//! path has been quiet for the configured window; the earlier event is
//! dropped, the later timestamp wins.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::watcher::FileEvent;

/// Debouncing buffer between the watcher and the bounded queue.
pub struct Coalescer {
    pending: Mutex<HashMap<PathBuf, (FileEvent, Instant)>>,
    window: Duration,
}

impl Coalescer {
    /// Creates a coalescer with the given quiet window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            window,
        }
    }

    /// Buffers an event. A newer event for the same path replaces the
    /// older one and restarts that path's quiet window.
    pub fn submit(&self, event: FileEvent) {
        let mut pending = self.pending.lock().expect("coalescer lock poisoned");
        pending.insert(event.path.clone(), (event, Instant::now()));
    }

    /// Removes and returns every event whose quiet window has elapsed.
    #[must_use]
    pub fn drain_ready(&self) -> Vec<FileEvent> {
        let mut pending = self.pending.lock().expect("coalescer lock poisoned");
        let now = Instant::now();
        let ready: Vec<PathBuf> = pending
            .iter()
            .filter(|(_, (_, arrived))| now.duration_since(*arrived) >= self.window)
            .map(|(path, _)| path.clone())
            .collect();
        ready
            .into_iter()
            .filter_map(|path| pending.remove(&path))
            .map(|(event, _)| event)
            .collect()
    }

    /// Events currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().expect("coalescer lock poisoned").len()
    }

    /// Returns true if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A sensible pump cadence for the configured window.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        (self.window / 2).max(Duration::from_millis(20))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::ChangeKind;

    #[test]
    fn test_event_held_inside_window() {
        let coalescer = Coalescer::new(Duration::from_secs(60));
        coalescer.submit(FileEvent::now("/tmp/a", ChangeKind::Created));

        assert_eq!(coalescer.len(), 1);
        assert!(coalescer.drain_ready().is_empty());
    }

    #[test]
    fn test_event_released_after_window() {
        let coalescer = Coalescer::new(Duration::from_millis(5));
        coalescer.submit(FileEvent::now("/tmp/a", ChangeKind::Created));

        std::thread::sleep(Duration::from_millis(10));
        let drained = coalescer.drain_ready();
        assert_eq!(drained.len(), 1);
        assert!(coalescer.is_empty());
    }

    #[test]
    fn test_later_event_wins() {
        let coalescer = Coalescer::new(Duration::from_millis(5));
        coalescer.submit(FileEvent::now("/tmp/a", ChangeKind::Created));
        coalescer.submit(FileEvent::now("/tmp/a", ChangeKind::Modified));

        std::thread::sleep(Duration::from_millis(10));
        let drained = coalescer.drain_ready();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].change_kind, ChangeKind::Modified);
    }

    #[test]
    fn test_resubmission_restarts_window() {
        let coalescer = Coalescer::new(Duration::from_millis(50));
        coalescer.submit(FileEvent::now("/tmp/a", ChangeKind::Created));
        std::thread::sleep(Duration::from_millis(30));
        // Touch again before the window elapses.
        coalescer.submit(FileEvent::now("/tmp/a", ChangeKind::Modified));
        std::thread::sleep(Duration::from_millis(30));

        // 60 ms after the first event, but only 30 ms after the second.
        assert!(coalescer.drain_ready().is_empty());
    }

    #[test]
    fn test_distinct_paths_independent() {
        let coalescer = Coalescer::new(Duration::from_millis(5));
        coalescer.submit(FileEvent::now("/tmp/a", ChangeKind::Created));
        coalescer.submit(FileEvent::now("/tmp/b", ChangeKind::Created));

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(coalescer.drain_ready().len(), 2);
    }
}
