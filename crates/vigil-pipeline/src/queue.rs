//! Bounded event queue with drop-oldest overflow.
//!
//! Producers never block: a full queue discards its oldest pending event
//! to admit the newest one, so under sustained pressure the pipeline
//! stays current rather than archaeological. As a secondary relief valve,
//! once occupancy crosses 80% events for temporary-looking files are
//! refused outright at the producer.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::trace;

use crate::watcher::FileEvent;

/// Extensions treated as temporary churn under pressure.
const TEMPORARY_EXTENSIONS: &[&str] = &["tmp", "log", "partial", "part", "crdownload", "swp", "etl"];

/// Occupancy ratio past which temporary files are refused.
const REFUSAL_OCCUPANCY: f64 = 0.8;

/// What happened to a pushed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued normally.
    Accepted,
    /// Queued; the oldest pending event was dropped to make room.
    ReplacedOldest,
    /// Refused under pressure as temporary churn.
    RefusedTemporary,
}

/// The bounded channel between the coalescer and the worker pool.
pub struct BoundedQueue {
    items: Mutex<VecDeque<FileEvent>>,
    capacity: usize,
    notify: Notify,
}

impl BoundedQueue {
    /// Creates a queue with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    /// Non-blocking push with the overflow policy applied.
    pub fn try_push(&self, event: FileEvent) -> PushOutcome {
        let mut items = self.items.lock().expect("queue lock poisoned");

        let occupancy = items.len() as f64 / self.capacity as f64;
        if occupancy >= REFUSAL_OCCUPANCY && is_temporary(&event) {
            trace!(path = %event.path.display(), "temporary file refused under pressure");
            return PushOutcome::RefusedTemporary;
        }

        let outcome = if items.len() >= self.capacity {
            let dropped = items.pop_front();
            trace!(dropped = ?dropped.map(|e| e.path), "queue full, dropped oldest");
            PushOutcome::ReplacedOldest
        } else {
            PushOutcome::Accepted
        };
        items.push_back(event);
        drop(items);

        self.notify.notify_one();
        outcome
    }

    /// Removes the next event, waiting until one is available.
    pub async fn pop(&self) -> FileEvent {
        loop {
            if let Some(event) = self.try_pop() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    /// Removes the next event if one is pending.
    #[must_use]
    pub fn try_pop(&self) -> Option<FileEvent> {
        self.items.lock().expect("queue lock poisoned").pop_front()
    }

    /// Pending event count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().expect("queue lock poisoned").len()
    }

    /// Returns true if no events are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn is_temporary(event: &FileEvent) -> bool {
    event
        .path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .is_some_and(|ext| TEMPORARY_EXTENSIONS.contains(&ext.as_str()))
}
