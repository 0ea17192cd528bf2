//! Pending-decision registry.
//!
//! Detections in ask-user mode wait here for a verdict from the operator.
//! The registry is held only in memory: a restart drops undecided entries,
//! which simply re-queue the next time the file is seen. Single-writer-
//! per-key semantics come from removal being atomic with decision
//! application: [`take`](PendingRegistry::take) removes and returns in
//! one step, so two resolvers cannot both act on the same entry.

use std::path::PathBuf;

use dashmap::DashMap;
use uuid::Uuid;

use vigil_core::PendingSummary;

/// A detection awaiting a user decision.
#[derive(Debug, Clone)]
pub struct PendingDecision {
    /// The user-facing summary (also the wire DTO).
    pub summary: PendingSummary,
    /// Path the decision applies to; for a quick-gate detection this is
    /// the original location, not the staging path.
    pub path: PathBuf,
    /// Quarantine entry already holding the file, when intake preceded
    /// the decision.
    pub quarantine_id: Option<Uuid>,
}

/// In-memory map of undecided detections, keyed by event id.
#[derive(Default)]
pub struct PendingRegistry {
    entries: DashMap<Uuid, PendingDecision>,
}

impl PendingRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a decision; a second registration for the same event id
    /// replaces the first.
    pub fn insert(&self, decision: PendingDecision) {
        self.entries.insert(decision.summary.event_id, decision);
    }

    /// Removes and returns the decision, atomically.
    #[must_use]
    pub fn take(&self, event_id: Uuid) -> Option<PendingDecision> {
        self.entries.remove(&event_id).map(|(_, decision)| decision)
    }

    /// Summaries of everything still waiting, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<PendingSummary> {
        let mut summaries: Vec<PendingSummary> = self
            .entries
            .iter()
            .map(|e| e.value().summary.clone())
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    /// Number of undecided entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
