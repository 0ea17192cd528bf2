//! Egress event DTOs consumed by IPC broadcasters and the CLI.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::verdict::PolicyVerdict;

/// Response actions the executor can take or recommend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreatAction {
    /// Move the file into the quarantine store.
    Quarantine,
    /// Remove the file permanently.
    Delete,
    /// Leave the file in place.
    Allow,
    /// Take no action but keep watching.
    Monitor,
}

/// Summary of a pending user decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSummary {
    /// Identifier used to resolve the decision.
    pub event_id: Uuid,
    /// File the decision concerns.
    pub path: PathBuf,
    /// SHA-256 of the file at detection time, if known.
    pub sha256: Option<String>,
    /// Aggregated risk score at detection time.
    pub risk_score: u8,
    /// Aggregated verdict at detection time.
    pub verdict: PolicyVerdict,
    /// What the executor recommends.
    pub recommended: ThreatAction,
    /// When the decision was queued.
    pub created_at: DateTime<Utc>,
}

/// Events emitted by the detection-and-response subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum VigilEvent {
    /// Periodic progress of an on-demand scan job.
    ScanProgress {
        /// Job the progress belongs to.
        job_id: Uuid,
        /// Total files enumerated.
        total: usize,
        /// Files scanned so far.
        scanned: usize,
        /// Threats found so far.
        threats_found: usize,
        /// File currently being scanned.
        current_path: Option<PathBuf>,
    },
    /// A file was classified as a threat.
    ThreatDetected {
        /// Path at detection time (the original path for quick-gate
        /// quarantines, not the vault path).
        path: PathBuf,
        /// Best-known threat name.
        name: Option<String>,
        /// Aggregated verdict.
        verdict: PolicyVerdict,
        /// Aggregated risk score.
        risk_score: u8,
        /// Whether the file was quarantined automatically.
        auto_quarantined: bool,
        /// Failure detail when automatic handling did not succeed.
        failure: Option<String>,
    },
    /// A detection awaits a user decision.
    ThreatActionRequired(PendingSummary),
    /// A decision (user or policy) was applied.
    ThreatActionApplied {
        /// The decision that was resolved.
        pending: PendingSummary,
        /// Action that was taken.
        action: ThreatAction,
        /// Whether the action succeeded.
        success: bool,
        /// Outcome detail.
        detail: Option<String>,
    },
    /// An on-demand scan job finished.
    ScanCompleted {
        /// The finished job.
        job_id: Uuid,
        /// Files scanned.
        scanned: usize,
        /// Threats found.
        threats_found: usize,
        /// Total wall-clock time.
        duration: Duration,
    },
    /// A non-threat error surfaced to the caller.
    ScanError {
        /// Failing path.
        path: PathBuf,
        /// Error kind description.
        kind: String,
    },
}

impl VigilEvent {
    /// Short event name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ScanProgress { .. } => "scan_progress",
            Self::ThreatDetected { .. } => "threat_detected",
            Self::ThreatActionRequired(_) => "threat_action_required",
            Self::ThreatActionApplied { .. } => "threat_action_applied",
            Self::ScanCompleted { .. } => "scan_completed",
            Self::ScanError { .. } => "scan_error",
        }
    }
}
