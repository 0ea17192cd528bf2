//! Error types shared across the Vigil engine.
//!
//! Failures are carried as typed variants, never as control flow: engine
//! failures become Error engine results before they reach the aggregator,
//! and pipeline workers log and continue. Only the caller-facing stores
//! (quarantine, pending decisions, configuration) surface these directly.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, VigilError>;

/// Errors produced by the detection-and-response subsystem.
///
/// # Security Notes
///
/// Messages name the failing path and operation but never include file
/// contents or key material.
#[derive(Debug, Error)]
pub enum VigilError {
    /// Filesystem operation failed.
    ///
    /// Never fatal to the pipeline; caller-visible for quarantine,
    /// restore, and delete operations.
    #[error("i/o failure on {}: {source}", path.display())]
    Io {
        /// Path the operation was acting on.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The operation was aborted by a cancellation token.
    ///
    /// Surfaced inside the aggregator as an Error engine result with
    /// zero confidence.
    #[error("operation cancelled")]
    Cancelled,

    /// A subprocess or HTTP call exceeded its wall-clock budget.
    ///
    /// Not retried within a single scan.
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
        /// The budget that was exceeded.
        seconds: u64,
    },

    /// A quarantine blob failed its magic or authentication-tag check.
    ///
    /// Restore refuses; the journal records the event.
    #[error("integrity check failed for {subject}: {detail}")]
    IntegrityFailure {
        /// What was being verified (blob id, store name).
        subject: String,
        /// Human-readable failure detail.
        detail: String,
    },

    /// An operation was refused by policy rather than by failure.
    ///
    /// A terminal state carrying its reasons, not an error condition.
    #[error("rejected by policy: {reason}")]
    PolicyReject {
        /// Why the operation was refused.
        reason: String,
    },

    /// A pending decision or quarantine entry id does not exist.
    #[error("{what} not found: {id}")]
    NotFound {
        /// The kind of record looked up.
        what: String,
        /// The id that missed.
        id: String,
    },

    /// Engine-internal failure; excluded from aggregation.
    #[error("engine '{engine}' failed: {detail}")]
    TransientEngine {
        /// Name of the failing engine.
        engine: String,
        /// Failure detail.
        detail: String,
    },

    /// A JSON store or journal entry could not be written.
    ///
    /// The in-memory write still succeeds; persistence is retried in the
    /// background.
    #[error("failed to persist {store}: {detail}")]
    Persistence {
        /// Name of the store that failed to persist.
        store: String,
        /// Failure detail.
        detail: String,
    },

    /// Configuration is missing or invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl VigilError {
    /// Wraps an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true if this error represents a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true if this error is a policy refusal rather than a failure.
    #[must_use]
    pub fn is_policy_reject(&self) -> bool {
        matches!(self, Self::PolicyReject { .. })
    }
}
