//! Verdict types for scan results.
//!
//! Two verdict vocabularies exist in the pipeline: individual engines speak
//! in [`EngineVerdict`] (what one detector believes about a file), and the
//! aggregator speaks in [`PolicyVerdict`] (what the system should do about
//! it). Keeping them separate prevents a single engine from dictating
//! response policy.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single engine's belief about a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineVerdict {
    /// No indicators found.
    Clean,
    /// Indicators present but not conclusive.
    Suspicious,
    /// Conclusive malicious indicators.
    Malicious,
    /// The engine could not form an opinion (skipped, errored, or
    /// inapplicable to this file type).
    Unknown,
}

impl EngineVerdict {
    /// Returns true if this verdict flags the file in any way.
    #[must_use]
    pub fn is_flagged(&self) -> bool {
        matches!(self, Self::Suspicious | Self::Malicious)
    }
}

impl fmt::Display for EngineVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean => write!(f, "clean"),
            Self::Suspicious => write!(f, "suspicious"),
            Self::Malicious => write!(f, "malicious"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// The aggregated policy decision for a file.
///
/// Ordered by severity: `Allow < NeedsReview < Quarantine < Block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PolicyVerdict {
    /// File is safe; no action.
    Allow,
    /// File warrants human review.
    NeedsReview,
    /// File should be isolated.
    Quarantine,
    /// File must be stopped immediately.
    Block,
}

impl PolicyVerdict {
    /// Returns true if the verdict permits the file.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Returns true if the verdict calls for any response action.
    #[must_use]
    pub fn is_threat(&self) -> bool {
        !self.is_allowed()
    }
}

impl fmt::Display for PolicyVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::NeedsReview => write!(f, "needs-review"),
            Self::Quarantine => write!(f, "quarantine"),
            Self::Block => write!(f, "block"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_verdict_flagged() {
        assert!(EngineVerdict::Suspicious.is_flagged());
        assert!(EngineVerdict::Malicious.is_flagged());
        assert!(!EngineVerdict::Clean.is_flagged());
        assert!(!EngineVerdict::Unknown.is_flagged());
    }

    #[test]
    fn test_policy_verdict_ordering() {
        assert!(PolicyVerdict::Allow < PolicyVerdict::NeedsReview);
        assert!(PolicyVerdict::NeedsReview < PolicyVerdict::Quarantine);
        assert!(PolicyVerdict::Quarantine < PolicyVerdict::Block);
    }

    #[test]
    fn test_policy_verdict_predicates() {
        assert!(PolicyVerdict::Allow.is_allowed());
        assert!(!PolicyVerdict::Allow.is_threat());
        assert!(PolicyVerdict::Block.is_threat());
    }

    #[test]
    fn test_verdict_serialization() {
        let json = serde_json::to_string(&PolicyVerdict::Quarantine).unwrap();
        assert!(json.contains("Quarantine"));
        let back: PolicyVerdict = serde_json::from_str(&json).unwrap();
        assert_eq!(back, PolicyVerdict::Quarantine);
    }
}
