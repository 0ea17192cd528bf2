//! Engine and aggregated scan results.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::verdict::{EngineVerdict, PolicyVerdict};

/// The result a single engine returns for one file.
///
/// Immutable after return. An `error` being set forces
/// `verdict = Unknown` and `score = 0`, and excludes the result from score
/// aggregation entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineResult {
    /// Stable engine name.
    pub engine_name: String,
    /// Risk score in `0..=100`.
    pub score: u8,
    /// The engine's verdict.
    pub verdict: EngineVerdict,
    /// Confidence in `0.0..=1.0`.
    pub confidence: f64,
    /// Ordered, short, human-readable findings.
    pub reasons: Vec<String>,
    /// Engine-specific key/value details.
    pub metadata: HashMap<String, String>,
    /// Failure description; set only for error results.
    pub error: Option<String>,
}

impl EngineResult {
    /// Creates a result with the given verdict and score.
    pub fn new(
        engine_name: impl Into<String>,
        score: u8,
        verdict: EngineVerdict,
        confidence: f64,
    ) -> Self {
        Self {
            engine_name: engine_name.into(),
            score: score.min(100),
            verdict,
            confidence: confidence.clamp(0.0, 1.0),
            reasons: Vec::new(),
            metadata: HashMap::new(),
            error: None,
        }
    }

    /// A clean result with the given confidence.
    pub fn clean(engine_name: impl Into<String>, confidence: f64) -> Self {
        Self::new(engine_name, 0, EngineVerdict::Clean, confidence)
    }

    /// An error result: `score = 0`, `verdict = Unknown`, zero confidence.
    ///
    /// Error results never contribute to the aggregated risk score.
    pub fn error(engine_name: impl Into<String>, detail: impl Into<String>) -> Self {
        let mut result = Self::new(engine_name, 0, EngineVerdict::Unknown, 0.0);
        result.error = Some(detail.into());
        result
    }

    /// Appends a reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reasons.push(reason.into());
        self
    }

    /// Attaches a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns true if this is an error result.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Returns true if this result is strong enough to bypass weighted
    /// aggregation and set the risk score directly.
    #[must_use]
    pub fn is_definitive(&self) -> bool {
        !self.is_error() && self.score >= 95 && self.confidence >= 0.95
    }
}

/// The aggregator's combined answer for one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedResult {
    /// File the result describes.
    pub file_path: PathBuf,
    /// Weighted risk score in `0..=100`.
    pub risk_score: u8,
    /// Policy decision.
    pub verdict: PolicyVerdict,
    /// Order-preserving deduplication of contributing engine reasons.
    pub reasons: Vec<String>,
    /// Every engine result from the scan, errors included.
    pub engine_results: Vec<EngineResult>,
    /// Wall-clock scan duration.
    pub duration: Duration,
    /// When the scan finished.
    pub scanned_at: DateTime<Utc>,
    /// Correlation id threading through diagnostic logs.
    pub correlation_id: Uuid,
}

impl AggregatedResult {
    /// Returns the best threat name derivable from the engine results:
    /// the first reason of the highest-scoring malicious engine.
    #[must_use]
    pub fn threat_name(&self) -> Option<&str> {
        self.engine_results
            .iter()
            .filter(|r| !r.is_error() && r.verdict == EngineVerdict::Malicious)
            .max_by_key(|r| r.score)
            .and_then(|r| r.reasons.first())
            .map(String::as_str)
    }

    /// Returns the result of a named engine, if it ran.
    #[must_use]
    pub fn engine(&self, name: &str) -> Option<&EngineResult> {
        self.engine_results.iter().find(|r| r.engine_name == name)
    }
}

/// Order-preserving deduplication; the first occurrence of a reason wins.
#[must_use]
pub fn dedup_reasons<I>(reasons: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = std::collections::HashSet::new();
    reasons
        .into_iter()
        .filter(|r| seen.insert(r.clone()))
        .collect()
}
