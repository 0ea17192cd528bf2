//! The engine contract.
//!
//! Every detector (signature, heuristic, ML, reputation, script surface,
//! and the external second opinions) implements [`Engine`]. The aggregator
//! holds them as an ordered sequence of shared handles and invokes them
//! concurrently; an engine that cannot run returns an Error result rather
//! than failing the scan.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use vigil_core::{EngineResult, ScanContext};

/// Stable engine names, used for weights, gating, and reason attribution.
pub mod names {
    /// Hash signature engine.
    pub const SIGNATURE: &str = "signature";
    /// PE heuristic engine.
    pub const HEURISTIC: &str = "heuristic";
    /// ML classifier engine.
    pub const ML: &str = "ml";
    /// Local reputation engine.
    pub const REPUTATION: &str = "reputation";
    /// Script-surface engine.
    pub const SCRIPT: &str = "script";
    /// Platform-scanner second opinion.
    pub const DEFENDER: &str = "defender";
    /// Remote-reputation second opinion.
    pub const VIRUS_TOTAL: &str = "virustotal";
}

/// A single detection engine.
///
/// # Contract
///
/// - `scan` must be side-effect free on the filesystem, except where a
///   specific engine documents otherwise (the script engine reads bytes).
/// - Engines never mutate the [`ScanContext`]; per-engine state lives in
///   the engine's own caches.
/// - Failures are reported through [`EngineResult::error`], never panics.
/// - Cancellation must be honored promptly; a cancelled scan returns an
///   Error result with a cancellation reason.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Stable name of this engine.
    fn name(&self) -> &'static str;

    /// Default aggregation weight in `[0, 1]`, overridable via config.
    fn default_weight(&self) -> f64;

    /// Whether the engine can currently produce verdicts.
    fn is_ready(&self) -> bool {
        true
    }

    /// Scans one file and returns this engine's verdict.
    async fn scan(&self, ctx: &ScanContext, cancel: &CancellationToken) -> EngineResult;
}
