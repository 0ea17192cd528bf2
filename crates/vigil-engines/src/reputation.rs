//! Local reputation engine.
//!
//! Accumulates a signed adjustment from publisher trust, path shape,
//! extension risk, file age, and local prevalence, then clamps into
//! `[0, 100]`. This is the one engine with a sanctioned side effect: it
//! records the prevalence sighting itself, atomically with the read that
//! scores it. Results are cached for 30 minutes by content hash.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use vigil_core::{EngineResult, EngineVerdict, PathRules, PrevalenceStore, ScanContext};

use crate::engine::{names, Engine};
use crate::heuristic::TRUSTED_PUBLISHERS;

/// Extensions that routinely carry first-stage payloads.
const HIGH_RISK_EXTENSIONS: &[&str] = &[
    "ps1", "vbs", "vbe", "js", "jse", "wsf", "bat", "cmd", "hta", "scr", "pif", "com", "jar",
    "msi",
];

const CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// Days a hash must have been present to count as established.
const ESTABLISHED_DAYS: i64 = 7;
/// Sighting count a hash must exceed to count as established.
const ESTABLISHED_COUNT: u64 = 5;

struct CachedVerdict {
    result: EngineResult,
    at: Instant,
}

/// Reputation engine over publisher, path, age, and prevalence signals.
pub struct ReputationEngine {
    rules: PathRules,
    prevalence: Arc<PrevalenceStore>,
    cache: DashMap<String, CachedVerdict>,
}

impl ReputationEngine {
    /// Creates the engine over the shared prevalence store.
    #[must_use]
    pub fn new(rules: PathRules, prevalence: Arc<PrevalenceStore>) -> Self {
        Self {
            rules,
            prevalence,
            cache: DashMap::new(),
        }
    }

    fn score(&self, ctx: &ScanContext) -> (i32, Vec<String>) {
        let mut adjustment: i32 = 0;
        let mut reasons = Vec::new();
        let is_pe = ctx.is_valid_pe();

        // Publisher.
        match (&ctx.signer_name, ctx.signature_valid) {
            (Some(signer), Some(true)) => {
                let lowered = signer.to_lowercase();
                if TRUSTED_PUBLISHERS.iter().any(|p| lowered.contains(p)) {
                    adjustment -= 20;
                    reasons.push(format!("trusted publisher '{signer}'"));
                } else {
                    adjustment -= 10;
                    reasons.push("valid signature, unknown publisher".into());
                }
            }
            _ if is_pe && ctx.is_unsigned() => {
                adjustment += 15;
                reasons.push("unsigned PE".into());
            }
            _ => {}
        }

        // Path portion: a trusted system root settles it and skips the
        // suspicious-substring check.
        let lowered_path = ctx.path.to_string_lossy().to_lowercase();
        if self.rules.is_trusted(&lowered_path) {
            adjustment -= 10;
            reasons.push("trusted system path".into());
        } else if self.rules.is_suspicious(&lowered_path) {
            adjustment += 15;
            reasons.push("suspicious path".into());
        }

        // Extension.
        if HIGH_RISK_EXTENSIONS.contains(&ctx.extension.as_str()) {
            adjustment += 15;
            reasons.push(format!("high-risk extension .{}", ctx.extension));
        }

        // Creation age.
        if let Some(age) = ctx.created_age() {
            if age < chrono::Duration::minutes(5) {
                adjustment += 10;
                reasons.push("newly created".into());
            } else if age < chrono::Duration::hours(1) {
                adjustment += 5;
                reasons.push("created within the hour".into());
            }
        }

        // Prevalence: one recorded sighting, scored off its own snapshot.
        if let Some(sha256) = &ctx.sha256 {
            let snapshot = self.prevalence.record(sha256);
            if snapshot.is_first_sighting() {
                adjustment += 10;
                reasons.push("first occurrence on this host".into());
            } else if snapshot.is_established(ESTABLISHED_DAYS, ESTABLISHED_COUNT) {
                adjustment -= 5;
                reasons.push("established on this host".into());
            }
        }

        (adjustment, reasons)
    }
}

#[async_trait]
impl Engine for ReputationEngine {
    fn name(&self) -> &'static str {
        names::REPUTATION
    }

    fn default_weight(&self) -> f64 {
        0.5
    }

    async fn scan(&self, ctx: &ScanContext, _cancel: &CancellationToken) -> EngineResult {
        if let Some(sha256) = &ctx.sha256 {
            if let Some(cached) = self.cache.get(sha256) {
                if cached.at.elapsed() <= CACHE_TTL {
                    return cached.result.clone();
                }
            }
        }

        let (adjustment, reasons) = self.score(ctx);
        let score = adjustment.clamp(0, 100) as u8;
        let verdict = if score >= 40 {
            EngineVerdict::Suspicious
        } else {
            EngineVerdict::Clean
        };

        let mut result = EngineResult::new(self.name(), score, verdict, 0.5)
            .with_metadata("adjustment", adjustment.to_string());
        result.reasons = reasons;

        if let Some(sha256) = &ctx.sha256 {
            self.cache.insert(
                sha256.clone(),
                CachedVerdict {
                    result: result.clone(),
                    at: Instant::now(),
                },
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{pe_context, plain_context};
    use chrono::Utc;

    fn engine() -> ReputationEngine {
        ReputationEngine::new(PathRules::default(), Arc::new(PrevalenceStore::new()))
    }

    #[tokio::test]
    async fn test_fresh_unsigned_download_is_suspicious() {
        let engine = engine();
        let mut ctx = pe_context(r"c:\users\u\downloads\setup.exe");
        ctx.created_at = Some(Utc::now() - chrono::Duration::seconds(30));
        ctx.sha256 = Some("f".repeat(64));

        let result = engine.scan(&ctx, &CancellationToken::new()).await;
        // unsigned 15 + suspicious path 15 + newly created 10 + first seen 10
        assert_eq!(result.score, 50);
        assert_eq!(result.verdict, EngineVerdict::Suspicious);
        assert!((result.confidence - 0.5).abs() < f64::EPSILON);
        assert!(result.reasons.iter().any(|r| r == "suspicious path"));
        assert!(result.reasons.iter().any(|r| r == "unsigned PE"));
        assert!(result.reasons.iter().any(|r| r == "newly created"));
    }

    #[tokio::test]
    async fn test_trusted_path_short_circuits_path_rules() {
        let engine = engine();
        // The system32 path also contains no suspicious substring, but a
        // trusted prefix must win even when one is nested underneath.
        let mut ctx = pe_context(r"c:\windows\system32\drivers\temp\x.exe");
        ctx.pe_info.as_mut().unwrap().has_signature = true;
        ctx.signer_name = Some("Microsoft Windows".into());
        ctx.signature_valid = Some(true);

        let result = engine.scan(&ctx, &CancellationToken::new()).await;
        assert_eq!(result.score, 0);
        assert!(result.reasons.iter().any(|r| r == "trusted system path"));
        assert!(!result.reasons.iter().any(|r| r == "suspicious path"));
    }

    #[tokio::test]
    async fn test_high_risk_extension() {
        let engine = engine();
        let ctx = plain_context("/home/u/run.ps1");
        let result = engine.scan(&ctx, &CancellationToken::new()).await;
        assert!(result.reasons.iter().any(|r| r.contains(".ps1")));
    }

    #[tokio::test]
    async fn test_negative_adjustment_clamps_to_zero() {
        let engine = engine();
        let mut ctx = pe_context(r"c:\program files\vendor\app.exe");
        ctx.pe_info.as_mut().unwrap().has_signature = true;
        ctx.signer_name = Some("Microsoft Corporation".into());
        ctx.signature_valid = Some(true);

        let result = engine.scan(&ctx, &CancellationToken::new()).await;
        assert_eq!(result.score, 0);
        assert_eq!(result.verdict, EngineVerdict::Clean);
        assert_eq!(result.metadata.get("adjustment").unwrap(), "-30");
    }

    #[tokio::test]
    async fn test_prevalence_recorded_once_per_scan() {
        let prevalence = Arc::new(PrevalenceStore::new());
        let engine = ReputationEngine::new(PathRules::default(), Arc::clone(&prevalence));
        let mut ctx = plain_context("/data/a.bin");
        ctx.sha256 = Some("a".repeat(64));

        engine.scan(&ctx, &CancellationToken::new()).await;
        assert_eq!(prevalence.get(&"a".repeat(64)).unwrap().seen_count, 1);
    }

    #[tokio::test]
    async fn test_cached_result_skips_rescoring() {
        let prevalence = Arc::new(PrevalenceStore::new());
        let engine = ReputationEngine::new(PathRules::default(), Arc::clone(&prevalence));
        let mut ctx = plain_context("/data/a.bin");
        ctx.sha256 = Some("b".repeat(64));

        let first = engine.scan(&ctx, &CancellationToken::new()).await;
        let second = engine.scan(&ctx, &CancellationToken::new()).await;

        assert_eq!(first.score, second.score);
        // Cache hit means no second prevalence sighting.
        assert_eq!(prevalence.get(&"b".repeat(64)).unwrap().seen_count, 1);
    }
}
