//! Verdict aggregation across engines.
//!
//! The aggregator owns the ordered engine set, fans a scan out across the
//! ready ones, folds the results into a weighted risk score, applies the
//! definitive-match override, maps thresholds to a policy verdict, and
//! runs the second-opinion round when the first round lands in the
//! suspicion zone. Engine failures never escape: they are folded in as
//! Error results and excluded from the score.
//!
//! # Pressure
//!
//! Under pressure (queue backlog past the configured threshold) the heavy
//! engines are skipped and the second-opinion round is suppressed, keeping
//! the pipeline draining at reduced fidelity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vigil_core::{
    dedup_reasons, identity, AggregatedResult, ConfigService, EngineResult, EngineVerdict,
    PolicyVerdict, ScanCache, ScanContext,
};

use crate::engine::{names, Engine};

/// Engines skipped while the pressure flag is set.
const HEAVY_ENGINES: &[&str] = &[names::ML, names::REPUTATION];

/// Multi-engine scan aggregator.
pub struct Aggregator {
    engines: Vec<Arc<dyn Engine>>,
    second_opinion: Vec<Arc<dyn Engine>>,
    config: Arc<ConfigService>,
    cache: Arc<ScanCache>,
    high_pressure: AtomicBool,
}

impl Aggregator {
    /// Creates an aggregator with no engines registered.
    #[must_use]
    pub fn new(config: Arc<ConfigService>, cache: Arc<ScanCache>) -> Self {
        Self {
            engines: Vec::new(),
            second_opinion: Vec::new(),
            config,
            cache,
            high_pressure: AtomicBool::new(false),
        }
    }

    /// Registers a primary engine. Order is preserved in results.
    pub fn register(&mut self, engine: Arc<dyn Engine>) {
        self.engines.push(engine);
    }

    /// Registers a second-opinion engine, gated by configuration and the
    /// suspicion policy rather than run in the primary round.
    pub fn register_second_opinion(&mut self, engine: Arc<dyn Engine>) {
        self.second_opinion.push(engine);
    }

    /// Sets or clears the high-pressure flag.
    pub fn set_high_pressure(&self, engaged: bool) {
        if self.high_pressure.swap(engaged, Ordering::SeqCst) != engaged {
            info!(engaged, "aggregator pressure mode changed");
        }
    }

    /// Returns the current pressure flag.
    #[must_use]
    pub fn is_high_pressure(&self) -> bool {
        self.high_pressure.load(Ordering::SeqCst)
    }

    /// Names of all registered engines, primary round first.
    #[must_use]
    pub fn engine_names(&self) -> Vec<&'static str> {
        self.engines
            .iter()
            .chain(&self.second_opinion)
            .map(|e| e.name())
            .collect()
    }

    /// Scans one file through the full pipeline.
    pub async fn scan(&self, ctx: &ScanContext, cancel: &CancellationToken) -> AggregatedResult {
        let correlation_id = Uuid::new_v4();
        let started = Instant::now();

        // Allowlisted content never reaches the engines.
        if let Some(sha256) = &ctx.sha256 {
            if self.config.is_allowlisted(sha256) {
                debug!(%correlation_id, path = %ctx.path.display(), "allowlisted, skipping scan");
                return self.finish(
                    ctx,
                    0,
                    PolicyVerdict::Allow,
                    vec!["allowlisted".to_string()],
                    Vec::new(),
                    started,
                    correlation_id,
                );
            }
        }

        if let Some(key) = Self::cache_key_for(ctx) {
            if let Some(hit) = self.cache.try_get(&key) {
                debug!(%correlation_id, path = %ctx.path.display(), "scan cache hit");
                return hit;
            }
        }

        let pressured = self.is_high_pressure();
        let snapshot = self.config.snapshot();

        // Primary round.
        let primary: Vec<Arc<dyn Engine>> = self
            .engines
            .iter()
            .filter(|e| e.is_ready())
            .filter(|e| !(pressured && HEAVY_ENGINES.contains(&e.name())))
            .map(Arc::clone)
            .collect();
        let mut results = self
            .run(&primary, ctx, cancel, snapshot.engines.timeout_secs)
            .await;

        let mut risk_score = self.weighted_score(&results);
        let mut verdict = Self::select_verdict(&results, risk_score, &snapshot.thresholds);

        // Second-opinion round, suppressed under pressure.
        if !pressured {
            let followup = self.second_opinion_round(ctx, &results, risk_score, &snapshot);
            if !followup.is_empty() {
                debug!(%correlation_id, engines = ?followup.iter().map(|e| e.name()).collect::<Vec<_>>(),
                       "second-opinion round triggered");
                let extra = self
                    .run(&followup, ctx, cancel, snapshot.engines.timeout_secs)
                    .await;
                results.extend(extra);
                risk_score = self.weighted_score(&results);
                verdict = Self::select_verdict(&results, risk_score, &snapshot.thresholds);
            }
        }

        let reasons = dedup_reasons(
            results
                .iter()
                .filter(|r| !r.is_error())
                .flat_map(|r| r.reasons.iter().cloned()),
        );

        for result in results.iter().filter(|r| r.is_error()) {
            warn!(%correlation_id, engine = %result.engine_name,
                  error = result.error.as_deref().unwrap_or(""), "engine failed");
        }
        info!(%correlation_id, path = %ctx.path.display(), risk_score, verdict = %verdict,
              engines = results.len(), "scan aggregated");

        let aggregated = self.finish(ctx, risk_score, verdict, reasons, results, started, correlation_id);
        if let Some(key) = Self::cache_key_for(ctx) {
            self.cache.store(key, aggregated.clone());
        }
        aggregated
    }

    /// Runs the ready engines among `names` and returns their results in
    /// registration order. Used by the quick-gate.
    pub async fn run_named(
        &self,
        wanted: &[&str],
        ctx: &ScanContext,
        cancel: &CancellationToken,
    ) -> Vec<EngineResult> {
        let timeout_secs = self.config.snapshot().engines.timeout_secs;
        let selected: Vec<Arc<dyn Engine>> = self
            .engines
            .iter()
            .filter(|e| wanted.contains(&e.name()) && e.is_ready())
            .map(Arc::clone)
            .collect();
        self.run(&selected, ctx, cancel, timeout_secs).await
    }

    /// Weighted risk score over non-error results:
    /// `Σ(weight · confidence · score) / Σ(weight · confidence)`, clamped
    /// to `[0, 100]`, with the definitive-match override applied first.
    #[must_use]
    pub fn weighted_score(&self, results: &[EngineResult]) -> u8 {
        if let Some(definitive) = results
            .iter()
            .filter(|r| r.is_definitive())
            .max_by_key(|r| r.score)
        {
            return definitive.score;
        }

        let weights = self.default_weights();
        let engines = self.config.snapshot().engines;
        let mut numerator = 0.0_f64;
        let mut denominator = 0.0_f64;
        for result in results.iter().filter(|r| !r.is_error()) {
            let default = weights.get(result.engine_name.as_str()).copied().unwrap_or(0.5);
            let weight = engines.weight_for(&result.engine_name, default);
            numerator += weight * result.confidence * f64::from(result.score);
            denominator += weight * result.confidence;
        }
        if denominator <= f64::EPSILON {
            return 0;
        }
        (numerator / denominator).clamp(0.0, 100.0).round() as u8
    }

    fn default_weights(&self) -> HashMap<&'static str, f64> {
        self.engines
            .iter()
            .chain(&self.second_opinion)
            .map(|e| (e.name(), e.default_weight()))
            .collect()
    }

    async fn run(
        &self,
        engines: &[Arc<dyn Engine>],
        ctx: &ScanContext,
        cancel: &CancellationToken,
        timeout_secs: u64,
    ) -> Vec<EngineResult> {
        let ctx = Arc::new(ctx.clone());
        let timeout = Duration::from_secs(timeout_secs);
        let mut tasks = JoinSet::new();

        for (index, engine) in engines.iter().enumerate() {
            let engine = Arc::clone(engine);
            let ctx = Arc::clone(&ctx);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let name = engine.name();
                let result = match tokio::time::timeout(timeout, engine.scan(&ctx, &cancel)).await
                {
                    Ok(result) => result,
                    Err(_) => EngineResult::error(
                        name,
                        format!("timed out after {}s", timeout.as_secs()),
                    ),
                };
                (index, result)
            });
        }

        let mut indexed: Vec<(usize, EngineResult)> = Vec::with_capacity(engines.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => indexed.push(entry),
                // A panicking engine is a programmer error; fold it in as
                // an Error result so the scan still completes.
                Err(e) => indexed.push((usize::MAX, EngineResult::error("unknown", e.to_string()))),
            }
        }
        indexed.sort_by_key(|(index, _)| *index);
        indexed.into_iter().map(|(_, result)| result).collect()
    }

    fn select_verdict(
        results: &[EngineResult],
        risk_score: u8,
        thresholds: &vigil_core::config::ThresholdConfig,
    ) -> PolicyVerdict {
        let live = || results.iter().filter(|r| !r.is_error());

        let confident_malicious = live()
            .any(|r| r.verdict == EngineVerdict::Malicious && r.confidence >= 0.9);
        if confident_malicious || risk_score >= thresholds.block_threshold {
            return PolicyVerdict::Block;
        }

        let malicious_count = live()
            .filter(|r| r.verdict == EngineVerdict::Malicious)
            .count();
        if malicious_count >= 2 || risk_score >= thresholds.quarantine_threshold {
            return PolicyVerdict::Quarantine;
        }

        let any_suspicious = live().any(|r| r.verdict == EngineVerdict::Suspicious);
        if any_suspicious || risk_score >= thresholds.review_threshold {
            return PolicyVerdict::NeedsReview;
        }

        PolicyVerdict::Allow
    }

    fn second_opinion_round(
        &self,
        ctx: &ScanContext,
        results: &[EngineResult],
        risk_score: u8,
        config: &vigil_core::VigilConfig,
    ) -> Vec<Arc<dyn Engine>> {
        let so = &config.second_opinion;
        let in_zone = risk_score >= config.thresholds.suspicion_min
            && risk_score <= config.thresholds.suspicion_max;

        let flagged = |name: &str| {
            results
                .iter()
                .find(|r| r.engine_name == name && !r.is_error())
                .map(|r| r.verdict.is_flagged())
        };
        let disagree = matches!(
            (flagged(names::ML), flagged(names::HEURISTIC)),
            (Some(a), Some(b)) if a != b
        );

        let vt_wanted = so.enable_virus_total_second_opinion
            && (in_zone
                || (so.virus_total_when_unsigned_suspicious_path
                    && ctx.is_unsigned()
                    && ctx.location.from_temp_or_appdata));

        let defender_wanted = so.enable_defender_second_opinion
            && (in_zone
                || (so.defender_when_disagree && disagree)
                || (so.defender_when_temp_or_appdata && ctx.location.from_temp_or_appdata));

        self.second_opinion
            .iter()
            .filter(|e| e.is_ready())
            .filter(|e| match e.name() {
                names::VIRUS_TOTAL => vt_wanted,
                names::DEFENDER => defender_wanted,
                _ => in_zone,
            })
            .map(Arc::clone)
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        ctx: &ScanContext,
        risk_score: u8,
        verdict: PolicyVerdict,
        reasons: Vec<String>,
        engine_results: Vec<EngineResult>,
        started: Instant,
        correlation_id: Uuid,
    ) -> AggregatedResult {
        AggregatedResult {
            file_path: ctx.path.clone(),
            risk_score,
            verdict,
            reasons,
            engine_results,
            duration: started.elapsed(),
            scanned_at: chrono::Utc::now(),
            correlation_id,
        }
    }

    fn cache_key_for(ctx: &ScanContext) -> Option<String> {
        let sha256 = ctx.sha256.as_deref()?;
        let mtime = ctx.modified_at?;
        let ticks = mtime.timestamp_nanos_opt()?;
        Some(identity::cache_key(sha256, ctx.file_size, ticks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::plain_context;
    use async_trait::async_trait;
    use vigil_core::config::CacheConfig;
    use vigil_core::VigilConfig;

    /// Scripted engine for aggregation tests.
    struct Scripted {
        name: &'static str,
        weight: f64,
        ready: bool,
        result: EngineResult,
        delay: Duration,
    }

    impl Scripted {
        fn new(name: &'static str, weight: f64, result: EngineResult) -> Arc<Self> {
            Arc::new(Self {
                name,
                weight,
                ready: true,
                result,
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl Engine for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        fn default_weight(&self) -> f64 {
            self.weight
        }

        fn is_ready(&self) -> bool {
            self.ready
        }

        async fn scan(&self, _ctx: &ScanContext, _cancel: &CancellationToken) -> EngineResult {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.result.clone()
        }
    }

    fn aggregator(engines: Vec<Arc<dyn Engine>>) -> Aggregator {
        let config = Arc::new(ConfigService::new(VigilConfig::default()));
        let cache = Arc::new(ScanCache::new(&CacheConfig::default()));
        let mut agg = Aggregator::new(config, cache);
        for engine in engines {
            agg.register(engine);
        }
        agg
    }

    fn ctx_with_identity() -> ScanContext {
        let mut ctx = plain_context("/tmp/subject.exe");
        ctx.sha256 = Some("9".repeat(64));
        ctx
    }

    #[tokio::test]
    async fn test_weighted_average_over_non_error_results() {
        let agg = aggregator(vec![
            Scripted::new(
                "a",
                1.0,
                EngineResult::new("a", 80, EngineVerdict::Suspicious, 0.5),
            ),
            Scripted::new("b", 1.0, EngineResult::new("b", 20, EngineVerdict::Clean, 0.5)),
            Scripted::new("c", 1.0, EngineResult::error("c", "boom")),
        ]);

        let result = agg.scan(&ctx_with_identity(), &CancellationToken::new()).await;
        // (0.5*80 + 0.5*20) / (0.5 + 0.5) = 50; error result contributes nothing.
        assert_eq!(result.risk_score, 50);
    }

    #[tokio::test]
    async fn test_definitive_override_beats_average() {
        let agg = aggregator(vec![
            Scripted::new(
                "sig",
                1.0,
                EngineResult::new("sig", 100, EngineVerdict::Malicious, 1.0),
            ),
            Scripted::new(
                "rep",
                0.5,
                EngineResult::new("rep", 0, EngineVerdict::Clean, 0.5),
            ),
        ]);

        let result = agg.scan(&ctx_with_identity(), &CancellationToken::new()).await;
        assert_eq!(result.risk_score, 100);
        assert_eq!(result.verdict, PolicyVerdict::Block);
    }

    #[tokio::test]
    async fn test_all_errors_scores_zero_allow() {
        let agg = aggregator(vec![
            Scripted::new("a", 1.0, EngineResult::error("a", "x")),
            Scripted::new("b", 1.0, EngineResult::error("b", "y")),
        ]);

        let result = agg.scan(&ctx_with_identity(), &CancellationToken::new()).await;
        assert_eq!(result.risk_score, 0);
        assert_eq!(result.verdict, PolicyVerdict::Allow);
    }

    #[tokio::test]
    async fn test_two_malicious_engines_force_quarantine() {
        let agg = aggregator(vec![
            Scripted::new(
                "a",
                0.3,
                EngineResult::new("a", 60, EngineVerdict::Malicious, 0.6),
            ),
            Scripted::new(
                "b",
                0.3,
                EngineResult::new("b", 55, EngineVerdict::Malicious, 0.6),
            ),
            Scripted::new("c", 1.0, EngineResult::new("c", 0, EngineVerdict::Clean, 0.9)),
        ]);

        let result = agg.scan(&ctx_with_identity(), &CancellationToken::new()).await;
        assert!(result.risk_score < 70, "score {} should stay under quarantine threshold", result.risk_score);
        assert_eq!(result.verdict, PolicyVerdict::Quarantine);
    }

    #[tokio::test]
    async fn test_single_suspicious_needs_review() {
        let agg = aggregator(vec![Scripted::new(
            "a",
            1.0,
            EngineResult::new("a", 36, EngineVerdict::Suspicious, 0.6),
        )]);

        let result = agg.scan(&ctx_with_identity(), &CancellationToken::new()).await;
        assert_eq!(result.verdict, PolicyVerdict::NeedsReview);
    }

    #[tokio::test]
    async fn test_not_ready_engine_skipped() {
        let skipped = Scripted {
            name: "offline",
            weight: 1.0,
            ready: false,
            result: EngineResult::new("offline", 100, EngineVerdict::Malicious, 1.0),
            delay: Duration::ZERO,
        };
        let agg = aggregator(vec![
            Arc::new(skipped),
            Scripted::new("on", 1.0, EngineResult::clean("on", 0.7)),
        ]);

        let result = agg.scan(&ctx_with_identity(), &CancellationToken::new()).await;
        assert_eq!(result.engine_results.len(), 1);
        assert_eq!(result.verdict, PolicyVerdict::Allow);
    }

    #[tokio::test]
    async fn test_pressure_skips_heavy_engines() {
        let agg = aggregator(vec![
            Scripted::new(
                names::ML,
                0.7,
                EngineResult::new(names::ML, 90, EngineVerdict::Malicious, 0.9),
            ),
            Scripted::new(names::SIGNATURE, 1.0, EngineResult::clean(names::SIGNATURE, 0.7)),
        ]);
        agg.set_high_pressure(true);

        let result = agg.scan(&ctx_with_identity(), &CancellationToken::new()).await;
        assert_eq!(result.engine_results.len(), 1);
        assert_eq!(result.engine_results[0].engine_name, names::SIGNATURE);
    }

    #[tokio::test]
    async fn test_reason_dedup_preserves_first_occurrence() {
        let agg = aggregator(vec![
            Scripted::new(
                "a",
                1.0,
                EngineResult::new("a", 40, EngineVerdict::Suspicious, 0.6)
                    .with_reason("suspicious path")
                    .with_reason("unsigned PE"),
            ),
            Scripted::new(
                "b",
                1.0,
                EngineResult::new("b", 40, EngineVerdict::Suspicious, 0.6)
                    .with_reason("unsigned PE")
                    .with_reason("high entropy"),
            ),
        ]);

        let result = agg.scan(&ctx_with_identity(), &CancellationToken::new()).await;
        assert_eq!(
            result.reasons,
            vec!["suspicious path", "unsigned PE", "high entropy"]
        );
    }

    #[tokio::test]
    async fn test_allowlisted_hash_short_circuits() {
        let config = Arc::new(ConfigService::new(VigilConfig::default()));
        config.allowlist_sha256(&"9".repeat(64)).unwrap();
        let cache = Arc::new(ScanCache::new(&CacheConfig::default()));
        let mut agg = Aggregator::new(config, cache);
        agg.register(Scripted::new(
            "sig",
            1.0,
            EngineResult::new("sig", 100, EngineVerdict::Malicious, 1.0),
        ));

        let result = agg.scan(&ctx_with_identity(), &CancellationToken::new()).await;
        assert_eq!(result.verdict, PolicyVerdict::Allow);
        assert!(result.engine_results.is_empty());
        assert_eq!(result.reasons, vec!["allowlisted"]);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_engines() {
        let agg = aggregator(vec![Scripted::new(
            "sig",
            1.0,
            EngineResult::clean("sig", 0.7),
        )]);

        let ctx = ctx_with_identity();
        let first = agg.scan(&ctx, &CancellationToken::new()).await;
        let second = agg.scan(&ctx, &CancellationToken::new()).await;
        assert_eq!(first.correlation_id, second.correlation_id);
    }

    #[tokio::test]
    async fn test_mtime_change_is_cache_miss() {
        let agg = aggregator(vec![Scripted::new(
            "sig",
            1.0,
            EngineResult::clean("sig", 0.7),
        )]);

        let mut ctx = ctx_with_identity();
        let first = agg.scan(&ctx, &CancellationToken::new()).await;

        ctx.modified_at = Some(chrono::Utc::now() + chrono::Duration::seconds(5));
        let second = agg.scan(&ctx, &CancellationToken::new()).await;
        assert_ne!(first.correlation_id, second.correlation_id);
    }

    #[tokio::test]
    async fn test_engine_timeout_becomes_error_result() {
        let config = Arc::new(ConfigService::new(VigilConfig::default()));
        config
            .update_and_persist(|c| c.engines.timeout_secs = 0)
            .unwrap();
        let cache = Arc::new(ScanCache::new(&CacheConfig::default()));
        let mut agg = Aggregator::new(config, cache);
        agg.register(Arc::new(Scripted {
            name: "slow",
            weight: 1.0,
            ready: true,
            result: EngineResult::clean("slow", 0.7),
            delay: Duration::from_millis(250),
        }));

        let result = agg.scan(&ctx_with_identity(), &CancellationToken::new()).await;
        assert_eq!(result.engine_results.len(), 1);
        assert!(result.engine_results[0].is_error());
        assert!(result.engine_results[0]
            .error
            .as_ref()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn test_second_opinion_triggered_in_suspicion_zone() {
        let config = Arc::new(ConfigService::new(VigilConfig::default()));
        config
            .update_and_persist(|c| c.second_opinion.enable_virus_total_second_opinion = true)
            .unwrap();
        let cache = Arc::new(ScanCache::new(&CacheConfig::default()));
        let mut agg = Aggregator::new(config, cache);
        agg.register(Scripted::new(
            "heuristic",
            0.8,
            EngineResult::new("heuristic", 50, EngineVerdict::Suspicious, 0.75),
        ));
        agg.register_second_opinion(Scripted::new(
            names::VIRUS_TOTAL,
            0.9,
            EngineResult::new(names::VIRUS_TOTAL, 90, EngineVerdict::Malicious, 0.9)
                .with_reason("remote reputation: 45/70 engines flagged"),
        ));

        let result = agg.scan(&ctx_with_identity(), &CancellationToken::new()).await;
        assert_eq!(result.engine_results.len(), 2);
        // Confident malicious second opinion escalates to Block.
        assert_eq!(result.verdict, PolicyVerdict::Block);
        assert!(result
            .reasons
            .iter()
            .any(|r| r.contains("remote reputation")));
    }

    #[tokio::test]
    async fn test_second_opinion_suppressed_under_pressure() {
        let config = Arc::new(ConfigService::new(VigilConfig::default()));
        config
            .update_and_persist(|c| c.second_opinion.enable_virus_total_second_opinion = true)
            .unwrap();
        let cache = Arc::new(ScanCache::new(&CacheConfig::default()));
        let mut agg = Aggregator::new(config, cache);
        agg.register(Scripted::new(
            "heuristic",
            0.8,
            EngineResult::new("heuristic", 50, EngineVerdict::Suspicious, 0.75),
        ));
        agg.register_second_opinion(Scripted::new(
            names::VIRUS_TOTAL,
            0.9,
            EngineResult::new(names::VIRUS_TOTAL, 90, EngineVerdict::Malicious, 0.9),
        ));
        agg.set_high_pressure(true);

        let result = agg.scan(&ctx_with_identity(), &CancellationToken::new()).await;
        assert_eq!(result.engine_results.len(), 1);
    }
}
