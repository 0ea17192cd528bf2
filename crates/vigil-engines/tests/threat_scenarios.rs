//! End-to-end detection scenarios over the full engine roster.
//!
//! | Scenario | Coverage |
//! |----------|----------|
//! | EICAR hash hit | signature engine, definitive override, Block verdict |
//! | Planted signature on signed binary | override beats reputation credit |
//! | Fresh unsigned download | reputation-only suspicion |
//! | Identity cache | hit on same identity, miss after mtime change |

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use vigil_core::config::CacheConfig;
use vigil_core::{
    ConfigService, ContextBuilder, PathRules, PolicyVerdict, PrevalenceStore, ScanCache,
    ScanContext, VigilConfig,
};
use vigil_engines::{
    Aggregator, HeuristicEngine, MlEngine, ReputationEngine, ScriptEngine, SignatureDb,
    SignatureEngine, SignatureRecord, EICAR_SHA256,
};

fn standard_aggregator(db: Arc<SignatureDb>) -> Aggregator {
    let config = Arc::new(ConfigService::new(VigilConfig::default()));
    let cache = Arc::new(ScanCache::new(&CacheConfig::default()));
    let prevalence = Arc::new(PrevalenceStore::new());

    let mut agg = Aggregator::new(config, cache);
    agg.register(Arc::new(SignatureEngine::new(db)));
    agg.register(Arc::new(HeuristicEngine::new(PathRules::default())));
    agg.register(Arc::new(MlEngine::default()));
    agg.register(Arc::new(ReputationEngine::new(
        PathRules::default(),
        prevalence,
    )));
    agg.register(Arc::new(ScriptEngine::default()));
    agg
}

fn eicar_context() -> ScanContext {
    let mut ctx = base_context("/home/user/eicar.com", 68);
    ctx.sha256 = Some(EICAR_SHA256.into());
    ctx
}

fn base_context(path: &str, size: u64) -> ScanContext {
    ScanContext {
        path: path.into(),
        file_size: size,
        modified_at: Some(chrono::Utc::now()),
        created_at: Some(chrono::Utc::now() - chrono::Duration::days(10)),
        extension: std::path::Path::new(path)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default(),
        sha256: None,
        md5: None,
        pe_info: None,
        signer_name: None,
        signature_valid: None,
        location: Default::default(),
        prevalence: None,
    }
}

#[tokio::test]
async fn test_eicar_blocks_with_named_reason() {
    let agg = standard_aggregator(Arc::new(SignatureDb::new()));
    let result = agg.scan(&eicar_context(), &CancellationToken::new()).await;

    assert_eq!(result.risk_score, 100);
    assert_eq!(result.verdict, PolicyVerdict::Block);
    assert!(result.reasons.iter().any(|r| r.contains("EICAR-Test-File")));

    let signature = result.engine("signature").unwrap();
    assert!(signature.is_definitive());
}

#[tokio::test]
async fn test_planted_signature_overrides_reputation_credit() {
    let db = Arc::new(SignatureDb::new());
    let planted = "1111111111111111111111111111111111111111111111111111111111111111";
    db.add(SignatureRecord::by_sha256(
        planted,
        "Trojan.Planted",
        "Trojan",
        95,
    ));

    let agg = standard_aggregator(db);
    let mut ctx = base_context(r"c:\program files\vendor\signedtool.exe", 300 * 1024);
    ctx.sha256 = Some(planted.into());
    ctx.signer_name = Some("Microsoft Corporation".into());
    ctx.signature_valid = Some(true);

    let result = agg.scan(&ctx, &CancellationToken::new()).await;
    // Reputation contributes a strong negative adjustment, but the
    // definitive signature match pins the score.
    assert_eq!(result.risk_score, 100);
    assert_eq!(result.verdict, PolicyVerdict::Block);
}

#[tokio::test]
async fn test_fresh_unsigned_download_needs_review() {
    let agg = standard_aggregator(Arc::new(SignatureDb::new()));

    let mut ctx = base_context(r"c:\users\u\downloads\installer.exe", 4 * 1024);
    ctx.sha256 = Some("2".repeat(64));
    ctx.created_at = Some(chrono::Utc::now() - chrono::Duration::seconds(30));
    ctx.pe_info = Some(vigil_core::PeInfo {
        valid: true,
        architecture: "x64".into(),
        section_names: vec![".text".into(), ".data".into(), ".rsrc".into()],
        imported_dlls: vec!["kernel32.dll".into()],
        imported_apis: vec!["CreateFileW".into()],
        entropy: 6.0,
        compile_timestamp: Some(chrono::Utc::now() - chrono::Duration::days(2)),
        has_signature: false,
        overlay_ratio: 0.0,
    });

    let result = agg.scan(&ctx, &CancellationToken::new()).await;

    let reputation = result.engine("reputation").unwrap();
    assert!(reputation.score >= 35, "reputation score {}", reputation.score);
    assert!(reputation.reasons.iter().any(|r| r == "suspicious path"));
    assert!(reputation.reasons.iter().any(|r| r == "unsigned PE"));
    assert!(reputation.reasons.iter().any(|r| r == "newly created"));

    assert!(
        matches!(
            result.verdict,
            PolicyVerdict::NeedsReview | PolicyVerdict::Quarantine
        ),
        "verdict {:?}",
        result.verdict
    );
}

#[tokio::test]
async fn test_cache_identity_hit_and_mtime_miss() {
    let dir = tempfile::TempDir::new().unwrap();
    let file = dir.path().join("stable.bin");
    std::fs::write(&file, b"stable contents").unwrap();

    let agg = standard_aggregator(Arc::new(SignatureDb::new()));
    let ctx = ContextBuilder::new(&file)
        .with_path_rules(&PathRules::default())
        .build()
        .unwrap();

    let first = agg.scan(&ctx, &CancellationToken::new()).await;
    let second = agg.scan(&ctx, &CancellationToken::new()).await;
    assert_eq!(first.correlation_id, second.correlation_id);

    // A touched mtime with identical contents is a different identity.
    let mut touched = ctx.clone();
    touched.modified_at = Some(chrono::Utc::now() + chrono::Duration::seconds(2));
    let third = agg.scan(&touched, &CancellationToken::new()).await;
    assert_ne!(first.correlation_id, third.correlation_id);
}

#[tokio::test]
async fn test_benign_file_allowed() {
    let agg = standard_aggregator(Arc::new(SignatureDb::new()));
    let mut ctx = base_context("/srv/data/report.txt", 2048);
    ctx.sha256 = Some("3".repeat(64));

    let result = agg.scan(&ctx, &CancellationToken::new()).await;
    assert_eq!(result.verdict, PolicyVerdict::Allow);
    assert!(result.risk_score < 40);
}
