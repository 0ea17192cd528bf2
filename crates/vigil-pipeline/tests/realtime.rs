//! End-to-end pipeline scenarios.
//!
//! | Scenario | Coverage |
//! |----------|----------|
//! | EICAR dropped in watched folder | ingress → coalesce → queue → quick-gate → atomic move → event |
//! | Ask-user resolution | pending decision → allowlist → engine-free rescan |
//! | Quarantine round-trip via service | restore returns identical bytes |
//! | On-demand job | enumerate → scan → completion event |

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::Receiver;

use vigil_core::{ActionMode, ConfigService, ThreatAction, VigilConfig, VigilEvent};
use vigil_engines::EICAR_SHA256;
use vigil_pipeline::{ChangeKind, FileEvent, VigilService};

/// The EICAR test string, the only bytes whose SHA-256 matches the
/// built-in signature record.
const EICAR: &[u8] =
    br#"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*"#;

fn test_config(mode: ActionMode) -> VigilConfig {
    let mut config = VigilConfig::default();
    config.action.real_time_action_mode = mode;
    config.pipeline.event_coalesce_ms = 10;
    config.pipeline.scan_workers = 2;
    config
}

fn service_in(dir: &Path, mode: ActionMode) -> VigilService {
    let config = Arc::new(ConfigService::new(test_config(mode)));
    VigilService::new(config, &dir.join("data")).unwrap()
}

async fn next_event(rx: &mut Receiver<VigilEvent>, wanted: &str) -> VigilEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.expect("event stream closed");
            if event.name() == wanted {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no '{wanted}' event within timeout"))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_eicar_sha256_matches_builtin_signature() {
    // Guard for the constant the other tests rely on.
    assert_eq!(vigil_core::identity::hash_bytes(EICAR).sha256, EICAR_SHA256);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_realtime_quick_gate_quarantines_dropped_eicar() {
    let dir = tempfile::TempDir::new().unwrap();
    let service = service_in(dir.path(), ActionMode::AutoQuarantine);
    let mut rx = service.subscribe();
    service.enable_realtime();

    let dropped = dir.path().join("watched").join("payload.com");
    std::fs::create_dir_all(dropped.parent().unwrap()).unwrap();
    std::fs::write(&dropped, EICAR).unwrap();

    service
        .event_sink()
        .unwrap()
        .submit(FileEvent::now(&dropped, ChangeKind::Created));

    let event = next_event(&mut rx, "threat_detected").await;
    let VigilEvent::ThreatDetected {
        path,
        auto_quarantined,
        risk_score,
        name,
        ..
    } = event
    else {
        unreachable!()
    };

    // The event references the ORIGINAL path, and the file is gone from it.
    assert_eq!(path, dropped);
    assert!(auto_quarantined);
    assert_eq!(risk_score, 100);
    assert!(name.unwrap().contains("EICAR-Test-File"));
    assert!(!dropped.exists());

    let entries = service.list_quarantine();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].original_path, dropped);
    assert_eq!(entries[0].sha256, EICAR_SHA256);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_quarantine_restore_roundtrip_via_service() {
    let dir = tempfile::TempDir::new().unwrap();
    let service = service_in(dir.path(), ActionMode::AutoQuarantine);

    let sample = dir.path().join("sample.com");
    std::fs::write(&sample, EICAR).unwrap();

    let result = service.scan_file(&sample).await.unwrap();
    assert_eq!(result.risk_score, 100);
    assert!(!sample.exists(), "auto-quarantine removed the original");

    let entry = &service.list_quarantine()[0];
    let restored_to = service.restore_quarantine(entry.id, None).unwrap();
    assert_eq!(restored_to, sample);
    assert_eq!(std::fs::read(&sample).unwrap(), EICAR);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ask_user_flow_allowlists_and_skips_engines() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = {
        let mut config = test_config(ActionMode::AskUser);
        config.action.ask_user_min_score = 20;
        config.action.auto_quarantine_min_score = 70;
        Arc::new(ConfigService::new(config))
    };
    let service = VigilService::new(config, &dir.path().join("data")).unwrap();
    let mut rx = service.subscribe();

    // A dropper-looking script lands mid-band: suspicious but not definitive.
    let script = dir.path().join("fetch.ps1");
    std::fs::write(
        &script,
        "powershell -nop -w hidden -c [Convert]::FromBase64String($x)",
    )
    .unwrap();

    let result = service.scan_file(&script).await.unwrap();
    assert!(
        result.risk_score >= 20 && result.risk_score < 70,
        "score {} outside the ask band",
        result.risk_score
    );
    assert!(script.exists(), "ask-user leaves the file in place");

    let event = next_event(&mut rx, "threat_action_required").await;
    let VigilEvent::ThreatActionRequired(pending) = event else {
        unreachable!()
    };
    assert_eq!(service.list_pending_threats().len(), 1);

    service
        .resolve_threat(pending.event_id, ThreatAction::Allow, true)
        .unwrap();
    assert!(service.list_pending_threats().is_empty());

    let sha256 = pending.sha256.unwrap();
    assert!(service.config().is_allowlisted(&sha256));

    // The allowlist now short-circuits before any engine runs.
    let again = service.scan_file(&script).await.unwrap();
    assert!(again.verdict.is_allowed());
    assert!(again.engine_results.is_empty());
    assert_eq!(again.reasons, vec!["allowlisted"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_on_demand_job_scans_tree_and_completes() {
    let dir = tempfile::TempDir::new().unwrap();
    let service = service_in(dir.path(), ActionMode::AutoQuarantine);
    let mut rx = service.subscribe();

    let tree = dir.path().join("scanme");
    std::fs::create_dir_all(tree.join("nested")).unwrap();
    std::fs::write(tree.join("clean.txt"), b"nothing to see").unwrap();
    std::fs::write(tree.join("nested/also-clean.bin"), b"still nothing").unwrap();
    std::fs::write(tree.join("nested/eicar.com"), EICAR).unwrap();

    let job_id = service.scan_path(vec![tree.clone()]);

    let event = next_event(&mut rx, "scan_completed").await;
    let VigilEvent::ScanCompleted {
        job_id: done_id,
        scanned,
        threats_found,
        ..
    } = event
    else {
        unreachable!()
    };
    assert_eq!(done_id, job_id);
    assert_eq!(scanned, 3);
    assert_eq!(threats_found, 1);

    let progress = service.get_scan_progress(job_id).unwrap();
    assert_eq!(progress.total, 3);
    assert_eq!(progress.threats_found, 1);

    // The threat was auto-quarantined out of the tree.
    assert!(!tree.join("nested/eicar.com").exists());
    assert_eq!(service.status().threats_found, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_vanished_file_dropped_silently() {
    let dir = tempfile::TempDir::new().unwrap();
    let service = service_in(dir.path(), ActionMode::AutoQuarantine);
    service.enable_realtime();

    let ghost = dir.path().join("ghost.exe");
    service
        .event_sink()
        .unwrap()
        .submit(FileEvent::now(&ghost, ChangeKind::Created));

    // Nothing to assert but absence: no panic, no quarantine entry.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(service.list_quarantine().is_empty());
    assert_eq!(service.status().threats_found, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disable_realtime_stops_intake() {
    let dir = tempfile::TempDir::new().unwrap();
    let service = service_in(dir.path(), ActionMode::AutoQuarantine);

    service.enable_realtime();
    assert!(service.status().realtime_enabled);
    let sink = service.event_sink();
    assert!(sink.is_some());

    service.disable_realtime();
    assert!(!service.status().realtime_enabled);
    assert!(service.event_sink().is_none());
}
