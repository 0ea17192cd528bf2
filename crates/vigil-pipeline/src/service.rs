//! The Vigil service facade.
//!
//! Owns every component (configuration, engines, aggregator, quarantine
//! store, response executor, real-time pipeline, watchdog, scan jobs)
//! and exposes the control surface the host (IPC layer or CLI) calls.
//! All components are explicitly constructed here and handed to their
//! collaborators; nothing is process-global.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use vigil_core::{
    AggregatedResult, ConfigService, ContextBuilder, PeParser, PrevalenceStore, Result, ScanCache,
    ThreatAction, VigilError, VigilEvent,
};
use vigil_engines::{
    Aggregator, ExternalScannerConfig, ExternalScannerEngine, HeuristicEngine,
    HttpReputationClient, MlEngine, ReputationEngine, ScriptEngine, SignatureDb, SignatureEngine,
    VirusTotalEngine,
};
use vigil_quarantine::{QuarantineEntry, QuarantineStore};
use vigil_response::{ActionExecutor, ActionOutcome, EventBus, PendingRegistry};

use crate::scan_job::{JobServices, ScanJobManager, ScanJobProgress};
use crate::stats::ScanStats;
use crate::watchdog::{HealthState, Watchdog};
use crate::watcher::EventSink;
use crate::workers::RealtimePipeline;

/// Snapshot of service health and totals.
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    /// Whether real-time protection is running.
    pub realtime_enabled: bool,
    /// Watchdog's latest health judgment (when real-time is running).
    pub health: Option<HealthState>,
    /// Events pending ahead of the real-time workers.
    pub pending_events: usize,
    /// Detections waiting on a user decision.
    pub pending_decisions: usize,
    /// Entries currently in quarantine.
    pub quarantine_entries: usize,
    /// Files scanned since start.
    pub files_scanned: u64,
    /// Threats found since start.
    pub threats_found: u64,
}

/// The assembled detection-and-response service.
pub struct VigilService {
    config: Arc<ConfigService>,
    aggregator: Arc<Aggregator>,
    store: Arc<QuarantineStore>,
    executor: Arc<ActionExecutor>,
    pending: Arc<PendingRegistry>,
    signature_db: Arc<SignatureDb>,
    prevalence: Arc<PrevalenceStore>,
    events: EventBus,
    stats: Arc<ScanStats>,
    jobs: ScanJobManager,
    pe_parser: Option<Arc<dyn PeParser>>,
    pipeline: Mutex<Option<RealtimePipeline>>,
    health: Arc<Mutex<Option<HealthState>>>,
}

impl VigilService {
    /// Builds the service: opens the stores under `data_dir`, registers
    /// the engine roster, and runs quarantine recovery. Real-time
    /// protection starts disabled.
    pub fn new(config: Arc<ConfigService>, data_dir: &Path) -> Result<Self> {
        Self::with_pe_parser(config, data_dir, None)
    }

    /// Same as [`new`](Self::new) with an explicit PE parser collaborator.
    pub fn with_pe_parser(
        config: Arc<ConfigService>,
        data_dir: &Path,
        pe_parser: Option<Arc<dyn PeParser>>,
    ) -> Result<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| VigilError::io(data_dir, e))?;

        // Anchor a relative quarantine root under the data directory so
        // the exclusion filter and the store agree on one absolute path.
        let snapshot = config.snapshot();
        if snapshot.scoping.quarantine_path.is_relative() {
            let resolved = data_dir.join(&snapshot.scoping.quarantine_path);
            config.update_and_persist(|c| c.scoping.quarantine_path = resolved)?;
        }
        let snapshot = config.snapshot();

        let store = Arc::new(QuarantineStore::open(
            &snapshot.scoping.quarantine_path,
            snapshot.atomic_move.clone(),
        )?);
        let report = store.recover();
        if !report.orphan_blobs.is_empty() || !report.orphan_metadata.is_empty() {
            warn!(
                orphan_blobs = report.orphan_blobs.len(),
                orphan_metadata = report.orphan_metadata.len(),
                "quarantine recovery found orphans"
            );
        }

        let signature_db = Arc::new(SignatureDb::open(data_dir.join("signatures.json")));
        let prevalence = Arc::new(PrevalenceStore::open(data_dir.join("prevalence.json")));
        let cache = Arc::new(ScanCache::new(&snapshot.cache));

        let mut aggregator = Aggregator::new(Arc::clone(&config), cache);
        aggregator.register(Arc::new(SignatureEngine::new(Arc::clone(&signature_db))));
        aggregator.register(Arc::new(HeuristicEngine::new(snapshot.paths.clone())));
        aggregator.register(Arc::new(MlEngine::default()));
        aggregator.register(Arc::new(ReputationEngine::new(
            snapshot.paths.clone(),
            Arc::clone(&prevalence),
        )));
        aggregator.register(Arc::new(ScriptEngine::default()));

        if let Some(command) = &snapshot.second_opinion.defender_command {
            aggregator.register_second_opinion(Arc::new(ExternalScannerEngine::new(
                ExternalScannerConfig::new(command, snapshot.second_opinion.defender_args.clone()),
                snapshot.second_opinion.enable_defender_second_opinion,
            )));
        }
        aggregator.register_second_opinion(Arc::new(VirusTotalEngine::new(
            Arc::new(HttpReputationClient::new(
                snapshot.second_opinion.virus_total_base_url.clone(),
                snapshot.second_opinion.virus_total_api_key.clone(),
            )),
            snapshot.second_opinion.enable_virus_total_second_opinion,
        )));
        let aggregator = Arc::new(aggregator);

        let events = EventBus::new();
        let pending = Arc::new(PendingRegistry::new());
        let executor = Arc::new(ActionExecutor::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&pending),
            events.clone(),
        ));

        info!(data_dir = %data_dir.display(), "vigil service assembled");
        Ok(Self {
            config,
            aggregator,
            store,
            executor,
            pending,
            signature_db,
            prevalence,
            events,
            stats: Arc::new(ScanStats::default()),
            jobs: ScanJobManager::new(),
            pe_parser,
            pipeline: Mutex::new(None),
            health: Arc::new(Mutex::new(None)),
        })
    }

    /// Starts real-time protection and its watchdog. Idempotent.
    pub fn enable_realtime(&self) {
        let mut slot = self.pipeline.lock().expect("pipeline lock poisoned");
        if slot.is_some() {
            return;
        }

        let pipeline = RealtimePipeline::new(
            Arc::clone(&self.config),
            Arc::clone(&self.aggregator),
            Arc::clone(&self.executor),
            Arc::clone(&self.store),
            self.events.clone(),
            Arc::clone(&self.stats),
            self.pe_parser.clone(),
        );
        pipeline.start();

        // Watchdog loop; exits when the pipeline shuts down.
        {
            let pipeline = pipeline.clone();
            let aggregator = Arc::clone(&self.aggregator);
            let health = Arc::clone(&self.health);
            let mut watchdog = Watchdog::new(self.config.snapshot().watchdog.clone());
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(watchdog.interval()).await;
                    if !pipeline.is_running() {
                        break;
                    }
                    let state = watchdog.tick(&pipeline, &aggregator);
                    *health.lock().expect("health lock poisoned") = Some(state);
                }
            });
        }

        *slot = Some(pipeline);
        info!("real-time protection enabled");
    }

    /// Stops real-time protection. Idempotent.
    pub fn disable_realtime(&self) {
        let mut slot = self.pipeline.lock().expect("pipeline lock poisoned");
        if let Some(pipeline) = slot.take() {
            pipeline.shutdown();
        }
        *self.health.lock().expect("health lock poisoned") = None;
        info!("real-time protection disabled");
    }

    /// The sink watcher adapters feed, while real-time is enabled.
    #[must_use]
    pub fn event_sink(&self) -> Option<EventSink> {
        self.pipeline
            .lock()
            .expect("pipeline lock poisoned")
            .as_ref()
            .map(RealtimePipeline::sink)
    }

    /// Starts an on-demand scan over `paths`, returning the job id.
    pub fn scan_path(&self, paths: Vec<PathBuf>) -> Uuid {
        self.jobs.start(
            paths,
            JobServices {
                config: Arc::clone(&self.config),
                aggregator: Arc::clone(&self.aggregator),
                executor: Arc::clone(&self.executor),
                events: self.events.clone(),
                stats: Arc::clone(&self.stats),
                pe_parser: self.pe_parser.clone(),
            },
        )
    }

    /// Stops one scan job, or every job when `job_id` is `None`.
    pub fn stop_scan(&self, job_id: Option<Uuid>) -> bool {
        match job_id {
            Some(id) => self.jobs.stop(id),
            None => {
                self.jobs.stop_all();
                true
            }
        }
    }

    /// Progress of one scan job.
    #[must_use]
    pub fn get_scan_progress(&self, job_id: Uuid) -> Option<ScanJobProgress> {
        self.jobs.progress(job_id)
    }

    /// Scans a single file inline and applies response policy.
    ///
    /// The synchronous little sibling of [`scan_path`](Self::scan_path),
    /// used by the CLI and tests.
    pub async fn scan_file(&self, path: &Path) -> Result<AggregatedResult> {
        let snapshot = self.config.snapshot();
        let mut builder = ContextBuilder::new(path)
            .with_path_rules(&snapshot.paths)
            .with_quarantine_root(&snapshot.scoping.quarantine_path);
        if let Some(parser) = &self.pe_parser {
            builder = builder.with_pe_parser(parser.as_ref());
        }
        let ctx = builder.build()?;

        let result = self.aggregator.scan(&ctx, &CancellationToken::new()).await;
        self.stats.record_scan();
        if result.verdict.is_threat() {
            self.stats.record_threat();
            self.executor.apply(&ctx, &result, None)?;
        }
        Ok(result)
    }

    /// Summaries of everything in quarantine, newest first.
    #[must_use]
    pub fn list_quarantine(&self) -> Vec<QuarantineEntry> {
        self.store.list()
    }

    /// Restores a quarantine entry.
    pub fn restore_quarantine(&self, id: Uuid, restore_path: Option<&Path>) -> Result<PathBuf> {
        self.store.restore(id, restore_path)
    }

    /// Permanently deletes a quarantine entry.
    pub fn delete_quarantine(&self, id: Uuid) -> Result<()> {
        self.store.delete(id)
    }

    /// Resolves a pending threat decision.
    pub fn resolve_threat(
        &self,
        event_id: Uuid,
        action: ThreatAction,
        add_to_exclusions: bool,
    ) -> Result<ActionOutcome> {
        self.executor.resolve(event_id, action, add_to_exclusions)
    }

    /// Detections currently waiting on the user.
    #[must_use]
    pub fn list_pending_threats(&self) -> Vec<vigil_core::PendingSummary> {
        self.pending.list()
    }

    /// Subscribes to the outbound event stream.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<VigilEvent> {
        self.events.subscribe()
    }

    /// Current service status.
    #[must_use]
    pub fn status(&self) -> ServiceStatus {
        let pipeline = self.pipeline.lock().expect("pipeline lock poisoned");
        ServiceStatus {
            realtime_enabled: pipeline.as_ref().is_some_and(RealtimePipeline::is_running),
            health: *self.health.lock().expect("health lock poisoned"),
            pending_events: pipeline.as_ref().map_or(0, RealtimePipeline::pending_count),
            pending_decisions: self.pending.len(),
            quarantine_entries: self.store.list().iter().filter(|e| !e.restored).count(),
            files_scanned: self.stats.files_scanned(),
            threats_found: self.stats.threats_found(),
        }
    }

    /// The signature database, for imports and direct additions.
    #[must_use]
    pub fn signature_db(&self) -> &Arc<SignatureDb> {
        &self.signature_db
    }

    /// The live configuration service.
    #[must_use]
    pub fn config(&self) -> &Arc<ConfigService> {
        &self.config
    }

    /// Persists the mutable stores (signatures, prevalence). Called on
    /// shutdown; persistence failures are logged, never fatal.
    pub fn flush(&self) {
        if let Err(e) = self.signature_db.save() {
            warn!(error = %e, "signature db flush failed");
        }
        if let Err(e) = self.prevalence.save() {
            warn!(error = %e, "prevalence flush failed");
        }
    }
}

impl Drop for VigilService {
    fn drop(&mut self) {
        self.disable_realtime();
        self.jobs.stop_all();
    }
}
