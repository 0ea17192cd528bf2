//! The real-time worker pool.
//!
//! Workers drain the bounded queue. Each event runs the quick-gate first
//! (signature, heuristic, script, the cheap engines); a gate hit moves
//! the file into quarantine staging *before* the full scan, so a fast
//! dropper is off disk within the rename budget rather than after a full
//! engine round. Everything else goes through the normal aggregate-then-
//! respond path.
//!
//! ## Ordering
//!
//! No ordering is guaranteed across paths. Per path, an active-set entry
//! keeps at most one gate-plus-scan sequence in flight; a worker that
//! finds its path already claimed skips the event (the coalescer will
//! deliver a fresh one if the file changes again).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use vigil_core::{ConfigService, ContextBuilder, PeParser, ScanContext, VigilError, VigilEvent};
use vigil_engines::{names, Aggregator};
use vigil_quarantine::{QuarantineStore, ThreatDetails};
use vigil_response::{ActionExecutor, ActionOutcome, EventBus};

use crate::coalescer::Coalescer;
use crate::queue::BoundedQueue;
use crate::stats::ScanStats;
use crate::watcher::{EventFilter, EventSink, FileEvent};

/// Engines consulted by the quick-gate.
const QUICK_GATE_ENGINES: &[&str] = &[names::SIGNATURE, names::HEURISTIC, names::SCRIPT];

/// Idle wake cadence so heartbeats advance on a quiet host.
const IDLE_TICK: Duration = Duration::from_millis(500);

struct Shared {
    config: Arc<ConfigService>,
    filter: Arc<EventFilter>,
    coalescer: Arc<Coalescer>,
    queue: Arc<BoundedQueue>,
    aggregator: Arc<Aggregator>,
    executor: Arc<ActionExecutor>,
    store: Arc<QuarantineStore>,
    events: EventBus,
    stats: Arc<ScanStats>,
    active_paths: DashMap<PathBuf, ()>,
    pe_parser: Option<Arc<dyn PeParser>>,
    cancel: CancellationToken,
    worker_cancel: Mutex<CancellationToken>,
    heartbeat: AtomicU64,
    running: AtomicBool,
}

/// The real-time protection pipeline. Clones share one pipeline.
#[derive(Clone)]
pub struct RealtimePipeline {
    shared: Arc<Shared>,
}

impl RealtimePipeline {
    /// Wires a pipeline over the shared services. Call
    /// [`start`](Self::start) to spawn the pump and workers.
    #[must_use]
    pub fn new(
        config: Arc<ConfigService>,
        aggregator: Arc<Aggregator>,
        executor: Arc<ActionExecutor>,
        store: Arc<QuarantineStore>,
        events: EventBus,
        stats: Arc<ScanStats>,
        pe_parser: Option<Arc<dyn PeParser>>,
    ) -> Self {
        let snapshot = config.snapshot();
        let cancel = CancellationToken::new();
        Self {
            shared: Arc::new(Shared {
                filter: Arc::new(EventFilter::from_scoping(&snapshot.scoping)),
                coalescer: Arc::new(Coalescer::new(Duration::from_millis(
                    snapshot.pipeline.event_coalesce_ms,
                ))),
                queue: Arc::new(BoundedQueue::new(snapshot.pipeline.queue_capacity)),
                worker_cancel: Mutex::new(cancel.child_token()),
                cancel,
                config,
                aggregator,
                executor,
                store,
                events,
                stats,
                active_paths: DashMap::new(),
                pe_parser,
                heartbeat: AtomicU64::new(0),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// The sink watcher adapters push events through.
    #[must_use]
    pub fn sink(&self) -> EventSink {
        EventSink::new(
            Arc::clone(&self.shared.filter),
            Arc::clone(&self.shared.coalescer),
        )
    }

    /// Spawns the coalescer pump and the worker pool.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let workers = self.worker_count();
        info!(workers, "real-time pipeline starting");

        // Pump: releases coalesced events into the bounded queue.
        {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                let tick = shared.coalescer.tick_interval();
                loop {
                    tokio::select! {
                        _ = shared.cancel.cancelled() => break,
                        _ = tokio::time::sleep(tick) => {}
                    }
                    for event in shared.coalescer.drain_ready() {
                        shared.queue.try_push(event);
                    }
                }
            });
        }

        self.spawn_workers(workers);
    }

    /// Stops everything; in-flight engine calls observe the cancellation.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.cancel.cancel();
        info!("real-time pipeline stopped");
    }

    /// Tears down the current worker generation and spawns a fresh one.
    /// Used by the watchdog when heartbeats stall.
    pub fn respawn_workers(&self) {
        let workers = self.worker_count();
        {
            let mut generation = self
                .shared
                .worker_cancel
                .lock()
                .expect("worker generation lock poisoned");
            generation.cancel();
            *generation = self.shared.cancel.child_token();
        }
        warn!(workers, "worker pool respawned");
        self.spawn_workers(workers);
    }

    /// Events waiting anywhere ahead of the workers.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.queue.len() + self.shared.coalescer.len()
    }

    /// Monotonic liveness counter; advances while any worker is alive.
    #[must_use]
    pub fn heartbeat(&self) -> u64 {
        self.shared.heartbeat.load(Ordering::Relaxed)
    }

    /// Whether the pipeline is accepting and processing events.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst) && !self.shared.cancel.is_cancelled()
    }

    fn worker_count(&self) -> usize {
        let configured = self.shared.config.snapshot().pipeline.scan_workers.max(1);
        let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        configured.min(cpus)
    }

    fn spawn_workers(&self, count: usize) {
        let generation = self
            .shared
            .worker_cancel
            .lock()
            .expect("worker generation lock poisoned")
            .clone();
        for worker_id in 0..count {
            let shared = Arc::clone(&self.shared);
            let generation = generation.clone();
            tokio::spawn(async move {
                debug!(worker_id, "worker started");
                worker_loop(shared, generation, worker_id).await;
                debug!(worker_id, "worker exited");
            });
        }
    }
}

async fn worker_loop(shared: Arc<Shared>, generation: CancellationToken, worker_id: usize) {
    loop {
        shared.heartbeat.fetch_add(1, Ordering::Relaxed);
        let event = tokio::select! {
            _ = generation.cancelled() => break,
            _ = tokio::time::sleep(IDLE_TICK) => continue,
            event = shared.queue.pop() => event,
        };
        process_event(&shared, &generation, event, worker_id).await;
    }
}

async fn process_event(
    shared: &Arc<Shared>,
    cancel: &CancellationToken,
    event: FileEvent,
    worker_id: usize,
) {
    let path = event.path.clone();
    if !shared.filter.admits(&path) {
        return;
    }

    // Filter on current filesystem state, not the event's.
    let snapshot = shared.config.snapshot();
    let metadata = match std::fs::metadata(&path) {
        Ok(metadata) if metadata.is_file() => metadata,
        // Vanished between event and worker: drop silently.
        _ => {
            trace!(path = %path.display(), "file gone before scan");
            return;
        }
    };
    if metadata.len() > snapshot.scoping.max_file_size_bytes() {
        return;
    }
    if let Some(ext) = path.extension() {
        let lowered = ext.to_string_lossy().to_lowercase();
        if snapshot.scoping.excluded_extensions.iter().any(|e| *e == lowered) {
            return;
        }
    }

    // Per-path serialization: one in-flight sequence per path.
    if shared.active_paths.insert(path.clone(), ()).is_some() {
        trace!(path = %path.display(), "path already under scan, skipping event");
        return;
    }
    let _guard = ActiveGuard {
        set: &shared.active_paths,
        path: path.clone(),
    };

    // Pressure mode engages here; the watchdog releases it.
    if shared.queue.len() >= snapshot.pipeline.high_pressure_threshold {
        shared.aggregator.set_high_pressure(true);
    }

    let ctx = match build_context(shared, &path, &snapshot) {
        Ok(ctx) => ctx,
        Err(VigilError::Io { source, .. })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            return;
        }
        Err(e) => {
            warn!(worker_id, path = %path.display(), error = %e, "context build failed");
            shared.events.emit(VigilEvent::ScanError {
                path,
                kind: e.to_string(),
            });
            return;
        }
    };

    // Quick-gate round over the cheap engines.
    let gate_results = shared
        .aggregator
        .run_named(QUICK_GATE_ENGINES, &ctx, cancel)
        .await;
    let gate_score = shared.aggregator.weighted_score(&gate_results);

    if gate_score >= snapshot.thresholds.quick_gate_threshold {
        debug!(path = %path.display(), gate_score, "quick-gate hit, quarantining before full scan");
        quarantine_first(shared, cancel, &ctx, gate_score).await;
        return;
    }

    // Normal path: full aggregation, then policy.
    let result = shared.aggregator.scan(&ctx, cancel).await;
    shared.stats.record_scan();
    if result.verdict.is_allowed() {
        return;
    }
    shared.stats.record_threat();

    match shared.executor.apply(&ctx, &result, None) {
        Ok(outcome) => {
            shared.events.emit(VigilEvent::ThreatDetected {
                path: ctx.path.clone(),
                name: result.threat_name().map(ToOwned::to_owned),
                verdict: result.verdict,
                risk_score: result.risk_score,
                auto_quarantined: matches!(outcome, ActionOutcome::Quarantined(_)),
                failure: None,
            });
        }
        Err(e) => {
            warn!(%result.correlation_id, path = %ctx.path.display(), error = %e, "action failed");
            shared.events.emit(VigilEvent::ThreatDetected {
                path: ctx.path.clone(),
                name: result.threat_name().map(ToOwned::to_owned),
                verdict: result.verdict,
                risk_score: result.risk_score,
                auto_quarantined: false,
                failure: Some(e.to_string()),
            });
        }
    }
}

/// Quick-gate response: atomic move into staging, full scan on the moved
/// file, then commit with the full results. The emitted event references
/// the original path.
async fn quarantine_first(
    shared: &Arc<Shared>,
    cancel: &CancellationToken,
    ctx: &ScanContext,
    gate_score: u8,
) {
    let original_path = ctx.path.clone();
    let moved = match shared.store.try_atomic_move(&original_path) {
        Ok(moved) => moved,
        Err(e) => {
            warn!(path = %original_path.display(), error = %e, "quick-gate move failed");
            shared.events.emit(VigilEvent::ThreatDetected {
                path: original_path,
                name: None,
                verdict: vigil_core::PolicyVerdict::Quarantine,
                risk_score: gate_score,
                auto_quarantined: false,
                failure: Some(e.to_string()),
            });
            return;
        }
    };

    // Full scan runs against the staged plaintext.
    let snapshot = shared.config.snapshot();
    let staged_ctx = match build_context(shared, &moved.staging_path, &snapshot) {
        Ok(mut staged) => {
            // Engines should reason about where the file lived, not the
            // vault: restore the original path and its location flags.
            let lowered = original_path.to_string_lossy().to_lowercase();
            staged.location = vigil_core::LocationFlags {
                from_temp_or_appdata: snapshot.paths.is_temp_or_appdata(&lowered),
                in_startup_path: snapshot.paths.is_startup(&lowered),
                in_quarantine_root: false,
            };
            staged.path = original_path.clone();
            staged
        }
        Err(e) => {
            warn!(error = %e, "staged context build failed, keeping gate verdict");
            ctx.clone()
        }
    };
    let result = shared.aggregator.scan(&staged_ctx, cancel).await;
    shared.stats.record_scan();
    shared.stats.record_threat();

    let mut details = ThreatDetails::from(&result);
    if details.reasons.is_empty() {
        details.reasons.push(format!("quick-gate score {gate_score}"));
    }
    match shared.store.complete(moved, details) {
        Ok(entry) => {
            shared.events.emit(VigilEvent::ThreatDetected {
                path: original_path,
                name: entry.threat_name.clone(),
                verdict: result.verdict.max(vigil_core::PolicyVerdict::Quarantine),
                risk_score: result.risk_score.max(gate_score),
                auto_quarantined: true,
                failure: None,
            });
        }
        Err(e) => {
            warn!(error = %e, "quarantine commit failed");
            shared.events.emit(VigilEvent::ThreatDetected {
                path: original_path,
                name: None,
                verdict: vigil_core::PolicyVerdict::Quarantine,
                risk_score: gate_score,
                auto_quarantined: false,
                failure: Some(e.to_string()),
            });
        }
    }
}

fn build_context(
    shared: &Arc<Shared>,
    path: &Path,
    snapshot: &vigil_core::VigilConfig,
) -> vigil_core::Result<ScanContext> {
    let mut builder = ContextBuilder::new(path)
        .with_path_rules(&snapshot.paths)
        .with_quarantine_root(&snapshot.scoping.quarantine_path);
    if let Some(parser) = &shared.pe_parser {
        builder = builder.with_pe_parser(parser.as_ref());
    }
    builder.build()
}

struct ActiveGuard<'a> {
    set: &'a DashMap<PathBuf, ()>,
    path: PathBuf,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.path);
    }
}
