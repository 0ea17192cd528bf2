//! On-demand scan jobs.
//!
//! A job enumerates its target paths, scans them on a bounded-parallel
//! worker set, applies response policy to every non-Allow verdict, and
//! reports progress over the event bus. Jobs are cancellable at any
//! point; finished jobs stay queryable until the manager is dropped.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vigil_core::enumerate::{enumerate_files, EnumerateOptions};
use vigil_core::{ConfigService, ContextBuilder, PeParser, VigilEvent};
use vigil_engines::Aggregator;
use vigil_response::{ActionExecutor, EventBus};

use crate::stats::ScanStats;

/// Progress is broadcast every this many scanned files.
const PROGRESS_EVERY: usize = 25;

/// Lifecycle of a scan job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Walking the target paths.
    Enumerating,
    /// Scanning enumerated files.
    Running,
    /// All files processed.
    Completed,
    /// Stopped before completion.
    Cancelled,
}

/// Point-in-time view of a job.
#[derive(Debug, Clone)]
pub struct ScanJobProgress {
    /// Files enumerated for the job.
    pub total: usize,
    /// Files scanned so far.
    pub scanned: usize,
    /// Threats found so far.
    pub threats_found: usize,
    /// File currently under scan.
    pub current_path: Option<PathBuf>,
    /// Job lifecycle state.
    pub status: JobStatus,
}

/// Shared services a job runs against.
#[derive(Clone)]
pub struct JobServices {
    /// Live configuration.
    pub config: Arc<ConfigService>,
    /// The scan aggregator.
    pub aggregator: Arc<Aggregator>,
    /// Response policy executor.
    pub executor: Arc<ActionExecutor>,
    /// Outbound event bus.
    pub events: EventBus,
    /// Global scan counters.
    pub stats: Arc<ScanStats>,
    /// Optional PE parser for context building.
    pub pe_parser: Option<Arc<dyn PeParser>>,
}

struct JobState {
    cancel: CancellationToken,
    total: AtomicUsize,
    scanned: AtomicUsize,
    threats: AtomicUsize,
    current: Mutex<Option<PathBuf>>,
    status: Mutex<JobStatus>,
}

impl JobState {
    fn progress(&self) -> ScanJobProgress {
        ScanJobProgress {
            total: self.total.load(Ordering::Relaxed),
            scanned: self.scanned.load(Ordering::Relaxed),
            threats_found: self.threats.load(Ordering::Relaxed),
            current_path: self.current.lock().expect("job lock poisoned").clone(),
            status: *self.status.lock().expect("job lock poisoned"),
        }
    }

    fn set_status(&self, status: JobStatus) {
        *self.status.lock().expect("job lock poisoned") = status;
    }
}

/// Registry and spawner for on-demand scans.
#[derive(Default)]
pub struct ScanJobManager {
    jobs: DashMap<Uuid, Arc<JobState>>,
}

impl ScanJobManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a job over `roots` and returns its id immediately.
    pub fn start(&self, roots: Vec<PathBuf>, services: JobServices) -> Uuid {
        let job_id = Uuid::new_v4();
        let state = Arc::new(JobState {
            cancel: CancellationToken::new(),
            total: AtomicUsize::new(0),
            scanned: AtomicUsize::new(0),
            threats: AtomicUsize::new(0),
            current: Mutex::new(None),
            status: Mutex::new(JobStatus::Enumerating),
        });
        self.jobs.insert(job_id, Arc::clone(&state));

        tokio::spawn(run_job(job_id, roots, services, state));
        info!(%job_id, "scan job started");
        job_id
    }

    /// Progress for one job.
    #[must_use]
    pub fn progress(&self, job_id: Uuid) -> Option<ScanJobProgress> {
        self.jobs.get(&job_id).map(|state| state.progress())
    }

    /// Cancels one job; returns false for unknown ids.
    pub fn stop(&self, job_id: Uuid) -> bool {
        match self.jobs.get(&job_id) {
            Some(state) => {
                state.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every running job.
    pub fn stop_all(&self) {
        for state in self.jobs.iter() {
            state.cancel.cancel();
        }
    }
}

async fn run_job(job_id: Uuid, roots: Vec<PathBuf>, services: JobServices, state: Arc<JobState>) {
    let started = Instant::now();
    let snapshot = services.config.snapshot();
    let options = EnumerateOptions::from_scoping(&snapshot.scoping);

    // Enumeration walks the disk; keep it off the async workers.
    let files = tokio::task::spawn_blocking({
        let roots = roots.clone();
        move || enumerate_files(&roots, &options)
    })
    .await
    .unwrap_or_default();

    state.total.store(files.len(), Ordering::Relaxed);
    state.set_status(JobStatus::Running);
    debug!(%job_id, total = files.len(), "enumeration finished");

    let parallelism = snapshot.pipeline.scan_workers.max(1);
    let semaphore = Arc::new(Semaphore::new(parallelism));
    let mut tasks = JoinSet::new();

    for path in files {
        if state.cancel.is_cancelled() {
            break;
        }
        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let services = services.clone();
        let state = Arc::clone(&state);
        let snapshot = snapshot.clone();

        tasks.spawn(async move {
            let _permit = permit;
            if state.cancel.is_cancelled() {
                return;
            }
            *state.current.lock().expect("job lock poisoned") = Some(path.clone());

            let mut builder = ContextBuilder::new(&path)
                .with_path_rules(&snapshot.paths)
                .with_quarantine_root(&snapshot.scoping.quarantine_path);
            if let Some(parser) = &services.pe_parser {
                builder = builder.with_pe_parser(parser.as_ref());
            }
            let ctx = match builder.build() {
                Ok(ctx) => ctx,
                Err(e) => {
                    services.events.emit(VigilEvent::ScanError {
                        path,
                        kind: e.to_string(),
                    });
                    return;
                }
            };

            let result = services.aggregator.scan(&ctx, &state.cancel).await;
            services.stats.record_scan();
            let scanned = state.scanned.fetch_add(1, Ordering::Relaxed) + 1;

            if result.verdict.is_threat() {
                state.threats.fetch_add(1, Ordering::Relaxed);
                services.stats.record_threat();
                match services.executor.apply(&ctx, &result, None) {
                    Ok(outcome) => services.events.emit(VigilEvent::ThreatDetected {
                        path: ctx.path.clone(),
                        name: result.threat_name().map(ToOwned::to_owned),
                        verdict: result.verdict,
                        risk_score: result.risk_score,
                        auto_quarantined: matches!(
                            outcome,
                            vigil_response::ActionOutcome::Quarantined(_)
                        ),
                        failure: None,
                    }),
                    Err(e) => {
                        warn!(%job_id, path = %ctx.path.display(), error = %e, "action failed");
                        services.events.emit(VigilEvent::ThreatDetected {
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

            if scanned % PROGRESS_EVERY == 0 {
                let progress = state.progress();
                services.events.emit(VigilEvent::ScanProgress {
                    job_id,
                    total: progress.total,
                    scanned: progress.scanned,
                    threats_found: progress.threats_found,
                    current_path: progress.current_path,
                });
            }
        });
    }

    while tasks.join_next().await.is_some() {}

    let cancelled = state.cancel.is_cancelled();
    state.set_status(if cancelled {
        JobStatus::Cancelled
    } else {
        JobStatus::Completed
    });
    *state.current.lock().expect("job lock poisoned") = None;

    let progress = state.progress();
    services.events.emit(VigilEvent::ScanCompleted {
        job_id,
        scanned: progress.scanned,
        threats_found: progress.threats_found,
        duration: started.elapsed(),
    });
    info!(
        %job_id,
        scanned = progress.scanned,
        threats = progress.threats_found,
        cancelled,
        "scan job finished"
    );
}
