//! # Vigil Pipeline
//!
//! Real-time protection and on-demand scanning for the Vigil engine.
//!
//! ## Real-Time Data Flow
//!
//! ```text
//! watcher adapter ──▶ EventSink (exclusion filter)
//!                          │
//!                     Coalescer (per-path debounce)
//!                          │
//!                    BoundedQueue (drop-oldest)
//!                          │
//!                    worker pool ──▶ quick-gate ──▶ atomic move ──▶ full scan
//!                          │              │
//!                          │          (below gate)
//!                          ▼              ▼
//!                     Aggregator ──▶ ActionExecutor ──▶ events
//! ```
//!
//! The watchdog ticks beside the pool: stalled heartbeats respawn the
//! workers (bounded per rolling window), and backlog drives the
//! degraded-mode hysteresis that sheds heavy engines.
//!
//! ## Ordering Guarantees
//!
//! Per path, the `coalesce → filter → (gate → move → scan) | scan →
//! action` sequence is strict and serialized through the active-set.
//! Across paths, none.

pub mod coalescer;
pub mod queue;
pub mod scan_job;
pub mod service;
pub mod stats;
pub mod watcher;
pub mod watchdog;
pub mod workers;

pub use coalescer::Coalescer;
pub use queue::{BoundedQueue, PushOutcome};
pub use scan_job::{JobServices, JobStatus, ScanJobManager, ScanJobProgress};
pub use service::{ServiceStatus, VigilService};
pub use stats::ScanStats;
pub use watcher::{ChangeKind, EventFilter, EventSink, FileEvent};
pub use watchdog::{HealthState, PipelineProbe, Watchdog};
pub use workers::RealtimePipeline;
