//! Watchdog and degraded-mode controller.
//!
//! Every tick the watchdog checks two things:
//!
//! 1. **Liveness**: the worker pool's heartbeat must have advanced since
//!    the previous tick. A stalled pool is torn down and respawned;
//!    restarts are counted in a rolling window, and exceeding the limit
//!    inside one window is a fatal health condition.
//! 2. **Backlog**: pending events drive the degraded-mode hysteresis;
//!    engage at `degraded_threshold`, release at
//!    `degraded_recovery_threshold`. Degraded mode sets the aggregator's
//!    high-pressure flag, shedding heavy engines and second opinions.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use vigil_core::config::WatchdogConfig;
use vigil_engines::Aggregator;

use crate::workers::RealtimePipeline;

/// Overall pipeline health as judged by the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Workers alive, backlog nominal.
    Healthy,
    /// Backlog past the degraded threshold; fidelity reduced.
    Degraded,
    /// Restart limit exceeded inside the rolling window.
    Fatal,
}

/// View of the pipeline the watchdog needs. Kept narrow so the watchdog
/// never owns the pipeline (no ownership cycle) and tests can probe it
/// with a scripted fake.
pub trait PipelineProbe {
    /// Whether the pipeline claims to be running.
    fn is_running(&self) -> bool;
    /// Monotonic worker liveness counter.
    fn heartbeat(&self) -> u64;
    /// Events pending ahead of the workers.
    fn pending_count(&self) -> usize;
    /// Tears down and recreates the worker pool.
    fn respawn_workers(&self);
}

impl PipelineProbe for RealtimePipeline {
    fn is_running(&self) -> bool {
        RealtimePipeline::is_running(self)
    }

    fn heartbeat(&self) -> u64 {
        RealtimePipeline::heartbeat(self)
    }

    fn pending_count(&self) -> usize {
        RealtimePipeline::pending_count(self)
    }

    fn respawn_workers(&self) {
        RealtimePipeline::respawn_workers(self);
    }
}

/// The liveness and pressure controller.
pub struct Watchdog {
    config: WatchdogConfig,
    restarts: VecDeque<Instant>,
    last_heartbeat: Option<u64>,
    degraded: bool,
    fatal: bool,
}

impl Watchdog {
    /// Creates a watchdog with the given configuration.
    #[must_use]
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            restarts: VecDeque::new(),
            last_heartbeat: None,
            degraded: false,
            fatal: false,
        }
    }

    /// The configured tick interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.config.interval_ms)
    }

    /// Whether degraded mode is currently engaged.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Restarts recorded inside the current rolling window.
    #[must_use]
    pub fn restarts_in_window(&self) -> usize {
        self.restarts.len()
    }

    /// Runs one watchdog cycle.
    ///
    /// Fatal is sticky: once the restart limit is exceeded, every further
    /// tick reports [`HealthState::Fatal`] without touching the pipeline.
    pub fn tick(&mut self, pipeline: &dyn PipelineProbe, aggregator: &Aggregator) -> HealthState {
        if self.fatal {
            return HealthState::Fatal;
        }

        self.check_liveness(pipeline);
        if self.fatal {
            return HealthState::Fatal;
        }

        self.check_pressure(pipeline, aggregator);
        if self.degraded {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }

    fn check_liveness(&mut self, pipeline: &dyn PipelineProbe) {
        let heartbeat = pipeline.heartbeat();
        let stalled = pipeline.is_running() && self.last_heartbeat == Some(heartbeat);
        self.last_heartbeat = Some(heartbeat);
        if !stalled {
            return;
        }

        let now = Instant::now();
        let window = Duration::from_secs(self.config.restart_window_secs);
        while self
            .restarts
            .front()
            .is_some_and(|at| now.duration_since(*at) > window)
        {
            self.restarts.pop_front();
        }

        if self.restarts.len() as u32 >= self.config.restart_limit {
            error!(
                restarts = self.restarts.len(),
                window_secs = self.config.restart_window_secs,
                "restart limit exceeded, pipeline health is fatal"
            );
            self.fatal = true;
            return;
        }

        warn!(heartbeat, "worker heartbeat stalled, respawning pool");
        pipeline.respawn_workers();
        self.restarts.push_back(now);
    }

    fn check_pressure(&mut self, pipeline: &dyn PipelineProbe, aggregator: &Aggregator) {
        let pending = pipeline.pending_count();
        if !self.degraded && pending >= self.config.degraded_threshold {
            info!(pending, "entering degraded mode");
            self.degraded = true;
            aggregator.set_high_pressure(true);
        } else if self.degraded && pending <= self.config.degraded_recovery_threshold {
            info!(pending, "leaving degraded mode");
            self.degraded = false;
            aggregator.set_high_pressure(false);
        }
    }
}
