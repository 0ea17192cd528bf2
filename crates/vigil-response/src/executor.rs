//! Policy-driven action executor.
//!
//! Takes an aggregated verdict and applies the configured response mode.
//! The allowlist is consulted before anything else; an allowlisted hash
//! produces no filesystem effect regardless of what the engines said.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use vigil_core::{
    ActionMode, AggregatedResult, ConfigService, PendingSummary, Result, ScanContext,
    ThreatAction, VigilError, VigilEvent,
};
use vigil_quarantine::{QuarantineEntry, QuarantineStore, ThreatDetails};

use crate::events::EventBus;
use crate::pending::{PendingDecision, PendingRegistry};

/// Direct-delete retry attempts before giving up.
const DELETE_RETRIES: u32 = 3;
const DELETE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// What the executor did with a detection.
#[derive(Debug)]
pub enum ActionOutcome {
    /// No action; the reason says why (clean verdict, allowlist).
    Allowed {
        /// Why the file was allowed.
        reason: String,
    },
    /// The file now sits in quarantine.
    Quarantined(QuarantineEntry),
    /// The file was removed permanently.
    Deleted,
    /// A pending decision was queued for the user.
    PendingUser(Uuid),
    /// Below the action thresholds; watched but untouched.
    Monitored,
}

impl ActionOutcome {
    /// The action this outcome corresponds to on the event surface.
    #[must_use]
    pub fn action(&self) -> ThreatAction {
        match self {
            Self::Allowed { .. } => ThreatAction::Allow,
            Self::Quarantined(_) => ThreatAction::Quarantine,
            Self::Deleted => ThreatAction::Delete,
            Self::PendingUser(_) | Self::Monitored => ThreatAction::Monitor,
        }
    }
}

/// Applies response policy to aggregated verdicts.
pub struct ActionExecutor {
    config: Arc<ConfigService>,
    store: Arc<QuarantineStore>,
    pending: Arc<PendingRegistry>,
    events: EventBus,
}

impl ActionExecutor {
    /// Creates the executor.
    #[must_use]
    pub fn new(
        config: Arc<ConfigService>,
        store: Arc<QuarantineStore>,
        pending: Arc<PendingRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            store,
            pending,
            events,
        }
    }

    /// The pending registry this executor feeds.
    #[must_use]
    pub fn pending(&self) -> &Arc<PendingRegistry> {
        &self.pending
    }

    /// Applies policy to one detection.
    ///
    /// `existing_quarantine` carries the entry id when the quick-gate
    /// already moved the file; the executor then decides the entry's
    /// fate instead of touching the original path.
    pub fn apply(
        &self,
        ctx: &ScanContext,
        result: &AggregatedResult,
        existing_quarantine: Option<Uuid>,
    ) -> Result<ActionOutcome> {
        // Allowlist precedes every mode.
        if let Some(sha256) = &ctx.sha256 {
            if self.config.is_allowlisted(sha256) {
                return Ok(ActionOutcome::Allowed {
                    reason: "allowlist".into(),
                });
            }
        }
        if result.verdict.is_allowed() {
            return Ok(ActionOutcome::Allowed {
                reason: "clean verdict".into(),
            });
        }

        let config = self.config.snapshot();
        let outcome = match config.action.real_time_action_mode {
            ActionMode::AutoQuarantine => self.quarantine(ctx, result, existing_quarantine)?,
            ActionMode::AutoBlock => self.delete(ctx, result, existing_quarantine)?,
            ActionMode::AskUser => {
                let definitive = result.engine_results.iter().any(|r| r.is_definitive());
                if result.risk_score >= config.action.auto_quarantine_min_score || definitive {
                    self.quarantine(ctx, result, existing_quarantine)?
                } else if result.risk_score >= config.action.ask_user_min_score {
                    self.queue_pending(ctx, result, existing_quarantine)
                } else {
                    ActionOutcome::Monitored
                }
            }
        };

        if !matches!(outcome, ActionOutcome::PendingUser(_) | ActionOutcome::Monitored) {
            self.events.emit(VigilEvent::ThreatActionApplied {
                pending: self.summary_for(ctx, result, outcome.action()),
                action: outcome.action(),
                success: true,
                detail: None,
            });
        }
        Ok(outcome)
    }

    /// Resolves a pending decision. Removal from the registry is atomic
    /// with applying the chosen action; an absent id is `NotFound`.
    pub fn resolve(
        &self,
        event_id: Uuid,
        action: ThreatAction,
        add_to_exclusions: bool,
    ) -> Result<ActionOutcome> {
        let decision = self.pending.take(event_id).ok_or(VigilError::NotFound {
            what: "pending decision".into(),
            id: event_id.to_string(),
        })?;

        let outcome = match action {
            ThreatAction::Quarantine => match decision.quarantine_id {
                Some(id) => ActionOutcome::Quarantined(self.store.get(id)?),
                None => {
                    let details = ThreatDetails {
                        threat_name: None,
                        risk_score: decision.summary.risk_score,
                        verdict: decision.summary.verdict,
                        reasons: Vec::new(),
                    };
                    ActionOutcome::Quarantined(self.store.quarantine_file(&decision.path, details)?)
                }
            },
            ThreatAction::Delete => {
                match decision.quarantine_id {
                    Some(id) => self.store.delete(id)?,
                    None => delete_with_retry(&decision.path)?,
                }
                ActionOutcome::Deleted
            }
            ThreatAction::Allow | ThreatAction::Monitor => {
                if add_to_exclusions {
                    if let Some(sha256) = &decision.summary.sha256 {
                        self.config.allowlist_sha256(sha256)?;
                        info!(sha256, "hash allowlisted by user decision");
                    }
                }
                if let Some(id) = decision.quarantine_id {
                    self.store.restore(id, None)?;
                }
                ActionOutcome::Allowed {
                    reason: "user decision".into(),
                }
            }
        };

        self.events.emit(VigilEvent::ThreatActionApplied {
            pending: decision.summary,
            action,
            success: true,
            detail: None,
        });
        Ok(outcome)
    }

    fn quarantine(
        &self,
        ctx: &ScanContext,
        result: &AggregatedResult,
        existing: Option<Uuid>,
    ) -> Result<ActionOutcome> {
        let entry = match existing {
            Some(id) => self.store.get(id)?,
            None => self
                .store
                .quarantine_file(&ctx.path, ThreatDetails::from(result))?,
        };
        Ok(ActionOutcome::Quarantined(entry))
    }

    fn delete(
        &self,
        ctx: &ScanContext,
        _result: &AggregatedResult,
        existing: Option<Uuid>,
    ) -> Result<ActionOutcome> {
        match existing {
            // Already in quarantine: discard the entry rather than the
            // (long gone) original path.
            Some(id) => self.store.delete(id)?,
            None => delete_with_retry(&ctx.path)?,
        }
        Ok(ActionOutcome::Deleted)
    }

    fn queue_pending(
        &self,
        ctx: &ScanContext,
        result: &AggregatedResult,
        existing: Option<Uuid>,
    ) -> ActionOutcome {
        let summary = self.summary_for(ctx, result, ThreatAction::Quarantine);
        let event_id = summary.event_id;
        self.pending.insert(PendingDecision {
            summary: summary.clone(),
            path: ctx.path.clone(),
            quarantine_id: existing,
        });
        self.events.emit(VigilEvent::ThreatActionRequired(summary));
        info!(%event_id, path = %ctx.path.display(), "decision queued for user");
        ActionOutcome::PendingUser(event_id)
    }

    fn summary_for(
        &self,
        ctx: &ScanContext,
        result: &AggregatedResult,
        recommended: ThreatAction,
    ) -> PendingSummary {
        PendingSummary {
            event_id: Uuid::new_v4(),
            path: ctx.path.clone(),
            sha256: ctx.sha256.clone(),
            risk_score: result.risk_score,
            verdict: result.verdict,
            recommended,
            created_at: Utc::now(),
        }
    }
}

fn delete_with_retry(path: &Path) -> Result<()> {
    let mut last = None;
    for attempt in 0..DELETE_RETRIES {
        match std::fs::remove_file(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                warn!(path = %path.display(), attempt, error = %e, "delete failed");
                last = Some(e);
                std::thread::sleep(DELETE_RETRY_DELAY);
            }
        }
    }
    Err(VigilError::io(
        path,
        last.unwrap_or_else(|| std::io::Error::other("delete failed")),
    ))
}
