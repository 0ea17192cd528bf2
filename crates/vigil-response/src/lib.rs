//! # Vigil Response
//!
//! Turns aggregated verdicts into action: quarantine, delete, queue for a
//! user decision, or allow. Houses the pending-decision registry and the
//! outbound event bus that IPC broadcasters subscribe to.
//!
//! ## Policy Modes
//!
//! | Mode | Non-Allow verdicts |
//! |------|--------------------|
//! | auto-quarantine | moved into the quarantine store |
//! | auto-block | deleted (quarantine entry discarded if one exists) |
//! | ask-user | quarantined when definitive or above the auto threshold, queued for the user in the middle band, monitored below it |
//!
//! The SHA-256 allowlist is consulted before every mode and produces no
//! filesystem effect on a hit.

pub mod events;
pub mod executor;
pub mod pending;

pub use events::EventBus;
pub use executor::{ActionExecutor, ActionOutcome};
pub use pending::{PendingDecision, PendingRegistry};
