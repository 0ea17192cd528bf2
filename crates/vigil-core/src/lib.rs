//! # Vigil Core
//!
//! Data model and shared services for the Vigil anti-malware engine:
//! the scan context and result types every engine speaks, configuration,
//! content identity, the scan result cache, the prevalence store, safe
//! enumeration, and the egress event surface.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         vigil-core                           │
//! │                                                              │
//! │  ScanContext ──▶ engines (vigil-engines) ──▶ EngineResult    │
//! │       ▲                                          │           │
//! │  ContextBuilder                            AggregatedResult  │
//! │       │                                          │           │
//! │  identity / config / cache / prevalence ◀────────┘           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Notes
//!
//! - Contexts are immutable after construction; engines never mutate them.
//! - Cache reads clone; downstream mutation cannot poison cached verdicts.
//! - Every on-disk store is JSON written via temp-then-rename.

pub mod cache;
pub mod config;
pub mod context;
pub mod enumerate;
pub mod error;
pub mod events;
pub mod identity;
pub mod persist;
pub mod prevalence;
pub mod result;
pub mod verdict;

pub use cache::ScanCache;
pub use config::{ActionMode, ConfigService, PathRules, VigilConfig};
pub use context::{ContextBuilder, LocationFlags, PeInfo, PeParser, ScanContext};
pub use error::{Result, VigilError};
pub use events::{PendingSummary, ThreatAction, VigilEvent};
pub use prevalence::{PrevalenceEntry, PrevalenceStore};
pub use result::{dedup_reasons, AggregatedResult, EngineResult};
pub use verdict::{EngineVerdict, PolicyVerdict};
