//! # Vigil Quarantine
//!
//! Encrypted quarantine store: atomic intake of suspect files, envelope
//! encryption at rest, an append-only audit journal, restore, permanent
//! delete, and startup recovery.
//!
//! ## Threat Model
//!
//! The store defends against:
//!
//! - **Accidental execution**: blobs are encrypted and renamed; nothing
//!   under the store root is runnable or indexable as its original self.
//! - **Torn state**: intake stages under `.qvault.in` and commits with a
//!   rename; metadata is written via temp-then-rename; a crash at any
//!   point leaves either no entry or a complete one.
//! - **Tampering**: ChaCha20-Poly1305 authentication plus a recorded
//!   plaintext SHA-256 mean a modified blob refuses to restore.
//!
//! ## Invariant
//!
//! For every entry with `restored = false` and no permanent delete, the
//! blob exists and decrypts to bytes whose SHA-256 equals the entry's.

pub mod journal;
pub mod store;
pub mod vault;

pub use journal::{Journal, JournalAction};
pub use store::{MovedFile, QuarantineEntry, QuarantineStore, RecoveryReport, ThreatDetails};
pub use vault::MasterKey;
