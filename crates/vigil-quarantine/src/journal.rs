//! Append-only audit journal for quarantine state changes.
//!
//! One UTF-8 line per event: timestamp, action, entry id, free-form
//! detail, tab-separated. Writes are serialized by a store-wide mutex;
//! blob I/O never holds it.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;

use vigil_core::{Result, VigilError};

/// Journalled action names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalAction {
    /// A file entered quarantine.
    Quarantined,
    /// An entry was restored to disk.
    Restored,
    /// An entry's blob and metadata were removed permanently.
    Deleted,
    /// Recovery found a blob or metadata file without its counterpart.
    Orphaned,
    /// An integrity check refused an operation.
    IntegrityRejected,
}

impl JournalAction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Quarantined => "quarantine",
            Self::Restored => "restore",
            Self::Deleted => "delete",
            Self::Orphaned => "orphan",
            Self::IntegrityRejected => "integrity-reject",
        }
    }
}

/// The append-only journal file.
pub struct Journal {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl Journal {
    /// Creates a journal at the given path (file is created lazily).
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Appends one event line.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Persistence`]; the caller's in-memory state
    /// change has already happened and stands.
    pub fn append(&self, action: JournalAction, id: &str, detail: &str) -> Result<()> {
        let line = format!(
            "{}\t{}\t{}\t{}\n",
            Utc::now().to_rfc3339(),
            action.as_str(),
            id,
            detail.replace(['\n', '\t'], " "),
        );

        let _guard = self.write_lock.lock().expect("journal lock poisoned");
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()))
            .map_err(|e| VigilError::Persistence {
                store: "quarantine-journal".into(),
                detail: e.to_string(),
            })
    }

    /// Reads the full journal as lines, newest last.
    pub fn read_lines(&self) -> Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text =
            std::fs::read_to_string(&self.path).map_err(|e| VigilError::io(&self.path, e))?;
        Ok(text.lines().map(ToOwned::to_owned).collect())
    }
}
