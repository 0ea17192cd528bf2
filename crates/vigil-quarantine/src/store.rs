//! The quarantine store.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/files/<id>.qvault      encrypted blob
//! <root>/files/<id>.qvault.in   staging file during atomic move
//! <root>/meta/<id>.json         entry metadata, written atomically
//! <root>/journal.log            append-only audit trail
//! <root>/master.key             wrapped-key master (when self-managed)
//! ```
//!
//! A reader only ever trusts `.qvault` blobs; staging files are invisible
//! to every query, so a crash mid-quarantine never exposes a half-written
//! blob. The invariant maintained across all operations: an entry with
//! `restored = false` has a blob that decrypts to bytes hashing to the
//! entry's recorded SHA-256.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use vigil_core::config::AtomicMoveConfig;
use vigil_core::{identity, persist, AggregatedResult, PolicyVerdict, Result, VigilError};

use crate::journal::{Journal, JournalAction};
use crate::vault::{self, MasterKey};

/// Metadata for one quarantined file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineEntry {
    /// Opaque entry id.
    pub id: Uuid,
    /// Where the file lived before quarantine.
    pub original_path: PathBuf,
    /// Its file name at that time.
    pub original_name: String,
    /// Plaintext size in bytes.
    pub file_size: u64,
    /// SHA-256 of the plaintext, lowercase hex.
    pub sha256: String,
    /// When the entry was committed.
    pub quarantined_at: DateTime<Utc>,
    /// Best-known threat name.
    pub threat_name: Option<String>,
    /// Risk score at detection time.
    pub risk_score: u8,
    /// Verdict at detection time.
    pub verdict: PolicyVerdict,
    /// Detection reasons.
    pub reasons: Vec<String>,
    /// Whether the entry has been restored (blob removed).
    pub restored: bool,
    /// Where it was restored to, when it was.
    pub restore_path: Option<PathBuf>,
}

/// Detection details recorded alongside a quarantined file.
#[derive(Debug, Clone)]
pub struct ThreatDetails {
    /// Best-known threat name.
    pub threat_name: Option<String>,
    /// Aggregated risk score.
    pub risk_score: u8,
    /// Aggregated verdict.
    pub verdict: PolicyVerdict,
    /// Detection reasons.
    pub reasons: Vec<String>,
}

impl From<&AggregatedResult> for ThreatDetails {
    fn from(result: &AggregatedResult) -> Self {
        Self {
            threat_name: result.threat_name().map(ToOwned::to_owned),
            risk_score: result.risk_score,
            verdict: result.verdict,
            reasons: result.reasons.clone(),
        }
    }
}

/// A file moved into staging, awaiting commit.
#[derive(Debug)]
pub struct MovedFile {
    /// Entry id allocated for the move.
    pub id: Uuid,
    /// Staging path inside the store; plaintext until commit.
    pub staging_path: PathBuf,
    /// The path the file was taken from.
    pub original_path: PathBuf,
}

/// Counts and paths from a startup recovery sweep.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Blobs (or abandoned staging files) with no metadata.
    pub orphan_blobs: Vec<PathBuf>,
    /// Unrestored metadata entries whose blob is missing.
    pub orphan_metadata: Vec<Uuid>,
}

/// Encrypted quarantine store with atomic intake.
pub struct QuarantineStore {
    root: PathBuf,
    files_dir: PathBuf,
    meta_dir: PathBuf,
    master: MasterKey,
    journal: Journal,
    retry: AtomicMoveConfig,
}

impl QuarantineStore {
    /// Creates or opens a store rooted at `root` with an explicit master
    /// key.
    pub fn new(root: impl Into<PathBuf>, master: MasterKey, retry: AtomicMoveConfig) -> Result<Self> {
        let root = root.into();
        let files_dir = root.join("files");
        let meta_dir = root.join("meta");
        std::fs::create_dir_all(&files_dir).map_err(|e| VigilError::io(&files_dir, e))?;
        std::fs::create_dir_all(&meta_dir).map_err(|e| VigilError::io(&meta_dir, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o700));
        }

        Ok(Self {
            journal: Journal::new(root.join("journal.log")),
            files_dir,
            meta_dir,
            master,
            retry,
            root,
        })
    }

    /// Opens a store whose master key is self-managed under the root.
    pub fn open(root: impl Into<PathBuf>, retry: AtomicMoveConfig) -> Result<Self> {
        let root = root.into();
        let master = MasterKey::load_or_create(&root.join("master.key"))?;
        Self::new(root, master, retry)
    }

    /// The store root; real-time scanning must exclude it.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Moves `src` into staging with rename-preferred semantics.
    ///
    /// Rename is retried with exponential backoff for lock-style errors;
    /// cross-volume moves fall back to copy + hash-verify + delete. A
    /// source that cannot be deleted after a verified copy leaves a
    /// cleanup marker and still counts as moved.
    pub fn try_atomic_move(&self, src: &Path) -> Result<MovedFile> {
        let id = Uuid::new_v4();
        let staging = self.staging_path(id);

        let mut delay = Duration::from_millis(self.retry.initial_delay_ms);
        let max_delay = Duration::from_millis(self.retry.max_delay_ms);
        let mut last_error: Option<std::io::Error> = None;

        for attempt in 0..=self.retry.max_retries {
            match std::fs::rename(src, &staging) {
                Ok(()) => {
                    debug!(src = %src.display(), id = %id, attempt, "atomic rename succeeded");
                    return Ok(MovedFile {
                        id,
                        staging_path: staging,
                        original_path: src.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(VigilError::io(src, e));
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < self.retry.max_retries {
                        std::thread::sleep(delay);
                        delay = (delay * 2).min(max_delay);
                    }
                }
            }
        }
        debug!(src = %src.display(), error = ?last_error, "rename exhausted, falling back to copy");

        // Copy, verify content identity, then delete the source.
        std::fs::copy(src, &staging).map_err(|e| VigilError::io(src, e))?;
        let src_hash = identity::hash_file(src)?;
        let copy_hash = identity::hash_file(&staging)?;
        if src_hash != copy_hash {
            let _ = std::fs::remove_file(&staging);
            return Err(VigilError::IntegrityFailure {
                subject: src.display().to_string(),
                detail: "copy verification failed".into(),
            });
        }
        if let Err(e) = std::fs::remove_file(src) {
            warn!(src = %src.display(), error = %e, "source delete failed after verified copy");
            let marker = self.files_dir.join(format!("{id}.cleanup"));
            let _ = std::fs::write(&marker, src.to_string_lossy().as_bytes());
        }

        Ok(MovedFile {
            id,
            staging_path: staging,
            original_path: src.to_path_buf(),
        })
    }

    /// Commits a staged file: seals it into the blob format, writes the
    /// metadata atomically, journals the intake, and removes the staging
    /// plaintext.
    pub fn complete(&self, moved: MovedFile, details: ThreatDetails) -> Result<QuarantineEntry> {
        let plaintext =
            std::fs::read(&moved.staging_path).map_err(|e| VigilError::io(&moved.staging_path, e))?;
        let sha256 = identity::sha256_hex(&plaintext);

        let blob = vault::seal(&self.master, &plaintext)?;
        let blob_path = self.blob_path(moved.id);
        let tmp = blob_path.with_extension("qvault.tmp");
        std::fs::write(&tmp, &blob).map_err(|e| VigilError::io(&tmp, e))?;
        std::fs::rename(&tmp, &blob_path).map_err(|e| VigilError::io(&blob_path, e))?;
        std::fs::remove_file(&moved.staging_path)
            .map_err(|e| VigilError::io(&moved.staging_path, e))?;

        let entry = QuarantineEntry {
            id: moved.id,
            original_name: moved
                .original_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            original_path: moved.original_path,
            file_size: plaintext.len() as u64,
            sha256,
            quarantined_at: Utc::now(),
            threat_name: details.threat_name,
            risk_score: details.risk_score,
            verdict: details.verdict,
            reasons: details.reasons,
            restored: false,
            restore_path: None,
        };
        self.write_metadata(&entry)?;
        self.journal.append(
            JournalAction::Quarantined,
            &entry.id.to_string(),
            &format!("from {}", entry.original_path.display()),
        )?;
        info!(id = %entry.id, path = %entry.original_path.display(), "file quarantined");
        Ok(entry)
    }

    /// Full intake: atomic move then commit.
    pub fn quarantine_file(&self, src: &Path, details: ThreatDetails) -> Result<QuarantineEntry> {
        let moved = self.try_atomic_move(src)?;
        self.complete(moved, details)
    }

    /// Restores an entry to `target` (or its original path), returning the
    /// path written.
    ///
    /// # Errors
    ///
    /// - [`VigilError::NotFound`] for an unknown or already-restored id.
    /// - [`VigilError::IntegrityFailure`] when the blob fails its tag or
    ///   its plaintext does not hash to the recorded SHA-256.
    pub fn restore(&self, id: Uuid, target: Option<&Path>) -> Result<PathBuf> {
        let mut entry = self.get(id)?;
        if entry.restored {
            return Err(not_found(id));
        }

        let blob_path = self.blob_path(id);
        let blob = std::fs::read(&blob_path).map_err(|e| VigilError::io(&blob_path, e))?;
        let plaintext = match vault::open(&self.master, &blob) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                self.journal.append(
                    JournalAction::IntegrityRejected,
                    &id.to_string(),
                    &e.to_string(),
                )?;
                return Err(e);
            }
        };
        if identity::sha256_hex(&plaintext) != entry.sha256 {
            let detail = "decrypted content does not match recorded hash";
            self.journal
                .append(JournalAction::IntegrityRejected, &id.to_string(), detail)?;
            return Err(VigilError::IntegrityFailure {
                subject: id.to_string(),
                detail: detail.into(),
            });
        }

        let desired = target.unwrap_or(&entry.original_path).to_path_buf();
        let final_path = persist::unique_target_path(&desired);
        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| VigilError::io(parent, e))?;
        }

        // Stage on the destination volume so the final step is a rename.
        let tmp = final_path.with_extension("vigil-restore.tmp");
        std::fs::write(&tmp, &plaintext).map_err(|e| VigilError::io(&tmp, e))?;
        std::fs::rename(&tmp, &final_path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            VigilError::io(&final_path, e)
        })?;

        entry.restored = true;
        entry.restore_path = Some(final_path.clone());
        self.write_metadata(&entry)?;
        let _ = std::fs::remove_file(&blob_path);
        self.journal.append(
            JournalAction::Restored,
            &id.to_string(),
            &format!("to {}", final_path.display()),
        )?;
        info!(id = %id, path = %final_path.display(), "entry restored");
        Ok(final_path)
    }

    /// Permanently deletes an entry: best-effort wipe, then blob and
    /// metadata removal. Idempotent for already-deleted ids.
    pub fn delete(&self, id: Uuid) -> Result<()> {
        let blob_path = self.blob_path(id);
        let meta_path = self.meta_path(id);
        if !blob_path.exists() && !meta_path.exists() {
            return Ok(());
        }

        if let Ok(meta) = std::fs::metadata(&blob_path) {
            // Overwrite before unlink so casual recovery sees zeros.
            let _ = std::fs::write(&blob_path, vec![0u8; meta.len() as usize]);
            std::fs::remove_file(&blob_path).map_err(|e| VigilError::io(&blob_path, e))?;
        }
        if meta_path.exists() {
            std::fs::remove_file(&meta_path).map_err(|e| VigilError::io(&meta_path, e))?;
        }
        self.journal
            .append(JournalAction::Deleted, &id.to_string(), "permanent delete")?;
        info!(id = %id, "entry permanently deleted");
        Ok(())
    }

    /// Loads one entry's metadata.
    pub fn get(&self, id: Uuid) -> Result<QuarantineEntry> {
        let path = self.meta_path(id);
        if !path.exists() {
            return Err(not_found(id));
        }
        persist::read_json(&path)
    }

    /// All entries, newest first.
    #[must_use]
    pub fn list(&self) -> Vec<QuarantineEntry> {
        let mut entries: Vec<QuarantineEntry> = std::fs::read_dir(&self.meta_dir)
            .into_iter()
            .flatten()
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|x| x == "json"))
            .filter_map(|e| persist::read_json(e.path()).ok())
            .collect();
        entries.sort_by(|a, b| b.quarantined_at.cmp(&a.quarantined_at));
        entries
    }

    /// Startup sweep: pairs blobs with metadata and journals any orphan on
    /// either side. Abandoned staging files count as orphan blobs.
    pub fn recover(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let entries = self.list();

        if let Ok(dir) = std::fs::read_dir(&self.files_dir) {
            for file in dir.flatten() {
                let path = file.path();
                let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
                let Some(name) = name else { continue };
                let id = name
                    .split('.')
                    .next()
                    .and_then(|stem| Uuid::parse_str(stem).ok());
                let known = id.is_some_and(|id| entries.iter().any(|e| e.id == id && !e.restored));
                let is_payload = name.ends_with(".qvault") || name.ends_with(".qvault.in");
                if is_payload && !known {
                    warn!(path = %path.display(), "orphan quarantine blob");
                    let _ = self.journal.append(
                        JournalAction::Orphaned,
                        id.map(|i| i.to_string()).as_deref().unwrap_or("unknown"),
                        &format!("blob without metadata: {}", path.display()),
                    );
                    report.orphan_blobs.push(path);
                }
            }
        }

        for entry in entries.iter().filter(|e| !e.restored) {
            if !self.blob_path(entry.id).exists() {
                warn!(id = %entry.id, "metadata without blob");
                let _ = self.journal.append(
                    JournalAction::Orphaned,
                    &entry.id.to_string(),
                    "metadata without blob",
                );
                report.orphan_metadata.push(entry.id);
            }
        }
        report
    }

    /// Reads and decrypts a blob without touching its metadata. Used by
    /// the pipeline to scan a file after the quick-gate moved it.
    pub fn read_blob(&self, id: Uuid) -> Result<Vec<u8>> {
        let path = self.blob_path(id);
        let blob = std::fs::read(&path).map_err(|e| VigilError::io(&path, e))?;
        vault::open(&self.master, &blob)
    }

    fn write_metadata(&self, entry: &QuarantineEntry) -> Result<()> {
        persist::write_json_atomic(self.meta_path(entry.id), entry)
    }

    fn blob_path(&self, id: Uuid) -> PathBuf {
        self.files_dir.join(format!("{id}.qvault"))
    }

    fn staging_path(&self, id: Uuid) -> PathBuf {
        self.files_dir.join(format!("{id}.qvault.in"))
    }

    fn meta_path(&self, id: Uuid) -> PathBuf {
        self.meta_dir.join(format!("{id}.json"))
    }
}

fn not_found(id: Uuid) -> VigilError {
    VigilError::NotFound {
        what: "quarantine entry".into(),
        id: id.to_string(),
    }
}
