//! Hash signature engine and its database.
//!
//! The database is an in-memory map indexed by both SHA-256 and MD5; a
//! lookup on either hash returns the record. It is read-mostly: scans take
//! the read lock, mutation (add, CSV import) takes the write lock, and
//! persistence is a single atomically-written JSON journal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vigil_core::persist;
use vigil_core::{EngineResult, EngineVerdict, Result, ScanContext, VigilError};

use crate::engine::{names, Engine};

/// SHA-256 of the EICAR test file, the built-in self-test signature.
pub const EICAR_SHA256: &str = "275a021bbfb6489e54d471899f7db9d1663fc695ec2fe2a2c4538aabf651fd0f";

/// MD5 of the EICAR test file.
pub const EICAR_MD5: &str = "44d88612fea8a8f36de82e1278abb02f";

/// One known-malware record.
///
/// At least one of `sha256` / `md5` must be present; lookups on any
/// non-empty hash return the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureRecord {
    /// SHA-256, lowercase hex.
    pub sha256: Option<String>,
    /// MD5, lowercase hex.
    pub md5: Option<String>,
    /// Detection name.
    pub name: String,
    /// Malware family.
    pub family: String,
    /// Optional analyst description.
    pub description: Option<String>,
    /// Severity in `0..=100`.
    pub threat_level: u8,
    /// When the record entered the database.
    pub added_at: DateTime<Utc>,
    /// Feed or analyst the record came from.
    pub source: Option<String>,
}

impl SignatureRecord {
    /// Creates a record keyed by SHA-256.
    pub fn by_sha256(
        sha256: impl Into<String>,
        name: impl Into<String>,
        family: impl Into<String>,
        threat_level: u8,
    ) -> Self {
        Self {
            sha256: Some(sha256.into().to_lowercase()),
            md5: None,
            name: name.into(),
            family: family.into(),
            description: None,
            threat_level,
            added_at: Utc::now(),
            source: None,
        }
    }
}

/// Which hash produced a database hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    /// Matched by SHA-256.
    Sha256,
    /// Matched by MD5.
    Md5,
}

impl HashKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Md5 => "md5",
        }
    }
}

/// Summary of a CSV import.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportSummary {
    /// Records added.
    pub imported: usize,
    /// Lines skipped as malformed.
    pub skipped: usize,
}

#[derive(Default)]
struct DbIndex {
    by_sha256: HashMap<String, Arc<SignatureRecord>>,
    by_md5: HashMap<String, Arc<SignatureRecord>>,
}

impl DbIndex {
    fn insert(&mut self, record: SignatureRecord) {
        let record = Arc::new(record);
        if let Some(sha) = &record.sha256 {
            self.by_sha256.insert(sha.to_lowercase(), Arc::clone(&record));
        }
        if let Some(md5) = &record.md5 {
            self.by_md5.insert(md5.to_lowercase(), Arc::clone(&record));
        }
    }

    fn records(&self) -> Vec<SignatureRecord> {
        // Records keyed by both hashes appear once, preferring the sha index.
        let mut seen: Vec<SignatureRecord> = Vec::new();
        for record in self.by_sha256.values() {
            seen.push((**record).clone());
        }
        for record in self.by_md5.values() {
            let dup = record
                .sha256
                .as_ref()
                .is_some_and(|sha| self.by_sha256.contains_key(sha));
            if !dup {
                seen.push((**record).clone());
            }
        }
        seen
    }
}

/// The mutable signature database.
pub struct SignatureDb {
    index: RwLock<DbIndex>,
    path: Option<PathBuf>,
}

impl SignatureDb {
    /// Creates an in-memory database seeded with the EICAR self-test record.
    #[must_use]
    pub fn new() -> Self {
        let db = Self {
            index: RwLock::new(DbIndex::default()),
            path: None,
        };
        db.seed_builtin();
        db
    }

    /// Opens a database backed by a JSON journal, loading existing records
    /// and seeding the built-in entry.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let db = Self {
            index: RwLock::new(DbIndex::default()),
            path: Some(path.clone()),
        };
        if path.exists() {
            match persist::read_json::<Vec<SignatureRecord>>(&path) {
                Ok(records) => {
                    let mut index = db.index.write().expect("signature db lock poisoned");
                    for record in records {
                        index.insert(record);
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "signature journal unreadable, starting from builtins");
                }
            }
        }
        db.seed_builtin();
        db
    }

    fn seed_builtin(&self) {
        // Keep the loaded record (and its added_at) when already present.
        if self.lookup(Some(EICAR_SHA256), None).is_some() {
            return;
        }
        let mut eicar = SignatureRecord::by_sha256(EICAR_SHA256, "EICAR-Test-File", "Test", 100);
        eicar.md5 = Some(EICAR_MD5.into());
        eicar.description = Some("EICAR antivirus self-test file".into());
        eicar.source = Some("builtin".into());
        self.add(eicar);
    }

    /// Adds or replaces a record.
    pub fn add(&self, record: SignatureRecord) {
        self.index
            .write()
            .expect("signature db lock poisoned")
            .insert(record);
    }

    /// Looks up the given hashes, SHA-256 first.
    #[must_use]
    pub fn lookup(
        &self,
        sha256: Option<&str>,
        md5: Option<&str>,
    ) -> Option<(Arc<SignatureRecord>, HashKind)> {
        let index = self.index.read().expect("signature db lock poisoned");
        if let Some(sha) = sha256.filter(|s| !s.is_empty()) {
            if let Some(record) = index.by_sha256.get(&sha.to_lowercase()) {
                return Some((Arc::clone(record), HashKind::Sha256));
            }
        }
        if let Some(md5) = md5.filter(|s| !s.is_empty()) {
            if let Some(record) = index.by_md5.get(&md5.to_lowercase()) {
                return Some((Arc::clone(record), HashKind::Md5));
            }
        }
        None
    }

    /// Number of distinct records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index
            .read()
            .expect("signature db lock poisoned")
            .records()
            .len()
    }

    /// Returns true if no records are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Imports records from CSV text.
    ///
    /// Format: `sha256,md5,name,family,threat_level[,description[,source]]`.
    /// Either hash column may be empty, not both. Malformed lines are
    /// counted and skipped; a `#` prefix or a header line is ignored.
    pub fn import_csv(&self, csv: &str) -> ImportSummary {
        let mut summary = ImportSummary::default();
        for line in csv.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.to_lowercase().starts_with("sha256,")
            {
                continue;
            }
            match Self::parse_csv_line(line) {
                Some(record) => {
                    self.add(record);
                    summary.imported += 1;
                }
                None => {
                    summary.skipped += 1;
                    warn!(line, "skipping malformed signature line");
                }
            }
        }
        info!(
            imported = summary.imported,
            skipped = summary.skipped,
            "signature import finished"
        );
        summary
    }

    fn parse_csv_line(line: &str) -> Option<SignatureRecord> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 5 {
            return None;
        }
        let sha256 = (!fields[0].is_empty()).then(|| fields[0].to_lowercase());
        let md5 = (!fields[1].is_empty()).then(|| fields[1].to_lowercase());
        if sha256.is_none() && md5.is_none() {
            return None;
        }
        let threat_level: u8 = fields[4].parse().ok()?;
        Some(SignatureRecord {
            sha256,
            md5,
            name: fields[2].to_string(),
            family: fields[3].to_string(),
            description: fields.get(5).filter(|s| !s.is_empty()).map(|s| s.to_string()),
            threat_level: threat_level.min(100),
            added_at: Utc::now(),
            source: fields.get(6).filter(|s| !s.is_empty()).map(|s| s.to_string()),
        })
    }

    /// Imports records from a CSV file on disk.
    pub fn import_csv_file(&self, path: impl AsRef<Path>) -> Result<ImportSummary> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| VigilError::io(path, e))?;
        Ok(self.import_csv(&text))
    }

    /// Writes the database to its JSON journal atomically.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Persistence`] on write failure; in-memory
    /// state is unaffected.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut records = self
            .index
            .read()
            .expect("signature db lock poisoned")
            .records();
        records.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.sha256.cmp(&b.sha256)));
        persist::write_json_atomic(path, &records).map_err(|e| VigilError::Persistence {
            store: "signature-db".into(),
            detail: e.to_string(),
        })
    }
}

impl Default for SignatureDb {
    fn default() -> Self {
        Self::new()
    }
}

/// Engine consulting the signature database.
///
/// Hash lookups precede any file I/O; when the context carries no hashes
/// at all, the engine reports Unknown rather than reading the file itself.
pub struct SignatureEngine {
    db: Arc<SignatureDb>,
}

impl SignatureEngine {
    /// Creates the engine over a shared database handle.
    #[must_use]
    pub fn new(db: Arc<SignatureDb>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Engine for SignatureEngine {
    fn name(&self) -> &'static str {
        names::SIGNATURE
    }

    fn default_weight(&self) -> f64 {
        1.0
    }

    async fn scan(&self, ctx: &ScanContext, _cancel: &CancellationToken) -> EngineResult {
        if ctx.sha256.is_none() && ctx.md5.is_none() {
            return EngineResult::new(self.name(), 0, EngineVerdict::Unknown, 0.0)
                .with_reason("no content hash available");
        }

        match self.db.lookup(ctx.sha256.as_deref(), ctx.md5.as_deref()) {
            Some((record, kind)) => {
                EngineResult::new(self.name(), 100, EngineVerdict::Malicious, 1.0)
                    .with_reason(format!("{} ({})", record.name, record.family))
                    .with_reason(format!("known-malware {} match", kind.as_str()))
                    .with_metadata("family", record.family.clone())
                    .with_metadata("threat_level", record.threat_level.to_string())
            }
            None => EngineResult::clean(self.name(), 0.7),
        }
    }
}
