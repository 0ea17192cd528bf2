//! Scan context: the immutable per-file bundle handed to every engine.
//!
//! A [`ScanContext`] is created once per file by the [`ContextBuilder`],
//! mutated only during construction, and discarded after aggregation.
//! Engines receive it by shared reference and must not mutate it; anything
//! an engine wants to remember across scans lives in that engine's own
//! cache, keyed by content hash.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PathRules;
use crate::error::{Result, VigilError};
use crate::identity::{self, FileHashes};
use crate::prevalence::PrevalenceEntry;

/// Parsed portable-executable metadata.
///
/// Produced by the [`PeParser`] collaborator; the parser itself is a pure
/// function over bytes and out of scope here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeInfo {
    /// Whether the headers parsed as a structurally valid PE.
    pub valid: bool,
    /// Target architecture ("x86", "x64", "arm64", ...).
    pub architecture: String,
    /// Section names in header order.
    pub section_names: Vec<String>,
    /// Imported DLL names, lowercased.
    pub imported_dlls: Vec<String>,
    /// Imported API symbols.
    pub imported_apis: Vec<String>,
    /// Shannon entropy of the file contents, in bits per byte.
    pub entropy: f64,
    /// Compile timestamp from the COFF header, if plausible.
    pub compile_timestamp: Option<DateTime<Utc>>,
    /// Whether an Authenticode signature blob is present.
    pub has_signature: bool,
    /// Bytes past the last section divided by the size of the image.
    pub overlay_ratio: f64,
}

/// Pure parser over file bytes. Test doubles replace this in unit tests.
pub trait PeParser: Send + Sync {
    /// Parses the given bytes, returning `None` when they are not a PE.
    fn parse(&self, bytes: &[u8]) -> Option<PeInfo>;
}

/// Location classification flags derived from the file path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationFlags {
    /// Path sits under a temp or per-user appdata directory.
    pub from_temp_or_appdata: bool,
    /// Path sits under an autostart location.
    pub in_startup_path: bool,
    /// Path sits under the quarantine root. Such files are never scanned.
    pub in_quarantine_root: bool,
}

/// Immutable per-file scan input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanContext {
    /// Absolute path of the file under scan.
    pub path: PathBuf,
    /// File size in bytes.
    pub file_size: u64,
    /// Last-write time.
    pub modified_at: Option<DateTime<Utc>>,
    /// Creation time, where the filesystem reports one.
    pub created_at: Option<DateTime<Utc>>,
    /// Lowercased extension without the dot; empty when absent.
    pub extension: String,
    /// SHA-256 of the contents, lowercase hex.
    pub sha256: Option<String>,
    /// MD5 of the contents, lowercase hex.
    pub md5: Option<String>,
    /// Parsed PE metadata, when the file is a PE.
    pub pe_info: Option<PeInfo>,
    /// Subject name of the code signer, when resolved.
    pub signer_name: Option<String>,
    /// Whether the signature chain verified, when resolved.
    pub signature_valid: Option<bool>,
    /// Path-derived location flags.
    pub location: LocationFlags,
    /// Prevalence snapshot taken at context-build time.
    ///
    /// The reputation engine performs its own increment-and-read against
    /// the live store; this field is informational.
    pub prevalence: Option<PrevalenceEntry>,
}

impl ScanContext {
    /// Returns true if the context carries a structurally valid PE.
    #[must_use]
    pub fn is_valid_pe(&self) -> bool {
        self.pe_info.as_ref().is_some_and(|pe| pe.valid)
    }

    /// Returns true if the file carries no signer at all.
    #[must_use]
    pub fn is_unsigned(&self) -> bool {
        self.signer_name.is_none()
            && !self.pe_info.as_ref().is_some_and(|pe| pe.has_signature)
    }

    /// Age of the file since creation, if the creation time is known.
    #[must_use]
    pub fn created_age(&self) -> Option<chrono::Duration> {
        self.created_at.map(|c| Utc::now() - c)
    }
}

/// Builder assembling a [`ScanContext`] from the filesystem.
///
/// Hashing and PE parsing are the expensive steps; both are optional so the
/// quick-gate path can build a cheap context first and upgrade later.
///
/// # Example
///
/// ```rust,no_run
/// use vigil_core::context::ContextBuilder;
/// use vigil_core::config::PathRules;
///
/// let ctx = ContextBuilder::new("/home/user/Downloads/setup.exe")
///     .with_hashes(true)
///     .with_path_rules(&PathRules::default())
///     .build()
///     .unwrap();
/// assert_eq!(ctx.extension, "exe");
/// ```
pub struct ContextBuilder<'a> {
    path: PathBuf,
    compute_hashes: bool,
    pe_parser: Option<&'a dyn PeParser>,
    path_rules: Option<&'a PathRules>,
    quarantine_root: Option<&'a Path>,
    signer: Option<(String, bool)>,
    prevalence: Option<PrevalenceEntry>,
    max_parse_bytes: u64,
}

impl<'a> ContextBuilder<'a> {
    /// Starts a builder for the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            compute_hashes: true,
            pe_parser: None,
            path_rules: None,
            quarantine_root: None,
            signer: None,
            prevalence: None,
            max_parse_bytes: 64 * 1024 * 1024,
        }
    }

    /// Enables or disables content hashing (enabled by default).
    #[must_use]
    pub fn with_hashes(mut self, enabled: bool) -> Self {
        self.compute_hashes = enabled;
        self
    }

    /// Attaches a PE parser; without one, `pe_info` stays `None`.
    #[must_use]
    pub fn with_pe_parser(mut self, parser: &'a dyn PeParser) -> Self {
        self.pe_parser = Some(parser);
        self
    }

    /// Attaches the path rules used to derive location flags.
    #[must_use]
    pub fn with_path_rules(mut self, rules: &'a PathRules) -> Self {
        self.path_rules = Some(rules);
        self
    }

    /// Marks the quarantine root for the in-quarantine flag.
    #[must_use]
    pub fn with_quarantine_root(mut self, root: &'a Path) -> Self {
        self.quarantine_root = Some(root);
        self
    }

    /// Supplies resolved signer information.
    #[must_use]
    pub fn with_signer(mut self, name: impl Into<String>, valid: bool) -> Self {
        self.signer = Some((name.into(), valid));
        self
    }

    /// Supplies a prevalence snapshot for the context.
    #[must_use]
    pub fn with_prevalence(mut self, entry: PrevalenceEntry) -> Self {
        self.prevalence = Some(entry);
        self
    }

    /// Reads the filesystem and produces the finished context.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Io`] if the file cannot be stat'ed or, when
    /// hashing is enabled, cannot be read.
    pub fn build(self) -> Result<ScanContext> {
        let metadata = std::fs::metadata(&self.path)
            .map_err(|e| VigilError::io(&self.path, e))?;

        let extension = self
            .path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let modified_at = metadata.modified().ok().map(DateTime::<Utc>::from);
        let created_at = metadata.created().ok().map(DateTime::<Utc>::from);

        let hashes: Option<FileHashes> = if self.compute_hashes {
            Some(identity::hash_file(&self.path)?)
        } else {
            None
        };

        let pe_info = match self.pe_parser {
            Some(parser) if metadata.len() <= self.max_parse_bytes => {
                let bytes = std::fs::read(&self.path)
                    .map_err(|e| VigilError::io(&self.path, e))?;
                parser.parse(&bytes)
            }
            _ => None,
        };

        let location = self.classify_location();

        Ok(ScanContext {
            path: self.path,
            file_size: metadata.len(),
            modified_at,
            created_at,
            extension,
            sha256: hashes.as_ref().map(|h| h.sha256.clone()),
            md5: hashes.map(|h| h.md5),
            pe_info,
            signer_name: self.signer.as_ref().map(|(n, _)| n.clone()),
            signature_valid: self.signer.map(|(_, v)| v),
            location,
            prevalence: self.prevalence,
        })
    }

    fn classify_location(&self) -> LocationFlags {
        let lowered = self.path.to_string_lossy().to_lowercase();

        let in_quarantine_root = self.quarantine_root.is_some_and(|root| {
            self.path.starts_with(root)
                || lowered.contains(&root.to_string_lossy().to_lowercase())
        });

        match self.path_rules {
            Some(rules) => LocationFlags {
                from_temp_or_appdata: rules.is_temp_or_appdata(&lowered),
                in_startup_path: rules.is_startup(&lowered),
                in_quarantine_root,
            },
            None => LocationFlags {
                in_quarantine_root,
                ..LocationFlags::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathRules;
    use tempfile::TempDir;

    struct FakePeParser;

    impl PeParser for FakePeParser {
        fn parse(&self, bytes: &[u8]) -> Option<PeInfo> {
            bytes.starts_with(b"MZ").then(|| PeInfo {
                valid: true,
                architecture: "x64".into(),
                ..PeInfo::default()
            })
        }
    }

    #[test]
    fn test_build_basic_context() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("sample.EXE");
        std::fs::write(&file, b"hello world").unwrap();

        let ctx = ContextBuilder::new(&file).build().unwrap();
        assert_eq!(ctx.extension, "exe");
        assert_eq!(ctx.file_size, 11);
        assert!(ctx.sha256.is_some());
        assert!(ctx.md5.is_some());
        assert!(ctx.pe_info.is_none());
    }

    #[test]
    fn test_build_without_hashes() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("sample.bin");
        std::fs::write(&file, b"data").unwrap();

        let ctx = ContextBuilder::new(&file).with_hashes(false).build().unwrap();
        assert!(ctx.sha256.is_none());
        assert!(ctx.md5.is_none());
    }

    #[test]
    fn test_pe_parser_invoked_on_mz_prefix() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("tool.exe");
        std::fs::write(&file, b"MZ\x90\x00rest").unwrap();

        let parser = FakePeParser;
        let ctx = ContextBuilder::new(&file)
            .with_pe_parser(&parser)
            .build()
            .unwrap();
        assert!(ctx.is_valid_pe());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = ContextBuilder::new("/nonexistent/nope.bin").build().unwrap_err();
        assert!(matches!(err, VigilError::Io { .. }));
    }

    #[test]
    fn test_location_flags_from_rules() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("AppData").join("Local").join("Temp");
        std::fs::create_dir_all(&nested).unwrap();
        let file = nested.join("dropper.exe");
        std::fs::write(&file, b"MZ").unwrap();

        let rules = PathRules::default();
        let ctx = ContextBuilder::new(&file)
            .with_path_rules(&rules)
            .build()
            .unwrap();
        assert!(ctx.location.from_temp_or_appdata);
        assert!(!ctx.location.in_startup_path);
    }

    #[test]
    fn test_unsigned_predicate() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.dll");
        std::fs::write(&file, b"x").unwrap();

        let unsigned = ContextBuilder::new(&file).build().unwrap();
        assert!(unsigned.is_unsigned());

        let signed = ContextBuilder::new(&file)
            .with_signer("Example Corp", true)
            .build()
            .unwrap();
        assert!(!signed.is_unsigned());
        assert_eq!(signed.signer_name.as_deref(), Some("Example Corp"));
    }
}
