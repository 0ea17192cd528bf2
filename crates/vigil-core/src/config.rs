//! Configuration for the Vigil engine.
//!
//! All tunables recognized by the service live here, grouped by the
//! component they drive. The whole tree serializes to a single JSON file
//! written atomically; [`ConfigService`] owns the live copy and is the only
//! writer. Producers hold a read-only view.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, VigilError};
use crate::persist;

/// How the action executor responds to non-Allow verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionMode {
    /// Non-Allow verdicts are quarantined without asking.
    AutoQuarantine,
    /// Non-Allow verdicts are deleted without asking.
    AutoBlock,
    /// High-confidence threats are quarantined; the rest queue a pending
    /// decision for the user.
    AskUser,
}

/// Action executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    /// Response mode for real-time detections.
    pub real_time_action_mode: ActionMode,
    /// In ask-user mode, scores at or above this quarantine immediately.
    pub auto_quarantine_min_score: u8,
    /// In ask-user mode, scores at or above this queue a pending decision.
    pub ask_user_min_score: u8,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            real_time_action_mode: ActionMode::AutoQuarantine,
            auto_quarantine_min_score: 70,
            ask_user_min_score: 30,
        }
    }
}

/// Verdict thresholds applied by the aggregator and quick-gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Risk score at or above which the verdict is Block.
    pub block_threshold: u8,
    /// Risk score at or above which the verdict is Quarantine.
    pub quarantine_threshold: u8,
    /// Risk score at or above which the verdict is NeedsReview.
    pub review_threshold: u8,
    /// Lower bound of the suspicion zone that triggers second opinions.
    pub suspicion_min: u8,
    /// Upper bound of the suspicion zone.
    pub suspicion_max: u8,
    /// Quick-gate score at or above which a file is quarantined before the
    /// full scan.
    pub quick_gate_threshold: u8,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            block_threshold: 85,
            quarantine_threshold: 70,
            review_threshold: 40,
            suspicion_min: 30,
            suspicion_max: 75,
            quick_gate_threshold: 50,
        }
    }
}

/// Engine invocation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-engine wall-clock budget in seconds.
    pub timeout_secs: u64,
    /// Weight overrides by engine name; unnamed engines use their
    /// built-in default weight.
    pub weights: HashMap<String, f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            weights: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Effective weight for an engine, preferring the override.
    #[must_use]
    pub fn weight_for(&self, engine_name: &str, default_weight: f64) -> f64 {
        self.weights
            .get(engine_name)
            .copied()
            .unwrap_or(default_weight)
            .clamp(0.0, 1.0)
    }
}

/// Real-time pipeline sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Bounded event queue capacity.
    pub queue_capacity: usize,
    /// Pending-count at which the aggregator's high-pressure flag engages.
    pub high_pressure_threshold: usize,
    /// Configured worker count; effective count is `min(this, host CPUs)`.
    pub scan_workers: usize,
    /// Per-path debounce window in milliseconds.
    pub event_coalesce_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            high_pressure_threshold: 1_000,
            scan_workers: 4,
            event_coalesce_ms: 500,
        }
    }
}

/// Watchdog and degraded-mode controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Tick interval in milliseconds.
    pub interval_ms: u64,
    /// Maximum worker restarts inside one rolling window before the
    /// watchdog reports a fatal health condition.
    pub restart_limit: u32,
    /// Rolling window for restart accounting, in seconds.
    pub restart_window_secs: u64,
    /// Pending-count at which degraded mode engages.
    pub degraded_threshold: usize,
    /// Pending-count at or below which degraded mode disengages.
    pub degraded_recovery_threshold: usize,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            restart_limit: 3,
            restart_window_secs: 600,
            degraded_threshold: 2_000,
            degraded_recovery_threshold: 500,
        }
    }
}

/// Retry policy for the quarantine atomic move.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomicMoveConfig {
    /// Maximum rename retries before falling back to copy+verify+delete.
    pub max_retries: u32,
    /// First backoff delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Backoff cap in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for AtomicMoveConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 50,
            max_delay_ms: 2_000,
        }
    }
}

/// Scan result cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entry time-to-live in minutes.
    pub ttl_minutes: u64,
    /// Maximum entries retained after any store.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: 30,
            max_entries: 20_000,
        }
    }
}

/// Second-opinion engine triggers and endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondOpinionConfig {
    /// Whether the platform-scanner second opinion may run at all.
    pub enable_defender_second_opinion: bool,
    /// Whether the remote-reputation second opinion may run at all.
    pub enable_virus_total_second_opinion: bool,
    /// Trigger the platform scanner when ML and heuristic disagree.
    pub defender_when_disagree: bool,
    /// Trigger the platform scanner for temp/appdata files.
    pub defender_when_temp_or_appdata: bool,
    /// Trigger remote reputation for unsigned files in suspicious paths.
    pub virus_total_when_unsigned_suspicious_path: bool,
    /// Platform scanner executable; unset leaves the engine not ready.
    pub defender_command: Option<PathBuf>,
    /// Arguments for the platform scanner; `{path}` expands to the file.
    pub defender_args: Vec<String>,
    /// Remote reputation API base URL.
    pub virus_total_base_url: String,
    /// Remote reputation API key; empty leaves the engine not ready.
    pub virus_total_api_key: String,
}

impl Default for SecondOpinionConfig {
    fn default() -> Self {
        Self {
            enable_defender_second_opinion: false,
            enable_virus_total_second_opinion: false,
            defender_when_disagree: true,
            defender_when_temp_or_appdata: true,
            virus_total_when_unsigned_suspicious_path: true,
            defender_command: None,
            defender_args: vec![
                "-Scan".into(),
                "-ScanType".into(),
                "3".into(),
                "-File".into(),
                "{path}".into(),
            ],
            virus_total_base_url: "https://www.virustotal.com/api/v3".into(),
            virus_total_api_key: String::new(),
        }
    }
}

/// Scan scoping: what gets scanned and what never does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopingConfig {
    /// SHA-256 hashes that short-circuit any scan to Allow.
    pub sha256_allowlist: Vec<String>,
    /// Extensions (lowercase, no dot) never scanned.
    pub excluded_extensions: Vec<String>,
    /// Folders never scanned.
    pub excluded_folders: Vec<PathBuf>,
    /// Quarantine store root; always excluded from scanning.
    pub quarantine_path: PathBuf,
    /// Files larger than this many MiB are skipped.
    pub max_file_size_mb: u64,
}

impl Default for ScopingConfig {
    fn default() -> Self {
        Self {
            sha256_allowlist: Vec::new(),
            excluded_extensions: vec!["qvault".into()],
            excluded_folders: Vec::new(),
            quarantine_path: PathBuf::from("quarantine"),
            max_file_size_mb: 256,
        }
    }
}

impl ScopingConfig {
    /// Maximum scannable file size in bytes.
    #[must_use]
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

/// Path classification rules.
///
/// Matching is case-insensitive substring (or prefix, for trusted roots)
/// over the normalized path, so the same rules work in tests on any host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRules {
    /// Substrings marking temp or per-user appdata locations.
    pub temp_or_appdata: Vec<String>,
    /// Substrings marking autostart locations.
    pub startup: Vec<String>,
    /// Substrings the reputation engine treats as suspicious.
    pub suspicious: Vec<String>,
    /// Prefixes of trusted system locations.
    pub trusted_prefixes: Vec<String>,
}

impl Default for PathRules {
    fn default() -> Self {
        Self {
            temp_or_appdata: vec![
                r"\temp\".into(),
                r"\tmp\".into(),
                r"\appdata\local\temp\".into(),
                r"\appdata\roaming\".into(),
                "/tmp/".into(),
                "/var/tmp/".into(),
                "/appdata/local/temp/".into(),
                "/appdata/roaming/".into(),
            ],
            startup: vec![
                r"\start menu\programs\startup\".into(),
                r"\currentversion\run".into(),
                "/etc/init.d/".into(),
                "/.config/autostart/".into(),
            ],
            suspicious: vec![
                r"\temp\".into(),
                r"\appdata\local\temp\".into(),
                r"\appdata\roaming\".into(),
                r"\users\public\".into(),
                r"\programdata\".into(),
                r"\downloads\".into(),
                "/tmp/".into(),
                "/downloads/".into(),
            ],
            trusted_prefixes: vec![
                r"c:\windows\system32\".into(),
                r"c:\windows\syswow64\".into(),
                r"c:\program files\".into(),
                r"c:\program files (x86)\".into(),
                "/usr/bin/".into(),
                "/usr/lib/".into(),
            ],
        }
    }
}

impl PathRules {
    /// True when the lowered path sits in a temp or appdata location.
    #[must_use]
    pub fn is_temp_or_appdata(&self, lowered_path: &str) -> bool {
        self.temp_or_appdata.iter().any(|p| lowered_path.contains(p.as_str()))
    }

    /// True when the lowered path sits in an autostart location.
    #[must_use]
    pub fn is_startup(&self, lowered_path: &str) -> bool {
        self.startup.iter().any(|p| lowered_path.contains(p.as_str()))
    }

    /// True when the lowered path contains a suspicious substring.
    #[must_use]
    pub fn is_suspicious(&self, lowered_path: &str) -> bool {
        self.suspicious.iter().any(|p| lowered_path.contains(p.as_str()))
    }

    /// True when the lowered path starts under a trusted system root.
    #[must_use]
    pub fn is_trusted(&self, lowered_path: &str) -> bool {
        self.trusted_prefixes.iter().any(|p| lowered_path.starts_with(p.as_str()))
    }
}

/// The full configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    /// Action executor settings.
    pub action: ActionConfig,
    /// Aggregator and quick-gate thresholds.
    pub thresholds: ThresholdConfig,
    /// Engine invocation settings.
    pub engines: EngineConfig,
    /// Real-time pipeline sizing.
    pub pipeline: PipelineConfig,
    /// Watchdog and degraded-mode settings.
    pub watchdog: WatchdogConfig,
    /// Quarantine atomic-move retry policy.
    pub atomic_move: AtomicMoveConfig,
    /// Scan cache sizing.
    pub cache: CacheConfig,
    /// Second-opinion triggers.
    pub second_opinion: SecondOpinionConfig,
    /// Scan scoping.
    pub scoping: ScopingConfig,
    /// Path classification rules.
    pub paths: PathRules,
}

/// Owner of the live configuration.
///
/// Readers take cheap snapshots; the only mutation path is
/// [`update_and_persist`](Self::update_and_persist), which applies a closure
/// under the write lock and then writes the JSON file atomically.
pub struct ConfigService {
    inner: RwLock<VigilConfig>,
    path: Option<PathBuf>,
}

impl ConfigService {
    /// Creates a service around an in-memory configuration (no file).
    #[must_use]
    pub fn new(config: VigilConfig) -> Self {
        Self {
            inner: RwLock::new(config),
            path: None,
        }
    }

    /// Loads configuration from a JSON file, falling back to defaults if
    /// the file does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Config`] if the file exists but does not parse.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = if path.exists() {
            persist::read_json(path)
                .map_err(|e| VigilError::Config(format!("{}: {e}", path.display())))?
        } else {
            info!(path = %path.display(), "config file absent, using defaults");
            VigilConfig::default()
        };
        Ok(Self {
            inner: RwLock::new(config),
            path: Some(path.to_path_buf()),
        })
    }

    /// Returns a snapshot of the current configuration.
    #[must_use]
    pub fn snapshot(&self) -> VigilConfig {
        self.inner.read().expect("config lock poisoned").clone()
    }

    /// Returns true if the given lowercase SHA-256 is allowlisted.
    #[must_use]
    pub fn is_allowlisted(&self, sha256: &str) -> bool {
        self.inner
            .read()
            .expect("config lock poisoned")
            .scoping
            .sha256_allowlist
            .iter()
            .any(|h| h.eq_ignore_ascii_case(sha256))
    }

    /// Applies a mutation and persists the result atomically.
    ///
    /// The in-memory update always succeeds; a failed file write is
    /// returned as [`VigilError::Persistence`] for the caller to retry.
    pub fn update_and_persist<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut VigilConfig),
    {
        let snapshot = {
            let mut guard = self.inner.write().expect("config lock poisoned");
            mutate(&mut guard);
            guard.clone()
        };
        if let Some(path) = &self.path {
            persist::write_json_atomic(path, &snapshot).map_err(|e| {
                VigilError::Persistence {
                    store: "config".into(),
                    detail: e.to_string(),
                }
            })?;
            info!(path = %path.display(), "configuration persisted");
        }
        Ok(())
    }

    /// Adds a SHA-256 to the allowlist and persists.
    pub fn allowlist_sha256(&self, sha256: &str) -> Result<()> {
        let lowered = sha256.to_lowercase();
        self.update_and_persist(|config| {
            if !config
                .scoping
                .sha256_allowlist
                .iter()
                .any(|h| h.eq_ignore_ascii_case(&lowered))
            {
                config.scoping.sha256_allowlist.push(lowered.clone());
            }
        })
    }
}
