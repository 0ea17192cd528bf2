//! PE heuristic engine.
//!
//! Scores a file from static indicators in the parsed PE metadata plus a
//! few path-shape checks. Every sub-check contributes a capped number of
//! points; the clamped total maps to a verdict. The point budget is tuned
//! so no single weak indicator can cross the suspicious line on its own.

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use vigil_core::{EngineResult, EngineVerdict, PathRules, PeInfo, ScanContext};

use crate::engine::{names, Engine};

/// APIs tied to injection, execution, and persistence.
const HIGH_RISK_APIS: &[&str] = &[
    "virtualallocex",
    "writeprocessmemory",
    "createremotethread",
    "ntcreatethreadex",
    "queueuserapc",
    "setwindowshookexa",
    "setwindowshookexw",
    "ntmapviewofsection",
    "rtlcreateuserthread",
    "setthreadcontext",
    "adjusttokenprivileges",
    "isdebuggerpresent",
];

/// APIs common in droppers and loaders but also in legitimate software.
const MEDIUM_RISK_APIS: &[&str] = &[
    "loadlibrarya",
    "loadlibraryw",
    "getprocaddress",
    "winexec",
    "shellexecutea",
    "shellexecutew",
    "urldownloadtofilea",
    "urldownloadtofilew",
    "internetopena",
    "internetopenurla",
    "regsetvaluea",
    "regsetvalueexa",
    "regsetvalueexw",
    "createprocessa",
    "createprocessw",
];

/// Section names planted by well-known packers.
const PACKER_SECTIONS: &[&str] = &[
    "upx0", "upx1", "upx2", ".themida", ".vmp0", ".vmp1", ".vmp2", ".enigma1", ".enigma2",
    ".aspack", ".adata", ".mpress1", ".mpress2", ".petite", ".nsp0", ".nsp1",
];

/// Sections emitted by mainstream toolchains.
const STANDARD_SECTIONS: &[&str] = &[
    ".text", ".data", ".rdata", ".rsrc", ".reloc", ".idata", ".edata", ".pdata", ".tls",
    ".bss", ".debug", ".crt", ".xdata",
];

/// Publishers whose valid signatures lower suspicion.
pub(crate) const TRUSTED_PUBLISHERS: &[&str] = &[
    "microsoft",
    "google",
    "mozilla",
    "apple",
    "adobe",
    "oracle",
    "intel",
    "nvidia",
];

/// Extensions that execute when double-extension bait is clicked.
const EXECUTABLE_EXTENSIONS: &[&str] = &["exe", "scr", "com", "pif", "bat", "cmd", "msi"];

/// Score-to-verdict mapping thresholds.
const MALICIOUS_SCORE: u32 = 70;
const SUSPICIOUS_SCORE: u32 = 35;

/// True if the (lowercased) API name sits in the high-risk table.
pub(crate) fn is_high_risk_api(lowered: &str) -> bool {
    HIGH_RISK_APIS.contains(&lowered)
}

/// Static-heuristics engine over parsed PE metadata.
pub struct HeuristicEngine {
    rules: PathRules,
}

impl HeuristicEngine {
    /// Creates the engine with the given path rules.
    #[must_use]
    pub fn new(rules: PathRules) -> Self {
        Self { rules }
    }

    fn score_imports(pe: &PeInfo, score: &mut u32, reasons: &mut Vec<String>) {
        let lowered: Vec<String> = pe.imported_apis.iter().map(|a| a.to_lowercase()).collect();

        let high = lowered
            .iter()
            .filter(|api| HIGH_RISK_APIS.contains(&api.as_str()))
            .count() as u32;
        if high > 0 {
            *score += (high * 8).min(35);
            reasons.push(format!("{high} high-risk API import(s)"));
        }

        let medium = lowered
            .iter()
            .filter(|api| MEDIUM_RISK_APIS.contains(&api.as_str()))
            .count() as u32;
        if medium > 0 {
            *score += (medium * 4).min(20);
            reasons.push(format!("{medium} medium-risk API import(s)"));
        }

        let has = |name: &str| lowered.iter().any(|a| a == name);
        let remote_thread = has("createremotethread") || has("ntcreatethreadex");
        if has("virtualallocex") && has("writeprocessmemory") && remote_thread {
            *score += 20;
            reasons.push("process-injection import pattern".into());
        }
    }

    fn score_entropy(pe: &PeInfo, score: &mut u32, reasons: &mut Vec<String>) {
        let points = if pe.entropy > 7.5 {
            25
        } else if pe.entropy > 7.0 {
            15
        } else if pe.entropy > 6.5 {
            5
        } else {
            0
        };
        if points > 0 {
            *score += points;
            reasons.push(format!("high entropy ({:.2})", pe.entropy));
        }
    }

    fn score_sections(pe: &PeInfo, score: &mut u32, reasons: &mut Vec<String>) {
        let lowered: Vec<String> = pe.section_names.iter().map(|s| s.to_lowercase()).collect();

        if lowered
            .iter()
            .any(|s| PACKER_SECTIONS.iter().any(|p| s.starts_with(p)))
        {
            *score += 20;
            reasons.push("packer section names".into());
        }

        let count = lowered.len();
        if count < 2 {
            *score += 10;
            reasons.push(format!("abnormal section count ({count})"));
        } else if count > 10 {
            *score += 8;
            reasons.push(format!("abnormal section count ({count})"));
        }

        let nonstandard: std::collections::HashSet<&String> = lowered
            .iter()
            .filter(|s| !STANDARD_SECTIONS.contains(&s.as_str()))
            .collect();
        if nonstandard.len() > 2 {
            *score += 5;
            reasons.push("multiple non-standard section names".into());
        }
    }

    fn score_signature(ctx: &ScanContext, pe: &PeInfo, score: &mut u32, reasons: &mut Vec<String>) {
        if !pe.has_signature && ctx.signer_name.is_none() {
            *score += 10;
            reasons.push("unsigned PE".into());
        } else if ctx.signature_valid == Some(false) {
            *score += 15;
            reasons.push("invalid signature".into());
        } else if let Some(signer) = &ctx.signer_name {
            let lowered = signer.to_lowercase();
            if !TRUSTED_PUBLISHERS.iter().any(|p| lowered.contains(p)) {
                *score += 5;
                reasons.push(format!("unknown publisher '{signer}'"));
            }
        }
    }

    fn score_timestamp(pe: &PeInfo, score: &mut u32, reasons: &mut Vec<String>) {
        let Some(ts) = pe.compile_timestamp else { return };
        let now = Utc::now();
        if ts > now {
            *score += 10;
            reasons.push("compile timestamp in the future".into());
        } else if now - ts > chrono::Duration::days(30 * 365) {
            *score += 5;
            reasons.push("compile timestamp over 30 years old".into());
        }
    }

    fn score_path(&self, ctx: &ScanContext, score: &mut u32, reasons: &mut Vec<String>) {
        let lowered = ctx.path.to_string_lossy().to_lowercase();
        if self.rules.is_suspicious(&lowered) {
            *score += 10;
            reasons.push("suspicious path".into());
        }

        // "invoice.pdf.exe" style bait: an inner extension under an
        // executable outer one.
        if EXECUTABLE_EXTENSIONS.contains(&ctx.extension.as_str()) {
            let stem_has_ext = ctx
                .path
                .file_stem()
                .map(|s| s.to_string_lossy().contains('.'))
                .unwrap_or(false);
            if stem_has_ext {
                *score += 15;
                reasons.push("double extension".into());
            }
        }
    }

    fn score_context(ctx: &ScanContext, pe: Option<&PeInfo>, score: &mut u32, reasons: &mut Vec<String>) {
        let valid_pe = pe.is_some_and(|p| p.valid);
        let unsigned = ctx.is_unsigned();

        if valid_pe && ctx.file_size < 10 * 1024 {
            *score += 10;
            reasons.push("unusually small PE".into());
        }

        if ctx.location.in_startup_path {
            if unsigned {
                *score += 20;
                reasons.push("unsigned file in startup path".into());
            } else {
                *score += 8;
                reasons.push("file in startup path".into());
            }
        }

        if ctx.location.from_temp_or_appdata && valid_pe {
            if unsigned {
                *score += 15;
                reasons.push("unsigned PE in temp/appdata".into());
            } else {
                *score += 5;
                reasons.push("PE in temp/appdata".into());
            }
        }

        if valid_pe && unsigned {
            if let Some(age) = ctx.created_age() {
                if age < chrono::Duration::minutes(2) {
                    *score += 12;
                    reasons.push("newly created unsigned PE".into());
                }
            }
        }

        if let Some(pe) = pe {
            if pe.overlay_ratio > 2.0 {
                *score += 8;
                reasons.push(format!("large overlay (ratio {:.1})", pe.overlay_ratio));
            }
        }
    }
}

#[async_trait]
impl Engine for HeuristicEngine {
    fn name(&self) -> &'static str {
        names::HEURISTIC
    }

    fn default_weight(&self) -> f64 {
        0.8
    }

    async fn scan(&self, ctx: &ScanContext, _cancel: &CancellationToken) -> EngineResult {
        let mut score: u32 = 0;
        let mut reasons: Vec<String> = Vec::new();

        if let Some(pe) = ctx.pe_info.as_ref().filter(|p| p.valid) {
            Self::score_imports(pe, &mut score, &mut reasons);
            Self::score_entropy(pe, &mut score, &mut reasons);
            Self::score_sections(pe, &mut score, &mut reasons);
            Self::score_signature(ctx, pe, &mut score, &mut reasons);
            Self::score_timestamp(pe, &mut score, &mut reasons);
        }
        self.score_path(ctx, &mut score, &mut reasons);
        Self::score_context(ctx, ctx.pe_info.as_ref(), &mut score, &mut reasons);

        let score = score.min(100) as u8;
        let verdict = if u32::from(score) >= MALICIOUS_SCORE {
            EngineVerdict::Malicious
        } else if u32::from(score) >= SUSPICIOUS_SCORE {
            EngineVerdict::Suspicious
        } else {
            EngineVerdict::Clean
        };
        let confidence = if score >= 50 { 0.75 } else { 0.6 };

        let mut result = EngineResult::new(self.name(), score, verdict, confidence);
        result.reasons = reasons;
        result
    }
}
