//! ML classifier engine.
//!
//! Feature extraction lives here; inference is an opaque collaborator
//! behind [`MlClassifier`] (a pure function from feature vector to
//! probability), so models can be swapped without touching the engine and
//! tests can plant exact probabilities.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use vigil_core::{EngineResult, EngineVerdict, ScanContext};

use crate::engine::{names, Engine};
use crate::heuristic;

/// DLLs whose presence correlates with droppers and stealers.
const SUSPICIOUS_DLLS: &[&str] = &[
    "wininet.dll",
    "urlmon.dll",
    "ws2_32.dll",
    "crypt32.dll",
    "advapi32.dll",
    "psapi.dll",
];

/// Numeric features extracted from a scan context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureVector {
    /// Content entropy in bits per byte.
    pub entropy: f64,
    /// Number of PE sections.
    pub section_count: f64,
    /// Total imported API count.
    pub import_count: f64,
    /// Imports from the high-risk API table.
    pub high_risk_import_count: f64,
    /// Imports of DLLs from the suspicious table.
    pub suspicious_dll_count: f64,
    /// 1.0 when no signature is present.
    pub unsigned: f64,
    /// log2 of the file size in KiB.
    pub log_size_kib: f64,
    /// Overlay bytes relative to image size.
    pub overlay_ratio: f64,
}

/// Classifier output.
#[derive(Debug, Clone, Copy)]
pub struct MlPrediction {
    /// Malware probability in `[0, 1]`.
    pub probability: f64,
    /// Raw decision-function output; its magnitude is the confidence.
    pub raw_score: f64,
    /// The model's own class decision.
    pub is_malware: bool,
}

/// Opaque inference collaborator.
pub trait MlClassifier: Send + Sync {
    /// Predicts from a feature vector. Pure.
    fn predict(&self, features: &FeatureVector) -> MlPrediction;
}

/// Built-in logistic model over the static features.
///
/// Weights are fixed; this stands in wherever no trained model has been
/// provisioned and keeps the engine's behavior deterministic in tests.
pub struct LogisticClassifier;

impl MlClassifier for LogisticClassifier {
    fn predict(&self, f: &FeatureVector) -> MlPrediction {
        let z = -4.2
            + 0.55 * (f.entropy - 5.0).max(0.0)
            + 0.45 * f.high_risk_import_count
            + 0.30 * f.suspicious_dll_count
            + 0.90 * f.unsigned
            + 0.60 * f.overlay_ratio.min(4.0)
            + 0.05 * f.import_count.min(40.0);
        let probability = 1.0 / (1.0 + (-z).exp());
        MlPrediction {
            probability,
            raw_score: z / 4.0,
            is_malware: probability > 0.5,
        }
    }
}

/// Extracts the feature vector from a context with a valid PE.
#[must_use]
pub fn extract_features(ctx: &ScanContext) -> Option<FeatureVector> {
    let pe = ctx.pe_info.as_ref().filter(|p| p.valid)?;
    let lowered_apis: Vec<String> = pe.imported_apis.iter().map(|a| a.to_lowercase()).collect();
    let lowered_dlls: Vec<String> = pe.imported_dlls.iter().map(|d| d.to_lowercase()).collect();

    Some(FeatureVector {
        entropy: pe.entropy,
        section_count: pe.section_names.len() as f64,
        import_count: lowered_apis.len() as f64,
        high_risk_import_count: lowered_apis
            .iter()
            .filter(|a| heuristic::is_high_risk_api(a))
            .count() as f64,
        suspicious_dll_count: lowered_dlls
            .iter()
            .filter(|d| SUSPICIOUS_DLLS.contains(&d.as_str()))
            .count() as f64,
        unsigned: if ctx.is_unsigned() { 1.0 } else { 0.0 },
        log_size_kib: ((ctx.file_size / 1024).max(1) as f64).log2(),
        overlay_ratio: pe.overlay_ratio,
    })
}

/// Engine wrapping the classifier.
pub struct MlEngine {
    classifier: Box<dyn MlClassifier>,
}

impl MlEngine {
    /// Creates the engine over the given classifier.
    #[must_use]
    pub fn new(classifier: Box<dyn MlClassifier>) -> Self {
        Self { classifier }
    }
}

impl Default for MlEngine {
    fn default() -> Self {
        Self::new(Box::new(LogisticClassifier))
    }
}

#[async_trait]
impl Engine for MlEngine {
    fn name(&self) -> &'static str {
        names::ML
    }

    fn default_weight(&self) -> f64 {
        0.7
    }

    async fn scan(&self, ctx: &ScanContext, _cancel: &CancellationToken) -> EngineResult {
        let Some(features) = extract_features(ctx) else {
            return EngineResult::new(self.name(), 0, EngineVerdict::Unknown, 0.0)
                .with_reason("not a valid PE, model skipped");
        };

        let prediction = self.classifier.predict(&features);
        let score = (prediction.probability * 100.0).round().clamp(0.0, 100.0) as u8;
        let verdict = if prediction.probability > 0.8 {
            EngineVerdict::Malicious
        } else if prediction.is_malware {
            EngineVerdict::Suspicious
        } else {
            EngineVerdict::Clean
        };
        let confidence = prediction.raw_score.abs().clamp(0.0, 1.0);

        let mut result = EngineResult::new(self.name(), score, verdict, confidence)
            .with_metadata("probability", format!("{:.3}", prediction.probability));

        if features.entropy > 7.0 {
            result = result.with_reason("model: high entropy");
        }
        if features.high_risk_import_count > 3.0 {
            result = result.with_reason("model: many dangerous imports");
        }
        if features.suspicious_dll_count > 2.0 {
            result = result.with_reason("model: many suspicious DLLs");
        }
        if features.unsigned > 0.0 {
            result = result.with_reason("model: unsigned binary");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{pe_context, plain_context};

    struct FixedClassifier(MlPrediction);

    impl MlClassifier for FixedClassifier {
        fn predict(&self, _features: &FeatureVector) -> MlPrediction {
            self.0
        }
    }

    fn engine_with(prediction: MlPrediction) -> MlEngine {
        MlEngine::new(Box::new(FixedClassifier(prediction)))
    }

    #[tokio::test]
    async fn test_non_pe_is_skipped() {
        let engine = MlEngine::default();
        let result = engine
            .scan(&plain_context("/tmp/notes.txt"), &CancellationToken::new())
            .await;
        assert_eq!(result.verdict, EngineVerdict::Unknown);
        assert!((result.confidence - 0.0).abs() < f64::EPSILON);
        assert!(result.reasons[0].contains("skipped"));
    }

    #[tokio::test]
    async fn test_high_probability_is_malicious() {
        let engine = engine_with(MlPrediction {
            probability: 0.93,
            raw_score: 2.8,
            is_malware: true,
        });
        let result = engine
            .scan(&pe_context("/tmp/a.exe"), &CancellationToken::new())
            .await;
        assert_eq!(result.verdict, EngineVerdict::Malicious);
        assert_eq!(result.score, 93);
        assert!((result.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_borderline_malware_is_suspicious() {
        let engine = engine_with(MlPrediction {
            probability: 0.62,
            raw_score: 0.4,
            is_malware: true,
        });
        let result = engine
            .scan(&pe_context("/tmp/a.exe"), &CancellationToken::new())
            .await;
        assert_eq!(result.verdict, EngineVerdict::Suspicious);
        assert_eq!(result.score, 62);
    }

    #[tokio::test]
    async fn test_clean_prediction() {
        let engine = engine_with(MlPrediction {
            probability: 0.04,
            raw_score: -1.9,
            is_malware: false,
        });
        let result = engine
            .scan(&pe_context("/tmp/a.exe"), &CancellationToken::new())
            .await;
        assert_eq!(result.verdict, EngineVerdict::Clean);
        assert_eq!(result.score, 4);
    }

    #[test]
    fn test_feature_extraction() {
        let mut ctx = pe_context("/tmp/a.exe");
        {
            let pe = ctx.pe_info.as_mut().unwrap();
            pe.entropy = 7.4;
            pe.imported_apis = vec![
                "VirtualAllocEx".into(),
                "WriteProcessMemory".into(),
                "ReadFile".into(),
            ];
            pe.imported_dlls = vec!["wininet.dll".into(), "kernel32.dll".into()];
        }

        let f = extract_features(&ctx).unwrap();
        assert!((f.entropy - 7.4).abs() < f64::EPSILON);
        assert!((f.high_risk_import_count - 2.0).abs() < f64::EPSILON);
        assert!((f.suspicious_dll_count - 1.0).abs() < f64::EPSILON);
        assert!((f.unsigned - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_logistic_classifier_orders_risk() {
        let benign = FeatureVector {
            entropy: 5.2,
            unsigned: 0.0,
            ..FeatureVector::default()
        };
        let hostile = FeatureVector {
            entropy: 7.9,
            high_risk_import_count: 6.0,
            suspicious_dll_count: 3.0,
            unsigned: 1.0,
            overlay_ratio: 2.5,
            ..FeatureVector::default()
        };

        let classifier = LogisticClassifier;
        let p_benign = classifier.predict(&benign).probability;
        let p_hostile = classifier.predict(&hostile).probability;
        assert!(p_hostile > p_benign);
        assert!(p_hostile > 0.8);
        assert!(p_benign < 0.2);
    }
}
