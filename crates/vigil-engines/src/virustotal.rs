//! Remote reputation second-opinion engine.
//!
//! The remote service is opaque behind [`RemoteReputationClient`]: look a
//! hash up, optionally upload small unknown files, and poll the analysis
//! until it settles. The engine normalizes whatever the service reports
//! into the common result shape; transport failures and timeouts become
//! Error results and never block the verdict.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use vigil_core::{EngineResult, EngineVerdict, Result, ScanContext, VigilError};

use crate::engine::{names, Engine};

/// Upload ceiling for unknown files.
const MAX_UPLOAD_BYTES: u64 = 32 * 1024 * 1024;

/// How often an in-flight analysis is polled.
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Total polling budget for one analysis.
const POLL_BUDGET: Duration = Duration::from_secs(5 * 60);

/// Normalized answer from the remote reputation service.
#[derive(Debug, Clone, Default)]
pub struct RemoteLookup {
    /// Whether the service knows the hash.
    pub found: bool,
    /// Engines that analyzed the sample.
    pub engines_total: u32,
    /// Engines reporting malicious.
    pub engines_malicious: u32,
    /// Engines reporting suspicious.
    pub engines_suspicious: u32,
    /// Per-engine detection labels.
    pub labels: HashMap<String, String>,
}

/// Opaque remote-reputation collaborator.
#[async_trait]
pub trait RemoteReputationClient: Send + Sync {
    /// Whether the client has credentials and may be called.
    fn configured(&self) -> bool;

    /// Looks up `sha256`; when unknown and the file is small enough, the
    /// implementation may upload `path` and poll for the verdict.
    async fn analyze(
        &self,
        sha256: &str,
        path: &Path,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<RemoteLookup>;
}

/// HTTP client for a VirusTotal-compatible REST surface.
pub struct HttpReputationClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpReputationClient {
    /// Creates a client; an empty key leaves it unconfigured.
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("reqwest client"),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn parse_stats(body: &serde_json::Value) -> RemoteLookup {
        let stats = &body["data"]["attributes"]["last_analysis_stats"];
        let count = |key: &str| stats[key].as_u64().unwrap_or(0) as u32;
        let malicious = count("malicious");
        let suspicious = count("suspicious");
        let total = malicious + suspicious + count("harmless") + count("undetected");

        let mut labels = HashMap::new();
        if let Some(results) = body["data"]["attributes"]["last_analysis_results"].as_object() {
            for (engine, detail) in results {
                if let Some(label) = detail["result"].as_str() {
                    labels.insert(engine.clone(), label.to_string());
                }
            }
        }

        RemoteLookup {
            found: true,
            engines_total: total,
            engines_malicious: malicious,
            engines_suspicious: suspicious,
            labels,
        }
    }

    async fn get_report(&self, sha256: &str) -> Result<Option<RemoteLookup>> {
        let url = format!("{}/files/{sha256}", self.base_url);
        let response = self
            .http
            .get(&url)
            .header("x-apikey", &self.api_key)
            .send()
            .await
            .map_err(|e| VigilError::TransientEngine {
                engine: names::VIRUS_TOTAL.into(),
                detail: e.to_string(),
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: serde_json::Value =
            response
                .error_for_status()
                .map_err(|e| VigilError::TransientEngine {
                    engine: names::VIRUS_TOTAL.into(),
                    detail: e.to_string(),
                })?
                .json()
                .await
                .map_err(|e| VigilError::TransientEngine {
                    engine: names::VIRUS_TOTAL.into(),
                    detail: e.to_string(),
                })?;
        Ok(Some(Self::parse_stats(&body)))
    }

    async fn upload(&self, path: &Path) -> Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| VigilError::io(path, e))?;
        let url = format!("{}/files", self.base_url);
        self.http
            .post(&url)
            .header("x-apikey", &self.api_key)
            .multipart(reqwest::multipart::Form::new().part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(
                    path.file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "sample".into()),
                ),
            ))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| VigilError::TransientEngine {
                engine: names::VIRUS_TOTAL.into(),
                detail: e.to_string(),
            })?;
        Ok(())
    }
}

#[async_trait]
impl RemoteReputationClient for HttpReputationClient {
    fn configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn analyze(
        &self,
        sha256: &str,
        path: &Path,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<RemoteLookup> {
        if let Some(report) = self.get_report(sha256).await? {
            return Ok(report);
        }
        if size > MAX_UPLOAD_BYTES {
            debug!(sha256, size, "unknown hash too large to upload");
            return Ok(RemoteLookup::default());
        }

        self.upload(path).await?;

        // Poll until the analysis lands or the budget runs out.
        let deadline = tokio::time::Instant::now() + POLL_BUDGET;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(VigilError::Cancelled),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
            if let Some(report) = self.get_report(sha256).await? {
                return Ok(report);
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(sha256, "analysis did not settle inside the polling budget");
                return Ok(RemoteLookup::default());
            }
        }
    }
}

/// Second-opinion engine over the remote reputation service.
pub struct VirusTotalEngine {
    client: std::sync::Arc<dyn RemoteReputationClient>,
    enabled: bool,
}

impl VirusTotalEngine {
    /// Creates the engine over a client handle.
    #[must_use]
    pub fn new(client: std::sync::Arc<dyn RemoteReputationClient>, enabled: bool) -> Self {
        Self { client, enabled }
    }
}

#[async_trait]
impl Engine for VirusTotalEngine {
    fn name(&self) -> &'static str {
        names::VIRUS_TOTAL
    }

    fn default_weight(&self) -> f64 {
        0.9
    }

    fn is_ready(&self) -> bool {
        self.enabled && self.client.configured()
    }

    async fn scan(&self, ctx: &ScanContext, cancel: &CancellationToken) -> EngineResult {
        let Some(sha256) = ctx.sha256.as_deref() else {
            return EngineResult::new(self.name(), 0, EngineVerdict::Unknown, 0.0)
                .with_reason("no content hash available");
        };

        let lookup = match self
            .client
            .analyze(sha256, &ctx.path, ctx.file_size, cancel)
            .await
        {
            Ok(lookup) => lookup,
            Err(e) => return EngineResult::error(self.name(), e.to_string()),
        };

        if !lookup.found {
            return EngineResult::new(self.name(), 0, EngineVerdict::Unknown, 0.3)
                .with_reason("hash unknown to remote reputation");
        }

        let total = lookup.engines_total.max(1);
        let ratio = f64::from(lookup.engines_malicious) / f64::from(total);
        let score = (ratio * 100.0).round() as u8;

        let (verdict, confidence) = if lookup.engines_malicious >= 3 {
            (EngineVerdict::Malicious, 0.9)
        } else if lookup.engines_malicious >= 1 || lookup.engines_suspicious >= 2 {
            (EngineVerdict::Suspicious, 0.7)
        } else {
            (EngineVerdict::Clean, 0.8)
        };

        let mut result = EngineResult::new(self.name(), score, verdict, confidence).with_reason(
            format!(
                "remote reputation: {}/{} engines flagged",
                lookup.engines_malicious, total
            ),
        );
        if let Some((engine, label)) = lookup.labels.iter().next() {
            result = result.with_metadata("sample_label", format!("{engine}: {label}"));
        }
        result
    }
}
