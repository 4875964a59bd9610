//! Upload of run artifacts to the reporting platform
//!
//! Artifact failures are retried and then downgraded to warnings. The run
//! verdict is never touched here.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::aggregate::RunSummary;
use crate::compare::CompareStatus;
use crate::error::{ShotError, ShotResult};

/// Uploads in flight at once
pub const UPLOAD_CONCURRENCY: usize = 10;
/// Attempts per artifact before giving up
pub const UPLOAD_ATTEMPTS: u32 = 3;

/// Reporting platform connection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub api_url: String,
    pub api_key: String,
    pub project_id: String,
}

/// Build metadata attached to the manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildMetadata {
    pub repository: Option<String>,
    pub commit: Option<String>,
    pub branch: Option<String>,
    pub build_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Current,
    Baseline,
    Difference,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Current => "current",
            ArtifactKind::Baseline => "baseline",
            ArtifactKind::Difference => "difference",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    /// `<key>.png`
    pub file_name: String,
    pub path: PathBuf,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadManifest<'a> {
    pub build: &'a BuildMetadata,
    pub summary: &'a RunSummary,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadReport {
    pub uploaded: usize,
    pub warnings: Vec<String>,
    /// Some artifact or the manifest did not make it
    pub report_incomplete: bool,
    pub report_id: Option<String>,
}

#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload_artifact(&self, build: &BuildMetadata, artifact: &Artifact, bytes: Vec<u8>) -> ShotResult<()>;

    /// Returns the platform's report id
    async fn upload_manifest(&self, manifest: &UploadManifest<'_>) -> ShotResult<String>;
}

/// Platform client over HTTP with bearer auth
pub struct HttpUploader {
    client: reqwest::Client,
    config: PlatformConfig,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestResponse {
    report_id: String,
}

impl HttpUploader {
    pub fn new(config: PlatformConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn build_url(&self, build: &BuildMetadata) -> String {
        format!(
            "{}/v1/projects/{}/builds/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.project_id,
            build.build_id
        )
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload_artifact(&self, build: &BuildMetadata, artifact: &Artifact, bytes: Vec<u8>) -> ShotResult<()> {
        let url = format!(
            "{}/artifacts/{}/{}",
            self.build_url(build),
            artifact.kind.as_str(),
            artifact.file_name
        );

        let resp = self
            .client
            .put(&url)
            .bearer_auth(&self.config.api_key)
            .header(reqwest::header::CONTENT_TYPE, "image/png")
            .body(bytes)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ShotError::Upload(format!("{} returned {}", url, resp.status())));
        }
        Ok(())
    }

    async fn upload_manifest(&self, manifest: &UploadManifest<'_>) -> ShotResult<String> {
        let url = format!("{}/manifest", self.build_url(manifest.build));

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(manifest)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ShotError::Upload(format!("{} returned {}", url, resp.status())));
        }
        let body: ManifestResponse = resp.json().await?;
        Ok(body.report_id)
    }
}

/// Current image for every captured target, the baseline when it was just
/// created, the diff image when the comparison failed
pub fn collect_artifacts(summary: &RunSummary) -> Vec<Artifact> {
    let mut artifacts = Vec::new();

    for result in &summary.results {
        let file_name = result.key.file_name();

        if let Some(path) = &result.current_image_path {
            artifacts.push(Artifact {
                kind: ArtifactKind::Current,
                file_name: file_name.clone(),
                path: path.clone(),
            });
        }
        if result.status == CompareStatus::NewBaselineCreated {
            if let Some(path) = &result.baseline_image_path {
                artifacts.push(Artifact {
                    kind: ArtifactKind::Baseline,
                    file_name: file_name.clone(),
                    path: path.clone(),
                });
            }
        }
        if let Some(path) = &result.diff_image_path {
            artifacts.push(Artifact {
                kind: ArtifactKind::Difference,
                file_name,
                path: path.clone(),
            });
        }
    }

    artifacts
}

pub struct UploadCoordinator {
    uploader: Arc<dyn Uploader>,
    concurrency: usize,
    attempts: u32,
    backoff: Duration,
}

impl UploadCoordinator {
    pub fn new(uploader: Arc<dyn Uploader>) -> Self {
        Self {
            uploader,
            concurrency: UPLOAD_CONCURRENCY,
            attempts: UPLOAD_ATTEMPTS,
            backoff: Duration::from_millis(500),
        }
    }

    /// Initial delay between attempts; doubles after each failure
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Upload every artifact, then the manifest if all artifacts made it
    pub async fn upload(&self, summary: &RunSummary, build: &BuildMetadata) -> UploadReport {
        let artifacts = collect_artifacts(summary);
        info!("Uploading {} artifact(s) for build {}", artifacts.len(), build.build_id);

        let counter = AtomicUsize::new(0);
        let uploaded = &counter;
        let warnings: Vec<String> = stream::iter(artifacts.iter())
            .map(|artifact| async move {
                match self.upload_with_retry(build, artifact).await {
                    Ok(()) => {
                        uploaded.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                    Err(e) => Some(format!(
                        "{} image {} not uploaded: {}",
                        artifact.kind.as_str(),
                        artifact.file_name,
                        e
                    )),
                }
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|warning| async move { warning })
            .collect()
            .await;

        let mut report = UploadReport {
            uploaded: counter.into_inner(),
            warnings,
            report_incomplete: false,
            report_id: None,
        };

        if !report.warnings.is_empty() {
            for warning in &report.warnings {
                warn!("{}", warning);
            }
            report.report_incomplete = true;
            report.warnings.push("manifest skipped: artifact uploads incomplete".to_string());
            return report;
        }

        let manifest = UploadManifest { build, summary };
        match self.uploader.upload_manifest(&manifest).await {
            Ok(report_id) => {
                info!("Report {} created", report_id);
                report.report_id = Some(report_id);
            }
            Err(e) => {
                warn!("Manifest upload failed: {}", e);
                report.report_incomplete = true;
                report.warnings.push(format!("manifest not uploaded: {}", e));
            }
        }

        report
    }

    async fn upload_with_retry(&self, build: &BuildMetadata, artifact: &Artifact) -> ShotResult<()> {
        let bytes = tokio::fs::read(&artifact.path).await?;
        let mut delay = self.backoff;
        let mut attempt = 1;

        loop {
            match self.uploader.upload_artifact(build, artifact, bytes.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.attempts => {
                    debug!(
                        "Upload of {} failed (attempt {}/{}): {}",
                        artifact.file_name, attempt, self.attempts, e
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
