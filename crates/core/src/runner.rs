//! Pipeline orchestration: catalog, capture, compare, aggregate

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::aggregate::{Aggregator, RunSummary};
use crate::capture::CaptureStage;
use crate::catalog::{CatalogBuilder, ShotHooks};
use crate::compare::Comparator;
use crate::config::RunnerConfig;
use crate::error::ShotResult;
use crate::render::Renderer;
use crate::retry::RetryController;
use crate::store::ImageStore;
use crate::upload::{BuildMetadata, HttpUploader, UploadCoordinator, UploadReport};

/// Drives one visual-regression run
pub struct ShotRunner {
    config: RunnerConfig,
    renderer: Arc<dyn Renderer>,
    hooks: ShotHooks,
}

impl ShotRunner {
    pub fn new(config: RunnerConfig, renderer: Arc<dyn Renderer>) -> Self {
        Self {
            config,
            renderer,
            hooks: ShotHooks::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: ShotHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run the whole pipeline.
    ///
    /// Configuration and discovery errors are returned before any capture
    /// starts. Everything after that ends up in the summary.
    pub async fn run(&self) -> ShotResult<RunSummary> {
        let started_at = Utc::now();
        self.config.validate()?;

        let targets = CatalogBuilder::new(
            &self.config.catalog,
            &self.config.defaults,
            &self.config.timeouts,
            &self.hooks,
        )
        .build()
        .await?;
        info!("Discovered {} shot(s)", targets.len());

        let store = Arc::new(ImageStore::new(&self.config.images)?);
        store.clean_outputs()?;

        let aggregator = Aggregator::new(&targets, self.config.compare.failure_policy());

        let (capture_tx, capture_rx) = mpsc::channel(self.config.concurrency.compare_concurrency);
        let (result_tx, result_rx) = mpsc::unbounded_channel();

        let capture_stage = Arc::new(CaptureStage::new(
            self.renderer.clone(),
            store.clone(),
            RetryController::new(&self.config.retries),
            self.config.compare.engine,
            self.config.defaults.viewport,
            self.config.timeouts.clone(),
            self.hooks.clone(),
            self.config.concurrency.shot_concurrency,
        ));
        let comparator = Arc::new(Comparator::new(
            store.clone(),
            self.config.compare.engine,
            self.config.compare.mode,
        ));

        let capture_handle = tokio::spawn(capture_stage.run(targets, capture_tx));
        let compare_handle = tokio::spawn(comparator.run(
            capture_rx,
            result_tx,
            self.config.concurrency.compare_concurrency,
        ));

        let summary = aggregator.collect(result_rx, started_at).await;

        if let Ok(baselines) = store.list_baselines() {
            let unused = baselines
                .iter()
                .filter(|name| !summary.results.iter().any(|r| r.key.as_str() == name.as_str()))
                .count();
            if unused > 0 {
                info!("{} baseline(s) not matched by any shot in this run", unused);
            }
        }

        for (stage, handle) in [("capture", capture_handle), ("compare", compare_handle)] {
            if let Err(e) = handle.await {
                error!("{} stage panicked: {}", stage, e);
            }
        }

        Ok(summary)
    }

    /// Where the JSON summary lands: next to the current image tree
    pub fn results_path(&self) -> PathBuf {
        let current = &self.config.images.current_path;
        current
            .parent()
            .map(|p| p.join("results.json"))
            .unwrap_or_else(|| PathBuf::from("results.json"))
    }

    pub fn write_results(&self, summary: &RunSummary) -> ShotResult<PathBuf> {
        summary.write_json(&self.results_path())
    }

    /// Ship artifacts and the summary when a platform is configured
    pub async fn upload(&self, summary: &RunSummary, build: &BuildMetadata) -> Option<UploadReport> {
        let platform = match &self.config.platform {
            Some(platform) => platform.clone(),
            None => {
                debug!("No platform configured, skipping upload");
                return None;
            }
        };

        let coordinator = UploadCoordinator::new(Arc::new(HttpUploader::new(platform)));
        Some(coordinator.upload(summary, build).await)
    }
}

/// Discover, capture, compare and aggregate in one call
pub async fn run_pipeline(
    config: &RunnerConfig,
    renderer: Arc<dyn Renderer>,
    hooks: ShotHooks,
) -> ShotResult<RunSummary> {
    ShotRunner::new(config.clone(), renderer)
        .with_hooks(hooks)
        .run()
        .await
}
