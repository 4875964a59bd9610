//! Capture worker pool
//!
//! At most `shot_concurrency` captures are in flight. Results are sent to the
//! comparison stage in completion order, one per target key.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::catalog::ShotHooks;
use crate::diff::{exceeds_threshold, paint_masks, DiffAlgorithm};
use crate::error::{ShotError, ShotResult};
use crate::render::{RenderRequest, Renderer, TimeoutConfig};
use crate::retry::RetryController;
use crate::shot::{ShotLocation, ShotTarget, TargetKey, Viewport};
use crate::store::ImageStore;

#[derive(Debug, Clone)]
pub enum CaptureOutcome {
    /// Current image written to the current tree
    Captured { path: PathBuf },
    /// Every attempt failed; holds the last error
    Failed { error: String },
}

/// Output of capturing one target at one breakpoint
#[derive(Debug)]
pub struct CaptureResult {
    pub key: TargetKey,
    pub target: ShotTarget,
    pub outcome: CaptureOutcome,
    pub attempts_used: u32,
    pub captured_at: DateTime<Utc>,
}

pub struct CaptureStage {
    renderer: Arc<dyn Renderer>,
    store: Arc<ImageStore>,
    retry: RetryController,
    algorithm: DiffAlgorithm,
    default_viewport: Viewport,
    timeouts: TimeoutConfig,
    hooks: ShotHooks,
    concurrency: usize,
}

impl CaptureStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        renderer: Arc<dyn Renderer>,
        store: Arc<ImageStore>,
        retry: RetryController,
        algorithm: DiffAlgorithm,
        default_viewport: Viewport,
        timeouts: TimeoutConfig,
        hooks: ShotHooks,
        concurrency: usize,
    ) -> Self {
        Self {
            renderer,
            store,
            retry,
            algorithm,
            default_viewport,
            timeouts,
            hooks,
            concurrency: concurrency.max(1),
        }
    }

    /// Capture every target, sending each result as soon as it is ready
    pub async fn run(self: Arc<Self>, targets: Vec<ShotTarget>, tx: mpsc::Sender<CaptureResult>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for target in targets {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let stage = self.clone();
            let tx = tx.clone();
            tasks.spawn(async move {
                let result = stage.capture(target).await;
                drop(permit);

                if tx.send(result).await.is_err() {
                    warn!("Comparison stage closed before all captures were delivered");
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Capture task aborted: {}", e);
            }
        }
    }

    /// Capture one target with flakiness retries
    pub async fn capture(&self, target: ShotTarget) -> CaptureResult {
        let key = target.key();
        debug!("Capturing '{}'", key);

        let outcome = self
            .retry
            .run(
                key.as_str(),
                |number| self.attempt(&target, number),
                |previous, current| self.images_match(previous, current, &target),
            )
            .await;

        let capture_outcome = match outcome.result {
            Ok(bytes) => match self.store.write_current(&key, &bytes) {
                Ok(path) => CaptureOutcome::Captured { path },
                Err(e) => {
                    let err = ShotError::Capture {
                        key: key.to_string(),
                        reason: format!("cannot store current image: {}", e),
                    };
                    error!("{}", err);
                    CaptureOutcome::Failed { error: err.to_string() }
                }
            },
            Err(e) => {
                warn!("Capture of '{}' failed after {} attempt(s): {}", key, outcome.attempts, e);
                CaptureOutcome::Failed { error: e.to_string() }
            }
        };

        CaptureResult {
            key,
            target,
            outcome: capture_outcome,
            attempts_used: outcome.attempts,
            captured_at: Utc::now(),
        }
    }

    async fn attempt(&self, target: &ShotTarget, number: u32) -> ShotResult<Vec<u8>> {
        if let Some(hook) = &self.hooks.before_capture {
            hook(target);
        }

        match &target.location {
            ShotLocation::File(path) => Ok(tokio::fs::read(path).await?),
            ShotLocation::Url(url) => {
                let request = RenderRequest::for_target(target, url, self.default_viewport, &self.timeouts);
                let budget = request.attempt_budget();
                debug!("Rendering '{}' (attempt {}) at {}", request.key, number, url);

                match tokio::time::timeout(budget, self.renderer.render(&request)).await {
                    Ok(result) => result,
                    Err(_) => Err(ShotError::Timeout(format!(
                        "render of '{}' after {} ms",
                        request.key,
                        budget.as_millis()
                    ))),
                }
            }
        }
    }

    /// Self-comparison of two consecutive attempts, using the target's own
    /// threshold. Decoding and diffing run on the blocking pool.
    async fn images_match(&self, previous: Vec<u8>, current: Vec<u8>, target: &ShotTarget) -> bool {
        if previous == current {
            return true;
        }

        let algorithm = self.algorithm;
        let rects = target.mask_rects();
        let threshold = target.threshold;
        tokio::task::spawn_blocking(move || {
            let decode = |bytes: &[u8]| image::load_from_memory(bytes).map(|img| img.to_rgba8());
            let (mut a, mut b) = match (decode(&previous), decode(&current)) {
                (Ok(a), Ok(b)) => (a, b),
                _ => return false,
            };
            if a.dimensions() != b.dimensions() {
                return false;
            }

            paint_masks(&mut a, &rects);
            paint_masks(&mut b, &rects);

            let total = a.width() as u64 * a.height() as u64;
            let diff = algorithm.diff(&a, &b);
            !exceeds_threshold(diff.diff_pixels, threshold, total)
        })
        .await
        .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{RetryConfig, StabilityCheck};
    use crate::shot::{page_target, Mask, MaskRect};
    use crate::store::ImagePaths;
    use async_trait::async_trait;
    use image::{ImageOutputFormat, Rgba, RgbaImage};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn png(color: [u8; 4]) -> Vec<u8> {
        let img = RgbaImage::from_pixel(8, 8, Rgba(color));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageOutputFormat::Png).unwrap();
        buf.into_inner()
    }

    /// Alternates black and white on every call
    struct Flicker {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Renderer for Flicker {
        async fn render(&self, _request: &RenderRequest) -> ShotResult<Vec<u8>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(if n % 2 == 0 { png([0, 0, 0, 255]) } else { png([255, 255, 255, 255]) })
        }
    }

    struct Failing;

    #[async_trait]
    impl Renderer for Failing {
        async fn render(&self, request: &RenderRequest) -> ShotResult<Vec<u8>> {
            Err(ShotError::Playwright(format!("navigation to {} failed", request.url)))
        }
    }

    fn stage(renderer: Arc<dyn Renderer>, tmp: &TempDir, retries: u32) -> CaptureStage {
        let store = ImageStore::new(&ImagePaths {
            baseline_path: tmp.path().join("baseline"),
            current_path: tmp.path().join("current"),
            difference_path: tmp.path().join("difference"),
        })
        .unwrap();

        CaptureStage::new(
            renderer,
            Arc::new(store),
            RetryController::new(&RetryConfig {
                flakyness_retries: retries,
                wait_between_flakyness_retries: 0,
                stability: StabilityCheck::ConsecutiveMatch,
            }),
            DiffAlgorithm::Exact,
            Viewport::default(),
            TimeoutConfig::default(),
            ShotHooks::default(),
            2,
        )
    }

    #[tokio::test]
    async fn test_flickering_render_uses_every_attempt() {
        let tmp = TempDir::new().unwrap();
        let renderer = Arc::new(Flicker { calls: AtomicU32::new(0) });
        let stage = stage(renderer.clone(), &tmp, 3);

        let result = stage.capture(page_target("home", 0.0)).await;

        assert_eq!(renderer.calls.load(Ordering::SeqCst), 4);
        assert_eq!(result.attempts_used, 4);
        match result.outcome {
            CaptureOutcome::Captured { path } => assert!(path.ends_with("current/home.png")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_flicker_within_threshold_is_stable() {
        let tmp = TempDir::new().unwrap();
        let renderer = Arc::new(Flicker { calls: AtomicU32::new(0) });
        let stage = stage(renderer.clone(), &tmp, 3);

        // all 64 pixels may differ
        let result = stage.capture(page_target("home", 64.0)).await;
        assert_eq!(result.attempts_used, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_flicker_under_mask_is_stable() {
        let tmp = TempDir::new().unwrap();
        let renderer = Arc::new(Flicker { calls: AtomicU32::new(0) });
        let stage = stage(renderer.clone(), &tmp, 3);

        let mut target = page_target("home", 0.0);
        target.masks = vec![Mask::Rect(MaskRect {
            x: 0,
            y: 0,
            width: 8,
            height: 8,
        })];
        let result = stage.capture(target).await;

        assert_eq!(renderer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.attempts_used, 2);
    }

    #[tokio::test]
    async fn test_failed_capture_records_error() {
        let tmp = TempDir::new().unwrap();
        let stage = stage(Arc::new(Failing), &tmp, 1);

        let result = stage.capture(page_target("broken", 0.0)).await;
        assert_eq!(result.attempts_used, 2);
        match result.outcome {
            CaptureOutcome::Failed { error } => assert!(error.contains("navigation")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_prerendered_file_is_copied() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("ready.png");
        std::fs::write(&source, png([10, 20, 30, 255])).unwrap();

        let stage = stage(Arc::new(Failing), &tmp, 0);
        let mut target = page_target("ready", 0.0);
        target.location = ShotLocation::File(source.clone());

        let result = stage.capture(target).await;
        match result.outcome {
            CaptureOutcome::Captured { path } => {
                assert_eq!(std::fs::read(path).unwrap(), std::fs::read(source).unwrap());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_before_capture_hook_runs_per_attempt() {
        let tmp = TempDir::new().unwrap();
        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();

        let mut stage = stage(Arc::new(Failing), &tmp, 2);
        stage.hooks.before_capture = Some(Arc::new(move |_t: &ShotTarget| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        stage.capture(page_target("home", 0.0)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
