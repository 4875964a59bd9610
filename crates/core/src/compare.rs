//! Comparison engine
//!
//! Consumes capture results as they arrive and produces exactly one
//! [`ComparisonResult`] per target key, with at most `compare_concurrency`
//! comparisons running at once.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureOutcome, CaptureResult};
use crate::diff::{exceeds_threshold, paint_masks, DiffAlgorithm};
use crate::error::ShotResult;
use crate::shot::{MaskRect, TargetKey};
use crate::store::{hash_bytes, ImageStore};

/// What to do about missing baselines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Compare against existing baselines; a missing one is reported
    #[default]
    Compare,
    /// Write the current image as the baseline when none exists
    GenerateOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareStatus {
    Passed,
    Failed,
    NewBaselineCreated,
    BaselineMissingAndKept,
    Error,
}

/// Outcome for one target key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub key: TargetKey,
    pub id: String,
    pub display_name: String,
    pub status: CompareStatus,
    pub diff_pixel_count: u64,
    pub diff_fraction: f64,
    pub total_pixels: u64,
    pub threshold: f64,
    /// Only set when the comparison failed on pixels
    pub diff_image_path: Option<PathBuf>,
    pub current_image_path: Option<PathBuf>,
    pub baseline_image_path: Option<PathBuf>,
    pub attempts_used: u32,
    pub error: Option<String>,
}

impl ComparisonResult {
    fn for_capture(capture: &CaptureResult, status: CompareStatus) -> Self {
        Self {
            key: capture.key.clone(),
            id: capture.target.id.clone(),
            display_name: capture.target.display_name.clone(),
            status,
            diff_pixel_count: 0,
            diff_fraction: 0.0,
            total_pixels: 0,
            threshold: capture.target.threshold,
            diff_image_path: None,
            current_image_path: match &capture.outcome {
                CaptureOutcome::Captured { path } => Some(path.clone()),
                CaptureOutcome::Failed { .. } => None,
            },
            baseline_image_path: None,
            attempts_used: capture.attempts_used,
            error: None,
        }
    }

    /// Error result for a key whose comparison never completed
    pub fn aborted(key: TargetKey, id: String, display_name: String, threshold: f64, reason: String) -> Self {
        Self {
            key,
            id,
            display_name,
            status: CompareStatus::Error,
            diff_pixel_count: 0,
            diff_fraction: 0.0,
            total_pixels: 0,
            threshold,
            diff_image_path: None,
            current_image_path: None,
            baseline_image_path: None,
            attempts_used: 0,
            error: Some(reason),
        }
    }

    fn with_error(mut self, reason: String) -> Self {
        self.status = CompareStatus::Error;
        self.error = Some(reason);
        self
    }
}

pub struct Comparator {
    store: Arc<ImageStore>,
    algorithm: DiffAlgorithm,
    mode: RunMode,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Comparator {
    pub fn new(store: Arc<ImageStore>, algorithm: DiffAlgorithm, mode: RunMode) -> Self {
        Self {
            store,
            algorithm,
            mode,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Most comparisons that were ever running at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn compare_tracked(&self, capture: CaptureResult) -> ComparisonResult {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = self.compare(capture);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Compare one capture against its baseline. Never fails: errors become
    /// [`CompareStatus::Error`].
    pub fn compare(&self, capture: CaptureResult) -> ComparisonResult {
        let base = ComparisonResult::for_capture(&capture, CompareStatus::Error);

        let path = match &capture.outcome {
            CaptureOutcome::Captured { path } => path,
            CaptureOutcome::Failed { error } => return base.with_error(error.clone()),
        };

        match self.compare_captured(&capture, path, base.clone()) {
            Ok(result) => {
                debug!("'{}' -> {:?} ({} px)", result.key, result.status, result.diff_pixel_count);
                result
            }
            Err(e) => {
                warn!("Comparison of '{}' failed: {}", capture.key, e);
                base.with_error(e.to_string())
            }
        }
    }

    fn compare_captured(
        &self,
        capture: &CaptureResult,
        current_path: &Path,
        mut result: ComparisonResult,
    ) -> ShotResult<ComparisonResult> {
        let key = &capture.key;
        let current_bytes = std::fs::read(current_path)?;

        let baseline_bytes = match self.store.read_baseline(key)? {
            Some(bytes) => bytes,
            None => {
                match self.mode {
                    RunMode::GenerateOnly => {
                        result.baseline_image_path = Some(self.store.write_baseline(key, &current_bytes)?);
                        result.status = CompareStatus::NewBaselineCreated;
                    }
                    RunMode::Compare => {
                        info!("No baseline for '{}' - run in generate-only mode to create it", key);
                        result.status = CompareStatus::BaselineMissingAndKept;
                    }
                }
                return Ok(result);
            }
        };
        result.baseline_image_path = Some(self.store.baseline_path(key));

        let mut current = image::load_from_memory(&current_bytes)?.to_rgba8();
        result.total_pixels = pixel_count(&current);

        // Quick hash comparison
        if hash_bytes(&current_bytes) == hash_bytes(&baseline_bytes) {
            result.status = CompareStatus::Passed;
            return Ok(result);
        }

        let mut baseline = image::load_from_memory(&baseline_bytes)?.to_rgba8();
        let masks: Vec<MaskRect> = capture.target.mask_rects();
        paint_masks(&mut current, &masks);
        paint_masks(&mut baseline, &masks);

        if current.dimensions() != baseline.dimensions() {
            warn!(
                "Screenshot dimensions differ for '{}': current {:?} vs baseline {:?}",
                key,
                current.dimensions(),
                baseline.dimensions()
            );

            // Every pixel of the larger image counts as different
            let total = pixel_count(&current).max(pixel_count(&baseline));
            result.total_pixels = total;
            result.diff_pixel_count = total;
            result.diff_fraction = 1.0;
            result.status = if exceeds_threshold(total, capture.target.threshold, total) {
                CompareStatus::Failed
            } else {
                CompareStatus::Passed
            };
            return Ok(result);
        }

        let output = self.algorithm.diff(&baseline, &current);
        let total = result.total_pixels;
        result.diff_pixel_count = output.diff_pixels;
        result.diff_fraction = if total == 0 {
            0.0
        } else {
            output.diff_pixels as f64 / total as f64
        };

        if exceeds_threshold(output.diff_pixels, capture.target.threshold, total) {
            warn!(
                "Visual regression detected in '{}': {} of {} pixels differ (threshold: {})",
                key, output.diff_pixels, total, capture.target.threshold
            );
            result.diff_image_path = Some(self.store.write_diff(key, &output.diff_image)?);
            result.status = CompareStatus::Failed;
        } else {
            result.status = CompareStatus::Passed;
        }

        Ok(result)
    }

    /// Drain `rx`, comparing each capture as it arrives, and forward results to `tx`
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<CaptureResult>,
        tx: mpsc::UnboundedSender<ComparisonResult>,
        concurrency: usize,
    ) {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();

        while let Some(capture) = rx.recv().await {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let comparator = self.clone();
            let tx = tx.clone();
            tasks.spawn(async move {
                let fallback = ComparisonResult::for_capture(&capture, CompareStatus::Error);
                let result = tokio::task::spawn_blocking(move || comparator.compare_tracked(capture))
                    .await
                    .unwrap_or_else(|e| fallback.with_error(format!("comparison task aborted: {}", e)));
                drop(permit);

                if tx.send(result).is_err() {
                    warn!("Aggregator closed before all comparisons were delivered");
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Comparison task aborted: {}", e);
            }
        }
        debug!("Comparison stage done, at most {} in flight", self.peak_in_flight());
    }
}

fn pixel_count(image: &RgbaImage) -> u64 {
    image.width() as u64 * image.height() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shot::{page_target, Mask, ShotTarget};
    use crate::store::ImagePaths;
    use chrono::Utc;
    use image::Rgba;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        store: Arc<ImageStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let store = ImageStore::new(&ImagePaths {
                baseline_path: tmp.path().join("baseline"),
                current_path: tmp.path().join("current"),
                difference_path: tmp.path().join("difference"),
            })
            .unwrap();
            Self {
                _tmp: tmp,
                store: Arc::new(store),
            }
        }

        fn comparator(&self, mode: RunMode) -> Comparator {
            Comparator::new(self.store.clone(), DiffAlgorithm::Exact, mode)
        }

        fn baseline(&self, key: &TargetKey, img: &RgbaImage) {
            img.save(self.store.baseline_path(key)).unwrap();
        }

        fn capture(&self, target: ShotTarget, img: &RgbaImage) -> CaptureResult {
            let key = target.key();
            let path = self.store.current_path(&key);
            img.save(&path).unwrap();
            CaptureResult {
                key,
                target,
                outcome: CaptureOutcome::Captured { path },
                attempts_used: 1,
                captured_at: Utc::now(),
            }
        }
    }

    /// 100x100 white image with `n` black pixels, filled row by row
    fn image_with_diff(n: u32) -> RgbaImage {
        let mut img = RgbaImage::from_pixel(100, 100, Rgba([255, 255, 255, 255]));
        for i in 0..n {
            img.put_pixel(i % 100, i / 100, Rgba([0, 0, 0, 255]));
        }
        img
    }

    #[test]
    fn test_identical_images_pass() {
        let fx = Fixture::new();
        let target = page_target("home", 0.0);
        fx.baseline(&target.key(), &image_with_diff(0));

        let result = fx.comparator(RunMode::Compare).compare(fx.capture(target, &image_with_diff(0)));
        assert_eq!(result.status, CompareStatus::Passed);
        assert_eq!(result.diff_pixel_count, 0);
        assert!(result.diff_image_path.is_none());
    }

    #[test]
    fn test_within_fractional_threshold_passes() {
        let fx = Fixture::new();
        let target = page_target("home", 0.01);
        fx.baseline(&target.key(), &image_with_diff(0));

        let result = fx.comparator(RunMode::Compare).compare(fx.capture(target, &image_with_diff(50)));
        assert_eq!(result.status, CompareStatus::Passed);
        assert_eq!(result.diff_pixel_count, 50);
        assert!((result.diff_fraction - 0.005).abs() < 1e-9);
        assert!(result.diff_image_path.is_none());
    }

    #[test]
    fn test_beyond_fractional_threshold_fails_with_diff_image() {
        let fx = Fixture::new();
        let target = page_target("home", 0.01);
        fx.baseline(&target.key(), &image_with_diff(0));

        let result = fx.comparator(RunMode::Compare).compare(fx.capture(target, &image_with_diff(150)));
        assert_eq!(result.status, CompareStatus::Failed);
        assert_eq!(result.diff_pixel_count, 150);
        let diff_path = result.diff_image_path.unwrap();
        assert!(diff_path.exists());
    }

    #[test]
    fn test_absolute_threshold() {
        let fx = Fixture::new();
        let target = page_target("home", 150.0);
        fx.baseline(&target.key(), &image_with_diff(0));

        let result = fx.comparator(RunMode::Compare).compare(fx.capture(target, &image_with_diff(150)));
        assert_eq!(result.status, CompareStatus::Passed);
    }

    #[test]
    fn test_dimension_mismatch_is_maximal() {
        let fx = Fixture::new();
        let target = page_target("home", 0.5);
        fx.baseline(&target.key(), &RgbaImage::from_pixel(100, 120, Rgba([255, 255, 255, 255])));

        let result = fx.comparator(RunMode::Compare).compare(fx.capture(target, &image_with_diff(0)));
        assert_eq!(result.status, CompareStatus::Failed);
        assert_eq!(result.diff_pixel_count, 12_000);
        assert_eq!(result.total_pixels, 12_000);
        assert!(result.diff_image_path.is_none());
    }

    #[test]
    fn test_dimension_mismatch_tolerated_by_large_absolute_threshold() {
        let fx = Fixture::new();
        let target = page_target("home", 12_000.0);
        fx.baseline(&target.key(), &RgbaImage::from_pixel(100, 120, Rgba([255, 255, 255, 255])));

        let result = fx.comparator(RunMode::Compare).compare(fx.capture(target, &image_with_diff(0)));
        assert_eq!(result.status, CompareStatus::Passed);
    }

    #[test]
    fn test_masked_region_is_ignored() {
        let fx = Fixture::new();
        let mut target = page_target("home", 0.0);
        target.masks = vec![Mask::Rect(MaskRect { x: 0, y: 0, width: 100, height: 2 })];
        fx.baseline(&target.key(), &image_with_diff(0));

        let result = fx.comparator(RunMode::Compare).compare(fx.capture(target, &image_with_diff(200)));
        assert_eq!(result.status, CompareStatus::Passed);
        assert_eq!(result.diff_pixel_count, 0);
    }

    #[test]
    fn test_generate_only_creates_baseline() {
        let fx = Fixture::new();
        let target = page_target("new-page", 0.0);
        let key = target.key();

        let result = fx.comparator(RunMode::GenerateOnly).compare(fx.capture(target, &image_with_diff(3)));
        assert_eq!(result.status, CompareStatus::NewBaselineCreated);
        assert_eq!(
            fx.store.read_baseline(&key).unwrap().unwrap(),
            std::fs::read(fx.store.current_path(&key)).unwrap()
        );
    }

    #[test]
    fn test_missing_baseline_in_compare_mode_is_kept() {
        let fx = Fixture::new();
        let target = page_target("new-page", 0.0);
        let key = target.key();

        let result = fx.comparator(RunMode::Compare).compare(fx.capture(target, &image_with_diff(0)));
        assert_eq!(result.status, CompareStatus::BaselineMissingAndKept);
        assert!(fx.store.read_baseline(&key).unwrap().is_none());
        assert!(result.current_image_path.is_some());
    }

    #[test]
    fn test_failed_capture_becomes_error() {
        let fx = Fixture::new();
        let target = page_target("broken", 0.0);
        let capture = CaptureResult {
            key: target.key(),
            target,
            outcome: CaptureOutcome::Failed {
                error: "Timeout waiting for: render".to_string(),
            },
            attempts_used: 3,
            captured_at: Utc::now(),
        };

        let result = fx.comparator(RunMode::Compare).compare(capture);
        assert_eq!(result.status, CompareStatus::Error);
        assert_eq!(result.attempts_used, 3);
        assert!(result.error.unwrap().contains("Timeout"));
    }

    #[test]
    fn test_corrupt_baseline_is_error() {
        let fx = Fixture::new();
        let target = page_target("home", 0.0);
        std::fs::write(fx.store.baseline_path(&target.key()), b"not a png").unwrap();

        let result = fx.comparator(RunMode::Compare).compare(fx.capture(target, &image_with_diff(0)));
        assert_eq!(result.status, CompareStatus::Error);
    }

    #[tokio::test]
    async fn test_stage_emits_one_result_per_capture() {
        let fx = Fixture::new();
        let (capture_tx, capture_rx) = mpsc::channel(4);
        let (result_tx, mut result_rx) = mpsc::unbounded_channel();

        let comparator = Arc::new(fx.comparator(RunMode::GenerateOnly));
        let stage = tokio::spawn(comparator.run(capture_rx, result_tx, 2));

        for name in ["a", "b", "c", "d", "e"] {
            capture_tx
                .send(fx.capture(page_target(name, 0.0), &image_with_diff(1)))
                .await
                .unwrap();
        }
        drop(capture_tx);
        stage.await.unwrap();

        let mut keys = Vec::new();
        while let Some(result) = result_rx.recv().await {
            assert_eq!(result.status, CompareStatus::NewBaselineCreated);
            keys.push(result.key.to_string());
        }
        keys.sort();
        assert_eq!(keys, vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stage_never_exceeds_compare_concurrency() {
        let fx = Fixture::new();
        let names: Vec<String> = (0..12).map(|i| format!("shot-{}", i)).collect();
        for name in &names {
            fx.baseline(&page_target(name, 0.0).key(), &image_with_diff(0));
        }

        let (capture_tx, capture_rx) = mpsc::channel(names.len());
        let (result_tx, mut result_rx) = mpsc::unbounded_channel();
        for name in &names {
            capture_tx
                .send(fx.capture(page_target(name, 0.0), &image_with_diff(500)))
                .await
                .unwrap();
        }
        drop(capture_tx);

        let comparator = Arc::new(fx.comparator(RunMode::Compare));
        comparator.clone().run(capture_rx, result_tx, 2).await;

        let mut received = 0;
        while let Some(result) = result_rx.recv().await {
            assert_eq!(result.status, CompareStatus::Failed);
            received += 1;
        }
        assert_eq!(received, names.len());
        assert!(comparator.peak_in_flight() >= 1);
        assert!(comparator.peak_in_flight() <= 2);
    }

    #[tokio::test]
    async fn test_stage_finishes_when_results_are_dropped() {
        let fx = Fixture::new();
        let (capture_tx, capture_rx) = mpsc::channel(4);
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        drop(result_rx);

        for name in ["a", "b", "c"] {
            capture_tx
                .send(fx.capture(page_target(name, 0.0), &image_with_diff(1)))
                .await
                .unwrap();
        }
        drop(capture_tx);

        let comparator = Arc::new(fx.comparator(RunMode::GenerateOnly));
        comparator.clone().run(capture_rx, result_tx, 2).await;

        assert!(fx.store.baseline_path(&page_target("c", 0.0).key()).exists());
    }
}
