//! shotdrift core
//!
//! Visual regression pipeline:
//! - Builds a catalog of shot targets from a story catalog, a page list and
//!   pre-rendered images
//! - Captures each target through a bounded worker pool, retrying flaky renders
//! - Compares every capture against its baseline as soon as it lands
//! - Aggregates the verdicts into a single run summary
//! - Optionally uploads artifacts to a reporting platform
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        ShotRunner                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │  CatalogBuilder::build() -> Vec<ShotTarget>                  │
//! │        │                                                     │
//! │        ▼                                                     │
//! │  CaptureStage (shot_concurrency)                             │
//! │    └── RetryController ── Renderer (Playwright | file)       │
//! │        │ mpsc<CaptureResult>                                 │
//! │        ▼                                                     │
//! │  Comparator (compare_concurrency)                            │
//! │    └── hash fast path, masks, DiffAlgorithm                  │
//! │        │ mpsc<ComparisonResult>                              │
//! │        ▼                                                     │
//! │  Aggregator::collect() -> RunSummary -> exit code            │
//! │        │                                                     │
//! │        ▼                                                     │
//! │  UploadCoordinator (platform mode)                           │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod aggregate;
pub mod capture;
pub mod catalog;
pub mod compare;
pub mod config;
pub mod diff;
pub mod error;
pub mod playwright;
pub mod render;
pub mod retry;
pub mod runner;
pub mod shot;
pub mod store;
pub mod upload;

pub use aggregate::{exit_code, FailurePolicy, RunStatus, RunSummary, StatusCounts};
pub use catalog::{CatalogBuilder, ShotHooks};
pub use compare::{CompareStatus, ComparisonResult, RunMode};
pub use config::RunnerConfig;
pub use error::{ShotError, ShotResult};
pub use playwright::PlaywrightRenderer;
pub use render::{RenderRequest, Renderer};
pub use runner::{run_pipeline, ShotRunner};
pub use shot::{ShotTarget, TargetKey};
pub use upload::{BuildMetadata, UploadReport};
