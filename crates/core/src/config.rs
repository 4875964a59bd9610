//! Runner configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::aggregate::FailurePolicy;
use crate::catalog::{CatalogConfig, ShotDefaults};
use crate::compare::RunMode;
use crate::diff::DiffAlgorithm;
use crate::error::{ShotError, ShotResult};
use crate::playwright::BrowserConfig;
use crate::render::TimeoutConfig;
use crate::retry::RetryConfig;
use crate::store::ImagePaths;
use crate::upload::PlatformConfig;

/// Complete runner configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub catalog: CatalogConfig,
    pub defaults: ShotDefaults,
    pub concurrency: ConcurrencyConfig,
    pub retries: RetryConfig,
    pub timeouts: TimeoutConfig,
    pub images: ImagePaths,
    pub compare: CompareConfig,
    pub browser: BrowserConfig,
    pub platform: Option<PlatformConfig>,
}

/// Worker pool sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Captures in flight
    pub shot_concurrency: usize,
    /// Comparisons in flight
    pub compare_concurrency: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            shot_concurrency: 5,
            compare_concurrency: 10,
        }
    }
}

/// Comparison and verdict settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompareConfig {
    pub engine: DiffAlgorithm,
    pub mode: RunMode,
    pub tolerate_missing_baselines: bool,
    pub fail_on_difference: bool,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            engine: DiffAlgorithm::default(),
            mode: RunMode::default(),
            tolerate_missing_baselines: false,
            fail_on_difference: true,
        }
    }
}

impl CompareConfig {
    pub fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy {
            tolerate_missing_baselines: self.tolerate_missing_baselines,
            fail_on_difference: self.fail_on_difference,
        }
    }
}

impl RunnerConfig {
    /// Load configuration from a TOML or YAML file, picked by extension
    pub fn load(path: &Path) -> ShotResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ShotError::config(path.display().to_string(), format!("cannot read: {}", e))
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }

    pub fn from_toml_str(content: &str) -> ShotResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_yaml_str(content: &str) -> ShotResult<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Reject configurations the pipeline cannot run
    pub fn validate(&self) -> ShotResult<()> {
        if self.catalog.enabled_sources() == 0 {
            return Err(ShotError::NoSources);
        }

        if self.concurrency.shot_concurrency == 0 {
            return Err(ShotError::config("concurrency.shot_concurrency", "must be at least 1"));
        }
        if self.concurrency.compare_concurrency == 0 {
            return Err(ShotError::config("concurrency.compare_concurrency", "must be at least 1"));
        }

        check_threshold("defaults.threshold", Some(self.defaults.threshold))?;
        check_breakpoints("defaults.breakpoints", Some(&self.defaults.breakpoints))?;

        if let Some(storybook) = &self.catalog.storybook {
            if storybook.url.trim().is_empty() {
                return Err(ShotError::config("catalog.storybook.url", "must not be empty"));
            }
            check_threshold("catalog.storybook.threshold", storybook.threshold)?;
            check_breakpoints("catalog.storybook.breakpoints", storybook.breakpoints.as_ref())?;
        }

        if let Some(pages) = &self.catalog.pages {
            if pages.pages.is_empty() && pages.pages_json_url.is_none() {
                return Err(ShotError::config(
                    "catalog.pages",
                    "needs `pages` or `pages_json_url`",
                ));
            }
            check_threshold("catalog.pages.threshold", pages.threshold)?;
            check_breakpoints("catalog.pages.breakpoints", pages.breakpoints.as_ref())?;

            for (i, page) in pages.pages.iter().enumerate() {
                if page.name.trim().is_empty() {
                    return Err(ShotError::config(format!("catalog.pages.pages[{}].name", i), "must not be empty"));
                }
                check_threshold(&format!("catalog.pages.pages[{}].threshold", i), page.threshold)?;
                check_breakpoints(
                    &format!("catalog.pages.pages[{}].breakpoints", i),
                    page.breakpoints.as_ref(),
                )?;
            }
        }

        if let Some(custom) = &self.catalog.custom {
            for cleaned in [&self.images.current_path, &self.images.difference_path] {
                if is_within(&custom.current_shots_path, cleaned) {
                    return Err(ShotError::config(
                        "catalog.custom.current_shots_path",
                        format!("must not be inside {}, which is emptied on every run", cleaned.display()),
                    ));
                }
            }
        }

        if let Some(platform) = &self.platform {
            if platform.api_url.is_empty() {
                return Err(ShotError::config("platform.api_url", "must not be empty"));
            }
            if platform.project_id.is_empty() {
                return Err(ShotError::config("platform.project_id", "must not be empty"));
            }
        }

        Ok(())
    }
}

/// `path` equals `dir` or lives below it; falls back to the raw paths when
/// either side does not exist yet
fn is_within(path: &Path, dir: &Path) -> bool {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    path.starts_with(&dir)
}

fn check_threshold(field: &str, threshold: Option<f64>) -> ShotResult<()> {
    match threshold {
        Some(t) if !t.is_finite() || t < 0.0 => {
            Err(ShotError::config(field, format!("must be a non-negative number, got {}", t)))
        }
        _ => Ok(()),
    }
}

fn check_breakpoints(field: &str, breakpoints: Option<&Vec<u32>>) -> ShotResult<()> {
    if breakpoints.map_or(false, |bps| bps.contains(&0)) {
        return Err(ShotError::config(field, "breakpoint widths must be positive"));
    }
    Ok(())
}
