//! Shot catalog: turns the configured sources into one ordered list of targets
//!
//! Sources are read in a fixed order (story catalog, pages, pre-rendered
//! folder). Per-target settings win over per-source settings, which win over
//! the global defaults, field by field.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ShotError, ShotResult};
use crate::render::TimeoutConfig;
use crate::shot::{Mask, ShotLocation, ShotSource, ShotTarget, Viewport, WaitPolicy};

pub type ShotFilter = Arc<dyn Fn(&ShotTarget) -> bool + Send + Sync>;
pub type NameGenerator = Arc<dyn Fn(&ShotTarget) -> String + Send + Sync>;
pub type BeforeCapture = Arc<dyn Fn(&ShotTarget) + Send + Sync>;

/// Optional user callbacks; `None` keeps the default behaviour
#[derive(Clone, Default)]
pub struct ShotHooks {
    /// Keep only targets for which this returns true
    pub filter: Option<ShotFilter>,
    /// Replace the display name (and therefore the file name)
    pub name_generator: Option<NameGenerator>,
    /// Called right before each capture attempt
    pub before_capture: Option<BeforeCapture>,
}

impl std::fmt::Debug for ShotHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShotHooks")
            .field("filter", &self.filter.is_some())
            .field("name_generator", &self.name_generator.is_some())
            .field("before_capture", &self.before_capture.is_some())
            .finish()
    }
}

/// Settings applied to every target unless overridden
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShotDefaults {
    pub breakpoints: Vec<u32>,
    pub mask: Vec<Mask>,
    pub threshold: f64,
    pub viewport: Viewport,
    pub wait_before_capture: u64,
    pub wait_for_first_network_activity: u64,
    pub wait_for_last_network_activity: u64,
}

impl Default for ShotDefaults {
    fn default() -> Self {
        Self {
            breakpoints: Vec::new(),
            mask: Vec::new(),
            threshold: 0.0,
            viewport: Viewport::default(),
            wait_before_capture: 1000,
            wait_for_first_network_activity: 1000,
            wait_for_last_network_activity: 1000,
        }
    }
}

impl ShotDefaults {
    fn wait_policy(&self, before_capture: Option<u64>) -> WaitPolicy {
        WaitPolicy {
            before_capture_ms: before_capture.unwrap_or(self.wait_before_capture),
            first_network_activity_ms: self.wait_for_first_network_activity,
            last_network_activity_ms: self.wait_for_last_network_activity,
        }
    }
}

/// A component-story catalog, served or statically built
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorybookSource {
    /// Base URL of a running catalog, or path to a static build
    pub url: String,
    #[serde(default)]
    pub breakpoints: Option<Vec<u32>>,
    #[serde(default)]
    pub mask: Option<Vec<Mask>>,
    #[serde(default)]
    pub threshold: Option<f64>,
}

/// Explicit pages, optionally extended by a remote JSON list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageSource {
    pub base_url: String,
    #[serde(default)]
    pub pages: Vec<PageShot>,
    #[serde(default)]
    pub pages_json_url: Option<String>,
    #[serde(default)]
    pub breakpoints: Option<Vec<u32>>,
    #[serde(default)]
    pub mask: Option<Vec<Mask>>,
    #[serde(default)]
    pub threshold: Option<f64>,
}

/// Folder of already rendered images
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomSource {
    pub current_shots_path: PathBuf,
}

/// One page descriptor, inline or from `pages_json_url`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageShot {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub breakpoints: Option<Vec<u32>>,
    #[serde(default)]
    pub viewport: Option<Viewport>,
    #[serde(default)]
    pub mask: Option<Vec<Mask>>,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default, alias = "waitBeforeCapture", alias = "waitBeforeScreenshot")]
    pub wait_before_capture: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub storybook: Option<StorybookSource>,
    pub pages: Option<PageSource>,
    pub custom: Option<CustomSource>,
}

impl CatalogConfig {
    pub fn enabled_sources(&self) -> usize {
        [self.storybook.is_some(), self.pages.is_some(), self.custom.is_some()]
            .iter()
            .filter(|enabled| **enabled)
            .count()
    }
}

#[derive(Debug, Default, Deserialize)]
struct StoryIndex {
    #[serde(default)]
    entries: BTreeMap<String, StoryEntry>,
    #[serde(default)]
    stories: BTreeMap<String, StoryEntry>,
}

#[derive(Debug, Deserialize)]
struct StoryEntry {
    id: String,
    name: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default, rename = "type")]
    entry_type: Option<String>,
    #[serde(default)]
    parameters: Option<StoryParameters>,
}

#[derive(Debug, Default, Deserialize)]
struct StoryParameters {
    #[serde(default)]
    shotdrift: Option<StoryOptions>,
}

#[derive(Debug, Default, Deserialize)]
struct StoryOptions {
    #[serde(default)]
    disable: bool,
    #[serde(default)]
    breakpoints: Option<Vec<u32>>,
    #[serde(default)]
    mask: Option<Vec<Mask>>,
    #[serde(default)]
    threshold: Option<f64>,
    #[serde(default)]
    viewport: Option<Viewport>,
    #[serde(default, alias = "waitBeforeCapture", alias = "waitBeforeScreenshot")]
    wait_before_capture: Option<u64>,
}

/// Per-field precedence: target, then source, then global
fn pick<T: Clone>(own: Option<&T>, source: Option<&T>, global: &T) -> T {
    own.or(source).unwrap_or(global).clone()
}

/// Builds the catalog for one run
pub struct CatalogBuilder<'a> {
    config: &'a CatalogConfig,
    defaults: &'a ShotDefaults,
    timeouts: &'a TimeoutConfig,
    hooks: &'a ShotHooks,
    client: reqwest::Client,
}

impl<'a> CatalogBuilder<'a> {
    pub fn new(
        config: &'a CatalogConfig,
        defaults: &'a ShotDefaults,
        timeouts: &'a TimeoutConfig,
        hooks: &'a ShotHooks,
    ) -> Self {
        Self {
            config,
            defaults,
            timeouts,
            hooks,
            client: reqwest::Client::new(),
        }
    }

    /// Discover, name, filter, expand and deduplicate all targets.
    ///
    /// Any discovery failure aborts the whole build.
    pub async fn build(&self) -> ShotResult<Vec<ShotTarget>> {
        if self.config.enabled_sources() == 0 {
            return Err(ShotError::NoSources);
        }

        let mut discovered = Vec::new();

        if let Some(storybook) = &self.config.storybook {
            let targets = self.story_targets(storybook).await?;
            info!("Discovered {} stories from {}", targets.len(), storybook.url);
            discovered.extend(targets);
        }

        if let Some(pages) = &self.config.pages {
            let targets = self.page_targets(pages).await?;
            info!("Discovered {} pages", targets.len());
            discovered.extend(targets);
        }

        if let Some(custom) = &self.config.custom {
            let targets = self.prerendered_targets(custom)?;
            info!(
                "Discovered {} pre-rendered shots in {}",
                targets.len(),
                custom.current_shots_path.display()
            );
            discovered.extend(targets);
        }

        Ok(self.finalize(discovered))
    }

    fn finalize(&self, discovered: Vec<ShotTarget>) -> Vec<ShotTarget> {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();

        for mut target in discovered {
            if let Some(generate) = &self.hooks.name_generator {
                target.display_name = generate(&target);
            }

            if let Some(filter) = &self.hooks.filter {
                if !filter(&target) {
                    debug!("Filtered out '{}'", target.id);
                    continue;
                }
            }

            for expanded in target.expand() {
                let key = expanded.key();
                if seen.insert(key.clone()) {
                    targets.push(expanded);
                } else {
                    warn!("Duplicate shot '{}' ignored", key);
                }
            }
        }

        targets
    }

    async fn story_targets(&self, source: &StorybookSource) -> ShotResult<Vec<ShotTarget>> {
        let index = self.load_story_index(&source.url).await?;
        let base = self.story_base_url(&source.url)?;

        let entries = if index.entries.is_empty() {
            index.stories
        } else {
            index.entries
        };

        let mut targets = Vec::new();
        for entry in entries.into_values() {
            if entry.entry_type.as_deref() == Some("docs") {
                continue;
            }

            let options = entry
                .parameters
                .and_then(|p| p.shotdrift)
                .unwrap_or_default();
            if options.disable {
                debug!("Story '{}' disabled", entry.id);
                continue;
            }

            let group = entry.title.or(entry.kind).unwrap_or_default();
            let display_name = if group.is_empty() {
                entry.name.clone()
            } else {
                format!("{}--{}", group, entry.name)
            };

            targets.push(ShotTarget {
                location: ShotLocation::Url(format!("{}/iframe.html?id={}&viewMode=story", base, entry.id)),
                id: entry.id,
                display_name,
                source: ShotSource::StoryCatalog,
                breakpoints: pick(
                    options.breakpoints.as_ref(),
                    source.breakpoints.as_ref(),
                    &self.defaults.breakpoints,
                ),
                breakpoint: None,
                viewport: options.viewport,
                masks: pick(options.mask.as_ref(), source.mask.as_ref(), &self.defaults.mask),
                threshold: pick(
                    options.threshold.as_ref(),
                    source.threshold.as_ref(),
                    &self.defaults.threshold,
                ),
                wait: self.defaults.wait_policy(options.wait_before_capture),
            });
        }

        Ok(targets)
    }

    async fn load_story_index(&self, url: &str) -> ShotResult<StoryIndex> {
        let mut last_error = String::new();

        for file in ["index.json", "stories.json"] {
            let result = if is_remote(url) {
                self.fetch_json::<StoryIndex>(&format!("{}/{}", url.trim_end_matches('/'), file))
                    .await
            } else {
                read_json::<StoryIndex>(&Path::new(url).join(file))
            };

            match result {
                Ok(index) => return Ok(index),
                Err(e) => {
                    debug!("Story index {} unavailable: {}", file, e);
                    last_error = e.to_string();
                }
            }
        }

        Err(ShotError::discovery(format!("story catalog {}", url), last_error))
    }

    fn story_base_url(&self, url: &str) -> ShotResult<String> {
        if is_remote(url) {
            return Ok(url.trim_end_matches('/').to_string());
        }

        let absolute = std::fs::canonicalize(url)
            .map_err(|e| ShotError::discovery(format!("story catalog {}", url), e))?;
        Ok(format!("file://{}", absolute.display()))
    }

    async fn page_targets(&self, source: &PageSource) -> ShotResult<Vec<ShotTarget>> {
        let mut pages: Vec<(PageShot, ShotSource)> = source
            .pages
            .iter()
            .cloned()
            .map(|page| (page, ShotSource::ExplicitPage))
            .collect();

        if let Some(url) = &source.pages_json_url {
            let remote: Vec<PageShot> = self
                .fetch_json(url)
                .await
                .map_err(|e| ShotError::discovery(format!("page list {}", url), e))?;
            debug!("Fetched {} page(s) from {}", remote.len(), url);
            pages.extend(remote.into_iter().map(|page| (page, ShotSource::RemotePageList)));
        }

        let base = source.base_url.trim_end_matches('/');
        Ok(pages
            .into_iter()
            .map(|(page, origin)| {
                let path = if page.path.starts_with('/') {
                    page.path.clone()
                } else {
                    format!("/{}", page.path)
                };

                ShotTarget {
                    id: page.name.clone(),
                    display_name: page.name.clone(),
                    source: origin,
                    location: ShotLocation::Url(format!("{}{}", base, path)),
                    breakpoints: pick(
                        page.breakpoints.as_ref(),
                        source.breakpoints.as_ref(),
                        &self.defaults.breakpoints,
                    ),
                    breakpoint: None,
                    viewport: page.viewport,
                    masks: pick(page.mask.as_ref(), source.mask.as_ref(), &self.defaults.mask),
                    threshold: pick(
                        page.threshold.as_ref(),
                        source.threshold.as_ref(),
                        &self.defaults.threshold,
                    ),
                    wait: self.defaults.wait_policy(page.wait_before_capture),
                }
            })
            .collect())
    }

    fn prerendered_targets(&self, source: &CustomSource) -> ShotResult<Vec<ShotTarget>> {
        let root = &source.current_shots_path;
        if !root.is_dir() {
            return Err(ShotError::discovery(
                "custom shots",
                format!("{} is not a directory", root.display()),
            ));
        }

        let mut targets = Vec::new();
        for entry in walkdir::WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_type().is_file()
                    && e.path()
                        .extension()
                        .map(|ext| ext.eq_ignore_ascii_case("png"))
                        .unwrap_or(false)
            })
        {
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            let id = relative.to_string_lossy().replace('\\', "/");
            let display_name = relative.with_extension("").to_string_lossy().replace('\\', "/");

            targets.push(ShotTarget {
                id,
                display_name,
                source: ShotSource::Prerendered,
                location: ShotLocation::File(entry.path().to_path_buf()),
                // A finished image has exactly one size
                breakpoints: Vec::new(),
                breakpoint: None,
                viewport: None,
                masks: self.defaults.mask.clone(),
                threshold: self.defaults.threshold,
                wait: WaitPolicy::default(),
            });
        }

        Ok(targets)
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> ShotResult<T> {
        let response = self
            .client
            .get(url)
            .timeout(self.timeouts.fetch_stories())
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<T>().await?)
    }
}

fn is_remote(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> ShotResult<T> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
