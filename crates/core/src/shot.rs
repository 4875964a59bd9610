//! Shot targets: the unit of work flowing through the pipeline

use std::fmt;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static UNSAFE_NAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9_-]+").expect("static regex is valid"));

/// Browser viewport size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// Pixel rectangle, in image coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Region blanked out before comparison.
///
/// Selector masks are painted by the renderer, rectangles are painted on both
/// the current and the baseline image right before diffing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Mask {
    Selector { selector: String },
    Rect(MaskRect),
}

/// Where a target was discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShotSource {
    StoryCatalog,
    ExplicitPage,
    RemotePageList,
    Prerendered,
}

/// What gets rendered (or copied) to produce the current image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShotLocation {
    Url(String),
    File(PathBuf),
}

/// Timing policy applied before the screenshot is taken (milliseconds)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitPolicy {
    pub before_capture_ms: u64,
    pub first_network_activity_ms: u64,
    pub last_network_activity_ms: u64,
}

impl WaitPolicy {
    pub fn total_ms(&self) -> u64 {
        self.before_capture_ms
            .saturating_add(self.first_network_activity_ms)
            .saturating_add(self.last_network_activity_ms)
    }
}

/// Comparison key: sanitized display name plus breakpoint suffix.
///
/// Maps to the same relative file name in the current, baseline and diff trees.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetKey(String);

impl TargetKey {
    pub fn new(display_name: &str, breakpoint: Option<u32>) -> Self {
        let base = sanitize_name(display_name);
        match breakpoint {
            Some(bp) => TargetKey(format!("{}__w{}px", base, bp)),
            None => TargetKey(base),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn file_name(&self) -> String {
        format!("{}.png", self.0)
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase, collapse anything outside `[a-z0-9_-]` into `-`, trim dashes.
pub fn sanitize_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let replaced = UNSAFE_NAME_CHARS.replace_all(&lowered, "-");
    let trimmed = replaced.trim_matches('-');
    if trimmed.is_empty() {
        "shot".to_string()
    } else {
        trimmed.to_string()
    }
}

/// A unit of work to screenshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotTarget {
    /// Story id, page name or file path relative to the shots folder
    pub id: String,

    /// Human-readable name, also the base of the file name
    pub display_name: String,

    pub source: ShotSource,

    pub location: ShotLocation,

    /// Widths to render at; empty means the single default viewport
    pub breakpoints: Vec<u32>,

    /// Set once the target has been expanded to a single breakpoint
    pub breakpoint: Option<u32>,

    /// Explicit viewport override
    pub viewport: Option<Viewport>,

    pub masks: Vec<Mask>,

    /// `< 1` is a fraction of the total pixel count, `>= 1` an absolute pixel count
    pub threshold: f64,

    pub wait: WaitPolicy,
}

impl ShotTarget {
    pub fn key(&self) -> TargetKey {
        TargetKey::new(&self.display_name, self.breakpoint)
    }

    /// One target per breakpoint; a target without breakpoints is returned as is.
    pub fn expand(self) -> Vec<ShotTarget> {
        if self.breakpoints.is_empty() || self.breakpoint.is_some() {
            return vec![self];
        }

        self.breakpoints
            .iter()
            .map(|&bp| ShotTarget {
                breakpoint: Some(bp),
                ..self.clone()
            })
            .collect()
    }

    /// Viewport to render with: breakpoint width wins over any explicit width.
    pub fn effective_viewport(&self, default: Viewport) -> Viewport {
        let base = self.viewport.unwrap_or(default);
        Viewport {
            width: self.breakpoint.unwrap_or(base.width),
            height: base.height,
        }
    }

    pub fn mask_rects(&self) -> Vec<MaskRect> {
        self.masks
            .iter()
            .filter_map(|m| match m {
                Mask::Rect(rect) => Some(*rect),
                Mask::Selector { .. } => None,
            })
            .collect()
    }

    pub fn mask_selectors(&self) -> Vec<&str> {
        self.masks
            .iter()
            .filter_map(|m| match m {
                Mask::Selector { selector } => Some(selector.as_str()),
                Mask::Rect(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) fn page_target(name: &str, threshold: f64) -> ShotTarget {
    ShotTarget {
        id: name.to_string(),
        display_name: name.to_string(),
        source: ShotSource::ExplicitPage,
        location: ShotLocation::Url(format!("http://localhost:3000/{}", name)),
        breakpoints: Vec::new(),
        breakpoint: None,
        viewport: None,
        masks: Vec::new(),
        threshold,
        wait: WaitPolicy::default(),
    }
}
