//! Pixel difference engines and the threshold policy
//!
//! Both engines take two images of identical dimensions and return the number
//! of differing pixels plus a visualisation, so the comparison stage never
//! needs to know which one is configured.

use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::shot::MaskRect;

/// Colour painted over masked regions, on both sides of a comparison
pub const MASK_COLOR: Rgba<u8> = Rgba([128, 128, 128, 255]);

const DIFF_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);

/// Per-pixel sensitivity of the perceptual engine (0 = strict, 1 = lax)
const PERCEPTUAL_SENSITIVITY: f64 = 0.1;

/// Largest possible YIQ delta between two pixels
const MAX_YIQ_DELTA: f64 = 35215.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffAlgorithm {
    /// YIQ colour distance, tolerant to tiny rendering noise
    #[default]
    Perceptual,
    /// Any channel byte that differs counts
    Exact,
}

/// Output of a diff engine
#[derive(Debug, Clone)]
pub struct DiffOutput {
    pub diff_pixels: u64,
    pub diff_image: RgbaImage,
}

impl DiffAlgorithm {
    /// Compare two images of equal dimensions.
    pub fn diff(&self, baseline: &RgbaImage, current: &RgbaImage) -> DiffOutput {
        debug_assert_eq!(baseline.dimensions(), current.dimensions());

        let (width, height) = current.dimensions();
        let mut diff_image = RgbaImage::new(width, height);
        let mut diff_pixels = 0u64;

        for (x, y, current_pixel) in current.enumerate_pixels() {
            let baseline_pixel = baseline.get_pixel(x, y);

            if self.pixels_differ(baseline_pixel, current_pixel) {
                diff_pixels += 1;
                diff_image.put_pixel(x, y, DIFF_COLOR);
            } else {
                // Dimmed baseline for context
                let [r, g, b, _] = baseline_pixel.0;
                diff_image.put_pixel(x, y, Rgba([r / 2, g / 2, b / 2, 128]));
            }
        }

        DiffOutput {
            diff_pixels,
            diff_image,
        }
    }

    fn pixels_differ(&self, a: &Rgba<u8>, b: &Rgba<u8>) -> bool {
        match self {
            DiffAlgorithm::Exact => a != b,
            DiffAlgorithm::Perceptual => {
                if a == b {
                    return false;
                }
                let max_delta = MAX_YIQ_DELTA * PERCEPTUAL_SENSITIVITY * PERCEPTUAL_SENSITIVITY;
                yiq_delta(a, b) > max_delta
            }
        }
    }
}

/// Squared YIQ distance after blending both pixels onto white.
fn yiq_delta(a: &Rgba<u8>, b: &Rgba<u8>) -> f64 {
    let (r1, g1, b1) = blend_on_white(a);
    let (r2, g2, b2) = blend_on_white(b);

    let y = rgb_to_y(r1, g1, b1) - rgb_to_y(r2, g2, b2);
    let i = rgb_to_i(r1, g1, b1) - rgb_to_i(r2, g2, b2);
    let q = rgb_to_q(r1, g1, b1) - rgb_to_q(r2, g2, b2);

    0.5053 * y * y + 0.299 * i * i + 0.1957 * q * q
}

fn blend_on_white(p: &Rgba<u8>) -> (f64, f64, f64) {
    let [r, g, b, a] = p.0;
    let alpha = a as f64 / 255.0;
    let blend = |c: u8| 255.0 + (c as f64 - 255.0) * alpha;
    (blend(r), blend(g), blend(b))
}

fn rgb_to_y(r: f64, g: f64, b: f64) -> f64 {
    r * 0.29889531 + g * 0.58662247 + b * 0.11448223
}

fn rgb_to_i(r: f64, g: f64, b: f64) -> f64 {
    r * 0.59597799 - g * 0.2741761 - b * 0.32180189
}

fn rgb_to_q(r: f64, g: f64, b: f64) -> f64 {
    r * 0.21147017 - g * 0.52261711 + b * 0.31114694
}

/// Paint every rectangle with [`MASK_COLOR`], clipped to the image bounds.
pub fn paint_masks(image: &mut RgbaImage, masks: &[MaskRect]) {
    let (width, height) = image.dimensions();

    for mask in masks {
        let x_end = mask.x.saturating_add(mask.width).min(width);
        let y_end = mask.y.saturating_add(mask.height).min(height);

        for y in mask.y.min(height)..y_end {
            for x in mask.x.min(width)..x_end {
                image.put_pixel(x, y, MASK_COLOR);
            }
        }
    }
}

/// Largest tolerated number of differing pixels.
///
/// Fractional thresholds are floored after scaling by the pixel count; absolute
/// thresholds are used as given.
pub fn effective_limit(threshold: f64, total_pixels: u64) -> f64 {
    if threshold < 1.0 {
        (threshold * total_pixels as f64).floor()
    } else {
        threshold
    }
}

pub fn exceeds_threshold(diff_pixels: u64, threshold: f64, total_pixels: u64) -> bool {
    diff_pixels as f64 > effective_limit(threshold, total_pixels)
}
