//! Template matching for image-based actions.
//!
//! Normalized cross-correlation over grayscale pixels, the same score OpenCV reports for
//! `TM_CCOEFF_NORMED`. A score of 1.0 is a pixel-perfect match; anything at or above the
//! action's confidence counts as found.
//!
//! Large searches are done on a 2x downscaled pyramid level first and then refined at full
//! resolution around the best coarse hit.

use image::{GrayImage, RgbaImage, imageops};

/// Best match position (top-left corner of the template) and its score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    pub x: u32,
    pub y: u32,
    pub score: f64,
}

/// Templates smaller than this on either side are always matched at full resolution.
const MIN_PYRAMID_SIDE: u32 = 24;

/// Locate `template` inside `screen`. Returns the center of the match if its score reaches
/// `confidence`.
pub fn locate(screen: &RgbaImage, template: &RgbaImage, confidence: f64) -> Option<(u32, u32)> {
    let haystack = imageops::grayscale(screen);
    let needle = imageops::grayscale(template);
    locate_gray(&haystack, &needle, confidence)
}

/// Grayscale variant of [`locate`].
pub fn locate_gray(haystack: &GrayImage, needle: &GrayImage, confidence: f64) -> Option<(u32, u32)> {
    let found = best_match(haystack, needle)?;
    if found.score + f64::EPSILON < confidence {
        return None;
    }
    Some((found.x + needle.width() / 2, found.y + needle.height() / 2))
}

/// Find the highest-scoring template position. `None` if the template does not fit.
pub fn best_match(haystack: &GrayImage, needle: &GrayImage) -> Option<Match> {
    let (hw, hh) = haystack.dimensions();
    let (nw, nh) = needle.dimensions();
    if nw == 0 || nh == 0 || nw > hw || nh > hh {
        return None;
    }

    if nw < MIN_PYRAMID_SIDE || nh < MIN_PYRAMID_SIDE {
        return search(haystack, needle, 0..=(hw - nw), 0..=(hh - nh));
    }

    let small_hay = imageops::resize(haystack, hw / 2, hh / 2, imageops::FilterType::Triangle);
    let small_needle = imageops::resize(needle, nw / 2, nh / 2, imageops::FilterType::Triangle);
    let coarse = best_match(&small_hay, &small_needle)?;

    // Refine in a small window around the coarse hit, scaled back up.
    let cx = coarse.x * 2;
    let cy = coarse.y * 2;
    let x_lo = cx.saturating_sub(2);
    let y_lo = cy.saturating_sub(2);
    let x_hi = (cx + 2).min(hw - nw);
    let y_hi = (cy + 2).min(hh - nh);
    search(haystack, needle, x_lo..=x_hi, y_lo..=y_hi)
}

fn search(
    haystack: &GrayImage,
    needle: &GrayImage,
    xs: std::ops::RangeInclusive<u32>,
    ys: std::ops::RangeInclusive<u32>,
) -> Option<Match> {
    let stats = TemplateStats::new(needle);
    let mut best: Option<Match> = None;
    for y in ys {
        for x in xs.clone() {
            let score = stats.score_at(haystack, needle, x, y);
            if best.is_none_or(|b| score > b.score) {
                best = Some(Match { x, y, score });
            }
        }
    }
    best
}

struct TemplateStats {
    mean: f64,
    /// Sum of squared deviations from the mean.
    energy: f64,
    count: f64,
}

impl TemplateStats {
    fn new(needle: &GrayImage) -> Self {
        let count = f64::from(needle.width() * needle.height());
        let mean = needle.pixels().map(|p| f64::from(p.0[0])).sum::<f64>() / count;
        let energy = needle
            .pixels()
            .map(|p| {
                let d = f64::from(p.0[0]) - mean;
                d * d
            })
            .sum();
        Self {
            mean,
            energy,
            count,
        }
    }

    fn score_at(&self, haystack: &GrayImage, needle: &GrayImage, ox: u32, oy: u32) -> f64 {
        let (nw, nh) = needle.dimensions();

        let mut sum = 0.0;
        for y in 0..nh {
            for x in 0..nw {
                sum += f64::from(haystack.get_pixel(ox + x, oy + y).0[0]);
            }
        }
        let window_mean = sum / self.count;

        let mut cross = 0.0;
        let mut window_energy = 0.0;
        let mut abs_diff = 0.0;
        for y in 0..nh {
            for x in 0..nw {
                let h = f64::from(haystack.get_pixel(ox + x, oy + y).0[0]);
                let n = f64::from(needle.get_pixel(x, y).0[0]);
                let dh = h - window_mean;
                cross += dh * (n - self.mean);
                window_energy += dh * dh;
                abs_diff += (h - n).abs();
            }
        }

        // Flat template or flat window: correlation is undefined, fall back to pixel distance.
        if self.energy < f64::EPSILON || window_energy < f64::EPSILON {
            return 1.0 - abs_diff / (self.count * 255.0);
        }
        cross / (self.energy * window_energy).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgba};

    fn noisy(width: u32, height: u32, seed: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let v = (x.wrapping_mul(31) ^ y.wrapping_mul(17) ^ seed).wrapping_mul(2654435761) >> 24;
            Luma([v as u8])
        })
    }

    #[test]
    fn test_finds_exact_patch() {
        let hay = noisy(80, 60, 7);
        let needle = imageops::crop_imm(&hay, 30, 20, 12, 10).to_image();
        let m = best_match(&hay, &needle).unwrap();
        assert_eq!((m.x, m.y), (30, 20));
        assert!(m.score > 0.999);
        assert_eq!(locate_gray(&hay, &needle, 0.9), Some((36, 25)));
    }

    #[test]
    fn test_pyramid_path_finds_large_patch() {
        let hay = noisy(160, 120, 3);
        let needle = imageops::crop_imm(&hay, 64, 40, 32, 32).to_image();
        let m = best_match(&hay, &needle).unwrap();
        assert!(m.x.abs_diff(64) <= 2 && m.y.abs_diff(40) <= 2);
    }

    #[test]
    fn test_confidence_threshold_rejects_unrelated_template() {
        let hay = noisy(40, 40, 1);
        let needle = noisy(10, 10, 99);
        assert!(locate_gray(&hay, &needle, 0.99).is_none());
    }

    #[test]
    fn test_template_larger_than_screen() {
        let hay = noisy(10, 10, 1);
        let needle = noisy(20, 5, 1);
        assert!(best_match(&hay, &needle).is_none());
    }

    #[test]
    fn test_flat_template_uses_pixel_distance() {
        let mut screen = RgbaImage::from_pixel(20, 20, Rgba([0, 0, 0, 255]));
        for y in 5..9 {
            for x in 5..9 {
                screen.put_pixel(x, y, Rgba([255, 255, 255, 255]));
            }
        }
        let template = RgbaImage::from_pixel(4, 4, Rgba([255, 255, 255, 255]));
        assert_eq!(locate(&screen, &template, 0.95), Some((7, 7)));
    }
}
