/// Masked normalized cross-correlation template matching.
///
/// Scores every placement of the template inside the frame with the
/// zero-mean normalized correlation coefficient (per-channel means, summed
/// over RGB) and reports the best one. Template pixels whose alpha is zero
/// are left out of the computation, so a transparent background does not
/// count against a match.
use std::path::Path;

use image::{Rgb, RgbImage, RgbaImage};

use crate::sensor::SensorError;

/// Variances below this are treated as a flat patch (score 0).
const FLAT_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    /// Best correlation, clamped to `[0, 1]`.
    pub score: f32,
    /// Top-left corner of the best placement within the frame.
    pub location: (u32, u32),
}

/// A reference image prepared for matching.
#[derive(Debug, Clone)]
pub struct Template {
    width: u32,
    height: u32,
    /// Offsets of the pixels that take part in matching.
    active: Vec<(u32, u32)>,
    /// Template values minus their channel mean, one entry per active pixel.
    centered: Vec<[f64; 3]>,
    norm_sq: f64,
}

impl Template {
    /// Loads a template image. An alpha channel, if present, becomes the mask.
    pub fn load(path: &Path) -> Result<Self, SensorError> {
        let img = image::open(path).map_err(|source| SensorError::TemplateLoad {
            path: path.to_path_buf(),
            source,
        })?;
        let masked = img.color().has_alpha();
        Ok(Self::from_rgba(&img.to_rgba8(), masked))
    }

    pub fn from_rgba(img: &RgbaImage, masked: bool) -> Self {
        let active: Vec<(u32, u32)> = img
            .enumerate_pixels()
            .filter(|(_, _, p)| !masked || p[3] > 0)
            .map(|(x, y, _)| (x, y))
            .collect();

        let n = active.len().max(1) as f64;
        let mut means = [0.0f64; 3];
        for &(x, y) in &active {
            let p = img.get_pixel(x, y);
            for c in 0..3 {
                means[c] += f64::from(p[c]);
            }
        }
        for m in &mut means {
            *m /= n;
        }

        let mut norm_sq = 0.0;
        let centered = active
            .iter()
            .map(|&(x, y)| {
                let p = img.get_pixel(x, y);
                let mut v = [0.0; 3];
                for c in 0..3 {
                    v[c] = f64::from(p[c]) - means[c];
                    norm_sq += v[c] * v[c];
                }
                v
            })
            .collect();

        Self {
            width: img.width(),
            height: img.height(),
            active,
            centered,
            norm_sq,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Errors when the template cannot fit inside a `width` x `height` area.
    pub fn check_fits(&self, width: u32, height: u32) -> Result<(), SensorError> {
        if self.width > width || self.height > height {
            return Err(SensorError::TemplateLargerThanRegion {
                template_width: self.width,
                template_height: self.height,
                region_width: width,
                region_height: height,
            });
        }
        Ok(())
    }
}

/// Finds the best placement of `template` inside `frame`.
pub fn match_template(frame: &RgbImage, template: &Template) -> Result<MatchResult, SensorError> {
    template.check_fits(frame.width(), frame.height())?;

    let mut best = MatchResult { score: 0.0, location: (0, 0) };
    if template.active.is_empty() || template.norm_sq <= FLAT_EPSILON {
        return Ok(best);
    }

    let n = template.active.len() as f64;
    let mut best_score = 0.0f64;
    for y in 0..=(frame.height() - template.height) {
        for x in 0..=(frame.width() - template.width) {
            let mut sums = [0.0f64; 3];
            let mut sum_sq = 0.0;
            let mut cross = 0.0;
            for (&(dx, dy), t) in template.active.iter().zip(&template.centered) {
                let p = frame.get_pixel(x + dx, y + dy);
                for c in 0..3 {
                    let v = f64::from(p[c]);
                    sums[c] += v;
                    sum_sq += v * v;
                    cross += t[c] * v;
                }
            }
            let variance = sum_sq - sums.iter().map(|s| s * s / n).sum::<f64>();
            if variance <= FLAT_EPSILON {
                continue;
            }
            let score = cross / (template.norm_sq * variance).sqrt();
            if score > best_score {
                best_score = score;
                best.location = (x, y);
            }
        }
    }

    best.score = best_score.clamp(0.0, 1.0) as f32;
    Ok(best)
}

/// Outlines a `width` x `height` box at `location`, clipped to the frame.
pub fn draw_outline(frame: &mut RgbImage, location: (u32, u32), width: u32, height: u32) {
    const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
    const THICKNESS: u32 = 2;

    let (x0, y0) = location;
    let x1 = (x0 + width).min(frame.width());
    let y1 = (y0 + height).min(frame.height());
    for y in y0..y1 {
        for x in x0..x1 {
            let on_edge = x < x0 + THICKNESS
                || y < y0 + THICKNESS
                || x + THICKNESS >= x0 + width
                || y + THICKNESS >= y0 + height;
            if on_edge {
                frame.put_pixel(x, y, GREEN);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    /// Deterministic noise so matches are unambiguous.
    fn noise(width: u32, height: u32, seed: u32) -> RgbImage {
        let mut state = seed;
        RgbImage::from_fn(width, height, |_, _| {
            let mut next = || {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 16) as u8
            };
            Rgb([next(), next(), next()])
        })
    }

    fn crop_rgba(frame: &RgbImage, x: u32, y: u32, w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_fn(w, h, |dx, dy| {
            let p = frame.get_pixel(x + dx, y + dy);
            Rgba([p[0], p[1], p[2], 255])
        })
    }

    // ── matching ──────────────────────────────────────────────────────────────

    #[test]
    fn finds_exact_crop() {
        let frame = noise(30, 20, 7);
        let template = Template::from_rgba(&crop_rgba(&frame, 7, 4, 6, 5), false);
        let result = match_template(&frame, &template).unwrap();
        assert!(result.score > 0.999, "score {}", result.score);
        assert_eq!(result.location, (7, 4));
    }

    #[test]
    fn brightness_shift_still_matches() {
        let frame = noise(16, 16, 3);
        let mut crop = crop_rgba(&frame, 2, 2, 8, 8);
        for p in crop.pixels_mut() {
            for c in 0..3 {
                p[c] = p[c] / 2 + 40;
            }
        }
        let result = match_template(&frame, &Template::from_rgba(&crop, false)).unwrap();
        assert!(result.score > 0.95, "score {}", result.score);
        assert_eq!(result.location, (2, 2));
    }

    #[test]
    fn transparent_pixels_are_ignored() {
        let frame = noise(20, 20, 11);
        let mut crop = crop_rgba(&frame, 5, 6, 8, 8);
        // Garbage in the transparent corner must not lower the score.
        for y in 0..3 {
            for x in 0..3 {
                crop.put_pixel(x, y, Rgba([255, 0, 255, 0]));
            }
        }
        let masked = match_template(&frame, &Template::from_rgba(&crop, true)).unwrap();
        assert!(masked.score > 0.999, "score {}", masked.score);
        assert_eq!(masked.location, (5, 6));

        let unmasked = match_template(&frame, &Template::from_rgba(&crop, false)).unwrap();
        assert!(unmasked.score < masked.score);
    }

    #[test]
    fn flat_frame_scores_zero() {
        let frame = RgbImage::from_pixel(12, 12, Rgb([90, 90, 90]));
        let template = Template::from_rgba(&crop_rgba(&noise(4, 4, 5), 0, 0, 4, 4), false);
        let result = match_template(&frame, &template).unwrap();
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn flat_template_scores_zero() {
        let frame = noise(12, 12, 1);
        let template = Template::from_rgba(&RgbaImage::from_pixel(4, 4, Rgba([9, 9, 9, 255])), false);
        assert_eq!(match_template(&frame, &template).unwrap().score, 0.0);
    }

    #[test]
    fn fully_transparent_template_scores_zero() {
        let frame = noise(12, 12, 1);
        let template = Template::from_rgba(&RgbaImage::from_pixel(4, 4, Rgba([9, 9, 9, 0])), true);
        assert_eq!(match_template(&frame, &template).unwrap().score, 0.0);
    }

    #[test]
    fn template_larger_than_frame_is_an_error() {
        let frame = noise(10, 10, 1);
        let template = Template::from_rgba(&crop_rgba(&noise(12, 4, 2), 0, 0, 12, 4), false);
        match match_template(&frame, &template) {
            Err(SensorError::TemplateLargerThanRegion { template_width, region_width, .. }) => {
                assert_eq!(template_width, 12);
                assert_eq!(region_width, 10);
            }
            other => panic!("expected size error, got {other:?}"),
        }
    }

    #[test]
    fn same_size_template_has_one_placement() {
        let frame = noise(9, 7, 4);
        let template = Template::from_rgba(&crop_rgba(&frame, 0, 0, 9, 7), false);
        let result = match_template(&frame, &template).unwrap();
        assert_eq!(result.location, (0, 0));
        assert!(result.score > 0.999);
    }

    // ── loading ───────────────────────────────────────────────────────────────

    #[test]
    fn load_png_with_alpha() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.png");
        let mut img = RgbaImage::from_pixel(5, 4, Rgba([10, 20, 30, 255]));
        img.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
        img.save(&path).unwrap();

        let template = Template::load(&path).unwrap();
        assert_eq!((template.width(), template.height()), (5, 4));
        assert_eq!(template.active.len(), 19);
    }

    #[test]
    fn load_missing_file_reports_path() {
        let err = Template::load(Path::new("/nope/t.png")).unwrap_err();
        assert!(matches!(err, SensorError::TemplateLoad { .. }));
        assert!(err.to_string().contains("/nope/t.png"));
    }

    // ── outline ───────────────────────────────────────────────────────────────

    #[test]
    fn outline_is_clipped_to_frame() {
        let mut frame = RgbImage::new(10, 10);
        draw_outline(&mut frame, (6, 6), 8, 8);
        assert_eq!(*frame.get_pixel(6, 6), Rgb([0, 255, 0]));
        assert_eq!(*frame.get_pixel(7, 9), Rgb([0, 255, 0]));
        assert_eq!(*frame.get_pixel(9, 9), Rgb([0, 0, 0]));
        assert_eq!(*frame.get_pixel(5, 5), Rgb([0, 0, 0]));
    }

    #[test]
    fn outline_leaves_interior_untouched() {
        let mut frame = RgbImage::new(10, 10);
        draw_outline(&mut frame, (0, 0), 10, 10);
        assert_eq!(*frame.get_pixel(0, 0), Rgb([0, 255, 0]));
        assert_eq!(*frame.get_pixel(9, 9), Rgb([0, 255, 0]));
        assert_eq!(*frame.get_pixel(5, 5), Rgb([0, 0, 0]));
    }
}
