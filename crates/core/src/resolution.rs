//! Image dimension math.
//!
//! All dimensions are multiples of [`DIMENSION_STEP`]. Rounding follows
//! round-half-to-even so `1056` (16.5 steps) lands on `1024`.

use crate::error::CoreError;

/// Every width and height is a multiple of this many pixels.
pub const DIMENSION_STEP: u32 = 64;

/// Pixels in one megapixel (1024 * 1024).
pub const PIXELS_PER_MEGAPIXEL: f64 = 1024.0 * 1024.0;

/// Default megapixel target when none is given.
pub const DEFAULT_MEGAPIXELS: f64 = 1.0;

/// Largest megapixel target a request may ask for.
pub const MAX_MEGAPIXELS: f64 = 16.0;

/// Largest accepted `long:short` aspect ratio quotient.
pub const MAX_ASPECT_RATIO: f64 = 10_000.0;

/// Round a dimension to the nearest multiple of [`DIMENSION_STEP`].
pub fn round_to_step(value: f64) -> i64 {
    let step = DIMENSION_STEP as f64;
    ((value / step).round_ties_even() * step) as i64
}

/// Round an explicit `WxH` resolution, rejecting values that collapse to zero.
pub fn round_resolution(width: u32, height: u32) -> Result<(u32, u32), CoreError> {
    let w = round_to_step(width as f64);
    let h = round_to_step(height as f64);
    to_dimensions(w, h)
}

/// Compute the largest step-aligned resolution with the given aspect
/// ratio whose area does not exceed `megapixels`.
///
/// The result satisfies `w * h <= area` and `(w + 64) * (h + 64) > area`.
pub fn resolution_for_ratio(
    ratio_w: f64,
    ratio_h: f64,
    megapixels: f64,
) -> Result<(u32, u32), CoreError> {
    if !(ratio_w > 0.0 && ratio_h > 0.0) {
        return Err(CoreError::InvalidParameter(format!(
            "Aspect ratio must be positive (got {ratio_w}:{ratio_h})"
        )));
    }
    let quotient = (ratio_w / ratio_h).max(ratio_h / ratio_w);
    if !(quotient <= MAX_ASPECT_RATIO) {
        return Err(CoreError::InvalidParameter(format!(
            "Aspect ratio {ratio_w}:{ratio_h} is too extreme (at most {MAX_ASPECT_RATIO}:1)"
        )));
    }
    if !(megapixels > 0.0 && megapixels <= MAX_MEGAPIXELS) {
        return Err(CoreError::InvalidParameter(format!(
            "Megapixel size must be greater than 0 and at most {MAX_MEGAPIXELS} (got {megapixels})"
        )));
    }

    let step = DIMENSION_STEP as i64;
    let area = megapixels * PIXELS_PER_MEGAPIXEL;
    let fits = |w: i64, h: i64| (w as f64) * (h as f64) <= area;

    let width = (area * ratio_w / ratio_h).sqrt();
    let height = width * (ratio_h / ratio_w);

    let mut w = round_to_step(width).max(step);
    let mut h = round_to_step(height).max(step);

    // Shrink the larger side until the area fits.
    while !fits(w, h) && (w > step || h > step) {
        if w > h {
            w -= step;
        } else {
            h -= step;
        }
    }

    // Grow the smaller side while a step on both sides would still fit.
    while fits(w + step, h + step) {
        if w < h {
            w += step;
        } else {
            h += step;
        }
    }

    if !fits(w, h) {
        return Err(CoreError::InvalidParameter(format!(
            "Megapixel size {megapixels} is too small for a {DIMENSION_STEP}x{DIMENSION_STEP} image"
        )));
    }
    to_dimensions(w, h)
}

fn to_dimensions(w: i64, h: i64) -> Result<(u32, u32), CoreError> {
    match (u32::try_from(w), u32::try_from(h)) {
        (Ok(w), Ok(h)) if w > 0 && h > 0 => Ok((w, h)),
        _ => Err(CoreError::InvalidParameter(format!(
            "Resolution {w}x{h} is invalid, both sides must be at least {DIMENSION_STEP}px"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn square_one_megapixel() {
        assert_eq!(resolution_for_ratio(1.0, 1.0, 1.0).unwrap(), (1024, 1024));
    }

    #[test]
    fn widescreen_one_megapixel() {
        assert_eq!(resolution_for_ratio(16.0, 9.0, 1.0).unwrap(), (1344, 768));
    }

    #[test]
    fn portrait_is_transposed_landscape() {
        assert_eq!(resolution_for_ratio(9.0, 16.0, 1.0).unwrap(), (768, 1344));
    }

    #[test]
    fn square_two_megapixels_shrinks_one_side() {
        assert_eq!(resolution_for_ratio(1.0, 1.0, 2.0).unwrap(), (1472, 1408));
    }

    #[test]
    fn decimal_ratio_accepted() {
        let (w, h) = resolution_for_ratio(2.35, 1.0, 1.0).unwrap();
        assert!(w > h);
        assert_eq!(w % DIMENSION_STEP, 0);
        assert_eq!(h % DIMENSION_STEP, 0);
    }

    #[test]
    fn result_is_tight_under_target_area() {
        let ratios = [(1.0, 1.0), (16.0, 9.0), (4.0, 3.0), (21.0, 9.0), (2.0, 3.0), (1.5, 1.0)];
        let targets = [0.5, 1.0, 1.5, 2.0, 4.0];
        for &(rw, rh) in &ratios {
            for &mp in &targets {
                let (w, h) = resolution_for_ratio(rw, rh, mp).unwrap();
                let area = mp * PIXELS_PER_MEGAPIXEL;
                let (w, h) = (w as f64, h as f64);
                assert!(w * h <= area, "{rw}:{rh} @ {mp}MP -> {w}x{h} exceeds area");
                assert!(
                    (w + 64.0) * (h + 64.0) > area,
                    "{rw}:{rh} @ {mp}MP -> {w}x{h} is not tight"
                );
                assert_eq!(w as u32 % DIMENSION_STEP, 0);
                assert_eq!(h as u32 % DIMENSION_STEP, 0);
            }
        }
    }

    #[test]
    fn extreme_ratio_keeps_minimum_side() {
        let (w, h) = resolution_for_ratio(10000.0, 1.0, 1.0).unwrap();
        assert_eq!(h, DIMENSION_STEP);
        assert!((w as f64) * (h as f64) <= PIXELS_PER_MEGAPIXEL);
    }

    #[test]
    fn oversized_megapixels_rejected() {
        assert_matches!(
            resolution_for_ratio(1.0, 1.0, 1e14),
            Err(CoreError::InvalidParameter(_))
        );
        assert_matches!(
            resolution_for_ratio(1.0, 1.0, f64::INFINITY),
            Err(CoreError::InvalidParameter(_))
        );
    }

    #[test]
    fn largest_target_stays_tight() {
        let (w, h) = resolution_for_ratio(1.0, 1.0, MAX_MEGAPIXELS).unwrap();
        assert_eq!((w, h), (4096, 4096));
    }

    #[test]
    fn extreme_ratio_rejected() {
        assert_matches!(
            resolution_for_ratio(99999999999999999999.0, 1.0, 1.0),
            Err(CoreError::InvalidParameter(_))
        );
        assert_matches!(
            resolution_for_ratio(1.0, 99999999999999999999.0, 1.0),
            Err(CoreError::InvalidParameter(_))
        );
    }

    #[test]
    fn zero_megapixels_rejected() {
        assert!(resolution_for_ratio(1.0, 1.0, 0.0).is_err());
    }

    #[test]
    fn zero_ratio_rejected() {
        assert!(resolution_for_ratio(0.0, 1.0, 1.0).is_err());
    }

    #[test]
    fn tiny_area_rejected() {
        assert!(resolution_for_ratio(1.0, 1.0, 0.001).is_err());
    }

    #[test]
    fn explicit_resolution_rounds_each_side() {
        assert_eq!(round_resolution(1920, 1080).unwrap(), (1920, 1088));
        assert_eq!(round_resolution(1000, 1000).unwrap(), (1024, 1024));
    }

    #[test]
    fn explicit_resolution_rounds_half_to_even() {
        // 1056 / 64 = 16.5 -> 16, 1120 / 64 = 17.5 -> 18
        assert_eq!(round_resolution(1056, 1120).unwrap(), (1024, 1152));
    }

    #[test]
    fn explicit_resolution_collapsing_to_zero_rejected() {
        assert!(round_resolution(10, 10).is_err());
    }
}
