//! Focus management: focusing policy, z-stack levels and the interpolated
//! focus surface.
//!
//! Good-focus positions are only known at a few sampled (x, y, z) points.
//! Between tiles the engine predicts focus by interpolating over a
//! triangulation of those points ([`FocusSurface`]), and the z-stack levels
//! for a tile are re-centered on the predicted value while staying inside
//! the focuser's allowed range.

mod surface;
mod tri;

pub use surface::FocusSurface;
pub use tri::Triangulation;

use thiserror::Error;

use crate::frame::Frame;

/// Ratio of the allowed degradation of tile focus from the good-focus
/// baseline before autofocus is triggered.
pub const FOCUS_FIDELITY: f64 = 0.3;

/// Limit of the focus search range; half the margin is used on each side of
/// the initial focus.
pub const FOCUS_RANGE_MARGIN: f64 = 100e-6; // m

/// Number of tiles to skip between focus-quality checks.
pub const SKIP_TILES: usize = 3;

/// Default relative range for the optical focus adjustment when the focuser
/// reports no absolute active range.
pub const SAFE_REL_RANGE_DEFAULT: (f64, f64) = (-50e-6, 50e-6); // m

/// Maximum distance separating two focus points generated for an
/// autofocus-over-region pass. Larger spacing risks out-of-focus tiles
/// between the sampled points.
pub const MAX_DISTANCE_FOCUS_POINTS: f64 = 450e-6; // m

/// When the autofocuser runs during an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FocusingMethod {
    /// Never adjust focus.
    #[default]
    None,
    /// Run autofocus before every tile.
    Always,
    /// Measure sharpness on a fixed cadence and refocus only when it has
    /// degraded past [`FOCUS_FIDELITY`] relative to the first-tile baseline.
    OnLowFocusLevel,
    /// Acquire a z-stack per tile and collapse it by maximum-intensity
    /// projection; no single-shot autofocus is ever triggered.
    MaxIntensityProjection,
}

/// Errors from focus-point configuration.
#[derive(Debug, Error)]
pub enum FocusError {
    /// One point gives constant focus, three or more a surface; exactly two
    /// points cannot define either.
    #[error("{0} focus points are not supported (need 0, 1, or >= 3)")]
    UnsupportedPointCount(usize),
}

/// Computes the absolute z-levels for one tile's acquisition.
///
/// The initial (relative) levels are shifted by the predicted focus value,
/// then clipped into `range` with a symmetric shift that never changes the
/// number of levels. If the stack span exceeds the whole range, the stack
/// is spread over the entire range instead.
pub fn zstack_levels(focus_value: f64, init_levels: &[f64], range: (f64, f64)) -> Vec<f64> {
    if init_levels.len() <= 1 {
        // Single acquisition at the predicted focus
        return vec![focus_value];
    }

    let shifted: Vec<f64> = init_levels.iter().map(|z| z + focus_value).collect();
    let mut zmin = shifted.iter().cloned().fold(f64::INFINITY, f64::min);
    let mut zmax = shifted.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    if (zmax - zmin) > (range.1 - range.0) {
        // Corner case: larger than the entire range => limit to the range
        zmin = range.0;
        zmax = range.1;
    }
    if zmax > range.1 {
        // Too high => shift down
        let shift = zmax - range.1;
        zmin -= shift;
        zmax -= shift;
    }
    if zmin < range.0 {
        // Too low => shift up
        let shift = range.0 - zmin;
        zmin += shift;
        zmax += shift;
    }

    linspace(zmin, zmax, init_levels.len())
}

/// Evenly spaced values from `start` to `end` inclusive.
fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    let step = (end - start) / (n - 1) as f64;
    (0..n).map(|i| start + step * i as f64).collect()
}

/// Image-sharpness score used by the `OnLowFocusLevel` policy.
///
/// Mean squared intensity gradient: in-focus frames have strong local
/// contrast, defocused frames are smooth. Only relative comparisons against
/// the first-tile baseline matter, not the absolute value.
pub fn sharpness_score(frame: &Frame) -> f64 {
    if frame.width < 2 || frame.height < 2 {
        return 0.0;
    }
    let mut acc = 0.0f64;
    let mut count = 0u64;
    for y in 0..frame.height {
        for x in 0..frame.width {
            let v = frame.data[y * frame.width + x] as f64;
            if x + 1 < frame.width {
                let dx = frame.data[y * frame.width + x + 1] as f64 - v;
                acc += dx * dx;
                count += 1;
            }
            if y + 1 < frame.height {
                let dy = frame.data[(y + 1) * frame.width + x] as f64 - v;
                acc += dy * dy;
                count += 1;
            }
        }
    }
    acc / count as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{AcquisitionKind, FrameMetadata};

    #[test]
    fn test_zstack_levels_single() {
        assert_eq!(zstack_levels(5.0, &[], (0.0, 10.0)), vec![5.0]);
        assert_eq!(zstack_levels(5.0, &[0.0], (0.0, 10.0)), vec![5.0]);
    }

    #[test]
    fn test_zstack_levels_centered() {
        let levels = zstack_levels(5.0, &[-1.0, 0.0, 1.0], (0.0, 10.0));
        assert_eq!(levels, vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_zstack_levels_shifted_down_into_range() {
        let levels = zstack_levels(9.5, &[-1.0, 0.0, 1.0], (0.0, 10.0));
        assert_eq!(levels.len(), 3);
        let max = levels.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let min = levels.iter().cloned().fold(f64::INFINITY, f64::min);
        assert!(max <= 10.0 + 1e-12);
        assert!((max - min - 2.0).abs() < 1e-12, "span must be preserved");
    }

    #[test]
    fn test_zstack_levels_span_clamped_to_range() {
        let levels = zstack_levels(5.0, &[-20.0, 0.0, 20.0], (0.0, 10.0));
        assert_eq!(levels.len(), 3, "level count never changes");
        let max = levels.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let min = levels.iter().cloned().fold(f64::INFINITY, f64::min);
        assert!(max - min <= 10.0 + 1e-12, "span may never exceed the range");
        assert!(min >= -1e-12 && max <= 10.0 + 1e-12);
    }

    #[test]
    fn test_sharpness_orders_flat_below_textured() {
        let meta = FrameMetadata {
            kind: AcquisitionKind::Fluorescence,
            pixel_size: (1e-6, 1e-6),
            center: (0.0, 0.0),
            z_position: None,
        };
        let flat = Frame::new(4, 4, vec![100; 16], meta.clone()).unwrap();
        let checker: Vec<u16> = (0..16)
            .map(|i| if (i / 4 + i % 4) % 2 == 0 { 0 } else { 1000 })
            .collect();
        let textured = Frame::new(4, 4, checker, meta).unwrap();
        assert_eq!(sharpness_score(&flat), 0.0);
        assert!(sharpness_score(&textured) > sharpness_score(&flat));
    }
}
