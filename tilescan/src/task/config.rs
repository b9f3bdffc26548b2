//! Tiled-scan configuration and its validation errors.

use std::path::PathBuf;

use thiserror::Error;

use crate::focus::{FocusError, FocusingMethod};
use crate::geometry::{GeometryError, Polygon};
use crate::grid::PlanError;
use crate::stitch::{RegistrationMethod, WeavingMethod};

/// The region to cover, in stage coordinates (metres).
#[derive(Debug, Clone, PartialEq)]
pub enum RegionSpec {
    /// Axis-aligned rectangle.
    Bounds {
        xmin: f64,
        ymin: f64,
        xmax: f64,
        ymax: f64,
    },
    /// Arbitrary simple polygon given by its vertices.
    Polygon(Vec<(f64, f64)>),
}

impl RegionSpec {
    pub fn to_polygon(&self) -> Result<Polygon, GeometryError> {
        match self {
            Self::Bounds {
                xmin,
                ymin,
                xmax,
                ymax,
            } => Polygon::from_bbox(*xmin, *ymin, *xmax, *ymax),
            Self::Polygon(vertices) => Polygon::new(vertices.clone()),
        }
    }
}

/// Everything a tiled scan needs to know besides the hardware itself.
#[derive(Debug, Clone)]
pub struct TiledScanConfig {
    /// Region to cover.
    pub region: RegionSpec,
    /// Fraction of each tile shared with its neighbours, in [0, 1).
    pub overlap: f64,
    /// When (and whether) the autofocuser runs during the scan.
    pub focusing_method: FocusingMethod,
    /// Relative z-stack levels in metres around the predicted focus. More
    /// than one level is only meaningful with
    /// [`FocusingMethod::MaxIntensityProjection`].
    pub zlevels: Vec<f64>,
    /// Known good-focus positions (x, y, z) used to build the focus surface.
    pub focus_points: Vec<(f64, f64, f64)>,
    pub registration: RegistrationMethod,
    pub weaving: WeavingMethod,
    /// When set, every acquired tile is also written raw to disk next to
    /// this path, for post-mortem debugging of stitching problems.
    pub dump_path: Option<PathBuf>,
}

impl TiledScanConfig {
    /// A scan over `region` with the default 20% overlap and no focusing.
    pub fn new(region: RegionSpec) -> Self {
        Self {
            region,
            overlap: 0.2,
            focusing_method: FocusingMethod::default(),
            zlevels: Vec::new(),
            focus_points: Vec::new(),
            registration: RegistrationMethod::default(),
            weaving: WeavingMethod::default(),
            dump_path: None,
        }
    }
}

/// Errors detected while validating a scan configuration, before any
/// hardware is touched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid region: {0}")]
    InvalidRegion(#[from] GeometryError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Focus(#[from] FocusError),

    #[error("at least one acquisition stream is required")]
    NoStreams,

    #[error("at least one acquisition area is required")]
    NoAreas,

    /// Multiple z-levels without a reduction step would hand the stitcher an
    /// unreduced volume, which it cannot register.
    #[error("multiple z levels require the max-intensity-projection focusing method")]
    UnsupportedConfiguration,

    #[error("max-intensity projection requires at least two z levels")]
    MipRequiresZLevels,

    #[error("focusing method requires an autofocus runner, but none was provided")]
    AutofocusUnavailable,

    #[error("dump path {0} has no file name")]
    DumpPathMissingFilename(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_to_polygon() {
        let region = RegionSpec::Bounds {
            xmin: 0.0,
            ymin: 0.0,
            xmax: 1e-3,
            ymax: 2e-3,
        };
        let polygon = region.to_polygon().unwrap();
        let bounds = polygon.bounds();
        assert!((bounds.width() - 1e-3).abs() < 1e-12);
        assert!((bounds.height() - 2e-3).abs() < 1e-12);
    }

    #[test]
    fn test_degenerate_polygon_rejected() {
        let region = RegionSpec::Polygon(vec![(0.0, 0.0), (1.0, 1.0)]);
        assert!(region.to_polygon().is_err());
    }

    #[test]
    fn test_default_overlap() {
        let config = TiledScanConfig::new(RegionSpec::Bounds {
            xmin: 0.0,
            ymin: 0.0,
            xmax: 1.0,
            ymax: 1.0,
        });
        assert!((config.overlap - 0.2).abs() < 1e-12);
        assert_eq!(config.focusing_method, FocusingMethod::None);
    }
}
