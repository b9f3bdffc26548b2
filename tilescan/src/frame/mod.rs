//! Raw frame data model.
//!
//! A [`Frame`] is one detector readout: a 16-bit 2-D array tagged with the
//! physical metadata the stitcher needs (acquisition kind, pixel size,
//! center position). Z-stacks are assembled into a [`ZCube`] and optionally
//! collapsed by maximum-intensity projection.

use thiserror::Error;

/// Classification of an acquisition, a fixed closed set.
///
/// Used to pick the stitching "leader" per tile: the stream offering the
/// most distinctive, highest-resolution content becomes the reference the
/// other streams are registered against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcquisitionKind {
    /// Electron microscopy; the preferred stitching leader (smallest FoV,
    /// most contrast).
    ElectronMicroscopy,
    /// Fluorescence microscopy.
    Fluorescence,
    /// Cathodoluminescence.
    CathodoLuminescence,
    /// Angle-resolved; not suitable for stitching.
    AngleResolved,
    /// Spectrum; not suitable for stitching.
    Spectrum,
}

impl AcquisitionKind {
    /// Whether frames of this kind take part in tiling/stitching at all.
    pub fn stitchable(self) -> bool {
        !matches!(self, Self::AngleResolved | Self::Spectrum)
    }

    /// Leader quality: the bigger, the more leadership.
    ///
    /// EM images rank by their full pixel count; everything else is far
    /// less likely to lead and is discounted by two orders of magnitude.
    pub fn leader_weight(self, pixels: u64) -> u64 {
        match self {
            Self::ElectronMicroscopy => pixels,
            _ => pixels / 100,
        }
    }
}

impl std::fmt::Display for AcquisitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ElectronMicroscopy => "em",
            Self::Fluorescence => "fluo",
            Self::CathodoLuminescence => "cl",
            Self::AngleResolved => "ar",
            Self::Spectrum => "spectrum",
        };
        f.write_str(s)
    }
}

/// Physical metadata attached to each frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMetadata {
    pub kind: AcquisitionKind,
    /// Pixel size in metres per pixel, (x, y).
    pub pixel_size: (f64, f64),
    /// Stage position of the frame center in metres.
    pub center: (f64, f64),
    /// Focus position the frame was acquired at, if a focuser was involved.
    pub z_position: Option<f64>,
}

/// Errors from frame and cube assembly.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame data length {len} does not match {width}x{height}")]
    ShapeMismatch {
        len: usize,
        width: usize,
        height: usize,
    },

    #[error("z-cube requires one frame per level: {frames} frames for {levels} levels")]
    LevelCountMismatch { frames: usize, levels: usize },

    #[error("z-cube frames must share dimensions: {0}x{1} vs {2}x{3}")]
    InconsistentDimensions(usize, usize, usize, usize),

    #[error("z-cube requires at least one frame")]
    Empty,
}

/// One raw 16-bit frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u16>,
    pub metadata: FrameMetadata,
}

impl Frame {
    pub fn new(
        width: usize,
        height: usize,
        data: Vec<u16>,
        metadata: FrameMetadata,
    ) -> Result<Self, FrameError> {
        if data.len() != width * height {
            return Err(FrameError::ShapeMismatch {
                len: data.len(),
                width,
                height,
            });
        }
        Ok(Self {
            width,
            height,
            data,
            metadata,
        })
    }

    pub fn pixel_count(&self) -> u64 {
        (self.width * self.height) as u64
    }

    /// Physical field of view of the recorded data, (width, height) in m.
    pub fn fov(&self) -> (f64, f64) {
        (
            self.width as f64 * self.metadata.pixel_size.0,
            self.height as f64 * self.metadata.pixel_size.1,
        )
    }
}

/// A stack of frames of one stream acquired at successive focus levels.
#[derive(Debug, Clone)]
pub struct ZCube {
    pub levels: Vec<f64>,
    pub frames: Vec<Frame>,
}

impl ZCube {
    /// Assembles a cube, verifying one frame per level and uniform shape.
    pub fn new(frames: Vec<Frame>, levels: Vec<f64>) -> Result<Self, FrameError> {
        if frames.is_empty() {
            return Err(FrameError::Empty);
        }
        if frames.len() != levels.len() {
            return Err(FrameError::LevelCountMismatch {
                frames: frames.len(),
                levels: levels.len(),
            });
        }
        let (w, h) = (frames[0].width, frames[0].height);
        for f in &frames[1..] {
            if f.width != w || f.height != h {
                return Err(FrameError::InconsistentDimensions(w, h, f.width, f.height));
            }
        }
        Ok(Self { levels, frames })
    }
}

/// Collapses a z-cube into a single frame by per-pixel maximum across z.
///
/// The result carries the metadata of the first frame in the stack.
pub fn max_intensity_projection(cube: &ZCube) -> Frame {
    let first = &cube.frames[0];
    let mut data = first.data.clone();
    for frame in &cube.frames[1..] {
        for (dst, &src) in data.iter_mut().zip(frame.data.iter()) {
            if src > *dst {
                *dst = src;
            }
        }
    }
    Frame {
        width: first.width,
        height: first.height,
        data,
        metadata: first.metadata.clone(),
    }
}

/// Reorders the frames of one tile so the best stitching leader comes
/// first, and drops kinds that cannot be stitched at all.
pub fn sort_stitch_leaders(frames: Vec<Frame>) -> Vec<Frame> {
    let mut frames: Vec<Frame> = frames
        .into_iter()
        .filter(|f| f.metadata.kind.stitchable())
        .collect();
    frames.sort_by_key(|f| std::cmp::Reverse(f.metadata.kind.leader_weight(f.pixel_count())));
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(kind: AcquisitionKind) -> FrameMetadata {
        FrameMetadata {
            kind,
            pixel_size: (1e-6, 1e-6),
            center: (0.0, 0.0),
            z_position: None,
        }
    }

    fn frame(kind: AcquisitionKind, w: usize, h: usize, fill: u16) -> Frame {
        Frame::new(w, h, vec![fill; w * h], meta(kind)).unwrap()
    }

    #[test]
    fn test_frame_shape_mismatch() {
        let err = Frame::new(4, 4, vec![0; 15], meta(AcquisitionKind::Fluorescence)).unwrap_err();
        assert!(matches!(err, FrameError::ShapeMismatch { len: 15, .. }));
    }

    #[test]
    fn test_frame_fov() {
        let f = frame(AcquisitionKind::Fluorescence, 100, 50, 0);
        let (w, h) = f.fov();
        assert!((w - 100e-6).abs() < 1e-12);
        assert!((h - 50e-6).abs() < 1e-12);
    }

    #[test]
    fn test_zcube_level_mismatch() {
        let frames = vec![frame(AcquisitionKind::Fluorescence, 2, 2, 0)];
        let err = ZCube::new(frames, vec![0.0, 1.0]).unwrap_err();
        assert!(matches!(err, FrameError::LevelCountMismatch { .. }));
    }

    #[test]
    fn test_max_intensity_projection() {
        let mut a = frame(AcquisitionKind::Fluorescence, 2, 2, 0);
        a.data = vec![10, 0, 5, 7];
        a.metadata.z_position = Some(1.0);
        let mut b = frame(AcquisitionKind::Fluorescence, 2, 2, 0);
        b.data = vec![3, 20, 1, 7];
        b.metadata.z_position = Some(2.0);

        let cube = ZCube::new(vec![a, b], vec![1.0, 2.0]).unwrap();
        let mip = max_intensity_projection(&cube);
        assert_eq!(mip.data, vec![10, 20, 5, 7]);
        // Metadata of the first frame in the stack is carried over
        assert_eq!(mip.metadata.z_position, Some(1.0));
    }

    #[test]
    fn test_sort_stitch_leaders_em_first() {
        let small_em = frame(AcquisitionKind::ElectronMicroscopy, 8, 8, 0);
        let big_fluo = frame(AcquisitionKind::Fluorescence, 64, 64, 0);
        let sorted = sort_stitch_leaders(vec![big_fluo.clone(), small_em.clone()]);
        // 64 EM pixels outrank 4096/100 = 40 weighted fluo pixels
        assert_eq!(sorted[0].metadata.kind, AcquisitionKind::ElectronMicroscopy);
        assert_eq!(sorted.len(), 2);
    }

    #[test]
    fn test_sort_stitch_leaders_drops_unstitchable() {
        let em = frame(AcquisitionKind::ElectronMicroscopy, 8, 8, 0);
        let spectrum = frame(AcquisitionKind::Spectrum, 8, 8, 0);
        let ar = frame(AcquisitionKind::AngleResolved, 8, 8, 0);
        let sorted = sort_stitch_leaders(vec![spectrum, em, ar]);
        assert_eq!(sorted.len(), 1);
        assert_eq!(sorted[0].metadata.kind, AcquisitionKind::ElectronMicroscopy);
    }

    #[test]
    fn test_bigger_em_leads() {
        let em_small = frame(AcquisitionKind::ElectronMicroscopy, 8, 8, 0);
        let em_big = frame(AcquisitionKind::ElectronMicroscopy, 16, 16, 0);
        let sorted = sort_stitch_leaders(vec![em_small, em_big.clone()]);
        assert_eq!(sorted[0].width, 16);
    }
}
