//! Time and memory estimation for tiled acquisitions.
//!
//! Both estimates work without touching any hardware, so callers can use
//! them for admission control before committing stage time. The time
//! estimate refines itself once real tiles have been acquired: the measured
//! average per tile is strictly more accurate than any a-priori model.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::hw::Stream;

/// Bytes of working memory consumed per acquired pixel during stitching,
/// found empirically.
pub const BYTES_PER_PIXEL: u64 = 22;

/// Memory assumed to be used by the rest of the system, subtracted from
/// total memory before the sufficiency comparison.
pub const RESERVED_HEADROOM: u64 = 2 * 1024 * 1024 * 1024; // 2 GiB

/// Stitching registration throughput in pixels per second.
pub const STITCH_SPEED: f64 = 1e8; // px/s

/// Default stage speed when the stage does not report one.
pub const MOVE_SPEED_DEFAULT: f64 = 100e-6; // m/s

/// Fixed per-move overhead on top of the travel time.
pub const MOVE_OVERHEAD: Duration = Duration::from_millis(300);

/// Outcome of the memory estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryEstimate {
    /// Whether the machine has enough memory to run safely.
    pub sufficient: bool,
    /// Estimated bytes consumed by the full acquisition.
    pub bytes: u64,
}

/// Estimates the memory needed to acquire and stitch `tile_count` tiles,
/// comparing it against `total_memory` minus the reserved headroom.
pub fn estimate_memory(
    streams: &[Arc<dyn Stream>],
    tile_count: usize,
    total_memory: u64,
) -> MemoryEstimate {
    let pixels: u64 = streams.iter().map(|s| s.estimated_pixels()).sum();
    let bytes = pixels * tile_count as u64 * BYTES_PER_PIXEL;
    let available = total_memory.saturating_sub(RESERVED_HEADROOM);
    debug!(
        "estimating {:.2} GB needed, while {:.2} GB available",
        bytes as f64 / 1024f64.powi(3),
        total_memory as f64 / 1024f64.powi(3)
    );
    MemoryEstimate {
        sufficient: bytes < available,
        bytes,
    }
}

/// A-priori estimate of one tile's acquisition time over all streams.
///
/// Streams with a focuser acquire one frame per configured z-level.
pub fn per_tile_acquisition_estimate(streams: &[Arc<dyn Stream>], zlevel_count: usize) -> Duration {
    streams
        .iter()
        .map(|s| {
            let frames = if s.focuser().is_some() {
                zlevel_count.max(1) as u32
            } else {
                1
            };
            s.exposure_estimate() * frames
        })
        .sum()
}

/// Pre-run estimate of the full acquisition duration for `remaining` tiles.
///
/// Sum of per-tile acquisition time, stage travel time (one reliable FoV per
/// move at `move_speed`, plus a fixed overhead per move) and stitching time
/// proportional to the overlap-region pixel count.
#[allow(clippy::too_many_arguments)]
pub fn pre_run_estimate(
    per_tile_acquisition: Duration,
    remaining: usize,
    total_tiles: usize,
    smallest_fov: (f64, f64),
    overlap: f64,
    move_speed: f64,
    max_frame_pixels: u64,
) -> Duration {
    let acq_time = per_tile_acquisition * remaining as u32;

    // The current tile is part of remaining, so there is no move to it
    let moves = remaining.saturating_sub(1) as f64;
    let move_time = smallest_fov.0.max(smallest_fov.1) * moves / move_speed
        + MOVE_OVERHEAD.as_secs_f64() * remaining as f64;

    let stitch_time = total_tiles as f64 * max_frame_pixels as f64 * overlap / STITCH_SPEED;

    debug!(
        "pre-run estimate for {} tiles: move {:.1}s, acquisition {:.1}s, stitch {:.1}s",
        remaining,
        move_time,
        acq_time.as_secs_f64(),
        stitch_time
    );
    acq_time + Duration::from_secs_f64(move_time + stitch_time)
}

/// Refined estimate once at least one tile has been acquired: measured
/// average time per tile times the remaining tile count.
pub fn refined_estimate(average_tile_time: Duration, remaining: usize) -> Duration {
    average_tile_time * remaining as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimStream;

    fn streams(pixels: u64) -> Vec<Arc<dyn Stream>> {
        vec![Arc::new(SimStream::em("sem", pixels)) as Arc<dyn Stream>]
    }

    #[test]
    fn test_memory_sufficient() {
        let est = estimate_memory(&streams(1024 * 1024), 4, 64 * 1024 * 1024 * 1024);
        assert_eq!(est.bytes, 1024 * 1024 * 4 * BYTES_PER_PIXEL);
        assert!(est.sufficient);
    }

    #[test]
    fn test_memory_insufficient_at_boundary() {
        // sufficient must be false whenever bytes >= total - headroom
        let bytes = 1000u64 * 10 * BYTES_PER_PIXEL;
        let total = bytes + RESERVED_HEADROOM;
        let est = estimate_memory(&streams(1000), 10, total);
        assert_eq!(est.bytes, bytes);
        assert!(!est.sufficient);
    }

    #[test]
    fn test_memory_insufficient_tiny_machine() {
        let est = estimate_memory(&streams(1_000_000), 100, 1024 * 1024 * 1024);
        assert!(!est.sufficient);
    }

    #[test]
    fn test_refined_estimate_scales_with_remaining() {
        let avg = Duration::from_millis(1500);
        assert_eq!(refined_estimate(avg, 4), Duration::from_millis(6000));
        assert_eq!(refined_estimate(avg, 0), Duration::ZERO);
    }

    #[test]
    fn test_pre_run_estimate_components() {
        // 1 tile: no move travel, one overhead
        let one = pre_run_estimate(
            Duration::from_secs(1),
            1,
            1,
            (100e-6, 100e-6),
            0.0,
            MOVE_SPEED_DEFAULT,
            0,
        );
        assert!((one.as_secs_f64() - 1.3).abs() < 1e-9);

        // 2 tiles: one travel of 100um at 100um/s = 1s extra plus overheads
        let two = pre_run_estimate(
            Duration::from_secs(1),
            2,
            2,
            (100e-6, 100e-6),
            0.0,
            MOVE_SPEED_DEFAULT,
            0,
        );
        assert!((two.as_secs_f64() - (2.0 + 1.0 + 0.6)).abs() < 1e-9);
    }

    #[test]
    fn test_pre_run_estimate_includes_stitching() {
        let with_overlap = pre_run_estimate(
            Duration::ZERO,
            0,
            10,
            (100e-6, 100e-6),
            0.2,
            MOVE_SPEED_DEFAULT,
            100_000_000,
        );
        // 10 tiles * 1e8 px * 0.2 / 1e8 px/s = 2s
        assert!((with_overlap.as_secs_f64() - 2.0).abs() < 1e-9);
    }
}
