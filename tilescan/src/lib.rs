//! TileScan - tiled stage acquisition engine
//!
//! This library plans and executes spatially-tiled image acquisitions over an
//! irregular sample region, producing a matrix of per-tile raw frames that an
//! external stitcher merges into one continuous image.
//!
//! # High-Level API
//!
//! ```ignore
//! use tilescan::task::{start_tiled_scan, RegionSpec, TiledScanConfig, TiledScanTask};
//!
//! let config = TiledScanConfig::new(RegionSpec::Bounds {
//!     xmin: 0.0,
//!     ymin: 0.0,
//!     xmax: 300e-6,
//!     ymax: 300e-6,
//! });
//! let task = TiledScanTask::new(config, stage, streams, stitcher, None)?;
//! let handle = start_tiled_scan(task)?;
//!
//! // The handle reports progress and accepts cancellation
//! let output = handle.wait().await?;
//! ```

pub mod estimate;
pub mod focus;
pub mod frame;
pub mod geometry;
pub mod grid;
pub mod hw;
pub mod logging;
pub mod overview;
pub mod sim;
pub mod stitch;
pub mod system;
pub mod task;

/// Version of the tilescan library and CLI.
///
/// This is synchronized across all components in the workspace.
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
