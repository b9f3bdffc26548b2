//! Cancellable tiled-acquisition task.
//!
//! A [`TiledScanTask`] plans the tile grid for one region at construction
//! time, and [`TiledScanTask::start`] spawns the worker that drives the
//! stage, focus and streams through the planned tour. The returned
//! [`ScanHandle`] exposes the task lifecycle ([`TaskState`]), a live
//! end-time estimate, and cooperative cancellation.

mod config;
mod state;
mod tiled;

pub use config::{ConfigError, RegionSpec, TiledScanConfig};
pub use state::TaskState;
pub use tiled::{
    start_tiled_scan, MoveOutcome, ScanCanceller, ScanError, ScanHandle, ScanOutput,
    ScanStartError, TiledScanTask, FIRST_MOVE_TIMEOUT,
};

pub(crate) use state::{lock, with_cancel, RunState, SharedRunState};
