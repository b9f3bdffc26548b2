//! External hardware interfaces consumed by the acquisition engine.
//!
//! The engine never talks to drivers directly; it is written against the
//! traits in this module. Implementations wrap real actuator/detector
//! control (or the simulated rig in [`crate::sim`]).
//!
//! All async trait methods return boxed futures so the engine can hold
//! heterogeneous collections of trait objects (one `Vec<Arc<dyn Stream>>`
//! drives the whole run).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::frame::{AcquisitionKind, Frame};

/// Boxed future type for object-safe async trait methods.
pub type HwFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors reported by hardware operations.
#[derive(Debug, Clone, Error)]
pub enum HardwareError {
    /// The operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// A stage or focuser move failed.
    #[error("move failed: {0}")]
    MoveFailed(String),

    /// A detector acquisition failed entirely.
    #[error("acquisition failed: {0}")]
    AcquisitionFailed(String),

    /// A requested position is outside the actuator's allowed range.
    #[error("position {value} outside allowed range [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },
}

/// Absolute stage position in metres.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StagePosition {
    pub x: f64,
    pub y: f64,
}

/// A partial absolute move: only the axes that are set are commanded.
///
/// Leaving an axis unset avoids issuing spurious movement commands when
/// scanning along a single axis.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MoveRequest {
    pub x: Option<f64>,
    pub y: Option<f64>,
}

impl MoveRequest {
    pub fn is_empty(&self) -> bool {
        self.x.is_none() && self.y.is_none()
    }
}

/// Handle to an in-flight stage move: cancellable and awaitable.
pub struct MoveHandle {
    cancel: CancellationToken,
    done: oneshot::Receiver<Result<(), HardwareError>>,
}

impl MoveHandle {
    /// Creates a handle from a cancellation token and a completion channel.
    ///
    /// Driver implementations cancel their motion when the token fires and
    /// send exactly one completion result.
    pub fn new(
        cancel: CancellationToken,
        done: oneshot::Receiver<Result<(), HardwareError>>,
    ) -> Self {
        Self { cancel, done }
    }

    /// A move that is already complete (used when no axis changed).
    pub fn completed() -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(()));
        Self {
            cancel: CancellationToken::new(),
            done: rx,
        }
    }

    /// Token that aborts the move when cancelled. Cloneable, so a canceller
    /// can keep it while the worker awaits [`MoveHandle::wait`].
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Requests the move to stop where it is.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the move to finish.
    pub async fn wait(self) -> Result<(), HardwareError> {
        match self.done.await {
            Ok(res) => res,
            // Driver dropped the channel without reporting: treat as cancelled
            Err(_) => Err(HardwareError::Cancelled),
        }
    }
}

/// Sample stage actuator.
pub trait Stage: Send + Sync + 'static {
    /// Starts an absolute move and returns a cancellable, awaitable handle.
    fn move_absolute(&self, request: MoveRequest) -> MoveHandle;

    /// Current stage position.
    fn position(&self) -> StagePosition;

    /// Mean axis speed in m/s, when the stage reports one. Only used to
    /// refine travel-time estimates.
    fn speed(&self) -> Option<f64> {
        None
    }
}

/// Focus actuator attached to a stream.
pub trait Focuser: Send + Sync + 'static {
    /// Moves the focus axis and resolves once the position is reached.
    fn move_absolute_sync(&self, z: f64) -> HwFuture<'_, Result<(), HardwareError>>;

    /// Current focus position.
    fn position(&self) -> f64;

    /// Allowed travel range of the focus axis as (min, max).
    fn allowed_range(&self) -> (f64, f64);
}

/// Result of one stream acquisition.
#[derive(Debug)]
pub struct AcquisitionResult {
    /// The frames produced; the first one is the expected tile image.
    pub frames: Vec<Frame>,
    /// A partial failure, if some detectors did not deliver. The returned
    /// frames are still usable.
    pub partial_failure: Option<String>,
}

/// One acquisition stream (detector plus its settings).
pub trait Stream: Send + Sync + 'static {
    /// Human-readable stream name for logging.
    fn name(&self) -> &str;

    /// Acquisition-type classification of the frames this stream produces.
    fn kind(&self) -> AcquisitionKind;

    /// Estimated field of view (width, height) in metres, from the current
    /// settings.
    fn fov(&self) -> (f64, f64);

    /// Number of pixels one acquisition will generate. Multi-detector
    /// streams scale with their repetition factor; kinds that are never
    /// stitched report 0.
    fn estimated_pixels(&self) -> u64;

    /// Estimated duration of a single-frame acquisition.
    fn exposure_estimate(&self) -> Duration;

    /// The focus actuator driving this stream's focal plane, if any.
    fn focuser(&self) -> Option<Arc<dyn Focuser>>;

    /// Acquires one frame (or frame set) at the current position.
    fn acquire(&self) -> HwFuture<'_, Result<AcquisitionResult, HardwareError>>;
}

/// External autofocus search over a single position.
pub trait AutofocusRunner: Send + Sync + 'static {
    /// Runs the autofocus search bounded to `range`, seeded around
    /// `good_focus`. Resolves to the focus position found.
    fn run(
        &self,
        focuser: Arc<dyn Focuser>,
        good_focus: f64,
        range: (f64, f64),
    ) -> HwFuture<'_, Result<f64, HardwareError>>;

    /// Rough duration estimate for one search.
    fn estimate_time(&self) -> Duration;
}

/// External autofocus sweep over a region of interest, producing fresh
/// good-focus points for that region.
pub trait RoiAutofocus: Send + Sync + 'static {
    /// Focuses at each seed position inside `roi` and returns the measured
    /// (x, y, z) good-focus points.
    fn autofocus_in_roi(
        &self,
        roi: crate::geometry::Rect,
        seeds: Vec<(f64, f64)>,
        focus_range: (f64, f64),
    ) -> HwFuture<'_, Result<Vec<(f64, f64, f64)>, HardwareError>>;

    /// Rough duration estimate for focusing `n_points` seeds.
    fn estimate_time(&self, n_points: usize) -> Duration;
}

/// Smallest field of view across the given streams.
///
/// The smallest FoV dictates the tile pitch: every stream must fully cover
/// each planned tile. Errors when no stream is supplied.
pub fn smallest_fov(streams: &[Arc<dyn Stream>]) -> Option<(f64, f64)> {
    let fovs: Vec<(f64, f64)> = streams.iter().map(|s| s.fov()).collect();
    if fovs.is_empty() {
        return None;
    }
    Some((
        fovs.iter().map(|f| f.0).fold(f64::INFINITY, f64::min),
        fovs.iter().map(|f| f.1).fold(f64::INFINITY, f64::min),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_move_handle_completed() {
        let handle = MoveHandle::completed();
        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_move_handle_dropped_driver_is_cancelled() {
        let (tx, rx) = oneshot::channel::<Result<(), HardwareError>>();
        let handle = MoveHandle::new(CancellationToken::new(), rx);
        drop(tx);
        assert!(matches!(handle.wait().await, Err(HardwareError::Cancelled)));
    }

    #[tokio::test]
    async fn test_move_handle_cancel_reaches_driver() {
        let (tx, rx) = oneshot::channel();
        let token = CancellationToken::new();
        let handle = MoveHandle::new(token.clone(), rx);

        let driver = tokio::spawn(async move {
            token.cancelled().await;
            let _ = tx.send(Err(HardwareError::Cancelled));
        });

        handle.cancel();
        assert!(matches!(handle.wait().await, Err(HardwareError::Cancelled)));
        driver.await.unwrap();
    }

    #[test]
    fn test_move_request_empty() {
        assert!(MoveRequest::default().is_empty());
        assert!(!MoveRequest {
            x: Some(1.0),
            y: None
        }
        .is_empty());
    }
}
