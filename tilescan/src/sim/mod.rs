//! Simulated hardware rig.
//!
//! Implements every hardware trait with timing-faithful in-memory fakes:
//! stage moves take travel time at the configured speed, acquisitions sleep
//! for their exposure, and frame sharpness degrades with defocus. Used by
//! the test suite and by the CLI's simulated-run mode.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::frame::{AcquisitionKind, Frame, FrameMetadata};
use crate::geometry::Rect;
use crate::hw::{
    AcquisitionResult, AutofocusRunner, Focuser, HardwareError, HwFuture, MoveHandle,
    MoveRequest, RoiAutofocus, Stage, StagePosition, Stream,
};
use crate::stitch::{RegistrationMethod, StitchError, Stitcher, WeavingMethod};

fn plock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Simulated stage: moves take `distance / speed` seconds.
pub struct SimStage {
    // Shared with detached move tasks, which outlive the borrow of `self`
    position: Arc<Mutex<StagePosition>>,
    speed: f64,
    stuck: AtomicBool,
}

impl SimStage {
    /// Stage with the given axis speed in m/s, parked at the origin.
    pub fn new(speed: f64) -> Self {
        Self {
            position: Arc::new(Mutex::new(StagePosition::default())),
            speed,
            stuck: AtomicBool::new(false),
        }
    }

    /// When stuck, moves start but never confirm; only cancellation (or a
    /// caller-side timeout) ends them. Models a stalled axis.
    pub fn set_stuck(&self, stuck: bool) {
        self.stuck.store(stuck, Ordering::SeqCst);
    }
}

impl Stage for SimStage {
    fn move_absolute(&self, request: MoveRequest) -> MoveHandle {
        let token = CancellationToken::new();
        let (tx, rx) = oneshot::channel();

        let current = *plock(&self.position);
        let target = StagePosition {
            x: request.x.unwrap_or(current.x),
            y: request.y.unwrap_or(current.y),
        };
        let travel = ((target.x - current.x).powi(2) + (target.y - current.y).powi(2)).sqrt();
        let duration = if self.stuck.load(Ordering::SeqCst) {
            // Effectively forever
            Duration::from_secs(86_400)
        } else {
            Duration::from_secs_f64(travel / self.speed)
        };

        let position = Arc::clone(&self.position);
        let task_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => {
                    let _ = tx.send(Err(HardwareError::Cancelled));
                }
                _ = tokio::time::sleep(duration) => {
                    *plock(&position) = target;
                    let _ = tx.send(Ok(()));
                }
            }
        });

        MoveHandle::new(token, rx)
    }

    fn position(&self) -> StagePosition {
        *plock(&self.position)
    }

    fn speed(&self) -> Option<f64> {
        Some(self.speed)
    }
}

/// Simulated focus actuator.
pub struct SimFocuser {
    position: Mutex<f64>,
    range: (f64, f64),
}

impl SimFocuser {
    pub fn new(range: (f64, f64)) -> Self {
        Self {
            position: Mutex::new(0.0),
            range,
        }
    }
}

impl Focuser for SimFocuser {
    fn move_absolute_sync(&self, z: f64) -> HwFuture<'_, Result<(), HardwareError>> {
        Box::pin(async move {
            let (min, max) = self.range;
            if z < min || z > max {
                return Err(HardwareError::OutOfRange {
                    value: z,
                    min,
                    max,
                });
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
            *plock(&self.position) = z;
            Ok(())
        })
    }

    fn position(&self) -> f64 {
        *plock(&self.position)
    }

    fn allowed_range(&self) -> (f64, f64) {
        self.range
    }
}

/// Simulated detector stream producing checkerboard frames.
///
/// When a focuser is attached, the checkerboard contrast falls off with the
/// distance between the focuser position and the sample's good focus, so
/// sharpness-based policies have something real to measure.
pub struct SimStream {
    name: String,
    kind: AcquisitionKind,
    width: usize,
    height: usize,
    declared_pixels: u64,
    fov: (f64, f64),
    measured_fov: Option<(f64, f64)>,
    exposure: Duration,
    focuser: Option<Arc<SimFocuser>>,
    good_focus: f64,
    focus_drift: f64,
    acquired: AtomicU64,
}

impl SimStream {
    /// Electron-microscopy stream with `pixels` declared pixels per frame
    /// and a fixed 100 um square FoV. The delivered frame is the nearest
    /// square.
    pub fn em(name: &str, pixels: u64) -> Self {
        let side = ((pixels as f64).sqrt().round() as usize).max(1);
        Self {
            name: name.to_string(),
            kind: AcquisitionKind::ElectronMicroscopy,
            width: side,
            height: side,
            declared_pixels: pixels,
            fov: (100e-6, 100e-6),
            measured_fov: None,
            exposure: Duration::from_millis(5),
            focuser: None,
            good_focus: 0.0,
            focus_drift: 0.0,
            acquired: AtomicU64::new(0),
        }
    }

    /// Fluorescence stream of `side` x `side` pixels driven by `focuser`,
    /// with the same default 100 um FoV.
    pub fn fluorescence(name: &str, side: usize, focuser: Arc<SimFocuser>) -> Self {
        let side = side.max(1);
        Self {
            name: name.to_string(),
            kind: AcquisitionKind::Fluorescence,
            width: side,
            height: side,
            declared_pixels: (side * side) as u64,
            fov: (100e-6, 100e-6),
            measured_fov: None,
            exposure: Duration::from_millis(20),
            focuser: Some(focuser),
            good_focus: 0.0,
            focus_drift: 0.0,
            acquired: AtomicU64::new(0),
        }
    }

    pub fn with_exposure(mut self, exposure: Duration) -> Self {
        self.exposure = exposure;
        self
    }

    pub fn with_fov(mut self, width: f64, height: f64) -> Self {
        self.fov = (width, height);
        self
    }

    /// Focus position at which this stream's frames are sharpest.
    pub fn with_good_focus(mut self, z: f64) -> Self {
        self.good_focus = z;
        self
    }

    /// Shifts the good focus by `step` after every acquisition, modelling
    /// thermal drift of the sample.
    pub fn with_focus_drift(mut self, step: f64) -> Self {
        self.focus_drift = step;
        self
    }

    /// Calibrated FoV stamped on delivered frames, when it differs from
    /// the settings estimate reported by [`Stream::fov`].
    pub fn with_measured_fov(mut self, width: f64, height: f64) -> Self {
        self.measured_fov = Some((width, height));
        self
    }

    fn render(&self, shot: u64) -> Frame {
        let recorded_fov = self.measured_fov.unwrap_or(self.fov);
        let amplitude = match &self.focuser {
            Some(focuser) => {
                let good = self.good_focus + self.focus_drift * shot as f64;
                let defocus = (focuser.position() - good).abs();
                let blur = 1.0 + (defocus / 5e-6).powi(2);
                (1000.0 / blur) as u16
            }
            None => 1000,
        };
        let data: Vec<u16> = (0..self.width * self.height)
            .map(|i| {
                let (x, y) = (i % self.width, i / self.width);
                if (x + y) % 2 == 0 {
                    amplitude
                } else {
                    amplitude / 4
                }
            })
            .collect();
        Frame {
            width: self.width,
            height: self.height,
            data,
            metadata: FrameMetadata {
                kind: self.kind,
                pixel_size: (
                    recorded_fov.0 / self.width as f64,
                    recorded_fov.1 / self.height as f64,
                ),
                center: (0.0, 0.0),
                z_position: self.focuser.as_ref().map(|f| f.position()),
            },
        }
    }
}

impl Stream for SimStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AcquisitionKind {
        self.kind
    }

    fn fov(&self) -> (f64, f64) {
        self.fov
    }

    fn estimated_pixels(&self) -> u64 {
        self.declared_pixels
    }

    fn exposure_estimate(&self) -> Duration {
        self.exposure
    }

    fn focuser(&self) -> Option<Arc<dyn Focuser>> {
        self.focuser
            .as_ref()
            .map(|f| Arc::clone(f) as Arc<dyn Focuser>)
    }

    fn acquire(&self) -> HwFuture<'_, Result<AcquisitionResult, HardwareError>> {
        Box::pin(async move {
            tokio::time::sleep(self.exposure).await;
            let shot = self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(AcquisitionResult {
                frames: vec![self.render(shot)],
                partial_failure: None,
            })
        })
    }
}

/// Simulated autofocus that settles on a fixed target position.
pub struct SimAutofocus {
    target: f64,
    duration: Duration,
    calls: AtomicUsize,
}

impl SimAutofocus {
    pub fn new(target: f64) -> Self {
        Self {
            target,
            duration: Duration::from_millis(10),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Number of autofocus searches run so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AutofocusRunner for SimAutofocus {
    fn run(
        &self,
        focuser: Arc<dyn Focuser>,
        _good_focus: f64,
        range: (f64, f64),
    ) -> HwFuture<'_, Result<f64, HardwareError>> {
        let target = self.target.clamp(range.0, range.1);
        let duration = self.duration;
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            tokio::time::sleep(duration).await;
            focuser.move_absolute_sync(target).await?;
            debug!("simulated autofocus settled at {:.2} um", target * 1e6);
            Ok(target)
        })
    }

    fn estimate_time(&self) -> Duration {
        self.duration
    }
}

/// Simulated region autofocus: the sample surface is the plane
/// `z = a*x + b*y + c`.
pub struct SimRoiAutofocus {
    plane: (f64, f64, f64),
    per_point: Duration,
}

impl SimRoiAutofocus {
    pub fn new(plane: (f64, f64, f64)) -> Self {
        Self {
            plane,
            per_point: Duration::from_millis(10),
        }
    }
}

impl RoiAutofocus for SimRoiAutofocus {
    fn autofocus_in_roi(
        &self,
        _roi: Rect,
        seeds: Vec<(f64, f64)>,
        focus_range: (f64, f64),
    ) -> HwFuture<'_, Result<Vec<(f64, f64, f64)>, HardwareError>> {
        let (a, b, c) = self.plane;
        let per_point = self.per_point;
        Box::pin(async move {
            tokio::time::sleep(per_point * seeds.len() as u32).await;
            Ok(seeds
                .into_iter()
                .map(|(x, y)| {
                    let z = (a * x + b * y + c).clamp(focus_range.0, focus_range.1);
                    (x, y, z)
                })
                .collect())
        })
    }

    fn estimate_time(&self, n_points: usize) -> Duration {
        self.per_point * n_points as u32
    }
}

/// Position-trusting stitcher: places each tile at its recorded center on a
/// shared canvas and averages overlapping pixels.
pub struct NaiveStitcher {
    fail_registration: bool,
}

impl NaiveStitcher {
    pub fn new() -> Self {
        Self {
            fail_registration: false,
        }
    }

    /// A stitcher whose non-identity registration always fails, to exercise
    /// the identity fallback path.
    pub fn failing_registration() -> Self {
        Self {
            fail_registration: true,
        }
    }
}

impl Default for NaiveStitcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Stitcher for NaiveStitcher {
    fn register(
        &self,
        tiles: &[Vec<Frame>],
        method: RegistrationMethod,
    ) -> Result<Vec<Vec<Frame>>, StitchError> {
        if self.fail_registration && method != RegistrationMethod::Identity {
            return Err(StitchError::RegistrationFailed(
                "simulated registration failure".into(),
            ));
        }
        // Recorded positions are already trusted
        Ok(tiles.to_vec())
    }

    fn weave(&self, tiles: Vec<Frame>, _method: WeavingMethod) -> Result<Frame, StitchError> {
        let first = tiles
            .first()
            .ok_or_else(|| StitchError::WeavingFailed("no tiles to weave".into()))?;
        let pixel_size = first.metadata.pixel_size;

        let mut min_x = f64::INFINITY;
        let mut max_x = f64::NEG_INFINITY;
        let mut min_y = f64::INFINITY;
        let mut max_y = f64::NEG_INFINITY;
        for tile in &tiles {
            let (fw, fh) = tile.fov();
            let (cx, cy) = tile.metadata.center;
            min_x = min_x.min(cx - fw / 2.0);
            max_x = max_x.max(cx + fw / 2.0);
            min_y = min_y.min(cy - fh / 2.0);
            max_y = max_y.max(cy + fh / 2.0);
        }
        let width = (((max_x - min_x) / pixel_size.0).round() as usize).max(1);
        let height = (((max_y - min_y) / pixel_size.1).round() as usize).max(1);

        let mut sum = vec![0u64; width * height];
        let mut count = vec![0u32; width * height];
        for tile in &tiles {
            let (fw, fh) = tile.fov();
            let (cx, cy) = tile.metadata.center;
            let x0 = ((cx - fw / 2.0 - min_x) / pixel_size.0).round() as usize;
            let y0 = ((max_y - (cy + fh / 2.0)) / pixel_size.1).round() as usize;
            for row in 0..tile.height {
                for col in 0..tile.width {
                    let x = x0 + col;
                    let y = y0 + row;
                    if x < width && y < height {
                        let i = y * width + x;
                        sum[i] += tile.data[row * tile.width + col] as u64;
                        count[i] += 1;
                    }
                }
            }
        }
        let data: Vec<u16> = sum
            .iter()
            .zip(count.iter())
            .map(|(&s, &c)| if c == 0 { 0 } else { (s / c as u64) as u16 })
            .collect();

        Ok(Frame {
            width,
            height,
            data,
            metadata: FrameMetadata {
                kind: first.metadata.kind,
                pixel_size,
                center: ((min_x + max_x) / 2.0, (min_y + max_y) / 2.0),
                z_position: None,
            },
        })
    }
}
