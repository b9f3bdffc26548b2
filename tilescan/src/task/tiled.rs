//! The tiled-scan worker: moves, focuses, acquires, dumps and stitches.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nalgebra::Point2;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::estimate::{
    estimate_memory, per_tile_acquisition_estimate, pre_run_estimate, refined_estimate,
    MemoryEstimate, MOVE_SPEED_DEFAULT,
};
use crate::focus::{
    sharpness_score, zstack_levels, FocusSurface, FocusingMethod, FOCUS_FIDELITY,
    FOCUS_RANGE_MARGIN, SAFE_REL_RANGE_DEFAULT, SKIP_TILES,
};
use crate::frame::{max_intensity_projection, sort_stitch_leaders, Frame, ZCube};
use crate::grid::{plan_tile_coverage, sort_zigzag, TileIndex, TilePlan, START_INDEX};
use crate::hw::{
    smallest_fov, AutofocusRunner, Focuser, HardwareError, MoveRequest, Stage, StagePosition,
    Stream,
};
use crate::stitch::{RegistrationMethod, RegistrationOutcome, StitchError, Stitcher};

use super::config::{ConfigError, TiledScanConfig};
use super::state::{lock, with_cancel, RunState, SharedRunState, TaskState};

/// Generous deadline for the move to the first tile: the stage may start
/// anywhere, including parked at the far end of its travel.
pub const FIRST_MOVE_TIMEOUT: Duration = Duration::from_secs(600);

/// Later moves get five times the expected travel time plus fixed slack.
const MOVE_TIMEOUT_FACTOR: f64 = 5.0;
const MOVE_TIMEOUT_SLACK: Duration = Duration::from_secs(3);

/// Tolerated relative deviation between the estimated stream FoV used for
/// planning and the FoV actually recorded on the first tile.
const FOV_TOLERANCE: f64 = 0.01;

/// How a single stage move ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The stage reached the target within the deadline.
    Completed,
    /// The stage did not confirm in time; the move was stopped and the tile
    /// acquired wherever the stage ended up. The overlap margin usually
    /// still lets the stitcher recover.
    TimedOutBestEffort,
}

/// Errors that end a running scan.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("acquisition cancelled")]
    Cancelled,

    #[error("acquisition of tile {tile} failed on stream {stream}: {source}")]
    TileAcquisitionFailed {
        tile: TileIndex,
        stream: String,
        source: HardwareError,
    },

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error(transparent)]
    Stitch(#[from] StitchError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Admission error: the scan was never started.
#[derive(Debug, Error)]
pub enum ScanStartError {
    #[error("estimated memory use of {needed} bytes exceeds the {total} bytes available")]
    InsufficientMemory { needed: u64, total: u64 },
}

/// Everything a completed scan hands back.
#[derive(Debug)]
pub struct ScanOutput {
    /// One stitched frame per surviving stream, leader first.
    pub stitched: Vec<Frame>,
    /// Whether registration ran as requested or fell back to recorded
    /// stage positions.
    pub registration: RegistrationOutcome,
    /// Tiles whose stage move timed out and were acquired best-effort.
    pub degraded_moves: Vec<TileIndex>,
}

/// A fully planned scan, ready to start.
///
/// Construction validates the configuration and plans the grid without
/// touching any hardware, so it doubles as the entry point for pure
/// estimation.
pub struct TiledScanTask {
    config: TiledScanConfig,
    plan: TilePlan,
    order: Vec<TileIndex>,
    fov: (f64, f64),
    stage: Arc<dyn Stage>,
    streams: Vec<Arc<dyn Stream>>,
    stitcher: Arc<dyn Stitcher>,
    autofocus: Option<Arc<dyn AutofocusRunner>>,
    focus_surface: Option<FocusSurface>,
}

impl std::fmt::Debug for TiledScanTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiledScanTask")
            .field("config", &self.config)
            .field("plan", &self.plan)
            .field("order", &self.order)
            .field("fov", &self.fov)
            .finish_non_exhaustive()
    }
}

impl TiledScanTask {
    pub fn new(
        config: TiledScanConfig,
        stage: Arc<dyn Stage>,
        streams: Vec<Arc<dyn Stream>>,
        stitcher: Arc<dyn Stitcher>,
        autofocus: Option<Arc<dyn AutofocusRunner>>,
    ) -> Result<Self, ConfigError> {
        if streams.is_empty() {
            return Err(ConfigError::NoStreams);
        }

        match config.focusing_method {
            FocusingMethod::MaxIntensityProjection => {
                if config.zlevels.len() < 2 {
                    return Err(ConfigError::MipRequiresZLevels);
                }
            }
            method => {
                if config.zlevels.len() > 1 {
                    return Err(ConfigError::UnsupportedConfiguration);
                }
                let needs_runner = matches!(
                    method,
                    FocusingMethod::Always | FocusingMethod::OnLowFocusLevel
                );
                if needs_runner && autofocus.is_none() {
                    return Err(ConfigError::AutofocusUnavailable);
                }
            }
        }

        if let Some(path) = &config.dump_path {
            if path.file_name().is_none() {
                return Err(ConfigError::DumpPathMissingFilename(path.clone()));
            }
        }

        let polygon = config.region.to_polygon()?;
        let fov = smallest_fov(&streams).ok_or(ConfigError::NoStreams)?;
        let plan = plan_tile_coverage(&polygon, fov, config.overlap)?;
        let mut order = plan.tiles.clone();
        sort_zigzag(&mut order);

        let focus_surface = if config.focus_points.is_empty() {
            None
        } else {
            Some(FocusSurface::new(&config.focus_points)?)
        };

        info!(
            "planned scan: {} tiles in a {}x{} grid, {} streams, focusing {:?}",
            order.len(),
            plan.cols,
            plan.rows,
            streams.len(),
            config.focusing_method
        );

        Ok(Self {
            config,
            plan,
            order,
            fov,
            stage,
            streams,
            stitcher,
            autofocus,
            focus_surface,
        })
    }

    pub fn plan(&self) -> &TilePlan {
        &self.plan
    }

    /// Tiles in the order the stage will visit them.
    pub fn order(&self) -> &[TileIndex] {
        &self.order
    }

    /// Physical center of a planned tile.
    pub fn tile_center(&self, tile: TileIndex) -> Point2<f64> {
        Point2::new(
            self.plan.starting_position.x + tile.col as f64 * self.plan.reliable_fov.0,
            self.plan.starting_position.y - tile.row as f64 * self.plan.reliable_fov.1,
        )
    }

    /// A-priori estimate of the full scan duration.
    pub fn estimated_duration(&self) -> Duration {
        let per_tile = per_tile_acquisition_estimate(&self.streams, self.config.zlevels.len());
        let max_pixels = self
            .streams
            .iter()
            .map(|s| s.estimated_pixels())
            .max()
            .unwrap_or(0);
        let speed = self.stage.speed().unwrap_or(MOVE_SPEED_DEFAULT);
        pre_run_estimate(
            per_tile,
            self.order.len(),
            self.order.len(),
            self.plan.reliable_fov,
            self.config.overlap,
            speed,
            max_pixels,
        )
    }

    /// Estimated memory use against the given total system memory.
    pub fn memory_estimate(&self, total_memory: u64) -> MemoryEstimate {
        estimate_memory(&self.streams, self.order.len(), total_memory)
    }

    /// Spawns the worker and returns the control handle.
    pub fn start(self) -> ScanHandle {
        let (shared, state_rx) = RunState::new_shared();
        let (end_tx, end_rx) = watch::channel(Instant::now() + self.estimated_duration());

        let worker_shared = shared.clone();
        let join = tokio::spawn(async move {
            let pitch = self.plan.reliable_fov;
            let worker = ScanWorker {
                task: self,
                shared: worker_shared,
                end_tx,
                pitch,
                timing: TimingLedger::default(),
                degraded_moves: Vec::new(),
                good_focus: None,
                baseline_sharpness: None,
                dump_jobs: Vec::new(),
            };
            worker.run().await
        });

        ScanHandle {
            shared,
            state_rx,
            end_rx,
            join,
        }
    }
}

/// Starts a scan with memory admission: scans estimated not to fit in
/// memory are refused instead of thrashing mid-acquisition.
pub fn start_tiled_scan(task: TiledScanTask) -> Result<ScanHandle, ScanStartError> {
    let total = crate::system::total_memory();
    let estimate = task.memory_estimate(total);
    if !estimate.sufficient {
        return Err(ScanStartError::InsufficientMemory {
            needed: estimate.bytes,
            total,
        });
    }
    Ok(task.start())
}

/// Control handle for a running scan.
pub struct ScanHandle {
    shared: SharedRunState,
    state_rx: watch::Receiver<TaskState>,
    end_rx: watch::Receiver<Instant>,
    join: JoinHandle<Result<ScanOutput, ScanError>>,
}

impl ScanHandle {
    pub fn state(&self) -> TaskState {
        *self.state_rx.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn state_changes(&self) -> watch::Receiver<TaskState> {
        self.state_rx.clone()
    }

    /// Latest estimate of when the scan will be done. Refined after every
    /// tile from the measured per-tile average.
    pub fn estimated_end(&self) -> Instant {
        *self.end_rx.borrow()
    }

    pub fn estimated_end_changes(&self) -> watch::Receiver<Instant> {
        self.end_rx.clone()
    }

    /// Requests cancellation. Returns true exactly once, when this call
    /// performed the transition; false if the scan already ended.
    pub fn cancel(&self) -> bool {
        lock(&self.shared).request_cancel()
    }

    /// A detached canceller, so another owner can cancel the scan while
    /// someone else awaits [`ScanHandle::wait`].
    pub fn canceller(&self) -> ScanCanceller {
        ScanCanceller {
            shared: self.shared.clone(),
        }
    }

    /// Waits for the worker and returns its result.
    pub async fn wait(self) -> Result<ScanOutput, ScanError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(ScanError::Internal(format!("scan worker panicked: {e}"))),
        }
    }
}

/// Cloneable cancellation-only view of a scan.
#[derive(Clone)]
pub struct ScanCanceller {
    shared: SharedRunState,
}

impl ScanCanceller {
    pub fn cancel(&self) -> bool {
        lock(&self.shared).request_cancel()
    }
}

/// Wall-time spent per phase, for the post-run summary.
#[derive(Default)]
struct TimingLedger {
    moves: Vec<Duration>,
    acquisitions: Vec<Duration>,
    saves: Vec<Duration>,
    stitches: Vec<Duration>,
}

fn mean(samples: &[Duration]) -> Duration {
    if samples.is_empty() {
        return Duration::ZERO;
    }
    samples.iter().sum::<Duration>() / samples.len() as u32
}

struct ScanWorker {
    task: TiledScanTask,
    shared: SharedRunState,
    end_tx: watch::Sender<Instant>,
    /// Tile pitch in use; replaced by the first tile's recorded FoV.
    pitch: (f64, f64),
    timing: TimingLedger,
    degraded_moves: Vec<TileIndex>,
    good_focus: Option<f64>,
    baseline_sharpness: Option<f64>,
    dump_jobs: Vec<JoinHandle<()>>,
}

impl ScanWorker {
    async fn run(mut self) -> Result<ScanOutput, ScanError> {
        if !lock(&self.shared).start_running() {
            // Cancelled before the worker got scheduled
            return Err(ScanError::Cancelled);
        }

        let started = Instant::now();
        let result = self.acquire_and_stitch(started).await;
        self.log_timing_summary(started.elapsed());

        // Cancelled stays cancelled; everything else ends in Finished
        lock(&self.shared).finish();
        result
    }

    async fn acquire_and_stitch(&mut self, started: Instant) -> Result<ScanOutput, ScanError> {
        let order = self.task.order.clone();
        let total = order.len();
        let mut tiles: Vec<Vec<Frame>> = Vec::with_capacity(total);
        let mut prev = START_INDEX;

        for (i, &tile) in order.iter().enumerate() {
            if lock(&self.shared).is_cancelled() {
                return Err(ScanError::Cancelled);
            }

            let t0 = Instant::now();
            let outcome = self.move_to_tile(prev, tile, i == 0).await?;
            if outcome == MoveOutcome::TimedOutBestEffort {
                self.degraded_moves.push(tile);
            }
            self.timing.moves.push(t0.elapsed());

            let t0 = Instant::now();
            if self.task.config.focusing_method == FocusingMethod::Always {
                match self.run_autofocus(tile).await {
                    Ok(()) => {}
                    Err(ScanError::Cancelled) => return Err(ScanError::Cancelled),
                    Err(e) => warn!("autofocus failed on tile {}: {}", tile, e),
                }
            }
            let mut frames = self.acquire_tile(tile).await?;
            if self.task.config.focusing_method == FocusingMethod::OnLowFocusLevel {
                frames = self.refocus_if_degraded(frames, i, tile).await?;
            }
            self.timing.acquisitions.push(t0.elapsed());

            if i == 0 {
                self.update_fov(&frames);
            }
            self.dump_tile(tile, &frames);
            tiles.push(frames);
            prev = tile;
            self.publish_estimate(started, i + 1, total);
        }

        self.wait_for_dumps().await;
        self.stitch(tiles)
    }

    /// Physical center of a tile, spaced by the corrected pitch.
    fn tile_center(&self, tile: TileIndex) -> Point2<f64> {
        Point2::new(
            self.task.plan.starting_position.x + tile.col as f64 * self.pitch.0,
            self.task.plan.starting_position.y - tile.row as f64 * self.pitch.1,
        )
    }

    /// Moves the stage to the tile's center, only commanding the axes whose
    /// grid coordinate changed. Timeouts degrade rather than fail.
    async fn move_to_tile(
        &mut self,
        prev: TileIndex,
        tile: TileIndex,
        first: bool,
    ) -> Result<MoveOutcome, ScanError> {
        let target = self.tile_center(tile);
        let request = MoveRequest {
            x: (tile.col != prev.col).then_some(target.x),
            y: (tile.row != prev.row).then_some(target.y),
        };
        if request.is_empty() {
            return Ok(MoveOutcome::Completed);
        }

        let current = self.task.stage.position();
        let travel = ((target.x - current.x).powi(2) + (target.y - current.y).powi(2)).sqrt();
        let speed = self.task.stage.speed().unwrap_or(MOVE_SPEED_DEFAULT);
        let deadline = if first {
            FIRST_MOVE_TIMEOUT
        } else {
            Duration::from_secs_f64(MOVE_TIMEOUT_FACTOR * travel / speed)
                + MOVE_TIMEOUT_SLACK
        };

        let handle = self.task.stage.move_absolute(request);
        // Keep a token so the move can still be stopped after wait()
        // consumed the handle.
        let move_token = handle.cancel_token();
        let sub = lock(&self.shared).register_sub();

        tokio::select! {
            _ = sub.cancelled() => {
                move_token.cancel();
                Err(ScanError::Cancelled)
            }
            res = tokio::time::timeout(deadline, handle.wait()) => match res {
                Ok(Ok(())) => Ok(MoveOutcome::Completed),
                Ok(Err(HardwareError::Cancelled)) => Err(ScanError::Cancelled),
                Ok(Err(e)) => Err(ScanError::Hardware(e)),
                Err(_) => {
                    move_token.cancel();
                    warn!(
                        "move to tile {} did not finish within {:.0?}, acquiring in place",
                        tile, deadline
                    );
                    Ok(MoveOutcome::TimedOutBestEffort)
                }
            }
        }
    }

    /// Runs `fut` under task cancellation and maps hardware errors.
    async fn checked<T>(
        &self,
        stream: &str,
        tile: TileIndex,
        fut: impl std::future::Future<Output = Result<T, HardwareError>>,
    ) -> Result<T, ScanError> {
        match with_cancel(&self.shared, fut).await {
            None => Err(ScanError::Cancelled),
            Some(Ok(value)) => Ok(value),
            Some(Err(HardwareError::Cancelled)) => Err(ScanError::Cancelled),
            Some(Err(source)) => Err(ScanError::TileAcquisitionFailed {
                tile,
                stream: stream.to_string(),
                source,
            }),
        }
    }

    /// Acquires every stream at the tile, z-stacking streams with a focuser
    /// when the method asks for a maximum-intensity projection.
    async fn acquire_tile(&mut self, tile: TileIndex) -> Result<Vec<Frame>, ScanError> {
        let center = self.tile_center(tile);
        // Focus is predicted where the stage actually is: after a timed-out
        // move the planned center can be off by a whole tile.
        let position = self.task.stage.position();
        let streams = self.task.streams.clone();
        let mip = self.task.config.focusing_method == FocusingMethod::MaxIntensityProjection;

        let mut frames = Vec::new();
        let mut cube_index = 0;
        for stream in &streams {
            let mut acquired = match stream.focuser() {
                Some(focuser) if mip => {
                    let stack = self
                        .acquire_zstack(stream, &focuser, tile, position, cube_index)
                        .await?;
                    cube_index += 1;
                    stack
                }
                Some(focuser) => {
                    if let Some(surface) = &self.task.focus_surface {
                        let range = focuser.allowed_range();
                        let z = surface.z_at(position.x, position.y).clamp(range.0, range.1);
                        self.checked(stream.name(), tile, focuser.move_absolute_sync(z))
                            .await?;
                    }
                    self.acquire_single(stream, tile).await?
                }
                None => self.acquire_single(stream, tile).await?,
            };
            // The commanded center is authoritative for stitching
            for frame in &mut acquired {
                frame.metadata.center = (center.x, center.y);
            }
            frames.extend(acquired);
        }
        Ok(frames)
    }

    async fn acquire_single(
        &self,
        stream: &Arc<dyn Stream>,
        tile: TileIndex,
    ) -> Result<Vec<Frame>, ScanError> {
        let result = self.checked(stream.name(), tile, stream.acquire()).await?;
        if let Some(reason) = &result.partial_failure {
            warn!(
                "stream {} delivered partial data on tile {}: {}",
                stream.name(),
                tile,
                reason
            );
        }
        Ok(result.frames)
    }

    /// Acquires one frame per z-level and collapses the stack into a single
    /// maximum-intensity projection.
    async fn acquire_zstack(
        &mut self,
        stream: &Arc<dyn Stream>,
        focuser: &Arc<dyn Focuser>,
        tile: TileIndex,
        position: StagePosition,
        cube_index: usize,
    ) -> Result<Vec<Frame>, ScanError> {
        let focus_value = match (&self.task.focus_surface, self.good_focus) {
            (Some(surface), _) => surface.z_at(position.x, position.y),
            (None, Some(z)) => z,
            (None, None) => focuser.position(),
        };
        let levels = zstack_levels(
            focus_value,
            &self.task.config.zlevels,
            focuser.allowed_range(),
        );

        let mut stack = Vec::with_capacity(levels.len());
        for &z in &levels {
            self.checked(stream.name(), tile, focuser.move_absolute_sync(z))
                .await?;
            let result = self.checked(stream.name(), tile, stream.acquire()).await?;
            if let Some(reason) = &result.partial_failure {
                warn!(
                    "stream {} delivered partial data on tile {}: {}",
                    stream.name(),
                    tile,
                    reason
                );
            }
            let mut frame = result.frames.into_iter().next().ok_or_else(|| {
                ScanError::TileAcquisitionFailed {
                    tile,
                    stream: stream.name().to_string(),
                    source: HardwareError::AcquisitionFailed("no frames delivered".into()),
                }
            })?;
            frame.metadata.z_position = Some(z);
            stack.push(frame);
        }

        let cube = ZCube::new(stack, levels).map_err(|e| ScanError::Internal(e.to_string()))?;
        self.dump_cube(tile, &cube, cube_index);
        Ok(vec![max_intensity_projection(&cube)])
    }

    /// Measures the focus stream's sharpness on a fixed cadence and, when
    /// it has degraded past the allowed fidelity, refocuses and reacquires.
    async fn refocus_if_degraded(
        &mut self,
        frames: Vec<Frame>,
        index: usize,
        tile: TileIndex,
    ) -> Result<Vec<Frame>, ScanError> {
        if index % SKIP_TILES != 0 {
            return Ok(frames);
        }
        // Sharpness is judged on the stream the autofocuser drives, not on
        // whichever frame happens to come first.
        let Some(focus_kind) = self
            .task
            .streams
            .iter()
            .find(|s| s.focuser().is_some())
            .map(|s| s.kind())
        else {
            return Ok(frames);
        };
        let Some(target) = frames.iter().find(|f| f.metadata.kind == focus_kind) else {
            return Ok(frames);
        };
        let score = sharpness_score(target);

        let Some(baseline) = self.baseline_sharpness else {
            // The operator focused the first tile; it sets the bar
            self.baseline_sharpness = Some(score);
            return Ok(frames);
        };
        // Keep the tile while the degradation from the baseline stays under
        // the fidelity ratio. A degenerate (zero) baseline carries no
        // information and also warrants a refocus attempt.
        if baseline > 0.0 && (baseline - score) / baseline < FOCUS_FIDELITY {
            return Ok(frames);
        }

        warn!(
            "tile {}: sharpness {:.3e} degraded more than {:.0}% from baseline {:.3e}, refocusing",
            tile,
            score,
            FOCUS_FIDELITY * 100.0,
            baseline
        );
        match self.run_autofocus(tile).await {
            Ok(()) => {
                let frames = self.acquire_tile(tile).await?;
                // The refocused tile sets the new bar for later checks
                if let Some(target) = frames.iter().find(|f| f.metadata.kind == focus_kind) {
                    self.baseline_sharpness = Some(sharpness_score(target));
                }
                Ok(frames)
            }
            Err(ScanError::Cancelled) => Err(ScanError::Cancelled),
            Err(e) => {
                // A failed refocus is not worth losing the whole scan over
                warn!("autofocus failed ({}), keeping the degraded tile", e);
                Ok(frames)
            }
        }
    }

    async fn run_autofocus(&mut self, tile: TileIndex) -> Result<(), ScanError> {
        let Some(runner) = self.task.autofocus.clone() else {
            return Ok(());
        };
        let Some(focuser) = self.task.streams.iter().find_map(|s| s.focuser()) else {
            return Ok(());
        };

        let allowed = focuser.allowed_range();
        let (seed, range) = match self.good_focus {
            Some(z) => (
                z,
                (z - FOCUS_RANGE_MARGIN / 2.0, z + FOCUS_RANGE_MARGIN / 2.0),
            ),
            None => {
                let position = focuser.position();
                (
                    position,
                    (
                        position + SAFE_REL_RANGE_DEFAULT.0,
                        position + SAFE_REL_RANGE_DEFAULT.1,
                    ),
                )
            }
        };
        let range = (range.0.max(allowed.0), range.1.min(allowed.1));

        let found = self
            .checked("autofocus", tile, runner.run(focuser, seed, range))
            .await?;
        debug!("tile {}: autofocus settled at {:.2} um", tile, found * 1e6);
        self.good_focus = Some(found);
        Ok(())
    }

    /// Replaces the planned tile pitch with one derived from the FoV
    /// recorded on the first tile. The grid was planned from a settings
    /// estimate; every later tile is spaced by the recorded value so the
    /// configured overlap actually holds.
    fn update_fov(&mut self, frames: &[Frame]) {
        let Some(measured) = frames
            .iter()
            .map(|f| f.fov())
            .reduce(|a, b| (a.0.min(b.0), a.1.min(b.1)))
        else {
            return;
        };
        let expected = self.task.fov;
        if (measured.0 - expected.0).abs() > expected.0 * FOV_TOLERANCE
            || (measured.1 - expected.1).abs() > expected.1 * FOV_TOLERANCE
        {
            warn!(
                "measured FoV {:.1}x{:.1} um differs from the {:.1}x{:.1} um used for \
                 planning; correcting the tile pitch",
                measured.0 * 1e6,
                measured.1 * 1e6,
                expected.0 * 1e6,
                expected.1 * 1e6
            );
        }
        let overlap = self.task.config.overlap;
        self.pitch = (measured.0 * (1.0 - overlap), measured.1 * (1.0 - overlap));
    }

    /// Queues a raw dump of the tile's frames without blocking acquisition.
    fn dump_tile(&mut self, tile: TileIndex, frames: &[Frame]) {
        let Some(base) = &self.task.config.dump_path else {
            return;
        };
        let target = dump_file_name(base, tile, None);
        let data = pack_frames(frames);
        self.dump_jobs.push(tokio::task::spawn_blocking(move || {
            if let Err(e) = std::fs::write(&target, &data) {
                warn!("failed to dump tile to {}: {}", target.display(), e);
            }
        }));
    }

    /// Queues a raw dump of one stream's full z-stack before it is
    /// collapsed by the projection.
    fn dump_cube(&mut self, tile: TileIndex, cube: &ZCube, cube_index: usize) {
        let Some(base) = &self.task.config.dump_path else {
            return;
        };
        let target = dump_file_name(base, tile, Some(cube_index));
        let data = pack_frames(&cube.frames);
        self.dump_jobs.push(tokio::task::spawn_blocking(move || {
            if let Err(e) = std::fs::write(&target, &data) {
                warn!("failed to dump z-stack to {}: {}", target.display(), e);
            }
        }));
    }

    async fn wait_for_dumps(&mut self) {
        if self.dump_jobs.is_empty() {
            return;
        }
        let t0 = Instant::now();
        for job in self.dump_jobs.drain(..) {
            if job.await.is_err() {
                warn!("tile dump task panicked");
            }
        }
        self.timing.saves.push(t0.elapsed());
    }

    fn stitch(&mut self, tiles: Vec<Vec<Frame>>) -> Result<ScanOutput, ScanError> {
        let t0 = Instant::now();
        let tiles: Vec<Vec<Frame>> = tiles.into_iter().map(sort_stitch_leaders).collect();

        let method = self.task.config.registration;
        let (registered, registration) = match self.task.stitcher.register(&tiles, method) {
            Ok(registered) => (registered, RegistrationOutcome::Registered),
            Err(e) if method != RegistrationMethod::Identity => {
                warn!(
                    "registration failed ({}), falling back to the recorded stage positions",
                    e
                );
                let registered = self
                    .task
                    .stitcher
                    .register(&tiles, RegistrationMethod::Identity)?;
                (
                    registered,
                    RegistrationOutcome::IdentityFallback {
                        reason: e.to_string(),
                    },
                )
            }
            Err(e) => return Err(e.into()),
        };

        let stream_count = registered.iter().map(|t| t.len()).min().unwrap_or(0);
        let mut stitched = Vec::with_capacity(stream_count);
        for s in 0..stream_count {
            let column: Vec<Frame> = registered.iter().map(|t| t[s].clone()).collect();
            stitched.push(
                self.task
                    .stitcher
                    .weave(column, self.task.config.weaving)?,
            );
        }
        self.timing.stitches.push(t0.elapsed());

        Ok(ScanOutput {
            stitched,
            registration,
            degraded_moves: std::mem::take(&mut self.degraded_moves),
        })
    }

    fn publish_estimate(&self, started: Instant, done: usize, total: usize) {
        if done == 0 || done > total {
            return;
        }
        let average = started.elapsed() / done as u32;
        let remaining = refined_estimate(average, total - done);
        let _ = self.end_tx.send(Instant::now() + remaining);
    }

    fn log_timing_summary(&self, total: Duration) {
        info!(
            "scan over {} tiles took {:.1}s (mean per phase: move {:.2?}, acquire {:.2?}, \
             save {:.2?}, stitch {:.2?})",
            self.timing.moves.len(),
            total.as_secs_f64(),
            mean(&self.timing.moves),
            mean(&self.timing.acquisitions),
            mean(&self.timing.saves),
            mean(&self.timing.stitches),
        );
    }
}

/// File name for a tile dump: `<stem>-<col:05>x<row:05><ext>`, with an extra
/// `cube<idx>-` infix for a stream's z-stack.
fn dump_file_name(base: &Path, tile: TileIndex, cube_index: Option<usize>) -> PathBuf {
    let stem = base
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("tile");
    let extension = base
        .extension()
        .and_then(|s| s.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    let name = match cube_index {
        None => format!("{stem}-{:05}x{:05}{extension}", tile.col, tile.row),
        Some(index) => format!(
            "{stem}-cube{index}-{:05}x{:05}{extension}",
            tile.col, tile.row
        ),
    };
    base.with_file_name(name)
}

/// Little-endian 16-bit raw pixel data, frames concatenated in order.
fn pack_frames(frames: &[Frame]) -> Vec<u8> {
    let mut out = Vec::with_capacity(frames.iter().map(|f| f.data.len() * 2).sum());
    for frame in frames {
        for pixel in &frame.data {
            out.extend_from_slice(&pixel.to_le_bytes());
        }
    }
    out
}
