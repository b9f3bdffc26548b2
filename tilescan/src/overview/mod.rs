//! Multi-area overview acquisition.
//!
//! Runs a sequence of tiled scans, one per selected area, optionally
//! preceding each scan with a region-autofocus pass that maps the sample's
//! focus surface before any tile is acquired. Areas are scanned
//! sequentially; a failure aborts the remaining areas, while cancellation
//! is forwarded into whatever the orchestrator is currently doing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::focus::MAX_DISTANCE_FOCUS_POINTS;
use crate::geometry::Rect;
use crate::hw::{AutofocusRunner, HardwareError, RoiAutofocus, Stage, Stream};
use crate::stitch::Stitcher;
use crate::task::{
    lock, start_tiled_scan, with_cancel, ConfigError, RunState, ScanError, ScanOutput,
    ScanStartError, SharedRunState, TaskState, TiledScanConfig, TiledScanTask,
};

/// Extra slack granted to a region-autofocus pass on top of three times its
/// own estimate before it is abandoned.
const AUTOFOCUS_TIMEOUT_SLACK: Duration = Duration::from_secs(1);

/// Errors that end an overview acquisition.
#[derive(Debug, Error)]
pub enum OverviewError {
    #[error("overview acquisition cancelled")]
    Cancelled,

    #[error("area {area} failed: {source}")]
    Scan { area: usize, source: ScanError },

    #[error("area {area} configuration invalid: {source}")]
    Config { area: usize, source: ConfigError },

    #[error("area {area} refused: {source}")]
    Admission {
        area: usize,
        source: ScanStartError,
    },
}

/// A planned overview over several areas, sharing one hardware rig.
pub struct OverviewTask {
    areas: Vec<TiledScanConfig>,
    area_estimates: Vec<Duration>,
    stage: Arc<dyn Stage>,
    streams: Vec<Arc<dyn Stream>>,
    stitcher: Arc<dyn Stitcher>,
    autofocus: Option<Arc<dyn AutofocusRunner>>,
    roi_autofocus: Option<Arc<dyn RoiAutofocus>>,
}

impl std::fmt::Debug for OverviewTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverviewTask")
            .field("areas", &self.areas.len())
            .field("area_estimates", &self.area_estimates)
            .finish_non_exhaustive()
    }
}

impl OverviewTask {
    /// Validates every area configuration up front, so a typo in area five
    /// surfaces before area one starts moving the stage.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        areas: Vec<TiledScanConfig>,
        stage: Arc<dyn Stage>,
        streams: Vec<Arc<dyn Stream>>,
        stitcher: Arc<dyn Stitcher>,
        autofocus: Option<Arc<dyn AutofocusRunner>>,
        roi_autofocus: Option<Arc<dyn RoiAutofocus>>,
    ) -> Result<Self, OverviewError> {
        if areas.is_empty() {
            return Err(OverviewError::Config {
                area: 0,
                source: ConfigError::NoAreas,
            });
        }

        let mut area_estimates = Vec::with_capacity(areas.len());
        for (i, config) in areas.iter().enumerate() {
            let dry_run = TiledScanTask::new(
                config.clone(),
                stage.clone(),
                streams.clone(),
                stitcher.clone(),
                autofocus.clone(),
            )
            .map_err(|source| OverviewError::Config { area: i, source })?;
            area_estimates.push(dry_run.estimated_duration());
        }

        Ok(Self {
            areas,
            area_estimates,
            stage,
            streams,
            stitcher,
            autofocus,
            roi_autofocus,
        })
    }

    /// Total a-priori duration over all areas.
    pub fn estimated_duration(&self) -> Duration {
        self.area_estimates.iter().sum()
    }

    /// Spawns the orchestrator and returns its control handle.
    pub fn start(self) -> OverviewHandle {
        let (shared, state_rx) = RunState::new_shared();
        let (end_tx, end_rx) = watch::channel(Instant::now() + self.estimated_duration());

        let worker_shared = shared.clone();
        let join = tokio::spawn(async move {
            let worker = OverviewWorker {
                task: self,
                shared: worker_shared,
                end_tx: Arc::new(end_tx),
            };
            worker.run().await
        });

        OverviewHandle {
            shared,
            state_rx,
            end_rx,
            join,
        }
    }
}

/// Control handle for a running overview acquisition.
pub struct OverviewHandle {
    shared: SharedRunState,
    state_rx: watch::Receiver<TaskState>,
    end_rx: watch::Receiver<Instant>,
    join: JoinHandle<Result<Vec<ScanOutput>, OverviewError>>,
}

impl OverviewHandle {
    pub fn state(&self) -> TaskState {
        *self.state_rx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<TaskState> {
        self.state_rx.clone()
    }

    /// Estimated end of the whole overview, combining the running scan's
    /// live estimate with the a-priori estimates of the areas still queued.
    pub fn estimated_end(&self) -> Instant {
        *self.end_rx.borrow()
    }

    /// Requests cancellation of the whole overview, including whatever scan
    /// or autofocus pass is currently in flight.
    pub fn cancel(&self) -> bool {
        lock(&self.shared).request_cancel()
    }

    pub async fn wait(self) -> Result<Vec<ScanOutput>, OverviewError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(OverviewError::Scan {
                area: 0,
                source: ScanError::Internal(format!("overview worker panicked: {e}")),
            }),
        }
    }
}

struct OverviewWorker {
    task: OverviewTask,
    shared: SharedRunState,
    end_tx: Arc<watch::Sender<Instant>>,
}

impl OverviewWorker {
    async fn run(self) -> Result<Vec<ScanOutput>, OverviewError> {
        if !lock(&self.shared).start_running() {
            return Err(OverviewError::Cancelled);
        }

        let result = self.acquire_areas().await;
        lock(&self.shared).finish();
        result
    }

    async fn acquire_areas(&self) -> Result<Vec<ScanOutput>, OverviewError> {
        let total = self.task.areas.len();
        let mut outputs = Vec::with_capacity(total);

        for (i, config) in self.task.areas.iter().enumerate() {
            if lock(&self.shared).is_cancelled() {
                return Err(OverviewError::Cancelled);
            }
            info!("overview: starting area {} of {}", i + 1, total);

            let mut config = config.clone();
            if config.focus_points.is_empty() {
                self.map_focus_surface(i, &mut config).await?;
            }

            let scan = TiledScanTask::new(
                config,
                self.task.stage.clone(),
                self.task.streams.clone(),
                self.task.stitcher.clone(),
                self.task.autofocus.clone(),
            )
            .map_err(|source| OverviewError::Config { area: i, source })?;

            // A-priori time still queued behind the running area
            let tail: Duration = self.task.area_estimates[i + 1..].iter().sum();
            let handle =
                start_tiled_scan(scan).map_err(|source| OverviewError::Admission {
                    area: i,
                    source,
                })?;

            // Forward our cancellation into the running scan
            let sub = lock(&self.shared).register_sub();
            let canceller = handle.canceller();
            let cancel_forwarder = tokio::spawn(async move {
                sub.cancelled().await;
                canceller.cancel();
            });

            // Forward the scan's live end estimate, shifted by the queue
            let mut scan_end_rx = handle.estimated_end_changes();
            let end_tx = Arc::clone(&self.end_tx);
            let estimate_forwarder = tokio::spawn(async move {
                loop {
                    let scan_end = *scan_end_rx.borrow_and_update();
                    let _ = end_tx.send(scan_end + tail);
                    if scan_end_rx.changed().await.is_err() {
                        break;
                    }
                }
            });

            let result = handle.wait().await;
            cancel_forwarder.abort();
            estimate_forwarder.abort();

            match result {
                Ok(output) => outputs.push(output),
                Err(ScanError::Cancelled) => return Err(OverviewError::Cancelled),
                Err(source) => return Err(OverviewError::Scan { area: i, source }),
            }
        }

        Ok(outputs)
    }

    /// Runs the region autofocus over the area and injects the measured
    /// good-focus points. Failures degrade to an unmapped scan; only
    /// cancellation aborts.
    async fn map_focus_surface(
        &self,
        area: usize,
        config: &mut TiledScanConfig,
    ) -> Result<(), OverviewError> {
        let Some(roi_autofocus) = &self.task.roi_autofocus else {
            return Ok(());
        };
        let Some(focuser) = self.task.streams.iter().find_map(|s| s.focuser()) else {
            debug!("no focuser in any stream, skipping region autofocus");
            return Ok(());
        };

        let polygon = config
            .region
            .to_polygon()
            .map_err(|e| OverviewError::Config {
                area,
                source: e.into(),
            })?;
        let bounds = polygon.bounds();
        let seeds = generate_focus_seeds(&bounds, MAX_DISTANCE_FOCUS_POINTS);
        let deadline = roi_autofocus.estimate_time(seeds.len()) * 3 + AUTOFOCUS_TIMEOUT_SLACK;
        debug!(
            "area {}: focusing {} seed positions (deadline {:.0?})",
            area,
            seeds.len(),
            deadline
        );

        let pass = tokio::time::timeout(
            deadline,
            roi_autofocus.autofocus_in_roi(bounds, seeds, focuser.allowed_range()),
        );
        match with_cancel(&self.shared, pass).await {
            None => Err(OverviewError::Cancelled),
            Some(Ok(Ok(points))) if points.len() == 2 => {
                // Two points define neither a constant focus nor a surface
                warn!("area {}: only 2 focus points found, ignoring them", area);
                Ok(())
            }
            Some(Ok(Ok(points))) => {
                info!("area {}: mapped {} good-focus points", area, points.len());
                config.focus_points = points;
                Ok(())
            }
            Some(Ok(Err(HardwareError::Cancelled))) => Err(OverviewError::Cancelled),
            Some(Ok(Err(e))) => {
                warn!(
                    "area {}: region autofocus failed ({}), scanning without a focus map",
                    area, e
                );
                Ok(())
            }
            Some(Err(_elapsed)) => {
                warn!(
                    "area {}: region autofocus exceeded {:.0?}, scanning without a focus map",
                    area, deadline
                );
                Ok(())
            }
        }
    }
}

/// Seed positions for a region-autofocus pass: a uniform grid over the
/// bounding box with at most `spacing` between neighbours, each seed at its
/// cell's center.
pub fn generate_focus_seeds(bounds: &Rect, spacing: f64) -> Vec<(f64, f64)> {
    let nx = ((bounds.width() / spacing).ceil() as usize).max(1);
    let ny = ((bounds.height() / spacing).ceil() as usize).max(1);
    let step_x = bounds.width() / nx as f64;
    let step_y = bounds.height() / ny as f64;

    let mut seeds = Vec::with_capacity(nx * ny);
    for row in 0..ny {
        for col in 0..nx {
            seeds.push((
                bounds.min.x + (col as f64 + 0.5) * step_x,
                bounds.min.y + (row as f64 + 0.5) * step_y,
            ));
        }
    }
    seeds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeds_cover_small_region_with_one_point() {
        let bounds = Rect::new(0.0, 0.0, 100e-6, 100e-6);
        let seeds = generate_focus_seeds(&bounds, MAX_DISTANCE_FOCUS_POINTS);
        assert_eq!(seeds, vec![(50e-6, 50e-6)]);
    }

    #[test]
    fn test_seeds_respect_max_spacing() {
        let bounds = Rect::new(0.0, 0.0, 2e-3, 1e-3);
        let seeds = generate_focus_seeds(&bounds, MAX_DISTANCE_FOCUS_POINTS);
        assert!(!seeds.is_empty());

        // Neighbouring columns and rows never exceed the spacing
        let mut xs: Vec<f64> = seeds.iter().map(|s| s.0).collect();
        xs.sort_by(|a, b| a.total_cmp(b));
        xs.dedup_by(|a, b| (*a - *b).abs() < 1e-12);
        for pair in xs.windows(2) {
            assert!(pair[1] - pair[0] <= MAX_DISTANCE_FOCUS_POINTS + 1e-12);
        }

        // All seeds inside the region
        for (x, y) in &seeds {
            assert!((0.0..=2e-3).contains(x));
            assert!((0.0..=1e-3).contains(y));
        }
    }

    #[test]
    fn test_seed_grid_is_dense_enough() {
        // 2 mm / 450 um => 5 columns
        let bounds = Rect::new(0.0, 0.0, 2e-3, 450e-6);
        let seeds = generate_focus_seeds(&bounds, MAX_DISTANCE_FOCUS_POINTS);
        assert_eq!(seeds.len(), 5);
    }
}
