//! Multi-area overview acquisitions against the simulated rig.

use std::sync::Arc;
use std::time::Duration;

use tilescan::hw::{Focuser, RoiAutofocus, Stage, Stream};
use tilescan::overview::{OverviewError, OverviewTask};
use tilescan::sim::{NaiveStitcher, SimFocuser, SimRoiAutofocus, SimStage, SimStream};
use tilescan::stitch::Stitcher;
use tilescan::task::{RegionSpec, TaskState, TiledScanConfig};

fn area(xmin: f64, ymin: f64, size: f64) -> TiledScanConfig {
    TiledScanConfig::new(RegionSpec::Bounds {
        xmin,
        ymin,
        xmax: xmin + size,
        ymax: ymin + size,
    })
}

fn rig() -> (
    Arc<dyn Stage>,
    Vec<Arc<dyn Stream>>,
    Arc<dyn Stitcher>,
    Arc<SimFocuser>,
) {
    let stage = Arc::new(SimStage::new(1e-3)) as Arc<dyn Stage>;
    let focuser = Arc::new(SimFocuser::new((-100e-6, 100e-6)));
    let streams = vec![Arc::new(
        SimStream::fluorescence("fluo", 16, focuser.clone()).with_exposure(Duration::ZERO),
    ) as Arc<dyn Stream>];
    let stitcher = Arc::new(NaiveStitcher::new()) as Arc<dyn Stitcher>;
    (stage, streams, stitcher, focuser)
}

#[tokio::test]
async fn two_areas_scan_sequentially() {
    let (stage, streams, stitcher, _focuser) = rig();
    // The sample surface tilts gently along x; within focuser range
    let roi_autofocus =
        Arc::new(SimRoiAutofocus::new((0.01, 0.0, 0.0))) as Arc<dyn RoiAutofocus>;

    let overview = OverviewTask::new(
        vec![area(0.0, 0.0, 100e-6), area(200e-6, 200e-6, 100e-6)],
        stage,
        streams,
        stitcher,
        None,
        Some(roi_autofocus),
    )
    .unwrap();

    let handle = overview.start();
    let state_rx = handle.state_changes();
    let outputs = handle.wait().await.unwrap();

    assert_eq!(outputs.len(), 2);
    assert_eq!(*state_rx.borrow(), TaskState::Finished);
    for output in &outputs {
        assert_eq!(output.stitched.len(), 1);
        assert!(output.degraded_moves.is_empty());
    }
}

#[tokio::test]
async fn overview_without_roi_autofocus_still_scans() {
    let (stage, streams, stitcher, _focuser) = rig();
    let overview = OverviewTask::new(
        vec![area(0.0, 0.0, 50e-6)],
        stage,
        streams,
        stitcher,
        None,
        None,
    )
    .unwrap();

    let outputs = overview.start().wait().await.unwrap();
    assert_eq!(outputs.len(), 1);
}

#[tokio::test]
async fn empty_area_list_is_rejected() {
    let (stage, streams, stitcher, _focuser) = rig();
    let err = OverviewTask::new(Vec::new(), stage, streams, stitcher, None, None).unwrap_err();
    assert!(matches!(err, OverviewError::Config { area: 0, .. }));
}

#[tokio::test]
async fn invalid_area_is_reported_with_its_index() {
    let (stage, streams, stitcher, _focuser) = rig();
    let mut bad = area(0.0, 0.0, 50e-6);
    bad.overlap = 1.5;
    let err = OverviewTask::new(
        vec![area(0.0, 0.0, 50e-6), bad],
        stage,
        streams,
        stitcher,
        None,
        None,
    )
    .unwrap_err();
    assert!(matches!(err, OverviewError::Config { area: 1, .. }));
}

#[tokio::test]
async fn cancellation_aborts_remaining_areas() {
    let (stage, stitcher, focuser) = {
        let stage = Arc::new(SimStage::new(1e-3)) as Arc<dyn Stage>;
        let focuser = Arc::new(SimFocuser::new((-100e-6, 100e-6)));
        let stitcher = Arc::new(NaiveStitcher::new()) as Arc<dyn Stitcher>;
        (stage, stitcher, focuser)
    };
    // Slow exposures so the cancel lands inside the first area
    let streams = vec![Arc::new(
        SimStream::fluorescence("fluo", 16, focuser).with_exposure(Duration::from_millis(100)),
    ) as Arc<dyn Stream>];

    let overview = OverviewTask::new(
        vec![area(0.0, 0.0, 240e-6), area(400e-6, 400e-6, 240e-6)],
        stage,
        streams,
        stitcher,
        None,
        None,
    )
    .unwrap();

    let handle = overview.start();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(handle.cancel());

    let state_rx = handle.state_changes();
    let result = handle.wait().await;
    assert!(matches!(result, Err(OverviewError::Cancelled)));
    assert_eq!(*state_rx.borrow(), TaskState::Cancelled);
}

#[tokio::test]
async fn mapped_focus_points_drive_the_focuser() {
    let (stage, streams, stitcher, focuser) = rig();
    // Flat surface at +20 um: every predicted focus lands there
    let roi_autofocus =
        Arc::new(SimRoiAutofocus::new((0.0, 0.0, 20e-6))) as Arc<dyn RoiAutofocus>;

    let overview = OverviewTask::new(
        vec![area(0.0, 0.0, 50e-6)],
        stage,
        streams,
        stitcher,
        None,
        Some(roi_autofocus),
    )
    .unwrap();

    let outputs = overview.start().wait().await.unwrap();
    assert_eq!(outputs.len(), 1);
    assert!(
        (focuser.position() - 20e-6).abs() < 1e-9,
        "the scan must have focused at the mapped surface"
    );
}
