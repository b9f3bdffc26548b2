//! TileScan CLI - Command-line interface
//!
//! This binary provides a command-line interface to the tilescan library,
//! using the simulated hardware rig: plan a tile grid, estimate a scan, or
//! run a full simulated acquisition.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tilescan::focus::FocusingMethod;
use tilescan::hw::{AutofocusRunner, Stage, Stream};
use tilescan::sim::{NaiveStitcher, SimAutofocus, SimFocuser, SimStage, SimStream};
use tilescan::stitch::Stitcher;
use tilescan::system::total_memory;
use tilescan::task::{start_tiled_scan, RegionSpec, TiledScanConfig, TiledScanTask};

#[derive(Parser)]
#[command(name = "tilescan")]
#[command(about = "Tiled stage acquisition engine", long_about = None)]
#[command(version = tilescan::VERSION)]
struct Args {
    /// Region width in micrometres
    #[arg(long, default_value = "300")]
    width: f64,

    /// Region height in micrometres
    #[arg(long, default_value = "300")]
    height: f64,

    /// Tile overlap fraction, in [0, 1)
    #[arg(long, default_value = "0.2")]
    overlap: f64,

    /// Log directory (logging is skipped when not set)
    #[arg(long)]
    log_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the planned tile grid and visiting order
    Plan,
    /// Print the time and memory estimates for the scan
    Estimate,
    /// Run the scan against the simulated rig
    Run {
        /// Number of z-levels for a max-intensity-projection scan
        #[arg(long, default_value = "0")]
        zlevels: usize,

        /// Dump every acquired tile as raw data next to this path
        #[arg(long)]
        dump: Option<PathBuf>,

        /// Refocus before every tile
        #[arg(long)]
        autofocus: bool,
    },
}

fn build_task(args: &Args, zlevels: usize, dump: Option<PathBuf>, autofocus: bool) -> TiledScanTask {
    let config = {
        let mut config = TiledScanConfig::new(RegionSpec::Bounds {
            xmin: 0.0,
            ymin: 0.0,
            xmax: args.width * 1e-6,
            ymax: args.height * 1e-6,
        });
        config.overlap = args.overlap;
        config.dump_path = dump;
        if zlevels > 1 {
            config.focusing_method = FocusingMethod::MaxIntensityProjection;
            // 1 um steps centered on the predicted focus
            config.zlevels = (0..zlevels)
                .map(|i| (i as f64 - (zlevels - 1) as f64 / 2.0) * 1e-6)
                .collect();
        } else if autofocus {
            config.focusing_method = FocusingMethod::Always;
        }
        config
    };

    let stage = Arc::new(SimStage::new(1e-3)) as Arc<dyn Stage>;
    let focuser = Arc::new(SimFocuser::new((-100e-6, 100e-6)));
    let streams: Vec<Arc<dyn Stream>> = vec![
        Arc::new(SimStream::em("sem", 1024 * 1024).with_exposure(Duration::from_millis(10))),
        Arc::new(SimStream::fluorescence("fluo", 512, focuser)),
    ];
    let stitcher = Arc::new(NaiveStitcher::new()) as Arc<dyn Stitcher>;
    let runner = (autofocus || zlevels > 1)
        .then(|| Arc::new(SimAutofocus::new(0.0)) as Arc<dyn AutofocusRunner>);

    match TiledScanTask::new(config, stage, streams, stitcher, runner) {
        Ok(task) => task,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let _guard = args.log_dir.as_ref().map(|dir| {
        match tilescan::logging::init_logging(dir, "tilescan.log") {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("Error initializing logging: {}", e);
                process::exit(1);
            }
        }
    });

    match args.command {
        Command::Plan => {
            let task = build_task(&args, 0, None, false);
            let plan = task.plan();
            println!(
                "Grid: {}x{} cells, {} tiles occupied",
                plan.cols,
                plan.rows,
                plan.tile_count()
            );
            println!(
                "Tile pitch: {:.1} x {:.1} um",
                plan.reliable_fov.0 * 1e6,
                plan.reliable_fov.1 * 1e6
            );
            println!("Visiting order:");
            for tile in task.order() {
                let center = task.tile_center(*tile);
                println!(
                    "  {}  at ({:.1}, {:.1}) um",
                    tile,
                    center.x * 1e6,
                    center.y * 1e6
                );
            }
        }
        Command::Estimate => {
            let task = build_task(&args, 0, None, false);
            let duration = task.estimated_duration();
            let total = total_memory();
            let memory = task.memory_estimate(total);
            println!("Tiles: {}", task.plan().tile_count());
            println!("Estimated duration: {:.1} s", duration.as_secs_f64());
            println!(
                "Estimated memory: {:.2} GB of {:.2} GB ({})",
                memory.bytes as f64 / 1024f64.powi(3),
                total as f64 / 1024f64.powi(3),
                if memory.sufficient {
                    "sufficient"
                } else {
                    "insufficient"
                }
            );
        }
        Command::Run {
            zlevels,
            ref dump,
            autofocus,
        } => {
            let task = build_task(&args, zlevels, dump.clone(), autofocus);
            let tiles = task.plan().tile_count();
            println!(
                "Scanning {} tiles ({:.1} s estimated)...",
                tiles,
                task.estimated_duration().as_secs_f64()
            );

            let handle = match start_tiled_scan(task) {
                Ok(handle) => handle,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    process::exit(1);
                }
            };
            match handle.wait().await {
                Ok(output) => {
                    println!("Done: {} stitched frames", output.stitched.len());
                    for frame in &output.stitched {
                        println!(
                            "  {}: {}x{} px",
                            frame.metadata.kind, frame.width, frame.height
                        );
                    }
                    if output.registration.is_degraded() {
                        println!("Warning: registration fell back to stage positions");
                    }
                    if !output.degraded_moves.is_empty() {
                        println!(
                            "Warning: {} tiles acquired after a move timeout",
                            output.degraded_moves.len()
                        );
                    }
                }
                Err(e) => {
                    eprintln!("Scan failed: {}", e);
                    process::exit(1);
                }
            }
        }
    }
}
