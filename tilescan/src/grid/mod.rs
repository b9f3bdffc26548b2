//! Region/grid planner and tour scheduler.
//!
//! Converts an arbitrary polygonal region into the minimal grid of tiles
//! that fully covers it, then orders the stage visits in a boustrophedon
//! ("zigzag") pattern to minimize travel.
//!
//! ```text
//! A-->-->-->--v
//!             |
//! v--<--<--<---
//! |
//! --->-->-->--Z
//! ```

use nalgebra::Point2;
use thiserror::Error;
use tracing::debug;

use crate::geometry::{Polygon, Rect};

/// Fraction of a tile deliberately ignored when rounding up the tile count.
///
/// When the requested area is an exact multiple of the reliable FoV, float
/// rounding could otherwise spuriously add one tile along that axis.
const ROUNDING_ABSORPTION: f64 = 0.01;

/// Grid-relative tile index as (column, row).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileIndex {
    pub col: i32,
    pub row: i32,
}

impl TileIndex {
    pub fn new(col: i32, row: i32) -> Self {
        Self { col, row }
    }
}

impl std::fmt::Display for TileIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.col, self.row)
    }
}

/// Sentinel index used before the first tile, so that the first move is
/// never skipped by the "axis unchanged" optimization.
pub const START_INDEX: TileIndex = TileIndex { col: -1, row: -1 };

/// Errors from grid planning.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The overlap fraction must be in [0, 1).
    #[error("overlap must be in [0, 1), got {0}")]
    OverlapOutOfRange(f64),

    /// The field of view must be strictly positive on both axes.
    #[error("field of view must be positive, got {0}x{1} m")]
    InvalidFov(f64, f64),
}

/// Result of planning the tile coverage of a region.
#[derive(Debug, Clone)]
pub struct TilePlan {
    /// Physical center of grid tile (0, 0), the top-left tile.
    pub starting_position: Point2<f64>,
    /// Occupied tile indices, row-major. Not yet ordered for travel; see
    /// [`sort_zigzag`].
    pub tiles: Vec<TileIndex>,
    /// Grid extent in columns.
    pub cols: usize,
    /// Grid extent in rows.
    pub rows: usize,
    /// Tile pitch per axis: FoV discounted by the overlap fraction.
    pub reliable_fov: (f64, f64),
}

impl TilePlan {
    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }
}

/// Computes the minimal tile grid fully covering `polygon`.
///
/// The grid pitch is the reliable FoV (`fov * (1 - overlap)`). The integer
/// grid is centered on the polygon's bounding-box center so that the extra
/// coverage from rounding up is distributed symmetrically. A cell belongs to
/// the grid iff its rectangle geometrically intersects the polygon, or it
/// lies in a hole enclosed by intersecting cells (holes are filled to keep
/// the covered area simply connected).
pub fn plan_tile_coverage(
    polygon: &Polygon,
    fov: (f64, f64),
    overlap: f64,
) -> Result<TilePlan, PlanError> {
    if !(0.0..1.0).contains(&overlap) {
        return Err(PlanError::OverlapOutOfRange(overlap));
    }
    if fov.0 <= 0.0 || fov.1 <= 0.0 {
        return Err(PlanError::InvalidFov(fov.0, fov.1));
    }

    // The size of the smallest tile, not including the overlap, which will
    // be lost (and also indirectly represents the precision of the stage).
    let rfov = ((1.0 - overlap) * fov.0, (1.0 - overlap) * fov.1);

    let bounds = polygon.bounds();
    let area_size = (bounds.width(), bounds.height());

    // Round up the number of tiles needed, but if less than 1% of a tile
    // extra would be required, round down instead.
    let adjusted = (
        if area_size.0 > rfov.0 {
            area_size.0 - rfov.0 * ROUNDING_ABSORPTION
        } else {
            area_size.0
        },
        if area_size.1 > rfov.1 {
            area_size.1 - rfov.1 * ROUNDING_ABSORPTION
        } else {
            area_size.1
        },
    );
    let nx = ((adjusted.0 / rfov.0).ceil() as usize).max(1);
    let ny = ((adjusted.1 / rfov.1).ceil() as usize).max(1);

    // We acquire a little more than needed. Spread the extra symmetrically
    // by centering the grid on the region's bounding-box center (keeping the
    // overlap, enlarging the total area).
    let center = bounds.center();
    let total_size = (
        nx as f64 * rfov.0 + fov.0 * overlap,
        ny as f64 * rfov.1 + fov.1 * overlap,
    );
    let xmin = center.x - total_size.0 / 2.0;
    let ymax = center.y + total_size.1 / 2.0;

    // Occupancy mask: true for every cell whose rectangle intersects the
    // polygon. Row 0 is the top row (largest y).
    let mut mask = vec![false; nx * ny];
    for row in 0..ny {
        for col in 0..nx {
            let cell = Rect::new(
                xmin + col as f64 * rfov.0,
                ymax - (row as f64 + 1.0) * rfov.1,
                xmin + (col as f64 + 1.0) * rfov.0,
                ymax - row as f64 * rfov.1,
            );
            if polygon.intersects_rect(&cell) {
                mask[row * nx + col] = true;
            }
        }
    }

    fill_holes(&mut mask, nx, ny);

    let mut tiles = Vec::new();
    for row in 0..ny {
        for col in 0..nx {
            if mask[row * nx + col] {
                tiles.push(TileIndex::new(col as i32, row as i32));
            }
        }
    }
    debug!(
        "planned {} of {}x{} tiles covering region of {:.1}x{:.1} um",
        tiles.len(),
        nx,
        ny,
        area_size.0 * 1e6,
        area_size.1 * 1e6
    );

    // Center of the top-left grid cell
    let starting_position = Point2::new(xmin + rfov.0 / 2.0, ymax - rfov.1 / 2.0);

    Ok(TilePlan {
        starting_position,
        tiles,
        cols: nx,
        rows: ny,
        reliable_fov: rfov,
    })
}

/// Fills interior holes of the occupancy mask.
///
/// A hole is any unoccupied cell not 4-connected to the grid border through
/// other unoccupied cells. Filling them keeps the covered area simply
/// connected, so a partially-covering polygon never leaves an unreachable
/// island inside the tour.
fn fill_holes(mask: &mut [bool], nx: usize, ny: usize) {
    let mut outside = vec![false; nx * ny];
    let mut queue: Vec<(usize, usize)> = Vec::new();

    for col in 0..nx {
        for row in [0, ny - 1] {
            if !mask[row * nx + col] && !outside[row * nx + col] {
                outside[row * nx + col] = true;
                queue.push((col, row));
            }
        }
    }
    for row in 0..ny {
        for col in [0, nx - 1] {
            if !mask[row * nx + col] && !outside[row * nx + col] {
                outside[row * nx + col] = true;
                queue.push((col, row));
            }
        }
    }

    while let Some((col, row)) = queue.pop() {
        let mut visit = |c: usize, r: usize| {
            let i = r * nx + c;
            if !mask[i] && !outside[i] {
                outside[i] = true;
                queue.push((c, r));
            }
        };
        if col > 0 {
            visit(col - 1, row);
        }
        if col + 1 < nx {
            visit(col + 1, row);
        }
        if row > 0 {
            visit(col, row - 1);
        }
        if row + 1 < ny {
            visit(col, row + 1);
        }
    }

    for i in 0..mask.len() {
        if !mask[i] && !outside[i] {
            mask[i] = true;
        }
    }
}

/// Sorts tile indices into a zigzag scanning order.
///
/// Tiles are ordered by row, with the column order reversed on every odd
/// row, so consecutive tiles are always row- or column-adjacent and the
/// stage never has to jump back across the full grid width.
pub fn sort_zigzag(tiles: &mut [TileIndex]) {
    tiles.sort_by_key(|t| (t.row, t.col));
    let mut i = 0;
    while i < tiles.len() {
        let row = tiles[i].row;
        let mut j = i;
        while j < tiles.len() && tiles[j].row == row {
            j += 1;
        }
        if row % 2 == 1 {
            tiles[i..j].reverse();
        }
        i = j;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn rect_region(w: f64, h: f64) -> Polygon {
        Polygon::from_bbox(0.0, 0.0, w, h).unwrap()
    }

    #[test]
    fn test_tile_count_exact_multiple() {
        // L=300, f=100, overlap=0.2 => reliable fov=80 => ceil((300-0.8)/80)=4
        let plan =
            plan_tile_coverage(&rect_region(300e-6, 300e-6), (100e-6, 100e-6), 0.2).unwrap();
        assert_eq!(plan.cols, 4);
        assert_eq!(plan.rows, 4);
        assert_eq!(plan.tile_count(), 16);
    }

    #[test]
    fn test_tile_count_no_spurious_extra_tile() {
        // Exactly 3 reliable FoVs per axis: the 1% absorption must prevent
        // rounding up to 4.
        let plan =
            plan_tile_coverage(&rect_region(240e-6, 240e-6), (100e-6, 100e-6), 0.2).unwrap();
        assert_eq!(plan.cols, 3);
        assert_eq!(plan.rows, 3);
    }

    #[test]
    fn test_single_tile_small_region() {
        let plan = plan_tile_coverage(&rect_region(10e-6, 10e-6), (100e-6, 100e-6), 0.2).unwrap();
        assert_eq!(plan.tile_count(), 1);
        assert_eq!(plan.tiles[0], TileIndex::new(0, 0));
    }

    #[test]
    fn test_grid_centered_on_region() {
        let plan =
            plan_tile_coverage(&rect_region(300e-6, 300e-6), (100e-6, 100e-6), 0.0).unwrap();
        // 3x3 grid of 100um tiles centered on (150, 150): top-left center at (50, 250)
        assert!((plan.starting_position.x - 50e-6).abs() < 1e-9);
        assert!((plan.starting_position.y - 250e-6).abs() < 1e-9);
    }

    #[test]
    fn test_overlap_out_of_range() {
        let err = plan_tile_coverage(&rect_region(1.0, 1.0), (0.1, 0.1), 1.0).unwrap_err();
        assert!(matches!(err, PlanError::OverlapOutOfRange(_)));
    }

    #[test]
    fn test_triangle_region_skips_far_corner() {
        // A right triangle over a 4x4 grid: the far corner cells do not
        // intersect and must be absent.
        let polygon = Polygon::new(vec![(0.0, 0.0), (400e-6, 0.0), (0.0, 400e-6)]).unwrap();
        let plan = plan_tile_coverage(&polygon, (100e-6, 100e-6), 0.0).unwrap();
        assert_eq!((plan.cols, plan.rows), (4, 4));
        let set: HashSet<_> = plan.tiles.iter().copied().collect();
        // Row 0 is the top (max y) => triangle hypotenuse leaves the
        // top-right corner empty.
        assert!(!set.contains(&TileIndex::new(3, 0)));
        // The right-angle corner (bottom-left) is covered.
        assert!(set.contains(&TileIndex::new(0, 3)));
        assert!(plan.tile_count() < 16);
    }

    #[test]
    fn test_hole_filling() {
        // A ring-like mask: simulate by directly testing fill_holes
        let nx = 5;
        let ny = 5;
        let mut mask = vec![false; nx * ny];
        for row in 0..ny {
            for col in 0..nx {
                let edge_of_ring = (1..=3).contains(&row) && (1..=3).contains(&col);
                let center = row == 2 && col == 2;
                if edge_of_ring && !center {
                    mask[row * nx + col] = true;
                }
            }
        }
        fill_holes(&mut mask, nx, ny);
        assert!(mask[2 * nx + 2], "enclosed hole must be filled");
        assert!(!mask[0], "outside cells must stay empty");
    }

    #[test]
    fn test_coverage_simply_connected() {
        // Property: every occupied tile reachable from the first via
        // axis-adjacent occupied tiles.
        let polygon = Polygon::new(vec![
            (0.0, 0.0),
            (500e-6, 0.0),
            (500e-6, 500e-6),
            (250e-6, 300e-6),
            (0.0, 500e-6),
        ])
        .unwrap();
        let plan = plan_tile_coverage(&polygon, (80e-6, 80e-6), 0.1).unwrap();
        let set: HashSet<_> = plan.tiles.iter().copied().collect();
        assert!(!set.is_empty());

        let mut seen = HashSet::new();
        let mut stack = vec![plan.tiles[0]];
        seen.insert(plan.tiles[0]);
        while let Some(t) = stack.pop() {
            for (dc, dr) in [(1, 0), (-1, 0), (0, 1), (0, -1)] {
                let n = TileIndex::new(t.col + dc, t.row + dr);
                if set.contains(&n) && seen.insert(n) {
                    stack.push(n);
                }
            }
        }
        assert_eq!(seen.len(), set.len(), "tile coverage is disconnected");
    }

    #[test]
    fn test_zigzag_order() {
        let mut tiles: Vec<TileIndex> = (0..3)
            .flat_map(|row| (0..3).map(move |col| TileIndex::new(col, row)))
            .collect();
        sort_zigzag(&mut tiles);
        let expected = [
            (0, 0),
            (1, 0),
            (2, 0),
            (2, 1),
            (1, 1),
            (0, 1),
            (0, 2),
            (1, 2),
            (2, 2),
        ];
        let got: Vec<(i32, i32)> = tiles.iter().map(|t| (t.col, t.row)).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_zigzag_order_ragged_rows() {
        let mut tiles = vec![
            TileIndex::new(2, 1),
            TileIndex::new(0, 0),
            TileIndex::new(1, 1),
            TileIndex::new(1, 0),
        ];
        sort_zigzag(&mut tiles);
        let got: Vec<(i32, i32)> = tiles.iter().map(|t| (t.col, t.row)).collect();
        assert_eq!(got, vec![(0, 0), (1, 0), (2, 1), (1, 1)]);
    }
}
