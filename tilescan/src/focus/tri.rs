//! Delaunay triangulation of the focus-point plan positions.
//!
//! Bowyer-Watson incremental construction. The point sets involved are
//! small (focus points are sampled hundreds of micrometres apart), so the
//! O(n^2) insertion cost is irrelevant here.

use nalgebra::Point2;

/// A 2-D Delaunay triangulation over a fixed point set.
#[derive(Debug, Clone)]
pub struct Triangulation {
    points: Vec<Point2<f64>>,
    triangles: Vec<[usize; 3]>,
}

impl Triangulation {
    /// Triangulates the given points.
    ///
    /// Returns `None` when fewer than three points are given or when all
    /// points are collinear, in which case no simplex exists and callers
    /// fall back to a plane fit.
    pub fn new(points: &[Point2<f64>]) -> Option<Self> {
        if points.len() < 3 {
            return None;
        }

        // Super-triangle comfortably enclosing all points
        let mut min = points[0];
        let mut max = points[0];
        for p in points {
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
        }
        let span = (max.x - min.x).max(max.y - min.y).max(f64::MIN_POSITIVE);
        let mid = Point2::new((min.x + max.x) / 2.0, (min.y + max.y) / 2.0);

        let n = points.len();
        let mut all: Vec<Point2<f64>> = points.to_vec();
        all.push(Point2::new(mid.x - 20.0 * span, mid.y - 10.0 * span));
        all.push(Point2::new(mid.x + 20.0 * span, mid.y - 10.0 * span));
        all.push(Point2::new(mid.x, mid.y + 20.0 * span));

        let mut triangles: Vec<[usize; 3]> = vec![[n, n + 1, n + 2]];

        for i in 0..n {
            let p = all[i];

            // Triangles whose circumcircle contains the new point
            let mut bad: Vec<usize> = Vec::new();
            for (t_idx, t) in triangles.iter().enumerate() {
                if in_circumcircle(&all[t[0]], &all[t[1]], &all[t[2]], &p) {
                    bad.push(t_idx);
                }
            }
            if bad.is_empty() {
                // Duplicate of an existing vertex; nothing to insert
                continue;
            }

            // Boundary of the cavity: edges belonging to exactly one bad triangle
            let mut edges: Vec<(usize, usize)> = Vec::new();
            for &t_idx in &bad {
                let t = triangles[t_idx];
                for e in [(t[0], t[1]), (t[1], t[2]), (t[2], t[0])] {
                    let key = (e.0.min(e.1), e.0.max(e.1));
                    if let Some(pos) = edges.iter().position(|&x| x == key) {
                        edges.swap_remove(pos);
                    } else {
                        edges.push(key);
                    }
                }
            }

            // Remove bad triangles (descending so indices stay valid)
            bad.sort_unstable_by(|a, b| b.cmp(a));
            for t_idx in bad {
                triangles.swap_remove(t_idx);
            }

            // Re-triangulate the cavity around the new point
            for (a, b) in edges {
                triangles.push([a, b, i]);
            }
        }

        // Drop everything touching the super-triangle
        triangles.retain(|t| t.iter().all(|&v| v < n));
        if triangles.is_empty() {
            return None;
        }

        all.truncate(n);
        Some(Self {
            points: all,
            triangles,
        })
    }

    pub fn points(&self) -> &[Point2<f64>] {
        &self.points
    }

    pub fn triangles(&self) -> &[[usize; 3]] {
        &self.triangles
    }

    /// Finds the simplex containing `(x, y)`, together with its barycentric
    /// coordinates. Returns `None` when the point is outside the hull.
    pub fn locate(&self, x: f64, y: f64) -> Option<([usize; 3], [f64; 3])> {
        let p = Point2::new(x, y);
        for t in &self.triangles {
            if let Some(bary) = barycentric(&self.points[t[0]], &self.points[t[1]], &self.points[t[2]], &p)
            {
                const EPS: f64 = -1e-9;
                if bary.iter().all(|&w| w >= EPS) {
                    return Some((*t, bary));
                }
            }
        }
        None
    }
}

/// Barycentric coordinates of `p` in triangle (a, b, c); `None` for a
/// degenerate triangle.
pub(crate) fn barycentric(
    a: &Point2<f64>,
    b: &Point2<f64>,
    c: &Point2<f64>,
    p: &Point2<f64>,
) -> Option<[f64; 3]> {
    let det = (b.y - c.y) * (a.x - c.x) + (c.x - b.x) * (a.y - c.y);
    if det.abs() < f64::MIN_POSITIVE * 16.0 {
        return None;
    }
    let w0 = ((b.y - c.y) * (p.x - c.x) + (c.x - b.x) * (p.y - c.y)) / det;
    let w1 = ((c.y - a.y) * (p.x - c.x) + (a.x - c.x) * (p.y - c.y)) / det;
    Some([w0, w1, 1.0 - w0 - w1])
}

/// Circumcircle containment test, sign-normalized for either triangle
/// winding.
fn in_circumcircle(a: &Point2<f64>, b: &Point2<f64>, c: &Point2<f64>, p: &Point2<f64>) -> bool {
    let ax = a.x - p.x;
    let ay = a.y - p.y;
    let bx = b.x - p.x;
    let by = b.y - p.y;
    let cx = c.x - p.x;
    let cy = c.y - p.y;

    let det = (ax * ax + ay * ay) * (bx * cy - by * cx)
        - (bx * bx + by * by) * (ax * cy - ay * cx)
        + (cx * cx + cy * cy) * (ax * by - ay * bx);

    let orient = (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x);
    if orient > 0.0 {
        det > 0.0
    } else {
        det < 0.0
    }
}
