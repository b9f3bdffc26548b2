//! Plane geometry for acquisition regions.
//!
//! An acquisition region is a simple polygon in physical stage coordinates
//! (metres). Regions are usually rectangular, but irregular shapes (e.g. a
//! hand-drawn outline around a sample) are supported, so the grid planner
//! needs point-in-polygon and polygon/rectangle intersection tests.

use nalgebra::Point2;
use thiserror::Error;
use tracing::warn;

/// Errors from region construction.
#[derive(Debug, Error)]
pub enum GeometryError {
    /// Fewer than three vertices were supplied.
    #[error("a polygon requires at least 3 vertices, got {0}")]
    TooFewVertices(usize),

    /// The vertices enclose no area (all collinear or coincident).
    #[error("the polygon vertices are degenerate (zero enclosed area)")]
    DegenerateArea,

    /// Two non-adjacent edges cross each other.
    #[error("the polygon is self-intersecting")]
    SelfIntersecting,
}

/// Axis-aligned rectangle, normalized so `min <= max` on both axes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub min: Point2<f64>,
    pub max: Point2<f64>,
}

impl Rect {
    /// Creates a rectangle from two opposite corners, in any order.
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self {
            min: Point2::new(x0.min(x1), y0.min(y1)),
            max: Point2::new(x0.max(x1), y0.max(y1)),
        }
    }

    pub fn width(&self) -> f64 {
        self.max.x - self.min.x
    }

    pub fn height(&self) -> f64 {
        self.max.y - self.min.y
    }

    pub fn center(&self) -> Point2<f64> {
        Point2::new(
            (self.min.x + self.max.x) / 2.0,
            (self.min.y + self.max.y) / 2.0,
        )
    }

    /// Returns true if the point lies in the rectangle (borders included).
    pub fn contains(&self, p: &Point2<f64>) -> bool {
        self.min.x <= p.x && p.x <= self.max.x && self.min.y <= p.y && p.y <= self.max.y
    }

    /// Returns the four corners in counter-clockwise order.
    pub fn corners(&self) -> [Point2<f64>; 4] {
        [
            self.min,
            Point2::new(self.max.x, self.min.y),
            self.max,
            Point2::new(self.min.x, self.max.y),
        ]
    }
}

/// A simple (non-self-intersecting) polygon in stage coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    vertices: Vec<Point2<f64>>,
}

impl Polygon {
    /// Builds a polygon from an ordered vertex list.
    ///
    /// The vertex list is validated: at least three vertices, non-zero
    /// enclosed area, and no two non-adjacent edges crossing.
    pub fn new(points: Vec<(f64, f64)>) -> Result<Self, GeometryError> {
        if points.len() < 3 {
            return Err(GeometryError::TooFewVertices(points.len()));
        }
        let vertices: Vec<Point2<f64>> = points.iter().map(|&(x, y)| Point2::new(x, y)).collect();
        let polygon = Self { vertices };
        if polygon.signed_area().abs() < f64::EPSILON {
            return Err(GeometryError::DegenerateArea);
        }
        if !polygon.is_simple() {
            return Err(GeometryError::SelfIntersecting);
        }
        Ok(polygon)
    }

    /// Builds a rectangular polygon from a bounding box.
    ///
    /// The box is normalized so min <= max on both axes; a rearranged input
    /// is accepted but logged.
    pub fn from_bbox(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Result<Self, GeometryError> {
        let rect = Rect::new(xmin, ymin, xmax, ymax);
        if rect.min.x != xmin || rect.min.y != ymin {
            warn!(
                "acquisition area ({}, {}, {}, {}) rearranged into ({}, {}, {}, {})",
                xmin, ymin, xmax, ymax, rect.min.x, rect.min.y, rect.max.x, rect.max.y
            );
        }
        Self::new(vec![
            (rect.min.x, rect.min.y),
            (rect.max.x, rect.min.y),
            (rect.max.x, rect.max.y),
            (rect.min.x, rect.max.y),
        ])
    }

    pub fn vertices(&self) -> &[Point2<f64>] {
        &self.vertices
    }

    /// Bounding box of the polygon.
    pub fn bounds(&self) -> Rect {
        let mut min = self.vertices[0];
        let mut max = self.vertices[0];
        for v in &self.vertices[1..] {
            min.x = min.x.min(v.x);
            min.y = min.y.min(v.y);
            max.x = max.x.max(v.x);
            max.y = max.y.max(v.y);
        }
        Rect { min, max }
    }

    /// Shoelace area; positive for counter-clockwise winding.
    pub fn signed_area(&self) -> f64 {
        let n = self.vertices.len();
        let mut acc = 0.0;
        for i in 0..n {
            let a = self.vertices[i];
            let b = self.vertices[(i + 1) % n];
            acc += a.x * b.y - b.x * a.y;
        }
        acc / 2.0
    }

    /// Ray-cast point-in-polygon test. Points on the boundary count as inside.
    pub fn contains_point(&self, p: &Point2<f64>) -> bool {
        let n = self.vertices.len();
        // Boundary check first: the ray cast below is ambiguous on edges.
        for i in 0..n {
            let a = self.vertices[i];
            let b = self.vertices[(i + 1) % n];
            if on_segment(&a, &b, p) {
                return true;
            }
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let a = self.vertices[i];
            let b = self.vertices[j];
            if (a.y > p.y) != (b.y > p.y) {
                let x_cross = (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x;
                if p.x < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    /// Returns true if the polygon and the rectangle share any area or
    /// boundary point.
    pub fn intersects_rect(&self, rect: &Rect) -> bool {
        // Any polygon vertex inside the rectangle
        if self.vertices.iter().any(|v| rect.contains(v)) {
            return true;
        }
        // Any rectangle corner inside the polygon (also covers the case of a
        // small rectangle fully contained in the polygon)
        if rect.corners().iter().any(|c| self.contains_point(c)) {
            return true;
        }
        // Any edge crossing
        let corners = rect.corners();
        let n = self.vertices.len();
        for i in 0..n {
            let a = self.vertices[i];
            let b = self.vertices[(i + 1) % n];
            for j in 0..4 {
                let c = corners[j];
                let d = corners[(j + 1) % 4];
                if segments_intersect(&a, &b, &c, &d) {
                    return true;
                }
            }
        }
        false
    }

    /// Checks that no two non-adjacent edges intersect.
    fn is_simple(&self) -> bool {
        let n = self.vertices.len();
        for i in 0..n {
            let a = self.vertices[i];
            let b = self.vertices[(i + 1) % n];
            for j in (i + 1)..n {
                // Skip edges sharing a vertex with edge i
                if j == i || (j + 1) % n == i || j == (i + 1) % n {
                    continue;
                }
                let c = self.vertices[j];
                let d = self.vertices[(j + 1) % n];
                if segments_intersect(&a, &b, &c, &d) {
                    return false;
                }
            }
        }
        true
    }
}

/// Cross product orientation of the triplet (a, b, c).
fn orientation(a: &Point2<f64>, b: &Point2<f64>, c: &Point2<f64>) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

/// Returns true if `p` lies on the closed segment [a, b].
fn on_segment(a: &Point2<f64>, b: &Point2<f64>, p: &Point2<f64>) -> bool {
    if orientation(a, b, p).abs() > 1e-12 * (b - a).norm().max(1.0) {
        return false;
    }
    p.x >= a.x.min(b.x) && p.x <= a.x.max(b.x) && p.y >= a.y.min(b.y) && p.y <= a.y.max(b.y)
}

/// Segment intersection test, including collinear overlap and endpoint touch.
pub(crate) fn segments_intersect(
    a: &Point2<f64>,
    b: &Point2<f64>,
    c: &Point2<f64>,
    d: &Point2<f64>,
) -> bool {
    let o1 = orientation(a, b, c);
    let o2 = orientation(a, b, d);
    let o3 = orientation(c, d, a);
    let o4 = orientation(c, d, b);

    if ((o1 > 0.0 && o2 < 0.0) || (o1 < 0.0 && o2 > 0.0))
        && ((o3 > 0.0 && o4 < 0.0) || (o3 < 0.0 && o4 > 0.0))
    {
        return true;
    }

    // Collinear cases
    on_segment(a, b, c) || on_segment(a, b, d) || on_segment(c, d, a) || on_segment(c, d, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_normalizes_corners() {
        let r = Rect::new(2.0, 3.0, -1.0, 1.0);
        assert_eq!(r.min, Point2::new(-1.0, 1.0));
        assert_eq!(r.max, Point2::new(2.0, 3.0));
        assert_eq!(r.width(), 3.0);
        assert_eq!(r.height(), 2.0);
    }

    #[test]
    fn test_polygon_from_bbox_swapped() {
        // min/max given in the wrong order should still build a valid region
        let p = Polygon::from_bbox(10.0, 8.0, 0.0, 0.0).unwrap();
        let b = p.bounds();
        assert_eq!(b.min, Point2::new(0.0, 0.0));
        assert_eq!(b.max, Point2::new(10.0, 8.0));
    }

    #[test]
    fn test_polygon_too_few_vertices() {
        let err = Polygon::new(vec![(0.0, 0.0), (1.0, 1.0)]).unwrap_err();
        assert!(matches!(err, GeometryError::TooFewVertices(2)));
    }

    #[test]
    fn test_polygon_degenerate() {
        let err = Polygon::new(vec![(0.0, 0.0), (1.0, 1.0), (2.0, 2.0)]).unwrap_err();
        assert!(matches!(err, GeometryError::DegenerateArea));
    }

    #[test]
    fn test_polygon_self_intersecting() {
        // Bowtie
        let err =
            Polygon::new(vec![(0.0, 0.0), (1.0, 1.0), (1.0, 0.0), (0.0, 1.0)]).unwrap_err();
        assert!(matches!(err, GeometryError::SelfIntersecting));
    }

    #[test]
    fn test_contains_point() {
        let p = Polygon::new(vec![(0.0, 0.0), (4.0, 0.0), (4.0, 4.0), (0.0, 4.0)]).unwrap();
        assert!(p.contains_point(&Point2::new(2.0, 2.0)));
        assert!(p.contains_point(&Point2::new(0.0, 2.0))); // boundary
        assert!(!p.contains_point(&Point2::new(5.0, 2.0)));
        assert!(!p.contains_point(&Point2::new(-0.1, 2.0)));
    }

    #[test]
    fn test_contains_point_concave() {
        // L-shape: the notch must not count as inside
        let p = Polygon::new(vec![
            (0.0, 0.0),
            (4.0, 0.0),
            (4.0, 2.0),
            (2.0, 2.0),
            (2.0, 4.0),
            (0.0, 4.0),
        ])
        .unwrap();
        assert!(p.contains_point(&Point2::new(1.0, 3.0)));
        assert!(p.contains_point(&Point2::new(3.0, 1.0)));
        assert!(!p.contains_point(&Point2::new(3.0, 3.0)));
    }

    #[test]
    fn test_intersects_rect() {
        let p = Polygon::new(vec![(0.0, 0.0), (4.0, 0.0), (4.0, 4.0), (0.0, 4.0)]).unwrap();
        // overlapping
        assert!(p.intersects_rect(&Rect::new(3.0, 3.0, 5.0, 5.0)));
        // rect fully inside
        assert!(p.intersects_rect(&Rect::new(1.0, 1.0, 2.0, 2.0)));
        // polygon fully inside rect
        assert!(p.intersects_rect(&Rect::new(-1.0, -1.0, 5.0, 5.0)));
        // disjoint
        assert!(!p.intersects_rect(&Rect::new(5.0, 5.0, 6.0, 6.0)));
        // touching edge counts
        assert!(p.intersects_rect(&Rect::new(4.0, 0.0, 5.0, 1.0)));
    }

    #[test]
    fn test_intersects_rect_diagonal_edge() {
        // Triangle whose hypotenuse crosses a rect without any vertex inside
        let p = Polygon::new(vec![(0.0, 0.0), (10.0, 0.0), (0.0, 10.0)]).unwrap();
        let r = Rect::new(4.0, 4.0, 8.0, 8.0);
        assert!(p.intersects_rect(&r));
    }
}
