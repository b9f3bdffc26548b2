//! Interpolated focus surface over the sampled good-focus points.

use nalgebra::{DMatrix, DVector, Point2};
use tracing::debug;

use super::tri::Triangulation;
use super::FocusError;

/// Least-squares plane `z = a*x + b*y + c` through all focus points.
///
/// Used for query points falling outside every triangulation simplex (and
/// as the only model when the points admit no triangulation at all).
#[derive(Debug, Clone, Copy)]
struct PlaneFit {
    a: f64,
    b: f64,
    c: f64,
}

impl PlaneFit {
    fn fit(points: &[(f64, f64, f64)]) -> Self {
        let n = points.len();
        let a = DMatrix::from_fn(n, 3, |r, col| match col {
            0 => points[r].0,
            1 => points[r].1,
            _ => 1.0,
        });
        let b = DVector::from_fn(n, |r, _| points[r].2);
        let svd = a.svd(true, true);
        match svd.solve(&b, 1e-12) {
            Ok(sol) => Self {
                a: sol[0],
                b: sol[1],
                c: sol[2],
            },
            Err(_) => {
                // Degenerate spread; fall back to the mean focus
                let mean = points.iter().map(|p| p.2).sum::<f64>() / n as f64;
                Self {
                    a: 0.0,
                    b: 0.0,
                    c: mean,
                }
            }
        }
    }

    fn z_at(&self, x: f64, y: f64) -> f64 {
        self.a * x + self.b * y + self.c
    }
}

/// Predicts the focus z position at arbitrary stage coordinates from a set
/// of known good-focus points.
///
/// With one point the focus is constant. With three or more, the points are
/// triangulated and z is barycentrically interpolated inside the containing
/// simplex; outside the hull (or when the points are collinear) a
/// least-squares plane fit takes over.
#[derive(Debug, Clone)]
pub struct FocusSurface {
    points: Vec<(f64, f64, f64)>,
    triangulation: Option<Triangulation>,
    plane: Option<PlaneFit>,
}

impl FocusSurface {
    /// Builds the surface. Exactly two points are rejected: they define
    /// neither a constant focus nor a surface.
    pub fn new(points: &[(f64, f64, f64)]) -> Result<Self, FocusError> {
        match points.len() {
            0 | 2 => return Err(FocusError::UnsupportedPointCount(points.len())),
            1 => {
                return Ok(Self {
                    points: points.to_vec(),
                    triangulation: None,
                    plane: None,
                })
            }
            _ => {}
        }

        let plan_positions: Vec<Point2<f64>> =
            points.iter().map(|&(x, y, _)| Point2::new(x, y)).collect();
        let triangulation = Triangulation::new(&plan_positions);
        if triangulation.is_none() {
            debug!("focus points admit no triangulation, plane fit only");
        }
        Ok(Self {
            points: points.to_vec(),
            triangulation,
            plane: Some(PlaneFit::fit(points)),
        })
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    /// The predicted focus z position at stage position `(x, y)`.
    pub fn z_at(&self, x: f64, y: f64) -> f64 {
        let Some(plane) = self.plane else {
            // Single focus point: constant focus
            return self.points[0].2;
        };

        if let Some(tri) = &self.triangulation {
            if let Some((simplex, bary)) = tri.locate(x, y) {
                return simplex
                    .iter()
                    .zip(bary.iter())
                    .map(|(&v, &w)| self.points[v].2 * w)
                    .sum();
            }
            debug!("querying focus outside of the focused area, using plane fit");
        }

        plane.z_at(x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_two_points() {
        let err = FocusSurface::new(&[(0.0, 0.0, 1.0), (1.0, 0.0, 2.0)]).unwrap_err();
        assert!(matches!(err, FocusError::UnsupportedPointCount(2)));
    }

    #[test]
    fn test_rejects_zero_points() {
        assert!(FocusSurface::new(&[]).is_err());
    }

    #[test]
    fn test_single_point_constant() {
        let s = FocusSurface::new(&[(5.0, 5.0, 42.0)]).unwrap();
        assert_eq!(s.z_at(0.0, 0.0), 42.0);
        assert_eq!(s.z_at(100.0, -3.0), 42.0);
    }

    #[test]
    fn test_interpolation_exact_at_vertices() {
        let points = [
            (0.0, 0.0, 1.0),
            (1.0, 0.0, 2.0),
            (0.0, 1.0, 3.0),
            (1.0, 1.0, 4.0),
        ];
        let s = FocusSurface::new(&points).unwrap();
        for &(x, y, z) in &points {
            assert!(
                (s.z_at(x, y) - z).abs() < 1e-9,
                "z({}, {}) = {} != {}",
                x,
                y,
                s.z_at(x, y),
                z
            );
        }
    }

    #[test]
    fn test_interpolation_inside_simplex() {
        // Tilted plane z = x: any interior point must interpolate exactly
        let points = [(0.0, 0.0, 0.0), (2.0, 0.0, 2.0), (0.0, 2.0, 0.0)];
        let s = FocusSurface::new(&points).unwrap();
        assert!((s.z_at(0.5, 0.5) - 0.5).abs() < 1e-9);
        assert!((s.z_at(1.0, 0.5) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_plane_fallback_outside_hull() {
        // Points on the plane z = x + 2y + 3; a query outside the hull must
        // still land on that plane via the least-squares fit.
        let points = [
            (0.0, 0.0, 3.0),
            (1.0, 0.0, 4.0),
            (0.0, 1.0, 5.0),
            (1.0, 1.0, 6.0),
        ];
        let s = FocusSurface::new(&points).unwrap();
        let z = s.z_at(5.0, 5.0);
        assert!((z - (5.0 + 10.0 + 3.0)).abs() < 1e-6, "got {}", z);
    }

    #[test]
    fn test_collinear_points_use_plane() {
        let points = [(0.0, 0.0, 1.0), (1.0, 0.0, 1.0), (2.0, 0.0, 1.0)];
        let s = FocusSurface::new(&points).unwrap();
        // All z equal; the fit must reproduce the constant
        assert!((s.z_at(0.5, 3.0) - 1.0).abs() < 1e-6);
    }
}
