//! Least-squares plane fitting for surface tilt determination.
//!
//! A touchdown grid yields heights `z_i` at scanner positions `(x_i, y_i)`;
//! the plane `z = a x + b y + c` through them is the sample tilt. Solved by
//! the 3x3 normal equations, written out directly.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// The plane `z = a x + b y + c`, in scanner voltage units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Plane {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl Plane {
    /// Least-squares fit through `(x, y, z)` samples.
    ///
    /// Needs at least three non-collinear points; collinear input makes the
    /// normal matrix singular and is rejected.
    pub fn fit(points: &[(f64, f64, f64)]) -> Result<Plane> {
        if points.len() < 3 {
            return Err(anyhow!(
                "Plane fit needs at least 3 points, got {}",
                points.len()
            ));
        }

        // Normal equations: [Sxx Sxy Sx; Sxy Syy Sy; Sx Sy n] [a b c]^T = [Sxz Syz Sz]^T
        let n = points.len() as f64;
        let (mut sx, mut sy, mut sz) = (0.0, 0.0, 0.0);
        let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
        let (mut sxz, mut syz) = (0.0, 0.0);
        for &(x, y, z) in points {
            sx += x;
            sy += y;
            sz += z;
            sxx += x * x;
            syy += y * y;
            sxy += x * y;
            sxz += x * z;
            syz += y * z;
        }

        let det = sxx * (syy * n - sy * sy) - sxy * (sxy * n - sy * sx) + sx * (sxy * sy - syy * sx);
        if det.abs() < 1e-12 {
            return Err(anyhow!("Plane fit is degenerate (collinear touchdowns?)"));
        }

        // Cramer's rule.
        let det_a =
            sxz * (syy * n - sy * sy) - sxy * (syz * n - sy * sz) + sx * (syz * sy - syy * sz);
        let det_b =
            sxx * (syz * n - sz * sy) - sxz * (sxy * n - sy * sx) + sx * (sxy * sz - syz * sx);
        let det_c =
            sxx * (syy * sz - sy * syz) - sxy * (sxy * sz - sy * sxz) + sxz * (sxy * sy - syy * sx);

        Ok(Plane {
            a: det_a / det,
            b: det_b / det,
            c: det_c / det,
        })
    }

    /// Plane height at `(x, y)`.
    pub fn z(&self, x: f64, y: f64) -> f64 {
        self.a * x + self.b * y + self.c
    }

    /// The same tilt, offset vertically by `dz` (e.g. a scan height above the
    /// surface).
    pub fn offset(&self, dz: f64) -> Plane {
        Plane {
            a: self.a,
            b: self.b,
            c: self.c + dz,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_synthetic_plane() {
        let truth = Plane { a: 0.02, b: -0.015, c: 5.0 };
        let mut points = Vec::new();
        for &x in &[0.0, 50.0, 100.0] {
            for &y in &[0.0, 50.0, 100.0] {
                points.push((x, y, truth.z(x, y)));
            }
        }
        let fit = Plane::fit(&points).unwrap();
        assert!((fit.a - truth.a).abs() < 1e-9);
        assert!((fit.b - truth.b).abs() < 1e-9);
        assert!((fit.c - truth.c).abs() < 1e-9);
    }

    #[test]
    fn evaluation_is_exact_on_the_fit_plane() {
        let plane = Plane { a: 1.0, b: 2.0, c: 3.0 };
        assert_eq!(plane.z(0.0, 0.0), 3.0);
        assert_eq!(plane.z(1.0, 1.0), 6.0);
    }

    #[test]
    fn rejects_collinear_points() {
        let points: Vec<_> = (0..5).map(|i| (i as f64, i as f64, 1.0)).collect();
        assert!(Plane::fit(&points).is_err());
    }

    #[test]
    fn rejects_too_few_points() {
        assert!(Plane::fit(&[(0.0, 0.0, 0.0), (1.0, 0.0, 0.0)]).is_err());
    }

    #[test]
    fn offset_shifts_only_c() {
        let plane = Plane { a: 0.1, b: 0.2, c: 1.0 };
        let raised = plane.offset(-0.25);
        assert_eq!(raised.a, plane.a);
        assert_eq!(raised.b, plane.b);
        assert_eq!(raised.c, 0.75);
    }

    #[test]
    fn fit_tolerates_noise() {
        let truth = Plane { a: 0.02, b: -0.015, c: 5.0 };
        let mut points = Vec::new();
        // Deterministic "noise" so the test cannot flake.
        for (i, &x) in [0.0, 30.0, 60.0, 90.0].iter().enumerate() {
            for (j, &y) in [0.0, 30.0, 60.0, 90.0].iter().enumerate() {
                let eps = 1e-4 * ((i * 7 + j * 3) as f64 % 5.0 - 2.0);
                points.push((x, y, truth.z(x, y) + eps));
            }
        }
        let fit = Plane::fit(&points).unwrap();
        assert!((fit.a - truth.a).abs() < 1e-4);
        assert!((fit.b - truth.b).abs() < 1e-4);
    }
}
