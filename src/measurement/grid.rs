//! Set-point generation and resampling for sweeps and raster scans.
//!
//! Pure functions, shared by the piezo ramp code and the scan procedures:
//! endpoint-inclusive linspace, 1-D linear interpolation (the resampling step
//! that maps acquired line data back onto the commanded grid), and raster
//! grid iteration with an optional edges-only mask.

use anyhow::{bail, Result};

/// Endpoint-inclusive linear spacing. `n == 1` yields `[start]`.
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Linear interpolation of `(x, y)` samples onto the query points `xi`.
///
/// `x` must be monotonic (either direction); queries beyond the data are
/// clamped to the end values. Descending `x` is handled by reversing, which is
/// what the return half of an out-and-back scan line produces. Mismatched
/// sample lengths or fewer than two samples are errors, not panics, since the
/// samples come straight from DAQ reads.
pub fn interp1(x: &[f64], y: &[f64], xi: &[f64]) -> Result<Vec<f64>> {
    if x.len() != y.len() {
        bail!("interp1: got {} x values but {} y values", x.len(), y.len());
    }
    if x.len() < 2 {
        bail!("interp1 needs at least two samples, got {}", x.len());
    }

    if x[0] > x[x.len() - 1] {
        let xr: Vec<f64> = x.iter().rev().copied().collect();
        let yr: Vec<f64> = y.iter().rev().copied().collect();
        return interp1(&xr, &yr, xi);
    }

    let out = xi
        .iter()
        .map(|&q| {
            if q <= x[0] {
                return y[0];
            }
            if q >= x[x.len() - 1] {
                return y[y.len() - 1];
            }
            // partition_point: first index with x[i] > q; q lies in [i-1, i].
            let i = x.partition_point(|&v| v <= q);
            let (x0, x1) = (x[i - 1], x[i]);
            let (y0, y1) = (y[i - 1], y[i]);
            if x1 == x0 {
                y0
            } else {
                y0 + (y1 - y0) * (q - x0) / (x1 - x0)
            }
        })
        .collect();
    Ok(out)
}

/// One grid point of a raster, with its index in the grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridPoint {
    pub ix: usize,
    pub iy: usize,
    pub x: f64,
    pub y: f64,
}

/// Iterate a raster grid in row-major order (fast axis x, slow axis y).
///
/// With `edges_only`, interior points are skipped and only the border of the
/// grid is visited; used when a measurement only needs the perimeter (e.g. a
/// quick plane check without a full touchdown grid).
pub fn grid_points(xs: &[f64], ys: &[f64], edges_only: bool) -> Vec<GridPoint> {
    let (nx, ny) = (xs.len(), ys.len());
    let mut points = Vec::new();
    for (iy, &y) in ys.iter().enumerate() {
        for (ix, &x) in xs.iter().enumerate() {
            if edges_only && ix != 0 && ix != nx - 1 && iy != 0 && iy != ny - 1 {
                continue;
            }
            points.push(GridPoint { ix, iy, x, y });
        }
    }
    points
}

/// Scan-line direction for out-and-back acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineDirection {
    Forward,
    Back,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linspace_endpoints_and_spacing() {
        assert_eq!(linspace(0.0, 1.0, 5), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(linspace(2.0, -2.0, 3), vec![2.0, 0.0, -2.0]);
        assert_eq!(linspace(3.0, 7.0, 1), vec![3.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
    }

    #[test]
    fn interp1_recovers_linear_data() {
        let x = [0.0, 1.0, 2.0, 3.0];
        let y = [0.0, 2.0, 4.0, 6.0];
        let out = interp1(&x, &y, &[0.5, 1.5, 2.25]).unwrap();
        assert_eq!(out, vec![1.0, 3.0, 4.5]);
    }

    #[test]
    fn interp1_clamps_out_of_range_queries() {
        let x = [0.0, 1.0];
        let y = [5.0, 7.0];
        assert_eq!(interp1(&x, &y, &[-1.0, 2.0]).unwrap(), vec![5.0, 7.0]);
    }

    #[test]
    fn interp1_handles_descending_x() {
        let x = [3.0, 2.0, 1.0];
        let y = [6.0, 4.0, 2.0];
        assert_eq!(interp1(&x, &y, &[1.5, 2.5]).unwrap(), vec![3.0, 5.0]);
    }

    #[test]
    fn interp1_rejects_bad_sample_shapes() {
        // A short DAQ read must error, not panic.
        let err = interp1(&[0.0, 1.0, 2.0], &[5.0, 7.0], &[0.5]).unwrap_err();
        assert!(err.to_string().contains("3 x values but 2 y values"));
        assert!(interp1(&[0.0], &[5.0], &[0.5]).is_err());
    }

    #[test]
    fn grid_points_row_major() {
        let pts = grid_points(&[0.0, 1.0], &[10.0, 20.0], false);
        assert_eq!(pts.len(), 4);
        assert_eq!(pts[0], GridPoint { ix: 0, iy: 0, x: 0.0, y: 10.0 });
        assert_eq!(pts[1].ix, 1);
        assert_eq!(pts[2].iy, 1);
    }

    #[test]
    fn edges_only_skips_interior() {
        let xs = linspace(0.0, 4.0, 5);
        let ys = linspace(0.0, 4.0, 5);
        let pts = grid_points(&xs, &ys, true);
        // 5x5 grid: 25 points, 9 interior.
        assert_eq!(pts.len(), 16);
        assert!(pts
            .iter()
            .all(|p| p.ix == 0 || p.ix == 4 || p.iy == 0 || p.iy == 4));
    }
}
