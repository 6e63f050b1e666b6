use super::{PlanarView, SolverError, SolverOptions};
use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use tagpose_core::{CameraParams, Distortion};

/// Linear least-squares Brown-Conrady fit.
///
/// Each homography predicts where a board point would land without lens
/// distortion; the gap to the observed pixel, in normalized coordinates, is
/// linear in `k1, k2, k3, p1, p2`.
pub fn estimate_distortion(
    camera: &CameraParams,
    views: &[PlanarView],
    homographies: &[Matrix3<f64>],
    opts: &SolverOptions,
) -> Result<Distortion, SolverError> {
    let mut columns = vec![Term::K1, Term::K2];
    if !opts.fix_k3 {
        columns.push(Term::K3);
    }
    if !opts.fix_tangential {
        columns.push(Term::P1);
        columns.push(Term::P2);
    }

    let total: usize = views.iter().map(|v| v.board_points.len()).sum();
    if total < columns.len() {
        return Err(SolverError::DegenerateDistortion);
    }
    let mut a = DMatrix::<f64>::zeros(2 * total, columns.len());
    let mut b = DVector::<f64>::zeros(2 * total);

    let mut row = 0;
    for (view, h) in views.iter().zip(homographies) {
        for (bp, ip) in view.board_points.iter().zip(&view.image_points) {
            let ideal = h * Vector3::new(bp.x, bp.y, 1.0);
            if ideal.z.abs() < f64::EPSILON {
                return Err(SolverError::DegenerateDistortion);
            }
            let [x, y] = camera.pixel_to_normalized([ideal.x / ideal.z, ideal.y / ideal.z]);
            let [xd, yd] = camera.pixel_to_normalized([ip.x, ip.y]);
            let r2 = x * x + y * y;
            for (col, term) in columns.iter().enumerate() {
                let (dx, dy) = term.jacobian(x, y, r2);
                a[(row, col)] = dx;
                a[(row + 1, col)] = dy;
            }
            b[row] = xd - x;
            b[row + 1] = yd - y;
            row += 2;
        }
    }

    let svd = a.svd(true, true);
    let largest = svd.singular_values.max();
    if svd.singular_values.min() <= 1e-12 * largest {
        return Err(SolverError::DegenerateDistortion);
    }
    let x = svd
        .solve(&b, 1e-14 * largest)
        .map_err(|_| SolverError::DegenerateDistortion)?;

    let mut dist = Distortion::default();
    for (term, value) in columns.iter().zip(x.iter()) {
        match term {
            Term::K1 => dist.k1 = *value,
            Term::K2 => dist.k2 = *value,
            Term::K3 => dist.k3 = *value,
            Term::P1 => dist.p1 = *value,
            Term::P2 => dist.p2 = *value,
        }
    }
    if dist.to_coefficients().iter().any(|c| !c.is_finite()) {
        return Err(SolverError::NonFinite);
    }
    Ok(dist)
}

#[derive(Clone, Copy)]
enum Term {
    K1,
    K2,
    K3,
    P1,
    P2,
}

impl Term {
    fn jacobian(self, x: f64, y: f64, r2: f64) -> (f64, f64) {
        match self {
            Term::K1 => (x * r2, y * r2),
            Term::K2 => (x * r2 * r2, y * r2 * r2),
            Term::K3 => (x * r2 * r2 * r2, y * r2 * r2 * r2),
            Term::P1 => (2.0 * x * y, r2 + 2.0 * y * y),
            Term::P2 => (r2 + 2.0 * x * x, 2.0 * x * y),
        }
    }
}
